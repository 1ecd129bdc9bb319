use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub chaos: ChaosConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_4620")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Production flag. When set, insecure auth mode and chaos hooks are
    /// refused at startup.
    #[serde(default)]
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4620,
            host: "127.0.0.1".into(),
            production: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway timing knobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "d_1000")]
    pub heartbeat_ms: u64,
    /// Voice-command cooldown in milliseconds. The auto-reply guard applies
    /// a 1 s floor regardless of this value.
    #[serde(default = "d_1000")]
    pub command_cooldown_ms: u64,
    /// Window inside which a repeated order of the same type is treated as
    /// a voice double-utterance and dropped.
    #[serde(default = "d_2000")]
    pub order_debounce_ms: u64,
    /// Per-session event ring capacity.
    #[serde(default = "d_512")]
    pub event_ring_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 1000,
            command_cooldown_ms: 1000,
            order_debounce_ms: 2000,
            event_ring_capacity: 512,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Budget
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Soft per-session USD limit. Crossing it fires a one-shot event but
    /// does not degrade the session.
    #[serde(default = "d_soft_usd")]
    pub soft_usd: f64,
    /// Hard per-session USD limit. Crossing it closes the realtime adapter
    /// and pins the session in text fallback.
    #[serde(default = "d_hard_usd")]
    pub hard_usd: f64,
    #[serde(default)]
    pub pricing: PricingConfig,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            soft_usd: d_soft_usd(),
            hard_usd: d_hard_usd(),
            pricing: PricingConfig::default(),
        }
    }
}

/// Provider pricing used for the running USD estimate. Opaque to the
/// engine — only the cost controller reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// USD per 1000 input tokens.
    #[serde(default = "d_in_per_1k")]
    pub input_per_1k: f64,
    /// USD per 1000 output tokens.
    #[serde(default = "d_out_per_1k")]
    pub output_per_1k: f64,
    /// USD per second of synthesized or streamed audio.
    #[serde(default = "d_audio_per_sec")]
    pub audio_per_sec: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_1k: d_in_per_1k(),
            output_per_1k: d_out_per_1k(),
            audio_per_sec: d_audio_per_sec(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// Identity-provider verification endpoint. Required in secure mode.
    /// The verifier POSTs the ID token and expects `{"uid": "..."}` back.
    #[serde(default)]
    pub verify_url: Option<String>,
    /// Verification request timeout.
    #[serde(default = "d_5000")]
    pub verify_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Verify join tokens against the identity provider. The token subject
    /// must equal the claimed user ID.
    Secure,
    /// Accept joins without a token. Refused when `server.production` is set.
    #[default]
    Insecure,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Voice adapters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Provider model identifier for speech-to-text.
    #[serde(default = "d_stt_model")]
    pub stt_model: String,
    /// Provider model identifier for text-to-speech.
    #[serde(default = "d_tts_model")]
    pub tts_model: String,
    /// Provider model identifier for the streaming chat LLM.
    #[serde(default = "d_chat_model")]
    pub chat_model: String,
    /// Provider model identifier for the full-duplex realtime voice API.
    /// Empty disables the realtime path (sessions run STT/TTS only).
    #[serde(default = "d_realtime_model")]
    pub realtime_model: String,
    /// Per-character provider voice IDs. Keys are the closed character set
    /// (`patient`, `nurse`, `tech`, `consultant`, `imaging`, `parent`);
    /// unknown keys are reported by `validate()`.
    #[serde(default = "d_voice_map")]
    pub voice_map: HashMap<String, String>,
    /// Bounded retry attempts per adapter call.
    #[serde(default = "d_2")]
    pub retry_attempts: u32,
    /// Baseline delay between retry attempts.
    #[serde(default = "d_150")]
    pub retry_delay_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            stt_model: d_stt_model(),
            tts_model: d_tts_model(),
            chat_model: d_chat_model(),
            realtime_model: d_realtime_model(),
            voice_map: d_voice_map(),
            retry_attempts: 2,
            retry_delay_ms: 150,
        }
    }
}

pub const CHARACTER_IDS: &[&str] = &[
    "patient",
    "nurse",
    "tech",
    "consultant",
    "imaging",
    "parent",
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persistence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
    /// When false, snapshots and events stay in memory only.
    #[serde(default = "d_true")]
    pub enabled: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("./data/state"),
            enabled: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chaos hooks (non-production)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChaosConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Probability in [0,1] that an inbound frame is dropped.
    #[serde(default)]
    pub drop_probability: f64,
    /// Artificial latency added on receive.
    #[serde(default)]
    pub latency_ms: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration. Errors abort startup; warnings are logged.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.budget.hard_usd < self.budget.soft_usd {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "budget.hard_usd".into(),
                message: format!(
                    "hard limit ({}) is below soft limit ({})",
                    self.budget.hard_usd, self.budget.soft_usd
                ),
            });
        }

        if self.server.production && self.auth.mode == AuthMode::Insecure {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "auth.mode".into(),
                message: "insecure auth mode is not permitted in production".into(),
            });
        }

        if self.auth.mode == AuthMode::Secure && self.auth.verify_url.is_none() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "auth.verify_url".into(),
                message: "secure auth mode requires a verification endpoint".into(),
            });
        }

        if self.server.production && self.chaos.enabled {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "chaos.enabled".into(),
                message: "chaos hooks are not permitted in production".into(),
            });
        }

        if !(0.0..=1.0).contains(&self.chaos.drop_probability) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "chaos.drop_probability".into(),
                message: format!("must be in [0,1], got {}", self.chaos.drop_probability),
            });
        }

        if self.gateway.heartbeat_ms < 100 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "gateway.heartbeat_ms".into(),
                message: format!(
                    "heartbeat of {} ms will tick the engine very aggressively",
                    self.gateway.heartbeat_ms
                ),
            });
        }

        if self.gateway.command_cooldown_ms < 1000 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "gateway.command_cooldown_ms".into(),
                message: "below the 1 s guard floor; the guard will use 1 s".into(),
            });
        }

        for key in self.voice.voice_map.keys() {
            if !CHARACTER_IDS.contains(&key.as_str()) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    field: "voice.voice_map".into(),
                    message: format!("unknown character '{key}'"),
                });
            }
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serde default helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_4620() -> u16 {
    4620
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_1000() -> u64 {
    1000
}
fn d_2000() -> u64 {
    2000
}
fn d_5000() -> u64 {
    5000
}
fn d_512() -> usize {
    512
}
fn d_2() -> u32 {
    2
}
fn d_150() -> u64 {
    150
}
fn d_true() -> bool {
    true
}
fn d_soft_usd() -> f64 {
    2.0
}
fn d_hard_usd() -> f64 {
    5.0
}
fn d_in_per_1k() -> f64 {
    0.005
}
fn d_out_per_1k() -> f64 {
    0.02
}
fn d_audio_per_sec() -> f64 {
    0.0006
}
fn d_stt_model() -> String {
    "whisper-1".into()
}
fn d_tts_model() -> String {
    "tts-1".into()
}
fn d_chat_model() -> String {
    "gpt-4o-mini".into()
}
fn d_realtime_model() -> String {
    "gpt-4o-realtime-preview".into()
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}
fn d_voice_map() -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("patient".into(), "alloy".into());
    map.insert("nurse".into(), "nova".into());
    map.insert("tech".into(), "echo".into());
    map.insert("consultant".into(), "onyx".into());
    map.insert("imaging".into(), "fable".into());
    map.insert("parent".into(), "shimmer".into());
    map
}
