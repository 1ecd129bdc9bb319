use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pg_domain::config::{AuthMode, Config, ConfigSeverity};
use pg_voice::stub::{CannedTts, FixedStt, ScriptedChat, ScriptedRealtime};
use pg_voice::{RealtimeAdapter, VoiceAdapters};

use pg_gateway::auth::HttpTokenVerifier;
use pg_gateway::cli::{Cli, Command, ConfigCommand, config_cmd, load_config};
use pg_gateway::persist::{FilePersistence, NullPersistence, PersistenceAdapter};
use pg_gateway::runtime::RuntimeManager;
use pg_gateway::sessions::SessionManager;
use pg_gateway::state::AppState;
use pg_gateway::ws;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = load_config(&cli.config)?;
            if !config_cmd::validate(&config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = load_config(&cli.config)?;
            config_cmd::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("pulsegate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the serve command.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pg_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("PulseGate starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Persistence ──────────────────────────────────────────────────
    let persistence: Arc<dyn PersistenceAdapter> = if config.persistence.enabled {
        tracing::info!(path = %config.persistence.state_path.display(), "file persistence ready");
        Arc::new(FilePersistence::new(&config.persistence.state_path))
    } else {
        tracing::info!("persistence disabled, sessions are memory-only");
        Arc::new(NullPersistence)
    };

    // ── Identity verifier ────────────────────────────────────────────
    let verifier = match (&config.auth.mode, &config.auth.verify_url) {
        (AuthMode::Secure, Some(url)) => {
            let verifier = HttpTokenVerifier::new(url.clone(), config.auth.verify_timeout_ms)
                .context("building token verifier")?;
            tracing::info!(url = %url, "secure auth mode, verifier ready");
            Some(Arc::new(verifier) as Arc<dyn pg_gateway::auth::TokenVerifier>)
        }
        _ => {
            tracing::warn!("insecure auth mode — joins are not verified");
            None
        }
    };

    // ── Voice adapters ───────────────────────────────────────────────
    // Concrete STT/TTS/chat/realtime providers are deployment wiring;
    // the stock binary ships the scripted set so a bare checkout runs
    // end to end.
    let adapters = VoiceAdapters {
        stt: Arc::new(FixedStt { transcript: None }),
        tts: Arc::new(CannedTts),
        chat: Arc::new(ScriptedChat {
            reply: "I still feel my heart racing.".into(),
        }),
        realtime_factory: if config.voice.realtime_model.is_empty() {
            None
        } else {
            let factory: Arc<dyn Fn() -> Arc<dyn RealtimeAdapter> + Send + Sync> =
                Arc::new(|| -> Arc<dyn RealtimeAdapter> { ScriptedRealtime::new() });
            Some(factory)
        },
    };
    tracing::info!(
        stt = %config.voice.stt_model,
        tts = %config.voice.tts_model,
        chat = %config.voice.chat_model,
        realtime = %config.voice.realtime_model,
        "voice adapters ready"
    );

    // ── Shared state ─────────────────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        sessions: Arc::new(SessionManager::new("child_asthma_basic_v1")),
        runtimes: Arc::new(RuntimeManager::new()),
        adapters,
        persistence,
        verifier,
    };

    // ── Serve ────────────────────────────────────────────────────────
    let app = axum::Router::new()
        .route("/ws/voice", get(ws::voice_ws))
        .route("/healthz", get(|| async { "ok" }))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server error")?;
    Ok(())
}
