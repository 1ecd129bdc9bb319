//! Per-session runtime: the one record holding everything a live session
//! owns, plus the manager that creates and tears it down.
//!
//! Consolidating the engine, gate policy, cost controller, event ring,
//! guard state, alarm bookkeeping, and the realtime handle into a single
//! locked record means the session-empty callback is the only teardown
//! point and there are no stray per-session maps to leak.

pub mod state_lock;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use pg_domain::config::Config;
use pg_engine::{OrderType, ScenarioEngine};
use pg_voice::RealtimeAdapter;

use crate::cost::CostController;
use crate::event_log::EventLog;
use crate::guard::AutoReplyGuard;
use crate::telemetry::AlarmState;
use state_lock::StateLock;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionRuntime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionRuntime {
    pub engine: ScenarioEngine,
    pub cost: CostController,
    pub events: EventLog,
    pub realtime: Option<Arc<dyn RealtimeAdapter>>,
    /// Voice degraded after adapter failure; distinct from the session
    /// fallback toggled by pause/freeze.
    pub voice_fallback: bool,
    /// Lazily minted, reused across voice-error notices.
    pub correlation_id: String,
    pub guard: AutoReplyGuard,
    pub alarms: AlarmState,
    /// Debounce of duplicate same-type orders (voice double-utterances).
    pub last_order_at: HashMap<OrderType, DateTime<Utc>>,
    /// Per-user clinical-command cooldown.
    pub last_command_at: HashMap<String, DateTime<Utc>>,
    pub muted_users: std::collections::HashSet<String>,
    /// Monotone counter; bumping it discards in-flight reply streams.
    /// Shared with spawned reply tasks so they can check cheaply.
    pub reply_epoch: Arc<std::sync::atomic::AtomicU64>,
    pub hydrated: bool,
}

impl SessionRuntime {
    pub fn new(engine: ScenarioEngine, config: &Config) -> Self {
        Self {
            engine,
            cost: CostController::new(config.budget.clone()),
            events: EventLog::new(config.gateway.event_ring_capacity),
            realtime: None,
            voice_fallback: false,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            guard: AutoReplyGuard::new(Duration::from_millis(config.gateway.command_cooldown_ms)),
            alarms: AlarmState::default(),
            last_order_at: HashMap::new(),
            last_command_at: HashMap::new(),
            muted_users: std::collections::HashSet::new(),
            reply_epoch: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            hydrated: false,
        }
    }

    /// True when this order type was requested inside the debounce
    /// window; records the request either way.
    pub fn order_debounced(
        &mut self,
        order_type: OrderType,
        window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let debounced = self
            .last_order_at
            .get(&order_type)
            .map(|at| (now - *at).num_milliseconds() < window.as_millis() as i64)
            .unwrap_or(false);
        if !debounced {
            self.last_order_at.insert(order_type, now);
        }
        debounced
    }

    /// Per-user cooldown for clinical voice commands.
    pub fn command_on_cooldown(
        &mut self,
        user_id: &str,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let blocked = self
            .last_command_at
            .get(user_id)
            .map(|at| (now - *at).num_milliseconds() < cooldown.as_millis() as i64)
            .unwrap_or(false);
        if !blocked {
            self.last_command_at.insert(user_id.to_string(), now);
        }
        blocked
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RuntimeManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live session's lock plus its background tasks.
pub struct SessionSlot {
    pub lock: StateLock<SessionRuntime>,
    pub heartbeat: Mutex<Option<JoinHandle<()>>>,
    pub realtime_pump: Mutex<Option<JoinHandle<()>>>,
}

pub struct RuntimeManager {
    slots: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl Default for RuntimeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeManager {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.slots.lock().get(session_id).cloned()
    }

    /// Get or create the slot. Returns `(slot, created)`; the caller
    /// hydrates and spawns background tasks when `created`.
    pub fn ensure(
        &self,
        session_id: &str,
        scenario_id: &str,
        config: &Config,
        now: DateTime<Utc>,
    ) -> Option<(Arc<SessionSlot>, bool)> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(session_id) {
            return Some((slot.clone(), false));
        }
        let engine = ScenarioEngine::new(scenario_id, now)?;
        let runtime = SessionRuntime::new(engine, config);
        let slot = Arc::new(SessionSlot {
            lock: StateLock::new(session_id, runtime),
            heartbeat: Mutex::new(None),
            realtime_pump: Mutex::new(None),
        });
        slots.insert(session_id.to_string(), slot.clone());
        Some((slot, true))
    }

    /// Remove the slot from the map. The caller owns the rest of the
    /// teardown (abort tasks, close realtime) with the slot it gets
    /// back.
    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.slots.lock().remove(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_is_idempotent() {
        let mgr = RuntimeManager::new();
        let config = Config::default();
        let now = Utc::now();
        let (_, created) = mgr.ensure("s1", "teen_svt_complex_v1", &config, now).unwrap();
        assert!(created);
        let (_, created) = mgr.ensure("s1", "teen_svt_complex_v1", &config, now).unwrap();
        assert!(!created);
        assert_eq!(mgr.session_count(), 1);
    }

    #[test]
    fn unknown_scenario_yields_none() {
        let mgr = RuntimeManager::new();
        assert!(mgr
            .ensure("s1", "not_a_scenario", &Config::default(), Utc::now())
            .is_none());
    }

    #[test]
    fn remove_clears_the_slot() {
        let mgr = RuntimeManager::new();
        mgr.ensure("s1", "child_asthma_basic_v1", &Config::default(), Utc::now());
        assert!(mgr.remove("s1").is_some());
        assert!(mgr.remove("s1").is_none());
        assert_eq!(mgr.session_count(), 0);
    }

    #[tokio::test]
    async fn order_debounce_window() {
        let config = Config::default();
        let engine = ScenarioEngine::new("teen_svt_complex_v1", Utc::now()).unwrap();
        let mut runtime = SessionRuntime::new(engine, &config);
        let now = Utc::now();
        let window = Duration::from_secs(2);

        assert!(!runtime.order_debounced(OrderType::Ekg, window, now));
        assert!(runtime.order_debounced(
            OrderType::Ekg,
            window,
            now + chrono::Duration::milliseconds(500)
        ));
        // A different type is independent.
        assert!(!runtime.order_debounced(
            OrderType::Labs,
            window,
            now + chrono::Duration::milliseconds(500)
        ));
        // Outside the window the same type queues again.
        assert!(!runtime.order_debounced(
            OrderType::Ekg,
            window,
            now + chrono::Duration::milliseconds(2500)
        ));
    }
}
