//! Persistence adapter: last-state snapshots and the append-only event
//! stream.
//!
//! All operations are best-effort — failures are logged and the session
//! continues in memory. The file layout under the state path is
//! `sessions/<session_id>/last_state.json` plus `events.jsonl`.

use std::io::Write;
use std::path::{Path, PathBuf};

use pg_domain::events::LoggedEvent;
use pg_engine::EngineState;

#[async_trait::async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn save_snapshot(&self, session_id: &str, state: &EngineState);
    async fn load_snapshot(&self, session_id: &str) -> Option<EngineState>;
    async fn append_event(&self, session_id: &str, event: &LoggedEvent);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File-backed store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FilePersistence {
    root: PathBuf,
}

impl FilePersistence {
    pub fn new(state_path: &Path) -> Self {
        Self {
            root: state_path.join("sessions"),
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        // Session IDs are opaque client strings; keep them path-safe.
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(safe)
    }
}

#[async_trait::async_trait]
impl PersistenceAdapter for FilePersistence {
    async fn save_snapshot(&self, session_id: &str, state: &EngineState) {
        let dir = self.session_dir(session_id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(session_id, error = %e, "snapshot dir create failed");
            return;
        }
        let json = match serde_json::to_string_pretty(state) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "snapshot serialize failed");
                return;
            }
        };
        if let Err(e) = std::fs::write(dir.join("last_state.json"), json) {
            tracing::warn!(session_id, error = %e, "snapshot write failed");
        }
    }

    async fn load_snapshot(&self, session_id: &str) -> Option<EngineState> {
        let path = self.session_dir(session_id).join("last_state.json");
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "snapshot parse failed, ignoring");
                None
            }
        }
    }

    async fn append_event(&self, session_id: &str, event: &LoggedEvent) {
        let dir = self.session_dir(session_id);
        if std::fs::create_dir_all(&dir).is_err() {
            return;
        }
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(_) => return,
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("events.jsonl"))
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            tracing::debug!(session_id, error = %e, "event append failed");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// No-op store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory-only sessions (persistence disabled, tests).
pub struct NullPersistence;

#[async_trait::async_trait]
impl PersistenceAdapter for NullPersistence {
    async fn save_snapshot(&self, _session_id: &str, _state: &EngineState) {}

    async fn load_snapshot(&self, _session_id: &str) -> Option<EngineState> {
        None
    }

    async fn append_event(&self, _session_id: &str, _event: &LoggedEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_domain::events::SessionEvent;
    use pg_engine::scenarios;

    #[tokio::test]
    async fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        let state = scenarios::initial_state("teen_svt_complex_v1", chrono::Utc::now()).unwrap();

        assert!(store.load_snapshot("s1").await.is_none());
        store.save_snapshot("s1", &state).await;
        let loaded = store.load_snapshot("s1").await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn events_append_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        for i in 0..3 {
            let logged = LoggedEvent::now(SessionEvent::FloorGranted {
                session_id: "s1".into(),
                user_id: format!("u{i}"),
                previous: None,
            });
            store.append_event("s1", &logged).await;
        }
        let raw = std::fs::read_to_string(
            dir.path().join("sessions").join("s1").join("events.jsonl"),
        )
        .unwrap();
        assert_eq!(raw.lines().count(), 3);
    }

    #[tokio::test]
    async fn hostile_session_ids_stay_inside_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        let state = scenarios::initial_state("child_asthma_basic_v1", chrono::Utc::now()).unwrap();
        store.save_snapshot("../../escape", &state).await;
        assert!(dir.path().join("sessions").join("______escape").exists());
    }
}
