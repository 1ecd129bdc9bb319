//! Session manager: connected endpoints per session by role, broadcast
//! fan-out, the speaking floor, and the fallback flag.
//!
//! The only cross-session shared state in the gateway. Broadcasts
//! iterate a snapshot of the connection sinks so a disconnect during
//! fan-out cannot invalidate the iteration; a failing send is dropped
//! without affecting siblings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use pg_protocol::{Role, ServerMessage};

pub type ConnId = u64;

/// One connected WebSocket, addressed by its outbound frame sink.
#[derive(Clone)]
pub struct ClientHandle {
    pub conn_id: ConnId,
    pub user_id: String,
    pub sink: mpsc::Sender<String>,
}

struct SessionEntry {
    scenario_id: String,
    presenters: Vec<ClientHandle>,
    participants: Vec<ClientHandle>,
    floor_holder: Option<String>,
    fallback: bool,
}

/// Result of a floor request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloorGrant {
    pub granted: bool,
    /// The dispossessed previous holder, when the grant displaced nobody
    /// but a different user asked while the floor was held.
    pub previous: Option<String>,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    next_conn_id: AtomicU64,
    default_scenario: String,
}

impl SessionManager {
    pub fn new(default_scenario: impl Into<String>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            default_scenario: default_scenario.into(),
        }
    }

    pub fn mint_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a connection. The first client on a session establishes the
    /// session record. Returns true when the session is new.
    pub fn add_client(&self, session_id: &str, role: Role, handle: ClientHandle) -> bool {
        let mut sessions = self.sessions.lock();
        let created = !sessions.contains_key(session_id);
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                scenario_id: self.default_scenario.clone(),
                presenters: Vec::new(),
                participants: Vec::new(),
                floor_holder: None,
                fallback: false,
            });
        match role {
            Role::Presenter => entry.presenters.push(handle),
            Role::Participant => entry.participants.push(handle),
        }
        created
    }

    /// Remove a connection. Returns true when this removal emptied the
    /// session (the record is dropped — the caller performs the one-shot
    /// teardown).
    pub fn remove_client(&self, session_id: &str, role: Role, conn_id: ConnId) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(session_id) else {
            return false;
        };
        match role {
            Role::Presenter => entry.presenters.retain(|c| c.conn_id != conn_id),
            Role::Participant => entry.participants.retain(|c| c.conn_id != conn_id),
        }
        if entry.presenters.is_empty() && entry.participants.is_empty() {
            sessions.remove(session_id);
            true
        } else {
            false
        }
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn client_count(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .get(session_id)
            .map(|e| e.presenters.len() + e.participants.len())
            .unwrap_or(0)
    }

    // ── Scenario ─────────────────────────────────────────────────────

    pub fn scenario_id(&self, session_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|e| e.scenario_id.clone())
    }

    pub fn set_scenario(&self, session_id: &str, scenario_id: &str) {
        if let Some(entry) = self.sessions.lock().get_mut(session_id) {
            entry.scenario_id = scenario_id.to_string();
        }
    }

    // ── Floor ────────────────────────────────────────────────────────

    /// First-writer-wins under the manager's lock. A repeat request from
    /// the current holder is a grant.
    pub fn request_floor(&self, session_id: &str, user_id: &str) -> FloorGrant {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(session_id) else {
            return FloorGrant {
                granted: false,
                previous: None,
            };
        };
        match &entry.floor_holder {
            None => {
                entry.floor_holder = Some(user_id.to_string());
                FloorGrant {
                    granted: true,
                    previous: None,
                }
            }
            Some(holder) if holder == user_id => FloorGrant {
                granted: true,
                previous: None,
            },
            Some(holder) => FloorGrant {
                granted: false,
                previous: Some(holder.clone()),
            },
        }
    }

    /// Release only honored from the holder; idempotent.
    pub fn release_floor(&self, session_id: &str, user_id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(session_id) else {
            return false;
        };
        if entry.floor_holder.as_deref() == Some(user_id) {
            entry.floor_holder = None;
            true
        } else {
            false
        }
    }

    pub fn floor_holder(&self, session_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|e| e.floor_holder.clone())
    }

    pub fn holds_floor(&self, session_id: &str, user_id: &str) -> bool {
        self.floor_holder(session_id).as_deref() == Some(user_id)
    }

    // ── Fallback ─────────────────────────────────────────────────────

    pub fn set_fallback(&self, session_id: &str, fallback: bool) {
        if let Some(entry) = self.sessions.lock().get_mut(session_id) {
            entry.fallback = fallback;
        }
    }

    pub fn is_fallback(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .get(session_id)
            .map(|e| e.fallback)
            .unwrap_or(false)
    }

    // ── Broadcast ────────────────────────────────────────────────────

    pub fn broadcast_to_session(&self, session_id: &str, msg: &ServerMessage) {
        self.broadcast(session_id, msg, true, true);
    }

    pub fn broadcast_to_presenters(&self, session_id: &str, msg: &ServerMessage) {
        self.broadcast(session_id, msg, true, false);
    }

    pub fn broadcast_to_participants(&self, session_id: &str, msg: &ServerMessage) {
        self.broadcast(session_id, msg, false, true);
    }

    /// Send to one user's connections (either role).
    pub fn send_to_user(&self, session_id: &str, user_id: &str, msg: &ServerMessage) {
        let sinks: Vec<mpsc::Sender<String>> = {
            let sessions = self.sessions.lock();
            let Some(entry) = sessions.get(session_id) else {
                return;
            };
            entry
                .presenters
                .iter()
                .chain(entry.participants.iter())
                .filter(|c| c.user_id == user_id)
                .map(|c| c.sink.clone())
                .collect()
        };
        let json = msg.to_json();
        for sink in sinks {
            let _ = sink.try_send(json.clone());
        }
    }

    fn broadcast(&self, session_id: &str, msg: &ServerMessage, presenters: bool, participants: bool) {
        // Serialize once, snapshot the sinks, send outside the lock.
        let sinks: Vec<mpsc::Sender<String>> = {
            let sessions = self.sessions.lock();
            let Some(entry) = sessions.get(session_id) else {
                return;
            };
            let mut sinks = Vec::new();
            if presenters {
                sinks.extend(entry.presenters.iter().map(|c| c.sink.clone()));
            }
            if participants {
                sinks.extend(entry.participants.iter().map(|c| c.sink.clone()));
            }
            sinks
        };
        let json = msg.to_json();
        for sink in sinks {
            // Slow or dead consumers are dropped, not awaited.
            let _ = sink.try_send(json.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(manager: &SessionManager, user: &str) -> (ClientHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (
            ClientHandle {
                conn_id: manager.mint_conn_id(),
                user_id: user.to_string(),
                sink: tx,
            },
            rx,
        )
    }

    #[test]
    fn add_then_remove_empties_the_session_once() {
        let mgr = SessionManager::new("child_asthma_basic_v1");
        let (h, _rx) = handle(&mgr, "u1");
        let conn = h.conn_id;
        assert!(mgr.add_client("s1", Role::Participant, h));
        assert!(mgr.session_exists("s1"));

        assert!(mgr.remove_client("s1", Role::Participant, conn));
        assert!(!mgr.session_exists("s1"));
        // Second removal of the same conn reports nothing.
        assert!(!mgr.remove_client("s1", Role::Participant, conn));
    }

    #[test]
    fn floor_is_single_holder_first_writer_wins() {
        let mgr = SessionManager::new("child_asthma_basic_v1");
        let (h1, _r1) = handle(&mgr, "alice");
        let (h2, _r2) = handle(&mgr, "bob");
        mgr.add_client("s1", Role::Participant, h1);
        mgr.add_client("s1", Role::Participant, h2);

        let grant = mgr.request_floor("s1", "alice");
        assert!(grant.granted);
        let denied = mgr.request_floor("s1", "bob");
        assert!(!denied.granted);
        assert_eq!(denied.previous.as_deref(), Some("alice"));

        // Repeat request from the holder is still a grant.
        assert!(mgr.request_floor("s1", "alice").granted);
        assert_eq!(mgr.floor_holder("s1").as_deref(), Some("alice"));
    }

    #[test]
    fn release_is_holder_only_and_idempotent() {
        let mgr = SessionManager::new("child_asthma_basic_v1");
        let (h1, _r1) = handle(&mgr, "alice");
        mgr.add_client("s1", Role::Participant, h1);
        mgr.request_floor("s1", "alice");

        assert!(!mgr.release_floor("s1", "bob"));
        assert_eq!(mgr.floor_holder("s1").as_deref(), Some("alice"));

        assert!(mgr.release_floor("s1", "alice"));
        assert!(!mgr.release_floor("s1", "alice"));
        assert!(mgr.floor_holder("s1").is_none());
    }

    #[tokio::test]
    async fn broadcast_reaches_roles_and_tolerates_dead_sinks() {
        let mgr = SessionManager::new("child_asthma_basic_v1");
        let (p, mut p_rx) = handle(&mgr, "presenter");
        let (a, mut a_rx) = handle(&mgr, "alice");
        let (dead, dead_rx) = handle(&mgr, "ghost");
        drop(dead_rx);
        mgr.add_client("s1", Role::Presenter, p);
        mgr.add_client("s1", Role::Participant, a);
        mgr.add_client("s1", Role::Participant, dead);

        mgr.broadcast_to_session("s1", &ServerMessage::Pong);
        assert_eq!(p_rx.recv().await.unwrap(), r#"{"type":"pong"}"#);
        assert_eq!(a_rx.recv().await.unwrap(), r#"{"type":"pong"}"#);

        mgr.broadcast_to_presenters(
            "s1",
            &ServerMessage::Error {
                message: "presenter only".into(),
            },
        );
        assert!(p_rx.recv().await.unwrap().contains("presenter only"));
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn fallback_flag_is_session_scoped() {
        let mgr = SessionManager::new("child_asthma_basic_v1");
        let (h1, _r1) = handle(&mgr, "u1");
        mgr.add_client("s1", Role::Participant, h1);
        assert!(!mgr.is_fallback("s1"));
        mgr.set_fallback("s1", true);
        assert!(mgr.is_fallback("s1"));
        assert!(!mgr.is_fallback("s2"));
    }
}
