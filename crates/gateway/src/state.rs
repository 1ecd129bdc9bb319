use std::sync::Arc;

use pg_domain::config::Config;
use pg_voice::VoiceAdapters;

use crate::auth::TokenVerifier;
use crate::persist::PersistenceAdapter;
use crate::runtime::RuntimeManager;
use crate::sessions::SessionManager;

/// Shared application state passed to the WebSocket handler.
///
/// - **config** — the typed configuration record
/// - **sessions** — connections, floor, fallback (the only cross-session
///   shared state)
/// - **runtimes** — per-session locked runtime records
/// - **adapters** — the four speech-provider interfaces
/// - **persistence** — snapshot + event stream store
/// - **verifier** — identity-provider token verification (`None` in
///   insecure mode)
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub runtimes: Arc<RuntimeManager>,
    pub adapters: VoiceAdapters,
    pub persistence: Arc<dyn PersistenceAdapter>,
    pub verifier: Option<Arc<dyn TokenVerifier>>,
}
