//! Bounded retry for adapter calls.
//!
//! Providers fail transiently; every adapter call is wrapped in
//! `with_retry` and surfaces exhaustion as `None` rather than an error.
//! The orchestrator turns `None` into a `voice_error` notice plus the
//! session's degraded flag — failures are data, not control flow.

use std::future::Future;
use std::time::Duration;

use pg_domain::error::Result;

/// Run `op` up to `attempts` times with `delay` between tries.
///
/// Returns the first success; `None` after the last failure. Errors are
/// logged with the operation label, never propagated.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    attempts: u32,
    delay: Duration,
    mut op: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Some(value),
            Err(e) => {
                tracing::warn!(
                    op = label,
                    attempt,
                    attempts,
                    error = %e,
                    "adapter call failed"
                );
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_domain::error::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn first_success_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = with_retry("test", 2, Duration::from_millis(1), move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(42)
            }
        })
        .await;
        assert_eq!(result, Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = with_retry("test", 2, Duration::from_millis(1), move || {
            let calls = calls2.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Http("flaky".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhaustion_returns_none() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Option<u32> = with_retry("test", 2, Duration::from_millis(1), move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Timeout("slow provider".into()))
            }
        })
        .await;
        assert_eq!(result, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
