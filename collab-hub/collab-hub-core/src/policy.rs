//! Failure policy for cache-backed state.
//!
//! Presence and chat live in an advisory cache. Their failures are logged
//! and absorbed here instead of being propagated, and every call is bounded
//! by a deadline, so editing and disconnect cleanup never wait on the cache
//! being healthy.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Deadline for a single cache operation.
pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BestEffort {
    Presence,
    Chat,
}

impl BestEffort {
    /// Logs a failed cache operation and turns it into `None`.
    pub fn absorb<T>(self, operation: &str, document_id: Uuid, result: anyhow::Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(policy = %self, document = %document_id, "{operation} failed: {e:#}");
                None
            }
        }
    }

    /// Awaits `fut` for at most `timeout`. A stalled call counts as failed.
    pub async fn run<T, F>(self, operation: &str, document_id: Uuid, timeout: Duration, fut: F) -> Option<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => self.absorb(operation, document_id, result),
            Err(_) => {
                warn!(policy = %self, document = %document_id, "{operation} timed out after {timeout:?}");
                None
            }
        }
    }
}

impl fmt::Display for BestEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BestEffort::Presence => f.write_str("presence"),
            BestEffort::Chat => f.write_str("chat"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stalled_calls_give_up_at_the_deadline() {
        let doc = Uuid::new_v4();
        let started = std::time::Instant::now();
        let res: Option<()> = BestEffort::Presence
            .run("join", doc, Duration::from_millis(20), std::future::pending())
            .await;
        assert!(res.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));

        let ok = BestEffort::Chat
            .run("post", doc, Duration::from_millis(20), async { Ok(7) })
            .await;
        assert_eq!(ok, Some(7));
        let failed: Option<()> = BestEffort::Chat
            .run("post", doc, Duration::from_millis(20), async { Err(anyhow::anyhow!("down")) })
            .await;
        assert!(failed.is_none());
    }
}
