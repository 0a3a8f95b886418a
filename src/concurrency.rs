//! Bounded-concurrency limiter for IMAP sessions.
//!
//! IMAP has no quota-unit accounting the way the Gmail REST API does; the
//! resource that actually needs protecting is the number of simultaneous
//! open sockets/sessions against a single server. This is a semaphore-based
//! limiter sized from `execution.max_concurrent_connections`, replacing a
//! token-bucket quota model that does not apply to this protocol.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

#[derive(Clone)]
pub struct ConnectionLimiter {
    semaphore: Arc<Semaphore>,
}

impl ConnectionLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Wait for a connection slot. The returned guard releases the slot on
    /// drop, so callers simply hold it for the lifetime of one IMAP session.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        trace!(
            available = self.semaphore.available_permits(),
            "acquiring connection slot"
        );
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed")
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn limits_concurrent_acquisitions() {
        let limiter = ConnectionLimiter::new(2);
        assert_eq!(limiter.available_permits(), 2);
        let _a = limiter.acquire().await;
        assert_eq!(limiter.available_permits(), 1);
        let _b = limiter.acquire().await;
        assert_eq!(limiter.available_permits(), 0);
    }

    #[tokio::test]
    async fn releases_slot_on_drop() {
        let limiter = ConnectionLimiter::new(1);
        {
            let _permit = limiter.acquire().await;
            assert_eq!(limiter.available_permits(), 0);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn zero_configured_limit_still_allows_one() {
        let limiter = ConnectionLimiter::new(0);
        assert_eq!(limiter.available_permits(), 1);
    }
}
