use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use crate::context::{Context, ContextError};

/// Default interval before the same endpoint is measured again
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(180);

/// Spaces out repeated measurements of the same endpoint
#[async_trait]
pub trait RevisitGuard: Send + Sync {
    /// Waits until `key` may be visited again, or the context is done
    async fn maybe_delay(&self, ctx: &Context, key: &str) -> Result<(), ContextError>;

    /// Records that `key` was just visited
    fn register(&self, key: &str);
}

/// In-memory `RevisitGuard`. One instance is shared by every caller that
/// must observe the same schedule.
///
/// Keys starting with `udp://` are never delayed.
pub struct RevisitThrottle {
    wait_time: Duration,
    next_visit: Mutex<HashMap<String, Instant>>,
    delays: AtomicU64,
}

impl RevisitThrottle {
    pub fn new(wait_time: Duration) -> Self {
        Self {
            wait_time,
            next_visit: Mutex::new(HashMap::new()),
            delays: AtomicU64::new(0),
        }
    }

    /// Number of visits that had to wait
    pub fn delays(&self) -> u64 {
        self.delays.load(Ordering::Relaxed)
    }

    fn exempt(key: &str) -> bool {
        key.starts_with("udp://")
    }

    fn next_visit(&self, key: &str) -> Option<Instant> {
        let map = match self.next_visit.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(key).copied()
    }
}

impl Default for RevisitThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT_TIME)
    }
}

#[async_trait]
impl RevisitGuard for RevisitThrottle {
    async fn maybe_delay(&self, ctx: &Context, key: &str) -> Result<(), ContextError> {
        if Self::exempt(key) {
            return Ok(());
        }
        let Some(next) = self.next_visit(key) else {
            return Ok(());
        };
        let now = Instant::now();
        if now >= next {
            return Ok(());
        }
        let wait = next - now;
        self.delays.fetch_add(1, Ordering::Relaxed);
        info!("waiting {:?} before testing {} again", wait, key);
        ctx.sleep(wait).await
    }

    fn register(&self, key: &str) {
        if Self::exempt(key) {
            return;
        }
        let mut map = match self.next_visit.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(key.to_string(), Instant::now() + self.wait_time);
    }
}
