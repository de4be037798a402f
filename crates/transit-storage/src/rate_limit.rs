//! Per-source-class request spacing.
//!
//! Each class keeps one atomic "next free slot" offset. Callers reserve a slot
//! with compare-and-swap and then sleep until it arrives, so concurrent callers
//! never share a slot and never hold a lock while waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use transit_core::SourceClass;

pub const DEFAULT_GEOCODER_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_DETAIL_REGISTRY_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_NAME_REGISTRY_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("rate limiter wait cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub name_registry: Duration,
    pub detail_registry: Duration,
    pub geocoder: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            name_registry: DEFAULT_NAME_REGISTRY_INTERVAL,
            detail_registry: DEFAULT_DETAIL_REGISTRY_INTERVAL,
            geocoder: DEFAULT_GEOCODER_INTERVAL,
        }
    }
}

impl RateLimitConfig {
    /// Same interval for every class. Handy in tests.
    pub fn uniform(interval: Duration) -> Self {
        Self {
            name_registry: interval,
            detail_registry: interval,
            geocoder: interval,
        }
    }

    pub fn interval_for(&self, class: SourceClass) -> Duration {
        match class {
            SourceClass::NameRegistry => self.name_registry,
            SourceClass::DetailRegistry => self.detail_registry,
            SourceClass::Geocoder => self.geocoder,
        }
    }
}

#[derive(Debug, Default)]
struct ClassSlot {
    /// Nanoseconds since the limiter epoch at which the next call may start.
    next_free: AtomicU64,
    last_seen: AtomicU64,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    epoch: Instant,
    slots: Mutex<HashMap<SourceClass, Arc<ClassSlot>>>,
    total_wait_nanos: AtomicU64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            slots: Mutex::new(HashMap::new()),
            total_wait_nanos: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn now_nanos(&self) -> u64 {
        duration_nanos(self.epoch.elapsed())
    }

    async fn slot(&self, class: SourceClass) -> Arc<ClassSlot> {
        let mut map = self.slots.lock().await;
        map.entry(class).or_default().clone()
    }

    /// Waits until `class` may issue its next request and reserves that slot.
    ///
    /// Returns how long the caller was held back.
    pub async fn acquire(
        &self,
        class: SourceClass,
        cancel: &CancellationToken,
    ) -> Result<Duration, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let interval = duration_nanos(self.config.interval_for(class));
        let slot = self.slot(class).await;

        let (start, now) = loop {
            let now = self.now_nanos();
            let next_free = slot.next_free.load(Ordering::Acquire);
            let start = next_free.max(now);
            if slot
                .next_free
                .compare_exchange(
                    next_free,
                    start.saturating_add(interval),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break (start, now);
            }
        };
        slot.last_seen.store(start, Ordering::Release);

        let wait = Duration::from_nanos(start - now);
        if wait.is_zero() {
            return Ok(wait);
        }

        debug!(source = %class, "Rate limiting: waiting {:?}", wait);
        self.total_wait_nanos
            .fetch_add(duration_nanos(wait), Ordering::Relaxed);

        tokio::select! {
            _ = cancel.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(wait) => Ok(wait),
        }
    }

    /// Forgets classes whose last reservation is older than `max_idle`.
    /// A slot some caller still holds is kept, so it is never replaced mid-use.
    pub async fn sweep_stale(&self, max_idle: Duration) -> usize {
        let now = self.now_nanos();
        let max_idle = duration_nanos(max_idle);
        let mut map = self.slots.lock().await;
        let before = map.len();
        map.retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || now.saturating_sub(slot.last_seen.load(Ordering::Acquire)) <= max_idle
        });
        before - map.len()
    }

    pub async fn tracked_classes(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub fn total_wait(&self) -> Duration {
        Duration::from_nanos(self.total_wait_nanos.load(Ordering::Relaxed))
    }

    /// Runs [`RateLimiter::sweep_stale`] every `every` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        max_idle: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let dropped = limiter.sweep_stale(max_idle).await;
                        if dropped > 0 {
                            debug!(dropped, "swept idle rate-limit slots");
                        }
                    }
                }
            }
        })
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
