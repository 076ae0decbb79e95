//! Resource ceiling for the worker pool
//!
//! Two limits apply to every action of every session:
//!
//! - [`ResourceCeiling`]: maximum number of actions in flight. Lowering the
//!   limit never cancels anything; the surplus permits are retired as the
//!   running actions return them.
//! - [`BandwidthLimiter`]: token bucket in bytes per second. Transfers
//!   take their size from the bucket before they start and wait while it
//!   is in debt, so a low limit slows the pool instead of failing actions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use kdsync_core::config::ResourcesConfig;

// ============================================================================
// BandwidthLimiter
// ============================================================================

#[derive(Debug)]
struct BucketState {
    /// Bytes per second; 0 = unlimited
    rate: f64,
    /// Available bytes, negative while in debt
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            // Burst capacity is one second worth of bytes
            self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
            self.last_refill = now;
        }
    }
}

/// Token bucket limiting transfer throughput
#[derive(Debug)]
pub struct BandwidthLimiter {
    state: Mutex<BucketState>,
}

impl BandwidthLimiter {
    /// Creates a limiter of `kbps` KiB per second (0 = unlimited)
    pub fn new(kbps: u64) -> Self {
        let rate = Self::bytes_per_sec(kbps);
        Self {
            state: Mutex::new(BucketState {
                rate,
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    fn bytes_per_sec(kbps: u64) -> f64 {
        kbps as f64 * 1024.0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_rate(&self, kbps: u64) {
        let mut state = self.lock();
        state.refill();
        state.rate = Self::bytes_per_sec(kbps);
        state.tokens = state.tokens.min(state.rate);
    }

    pub fn rate_kbps(&self) -> u64 {
        (self.lock().rate / 1024.0) as u64
    }

    /// Takes `bytes` from the bucket, returning how long to wait
    fn reserve(&self, bytes: u64) -> Duration {
        let mut state = self.lock();
        if state.rate <= 0.0 {
            return Duration::ZERO;
        }
        state.refill();
        state.tokens -= bytes as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / state.rate)
        }
    }

    /// Waits until `bytes` fit under the limit
    pub async fn consume(&self, bytes: u64) {
        let wait = self.reserve(bytes);
        if !wait.is_zero() {
            debug!(bytes, wait_ms = wait.as_millis() as u64, "Bandwidth ceiling reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

// ============================================================================
// ResourceCeiling
// ============================================================================

/// Concurrency and bandwidth limits shared by all sessions
#[derive(Debug)]
pub struct ResourceCeiling {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    bandwidth: BandwidthLimiter,
}

impl ResourceCeiling {
    pub fn new(max_concurrent: usize, bandwidth_kbps: u64) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            limit: AtomicUsize::new(max_concurrent),
            bandwidth: BandwidthLimiter::new(bandwidth_kbps),
        }
    }

    pub fn from_config(config: &ResourcesConfig) -> Self {
        Self::new(config.max_concurrent_actions as usize, config.bandwidth_limit_kbps)
    }

    /// Waits for a free slot
    pub async fn acquire(&self) -> anyhow::Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("resource ceiling closed"))
    }

    pub fn bandwidth(&self) -> &BandwidthLimiter {
        &self.bandwidth
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// Slots not taken right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Changes both limits
    ///
    /// Must be called from within a Tokio runtime: shrinking retires the
    /// surplus permits from a background task as they are released.
    pub fn set_limits(&self, max_concurrent: usize, bandwidth_kbps: u64) {
        let target = max_concurrent.max(1);
        let previous = self.limit.swap(target, Ordering::SeqCst);
        if target > previous {
            self.semaphore.add_permits(target - previous);
        } else if target < previous {
            let surplus = (previous - target) as u32;
            let semaphore = Arc::clone(&self.semaphore);
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(surplus).await {
                    permits.forget();
                }
            });
        }
        self.bandwidth.set_rate(bandwidth_kbps);
        info!(
            max_concurrent = target,
            bandwidth_kbps, "Resource ceiling updated"
        );
    }
}

impl Default for ResourceCeiling {
    fn default() -> Self {
        Self::from_config(&ResourcesConfig::default())
    }
}
