//! NTP-style clock offset estimation against broker server time

use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DxStreamError, Result};

/// Number of round-trip probes per sync
pub const DEFAULT_SAMPLES: usize = 5;

/// Clock synchronizer configuration
#[derive(Debug, Clone)]
pub struct ClockSyncConfig {
    pub samples: usize,
    /// Pause between probes
    pub sample_delay: Duration,
    /// Re-sync once the last sync is older than this
    pub sync_interval: Duration,
    /// Maximum tolerated |timestamp - server now|
    pub max_drift: Duration,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            samples: DEFAULT_SAMPLES,
            sample_delay: Duration::from_millis(100),
            sync_interval: Duration::from_secs(300),
            max_drift: Duration::from_secs(30),
        }
    }
}

/// One round-trip probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub offset_ms: i64,
    pub round_trip_ms: i64,
}

impl ClockSample {
    /// `offset = server_time - round_trip / 2 - t1`
    pub fn from_probe(t1_ms: i64, server_ms: i64, t2_ms: i64) -> Self {
        let round_trip_ms = (t2_ms - t1_ms).max(0);
        Self {
            offset_ms: server_ms - round_trip_ms / 2 - t1_ms,
            round_trip_ms,
        }
    }
}

/// Pick the sample with the smallest round-trip time.
pub fn best_sample(samples: &[ClockSample]) -> Option<ClockSample> {
    samples.iter().copied().min_by_key(|s| s.round_trip_ms)
}

/// Tracks server-minus-local clock offset
#[derive(Debug)]
pub struct ClockSynchronizer {
    config: ClockSyncConfig,
    offset_ms: AtomicI64,
    /// Local millis of the last successful sync, 0 if never
    last_sync_ms: AtomicI64,
}

impl Default for ClockSynchronizer {
    fn default() -> Self {
        Self::new(ClockSyncConfig::default())
    }
}

impl ClockSynchronizer {
    pub fn new(config: ClockSyncConfig) -> Self {
        Self {
            config,
            offset_ms: AtomicI64::new(0),
            last_sync_ms: AtomicI64::new(0),
        }
    }

    fn local_now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Probe the server `samples` times and adopt the minimum round-trip sample.
    ///
    /// `fetch_server_time` returns server epoch milliseconds.
    pub async fn sync<F, Fut>(&self, mut fetch_server_time: F) -> Result<ClockSample>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<i64>>,
    {
        let mut samples = Vec::with_capacity(self.config.samples);

        for i in 0..self.config.samples {
            if i > 0 && !self.config.sample_delay.is_zero() {
                tokio::time::sleep(self.config.sample_delay).await;
            }

            let t1 = Self::local_now_ms();
            match fetch_server_time().await {
                Ok(server_ms) => {
                    let t2 = Self::local_now_ms();
                    let sample = ClockSample::from_probe(t1, server_ms, t2);
                    debug!(
                        "Clock probe {}: offset={}ms rtt={}ms",
                        i, sample.offset_ms, sample.round_trip_ms
                    );
                    samples.push(sample);
                }
                Err(e) => debug!("Clock probe {} failed: {}", i, e),
            }
        }

        let best = best_sample(&samples).ok_or_else(|| {
            DxStreamError::Internal("Clock sync failed: no successful probes".to_string())
        })?;

        self.apply(best);
        info!(
            "Clock synchronized: offset={}ms (rtt={}ms, {} samples)",
            best.offset_ms,
            best.round_trip_ms,
            samples.len()
        );
        Ok(best)
    }

    fn apply(&self, sample: ClockSample) {
        self.offset_ms.store(sample.offset_ms, Ordering::SeqCst);
        self.last_sync_ms
            .store(Self::local_now_ms(), Ordering::SeqCst);
    }

    /// Server-minus-local estimate in milliseconds
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst)
    }

    pub fn has_synced(&self) -> bool {
        self.last_sync_ms.load(Ordering::SeqCst) != 0
    }

    /// True if never synced or the last sync is older than the sync interval
    pub fn needs_sync(&self) -> bool {
        let last = self.last_sync_ms.load(Ordering::SeqCst);
        if last == 0 {
            return true;
        }
        Self::local_now_ms() - last > self.config.sync_interval.as_millis() as i64
    }

    /// Estimated server time in epoch milliseconds
    pub fn server_time_ms(&self) -> i64 {
        self.server_time_at(Self::local_now_ms())
    }

    /// Server time corresponding to a local timestamp
    pub fn server_time_at(&self, local_ms: i64) -> i64 {
        local_ms + self.offset_ms()
    }

    /// Fails if `timestamp_ms` is further than `max_drift` from estimated server time
    pub fn validate_timestamp(&self, timestamp_ms: i64) -> Result<()> {
        let drift_ms = timestamp_ms - self.server_time_ms();
        let max_drift_ms = self.config.max_drift.as_millis() as i64;
        if drift_ms.abs() > max_drift_ms {
            return Err(DxStreamError::ClockDrift {
                drift_ms,
                max_drift_ms,
            });
        }
        Ok(())
    }
}
