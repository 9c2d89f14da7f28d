//! Lock-free pipeline counters shared with the control plane.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct StreamStats {
    pub running: AtomicBool,
    pub input_rate: AtomicU32,
    pub output_rate: AtomicU32,
    pub upsample_factor: AtomicU32,
    pub filter_active: AtomicBool,
    pub gpu_backend: AtomicBool,
    pub blocks_processed: AtomicU64,
    pub input_overflows: AtomicU64,
    pub output_overflows: AtomicU64,
    pub xrun_recoveries: AtomicU64,
    pub engine_resets: AtomicU64,
    /// Raised by SOFT_RESET or a capture XRUN, consumed by the processing thread.
    pub reset_requested: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub running: bool,
    pub input_rate: u32,
    pub output_rate: u32,
    pub upsample_factor: u32,
    pub backend: &'static str,
    pub blocks_processed: u64,
    pub input_overflows: u64,
    pub output_overflows: u64,
    pub xrun_recoveries: u64,
    pub engine_resets: u64,
}

impl StreamStats {
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Release);
    }

    pub fn take_reset_request(&self) -> bool {
        self.reset_requested.swap(false, Ordering::AcqRel)
    }

    /// Clears per-run values before a (re)start.
    pub fn begin_run(&self, input_rate: u32, output_rate: u32, factor: u32, backend: Option<&str>) {
        self.input_rate.store(input_rate, Ordering::Relaxed);
        self.output_rate.store(output_rate, Ordering::Relaxed);
        self.upsample_factor.store(factor, Ordering::Relaxed);
        self.filter_active.store(backend.is_some(), Ordering::Relaxed);
        self.gpu_backend.store(backend == Some("gpu"), Ordering::Relaxed);
        self.reset_requested.store(false, Ordering::Relaxed);
        self.running.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            running: self.running.load(Ordering::Acquire),
            input_rate: self.input_rate.load(Ordering::Relaxed),
            output_rate: self.output_rate.load(Ordering::Relaxed),
            upsample_factor: self.upsample_factor.load(Ordering::Relaxed),
            backend: if !self.filter_active.load(Ordering::Relaxed) {
                "none"
            } else if self.gpu_backend.load(Ordering::Relaxed) {
                "gpu"
            } else {
                "cpu"
            },
            blocks_processed: self.blocks_processed.load(Ordering::Relaxed),
            input_overflows: self.input_overflows.load(Ordering::Relaxed),
            output_overflows: self.output_overflows.load(Ordering::Relaxed),
            xrun_recoveries: self.xrun_recoveries.load(Ordering::Relaxed),
            engine_resets: self.engine_resets.load(Ordering::Relaxed),
        }
    }
}

/// Logs at most once per interval, counting what it swallowed.
pub struct RateLimitedLog {
    what: &'static str,
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl RateLimitedLog {
    pub fn new(what: &'static str) -> Self {
        Self::with_interval(what, Duration::from_secs(1))
    }

    pub fn with_interval(what: &'static str, interval: Duration) -> Self {
        Self {
            what,
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns true when a message was emitted.
    pub fn hit(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                false
            }
            _ => {
                if self.suppressed > 0 {
                    log::warn!(
                        "{} overflow; dropping new audio ({} more since last report)",
                        self.what,
                        self.suppressed
                    );
                } else {
                    log::warn!("{} overflow; dropping new audio", self.what);
                }
                self.last = Some(now);
                self.suppressed = 0;
                true
            }
        }
    }
}
