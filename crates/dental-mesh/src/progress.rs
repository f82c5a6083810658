//! Progress reporting and cancellation for long passes.
//!
//! Intersection detection and auto-segmentation report through a
//! [`ProgressTracker`] shared by the rayon workers of a pass. The owner
//! supplies a [`ProgressCallback`]; returning `false` from it cancels the pass.
//!
//! ```
//! use dental_mesh::progress::{ProgressCallback, ProgressTracker};
//! use std::time::Duration;
//!
//! let callback: ProgressCallback = Box::new(|p| {
//!     eprintln!("{}% {}", p.percent(), p.message);
//!     true
//! });
//! let tracker = ProgressTracker::with_interval(4, Duration::ZERO);
//! tracker.increment();
//! assert!(tracker.maybe_callback(Some(&callback), "pair 1/4"));
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A progress snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    pub message: String,
    pub elapsed: Duration,
    pub estimated_remaining: Option<Duration>,
}

impl Progress {
    pub fn new(current: u64, total: u64, message: impl Into<String>) -> Self {
        Self {
            current,
            total,
            message: message.into(),
            elapsed: Duration::ZERO,
            estimated_remaining: None,
        }
    }

    /// 0.0 to 1.0; 0 for an empty pass.
    #[inline]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current as f64 / self.total as f64).min(1.0)
        }
    }

    #[inline]
    pub fn percent(&self) -> u32 {
        (self.fraction() * 100.0).round() as u32
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }
}

/// Returns `true` to continue, `false` to cancel.
pub type ProgressCallback = Box<dyn Fn(&Progress) -> bool + Send + Sync>;

/// Lock-free counter plus a rate-limited callback, shared across threads.
#[derive(Debug)]
pub struct ProgressTracker {
    current: AtomicU64,
    total: u64,
    cancelled: AtomicBool,
    start_time: Instant,
    last_callback: Mutex<Option<Instant>>,
    callback_interval: Duration,
}

impl ProgressTracker {
    /// Tracker reporting at most every 100 ms.
    pub fn new(total: u64) -> Self {
        Self::with_interval(total, Duration::from_millis(100))
    }

    pub fn with_interval(total: u64, interval: Duration) -> Self {
        Self {
            current: AtomicU64::new(0),
            total,
            cancelled: AtomicBool::new(false),
            start_time: Instant::now(),
            last_callback: Mutex::new(None),
            callback_interval: interval,
        }
    }

    #[inline]
    pub fn increment(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_by(&self, amount: u64) {
        self.current.fetch_add(amount, Ordering::Relaxed);
    }

    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Linear extrapolation from the rate so far.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        let current = self.current();
        if current == 0 {
            return None;
        }
        let rate = current as f64 / self.elapsed().as_secs_f64();
        (rate > 0.0 && rate.is_finite()).then(|| {
            Duration::from_secs_f64(self.total.saturating_sub(current) as f64 / rate)
        })
    }

    pub fn snapshot(&self, message: impl Into<String>) -> Progress {
        Progress {
            current: self.current(),
            total: self.total,
            message: message.into(),
            elapsed: self.elapsed(),
            estimated_remaining: self.estimated_remaining(),
        }
    }

    /// Invoke `callback` if the interval has passed since the last call.
    ///
    /// Returns `false` once the pass is cancelled, by the callback or otherwise.
    pub fn maybe_callback(
        &self,
        callback: Option<&ProgressCallback>,
        message: impl Into<String>,
    ) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let Some(callback) = callback else {
            return true;
        };

        let now = Instant::now();
        {
            let mut last = self
                .last_callback
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(previous) = *last
                && now.duration_since(previous) < self.callback_interval
            {
                return true;
            }
            *last = Some(now);
        }

        if callback(&self.snapshot(message)) {
            true
        } else {
            self.cancel();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_progress_fraction() {
        let p = Progress::new(1, 4, "pairs");
        assert!((p.fraction() - 0.25).abs() < 1e-12);
        assert_eq!(p.percent(), 25);
        assert!(!p.is_complete());
        assert_eq!(Progress::new(0, 0, "empty").percent(), 0);
    }

    #[test]
    fn test_tracker_counts() {
        let tracker = ProgressTracker::new(10);
        tracker.increment();
        tracker.increment_by(4);
        assert_eq!(tracker.current(), 5);
        assert!(tracker.snapshot("half").fraction() >= 0.5);
    }

    #[test]
    fn test_callback_cancels() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let callback: ProgressCallback = Box::new(move |p| {
            seen.fetch_add(1, Ordering::SeqCst);
            p.current < 3
        });

        let tracker = ProgressTracker::with_interval(10, Duration::ZERO);
        let mut stopped_at = None;
        for i in 0..10 {
            tracker.increment();
            if !tracker.maybe_callback(Some(&callback), "step") {
                stopped_at = Some(i);
                break;
            }
        }
        assert_eq!(stopped_at, Some(2));
        assert!(tracker.is_cancelled());
        assert!(!tracker.maybe_callback(Some(&callback), "after"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_interval_limits_calls() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let callback: ProgressCallback = Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            true
        });
        let tracker = ProgressTracker::with_interval(100, Duration::from_secs(3600));
        for _ in 0..50 {
            tracker.increment();
            assert!(tracker.maybe_callback(Some(&callback), "step"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_callback_continues() {
        let tracker = ProgressTracker::new(1);
        assert!(tracker.maybe_callback(None, "quiet"));
    }
}
