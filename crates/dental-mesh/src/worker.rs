//! Background thread for intersection detection.
//!
//! The owner sends [`WorkerRequest`]s and polls [`WorkerEvent`]s over
//! `std::sync::mpsc`. Every request carries a generation number. The worker
//! only runs the newest queued request, abandons a running pass as soon as a
//! newer generation is issued, and the owner drops any event older than the
//! latest generation, so results computed against superseded geometry never
//! surface.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{DentalError, DentalResult};
use crate::intersect::{IntersectionDetector, IntersectionParams, IntersectionResult, SegmentSnapshot};
use crate::progress::{Progress, ProgressCallback};

const TASK: &str = "intersection detection";

/// Owner → worker messages.
#[derive(Debug)]
pub enum WorkerRequest {
    Detect {
        generation: u64,
        snapshots: Vec<SegmentSnapshot>,
    },
    Shutdown,
}

/// Worker → owner messages.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Progress {
        generation: u64,
        progress: Progress,
    },
    Completed {
        generation: u64,
        results: Vec<IntersectionResult>,
    },
    Failed {
        generation: u64,
        error: String,
    },
}

impl WorkerEvent {
    pub fn generation(&self) -> u64 {
        match self {
            WorkerEvent::Progress { generation, .. }
            | WorkerEvent::Completed { generation, .. }
            | WorkerEvent::Failed { generation, .. } => *generation,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerEvent::Progress { .. })
    }
}

/// Handle to the detection thread. Dropping it shuts the thread down and joins it.
pub struct IntersectionWorker {
    requests: Sender<WorkerRequest>,
    events: Receiver<WorkerEvent>,
    latest: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl IntersectionWorker {
    pub fn spawn(params: IntersectionParams) -> DentalResult<Self> {
        let (requests, request_rx) = mpsc::channel::<WorkerRequest>();
        let (event_tx, events) = mpsc::channel::<WorkerEvent>();
        let latest = Arc::new(AtomicU64::new(0));

        let worker_latest = latest.clone();
        let handle = thread::Builder::new()
            .name("dental-intersections".into())
            .spawn(move || run(IntersectionDetector::new(params), request_rx, event_tx, worker_latest))
            .map_err(|e| DentalError::worker_failed(TASK, e.to_string()))?;

        Ok(Self {
            requests,
            events,
            latest,
            handle: Some(handle),
        })
    }

    /// The newest generation issued by [`submit`](Self::submit) or
    /// [`invalidate`](Self::invalidate).
    pub fn latest_generation(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }

    /// Queue a detection pass, superseding anything earlier.
    pub fn submit(&self, snapshots: Vec<SegmentSnapshot>) -> DentalResult<u64> {
        let generation = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, segments = snapshots.len(), "Submitting detection pass");
        self.requests
            .send(WorkerRequest::Detect {
                generation,
                snapshots,
            })
            .map_err(|_| DentalError::worker_failed(TASK, "worker thread has exited"))?;
        Ok(generation)
    }

    /// Mark every pending or running pass stale without starting a new one.
    ///
    /// Call after geometry edits whose results the owner no longer wants.
    pub fn invalidate(&self) -> u64 {
        let generation = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "Invalidated detection results");
        generation
    }

    /// Next event for the latest generation, without blocking.
    pub fn try_recv(&self) -> Option<WorkerEvent> {
        while let Ok(event) = self.events.try_recv() {
            if self.is_current(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Next event for the latest generation, waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(event) if self.is_current(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Block until the latest pass finishes.
    pub fn wait_completed(&self, timeout: Duration) -> DentalResult<Vec<IntersectionResult>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv_timeout(remaining) {
                Some(WorkerEvent::Completed { results, .. }) => return Ok(results),
                Some(WorkerEvent::Failed { error, .. }) => {
                    return Err(DentalError::worker_failed(TASK, error));
                }
                Some(WorkerEvent::Progress { .. }) => continue,
                None => {
                    return Err(DentalError::worker_failed(
                        TASK,
                        format!("no result within {:.1}s", timeout.as_secs_f64()),
                    ));
                }
            }
        }
    }

    fn is_current(&self, event: &WorkerEvent) -> bool {
        let latest = self.latest_generation();
        if event.generation() < latest {
            if event.is_terminal() {
                debug!(generation = event.generation(), latest, "Dropping stale worker event");
            }
            false
        } else {
            true
        }
    }
}

impl Drop for IntersectionWorker {
    fn drop(&mut self) {
        self.latest.fetch_add(1, Ordering::SeqCst);
        let _ = self.requests.send(WorkerRequest::Shutdown);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Intersection worker thread panicked during shutdown");
        }
    }
}

fn run(
    detector: IntersectionDetector,
    requests: Receiver<WorkerRequest>,
    events: Sender<WorkerEvent>,
    latest: Arc<AtomicU64>,
) {
    info!("Intersection worker started");
    while let Ok(mut request) = requests.recv() {
        // Only the newest queued request matters.
        while let Ok(next) = requests.try_recv() {
            if matches!(request, WorkerRequest::Shutdown) {
                break;
            }
            request = next;
        }

        let (generation, snapshots) = match request {
            WorkerRequest::Shutdown => break,
            WorkerRequest::Detect {
                generation,
                snapshots,
            } => (generation, snapshots),
        };
        if generation < latest.load(Ordering::SeqCst) {
            debug!(generation, "Skipping superseded detection pass");
            continue;
        }

        let progress_events = events.clone();
        let progress_latest = latest.clone();
        let callback: ProgressCallback = Box::new(move |progress| {
            progress_latest.load(Ordering::SeqCst) == generation
                && progress_events
                    .send(WorkerEvent::Progress {
                        generation,
                        progress: progress.clone(),
                    })
                    .is_ok()
        });

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            detector.detect_all_with_progress(&snapshots, Some(&callback))
        }));

        let event = match outcome {
            Ok(Some(results)) => WorkerEvent::Completed {
                generation,
                results,
            },
            Ok(None) => {
                debug!(generation, "Detection pass abandoned");
                continue;
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(generation, error = %message, "Detection pass panicked");
                WorkerEvent::Failed {
                    generation,
                    error: message,
                }
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }
    info!("Intersection worker stopped");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
