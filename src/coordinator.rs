use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::orchestrator::{RequestOrchestrator, RequestOutcome};
use crate::progress::{DownloadRequest, EventSink, ProgressEvent, RequestId};

const EVENT_CAPACITY: usize = 4096;

/// Handle to a submitted request. Dropping it does not cancel the download.
pub struct DownloadHandle {
    pub id: RequestId,
    join: JoinHandle<RequestOutcome>,
}

impl DownloadHandle {
    pub async fn outcome(self) -> RequestOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => RequestOutcome::Cancelled,
            Err(e) => RequestOutcome::Failed {
                message: format!("download task failed: {}", e),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchItemResult {
    Success {
        id: RequestId,
        filename: String,
        path: PathBuf,
    },
    /// Already downloaded; not an error.
    Skipped {
        id: RequestId,
        filename: String,
        message: String,
    },
    Error {
        id: RequestId,
        /// `None` when the failure happened before the server named a file.
        filename: Option<String>,
        message: String,
    },
}

impl BatchItemResult {
    fn from_outcome(id: RequestId, outcome: RequestOutcome) -> Self {
        let message = outcome.message();
        match outcome {
            RequestOutcome::Completed { files } | RequestOutcome::PartialSuccess { files, .. } => {
                match files.into_iter().next() {
                    Some(first) => BatchItemResult::Success {
                        id,
                        filename: first.filename,
                        path: first.path,
                    },
                    None => BatchItemResult::Error {
                        id,
                        filename: None,
                        message,
                    },
                }
            }
            RequestOutcome::Duplicate { filename, .. } => BatchItemResult::Skipped { id, filename, message },
            RequestOutcome::Unsupported { .. } | RequestOutcome::Failed { .. } | RequestOutcome::Cancelled => {
                BatchItemResult::Error {
                    id,
                    filename: None,
                    message,
                }
            }
        }
    }
}

struct ActiveDownload {
    url: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RunningCounter {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct RunningGuard<'a>(&'a RunningCounter);

impl RunningCounter {
    fn enter(&self) -> RunningGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        RunningGuard(self)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Entry point for callers: bounds how many requests run end to end at once,
/// queues the rest, and owns cancellation for everything in flight.
pub struct DownloadCoordinator {
    orchestrator: Arc<RequestOrchestrator>,
    semaphore: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<RequestId, ActiveDownload>>>,
    running: Arc<RunningCounter>,
    sink: EventSink,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl DownloadCoordinator {
    pub fn new(orchestrator: RequestOrchestrator, max_concurrent_downloads: usize) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            semaphore: Arc::new(Semaphore::new(max_concurrent_downloads.max(1))),
            active: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(RunningCounter::default()),
            sink: EventSink::new(EVENT_CAPACITY),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sink.subscribe()
    }

    pub fn orchestrator(&self) -> &RequestOrchestrator {
        &self.orchestrator
    }

    pub fn submit(&self, url: impl Into<String>) -> DownloadHandle {
        self.submit_request(DownloadRequest::new(url))
    }

    pub fn submit_request(&self, request: DownloadRequest) -> DownloadHandle {
        let id = request.id;
        let cancel = self.shutdown.child_token();
        self.lock_active().insert(
            id,
            ActiveDownload {
                url: request.url.clone(),
                cancel: cancel.clone(),
            },
        );
        debug!(%id, url = %request.url, "queued");

        let orchestrator = self.orchestrator.clone();
        let semaphore = self.semaphore.clone();
        let active = self.active.clone();
        let running = self.running.clone();
        let sink = self.sink.clone();

        let join = self.tracker.spawn(async move {
            let outcome = run_request(&orchestrator, &semaphore, &running, &sink, &request, &cancel).await;
            active
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&id);
            outcome
        });
        DownloadHandle { id, join }
    }

    /// Runs every URL concurrently under the same bound. Results come back in input order.
    pub async fn submit_batch<I, S>(&self, urls: I) -> Vec<BatchItemResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let handles: Vec<DownloadHandle> = urls.into_iter().map(|url| self.submit(url)).collect();
        info!(count = handles.len(), "batch submitted");
        let outcomes = futures::future::join_all(handles.into_iter().map(|handle| async move {
            let id = handle.id;
            (id, handle.outcome().await)
        }))
        .await;
        outcomes
            .into_iter()
            .map(|(id, outcome)| BatchItemResult::from_outcome(id, outcome))
            .collect()
    }

    pub fn cancel(&self, id: RequestId) -> bool {
        match self.lock_active().get(&id) {
            Some(download) => {
                info!(%id, url = %download.url, "cancelling");
                download.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (id, download) in self.lock_active().iter() {
            debug!(%id, "cancelling");
            download.cancel.cancel();
        }
    }

    /// Requests submitted and not yet finished, queued or running.
    pub fn in_flight(&self) -> usize {
        self.lock_active().len()
    }

    pub fn running(&self) -> usize {
        self.running.current.load(Ordering::SeqCst)
    }

    /// Highest number of requests that have run at the same time.
    pub fn peak_running(&self) -> usize {
        self.running.peak.load(Ordering::SeqCst)
    }

    /// Cancels everything and waits for every task to clean up.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("coordinator shut down");
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<RequestId, ActiveDownload>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_request(
    orchestrator: &RequestOrchestrator,
    semaphore: &Arc<Semaphore>,
    running: &RunningCounter,
    sink: &EventSink,
    request: &DownloadRequest,
    cancel: &CancellationToken,
) -> RequestOutcome {
    let permit = tokio::select! {
        _ = cancel.cancelled() => None,
        permit = semaphore.clone().acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        sink.emit(ProgressEvent::Finished {
            id: request.id,
            outcome: RequestOutcome::Cancelled,
        });
        return RequestOutcome::Cancelled;
    };

    let _running = running.enter();
    // A panic inside one request must not take the others down, and the
    // caller still gets its terminal event.
    match AssertUnwindSafe(orchestrator.process(request, sink, cancel))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(id = %request.id, "request panicked");
            let outcome = RequestOutcome::Failed {
                message: "Internal error while downloading.".to_string(),
            };
            sink.emit(ProgressEvent::Finished {
                id: request.id,
                outcome: outcome.clone(),
            });
            outcome
        }
    }
}
