use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::orchestrator::RequestOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The short form is enough to tell requests apart in logs.
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: RequestId,
    pub url: String,
    /// Overrides the local file name; deduplication still uses the server's name.
    pub filename_hint: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            url: url.into(),
            filename_hint: None,
        }
    }

    pub fn with_filename_hint(mut self, hint: impl Into<String>) -> Self {
        self.filename_hint = Some(hint.into());
        self
    }
}

/// Events published while a request runs. Per file: `Started`, any number of
/// `Progress`, then exactly one of `Completed` or `Error`. Per request: exactly
/// one `Finished`, always last.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started {
        id: RequestId,
        filename: String,
    },
    Progress {
        id: RequestId,
        filename: String,
        bytes_downloaded: u64,
        /// 0 when the size is unknown.
        total_bytes: u64,
        percentage: f64,
        speed_bytes_per_sec: f64,
    },
    Completed {
        id: RequestId,
        filename: String,
        local_path: PathBuf,
        final_size_bytes: u64,
    },
    Error {
        id: RequestId,
        filename: String,
        message: String,
    },
    Duplicate {
        id: RequestId,
        filename: String,
        since_last_download: Duration,
    },
    Finished {
        id: RequestId,
        outcome: RequestOutcome,
    },
}

impl ProgressEvent {
    pub fn id(&self) -> RequestId {
        match self {
            ProgressEvent::Started { id, .. }
            | ProgressEvent::Progress { id, .. }
            | ProgressEvent::Completed { id, .. }
            | ProgressEvent::Error { id, .. }
            | ProgressEvent::Duplicate { id, .. }
            | ProgressEvent::Finished { id, .. } => *id,
        }
    }
}

/// Fan-out publisher for [`ProgressEvent`]s. Emitting with no subscribers is not an error.
///
/// Delivery is bounded by the channel capacity: a subscriber that falls more than
/// `capacity` events behind gets `RecvError::Lagged` and loses the oldest events,
/// which may include a `Finished`. Callers that need every outcome should use the
/// value returned by `DownloadHandle::outcome` instead.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// Timing and throughput for one transfer.
#[derive(Debug)]
pub struct DownloadStats {
    pub start: Instant,
    pub total_bytes: u64,
    pub bytes_so_far: u64,
    last_sample: Instant,
    last_bytes: u64,
}

impl DownloadStats {
    pub fn new(total_bytes: u64) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            total_bytes,
            bytes_so_far: 0,
            last_sample: now,
            last_bytes: 0,
        }
    }

    /// Records a new cumulative byte count and returns the throughput since the
    /// previous sample. Counts never go backwards.
    pub fn sample(&mut self, bytes: u64) -> f64 {
        let now = Instant::now();
        let bytes = bytes.max(self.bytes_so_far);
        let dt = now.duration_since(self.last_sample).as_secs_f64();
        let speed = if dt > 0.0 {
            (bytes - self.last_bytes) as f64 / dt
        } else {
            0.0
        };
        self.bytes_so_far = bytes;
        self.last_sample = now;
        self.last_bytes = bytes;
        speed
    }

    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_so_far as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }

    pub fn average_speed(&self) -> f64 {
        let secs = self.start.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.bytes_so_far as f64 / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_never_go_backwards() {
        let mut stats = DownloadStats::new(200);
        stats.sample(100);
        stats.sample(50);
        assert_eq!(stats.bytes_so_far, 100);
        assert_eq!(stats.percentage(), 50.0);
    }

    #[test]
    fn slow_subscriber_is_told_it_lagged() {
        let sink = EventSink::new(2);
        let mut rx = sink.subscribe();
        let id = RequestId::new();
        for filename in ["a", "b", "c"] {
            sink.emit(ProgressEvent::Started {
                id,
                filename: filename.to_string(),
            });
        }
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Lagged(1))));
        assert!(matches!(rx.try_recv(), Ok(ProgressEvent::Started { filename, .. }) if filename == "b"));
    }

    #[test]
    fn unknown_total_reports_zero_percent() {
        let mut stats = DownloadStats::new(0);
        stats.sample(4096);
        assert_eq!(stats.percentage(), 0.0);
    }
}
