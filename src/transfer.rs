//! Single-file transfer: capability probe, chunk planning, concurrent ranged
//! fetches into per-chunk temp files, ordered merge, cleanup. Falls back to one
//! sequential stream when the server cannot serve ranges.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{header, Client, StatusCode};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::chunk::{plan_chunks, ChunkPlan, ChunkRange, ChunkSettings};
use crate::config::Config;
use crate::error::{DownloadError, DownloadResult};
use crate::progress::{DownloadStats, EventSink, ProgressEvent, RequestId};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct TransferSettings {
    pub chunks: ChunkSettings,
    pub buffer_size: usize,
    pub progress_interval: Duration,
}

impl From<&Config> for TransferSettings {
    fn from(config: &Config) -> Self {
        Self {
            chunks: ChunkSettings {
                chunk_size: config.chunk_size,
                max_chunks: config.max_chunks,
                min_chunked_size: config.min_chunked_size,
            },
            buffer_size: config.buffer_size,
            progress_interval: config.progress_interval,
        }
    }
}

/// What the capability probe learned. A failed probe is simply "nothing known".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Probe {
    pub total_bytes: Option<u64>,
    pub accepts_ranges: bool,
}

#[derive(Debug, Clone)]
pub struct TransferTask {
    pub source_url: Url,
    pub destination: PathBuf,
    pub total_bytes: Option<u64>,
    pub plan: ChunkPlan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub size: u64,
    /// Number of ranged requests issued; 0 for a single-stream transfer.
    pub chunks: usize,
}

enum ChunkFailure {
    /// The server answered a range request with the whole file.
    RangeIgnored,
    Failed(DownloadError),
}

impl From<DownloadError> for ChunkFailure {
    fn from(err: DownloadError) -> Self {
        ChunkFailure::Failed(err)
    }
}

pub struct TransferEngine {
    client: Client,
    settings: TransferSettings,
    rate_limiter: Option<(Arc<Limiter>, NonZeroU32)>,
}

impl TransferEngine {
    pub fn new(client: Client, settings: TransferSettings, rate_limit_bytes_per_sec: Option<u32>) -> Self {
        let rate_limiter = rate_limit_bytes_per_sec.and_then(NonZeroU32::new).map(|limit| {
            let quota = Quota::per_second(limit);
            (Arc::new(RateLimiter::direct(quota)), limit)
        });
        Self {
            client,
            settings,
            rate_limiter,
        }
    }

    pub fn from_config(client: Client, config: &Config) -> Self {
        Self::new(client, TransferSettings::from(config), config.rate_limit_bytes_per_sec)
    }

    pub async fn probe(&self, url: &Url) -> Probe {
        let response = match self.client.head(url.clone()).timeout(PROBE_TIMEOUT).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(%url, status = %r.status(), "probe rejected");
                return Probe::default();
            }
            Err(e) => {
                debug!(%url, error = %e, "probe failed");
                return Probe::default();
            }
        };
        let headers = response.headers();
        let accepts_ranges = headers
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("bytes"))
            .unwrap_or(false);
        // Read the header directly: the body of a HEAD response is always empty.
        let total_bytes = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|len| *len > 0);
        Probe {
            total_bytes,
            accepts_ranges,
        }
    }

    /// Downloads `source` to `destination`, publishing `Started`, `Progress` and
    /// exactly one `Completed` or `Error` for `filename`. On any failure the
    /// destination and all chunk files are removed.
    pub async fn fetch(
        &self,
        id: RequestId,
        filename: &str,
        source: &Url,
        destination: &Path,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> DownloadResult<TransferOutcome> {
        sink.emit(ProgressEvent::Started {
            id,
            filename: filename.to_string(),
        });

        let result = self.run(id, filename, source, destination, sink, cancel).await;
        match &result {
            Ok(outcome) => {
                info!(%id, filename, size = outcome.size, chunks = outcome.chunks, "transfer complete");
                sink.emit(ProgressEvent::Completed {
                    id,
                    filename: filename.to_string(),
                    local_path: outcome.path.clone(),
                    final_size_bytes: outcome.size,
                });
            }
            Err(e) => {
                warn!(%id, filename, error = %e, "transfer failed");
                remove_quietly(destination).await;
                sink.emit(ProgressEvent::Error {
                    id,
                    filename: filename.to_string(),
                    message: e.user_message(),
                });
            }
        }
        result
    }

    async fn run(
        &self,
        id: RequestId,
        filename: &str,
        source: &Url,
        destination: &Path,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> DownloadResult<TransferOutcome> {
        let probe = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            probe = self.probe(source) => probe,
        };
        let task = TransferTask {
            source_url: source.clone(),
            destination: destination.to_path_buf(),
            total_bytes: probe.total_bytes,
            plan: plan_chunks(probe.total_bytes, probe.accepts_ranges, self.settings.chunks),
        };
        let chunk_count = match &task.plan {
            ChunkPlan::Chunked(ranges) => ranges.len(),
            ChunkPlan::Single => 1,
        };
        debug!(%id, ?probe, chunk_count, "planned transfer");

        // Shared with the fallback path so a restarted stream never reports fewer bytes.
        let reporter = Arc::new(ProgressReporter::new(sink.clone(), id, filename, task.total_bytes.unwrap_or(0)));

        if let ChunkPlan::Chunked(ranges) = &task.plan {
            match self.fetch_chunked(&task, ranges, &reporter, cancel).await {
                Ok(outcome) => return Ok(outcome),
                Err(ChunkFailure::RangeIgnored) => {
                    warn!(%id, url = %source, "server ignored range request, retrying as one stream");
                }
                Err(ChunkFailure::Failed(e)) => return Err(e),
            }
        }
        self.fetch_single(&task, &reporter, cancel).await
    }

    async fn fetch_chunked(
        &self,
        task: &TransferTask,
        ranges: &[ChunkRange],
        reporter: &Arc<ProgressReporter>,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, ChunkFailure> {
        let counters: Arc<Vec<AtomicU64>> = Arc::new(ranges.iter().map(|_| AtomicU64::new(0)).collect());
        let chunk_paths: Vec<PathBuf> = ranges.iter().map(|r| chunk_path(&task.destination, r.index)).collect();

        let mut set = JoinSet::new();
        for (range, path) in ranges.iter().zip(chunk_paths.iter()) {
            let client = self.client.clone();
            let url = task.source_url.clone();
            let range = *range;
            let path = path.clone();
            let counters = counters.clone();
            let limiter = self.rate_limiter.clone();
            set.spawn(async move { fetch_chunk(client, url, range, path, counters, limiter).await });
        }

        let stop_monitor = CancellationToken::new();
        let monitor = tokio::spawn(monitor_progress(
            reporter.clone(),
            counters.clone(),
            self.settings.progress_interval,
            stop_monitor.clone(),
        ));

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(ChunkFailure::Failed(DownloadError::Cancelled)),
                next = set.join_next() => match next {
                    None => break Ok(()),
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(failure))) => break Err(failure),
                    Some(Err(e)) => {
                        break Err(ChunkFailure::Failed(DownloadError::Other(format!("chunk task failed: {}", e))))
                    }
                },
            }
        };
        // Aborts whatever is still running and waits for it to let go of its file.
        set.shutdown().await;

        stop_monitor.cancel();
        let _ = monitor.await;

        if let Err(failure) = result {
            remove_all(&chunk_paths).await;
            return Err(failure);
        }

        let merged = merge_chunks(&chunk_paths, &task.destination, self.settings.buffer_size).await;
        remove_all(&chunk_paths).await;
        let size = merged?;

        let expected = ranges.iter().map(ChunkRange::len).sum::<u64>();
        if size != expected {
            return Err(DownloadError::Other(format!(
                "merged size {} does not match expected {}",
                size, expected
            ))
            .into());
        }

        reporter.finish(size);
        Ok(TransferOutcome {
            path: task.destination.clone(),
            size,
            chunks: ranges.len(),
        })
    }

    async fn fetch_single(
        &self,
        task: &TransferTask,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> DownloadResult<TransferOutcome> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            r = self.client.get(task.source_url.clone()).send() => r.map_err(|e| DownloadError::from_transport(&e))?,
        };
        if !response.status().is_success() {
            return Err(DownloadError::Server {
                status: response.status().as_u16(),
            });
        }
        if let Some(len) = response.content_length() {
            reporter.set_total_if_unknown(len);
        }

        let file = File::create(&task.destination).await?;
        let mut writer = BufWriter::with_capacity(self.settings.buffer_size, file);
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut last_emit = Instant::now();

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let bytes = item.map_err(|e| DownloadError::from_transport(&e))?;
            throttle(&self.rate_limiter, bytes.len()).await;
            writer.write_all(&bytes).await?;
            written += bytes.len() as u64;

            if last_emit.elapsed() >= self.settings.progress_interval {
                reporter.report(written);
                last_emit = Instant::now();
            }
        }
        writer.flush().await?;
        drop(writer);

        reporter.finish(written);
        Ok(TransferOutcome {
            path: task.destination.clone(),
            size: written,
            chunks: 0,
        })
    }
}

async fn fetch_chunk(
    client: Client,
    url: Url,
    range: ChunkRange,
    path: PathBuf,
    counters: Arc<Vec<AtomicU64>>,
    limiter: Option<(Arc<Limiter>, NonZeroU32)>,
) -> Result<(), ChunkFailure> {
    let response = client
        .get(url)
        .header(header::RANGE, range.header_value())
        .send()
        .await
        .map_err(|e| DownloadError::from_transport(&e))?;

    match response.status() {
        StatusCode::PARTIAL_CONTENT => {}
        StatusCode::OK => return Err(ChunkFailure::RangeIgnored),
        status => return Err(DownloadError::Server { status: status.as_u16() }.into()),
    }

    let file = File::create(&path).await.map_err(DownloadError::from_io)?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut received: u64 = 0;

    while let Some(item) = stream.next().await {
        let bytes = item.map_err(|e| DownloadError::from_transport(&e))?;
        throttle(&limiter, bytes.len()).await;
        writer.write_all(&bytes).await.map_err(DownloadError::from_io)?;
        received += bytes.len() as u64;
        counters[range.index].fetch_add(bytes.len() as u64, Ordering::Relaxed);
    }
    writer.flush().await.map_err(DownloadError::from_io)?;

    if received != range.len() {
        return Err(DownloadError::Other(format!(
            "chunk {} returned {} bytes, expected {}",
            range.index,
            received,
            range.len()
        ))
        .into());
    }
    Ok(())
}

async fn monitor_progress(
    reporter: Arc<ProgressReporter>,
    counters: Arc<Vec<AtomicU64>>,
    interval: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                let total: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
                reporter.report(total);
            }
        }
    }
}

/// Concatenates chunk files in index order. Returns the merged size.
async fn merge_chunks(chunk_paths: &[PathBuf], destination: &Path, buffer_size: usize) -> DownloadResult<u64> {
    let file = File::create(destination).await?;
    let mut writer = BufWriter::with_capacity(buffer_size, file);
    let mut total = 0u64;
    for path in chunk_paths {
        let mut chunk = File::open(path).await?;
        total += tokio::io::copy(&mut chunk, &mut writer).await?;
    }
    writer.flush().await?;
    Ok(total)
}

async fn throttle(limiter: &Option<(Arc<Limiter>, NonZeroU32)>, len: usize) {
    let Some((limiter, burst)) = limiter else { return };
    let mut remaining = len as u64;
    while remaining > 0 {
        let piece = remaining.min(burst.get() as u64) as u32;
        if let Some(n) = NonZeroU32::new(piece) {
            // `piece` never exceeds the burst size, so capacity is always sufficient.
            let _ = limiter.until_n_ready(n).await;
        }
        remaining -= piece as u64;
    }
}

pub(crate) fn chunk_path(destination: &Path, index: usize) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    destination.with_file_name(format!("{}.part{}", name, index))
}

async fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        remove_quietly(path).await;
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "failed to remove partial file");
        }
    }
}

struct ProgressReporter {
    sink: EventSink,
    id: RequestId,
    filename: String,
    state: Mutex<ReporterState>,
}

struct ReporterState {
    stats: DownloadStats,
    emitted_any: bool,
}

impl ProgressReporter {
    fn new(sink: EventSink, id: RequestId, filename: &str, total_bytes: u64) -> Self {
        Self {
            sink,
            id,
            filename: filename.to_string(),
            state: Mutex::new(ReporterState {
                stats: DownloadStats::new(total_bytes),
                emitted_any: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_total_if_unknown(&self, total_bytes: u64) {
        let mut state = self.lock();
        if state.stats.total_bytes == 0 {
            state.stats.total_bytes = total_bytes;
        }
    }

    /// Emits a tick only when the count moved forward.
    fn report(&self, bytes: u64) {
        let mut state = self.lock();
        if state.emitted_any && bytes <= state.stats.bytes_so_far {
            return;
        }
        let speed = state.stats.sample(bytes);
        state.emitted_any = true;
        let percentage = state.stats.percentage();
        self.emit(&state.stats, percentage, speed);
    }

    /// Terminal progress tick: always exactly 100%.
    fn finish(&self, final_size: u64) {
        let mut state = self.lock();
        if state.stats.total_bytes == 0 {
            state.stats.total_bytes = final_size;
        }
        state.stats.sample(final_size);
        let speed = state.stats.average_speed();
        self.emit(&state.stats, 100.0, speed);
    }

    fn emit(&self, stats: &DownloadStats, percentage: f64, speed: f64) {
        self.sink.emit(ProgressEvent::Progress {
            id: self.id,
            filename: self.filename.clone(),
            bytes_downloaded: stats.bytes_so_far,
            total_bytes: stats.total_bytes,
            percentage,
            speed_bytes_per_sec: speed,
        });
    }
}
