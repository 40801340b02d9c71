//! Turns one submitted URL into zero or more saved files: processing call with
//! per-class backoff, duplicate detection, then one transfer per resulting file.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::fs::{self, OpenOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{MultiFile, ProcessingClient, ProcessingResponse, SingleFile};
use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::error::{DownloadError, DownloadResult};
use crate::history::{DuplicateMatch, HistoryStore, MatchStrategy};
use crate::progress::{DownloadRequest, EventSink, ProgressEvent, RequestId};
use crate::transfer::TransferEngine;
use crate::utils::{format_elapsed, get_unique_filepath, sanitize_filename};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiFileSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Terminal result of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Completed {
        files: Vec<SavedFile>,
    },
    PartialSuccess {
        files: Vec<SavedFile>,
        summary: MultiFileSummary,
    },
    /// Not a failure: the content was already downloaded.
    Duplicate {
        filename: String,
        matched_by: MatchStrategy,
        since_last_download: Duration,
    },
    Unsupported {
        reason: String,
        message: String,
    },
    Failed {
        message: String,
    },
    Cancelled,
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Completed { .. } | RequestOutcome::PartialSuccess { .. })
    }

    pub fn files(&self) -> &[SavedFile] {
        match self {
            RequestOutcome::Completed { files } | RequestOutcome::PartialSuccess { files, .. } => files,
            _ => &[],
        }
    }

    /// One line suitable for a toast or a terminal.
    pub fn message(&self) -> String {
        match self {
            RequestOutcome::Completed { files } if files.len() == 1 => format!("Saved {}", files[0].filename),
            RequestOutcome::Completed { files } => format!("Saved {} files", files.len()),
            RequestOutcome::PartialSuccess { summary, .. } => format!(
                "Saved {} of {} files ({} failed, {} already downloaded)",
                summary.succeeded,
                summary.succeeded + summary.failed + summary.skipped,
                summary.failed,
                summary.skipped
            ),
            RequestOutcome::Duplicate {
                since_last_download, ..
            } => format!("Already downloaded {}", format_elapsed(*since_last_download)),
            RequestOutcome::Unsupported { message, .. } => message.clone(),
            RequestOutcome::Failed { message } => message.clone(),
            RequestOutcome::Cancelled => "Download cancelled.".to_string(),
        }
    }
}

enum Processed {
    Single(SingleFile),
    Multi(MultiFile),
}

pub struct RequestOrchestrator {
    api: ProcessingClient,
    engine: TransferEngine,
    history: Arc<HistoryStore>,
    backoff: BackoffPolicy,
    download_dir: PathBuf,
}

impl RequestOrchestrator {
    pub fn new(
        api: ProcessingClient,
        engine: TransferEngine,
        history: Arc<HistoryStore>,
        backoff: BackoffPolicy,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            api,
            engine,
            history,
            backoff,
            download_dir,
        }
    }

    pub fn from_config(client: Client, config: &Config, history: Arc<HistoryStore>) -> DownloadResult<Self> {
        let api = ProcessingClient::new(client.clone(), &config.server_url, config.request_timeout)?;
        let engine = TransferEngine::from_config(client, config);
        let backoff = BackoffPolicy::new(config.backoff.clone(), config.max_attempts);
        Ok(Self::new(api, engine, history, backoff, config.download_dir.clone()))
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn api(&self) -> &ProcessingClient {
        &self.api
    }

    /// Runs the request to completion and publishes exactly one `Finished` event.
    pub async fn process(&self, request: &DownloadRequest, sink: &EventSink, cancel: &CancellationToken) -> RequestOutcome {
        info!(id = %request.id, url = %request.url, "processing request");
        let outcome = self.run(request, sink, cancel).await;
        info!(id = %request.id, outcome = %outcome.message(), "request finished");
        sink.emit(ProgressEvent::Finished {
            id: request.id,
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn run(&self, request: &DownloadRequest, sink: &EventSink, cancel: &CancellationToken) -> RequestOutcome {
        let processed = match self.request_with_retries(request.id, &request.url, cancel).await {
            Ok(processed) => processed,
            Err(DownloadError::Cancelled) => return RequestOutcome::Cancelled,
            Err(DownloadError::Unsupported { kind, reason }) => {
                let message = DownloadError::Unsupported {
                    kind,
                    reason: reason.clone(),
                }
                .user_message();
                return RequestOutcome::Unsupported { reason, message };
            }
            Err(e) => return RequestOutcome::Failed { message: e.user_message() },
        };

        match processed {
            Processed::Single(file) => self.download_single(request, file, sink, cancel).await,
            Processed::Multi(multi) => self.download_multi(request, multi, sink, cancel).await,
        }
    }

    async fn request_with_retries(
        &self,
        id: RequestId,
        url: &str,
        cancel: &CancellationToken,
    ) -> DownloadResult<Processed> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                r = self.api.process(url) => r,
            };
            let err = match result {
                Ok(ProcessingResponse::SingleFile(file)) => return Ok(Processed::Single(file)),
                Ok(ProcessingResponse::MultiFile(multi)) => return Ok(Processed::Multi(multi)),
                Ok(ProcessingResponse::Unsupported { reason }) => {
                    info!(%id, %reason, "content rejected by server");
                    return Err(DownloadError::unsupported(reason));
                }
                Ok(ProcessingResponse::Transient { http_status, message }) => {
                    debug!(%id, http_status, %message, "transient server response");
                    DownloadError::Server { status: http_status }
                }
                Err(e) => e,
            };

            let Some(delay) = self.backoff.next_delay(err.class(), attempt) else {
                warn!(%id, attempt, error = %err, "giving up");
                return Err(err);
            };
            warn!(%id, attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying processing call");
            tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Video id first, then filename prefix, then URL hash. First hit wins.
    fn find_single_duplicate(&self, filename: &str, source_url: &str) -> Option<DuplicateMatch> {
        if let Some(record) = self.history.is_duplicate_by_video_id(filename) {
            return Some(DuplicateMatch {
                strategy: MatchStrategy::VideoId,
                downloaded_at_millis: record.downloaded_at_millis,
            });
        }
        if let Some(record) = self.history.find_by_filename(filename) {
            return Some(DuplicateMatch {
                strategy: MatchStrategy::FilenamePrefix,
                downloaded_at_millis: record.downloaded_at_millis,
            });
        }
        self.history.find_by_url(source_url).map(|ts| DuplicateMatch {
            strategy: MatchStrategy::UrlHash,
            downloaded_at_millis: ts,
        })
    }

    async fn download_single(
        &self,
        request: &DownloadRequest,
        file: SingleFile,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> RequestOutcome {
        if let Some(hit) = self.find_single_duplicate(&file.filename, &request.url) {
            return self.duplicate(request.id, &file.filename, hit, sink);
        }
        debug!(
            id = %request.id,
            filename = %file.filename,
            video_codec = ?file.video_codec,
            audio_codec = ?file.audio_codec,
            container = ?file.container,
            "downloading single file"
        );

        let local_name = request.filename_hint.as_deref().unwrap_or(&file.filename);
        match self.save(request.id, local_name, &file.download_url, sink, cancel).await {
            Ok(saved) => {
                self.remember(&file.filename, &request.url).await;
                RequestOutcome::Completed { files: vec![saved] }
            }
            Err(DownloadError::Cancelled) => RequestOutcome::Cancelled,
            Err(e) => RequestOutcome::Failed { message: e.user_message() },
        }
    }

    async fn download_multi(
        &self,
        request: &DownloadRequest,
        multi: MultiFile,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> RequestOutcome {
        info!(
            id = %request.id,
            files = multi.files.len(),
            platform = ?multi.platform,
            multi_image = multi.multi_image,
            "downloading multi-file post"
        );
        let mut summary = MultiFileSummary::default();
        let mut saved_files = Vec::new();
        let mut first_skip: Option<(String, DuplicateMatch)> = None;

        for file in &multi.files {
            // Every file of a post shares the post URL, so only the filename can tell them apart.
            if let Some(record) = self.history.find_by_filename(&file.filename) {
                let hit = DuplicateMatch {
                    strategy: MatchStrategy::FilenamePrefix,
                    downloaded_at_millis: record.downloaded_at_millis,
                };
                self.emit_duplicate(request.id, &file.filename, &hit, sink);
                first_skip.get_or_insert((file.filename.clone(), hit));
                summary.skipped += 1;
                continue;
            }

            match self.save(request.id, &file.filename, &file.download_url, sink, cancel).await {
                Ok(saved) => {
                    self.remember(&file.filename, &request.url).await;
                    saved_files.push(saved);
                    summary.succeeded += 1;
                }
                Err(DownloadError::Cancelled) => return RequestOutcome::Cancelled,
                Err(e) => {
                    warn!(id = %request.id, filename = %file.filename, error = %e, "file failed, continuing with the rest");
                    summary.failed += 1;
                }
            }
        }

        match (summary.succeeded, summary.failed) {
            (0, 0) => match first_skip {
                Some((filename, hit)) => RequestOutcome::Duplicate {
                    filename,
                    matched_by: hit.strategy,
                    since_last_download: hit.elapsed_since(chrono::Utc::now().timestamp_millis()),
                },
                None => RequestOutcome::Failed {
                    message: "The post contained no files.".to_string(),
                },
            },
            (_, 0) => RequestOutcome::Completed { files: saved_files },
            (0, failed) => RequestOutcome::Failed {
                message: format!("None of the {} files could be downloaded.", failed),
            },
            _ => RequestOutcome::PartialSuccess {
                files: saved_files,
                summary,
            },
        }
    }

    async fn save(
        &self,
        id: RequestId,
        local_name: &str,
        source: &Url,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> DownloadResult<SavedFile> {
        let destination = reserve_destination(&self.download_dir, &sanitize_filename(local_name)).await?;
        let filename = destination
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| local_name.to_string());
        let outcome = self.engine.fetch(id, &filename, source, &destination, sink, cancel).await?;
        Ok(SavedFile {
            filename,
            path: outcome.path,
            size: outcome.size,
        })
    }

    /// History writes hit the disk, so they run on the blocking pool.
    async fn remember(&self, filename: &str, url: &str) {
        let history = self.history.clone();
        let (name, source) = (filename.to_string(), url.to_string());
        match tokio::task::spawn_blocking(move || history.record(&name, &source)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(filename, url, error = %e, "failed to write download history"),
            Err(e) => warn!(filename, url, error = %e, "history write task failed"),
        }
    }

    fn duplicate(&self, id: RequestId, filename: &str, hit: DuplicateMatch, sink: &EventSink) -> RequestOutcome {
        let since = self.emit_duplicate(id, filename, &hit, sink);
        RequestOutcome::Duplicate {
            filename: filename.to_string(),
            matched_by: hit.strategy,
            since_last_download: since,
        }
    }

    fn emit_duplicate(&self, id: RequestId, filename: &str, hit: &DuplicateMatch, sink: &EventSink) -> Duration {
        let since = hit.elapsed_since(chrono::Utc::now().timestamp_millis());
        info!(%id, filename, matched_by = ?hit.strategy, "skipping duplicate");
        sink.emit(ProgressEvent::Duplicate {
            id,
            filename: filename.to_string(),
            since_last_download: since,
        });
        since
    }
}

/// Claims a fresh path in `dir` by creating it, so two concurrent downloads of the
/// same name never share a destination.
async fn reserve_destination(dir: &Path, filename: &str) -> DownloadResult<PathBuf> {
    fs::create_dir_all(dir).await?;
    loop {
        let candidate = get_unique_filepath(dir, filename);
        match OpenOptions::new().write(true).create_new(true).open(&candidate).await {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(DownloadError::from_io(e)),
        }
    }
}
