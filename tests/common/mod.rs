#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clipfetch::{BackoffConfig, Config, DownloadCoordinator, HistoryStore, ProgressEvent, RequestOrchestrator};
use tokio::sync::broadcast;
use wiremock::{Request, Respond, ResponseTemplate};

/// Serves a fixed payload, honouring `Range` headers with 206 slices.
#[derive(Clone)]
pub struct RangedFile {
    pub data: Arc<Vec<u8>>,
    pub ranged_gets: Arc<AtomicUsize>,
    pub honour_ranges: bool,
}

impl RangedFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            ranged_gets: Arc::new(AtomicUsize::new(0)),
            honour_ranges: true,
        }
    }

    pub fn ignoring_ranges(data: Vec<u8>) -> Self {
        Self {
            honour_ranges: false,
            ..Self::new(data)
        }
    }

    pub fn ranged_gets(&self) -> usize {
        self.ranged_gets.load(Ordering::SeqCst)
    }
}

impl Respond for RangedFile {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);
        match range {
            Some((start, end)) if self.honour_ranges => {
                self.ranged_gets.fetch_add(1, Ordering::SeqCst);
                let end = end.min(self.data.len() - 1);
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes {}-{}/{}", start, end, self.data.len()).as_str())
                    .set_body_bytes(self.data[start..=end].to_vec())
            }
            _ => ResponseTemplate::new(200).set_body_bytes(self.data.to_vec()),
        }
    }
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Deterministic, non-repeating-ish payload so misordered chunks are caught.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn test_config(server_url: &str, download_dir: &Path) -> Config {
    let quick = Duration::from_millis(10);
    Config {
        server_url: server_url.to_string(),
        download_dir: download_dir.to_path_buf(),
        history_path: download_dir.join("history.json"),
        progress_interval: Duration::from_millis(20),
        backoff: BackoffConfig {
            dns: quick,
            connect: quick,
            read_timeout: quick,
            server: quick,
            other: quick,
        },
        ..Config::default()
    }
}

pub fn coordinator(config: &Config, history: Arc<HistoryStore>) -> DownloadCoordinator {
    let client = config.http_client().unwrap();
    let orchestrator = RequestOrchestrator::from_config(client, config, history).unwrap();
    DownloadCoordinator::new(orchestrator, config.max_concurrent_downloads)
}

pub fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}
