//! Download history used for duplicate detection.
//!
//! Records live in a flat key/value namespace. Each record writes four parallel
//! indices keyed off its timestamp, URL hash and (when derivable) video id:
//!
//! ```text
//! filename_<ts>  url_<ts>  timestamp_<ts>
//! url_hash_<hash>  url_hash_<hash>_time
//! video_<id>  video_<id>_time
//! ```
//!
//! Lookups never use a single canonical key: the same video can arrive under
//! different URLs, and unrelated posts can share a filename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{DownloadError, DownloadResult};
use crate::hashing::url_hash;

const GENERIC_NAMES: &[&str] = &[
    "tiktok.mp4",
    "video.mp4",
    "instagram.mp4",
    "facebook.mp4",
    "twitter.mp4",
];
const GENERIC_PREFIX: &str = "media_";
const MULTI_IMAGE_MARKER: &str = "_image_";
const PREFIX_CHARS: usize = 30;
const MIN_STORED_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub filename: String,
    pub url: String,
    pub downloaded_at_millis: i64,
    pub video_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    VideoId,
    FilenamePrefix,
    UrlHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateMatch {
    pub strategy: MatchStrategy,
    pub downloaded_at_millis: i64,
}

impl DuplicateMatch {
    pub fn elapsed_since(&self, now_millis: i64) -> Duration {
        Duration::from_millis(now_millis.saturating_sub(self.downloaded_at_millis).max(0) as u64)
    }
}

pub struct HistoryStore {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, String>>,
}

impl HistoryStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Opens the store backed by `path`, starting empty if the file does not exist yet.
    /// A corrupt file is logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> DownloadResult<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = ?path, error = %e, "history file is corrupt, starting empty");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    pub fn is_duplicate(&self, filename: &str) -> bool {
        self.find_by_filename(filename).is_some()
    }

    pub fn is_duplicate_by_video_id(&self, filename: &str) -> Option<HistoryRecord> {
        let id = extract_video_id(filename)?;
        let entries = self.lock();
        let stored_name = entries.get(&format!("video_{}", id))?;
        let ts = entries
            .get(&format!("video_{}_time", id))
            .and_then(|t| t.parse::<i64>().ok())
            .unwrap_or_default();
        Some(HistoryRecord {
            filename: stored_name.clone(),
            url: entries.get(&format!("url_{}", ts)).cloned().unwrap_or_default(),
            downloaded_at_millis: ts,
            video_id: Some(id),
        })
    }

    pub fn is_duplicate_by_url_hash(&self, url: &str) -> bool {
        self.find_by_url(url).is_some()
    }

    /// Newest record whose filename counts as the same content as `filename`.
    pub fn find_by_filename(&self, filename: &str) -> Option<HistoryRecord> {
        if is_generic_filename(filename) {
            return None;
        }
        let entries = self.lock();
        let found = filename_entries(&entries)
            .rev()
            .find(|(_, stored)| filenames_match(stored, filename))
            .map(|(ts, _)| record_at_ts(&entries, ts));
        found
    }

    /// Timestamp of the last download of exactly this (normalised) URL.
    pub fn find_by_url(&self, url: &str) -> Option<i64> {
        let hash = url_hash(url);
        let entries = self.lock();
        entries.get(&format!("url_hash_{}", hash))?;
        Some(
            entries
                .get(&format!("url_hash_{}_time", hash))
                .and_then(|t| t.parse().ok())
                .unwrap_or_default(),
        )
    }

    /// Writes the record and persists the whole store before returning. This blocks on
    /// file I/O; async callers should go through `spawn_blocking`.
    pub fn record(&self, filename: &str, url: &str) -> DownloadResult<HistoryRecord> {
        self.record_at(filename, url, chrono::Utc::now().timestamp_millis())
    }

    pub fn record_at(&self, filename: &str, url: &str, timestamp_millis: i64) -> DownloadResult<HistoryRecord> {
        let mut entries = self.lock();
        let before = entries.clone();

        let mut ts = timestamp_millis;
        while entries.contains_key(&format!("filename_{}", ts)) {
            ts += 1;
        }

        entries.insert(format!("filename_{}", ts), filename.to_string());
        entries.insert(format!("url_{}", ts), url.to_string());
        entries.insert(format!("timestamp_{}", ts), ts.to_string());

        let hash = url_hash(url);
        entries.insert(format!("url_hash_{}", hash), "true".to_string());
        entries.insert(format!("url_hash_{}_time", hash), ts.to_string());

        let video_id = extract_video_id(filename);
        if let Some(id) = &video_id {
            entries.insert(format!("video_{}", id), filename.to_string());
            entries.insert(format!("video_{}_time", id), ts.to_string());
        }

        if let Err(e) = self.persist(&entries) {
            *entries = before;
            return Err(e);
        }
        debug!(filename, url, ts, video_id = ?video_id, "recorded download");

        Ok(HistoryRecord {
            filename: filename.to_string(),
            url: url.to_string(),
            downloaded_at_millis: ts,
            video_id,
        })
    }

    /// All records, newest first.
    pub fn records(&self) -> Vec<HistoryRecord> {
        let entries = self.lock();
        let records = filename_entries(&entries)
            .rev()
            .map(|(ts, _)| record_at_ts(&entries, ts))
            .collect();
        records
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> DownloadResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| DownloadError::Other(format!("failed to encode history: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

pub fn is_generic_filename(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    GENERIC_NAMES.contains(&lower.as_str()) || lower.starts_with(GENERIC_PREFIX)
}

fn filenames_match(stored: &str, candidate: &str) -> bool {
    if is_generic_filename(stored) {
        return false;
    }
    // Slideshow frames share everything up to the marker.
    if candidate.contains(MULTI_IMAGE_MARKER) || stored.contains(MULTI_IMAGE_MARKER) {
        return stored == candidate;
    }
    stored.chars().count() > MIN_STORED_LEN
        && stored.chars().take(PREFIX_CHARS).eq(candidate.chars().take(PREFIX_CHARS))
}

/// Tries a 19+ digit numeric id, then an 11-character id, then a UUID.
pub fn extract_video_id(filename: &str) -> Option<String> {
    static NUMERIC: OnceLock<Regex> = OnceLock::new();
    static SHORT: OnceLock<Regex> = OnceLock::new();
    static UUID: OnceLock<Regex> = OnceLock::new();

    let numeric = NUMERIC.get_or_init(|| Regex::new(r"\d{19,}").expect("valid regex"));
    if let Some(m) = numeric.find(filename) {
        return Some(m.as_str().to_string());
    }

    let short = SHORT.get_or_init(|| {
        Regex::new(r"(?:^|[\s\[\(._-])([A-Za-z0-9_-]{11})(?:[\s\]\)._-]|$)").expect("valid regex")
    });
    if let Some(id) = short.captures(filename).and_then(|c| c.get(1)) {
        return Some(id.as_str().to_string());
    }

    let uuid = UUID.get_or_init(|| {
        Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
            .expect("valid regex")
    });
    uuid.find(filename).map(|m| m.as_str().to_lowercase())
}

fn filename_entries(entries: &BTreeMap<String, String>) -> impl DoubleEndedIterator<Item = (i64, &str)> {
    // BTreeMap orders keys lexically, so sort numerically before exposing.
    let mut items: Vec<(i64, &str)> = entries
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix("filename_")
                .and_then(|ts| ts.parse::<i64>().ok())
                .map(|ts| (ts, v.as_str()))
        })
        .collect();
    items.sort_by_key(|(ts, _)| *ts);
    items.into_iter()
}

fn record_at_ts(entries: &BTreeMap<String, String>, ts: i64) -> HistoryRecord {
    let filename = entries.get(&format!("filename_{}", ts)).cloned().unwrap_or_default();
    let video_id = extract_video_id(&filename);
    HistoryRecord {
        url: entries.get(&format!("url_{}", ts)).cloned().unwrap_or_default(),
        downloaded_at_millis: entries
            .get(&format!("timestamp_{}", ts))
            .and_then(|t| t.parse().ok())
            .unwrap_or(ts),
        filename,
        video_id,
    }
}
