use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

/// Last path segment of `url_str`, or a random name when the path has none.
pub fn get_filename_from_url(url_str: &str) -> String {
    if let Ok(url) = Url::parse(url_str) {
        if let Some(segments) = url.path_segments() {
            if let Some(filename) = segments.last() {
                if !filename.is_empty() {
                    return filename.to_string();
                }
            }
        }
    }
    format!("download_{}", uuid::Uuid::new_v4().simple())
}

/// Replaces path separators and characters most filesystems reject.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

pub fn get_unique_filepath(dir: &Path, filename: &str) -> PathBuf {
    let mut path = dir.join(filename);
    let original = Path::new(filename);
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string());
    let extension = original.extension().map(|e| e.to_string_lossy().to_string());
    let mut counter = 1;

    while path.exists() {
        let new_filename = match &extension {
            Some(ext) => format!("{}_{}.{}", stem, counter, ext),
            None => format!("{}_{}", stem, counter),
        };
        path = dir.join(new_filename);
        counter += 1;
    }
    path
}

/// Short relative age, as in "already downloaded 5m ago".
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    match secs {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
