use anyhow::{bail, Context, Result};
use chrono::{Local, TimeZone};
use clipfetch::{
    BatchItemResult, Config, DownloadCoordinator, HistoryStore, ProcessingClient, ProgressEvent, RequestId,
    RequestOrchestrator,
};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub async fn read_tasks_file(path: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open tasks file: {:?}", path))?;
    let mut lines = BufReader::new(file).lines();
    let mut urls = vec![];
    while let Some(line) = lines.next_line().await? {
        let raw = line.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        urls.push(raw.to_string());
    }
    Ok(urls)
}

pub async fn run_downloads(config: Config, urls: Vec<String>) -> Result<()> {
    let history = Arc::new(
        HistoryStore::open(&config.history_path)
            .with_context(|| format!("Failed to open history file: {:?}", config.history_path))?,
    );
    let client = config.http_client()?;
    let orchestrator = RequestOrchestrator::from_config(client, &config, history)
        .context("Failed to set up the downloader")?;
    let coordinator = DownloadCoordinator::new(orchestrator, config.max_concurrent_downloads);

    let multi_progress = MultiProgress::new();
    multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
    let done = CancellationToken::new();
    let renderer = tokio::spawn(render_progress(coordinator.subscribe(), multi_progress.clone(), done.clone()));

    let results = coordinator.submit_batch(urls.iter().cloned()).await;
    done.cancel();
    let _ = renderer.await;
    coordinator.shutdown().await;

    let mut failed = 0;
    println!();
    for (url, result) in urls.iter().zip(results.iter()) {
        match result {
            BatchItemResult::Success { filename, path, .. } => {
                println!("{:<10} {} -> {:?}", "Saved", filename, path);
            }
            BatchItemResult::Skipped { filename, message, .. } => {
                println!("{:<10} {} ({})", "Skipped", filename, message);
            }
            BatchItemResult::Error { message, .. } => {
                failed += 1;
                println!("{:<10} {} ({})", "Failed", url, message);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} downloads failed", failed, urls.len());
    }
    Ok(())
}

async fn render_progress(
    mut events: broadcast::Receiver<ProgressEvent>,
    multi_progress: MultiProgress,
    done: CancellationToken,
) {
    let mut bars: HashMap<(RequestId, String), ProgressBar> = HashMap::new();
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "progress display fell behind, some events were dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            _ = done.cancelled() => {
                // Everything has finished; draw what is still queued and stop.
                loop {
                    match events.try_recv() {
                        Ok(event) => render_event(&multi_progress, &mut bars, event),
                        Err(TryRecvError::Lagged(missed)) => {
                            warn!(missed, "progress display fell behind, some events were dropped");
                            continue;
                        }
                        Err(_) => break,
                    }
                }
                break;
            }
        };
        render_event(&multi_progress, &mut bars, event);
    }
}

fn render_event(multi_progress: &MultiProgress, bars: &mut HashMap<(RequestId, String), ProgressBar>, event: ProgressEvent) {
    match event {
        ProgressEvent::Started { id, filename } => {
            let pb = multi_progress.add(ProgressBar::new(0));
            pb.set_style(bar_style());
            pb.set_message(format!("Downloading {}", filename));
            bars.insert((id, filename), pb);
        }
        ProgressEvent::Progress {
            id,
            filename,
            bytes_downloaded,
            total_bytes,
            ..
        } => {
            if let Some(pb) = bars.get(&(id, filename)) {
                if total_bytes > 0 {
                    pb.set_length(total_bytes);
                }
                pb.set_position(bytes_downloaded);
            }
        }
        ProgressEvent::Completed {
            id,
            filename,
            final_size_bytes,
            ..
        } => {
            if let Some(pb) = bars.remove(&(id, filename.clone())) {
                pb.set_length(final_size_bytes);
                pb.finish_with_message(format!("Completed   {}", filename));
            }
        }
        ProgressEvent::Error { id, filename, message } => {
            if let Some(pb) = bars.remove(&(id, filename.clone())) {
                pb.abandon_with_message(format!("Failed      {} ({})", filename, message));
            }
        }
        ProgressEvent::Duplicate { filename, since_last_download, .. } => {
            let _ = multi_progress.println(format!(
                "Skipped     {} (already downloaded {})",
                filename,
                clipfetch::utils::format_elapsed(since_last_download)
            ));
        }
        ProgressEvent::Finished { id, outcome } => {
            let _ = multi_progress.println(format!("[{}] {}", id, outcome.message()));
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

pub fn show_history(config: &Config) -> Result<()> {
    let history = HistoryStore::open(&config.history_path)
        .with_context(|| format!("Failed to open history file: {:?}", config.history_path))?;
    let records = history.records();
    if records.is_empty() {
        println!("No downloads recorded in {:?}.", config.history_path);
        return Ok(());
    }

    println!("{:<50} {:<20} {:<15} {}", "Filename", "Downloaded", "Video ID", "Source");
    println!("{:-<50} {:-<20} {:-<15} {:-<20}", "", "", "", "");
    for record in records {
        let when = Local
            .timestamp_millis_opt(record.downloaded_at_millis)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{:<50} {:<20} {:<15} {}",
            record.filename,
            when,
            record.video_id.as_deref().unwrap_or("-"),
            record.url
        );
    }
    Ok(())
}

pub async fn show_server_info(config: &Config) -> Result<()> {
    let client = config.http_client()?;
    let api = ProcessingClient::new(client, &config.server_url, config.request_timeout)?;
    let info = api
        .server_info()
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))
        .with_context(|| format!("Failed to query {}", api.base_url()))?;

    println!("Server:          {}", api.base_url());
    println!("Version:         {}", info.version);
    if let Some(latest) = &info.latest_version {
        println!("Latest client:   {}", latest);
    }
    if let Some(apk) = &info.apk_url {
        println!("Client download: {}", apk);
    }
    println!("Platforms:       {}", info.total_platforms);
    if let Some(notes) = &info.release_notes {
        println!("Release notes:   {}", notes);
    }
    if let Ok(dir) = std::fs::read_dir(&config.download_dir) {
        let total: u64 = dir
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum();
        println!("Local downloads: {} in {:?}", HumanBytes(total), config.download_dir);
    }
    Ok(())
}
