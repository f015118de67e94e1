use anyhow::{bail, Context, Result};
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;

use crate::cli::OutputFormat;
use crate::config::EngineConfig;
use crate::coordinator::{Coordinator, StatusReport};
use crate::state::{DownloadId, DownloadStatus};
use crate::store::JsonFileStore;

pub fn open_coordinator(config: EngineConfig) -> Result<Coordinator> {
    let store = JsonFileStore::open(&config.download_dir)
        .with_context(|| format!("Failed to open state in {:?}", config.download_dir))?;
    tracing::debug!(path = %store.path().display(), "opened state file");
    let coordinator = Coordinator::new(config, Arc::new(store)).context("Failed to build HTTP client")?;
    let recovered = coordinator.recover().context("Failed to recover interrupted downloads")?;
    if recovered > 0 {
        println!("{} interrupted download(s) marked as paused", recovered);
    }
    Ok(coordinator)
}

pub async fn run_get(coordinator: &Coordinator, url: &str, name: &str) -> Result<()> {
    println!("Calculating size...");
    let id = coordinator
        .create(url, name)
        .await
        .with_context(|| format!("Failed to start download of {}", url))?;
    println!("Download {} started", id);
    follow(coordinator, id).await
}

pub async fn run_resume(coordinator: &Coordinator, id: DownloadId) -> Result<()> {
    coordinator.resume(id).await.context("Failed to resume download")?;
    follow(coordinator, id).await
}

pub async fn run_retry(coordinator: &Coordinator, id: DownloadId, full: bool) -> Result<()> {
    coordinator.retry(id, full).await.context("Failed to retry download")?;
    follow(coordinator, id).await
}

/// Shows a progress bar until the current batch settles. Ctrl+C pauses the
/// download and keeps waiting for the workers to park.
async fn follow(coordinator: &Coordinator, id: DownloadId) -> Result<()> {
    let initial = coordinator.status(id)?;
    let pb = ProgressBar::with_draw_target(
        Some(initial.total_bytes),
        ProgressDrawTarget::stderr_with_hz(5),
    );
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );
    pb.set_message(format!(
        "Downloading {}",
        initial.path.file_name().unwrap_or_default().to_string_lossy()
    ));
    pb.set_position(initial.downloaded_bytes);

    let ticker = {
        let pb = pb.clone();
        let progress = coordinator.progress(id);
        tokio::spawn(async move {
            loop {
                if let Some(progress) = &progress {
                    let snap = progress.snapshot();
                    pb.set_position(snap.downloaded);
                    if snap.failed_segments > 0 {
                        pb.set_message(format!("{} segment(s) failed", snap.failed_segments));
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    };

    let report = tokio::select! {
        report = coordinator.wait(id) => report?,
        _ = tokio::signal::ctrl_c() => {
            pb.set_message("Pausing...");
            coordinator.pause(id)?;
            coordinator.wait(id).await?
        }
    };
    ticker.abort();
    pb.set_position(report.downloaded_bytes);

    match report.status {
        DownloadStatus::Completed => {
            pb.finish_with_message(format!("Completed   {}", report.path.display()));
            Ok(())
        }
        DownloadStatus::Paused => {
            pb.abandon_with_message("Paused");
            println!("Resume with: segdl resume {}", id);
            Ok(())
        }
        status => {
            pb.abandon_with_message(format!("{}", status));
            print_report(&report);
            bail!("Download {} is {}; retry with: segdl retry {}", id, status, id)
        }
    }
}

pub fn show_status(coordinator: &Coordinator, id: DownloadId, format: OutputFormat) -> Result<()> {
    let report = coordinator.status(id)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &StatusReport) {
    println!("ID:     {}", report.id);
    println!("URL:    {}", report.url);
    println!("Path:   {}", report.path.display());
    println!("Status: {}", report.status);
    println!(
        "Bytes:  {} / {}",
        HumanBytes(report.downloaded_bytes),
        HumanBytes(report.total_bytes)
    );
    println!();
    println!("{:<8} {:<15} {:<30} {:<15}", "Segment", "Status", "Range", "Downloaded");
    println!("{:-<8} {:-<15} {:-<30} {:-<15}", "", "", "", "");
    for segment in &report.segments {
        println!(
            "{:<8} {:<15} {:<30} {:<15}",
            segment.index,
            segment.status.to_string(),
            format!("{}-{}", segment.start, segment.end),
            format!("{}", HumanBytes(segment.bytes_downloaded))
        );
    }
}

pub fn list_downloads(coordinator: &Coordinator) -> Result<()> {
    let reports = coordinator.list()?;
    if reports.is_empty() {
        println!("No downloads found in '{:?}'.", coordinator.config().download_dir);
        return Ok(());
    }

    let total_downloaded: u64 = reports.iter().map(|r| r.downloaded_bytes).sum();
    let total_known: u64 = reports.iter().map(|r| r.total_bytes).sum();
    let completed = reports
        .iter()
        .filter(|r| r.status == DownloadStatus::Completed)
        .count();
    println!(
        "Summary: Files: {}/{} | Downloaded: {} / {}",
        completed,
        reports.len(),
        HumanBytes(total_downloaded),
        HumanBytes(total_known)
    );
    println!();

    println!("{:<38} {:<40} {:<12} {:<10} {:<12}", "ID", "Filename", "Status", "Progress", "Size");
    println!("{:-<38} {:-<40} {:-<12} {:-<10} {:-<12}", "", "", "", "", "");
    for report in &reports {
        let progress = if report.total_bytes > 0 {
            (report.downloaded_bytes as f64 / report.total_bytes as f64) * 100.0
        } else {
            0.0
        };
        println!(
            "{:<38} {:<40} {:<12} {:<10} {:<12}",
            report.id.to_string(),
            report.path.file_name().unwrap_or_default().to_string_lossy(),
            report.status.to_string(),
            format!("{:.2}%", progress),
            format!("{}", HumanBytes(report.total_bytes))
        );
    }
    Ok(())
}
