//! Operator command-line interface: parses arguments into a single
//! `DownloadRequest` (multiple positional URLs are treated as mirrors of one
//! file), resolves the output path against existing files and sidecars,
//! drives the download through `paradl-api`, and renders progress with
//! `indicatif` until completion, failure, or `SIGINT`.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use paradl_api::{
    derive_filename, parse_segment_size, Allocation, DownloadConfig, DownloadRequest, Downloader,
    Event,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "paradl", author, version, about = "Resumable, segmented file downloader")]
struct Args {
    /// One or more URLs. More than one is treated as mirrors of the same file.
    #[arg(required = true)]
    urls: Vec<String>,

    /// Directory downloaded files are written to.
    #[arg(short = 'o', long = "output-dir")]
    output_directory: Option<PathBuf>,

    /// Output filename; derived from the first URL when omitted.
    #[arg(short, long)]
    filename: Option<String>,

    /// Global cap on simultaneously active tasks.
    #[arg(long, default_value_t = 4)]
    max_concurrent_downloads: usize,

    /// Upper bound on the number of segments for this download.
    #[arg(long, default_value_t = 8)]
    split: u32,

    /// Cap on simultaneous in-flight segments.
    #[arg(long, default_value_t = 4)]
    max_connections_per_server: usize,

    /// Minimum target size per segment, e.g. "1MB", "512KB", or a raw byte count.
    #[arg(long, default_value = "1MB")]
    segment_size: String,

    /// Disables sidecar persistence and resume.
    #[arg(long)]
    no_resume: bool,

    /// Seconds between periodic control saves; 0 disables auto-save.
    #[arg(long, default_value_t = 5)]
    auto_save_interval: u64,

    /// Disables failing fast when a target file exists without a valid
    /// control record (resumes fresh from scratch instead).
    #[arg(long)]
    no_always_resume: bool,

    /// File allocation strategy applied when the output file is opened.
    #[arg(long, value_enum, default_value_t = AllocationArg::None)]
    allocation: AllocationArg,

    /// Increases log verbosity; repeatable (-v, -vv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Explicit log level, overriding `-v` and `RUST_LOG`.
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum AllocationArg {
    None,
    Trunc,
    Prealloc,
    Falloc,
}

impl From<AllocationArg> for Allocation {
    fn from(value: AllocationArg) -> Self {
        match value {
            AllocationArg::None => Allocation::None,
            AllocationArg::Trunc => Allocation::Trunc,
            AllocationArg::Prealloc => Allocation::Prealloc,
            AllocationArg::Falloc => Allocation::Falloc,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let segment_size = parse_segment_size(&args.segment_size)
        .map_err(|e| anyhow!("invalid --segment-size: {e}"))?;

    let output_directory = args.output_directory.clone().unwrap_or_else(|| {
        dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
    });
    tokio::fs::create_dir_all(&output_directory)
        .await
        .with_context(|| format!("creating output directory {}", output_directory.display()))?;

    let requested_filename = args
        .filename
        .clone()
        .unwrap_or_else(|| derive_filename(&args.urls[0]));

    let (output_path, resuming) =
        resolve_output_path(&output_directory, &requested_filename, args.no_resume).await?;
    let filename = output_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(requested_filename);
    if resuming {
        info!(path = %output_path.display(), "resuming from an existing control record");
    }

    let config = DownloadConfig {
        split: args.split,
        segment_size,
        max_connections_per_server: args.max_connections_per_server,
        timeout: Duration::from_secs(30),
        retries: 3,
        retry_delay: Duration::from_millis(1000),
        headers: Default::default(),
        file_allocation: args.allocation.into(),
        resume_downloads: !args.no_resume,
        auto_save_interval: Duration::from_secs(args.auto_save_interval),
        always_resume: !args.no_always_resume,
        output_directory: Some(output_directory.clone()),
        max_download_speed: 0,
    };

    let downloader = Downloader::new(args.max_concurrent_downloads, config);
    let events = downloader.subscribe();
    let progress_task = tokio::spawn(render_progress(events, filename.clone()));

    let request = DownloadRequest {
        urls: args.urls.clone(),
        filename: Some(filename),
        output_directory: Some(output_directory),
    };

    let handle = downloader.download(request).await;
    let mut join = Box::pin(handle.join());

    let result = tokio::select! {
        result = &mut join => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("received SIGINT, cancelling active downloads");
            downloader.cancel_all();
            // Wait for the task's own cleanup path (final control-file
            // save) to actually finish before exiting.
            join.await
        }
    };

    drop(downloader);
    let _ = progress_task.await;

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("download failed: {e}");
            std::process::exit(1);
        }
    }
}

fn init_logging(args: &Args) {
    let level = args.log_level.clone().unwrap_or_else(|| {
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
        .to_string()
    });
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn render_progress(mut events: tokio::sync::broadcast::Receiver<Event>, filename: String) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );
    bar.set_message(filename);

    loop {
        match events.recv().await {
            Ok(Event::Start { .. }) => {}
            Ok(Event::Progress { progress, .. }) => {
                bar.set_length(progress.total_bytes);
                bar.set_position(progress.downloaded_bytes);
            }
            Ok(Event::Redirect { from, to, .. }) => {
                bar.println(format!("redirected: {from} -> {to}"));
            }
            Ok(Event::SegmentError { segment_index, error, .. }) => {
                bar.println(format!("segment {segment_index} failed, retrying: {error}"));
            }
            Ok(Event::Complete { .. }) => {
                bar.finish_with_message("done");
                break;
            }
            Ok(Event::Error { error, .. }) => {
                bar.abandon_with_message(format!("failed: {error}"));
                break;
            }
            Ok(Event::Cancel { .. }) => {
                bar.abandon_with_message("cancelled");
                break;
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Resolves the final output path for `filename` under `dir`:
/// - if nothing at that path exists, use it as-is;
/// - otherwise, unless resume is disabled, look for the most recently
///   modified `*.paradl` sidecar matching `filename` or a numbered variant
///   and resume that target instead;
/// - otherwise append a numeric suffix (`name.1.ext`, `name.2.ext`, ...)
///   until an unused path is found.
async fn resolve_output_path(dir: &Path, filename: &str, no_resume: bool) -> Result<(PathBuf, bool)> {
    let candidate = dir.join(filename);
    if tokio::fs::metadata(&candidate).await.is_err() {
        return Ok((candidate, false));
    }

    if !no_resume {
        if let Some(resume_target) = find_most_recent_control(dir, filename).await? {
            return Ok((resume_target, true));
        }
    }

    let mut n: u32 = 1;
    loop {
        let suffixed = dir.join(suffixed_filename(filename, n));
        if tokio::fs::metadata(&suffixed).await.is_err() {
            return Ok((suffixed, false));
        }
        n += 1;
    }
}

async fn find_most_recent_control(dir: &Path, filename: &str) -> Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading output directory {}", dir.display()))?;

    let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(target_name) = name.strip_suffix(".paradl") else {
            continue;
        };
        if !control_matches(target_name, filename) {
            continue;
        }
        let modified = entry.metadata().await?.modified()?;
        if best.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
            best = Some((modified, dir.join(target_name)));
        }
    }
    Ok(best.map(|(_, path)| path))
}

/// True if `target_name` is `filename` or a numbered variant of it
/// (`name.1.ext`, `name.2.ext`, ...).
fn control_matches(target_name: &str, filename: &str) -> bool {
    if target_name == filename {
        return true;
    }
    for n in 1..=9999u32 {
        if target_name == suffixed_filename(filename, n) {
            return true;
        }
    }
    false
}

fn suffixed_filename(filename: &str, n: u32) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}.{n}.{ext}"),
        _ => format!("{filename}.{n}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffixed_filename_inserts_before_extension() {
        assert_eq!(suffixed_filename("movie.mp4", 1), "movie.1.mp4");
        assert_eq!(suffixed_filename("movie.mp4", 2), "movie.2.mp4");
    }

    #[test]
    fn suffixed_filename_without_extension_appends() {
        assert_eq!(suffixed_filename("README", 1), "README.1");
    }

    #[test]
    fn control_matches_recognizes_base_and_numbered_variants() {
        assert!(control_matches("movie.mp4", "movie.mp4"));
        assert!(control_matches("movie.3.mp4", "movie.mp4"));
        assert!(!control_matches("other.mp4", "movie.mp4"));
    }

    #[tokio::test]
    async fn resolve_output_path_picks_a_fresh_name_when_nothing_exists() {
        let dir = tempfile::tempdir().unwrap();
        let (path, resuming) = resolve_output_path(dir.path(), "file.bin", false).await.unwrap();
        assert_eq!(path, dir.path().join("file.bin"));
        assert!(!resuming);
    }

    #[tokio::test]
    async fn resolve_output_path_suffixes_when_target_exists_without_control() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("file.bin"), b"x").await.unwrap();
        let (path, resuming) = resolve_output_path(dir.path(), "file.bin", false).await.unwrap();
        assert_eq!(path, dir.path().join("file.1.bin"));
        assert!(!resuming);
    }

    #[tokio::test]
    async fn resolve_output_path_resumes_the_most_recent_matching_control() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("file.bin"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("file.1.bin.paradl"), b"{}").await.unwrap();
        let (path, resuming) = resolve_output_path(dir.path(), "file.bin", false).await.unwrap();
        assert_eq!(path, dir.path().join("file.1.bin"));
        assert!(resuming);
    }

    #[tokio::test]
    async fn resolve_output_path_ignores_control_when_no_resume_is_set() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("file.bin"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("file.1.bin.paradl"), b"{}").await.unwrap();
        let (path, resuming) = resolve_output_path(dir.path(), "file.bin", true).await.unwrap();
        assert_eq!(path, dir.path().join("file.1.bin"));
        assert!(!resuming);
    }
}
