use anyhow::{Context, Result};
use clap::Parser;
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use transcoder::{
    config::BatchConfig,
    pipeline::{format_elapsed, Toolchain},
    capability, scan, scheduler, JobLog, RunSummary,
};

/// Batch-transcode a media library to AV1
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Library root to scan (overrides `source_root` from the config)
    root: Option<PathBuf>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target output height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// Codec name the verified output must report
    #[arg(long)]
    codec: Option<String>,

    /// ffmpeg video encoder
    #[arg(long)]
    encoder: Option<String>,

    /// Constant-quality value passed to the encoder
    #[arg(long)]
    quality: Option<u32>,

    #[arg(long)]
    preset: Option<String>,

    /// Output container extension
    #[arg(long = "ext")]
    output_extension: Option<String>,

    /// Allowed duration drift in seconds
    #[arg(long)]
    tolerance: Option<u64>,

    /// Concurrent encodes; skips GPU detection
    #[arg(short = 'j', long)]
    max_concurrent: Option<usize>,

    /// Audit log path
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, cfg: &mut BatchConfig) {
        if let Some(root) = &self.root {
            cfg.source_root = root.clone();
        }
        if let Some(height) = self.height {
            cfg.target_height = height;
        }
        if let Some(codec) = &self.codec {
            cfg.target_codec = codec.clone();
        }
        if let Some(encoder) = &self.encoder {
            cfg.video_encoder = encoder.clone();
        }
        if let Some(quality) = self.quality {
            cfg.quality = quality;
        }
        if let Some(preset) = &self.preset {
            cfg.preset = preset.clone();
        }
        if let Some(ext) = &self.output_extension {
            cfg.output_extension = ext.trim_start_matches('.').to_string();
        }
        if let Some(tolerance) = self.tolerance {
            cfg.duration_tolerance_secs = tolerance;
        }
        if self.max_concurrent.is_some() {
            cfg.max_concurrent = self.max_concurrent;
        }
        if let Some(log_file) = &self.log_file {
            cfg.log_file = Some(log_file.clone());
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    match run(args).await {
        Ok(summary) if summary.is_clean() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<RunSummary> {
    let started = Instant::now();

    let mut cfg = BatchConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    args.apply(&mut cfg);
    cfg.validate().context("Invalid configuration")?;

    info!("AV1 batch starting");
    info!("  Source root: {}", cfg.source_root.display());
    info!("  Target: {} {}p via {} (preset {}, cq {})",
        cfg.target_codec, cfg.target_height, cfg.video_encoder, cfg.preset, cfg.quality);
    info!("  Output extension: .{}", cfg.output_extension);
    info!("  Duration tolerance: {}s", cfg.duration_tolerance_secs);

    let sink = JobLog::open(&cfg.log_path())?;
    info!("  Audit log: {}", sink.path().display());
    let run_log = sink.unit("run");

    let budget = match capability::resolve_budget(&cfg).await {
        Ok(budget) => budget,
        Err(e) => {
            run_log.error(format!("ResolutionError: {}", e)).await;
            return Err(e).context("Could not determine encoder session budget; pass --max-concurrent to skip detection");
        }
    };
    run_log.info(format!("Session budget: {} ({:?})", budget.sessions, budget.source)).await;

    let cfg = Arc::new(cfg);

    let removed = cleanup_orphaned_transients(Arc::clone(&cfg)).await?;
    if removed > 0 {
        run_log.info(format!("Removed {} orphaned transient file(s)", removed)).await;
    }

    let scanned = tokio::task::spawn_blocking({
        let cfg = Arc::clone(&cfg);
        move || scan::scan_library(&cfg)
    })
    .await
    .context("Library scan task failed")??;

    let mut candidates = Vec::new();
    for result in scanned {
        match result {
            scan::ScanResult::Candidate(media) => candidates.push(media),
            scan::ScanResult::Skipped(path, reason) => {
                debug!("Not a candidate: {} ({})", path.display(), reason);
            }
        }
    }
    run_log.info(format!("Found {} candidate file(s)", candidates.len())).await;

    let cancel = CancellationToken::new();
    spawn_shutdown_watch(cancel.clone()).context("Failed to install signal handlers")?;

    let tools = Arc::new(Toolchain::new(Arc::clone(&cfg)));
    let summary = scheduler::run_batch(tools, candidates, budget.sessions, Arc::clone(&sink), cancel.clone()).await;

    let saved = if summary.new_bytes <= summary.original_bytes {
        format!("saved {}", format_size(summary.original_bytes - summary.new_bytes, DECIMAL))
    } else {
        format!("grew by {}", format_size(summary.new_bytes - summary.original_bytes, DECIMAL))
    };
    run_log
        .info(format!(
            "Run finished in {}: {} committed, {} skipped, {} rolled back, {} failed, {} cancelled; {}",
            format_elapsed(started.elapsed()),
            summary.committed,
            summary.skipped,
            summary.rolled_back,
            summary.failed,
            summary.cancelled,
            saved
        ))
        .await;

    if cancel.is_cancelled() && summary.cancelled == 0 {
        // interrupted after the last admission; still a cancelled run
        return Ok(RunSummary { cancelled: 1, ..summary });
    }
    Ok(summary)
}

/// Cancel the run on SIGINT, or on SIGTERM where that exists.
///
/// On unix both handlers are installed before this returns, so a signal arriving at any
/// later point kills running encoders and lets every job clean up.
fn spawn_shutdown_watch(cancel: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    let (mut interrupt, mut terminate) = (signal(SignalKind::interrupt())?, signal(SignalKind::terminate())?);

    Ok(tokio::spawn(async move {
        #[cfg(unix)]
        let received: std::io::Result<&str> = tokio::select! {
            _ = interrupt.recv() => Ok("SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        };
        #[cfg(not(unix))]
        let received = tokio::signal::ctrl_c().await.map(|_| "Interrupt");

        match received {
            Ok(name) => {
                warn!("{} received, stopping encoders and cleaning up", name);
                cancel.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signals: {}", e),
        }
    }))
}

/// Delete transient artifacts left behind by an interrupted run
async fn cleanup_orphaned_transients(cfg: Arc<BatchConfig>) -> Result<usize> {
    info!("🔍 Checking for orphaned transient files...");

    let orphans = tokio::task::spawn_blocking(move || scan::find_orphaned_transients(&cfg))
        .await
        .context("Failed to scan for transient files")?;

    let mut cleaned_count = 0;
    for orphan in orphans {
        match std::fs::remove_file(&orphan) {
            Ok(()) => {
                info!("🗑️  Deleted orphaned transient file: {}", orphan.display());
                cleaned_count += 1;
            }
            Err(e) => warn!("Failed to delete orphaned transient file {}: {}", orphan.display(), e),
        }
    }

    if cleaned_count == 0 {
        debug!("No orphaned transient files found");
    }
    Ok(cleaned_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "av1batch", "/media/library", "--height", "720", "--ext", ".mkv", "-j", "2", "--tolerance", "3",
        ]);
        let mut cfg = BatchConfig::default_config();
        args.apply(&mut cfg);

        assert_eq!(cfg.source_root, PathBuf::from("/media/library"));
        assert_eq!(cfg.target_height, 720);
        assert_eq!(cfg.output_extension, "mkv");
        assert_eq!(cfg.max_concurrent, Some(2));
        assert_eq!(cfg.duration_tolerance_secs, 3);
        assert_eq!(cfg.video_encoder, "av1_nvenc");
    }

    #[test]
    fn test_no_flags_keeps_config() {
        let args = Args::parse_from(["av1batch"]);
        let mut cfg = BatchConfig::default_config();
        cfg.max_concurrent = Some(4);
        args.apply(&mut cfg);
        assert_eq!(cfg.max_concurrent, Some(4));
        assert_eq!(cfg.source_root, PathBuf::from("."));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_cancels_run() {
        let cancel = CancellationToken::new();
        let watch = spawn_shutdown_watch(cancel.clone()).unwrap();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(std::time::Duration::from_secs(5), cancel.cancelled())
            .await
            .unwrap();
        watch.await.unwrap();
    }

    #[tokio::test]
    async fn test_orphans_removed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("TEMP_a.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("temp_notes.txt"), b"mine").unwrap();
        std::fs::write(dir.path().join("a.mkv"), b"keep").unwrap();
        let cfg = BatchConfig {
            source_root: dir.path().to_path_buf(),
            ..Default::default()
        };

        assert_eq!(cleanup_orphaned_transients(Arc::new(cfg)).await.unwrap(), 1);
        assert!(dir.path().join("a.mkv").exists());
        assert!(!dir.path().join("TEMP_a.mp4").exists());
        assert!(dir.path().join("temp_notes.txt").exists());
    }
}
