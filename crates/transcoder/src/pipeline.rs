//! Per-file job: probe, skip-check, chapters, encode, verify, commit/rollback,
//! cleanup.
//!
//! A job touches only its own source file and the transient artifacts derived
//! from it. Cleanup runs on every path, including cancellation; the
//! [`TransientArtifacts`] guard also removes leftovers if the job future is
//! dropped mid-encode.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use humansize::{format_size, DECIMAL};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::chapters;
use crate::commit::{commit, CommitPlan};
use crate::config::BatchConfig;
use crate::encode::{build_encode_args, EncodeRequest, Encoder};
use crate::error::{EncodeError, JobError, VerificationError};
use crate::ffprobe::{ProbeResult, Prober};
use crate::joblog::{JobLog, UnitLog};
use crate::markers;
use crate::scan::MediaFile;
use crate::verify::verify_output;

/// External tools and settings shared read-only by every job
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub cfg: Arc<BatchConfig>,
    pub prober: Prober,
    pub encoder: Encoder,
}

impl Toolchain {
    pub fn new(cfg: Arc<BatchConfig>) -> Self {
        Self {
            prober: Prober::new(cfg.ffprobe_bin.clone()),
            encoder: Encoder::new(cfg.ffmpeg_bin.clone()),
            cfg,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Discovered,
    Probed,
    Skipped,
    MarkersBuilt,
    Encoding,
    Verifying,
    Committed,
    RolledBack,
    Cleaned,
}

/// Figures for the audit line of a committed job
#[derive(Debug, Clone)]
pub struct CommitReport {
    pub original_bytes: u64,
    /// `None` when the output could not be measured
    pub new_bytes: Option<u64>,
    pub chapters: usize,
    pub elapsed: Duration,
    pub backup_path: PathBuf,
    pub final_path: PathBuf,
}

#[derive(Debug)]
pub enum JobOutcome {
    Skipped { reason: String },
    Committed(CommitReport),
    RolledBack(VerificationError),
    Failed(JobError),
    Cancelled,
}

/// Transient output and chapter metadata of one job
#[derive(Debug)]
pub struct TransientArtifacts {
    pub output: PathBuf,
    pub chapters: PathBuf,
}

impl TransientArtifacts {
    /// Remove whatever still exists; safe to call repeatedly
    pub fn clean(&self) -> Vec<PathBuf> {
        [&self.output, &self.chapters]
            .into_iter()
            .filter(|p| remove_if_present(p))
            .cloned()
            .collect()
    }
}

impl Drop for TransientArtifacts {
    fn drop(&mut self) {
        self.clean();
    }
}

fn remove_if_present(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            log::warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}

/// Unit of work for one media file
#[derive(Debug)]
pub struct EncodeJob {
    id: String,
    media: MediaFile,
    state: JobState,
    artifacts: TransientArtifacts,
    source_probe: Option<ProbeResult>,
    output_probe: Option<ProbeResult>,
}

impl EncodeJob {
    pub fn new(media: MediaFile, cfg: &BatchConfig) -> Self {
        let id = format!("job-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let artifacts = TransientArtifacts {
            output: media.transient_output_path(cfg),
            chapters: media.chapter_artifact_path(cfg),
        };
        Self {
            id,
            media,
            state: JobState::Discovered,
            artifacts,
            source_probe: None,
            output_probe: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Drive the job to a terminal state, then clean up
    pub async fn run(mut self, tools: &Toolchain, sink: &Arc<JobLog>, cancel: &CancellationToken) -> JobOutcome {
        let log = sink.unit(self.id.clone());
        let started = Instant::now();
        log.info(format!("Starting {}", self.media.path.display())).await;

        let outcome = self.drive(tools, &log, cancel, started).await;
        self.report(&log, &outcome).await;

        for removed in self.artifacts.clean() {
            log.debug(format!("Removed transient artifact {}", removed.display())).await;
        }
        self.transition(&log, JobState::Cleaned).await;
        outcome
    }

    async fn transition(&mut self, log: &UnitLog, next: JobState) {
        log.debug(format!("{:?} -> {:?}", self.state, next)).await;
        self.state = next;
    }

    async fn drive(
        &mut self,
        tools: &Toolchain,
        log: &UnitLog,
        cancel: &CancellationToken,
        started: Instant,
    ) -> JobOutcome {
        let cfg = &tools.cfg;

        if cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        let source = match tools.prober.probe(&self.media.path).await {
            Ok(p) => p,
            Err(e) => return JobOutcome::Failed(e.into()),
        };
        self.source_probe = Some(source.clone());
        self.transition(log, JobState::Probed).await;

        if source.codec == cfg.target_codec && source.height == cfg.target_height {
            self.transition(log, JobState::Skipped).await;
            return JobOutcome::Skipped {
                reason: format!("already {} at {}p", source.codec, source.height),
            };
        }

        if let Some(occupied) = self.media.occupied_final_path(cfg) {
            self.transition(log, JobState::Skipped).await;
            return JobOutcome::Skipped {
                reason: format!("output {} already exists", occupied.display()),
            };
        }

        let chapter_count = self.build_chapters(cfg, log, &source).await;
        self.transition(log, JobState::MarkersBuilt).await;

        if cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        let args = build_encode_args(
            cfg,
            &EncodeRequest {
                input: &self.media.path,
                chapters: chapter_count.map(|_| self.artifacts.chapters.as_path()),
                output: &self.artifacts.output,
            },
        );
        self.transition(log, JobState::Encoding).await;
        log.info(format!(
            "Encoding {}: {} {}p -> {} {}p ({}s, {} audio stream(s))",
            self.media.file_name(),
            source.codec,
            source.height,
            cfg.target_codec,
            cfg.target_height,
            source.duration_secs,
            source.audio_streams
        ))
        .await;

        match tools.encoder.run(&args, cancel).await {
            Ok(()) => {}
            Err(EncodeError::Cancelled) => return JobOutcome::Cancelled,
            Err(e) => {
                self.transition(log, JobState::RolledBack).await;
                return JobOutcome::Failed(e.into());
            }
        }

        self.transition(log, JobState::Verifying).await;
        let output = match tools.prober.probe(&self.artifacts.output).await {
            Ok(p) => p,
            Err(e) => {
                self.transition(log, JobState::RolledBack).await;
                return JobOutcome::Failed(e.into());
            }
        };
        let verdict = verify_output(&source, &output, cfg);
        self.output_probe = Some(output);

        if let Err(verdict) = verdict {
            self.transition(log, JobState::RolledBack).await;
            return JobOutcome::RolledBack(verdict);
        }

        if let Some(expected) = chapter_count {
            match tools.prober.count_chapters(&self.artifacts.output).await {
                Ok(found) if found != expected => {
                    log.warn(format!("Output carries {} chapter(s), {} were injected", found, expected))
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    log.warn(format!("Could not count output chapters: {}", e)).await;
                }
            }
        }

        if cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        let new_bytes = match std::fs::metadata(&self.artifacts.output) {
            Ok(m) => Some(m.len()),
            Err(e) => {
                log.warn(format!("Could not stat {}: {}", self.artifacts.output.display(), e)).await;
                None
            }
        };
        let plan = CommitPlan {
            source: self.media.path.clone(),
            transient: self.artifacts.output.clone(),
            backup: self.media.backup_path(cfg),
            final_path: self.media.final_path(cfg),
        };
        if let Err(e) = commit(&plan) {
            return JobOutcome::Failed(e.into());
        }
        self.transition(log, JobState::Committed).await;

        JobOutcome::Committed(CommitReport {
            original_bytes: self.media.size,
            new_bytes,
            chapters: chapter_count.unwrap_or(0),
            elapsed: started.elapsed(),
            backup_path: plan.backup,
            final_path: plan.final_path,
        })
    }

    /// Locate a marker file and write the chapter artifact; `None` means no chapters
    async fn build_chapters(&self, cfg: &BatchConfig, log: &UnitLog, source: &ProbeResult) -> Option<usize> {
        let Some(marker) = markers::find_marker_file(&self.media, &cfg.marker_extension) else {
            log.info(format!("No marker file for {}", self.media.file_name())).await;
            return None;
        };

        match chapters::build_chapter_artifact(&marker, source.frame_rate, &self.artifacts.chapters) {
            Ok(Some(count)) => {
                log.info(format!("Built {} chapter(s) from {}", count, marker.display())).await;
                Some(count)
            }
            Ok(None) => {
                log.info(format!("Marker file {} has no entries, encoding without chapters", marker.display()))
                    .await;
                None
            }
            Err(e) => {
                log.warn(format!("{:#}; encoding without chapters", e)).await;
                None
            }
        }
    }

    /// e.g. "h264 2160p -> av1 1080p", from whatever has been probed so far
    fn stream_change(&self) -> String {
        let describe = |p: &Option<ProbeResult>| {
            p.as_ref()
                .map_or_else(|| "?".to_string(), |p| format!("{} {}p", p.codec, p.height))
        };
        format!("{} -> {}", describe(&self.source_probe), describe(&self.output_probe))
    }

    async fn report(&self, log: &UnitLog, outcome: &JobOutcome) {
        let name = self.media.file_name();
        match outcome {
            JobOutcome::Skipped { reason } => {
                log.info(format!("Skipped {}: {}", name, reason)).await;
            }
            JobOutcome::Committed(r) => {
                log.info(format!(
                    "Committed {} -> {} ({}): {} -> {} ({}) in {}, {} chapter(s), original kept as {}",
                    name,
                    r.final_path.display(),
                    self.stream_change(),
                    format_size(r.original_bytes, DECIMAL),
                    r.new_bytes.map_or_else(|| "unknown size".to_string(), |n| format_size(n, DECIMAL)),
                    size_delta(r.original_bytes, r.new_bytes),
                    format_elapsed(r.elapsed),
                    r.chapters,
                    r.backup_path.display()
                ))
                .await;
            }
            JobOutcome::RolledBack(v) => {
                log.warn(format!("Rolled back {} ({}): {}", name, self.stream_change(), v)).await;
            }
            JobOutcome::Failed(e @ JobError::Commit(_)) => {
                log.error(format!(
                    "CommitError for {} (check source and backup names by hand): {}",
                    name, e
                ))
                .await;
            }
            JobOutcome::Failed(e) => {
                log.error(format!("{} for {}: {}", e.kind(), name, e)).await;
            }
            JobOutcome::Cancelled => {
                log.warn(format!("Cancelled {} in state {:?}", name, self.state)).await;
            }
        }
    }
}

fn size_delta(original: u64, new: Option<u64>) -> String {
    let Some(new) = new else {
        return "saving unknown".to_string();
    };
    if new <= original {
        let pct = if original > 0 {
            (original - new) as f64 * 100.0 / original as f64
        } else {
            0.0
        };
        format!("saved {}, {:.1}%", format_size(original - new, DECIMAL), pct)
    } else {
        format!("grew by {}", format_size(new - original, DECIMAL))
    }
}

pub fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}
