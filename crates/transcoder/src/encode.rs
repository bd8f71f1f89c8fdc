use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use crate::config::BatchConfig;
use crate::error::EncodeError;

/// Lines of encoder stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Inputs and output of one encode
#[derive(Debug, Clone, Copy)]
pub struct EncodeRequest<'a> {
    pub input: &'a Path,
    /// FFMETADATA document whose chapters are adopted by the output
    pub chapters: Option<&'a Path>,
    pub output: &'a Path,
}

/// Build the ffmpeg argument vector for a transcode.
///
/// - first video stream, every audio and subtitle stream (both optional)
/// - video scaled to the target height, width following the aspect ratio
/// - audio re-encoded; stream-copied audio has produced broken outputs when
///   the container changes
/// - subtitles copied
pub fn build_encode_args(cfg: &BatchConfig, req: &EncodeRequest<'_>) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-y", "-v", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    args.push("-i".to_string());
    args.push(req.input.to_string_lossy().to_string());

    if let Some(chapters) = req.chapters {
        args.push("-i".to_string());
        args.push(chapters.to_string_lossy().to_string());
        args.push("-map_chapters".to_string());
        args.push("1".to_string());
    }

    args.push("-map".to_string());
    args.push("0:v:0".to_string());
    args.push("-map".to_string());
    args.push("0:a?".to_string());
    args.push("-map".to_string());
    args.push("0:s?".to_string());

    args.push("-c:v".to_string());
    args.push(cfg.video_encoder.clone());
    args.push("-preset".to_string());
    args.push(cfg.preset.clone());
    args.push("-cq".to_string());
    args.push(cfg.quality.to_string());
    args.push("-vf".to_string());
    args.push(format!("scale=-2:{}", cfg.target_height));

    args.push("-c:a".to_string());
    args.push(cfg.audio_codec.clone());
    args.push("-b:a".to_string());
    args.push(cfg.audio_bitrate.clone());

    args.push("-c:s".to_string());
    args.push("copy".to_string());

    args.push(req.output.to_string_lossy().to_string());
    args
}

/// Runs the ffmpeg binary
#[derive(Debug, Clone)]
pub struct Encoder {
    ffmpeg_bin: PathBuf,
}

impl Encoder {
    pub fn new(ffmpeg_bin: PathBuf) -> Self {
        Self { ffmpeg_bin }
    }

    /// Run ffmpeg to completion, or kill it when `cancel` fires.
    ///
    /// There is no timeout: long sources legitimately take hours.
    pub async fn run(&self, args: &[String], cancel: &CancellationToken) -> Result<(), EncodeError> {
        let program = self.ffmpeg_bin.display().to_string();
        debug!("Executing encoder: {} {}", program, args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EncodeError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>().join("\n")
            })
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(EncodeError::Wait)?,
            _ = cancel.cancelled() => {
                warn!("Cancellation requested, killing encoder {}", program);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill encoder {}: {}", program, e);
                }
                return Err(EncodeError::Cancelled);
            }
        };

        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            Ok(())
        } else {
            Err(EncodeError::Exit {
                code: status.code(),
                stderr_tail,
            })
        }
    }
}
