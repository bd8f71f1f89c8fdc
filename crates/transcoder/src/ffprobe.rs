use std::path::{Path, PathBuf};
use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::process::Command;
use crate::error::ProbeError;

/// Subset of ffprobe's JSON document we ask for
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: Option<i32>,
    pub codec_name: Option<String>,
    pub height: Option<u32>,
    pub r_frame_rate: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FFProbeChapters {
    #[serde(default)]
    chapters: Vec<serde_json::Value>,
}

/// Frame rate as reported by ffprobe, e.g. 30000/1001
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    /// Parse "num/den" (a bare integer is accepted as num/1)
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        match s.split_once('/') {
            Some((num, den)) => Some(FrameRate {
                num: num.trim().parse().ok()?,
                den: den.trim().parse().ok()?,
            }),
            None => Some(FrameRate {
                num: s.parse().ok()?,
                den: 1,
            }),
        }
    }

    /// Frames per second, `None` for degenerate rates such as 0/0
    pub fn as_f64(&self) -> Option<f64> {
        if self.num == 0 || self.den == 0 {
            None
        } else {
            Some(self.num as f64 / self.den as f64)
        }
    }
}

/// What the pipeline needs to know about one media file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub codec: String,
    pub height: u32,
    pub frame_rate: FrameRate,
    /// Container duration rounded to whole seconds
    pub duration_secs: u64,
    pub audio_streams: usize,
}

/// Runs ffprobe against media files
#[derive(Debug, Clone)]
pub struct Prober {
    ffprobe_bin: PathBuf,
}

impl Prober {
    pub fn new(ffprobe_bin: PathBuf) -> Self {
        Self { ffprobe_bin }
    }

    /// Inspect the first video stream, container duration and audio stream count
    pub async fn probe(&self, file_path: &Path) -> Result<ProbeResult, ProbeError> {
        if !file_path.exists() {
            return Err(ProbeError::Missing {
                path: file_path.to_path_buf(),
            });
        }

        let video_json = self
            .run(
                file_path,
                &[
                    "-select_streams",
                    "v:0",
                    "-show_entries",
                    "stream=codec_name,height,r_frame_rate:format=duration",
                ],
            )
            .await?;
        let audio_json = self
            .run(file_path, &["-select_streams", "a", "-show_entries", "stream=index"])
            .await?;

        let video: FFProbeData = parse_json(file_path, &video_json)?;
        let audio: FFProbeData = parse_json(file_path, &audio_json)?;

        let result = probe_result_from(file_path, &video, &audio)?;
        debug!(
            "ffprobe {}: codec={} height={} fps={}/{} duration={}s audio={}",
            file_path.display(),
            result.codec,
            result.height,
            result.frame_rate.num,
            result.frame_rate.den,
            result.duration_secs,
            result.audio_streams
        );
        Ok(result)
    }

    /// Number of chapters embedded in a container
    pub async fn count_chapters(&self, file_path: &Path) -> Result<usize, ProbeError> {
        let json = self.run(file_path, &["-show_chapters"]).await?;
        let chapters: FFProbeChapters = parse_json(file_path, &json)?;
        Ok(chapters.chapters.len())
    }

    async fn run(&self, file_path: &Path, selectors: &[&str]) -> Result<String, ProbeError> {
        let tool = self.ffprobe_bin.display().to_string();

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .args(selectors)
            .arg("-of")
            .arg("json")
            .arg(file_path)
            .output()
            .await
            .map_err(|source| ProbeError::Spawn {
                tool: tool.clone(),
                path: file_path.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Exit {
                tool,
                path: file_path.to_path_buf(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8(output.stdout).map_err(|_| ProbeError::Malformed {
            path: file_path.to_path_buf(),
            reason: "ffprobe output is not valid UTF-8".to_string(),
        })
    }
}

fn parse_json<T: DeserializeOwned>(file_path: &Path, json: &str) -> Result<T, ProbeError> {
    serde_json::from_str(json).map_err(|e| ProbeError::Malformed {
        path: file_path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Combine the video/format document and the audio-stream document
pub fn probe_result_from(
    file_path: &Path,
    video: &FFProbeData,
    audio: &FFProbeData,
) -> Result<ProbeResult, ProbeError> {
    let malformed = |reason: &str| ProbeError::Malformed {
        path: file_path.to_path_buf(),
        reason: reason.to_string(),
    };

    let stream = video.streams.first().ok_or_else(|| malformed("no video stream"))?;
    let codec = stream
        .codec_name
        .clone()
        .ok_or_else(|| malformed("video stream has no codec_name"))?;
    let height = stream.height.ok_or_else(|| malformed("video stream has no height"))?;
    let frame_rate = stream
        .r_frame_rate
        .as_deref()
        .and_then(FrameRate::parse)
        .ok_or_else(|| malformed("video stream has no parsable r_frame_rate"))?;

    let duration = video
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| malformed("container has no duration"))?;

    Ok(ProbeResult {
        codec,
        height,
        frame_rate,
        duration_secs: duration.round() as u64,
        audio_streams: audio.streams.len(),
    })
}
