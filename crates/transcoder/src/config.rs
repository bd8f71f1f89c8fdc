use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Media file extensions considered for transcoding
pub const DEFAULT_MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "m4v", "mov", "avi", "ts", "webm"];

/// Configuration for a batch transcoding run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Directory tree to scan for media files
    pub source_root: PathBuf,
    /// Output frame height; also the skip criterion together with `target_codec`
    pub target_height: u32,
    /// Codec name as reported by ffprobe (e.g. "av1")
    pub target_codec: String,
    /// ffmpeg encoder implementation producing `target_codec` (e.g. "av1_nvenc")
    pub video_encoder: String,
    /// Constant-quality value passed as `-cq`
    pub quality: u32,
    /// Encoder speed/quality preset
    pub preset: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    /// Extension of the committed output, without the dot
    pub output_extension: String,
    /// Maximum allowed |source - output| duration in whole seconds
    pub duration_tolerance_secs: u64,
    /// Explicit concurrency; `None` auto-detects from the GPU
    pub max_concurrent: Option<usize>,
    pub media_extensions: Vec<String>,
    /// Extension of sidecar marker files (EDL)
    pub marker_extension: String,
    /// Prefix for the preserved original after a commit
    pub backup_prefix: String,
    /// Prefix for in-progress outputs and chapter metadata
    pub transient_prefix: String,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// GPU enumeration tool used to size the encoder pool
    pub gpu_query_bin: PathBuf,
    /// Audit log location; defaults to `<source_root>/av1batch.log`
    pub log_file: Option<PathBuf>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl BatchConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            source_root: PathBuf::from("."),
            target_height: 1080,
            target_codec: "av1".to_string(),
            video_encoder: "av1_nvenc".to_string(),
            quality: 30,
            preset: "p5".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "320k".to_string(),
            output_extension: "mp4".to_string(),
            duration_tolerance_secs: 5,
            max_concurrent: None,
            media_extensions: DEFAULT_MEDIA_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            marker_extension: "edl".to_string(),
            backup_prefix: "OLD_".to_string(),
            transient_prefix: "TEMP_".to_string(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            gpu_query_bin: PathBuf::from("nvidia-smi"),
            log_file: None,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Reject settings that would make every job fail or break the naming contract
    pub fn validate(&self) -> Result<()> {
        if self.target_height == 0 {
            bail!("target_height must be greater than 0");
        }
        if self.target_codec.trim().is_empty() || self.video_encoder.trim().is_empty() {
            bail!("target_codec and video_encoder must not be empty");
        }
        if self.output_extension.trim().is_empty() {
            bail!("output_extension must not be empty");
        }
        if self.backup_prefix.is_empty() || self.transient_prefix.is_empty() {
            bail!("backup_prefix and transient_prefix must not be empty");
        }
        if self.backup_prefix.eq_ignore_ascii_case(&self.transient_prefix) {
            bail!("backup_prefix and transient_prefix must differ");
        }
        if self.max_concurrent == Some(0) {
            bail!("max_concurrent must be at least 1");
        }
        Ok(())
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.source_root.join("av1batch.log"))
    }

    /// Case-insensitive media extension check
    pub fn is_media_extension(&self, ext: &str) -> bool {
        self.media_extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }

    /// Why a file name is never new work: it is a backup or a transient artifact
    pub fn reserved_name_reason(&self, file_name: &str) -> Option<&'static str> {
        if has_prefix_ignore_case(file_name, &self.backup_prefix) {
            Some("backup of an already processed file")
        } else if has_prefix_ignore_case(file_name, &self.transient_prefix) {
            Some("transient artifact of an in-flight or interrupted job")
        } else {
            None
        }
    }
}

fn has_prefix_ignore_case(name: &str, prefix: &str) -> bool {
    name.len() >= prefix.len()
        && name.is_char_boundary(prefix.len())
        && name[..prefix.len()].eq_ignore_ascii_case(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = BatchConfig::default_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.duration_tolerance_secs, 5);
        assert!(cfg.is_media_extension("WEBM"));
        assert!(cfg.max_concurrent.is_none());
    }

    #[test]
    fn reserved_names_are_case_insensitive() {
        let cfg = BatchConfig::default_config();
        assert!(cfg.reserved_name_reason("OLD_clip.mkv").is_some_and(|r| r.starts_with("backup")));
        assert!(cfg.reserved_name_reason("old_clip.mkv").is_some());
        assert!(cfg.reserved_name_reason("TEMP_clip.mp4").is_some_and(|r| r.starts_with("transient")));
        assert!(cfg.reserved_name_reason("clip.mkv").is_none());
        assert!(cfg.reserved_name_reason("OL").is_none());
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let mut cfg = BatchConfig::default_config();
        cfg.max_concurrent = Some(0);
        assert!(cfg.validate().is_err());

        let mut cfg = BatchConfig::default_config();
        cfg.transient_prefix = "old_".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = BatchConfig::default_config();
        cfg.target_height = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "target_height = 720\nmax_concurrent = 3").unwrap();
        drop(f);

        let cfg = BatchConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.target_height, 720);
        assert_eq!(cfg.max_concurrent, Some(3));
        assert_eq!(cfg.target_codec, "av1");
        assert_eq!(cfg.backup_prefix, "OLD_");
    }

    #[test]
    fn json_config_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(&path, r#"{"output_extension": "mkv", "quality": 24}"#).unwrap();

        let cfg = BatchConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.output_extension, "mkv");
        assert_eq!(cfg.quality, 24);

        let missing = BatchConfig::load_config(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(missing.output_extension, "mp4");
    }

    #[test]
    fn log_path_defaults_under_root() {
        let mut cfg = BatchConfig::default_config();
        cfg.source_root = PathBuf::from("/media/rec");
        assert_eq!(cfg.log_path(), PathBuf::from("/media/rec/av1batch.log"));
        cfg.log_file = Some(PathBuf::from("/var/log/b.log"));
        assert_eq!(cfg.log_path(), PathBuf::from("/var/log/b.log"));
    }
}
