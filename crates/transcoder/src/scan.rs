use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use walkdir::WalkDir;
use crate::config::BatchConfig;
use log::{debug, info, warn};

/// Snapshot of a media file taken at discovery time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub path: PathBuf,
    pub dir: PathBuf,
    /// File name without extension
    pub base_name: String,
    pub extension: String,
    pub size: u64,
}

impl MediaFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        let path = std::path::absolute(path)
            .with_context(|| format!("Failed to resolve path: {}", path.display()))?;
        let dir = path
            .parent()
            .context("Media file has no parent directory")?
            .to_path_buf();
        let base_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .context("Media file has no UTF-8 base name")?
            .to_string();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let size = std::fs::metadata(&path)
            .with_context(|| format!("Failed to stat file: {}", path.display()))?
            .len();

        Ok(Self {
            path,
            dir,
            base_name,
            extension,
            size,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Where the original is kept after a commit
    pub fn backup_path(&self, cfg: &BatchConfig) -> PathBuf {
        self.dir.join(format!("{}{}", cfg.backup_prefix, self.file_name()))
    }

    /// Encoder output while the job is in flight
    pub fn transient_output_path(&self, cfg: &BatchConfig) -> PathBuf {
        self.dir.join(format!(
            "{}{}.{}",
            cfg.transient_prefix, self.base_name, cfg.output_extension
        ))
    }

    /// FFMETADATA chapter document consumed by the encoder
    pub fn chapter_artifact_path(&self, cfg: &BatchConfig) -> PathBuf {
        self.dir
            .join(format!("{}{}.ffmetadata", cfg.transient_prefix, self.base_name))
    }

    /// Name the encoded output is promoted to
    pub fn final_path(&self, cfg: &BatchConfig) -> PathBuf {
        self.dir
            .join(format!("{}.{}", self.base_name, cfg.output_extension))
    }

    /// The final path, if a file other than this source already holds it
    pub fn occupied_final_path(&self, cfg: &BatchConfig) -> Option<PathBuf> {
        let final_path = self.final_path(cfg);
        (final_path != self.path && final_path.exists()).then_some(final_path)
    }
}

/// Result of scanning a file
#[derive(Debug, Clone)]
pub enum ScanResult {
    /// File should be processed
    Candidate(MediaFile),
    /// File should be skipped (path, reason)
    Skipped(PathBuf, String),
}

/// Walk the source root and classify every media file.
///
/// Entries are visited in file-name order so the job list, and therefore
/// admission order, is stable between runs over the same tree.
pub fn scan_library(cfg: &BatchConfig) -> Result<Vec<ScanResult>> {
    let root = &cfg.source_root;
    if !root.exists() {
        anyhow::bail!("Source root does not exist: {}", root.display());
    }

    info!("Scanning directory: {}", root.display());

    let mut results = Vec::new();
    let mut files_checked = 0;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }
        files_checked += 1;

        let path = entry.path();
        let is_media = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| cfg.is_media_extension(ext));
        if !is_media {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy();
        if let Some(reason) = cfg.reserved_name_reason(&file_name) {
            results.push(ScanResult::Skipped(path.to_path_buf(), reason.to_string()));
            continue;
        }

        match MediaFile::from_path(path) {
            Ok(media) => {
                debug!("Found candidate: {} ({} bytes)", path.display(), media.size);
                results.push(ScanResult::Candidate(media));
            }
            Err(e) => {
                warn!("Skipping {}: {:#}", path.display(), e);
                results.push(ScanResult::Skipped(path.to_path_buf(), format!("{:#}", e)));
            }
        }
    }

    let candidates = results
        .iter()
        .filter(|r| matches!(r, ScanResult::Candidate(_)))
        .count();
    info!(
        "Scan complete: checked {} files, {} candidates, {} skipped",
        files_checked,
        candidates,
        results.len() - candidates
    );
    Ok(results)
}

/// Transient artifacts left behind by an interrupted run.
///
/// Only names this tool produces qualify: the exact transient prefix followed
/// by a stem and either the output extension or `.ffmetadata`.
pub fn find_orphaned_transients(cfg: &BatchConfig) -> Vec<PathBuf> {
    WalkDir::new(&cfg.source_root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_transient_artifact_name(&e.file_name().to_string_lossy(), cfg))
        .map(|e| e.into_path())
        .collect()
}

fn is_transient_artifact_name(file_name: &str, cfg: &BatchConfig) -> bool {
    let Some(rest) = file_name.strip_prefix(cfg.transient_prefix.as_str()) else {
        return false;
    };
    let Some((stem, ext)) = rest.rsplit_once('.') else {
        return false;
    };
    !stem.is_empty() && (ext == cfg.output_extension || ext == "ffmetadata")
}
