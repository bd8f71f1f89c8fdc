//! Locating the EDL marker file that belongs to a recording.
//!
//! Recorders name marker exports after the session, so a recording `clip.mkv`
//! usually has `clip.edl` next to it. When the names drifted (a trailing
//! counter or timestamp on one side) the file with the longest shared prefix
//! is used, provided the prefix covers more than 80% of the recording's name.

use std::path::{Path, PathBuf};
use log::{debug, warn};
use crate::scan::MediaFile;

/// A candidate must share strictly more than this fraction of the base name
pub const MIN_PREFIX_RATIO: f64 = 0.8;

/// Number of leading characters the two names have in common
pub fn prefix_score(base_name: &str, candidate: &str) -> usize {
    base_name
        .chars()
        .zip(candidate.chars())
        .take_while(|(a, b)| a == b)
        .count()
}

/// Pick the best candidate stem for `base_name`.
///
/// Candidates are considered in the order given; a later candidate only
/// replaces the current best with a strictly higher raw score.
pub fn select_best<'a, T>(base_name: &str, candidates: &'a [(String, T)]) -> Option<&'a T> {
    let base_len = base_name.chars().count();
    if base_len == 0 {
        return None;
    }

    let mut best: Option<(usize, &T)> = None;
    for (stem, item) in candidates {
        let score = prefix_score(base_name, stem);
        let ratio = score as f64 / base_len as f64;
        if ratio <= MIN_PREFIX_RATIO {
            continue;
        }
        if best.map_or(true, |(best_score, _)| score > best_score) {
            best = Some((score, item));
        }
    }
    best.map(|(_, item)| item)
}

/// Find the marker file for `media`: an exact-name sidecar if present,
/// otherwise the best prefix match among marker files in the same directory.
pub fn find_marker_file(media: &MediaFile, marker_ext: &str) -> Option<PathBuf> {
    let exact = media.dir.join(format!("{}.{}", media.base_name, marker_ext));
    if exact.is_file() {
        debug!("Exact marker file for {}: {}", media.file_name(), exact.display());
        return Some(exact);
    }

    let candidates = marker_candidates(&media.dir, marker_ext);
    let found = select_best(&media.base_name, &candidates).cloned();
    match &found {
        Some(path) => debug!("Prefix-matched marker file for {}: {}", media.file_name(), path.display()),
        None => debug!("No marker file for {}", media.file_name()),
    }
    found
}

/// Marker files in `dir` as (stem, path), sorted by file name
fn marker_candidates(dir: &Path, marker_ext: &str) -> Vec<(String, PathBuf)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to list {} for marker files: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut candidates: Vec<(String, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(marker_ext))
        })
        .filter_map(|p| {
            let stem = p.file_stem()?.to_str()?.to_string();
            Some((stem, p))
        })
        .collect();
    candidates.sort_by(|a, b| a.1.cmp(&b.1));
    candidates
}
