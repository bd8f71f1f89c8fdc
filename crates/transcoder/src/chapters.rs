//! EDL marker entries to FFMETADATA chapters.
//!
//! Entry lines look like
//!
//! ```text
//! 001  AX       V     C        00:00:05:12 00:00:09:00 00:00:05:12 00:00:09:00
//! * LOC: 00:00:05:12 RED     Intro
//! ```
//!
//! The first timecode pair of an entry line gives the chapter range. A `* LOC:`
//! or `* COMMENT:` line directly after an entry names the chapter.

use std::fmt::Write as _;
use std::path::Path;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use crate::ffprobe::FrameRate;

static ENTRY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\d+\s+.*?(\d{2}:\d{2}:\d{2}[:;]\d{2})\s+(\d{2}:\d{2}:\d{2}[:;]\d{2})")
        .expect("entry pattern is valid")
});

static ANNOTATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\*\s*(?:LOC|COMMENT):\s*(.*?)\s*$").expect("annotation pattern is valid")
});

static TIMECODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{2}):(\d{2}):(\d{2})[:;](\d{2})$").expect("timecode pattern is valid")
});

/// Timecode-like prefix on annotation labels, optionally followed by a marker colour
static LABEL_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\d{2}:\d{2}:\d{2}[:;]\d{2}(?:\s+(?:RED|GREEN|BLUE|CYAN|MAGENTA|YELLOW|WHITE|BLACK|ORANGE|PINK|PURPLE)\b)?\s*",
    )
    .expect("label prefix pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterEntry {
    pub start_ms: u64,
    pub end_ms: u64,
    pub title: String,
}

/// Convert `HH:MM:SS:FF` (or `;FF`) to milliseconds; anything else is 0
pub fn timecode_to_ms(tc: &str, frame_rate: FrameRate) -> u64 {
    let Some(caps) = TIMECODE_RE.captures(tc.trim()) else {
        return 0;
    };
    let field = |i: usize| caps[i].parse::<u64>().unwrap_or(0) as f64;

    let seconds = field(1) * 3600.0 + field(2) * 60.0 + field(3);
    let frames = match frame_rate.as_f64() {
        Some(fps) => field(4) / fps,
        None => 0.0,
    };
    ((seconds + frames) * 1000.0).round() as u64
}

/// Chapter title carried by an annotation line, if it is one
fn annotation_label(line: &str) -> Option<String> {
    let caps = ANNOTATION_RE.captures(line)?;
    let label = LABEL_PREFIX_RE.replace(&caps[1], "").trim().to_string();
    (!label.is_empty()).then_some(label)
}

/// Parse every entry line of a marker document, in file order
pub fn parse_marker_entries(text: &str, frame_rate: FrameRate) -> Vec<ChapterEntry> {
    let lines: Vec<&str> = text.lines().collect();
    let mut entries = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let Some(caps) = ENTRY_RE.captures(line) else {
            continue;
        };
        let start_ms = timecode_to_ms(&caps[1], frame_rate);
        let end_ms = timecode_to_ms(&caps[2], frame_rate);
        let title = lines
            .get(i + 1)
            .and_then(|next| annotation_label(next))
            .unwrap_or_else(|| format!("Chapter {}", entries.len() + 1));

        entries.push(ChapterEntry {
            start_ms,
            end_ms,
            title,
        });
    }
    entries
}

/// Escape characters FFMETADATA treats specially
fn escape_metadata_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '=' | ';' | '#' | '\\' | '\n') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Render chapters as an FFMETADATA1 document
pub fn render_ffmetadata(entries: &[ChapterEntry]) -> String {
    let mut doc = String::from(";FFMETADATA1\n");
    for entry in entries {
        let _ = write!(
            doc,
            "\n[CHAPTER]\nTIMEBASE=1/1000\nSTART={}\nEND={}\ntitle={}\n",
            entry.start_ms,
            entry.end_ms,
            escape_metadata_value(&entry.title)
        );
    }
    doc
}

/// Build the chapter artifact for a marker file.
///
/// Returns the number of chapters written, or `None` when the marker file has
/// no entries (no artifact is created in that case).
pub fn build_chapter_artifact(marker: &Path, frame_rate: FrameRate, artifact: &Path) -> Result<Option<usize>> {
    let bytes = std::fs::read(marker)
        .with_context(|| format!("Failed to read marker file: {}", marker.display()))?;
    let text = String::from_utf8_lossy(&bytes);

    let entries = parse_marker_entries(&text, frame_rate);
    if entries.is_empty() {
        return Ok(None);
    }

    std::fs::write(artifact, render_ffmetadata(&entries))
        .with_context(|| format!("Failed to write chapter metadata: {}", artifact.display()))?;
    Ok(Some(entries.len()))
}
