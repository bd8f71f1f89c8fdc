//! Sizing the encoder pool from the installed GPU.
//!
//! Hardware encoders cap the number of simultaneous sessions per device. The
//! limit is looked up from the GPU name reported by `nvidia-smi`; one session
//! is held back as headroom for other consumers of the encoder.

use std::path::Path;
use log::{debug, info, warn};
use tokio::process::Command;
use crate::config::BatchConfig;
use crate::error::ResolutionError;

/// Session capacity assumed for GPUs missing from the table
pub const DEFAULT_SESSION_CAPACITY: usize = 8;

/// Vendor boilerplate removed before matching
const VENDOR_TOKENS: &[&str] = &["NVIDIA", "GEFORCE", "CORPORATION", "(R)", "(TM)"];

/// (pattern, concurrent encode sessions). Patterns are matched against the
/// normalized name; the longest matching pattern wins.
const SESSION_TABLE: &[(&str, usize)] = &[
    ("GTX 9", 3),
    ("GTX 10", 5),
    ("GTX 16", 5),
    ("TITAN", 5),
    ("RTX 20", 5),
    ("RTX 30", 8),
    ("RTX 40", 8),
    ("RTX 50", 8),
    ("QUADRO", 32),
    ("RTX A", 32),
    ("RTX 4000", 32),
    ("RTX 4500", 32),
    ("RTX 5000", 32),
    ("RTX 6000", 32),
    ("TESLA", 32),
    ("T4", 32),
    ("L4", 32),
    ("L40", 32),
    ("A10", 32),
    ("A16", 32),
    ("A40", 32),
];

/// Where the run's concurrency came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetSource {
    Override,
    Detected {
        gpu: String,
        capacity: usize,
        matched: Option<&'static str>,
    },
}

/// Number of jobs allowed to run at once, resolved once per run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Budget {
    pub sessions: usize,
    pub source: BudgetSource,
}

/// Uppercase, drop vendor tokens, collapse whitespace
pub fn normalize_gpu_name(raw: &str) -> String {
    raw.to_uppercase()
        .split_whitespace()
        .filter(|tok| !VENDOR_TOKENS.contains(tok))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Look up the session capacity for a GPU name.
///
/// Returns the capacity and the pattern that produced it; `None` means the
/// name matched nothing and the default was used.
pub fn lookup_session_capacity(gpu_name: &str) -> (usize, Option<&'static str>) {
    let normalized = normalize_gpu_name(gpu_name);

    let best = SESSION_TABLE
        .iter()
        .filter(|(pattern, _)| normalized.contains(pattern))
        .fold(None::<&(&'static str, usize)>, |best, entry| match best {
            Some(b) if b.0.len() >= entry.0.len() => Some(b),
            _ => Some(entry),
        });

    match best {
        Some(&(pattern, capacity)) => (capacity, Some(pattern)),
        None => (DEFAULT_SESSION_CAPACITY, None),
    }
}

/// Keep one session free when more than one exists, never go below one
pub fn usable_sessions(capacity: usize) -> usize {
    capacity.saturating_sub(1).max(1)
}

/// Budget for a known GPU name, warning when the name is not in the table
pub fn budget_for_gpu(gpu_name: &str) -> Budget {
    let (capacity, matched) = lookup_session_capacity(gpu_name);
    match matched {
        Some(pattern) => debug!("GPU '{}' matched session table entry '{}'", gpu_name, pattern),
        None => warn!(
            "GPU '{}' not found in session table, assuming {} sessions",
            gpu_name, DEFAULT_SESSION_CAPACITY
        ),
    }

    Budget {
        sessions: usable_sessions(capacity),
        source: BudgetSource::Detected {
            gpu: gpu_name.to_string(),
            capacity,
            matched,
        },
    }
}

/// Ask the GPU enumeration tool for the first device name
pub async fn query_gpu_name(tool: &Path) -> Result<String, ResolutionError> {
    let tool_name = tool.display().to_string();
    debug!("Querying GPU name with {}", tool_name);

    let output = Command::new(tool)
        .arg("--query-gpu=name")
        .arg("--format=csv,noheader")
        .output()
        .await
        .map_err(|source| ResolutionError::QueryFailed {
            tool: tool_name.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(ResolutionError::QueryExit {
            tool: tool_name,
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or(ResolutionError::NoDevice { tool: tool_name })
}

/// Resolve the run's concurrency: an explicit override wins, otherwise detect
pub async fn resolve_budget(cfg: &BatchConfig) -> Result<Budget, ResolutionError> {
    if let Some(sessions) = cfg.max_concurrent {
        info!("Using configured concurrency override: {} job(s)", sessions);
        return Ok(Budget {
            sessions: sessions.max(1),
            source: BudgetSource::Override,
        });
    }

    let gpu = query_gpu_name(&cfg.gpu_query_bin).await?;
    let budget = budget_for_gpu(&gpu);
    info!("Detected GPU '{}': {} concurrent job(s)", gpu, budget.sessions);
    Ok(budget)
}
