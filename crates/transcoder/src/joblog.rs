//! Append-only audit log shared by every job in a run.
//!
//! Lines are best-effort: a writer that cannot get the file within a few
//! jittered attempts drops its line instead of stalling the job.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::Local;
use rand::Rng;
use tokio::sync::Mutex;

const MAX_ATTEMPTS: u32 = 5;
const JITTER_MS: std::ops::RangeInclusive<u64> = 20..=200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }

    fn as_log(self) -> log::Level {
        match self {
            Level::Debug => log::Level::Debug,
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
            Level::Error => log::Level::Error,
        }
    }
}

#[derive(Debug)]
pub struct JobLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JobLog {
    /// Open (creating if needed) the log file in append mode
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handle that tags every line with `unit`
    pub fn unit(self: &Arc<Self>, unit: impl Into<String>) -> UnitLog {
        UnitLog {
            sink: Arc::clone(self),
            unit: unit.into(),
        }
    }

    /// Append one line; returns false if the line was dropped
    pub async fn write(&self, level: Level, unit: &str, message: &str) -> bool {
        log::log!(target: "av1batch", level.as_log(), "[{}] {}", unit, message);

        let line = format!(
            "{} [{}] [{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level.as_str(),
            unit,
            message
        );

        for attempt in 1..=MAX_ATTEMPTS {
            if let Ok(mut file) = self.file.try_lock() {
                match file.write_all(line.as_bytes()) {
                    Ok(()) => return true,
                    Err(e) => log::debug!("Log write attempt {} failed: {}", attempt, e),
                }
            }
            if attempt < MAX_ATTEMPTS {
                let delay = rand::rng().random_range(JITTER_MS);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
        false
    }
}

/// A [`JobLog`] bound to one execution unit
#[derive(Debug, Clone)]
pub struct UnitLog {
    sink: Arc<JobLog>,
    unit: String,
}

impl UnitLog {
    pub async fn debug(&self, message: impl AsRef<str>) -> bool {
        self.sink.write(Level::Debug, &self.unit, message.as_ref()).await
    }

    pub async fn info(&self, message: impl AsRef<str>) -> bool {
        self.sink.write(Level::Info, &self.unit, message.as_ref()).await
    }

    pub async fn warn(&self, message: impl AsRef<str>) -> bool {
        self.sink.write(Level::Warn, &self.unit, message.as_ref()).await
    }

    pub async fn error(&self, message: impl AsRef<str>) -> bool {
        self.sink.write(Level::Error, &self.unit, message.as_ref()).await
    }
}
