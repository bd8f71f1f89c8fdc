use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Source or output could not be inspected
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("file does not exist: {}", .path.display())]
    Missing { path: PathBuf },

    #[error("failed to execute {tool} for {}: {source}", .path.display())]
    Spawn {
        tool: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed (exit code {code}) for {}: {stderr}", .path.display())]
    Exit {
        tool: String,
        path: PathBuf,
        code: i32,
        stderr: String,
    },

    #[error("malformed probe output for {}: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },
}

/// The encoder subprocess did not produce a usable output
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to spawn encoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for encoder: {0}")]
    Wait(#[source] std::io::Error),

    #[error("encoder exited with code {}: {stderr_tail}", exit_code_label(.code))]
    Exit {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("encoder was terminated by cancellation")]
    Cancelled,
}

/// A single mandatory comparison between source and encoded output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailedCheck {
    Codec { expected: String, actual: String },
    Height { expected: u32, actual: u32 },
    Duration { source: u64, output: u64, tolerance: u64 },
    AudioStreams { expected: usize, actual: usize },
}

impl fmt::Display for FailedCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailedCheck::Codec { expected, actual } => {
                write!(f, "codec is {} (expected {})", actual, expected)
            }
            FailedCheck::Height { expected, actual } => {
                write!(f, "height is {} (expected {})", actual, expected)
            }
            FailedCheck::Duration { source, output, tolerance } => write!(
                f,
                "duration {}s vs source {}s (tolerance {}s)",
                output, source, tolerance
            ),
            FailedCheck::AudioStreams { expected, actual } => {
                write!(f, "{} audio stream(s) (expected {})", actual, expected)
            }
        }
    }
}

/// Encoded output failed one or more of the verification checks
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("verification failed: {}", join_checks(.failures))]
pub struct VerificationError {
    pub failures: Vec<FailedCheck>,
}

/// The backup/promote rename pair could not be completed
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("final target {} already exists and is not the source", .path.display())]
    TargetOccupied { path: PathBuf },

    #[error("failed to back up {} -> {}: {source}", .from.display(), .to.display())]
    Backup {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "failed to promote {} -> {}: {source} (source {})",
        .from.display(),
        .to.display(),
        restore_note(.restored)
    )]
    Promote {
        from: PathBuf,
        to: PathBuf,
        restored: bool,
        #[source]
        source: std::io::Error,
    },
}

/// No concurrency budget could be determined; fatal for the whole run
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("failed to execute hardware query tool {tool}: {source}")]
    QueryFailed {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("hardware query tool {tool} failed (exit code {code}): {stderr}")]
    QueryExit { tool: String, code: i32, stderr: String },

    #[error("hardware query tool {tool} reported no device")]
    NoDevice { tool: String },
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "<signal>".to_string(), |c| c.to_string())
}

fn join_checks(failures: &[FailedCheck]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn restore_note(restored: &bool) -> &'static str {
    if *restored {
        "restored"
    } else {
        "left at backup name"
    }
}

/// Job-local failure; never aborts sibling jobs
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Commit(#[from] CommitError),
}

impl JobError {
    /// Short category label used in audit lines
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Probe(_) => "ProbeError",
            JobError::Encode(_) => "EncodeError",
            JobError::Verification(_) => "VerificationError",
            JobError::Commit(_) => "CommitError",
        }
    }
}
