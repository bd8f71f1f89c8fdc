pub mod config;
pub mod error;
pub mod capability;
pub mod scan;
pub mod ffprobe;
pub mod markers;
pub mod chapters;
pub mod encode;
pub mod verify;
pub mod commit;
pub mod joblog;
pub mod pipeline;
pub mod scheduler;

pub use config::BatchConfig;
pub use capability::{resolve_budget, Budget, BudgetSource};
pub use error::{CommitError, EncodeError, JobError, ProbeError, ResolutionError, VerificationError};
pub use ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream, ProbeResult};
pub use joblog::{JobLog, UnitLog};
pub use pipeline::{CommitReport, EncodeJob, JobOutcome, JobState, Toolchain};
pub use scan::{find_orphaned_transients, scan_library, MediaFile, ScanResult};
pub use scheduler::{run_batch, run_bounded, RunSummary};
