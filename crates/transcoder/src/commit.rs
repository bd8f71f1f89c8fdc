use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, error, warn};
use crate::error::CommitError;

/// The four paths involved in promoting an encode
#[derive(Debug, Clone)]
pub struct CommitPlan {
    pub source: PathBuf,
    pub transient: PathBuf,
    pub backup: PathBuf,
    pub final_path: PathBuf,
}

/// Replace the source with the verified output, keeping the source as a backup.
///
/// Order matters: the source is moved to the backup name first, then the
/// transient output is promoted. If promotion fails the backup is moved back,
/// so the source always exists under one of its two names.
pub fn commit(plan: &CommitPlan) -> Result<(), CommitError> {
    if plan.final_path != plan.source && plan.final_path.exists() {
        return Err(CommitError::TargetOccupied {
            path: plan.final_path.clone(),
        });
    }

    // a stale backup from an earlier run is overwritten
    if plan.backup.exists() {
        debug!("Removing stale backup {}", plan.backup.display());
        if let Err(e) = fs::remove_file(&plan.backup) {
            warn!("Failed to remove stale backup {}: {}", plan.backup.display(), e);
        }
    }

    fs::rename(&plan.source, &plan.backup).map_err(|source| CommitError::Backup {
        from: plan.source.clone(),
        to: plan.backup.clone(),
        source,
    })?;

    if let Err(source) = fs::rename(&plan.transient, &plan.final_path) {
        let restored = restore(&plan.backup, &plan.source);
        return Err(CommitError::Promote {
            from: plan.transient.clone(),
            to: plan.final_path.clone(),
            restored,
            source,
        });
    }

    Ok(())
}

fn restore(backup: &Path, source: &Path) -> bool {
    match fs::rename(backup, source) {
        Ok(()) => true,
        Err(e) => {
            error!(
                "Failed to restore {} from {}: {} (original is preserved at the backup name)",
                source.display(),
                backup.display(),
                e
            );
            false
        }
    }
}
