use crate::config::BatchConfig;
use crate::error::{FailedCheck, VerificationError};
use crate::ffprobe::ProbeResult;

/// Compare the encoded output against its source.
///
/// All four checks are evaluated so the error names every mismatch, not just
/// the first one.
pub fn verify_output(
    source: &ProbeResult,
    output: &ProbeResult,
    cfg: &BatchConfig,
) -> Result<(), VerificationError> {
    let mut failures = Vec::new();

    if output.codec != cfg.target_codec {
        failures.push(FailedCheck::Codec {
            expected: cfg.target_codec.clone(),
            actual: output.codec.clone(),
        });
    }

    if output.height != cfg.target_height {
        failures.push(FailedCheck::Height {
            expected: cfg.target_height,
            actual: output.height,
        });
    }

    if source.duration_secs.abs_diff(output.duration_secs) > cfg.duration_tolerance_secs {
        failures.push(FailedCheck::Duration {
            source: source.duration_secs,
            output: output.duration_secs,
            tolerance: cfg.duration_tolerance_secs,
        });
    }

    if output.audio_streams != source.audio_streams {
        failures.push(FailedCheck::AudioStreams {
            expected: source.audio_streams,
            actual: output.audio_streams,
        });
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(VerificationError { failures })
    }
}
