//! Job scenarios against scripted stand-ins for ffprobe and ffmpeg.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use serial_test::serial;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use transcoder::{
    run_batch, BatchConfig, EncodeJob, JobError, JobLog, JobOutcome, MediaFile, Toolchain,
};
use transcoder::error::FailedCheck;

const SOURCE_BYTES: &[u8] = b"original source bytes";

const MARKERS: &str = "TITLE: clip\n\
FCM: NON-DROP FRAME\n\
\n\
001  AX       V     C        00:00:00:00 00:00:10:00 00:00:00:00 00:00:10:00\n\
* LOC: 00:00:00:00 RED     Opening\n\
002  AX       V     C        00:00:10:00 00:00:30:00 00:00:10:00 00:00:30:00\n\
* COMMENT: Main part\n";

/// What the fake ffprobe reports
struct Streams {
    source_codec: &'static str,
    source_height: u32,
    output_audio: usize,
}

impl Default for Streams {
    fn default() -> Self {
        Self {
            source_codec: "h264",
            source_height: 2160,
            output_audio: 2,
        }
    }
}

struct Fixture {
    _dir: TempDir,
    media: PathBuf,
    bin: PathBuf,
    log_path: PathBuf,
    cfg: BatchConfig,
}

impl Fixture {
    fn new(streams: Streams, ffmpeg_body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("media");
        let bin = dir.path().join("bin");
        fs::create_dir_all(&media).unwrap();
        fs::create_dir_all(&bin).unwrap();

        let audio = |n: usize| {
            let entries: Vec<String> = (1..=n).map(|i| format!("{{\"index\":{}}}", i)).collect();
            format!("{{\"streams\":[{}]}}", entries.join(","))
        };
        let ffprobe = format!(
            r#"#!/bin/sh
for last; do :; done
name=$(basename "$last")
case "$name" in
  broken*) echo 'moov atom not found' >&2; exit 1 ;;
esac
case "$*" in
  *"select_streams a"*)
    case "$name" in
      TEMP_*) echo '{out_audio}' ;;
      *) echo '{src_audio}' ;;
    esac
    exit 0 ;;
  *show_chapters*)
    echo '{{"chapters":[{{"id":0}},{{"id":1}}]}}'
    exit 0 ;;
esac
case "$name" in
  TEMP_drift*) echo '{{"streams":[{{"codec_name":"av1","height":1080,"r_frame_rate":"30/1"}}],"format":{{"duration":"36.0"}}}}' ;;
  TEMP_*) echo '{{"streams":[{{"codec_name":"av1","height":1080,"r_frame_rate":"30/1"}}],"format":{{"duration":"30.2"}}}}' ;;
  *) echo '{{"streams":[{{"codec_name":"{codec}","height":{height},"r_frame_rate":"30/1"}}],"format":{{"duration":"30.0"}}}}' ;;
esac
"#,
            out_audio = audio(streams.output_audio),
            src_audio = audio(2),
            codec = streams.source_codec,
            height = streams.source_height,
        );
        let ffmpeg = format!(
            "#!/bin/sh\nprintf '%s\\n' \"$@\" > '{args}'\nfor last; do :; done\n{body}\n",
            args = bin.join("ffmpeg.args").display(),
            body = ffmpeg_body,
        );

        let ffprobe_bin = write_script(&bin, "ffprobe", &ffprobe);
        let ffmpeg_bin = write_script(&bin, "ffmpeg", &ffmpeg);

        let cfg = BatchConfig {
            source_root: media.clone(),
            ffprobe_bin,
            ffmpeg_bin,
            max_concurrent: Some(2),
            ..Default::default()
        };

        Self {
            log_path: dir.path().join("run.log"),
            _dir: dir,
            media,
            bin,
            cfg,
        }
    }

    fn add_source(&self, name: &str) -> MediaFile {
        let path = self.media.join(name);
        fs::write(&path, SOURCE_BYTES).unwrap();
        MediaFile::from_path(&path).unwrap()
    }

    fn tools(&self) -> Toolchain {
        Toolchain::new(Arc::new(self.cfg.clone()))
    }

    fn encoder_args(&self) -> Option<String> {
        fs::read_to_string(self.bin.join("ffmpeg.args")).ok()
    }

    fn transient_files(&self) -> Vec<String> {
        fs::read_dir(&self.media)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("TEMP_"))
            .collect()
    }

    fn audit_log(&self) -> String {
        fs::read_to_string(&self.log_path).unwrap_or_default()
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

const ENCODE_OK: &str = "printf encoded > \"$last\"\nexit 0";

async fn run_one(fx: &Fixture, media: MediaFile) -> JobOutcome {
    let sink = JobLog::open(&fx.log_path).unwrap();
    let job = EncodeJob::new(media, &fx.cfg);
    job.run(&fx.tools(), &sink, &CancellationToken::new()).await
}

#[tokio::test]
#[serial]
async fn test_commit_with_prefix_matched_markers() {
    let fx = Fixture::new(Streams::default(), ENCODE_OK);
    let media = fx.add_source("clip.mkv");
    fs::write(fx.media.join("clip_2.edl"), MARKERS).unwrap();

    let outcome = run_one(&fx, media).await;

    let JobOutcome::Committed(report) = outcome else {
        panic!("expected commit, got {:?}", outcome);
    };
    assert_eq!(report.chapters, 2);
    assert_eq!(report.original_bytes, SOURCE_BYTES.len() as u64);
    assert_eq!(fs::read(fx.media.join("OLD_clip.mkv")).unwrap(), SOURCE_BYTES);
    assert_eq!(fs::read(fx.media.join("clip.mp4")).unwrap(), b"encoded");
    assert!(!fx.media.join("clip.mkv").exists());
    assert!(fx.transient_files().is_empty());

    let args = fx.encoder_args().unwrap();
    assert!(args.contains("TEMP_clip.ffmetadata"));
    assert!(args.contains("-map_chapters"));
    assert!(fx.audit_log().contains("Committed clip.mkv"));
}

#[tokio::test]
#[serial]
async fn test_encoder_failure_leaves_source_untouched() {
    let fx = Fixture::new(Streams::default(), "printf partial > \"$last\"\necho 'encoder exploded' >&2\nexit 3");
    let media = fx.add_source("clip.mkv");
    fs::write(fx.media.join("clip.edl"), MARKERS).unwrap();

    let outcome = run_one(&fx, media).await;

    assert!(matches!(outcome, JobOutcome::Failed(JobError::Encode(_))), "got {:?}", outcome);
    assert_eq!(fs::read(fx.media.join("clip.mkv")).unwrap(), SOURCE_BYTES);
    assert!(!fx.media.join("OLD_clip.mkv").exists());
    assert!(!fx.media.join("clip.mp4").exists());
    assert!(fx.transient_files().is_empty());
    assert!(fx.audit_log().contains("EncodeError"));
}

#[tokio::test]
#[serial]
async fn test_source_already_at_target_is_skipped() {
    let streams = Streams {
        source_codec: "av1",
        source_height: 1080,
        ..Default::default()
    };
    let fx = Fixture::new(streams, ENCODE_OK);
    let media = fx.add_source("clip.mkv");
    fs::write(fx.media.join("clip.edl"), MARKERS).unwrap();

    let outcome = run_one(&fx, media).await;

    assert!(matches!(outcome, JobOutcome::Skipped { .. }), "got {:?}", outcome);
    assert!(fx.encoder_args().is_none());
    assert_eq!(fs::read(fx.media.join("clip.mkv")).unwrap(), SOURCE_BYTES);
    assert!(fx.transient_files().is_empty());
}

#[tokio::test]
#[serial]
async fn test_audio_mismatch_rolls_back() {
    let streams = Streams {
        output_audio: 1,
        ..Default::default()
    };
    let fx = Fixture::new(streams, ENCODE_OK);
    let media = fx.add_source("clip.mkv");

    let outcome = run_one(&fx, media).await;

    let JobOutcome::RolledBack(verdict) = outcome else {
        panic!("expected rollback, got {:?}", outcome);
    };
    assert_eq!(verdict.failures, vec![FailedCheck::AudioStreams { expected: 2, actual: 1 }]);
    assert_eq!(fs::read(fx.media.join("clip.mkv")).unwrap(), SOURCE_BYTES);
    assert!(!fx.media.join("clip.mp4").exists());
    assert!(fx.transient_files().is_empty());

    let args = fx.encoder_args().unwrap();
    assert!(!args.contains("-map_chapters"));
}

#[tokio::test]
#[serial]
async fn test_cancel_kills_encoder_and_cleans_up() {
    let fx = Fixture::new(Streams::default(), "printf partial > \"$last\"\nexec sleep 30");
    let media = fx.add_source("clip.mkv");
    let sink = JobLog::open(&fx.log_path).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let job = EncodeJob::new(media, &fx.cfg);
    let outcome = tokio::time::timeout(Duration::from_secs(10), job.run(&fx.tools(), &sink, &cancel))
        .await
        .unwrap();

    assert!(matches!(outcome, JobOutcome::Cancelled), "got {:?}", outcome);
    assert_eq!(fs::read(fx.media.join("clip.mkv")).unwrap(), SOURCE_BYTES);
    assert!(fx.transient_files().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_batch_commits_every_file_once() {
    let fx = Fixture::new(Streams::default(), ENCODE_OK);
    let mut candidates = vec![
        fx.add_source("a.mkv"),
        fx.add_source("b.mkv"),
        fx.add_source("c.avi"),
        fx.add_source("d.mov"),
    ];
    // same output name as a.mkv
    candidates.push(fx.add_source("a.mov"));

    let summary = run_batch(
        Arc::new(fx.tools()),
        candidates,
        2,
        JobLog::open(&fx.log_path).unwrap(),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(summary.committed, 4);
    assert_eq!(summary.skipped, 1);
    assert!(summary.is_clean());
    for name in ["a.mp4", "b.mp4", "c.mp4", "d.mp4", "OLD_a.mkv", "a.mov"] {
        assert!(fx.media.join(name).exists(), "{} missing", name);
    }
    assert!(fx.transient_files().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_existing_output_name_wins_over_new_claimant() {
    let fx = Fixture::new(Streams::default(), ENCODE_OK);
    let candidates = vec![fx.add_source("a.mkv"), fx.add_source("a.mp4")];

    let summary = run_batch(
        Arc::new(fx.tools()),
        candidates,
        2,
        JobLog::open(&fx.log_path).unwrap(),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(summary.committed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(fs::read(fx.media.join("a.mkv")).unwrap(), SOURCE_BYTES);
    assert_eq!(fs::read(fx.media.join("OLD_a.mp4")).unwrap(), SOURCE_BYTES);
    assert_eq!(fs::read(fx.media.join("a.mp4")).unwrap(), b"encoded");

    // the encoder ran once, for a.mp4
    let args = fx.encoder_args().unwrap();
    assert!(args.contains("TEMP_a.mp4"));
    assert!(!fx.audit_log().contains("CommitError"));
}

#[tokio::test]
#[serial]
async fn test_single_job_refuses_occupied_output_before_encoding() {
    let fx = Fixture::new(Streams::default(), ENCODE_OK);
    let media = fx.add_source("clip.mkv");
    fs::write(fx.media.join("clip.mp4"), b"someone else").unwrap();

    let outcome = run_one(&fx, media).await;

    assert!(matches!(outcome, JobOutcome::Skipped { .. }), "got {:?}", outcome);
    assert!(fx.encoder_args().is_none());
    assert_eq!(fs::read(fx.media.join("clip.mp4")).unwrap(), b"someone else");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_failures_stay_with_their_own_job() {
    let fx = Fixture::new(Streams::default(), ENCODE_OK);
    let candidates = vec![
        fx.add_source("a.mkv"),
        fx.add_source("broken.mkv"),
        fx.add_source("c.mkv"),
        fx.add_source("drift.mkv"),
    ];
    // a directory at the backup name makes c.mkv's backup rename fail
    fs::create_dir(fx.media.join("OLD_c.mkv")).unwrap();
    fs::write(fx.media.join("OLD_c.mkv/keep"), b"x").unwrap();

    let summary = run_batch(
        Arc::new(fx.tools()),
        candidates,
        2,
        JobLog::open(&fx.log_path).unwrap(),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(summary.committed, 1);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.rolled_back, 1);
    assert!(!summary.is_clean());

    assert_eq!(fs::read(fx.media.join("a.mp4")).unwrap(), b"encoded");
    for untouched in ["broken.mkv", "c.mkv", "drift.mkv"] {
        assert_eq!(fs::read(fx.media.join(untouched)).unwrap(), SOURCE_BYTES, "{} changed", untouched);
    }
    for absent in ["broken.mp4", "c.mp4", "drift.mp4", "OLD_broken.mkv", "OLD_drift.mkv"] {
        assert!(!fx.media.join(absent).exists(), "{} should not exist", absent);
    }
    assert!(fx.transient_files().is_empty());

    let log = fx.audit_log();
    assert!(log.contains("ProbeError for broken.mkv"));
    assert!(log.contains("CommitError for c.mkv"));
    assert!(log.contains("Rolled back drift.mkv"));
    assert!(log.contains("duration 36s vs source 30s"));
}
