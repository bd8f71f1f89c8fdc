//! Bounded FIFO execution of jobs.
//!
//! Items are admitted strictly in input order: a permit is acquired before a
//! task is spawned, so item N+1 never starts ahead of item N. Once the
//! cancellation token fires no further items are admitted; running ones are
//! left to observe the token themselves.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use log::error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use crate::joblog::JobLog;
use crate::pipeline::{EncodeJob, JobOutcome, Toolchain};
use crate::scan::MediaFile;

/// Results of [`run_bounded`], in input order
#[derive(Debug)]
pub struct BoundedRun<T, R> {
    pub completed: Vec<(usize, R)>,
    /// Items never admitted because of cancellation
    pub not_started: Vec<T>,
    pub panicked: usize,
}

/// Run `work` over `items` with at most `budget` in flight
pub async fn run_bounded<T, R, F, Fut>(
    items: Vec<T>,
    budget: usize,
    cancel: &CancellationToken,
    work: F,
) -> BoundedRun<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(budget.max(1)));
    let mut tasks = JoinSet::new();
    let mut pending = items.into_iter().enumerate();
    let mut not_started = Vec::new();

    while let Some((index, item)) = pending.next() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = semaphore.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit.filter(|_| !cancel.is_cancelled()) else {
            not_started.push(item);
            not_started.extend(pending.by_ref().map(|(_, item)| item));
            break;
        };

        let fut = work(item);
        tasks.spawn(async move {
            let result = fut.await;
            drop(permit);
            (index, result)
        });
    }

    let mut completed = Vec::new();
    let mut panicked = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(entry) => completed.push(entry),
            Err(e) => {
                error!("Job task failed to complete: {}", e);
                panicked += 1;
            }
        }
    }
    completed.sort_by_key(|(index, _)| *index);

    BoundedRun {
        completed,
        not_started,
        panicked,
    }
}

/// Tally of a batch run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub committed: usize,
    pub skipped: usize,
    pub rolled_back: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Source bytes of committed jobs whose output size is known
    pub original_bytes: u64,
    /// Output bytes of those same jobs
    pub new_bytes: u64,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Skipped { .. } => self.skipped += 1,
            JobOutcome::Committed(report) => {
                self.committed += 1;
                if let Some(new_bytes) = report.new_bytes {
                    self.original_bytes += report.original_bytes;
                    self.new_bytes += new_bytes;
                }
            }
            JobOutcome::RolledBack(_) => self.rolled_back += 1,
            JobOutcome::Failed(_) => self.failed += 1,
            JobOutcome::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.committed + self.skipped + self.rolled_back + self.failed + self.cancelled
    }

    /// No job failed, rolled back or was cancelled
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.rolled_back == 0 && self.cancelled == 0
    }
}

/// Run every candidate through the pipeline within the session budget
pub async fn run_batch(
    tools: Arc<Toolchain>,
    candidates: Vec<MediaFile>,
    budget: usize,
    sink: Arc<JobLog>,
    cancel: CancellationToken,
) -> RunSummary {
    let run_log = sink.unit("run");
    let mut summary = RunSummary::default();

    // two sources in one directory may map to the same output name, and an
    // existing file at that name belongs to whichever candidate it is
    let mut claimed = HashSet::new();
    let mut jobs = Vec::with_capacity(candidates.len());
    for media in candidates {
        if let Some(occupied) = media.occupied_final_path(&tools.cfg) {
            run_log
                .warn(format!(
                    "Skipping {}: output {} already exists",
                    media.path.display(),
                    occupied.display()
                ))
                .await;
            summary.skipped += 1;
            continue;
        }
        let final_path = media.final_path(&tools.cfg);
        if !claimed.insert(final_path.clone()) {
            run_log
                .warn(format!(
                    "Skipping {}: output {} is already claimed by another file",
                    media.path.display(),
                    final_path.display()
                ))
                .await;
            summary.skipped += 1;
            continue;
        }
        jobs.push(EncodeJob::new(media, &tools.cfg));
    }

    run_log
        .info(format!(
            "Processing {} file(s) with up to {} concurrent session(s)",
            jobs.len(),
            budget
        ))
        .await;

    let job_cancel = cancel.clone();
    let run = run_bounded(jobs, budget, &cancel, move |job: EncodeJob| {
        let tools = Arc::clone(&tools);
        let sink = Arc::clone(&sink);
        let cancel = job_cancel.clone();
        async move { job.run(&tools, &sink, &cancel).await }
    })
    .await;

    for (_, outcome) in &run.completed {
        summary.record(outcome);
    }
    summary.failed += run.panicked;
    summary.cancelled += run.not_started.len();

    if !run.not_started.is_empty() {
        run_log
            .warn(format!("{} file(s) not started due to cancellation", run.not_started.len()))
            .await;
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use crate::error::{FailedCheck, VerificationError};
    use crate::pipeline::CommitReport;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_never_exceeds_budget() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let run = run_bounded((0..20).collect(), 3, &CancellationToken::new(), |i: u32| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                i * 2
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(run.completed.len(), 20);
        assert!(run.not_started.is_empty());
        let results: Vec<u32> = run.completed.into_iter().map(|(_, r)| r).collect();
        assert_eq!(results, (0..20).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_single_slot_runs_in_input_order() {
        let started = Arc::new(Mutex::new(Vec::new()));

        run_bounded(vec!["a", "b", "c", "d"], 1, &CancellationToken::new(), |name: &'static str| {
            let started = started.clone();
            async move {
                started.lock().unwrap().push(name);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        assert_eq!(*started.lock().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_cancel_stops_admission() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let run = run_bounded(vec![1, 2, 3, 4], 1, &cancel, move |i: i32| {
            let trigger = trigger.clone();
            async move {
                if i == 1 {
                    trigger.cancel();
                }
                i
            }
        })
        .await;

        assert_eq!(run.completed, vec![(0, 1)]);
        assert_eq!(run.not_started, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_precancelled_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = run_bounded(vec![1, 2], 4, &cancel, |i: i32| async move { i }).await;
        assert!(run.completed.is_empty());
        assert_eq!(run.not_started, vec![1, 2]);
    }

    #[test]
    fn test_summary_tally() {
        let mut summary = RunSummary::default();
        summary.record(&JobOutcome::Skipped { reason: "already av1".into() });
        summary.record(&JobOutcome::Committed(CommitReport {
            original_bytes: 1000,
            new_bytes: Some(400),
            chapters: 2,
            elapsed: Duration::from_secs(1),
            backup_path: "OLD_a.mkv".into(),
            final_path: "a.mp4".into(),
        }));
        assert!(summary.is_clean());

        summary.record(&JobOutcome::RolledBack(VerificationError {
            failures: vec![FailedCheck::Height { expected: 1080, actual: 720 }],
        }));
        summary.record(&JobOutcome::Cancelled);
        summary.record(&JobOutcome::Committed(CommitReport {
            original_bytes: 5000,
            new_bytes: None,
            chapters: 0,
            elapsed: Duration::from_secs(1),
            backup_path: "OLD_b.mkv".into(),
            final_path: "b.mp4".into(),
        }));

        assert_eq!(summary.total(), 5);
        assert_eq!(summary.committed, 2);
        assert_eq!(summary.original_bytes - summary.new_bytes, 600);
        assert!(!summary.is_clean());
    }
}
