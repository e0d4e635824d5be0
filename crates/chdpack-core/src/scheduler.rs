use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::control::CancellationToken;
use crate::convert::Converter;
use crate::disc_name::ArchiveEntry;
use crate::error::JobError;
use crate::extract::Extractor;
use crate::group::{GameGroup, MalformedInput};
use crate::job::{remove_stale_partials, ConversionJob, JobEnv, JobStatus};
use crate::keyed_lock::{KeyedLocks, OutputClaims};
use crate::ledger::{ArchiveIdentity, Ledger};
use crate::playlist::PlaylistManager;
use crate::ThrottledProgress;

/// Upper bound for the automatic worker count. Conversion is disk-bound.
pub const MAX_DEFAULT_WORKERS: usize = 4;

/// `0` means one worker per core, capped at [`MAX_DEFAULT_WORKERS`].
pub fn resolve_workers(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_WORKERS)
}

/// Final state of one archive.
#[derive(Debug, Clone)]
pub struct EntryOutcome {
    pub archive: PathBuf,
    pub output: PathBuf,
    pub group: String,
    pub disk_index: Option<u32>,
    pub status: JobStatus,
}

#[derive(Debug, Default)]
pub struct BatchResult {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Jobs that never reached a terminal state because the batch was cancelled.
    pub cancelled: usize,
    pub outcomes: Vec<EntryOutcome>,
    pub playlists: Vec<PathBuf>,
    pub issues: Vec<MalformedInput>,
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.cancelled
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntryOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, JobStatus::Failed(_)))
    }
}

/// Everything a batch run needs besides the groups themselves.
pub struct BatchContext<'a> {
    pub destination: &'a Path,
    pub extractor: &'a dyn Extractor,
    pub converter: &'a dyn Converter,
    pub ledger: &'a Ledger,
    /// `None` disables playlist generation.
    pub playlists: Option<&'a PlaylistManager>,
    pub temp_root: Option<&'a Path>,
    pub keep_originals: bool,
    /// Convert even when the ledger or an existing output says it is done.
    pub force: bool,
    pub cancel: &'a CancellationToken,
    pub progress: &'a ThrottledProgress<'a>,
}

struct Batch<'a> {
    ctx: &'a BatchContext<'a>,
    group_locks: KeyedLocks<String>,
    claims: OutputClaims,
    playlists: Mutex<BTreeSet<PathBuf>>,
    warnings: Mutex<Vec<String>>,
    completed: AtomicU64,
    total: u64,
}

impl<'a> Batch<'a> {
    fn new(ctx: &'a BatchContext<'a>, total: u64) -> Self {
        Self {
            ctx,
            group_locks: KeyedLocks::new(),
            claims: OutputClaims::new(),
            playlists: Mutex::new(BTreeSet::new()),
            warnings: Mutex::new(Vec::new()),
            completed: AtomicU64::new(0),
            total,
        }
    }

    fn warn(&self, message: String) {
        tracing::warn!("{message}");
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    fn report(&self, message: &str) {
        let done = self.completed.load(Ordering::SeqCst);
        self.ctx.progress.report("convert", done, self.total, message);
    }

    fn finish(&self, job: ConversionJob<'_>) -> EntryOutcome {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let label = match &job.status {
            JobStatus::Succeeded => "done".to_string(),
            JobStatus::Skipped(reason) => format!("skipped ({reason})"),
            JobStatus::Failed(reason) => format!("failed ({reason})"),
            other => format!("{other:?}"),
        };
        self.ctx.progress.report(
            "convert",
            done,
            self.total,
            &format!("{}: {label}", job.entry.file_name),
        );
        EntryOutcome {
            archive: job.entry.path.clone(),
            output: job.output,
            group: job.group.key.clone(),
            disk_index: job.entry.disk_index,
            status: job.status,
        }
    }

    /// Why `job` needs no work, if it needs none.
    fn already_done(&self, job: &ConversionJob<'_>) -> Option<String> {
        if self.ctx.force {
            return None;
        }
        // An unreadable archive fails properly once the job runs.
        let identity = ArchiveIdentity::of(&job.entry.path).ok()?;
        if let Some(recorded) = self.ctx.ledger.has(&identity) {
            if recorded.output_path == job.output && recorded.output_is_valid() {
                return Some("already converted".to_string());
            }
            tracing::debug!(
                archive = %job.entry.path.display(),
                recorded = %recorded.output_path.display(),
                "ledger entry does not match the planned output"
            );
        }
        if fs::metadata(&job.output).is_ok_and(|m| m.is_file() && m.len() > 0) {
            return Some("output exists".to_string());
        }
        None
    }

    fn update_playlist(&self, group: &GameGroup, entry: &ArchiveEntry, output: &Path) {
        if !group.is_multi_disk() {
            return;
        }
        let (Some(manager), Some(index)) = (self.ctx.playlists, entry.disk_index) else {
            return;
        };
        match manager.on_disk_completed(group, index, output) {
            Ok(path) => {
                self.playlists
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(path);
            }
            Err(e) => self.warn(format!(
                "cannot update playlist for {}: {e}",
                group.title
            )),
        }
    }

    fn record_success(&self, job: &ConversionJob<'_>) {
        let archive = &job.entry.path;
        let recorded = match ArchiveIdentity::of(archive) {
            Ok(identity) => match self.ctx.ledger.record(&identity, &job.output) {
                Ok(()) => true,
                Err(e) => {
                    self.warn(format!("cannot record {} in ledger: {e:#}", archive.display()));
                    false
                }
            },
            Err(e) => {
                self.warn(format!("cannot stat {} for ledger: {e}", archive.display()));
                false
            }
        };

        self.update_playlist(job.group, job.entry, &job.output);

        if self.ctx.keep_originals {
            return;
        }
        if !recorded {
            self.warn(format!(
                "keeping {} because its conversion could not be recorded",
                archive.display()
            ));
            return;
        }
        match fs::remove_file(archive) {
            Ok(()) => tracing::info!(archive = %archive.display(), "deleted original archive"),
            Err(e) => self.warn(format!("cannot delete {}: {e}", archive.display())),
        }
    }

    /// Run one job on a worker. `None` when it was cancelled before finishing.
    fn execute(&self, mut job: ConversionJob<'_>) -> Option<EntryOutcome> {
        if self.ctx.cancel.is_cancelled() {
            return None;
        }

        let Some(_claim) = self.claims.try_claim(&job.output) else {
            let err = JobError::Conflict(job.output.clone());
            tracing::warn!(archive = %job.entry.path.display(), error = %err, "conversion job failed");
            job.status = JobStatus::Failed(err.reason());
            return Some(self.finish(job));
        };

        tracing::info!(
            archive = %job.entry.path.display(),
            disk = job.entry.disk_label().as_deref().unwrap_or("-"),
            output = %job.output.display(),
            "converting"
        );
        let name = job.entry.file_name.clone();
        let sink = |line: &str| self.report(&format!("{name}: {line}"));
        let env = JobEnv {
            extractor: self.ctx.extractor,
            converter: self.ctx.converter,
            temp_root: self.ctx.temp_root,
            cancel: self.ctx.cancel,
            progress: &sink,
        };
        let started = Instant::now();
        let result = job.run(&env);

        match result {
            Err(JobError::Cancelled) => {
                tracing::info!(archive = %job.entry.path.display(), "conversion cancelled");
                None
            }
            Err(e) => {
                tracing::warn!(archive = %job.entry.path.display(), error = %e, "conversion job failed");
                Some(self.finish(job))
            }
            Ok(()) => {
                tracing::info!(
                    archive = %job.entry.path.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "converted"
                );
                self.group_locks
                    .with_lock(&job.group.key, || self.record_success(&job));
                Some(self.finish(job))
            }
        }
    }
}

/// Convert every member of `groups` with at most `max_workers` jobs in flight.
///
/// Failures are isolated to their job. Already-converted archives are skipped
/// unless forced. On cancellation no new jobs start, running ones are stopped
/// and the result counts what never finished as cancelled.
pub fn run_batch(
    groups: &[GameGroup],
    max_workers: usize,
    ctx: &BatchContext<'_>,
) -> anyhow::Result<BatchResult> {
    let started = Instant::now();
    let workers = resolve_workers(max_workers);

    let removed = remove_stale_partials(ctx.destination);
    if removed > 0 {
        tracing::info!(removed, "cleaned up partial outputs from an earlier run");
    }

    let total = groups.iter().map(|g| g.members.len()).sum::<usize>();
    let batch = Batch::new(ctx, total as u64);
    batch.report(&format!("Planning {total} archives"));

    let mut outcomes = Vec::new();
    let mut pending = Vec::new();
    let mut planned: HashMap<PathBuf, &Path> = HashMap::new();
    for group in groups {
        for entry in &group.members {
            let mut job = ConversionJob::new(entry, group, ctx.destination);
            if let Some(first) = planned.get(&job.output) {
                tracing::warn!(
                    archive = %entry.path.display(),
                    first = %first.display(),
                    output = %job.output.display(),
                    "two archives map to the same output"
                );
                job.status = JobStatus::Failed(JobError::Conflict(job.output.clone()).reason());
                outcomes.push(batch.finish(job));
                continue;
            }
            planned.insert(job.output.clone(), &entry.path);

            if let Some(reason) = batch.already_done(&job) {
                tracing::info!(archive = %entry.path.display(), reason = %reason, "skipping");
                batch.update_playlist(group, entry, &job.output);
                job.status = JobStatus::Skipped(reason);
                outcomes.push(batch.finish(job));
                continue;
            }
            pending.push(job);
        }
    }

    let scheduled = pending.len();
    tracing::info!(scheduled, workers, "starting conversions");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("chdpack-worker-{i}"))
        .build()?;
    let finished: Vec<Option<EntryOutcome>> = pool.install(|| {
        pending
            .into_par_iter()
            .with_max_len(1)
            .map(|job| batch.execute(job))
            .collect()
    });

    let mut finished_count = 0;
    for outcome in finished.into_iter().flatten() {
        finished_count += 1;
        outcomes.push(outcome);
    }
    outcomes.sort_by(|a, b| a.archive.cmp(&b.archive));

    let mut result = BatchResult {
        cancelled: scheduled - finished_count,
        playlists: batch
            .playlists
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .collect(),
        warnings: batch
            .warnings
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner),
        ..BatchResult::default()
    };
    for outcome in &outcomes {
        match outcome.status {
            JobStatus::Succeeded => result.succeeded += 1,
            JobStatus::Failed(_) => result.failed += 1,
            JobStatus::Skipped(_) => result.skipped += 1,
            _ => {}
        }
    }
    result.outcomes = outcomes;
    result.elapsed = started.elapsed();

    if result.cancelled > 0 {
        tracing::warn!(cancelled = result.cancelled, "batch cancelled before all jobs finished");
    }
    tracing::info!(
        succeeded = result.succeeded,
        failed = result.failed,
        skipped = result.skipped,
        elapsed_ms = result.elapsed.as_millis() as u64,
        "batch finished"
    );
    Ok(result)
}
