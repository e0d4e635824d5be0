pub mod control;
pub mod convert;
pub mod disc_name;
pub mod error;
pub mod extract;
pub mod group;
pub mod job;
pub mod keyed_lock;
pub mod ledger;
pub mod payload;
pub mod playlist;
pub mod scheduler;
pub mod source_scan;

#[cfg(test)]
mod test_support;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

pub use control::CancellationToken;
pub use convert::{Chdman, Converter};
pub use error::{FatalError, JobError};
pub use extract::{ArchiveExtractor, Extractor};
pub use job::JobStatus;
pub use ledger::{Ledger, LEDGER_FILENAME};
pub use scheduler::{BatchResult, EntryOutcome, MAX_DEFAULT_WORKERS};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOptions {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Concurrent conversions. `0` picks a default from the core count.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_true")]
    pub keep_originals: bool,
    /// Ignore the ledger and existing outputs.
    #[serde(default)]
    pub force: bool,
    /// Defaults to `<destination>/.chdpack-ledger.json`.
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default)]
    pub chdman_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub playlists: bool,
}

impl BatchOptions {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            workers: 0,
            keep_originals: true,
            force: false,
            ledger_path: None,
            temp_dir: None,
            chdman_path: None,
            playlists: true,
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| self.destination.join(LEDGER_FILENAME))
    }
}

/// Control options for a batch run.
#[derive(Debug, Clone, Default)]
pub struct ProcessControl {
    pub cancel_token: Option<CancellationToken>,
}

impl ProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }
}

/// `(stage, current, total, message)`
pub type ProgressCallback = dyn Fn(&str, u64, u64, &str) + Send + Sync;

/// Throttled progress reporter: emits at most every 200ms or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback,
    last_emit: std::sync::Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback) -> Self {
        Self {
            inner,
            last_emit: std::sync::Mutex::new(Instant::now() - std::time::Duration::from_secs(1)),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current >= total;
        if !is_done {
            let mut last = self
                .last_emit
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if last.elapsed().as_millis() < 200 {
                return;
            }
            *last = Instant::now();
        }
        (self.inner)(stage, current, total, message);
    }
}

/// Convert every archive under `options.source` with the discovered tools.
pub fn process(
    options: &BatchOptions,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<BatchResult> {
    process_with_control(options, &ProcessControl::default(), progress_callback)
}

/// Like [`process`], with cancellation.
pub fn process_with_control(
    options: &BatchOptions,
    control: &ProcessControl,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<BatchResult> {
    let converter = Chdman::discover(options.chdman_path.as_deref())?;
    tracing::info!(chdman = %converter.program().display(), "using converter");
    let extractor = ArchiveExtractor::discover();
    process_with(options, control, &extractor, &converter, progress_callback)
}

/// Run a batch with explicit extraction and conversion capabilities.
///
/// Returns `Err` only for [`FatalError`] conditions. Per-archive failures
/// are reported in the result.
pub fn process_with(
    options: &BatchOptions,
    control: &ProcessControl,
    extractor: &dyn Extractor,
    converter: &dyn Converter,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<BatchResult> {
    let tp = ThrottledProgress::new(progress_callback);
    let cancel = control.cancel_token.clone().unwrap_or_default();

    // Ledger keys and recorded outputs must not depend on how paths were spelled.
    let destination = check_destination(&options.destination)?;
    let source = fs::canonicalize(&options.source).map_err(|source| FatalError::SourceUnreadable {
        path: options.source.clone(),
        source,
    })?;
    let options = BatchOptions {
        source,
        destination,
        ..options.clone()
    };
    converter.probe()?;

    // Stage 1: scan and group
    tp.report("scan", 0, 1, &format!("Scanning {}", options.source.display()));
    let entries = source_scan::scan_source(&options.source)?;
    let resolution = group::resolve_groups(entries);
    tp.report(
        "scan",
        1,
        1,
        &format!(
            "Found {} archives in {} games",
            resolution.entry_count(),
            resolution.groups.len()
        ),
    );

    // Stage 2: convert
    let ledger = Ledger::open(&options.ledger_path());
    tracing::info!(ledger = %ledger.path().display(), entries = ledger.len(), "ledger opened");
    let playlists = options
        .playlists
        .then(|| playlist::PlaylistManager::new(&options.destination));
    let ctx = scheduler::BatchContext {
        destination: &options.destination,
        extractor,
        converter,
        ledger: &ledger,
        playlists: playlists.as_ref(),
        temp_root: options.temp_dir.as_deref(),
        keep_originals: options.keep_originals,
        force: options.force,
        cancel: &cancel,
        progress: &tp,
    };
    let mut result = scheduler::run_batch(&resolution.groups, options.workers, &ctx)?;

    if let Some(warning) = ledger.recovery_warning() {
        result.warnings.insert(0, warning.to_string());
    }
    result.issues = resolution.issues;
    Ok(result)
}

/// Create the destination if needed and prove it accepts new files.
/// Returns its canonical path.
fn check_destination(destination: &Path) -> Result<PathBuf, FatalError> {
    let not_writable = |source| FatalError::DestinationNotWritable {
        path: destination.to_path_buf(),
        source,
    };
    fs::create_dir_all(destination).map_err(not_writable)?;
    tempfile::Builder::new()
        .prefix(".chdpack-probe-")
        .tempfile_in(destination)
        .map_err(not_writable)?;
    fs::canonicalize(destination).map_err(not_writable)
}
