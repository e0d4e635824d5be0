use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::control::CancellationToken;
use crate::convert::{Converter, ProgressSink};
use crate::disc_name::ArchiveEntry;
use crate::error::JobError;
use crate::extract::Extractor;
use crate::group::GameGroup;
use crate::payload::locate_payload;

pub const OUTPUT_EXTENSION: &str = "chd";

/// Suffix of in-progress outputs. They never carry the final name.
const PARTIAL_SUFFIX: &str = ".partial.chd";

const TEMP_PREFIX: &str = "chdpack-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Extracting,
    Converting,
    Succeeded,
    Failed(String),
    Skipped(String),
}

/// `<dest>/<archive stem>.chd`
pub fn output_path_for(entry: &ArchiveEntry, destination: &Path) -> PathBuf {
    destination.join(format!("{}.{OUTPUT_EXTENSION}", entry.stem()))
}

/// Hidden sibling of `output` that the converter writes into.
pub fn partial_path_for(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!(".{stem}{PARTIAL_SUFFIX}"))
}

/// Delete partial outputs left behind by an interrupted run.
pub fn remove_stale_partials(destination: &Path) -> usize {
    let Ok(dir) = fs::read_dir(destination) else {
        return 0;
    };
    let mut removed = 0;
    for entry in dir.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                tracing::info!(path = %entry.path().display(), "removed stale partial output");
                removed += 1;
            }
            Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "cannot remove stale partial output"),
        }
    }
    removed
}

/// Removes the partial output on drop unless it was promoted.
struct PartialOutput {
    path: PathBuf,
    promoted: bool,
}

impl PartialOutput {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            promoted: false,
        }
    }

    fn promote(mut self, output: &Path) -> Result<(), JobError> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() > 0 => {}
            _ => {
                return Err(JobError::Conversion(
                    "converter produced no usable output".to_string(),
                ))
            }
        }
        fs::rename(&self.path, output)?;
        self.promoted = true;
        Ok(())
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if self.promoted {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "cannot remove partial output"),
        }
    }
}

/// Collaborators a job needs to run.
pub struct JobEnv<'a> {
    pub extractor: &'a dyn Extractor,
    pub converter: &'a dyn Converter,
    /// Parent for per-job scratch directories; the system temp dir when unset.
    pub temp_root: Option<&'a Path>,
    pub cancel: &'a CancellationToken,
    pub progress: ProgressSink<'a>,
}

/// One archive's trip to a `.chd`.
#[derive(Debug)]
pub struct ConversionJob<'g> {
    pub entry: &'g ArchiveEntry,
    pub group: &'g GameGroup,
    pub output: PathBuf,
    pub status: JobStatus,
}

impl<'g> ConversionJob<'g> {
    pub fn new(entry: &'g ArchiveEntry, group: &'g GameGroup, destination: &Path) -> Self {
        Self {
            entry,
            group,
            output: output_path_for(entry, destination),
            status: JobStatus::Pending,
        }
    }

    /// Extract, locate the image and convert it.
    ///
    /// The final output path only ever receives a complete, non-empty file.
    /// Scratch space is removed whatever the result.
    pub fn run(&mut self, env: &JobEnv<'_>) -> Result<(), JobError> {
        let result = self.execute(env);
        self.status = match &result {
            Ok(()) => JobStatus::Succeeded,
            Err(e) => JobStatus::Failed(e.reason()),
        };
        result
    }

    fn execute(&mut self, env: &JobEnv<'_>) -> Result<(), JobError> {
        env.cancel.check()?;

        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_PREFIX);
        let scratch = match env.temp_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };

        self.status = JobStatus::Extracting;
        tracing::debug!(archive = %self.entry.path.display(), scratch = %scratch.path().display(), "extracting");
        env.extractor.extract(&self.entry.path, scratch.path())?;
        env.cancel.check()?;

        let payload = locate_payload(scratch.path())?;
        tracing::debug!(
            archive = %self.entry.path.display(),
            image = %payload.primary.display(),
            tracks = payload.tracks.len(),
            "located disk image"
        );

        self.status = JobStatus::Converting;
        let partial = PartialOutput::new(partial_path_for(&self.output));
        env.converter
            .convert(&payload.primary, &partial.path, env.cancel, env.progress)?;
        partial.promote(&self.output)
    }
}
