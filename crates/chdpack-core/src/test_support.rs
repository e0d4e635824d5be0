//! Fixtures shared by unit tests.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::control::CancellationToken;
use crate::convert::{Converter, ProgressSink};
use crate::error::{FatalError, JobError};

/// Write a zip archive containing `files` (name, content).
pub fn make_zip(path: &Path, files: &[(&str, &[u8])]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    for (name, content) in files {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(content).unwrap();
    }
    zip.finish().unwrap();
}

/// Zip holding a single ISO whose content is derived from `label`.
pub fn make_game_zip(dir: &Path, file_name: &str, label: &str) -> std::path::PathBuf {
    let path = dir.join(file_name);
    let image = format!("image:{label}");
    make_zip(&path, &[("game/game.iso", image.as_bytes())]);
    path
}

/// Converter that copies its input to the output, tracking concurrency.
#[derive(Debug, Default)]
pub struct CopyConverter {
    pub delay: Duration,
    pub fail_on: Option<String>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl CopyConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Fail any conversion whose input path contains `needle`.
    pub fn failing_on(needle: &str) -> Self {
        Self {
            fail_on: Some(needle.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Converter for CopyConverter {
    fn probe(&self) -> Result<(), FatalError> {
        Ok(())
    }

    fn convert(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
        progress: ProgressSink<'_>,
    ) -> Result<(), JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = (|| {
            cancel.check()?;
            // Leave a partial file behind before failing, like a crashed tool would.
            fs::write(output, b"partial")?;
            progress("Compressing, 50.0% complete...");
            let started = Instant::now();
            while started.elapsed() < self.delay {
                cancel.check()?;
                std::thread::sleep(Duration::from_millis(5));
            }
            if let Some(needle) = &self.fail_on {
                if input.to_string_lossy().contains(needle.as_str()) {
                    return Err(JobError::Conversion("simulated failure".into()));
                }
            }
            fs::copy(input, output)?;
            Ok(())
        })();

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Converter whose probe fails.
pub struct MissingConverter;

impl Converter for MissingConverter {
    fn probe(&self) -> Result<(), FatalError> {
        Err(FatalError::ConverterUnavailable("not installed".into()))
    }

    fn convert(
        &self,
        _input: &Path,
        _output: &Path,
        _cancel: &CancellationToken,
        _progress: ProgressSink<'_>,
    ) -> Result<(), JobError> {
        Err(JobError::Conversion("not installed".into()))
    }
}
