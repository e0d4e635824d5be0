use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use zip::ZipArchive;

use crate::error::JobError;

/// Unpacks an archive into a directory and reports the files it produced.
pub trait Extractor: Send + Sync {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, JobError>;
}

/// All regular files under `dir`, recursively.
pub(crate) fn list_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    list_files_recursive(dir, &mut files)?;
    files.sort();
    Ok(files)
}

fn list_files_recursive(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            list_files_recursive(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

fn extracted_files(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, JobError> {
    let files = list_files(dest)?;
    if files.is_empty() {
        return Err(JobError::Extraction(format!(
            "{} is empty",
            archive.display()
        )));
    }
    Ok(files)
}

/// In-process `.zip` extraction.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipExtractor;

impl Extractor for ZipExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, JobError> {
        let file = File::open(archive)
            .map_err(|e| JobError::Extraction(format!("cannot open {}: {e}", archive.display())))?;
        let mut zip = ZipArchive::new(file)
            .map_err(|e| JobError::Extraction(format!("{}: {e}", archive.display())))?;
        zip.extract(dest)
            .map_err(|e| JobError::Extraction(format!("{}: {e}", archive.display())))?;
        extracted_files(archive, dest)
    }
}

/// `.7z` extraction through an external 7-Zip executable.
#[derive(Debug, Clone)]
pub struct SevenZipExtractor {
    program: PathBuf,
}

impl SevenZipExtractor {
    const EXECUTABLES: &'static [&'static str] = &["7z", "7za", "7zz"];

    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    pub fn discover() -> Option<Self> {
        for exe in Self::EXECUTABLES {
            if let Ok(program) = which::which(exe) {
                tracing::debug!(program = %program.display(), "using 7-Zip");
                return Some(Self::new(program));
            }
        }
        tracing::info!("7-Zip executable not found in PATH; .7z archives will fail to extract");
        None
    }
}

impl Extractor for SevenZipExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, JobError> {
        let output = Command::new(&self.program)
            .arg("x")
            .arg("-y")
            .arg(format!("-o{}", dest.display()))
            .arg(archive)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                JobError::Extraction(format!("cannot run {}: {e}", self.program.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no diagnostic output");
            return Err(JobError::Extraction(format!(
                "{} exited with {}: {}",
                archive.display(),
                output.status,
                detail.trim()
            )));
        }
        extracted_files(archive, dest)
    }
}

/// Chooses the extractor from the archive extension.
#[derive(Debug, Clone, Default)]
pub struct ArchiveExtractor {
    seven_zip: Option<SevenZipExtractor>,
    zip: ZipExtractor,
}

impl ArchiveExtractor {
    pub fn new(seven_zip: Option<SevenZipExtractor>) -> Self {
        Self {
            seven_zip,
            zip: ZipExtractor,
        }
    }

    pub fn discover() -> Self {
        Self::new(SevenZipExtractor::discover())
    }
}

impl Extractor for ArchiveExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, JobError> {
        let ext = archive
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "zip" => self.zip.extract(archive, dest),
            "7z" => match &self.seven_zip {
                Some(seven_zip) => seven_zip.extract(archive, dest),
                None => Err(JobError::Extraction(format!(
                    "7-Zip executable not found (tried {})",
                    SevenZipExtractor::EXECUTABLES.join(", ")
                ))),
            },
            other => Err(JobError::Extraction(format!(
                "unsupported archive type \"{other}\""
            ))),
        }
    }
}
