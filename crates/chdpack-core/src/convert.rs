use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use crate::control::CancellationToken;
use crate::error::{FatalError, JobError};

/// Receives the converter's textual progress, one segment at a time.
pub type ProgressSink<'a> = &'a (dyn Fn(&str) + Sync);

/// Turns a disk image into the target compressed format.
pub trait Converter: Send + Sync {
    /// Check that the converter can run at all.
    fn probe(&self) -> Result<(), FatalError>;

    fn convert(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
        progress: ProgressSink<'_>,
    ) -> Result<(), JobError>;
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// MAME's `chdman`.
#[derive(Debug, Clone)]
pub struct Chdman {
    program: PathBuf,
}

impl Chdman {
    pub const PATH_ENV: &'static str = "CHDMAN_PATH";

    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Locate chdman: explicit path, `CHDMAN_PATH`, `PATH`, then common
    /// install locations.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, FatalError> {
        if let Some(path) = explicit {
            if path.is_file() {
                return Ok(Self::new(path.to_path_buf()));
            }
            return Err(FatalError::ConverterUnavailable(format!(
                "chdman not found at {}",
                path.display()
            )));
        }

        if let Some(path) = std::env::var_os(Self::PATH_ENV).map(PathBuf::from) {
            if path.is_file() {
                tracing::info!(chdman = %path.display(), "using chdman from {}", Self::PATH_ENV);
                return Ok(Self::new(path));
            }
            tracing::warn!(chdman = %path.display(), "{} does not point to a file", Self::PATH_ENV);
        }

        if let Ok(path) = which::which("chdman") {
            tracing::info!(chdman = %path.display(), "using chdman from PATH");
            return Ok(Self::new(path));
        }

        for location in common_locations() {
            if location.is_file() {
                tracing::info!(chdman = %location.display(), "using chdman from common location");
                return Ok(Self::new(location));
            }
        }

        Err(FatalError::ConverterUnavailable(
            "chdman executable not found; install MAME tools or pass --chdman".to_string(),
        ))
    }
}

fn common_locations() -> Vec<PathBuf> {
    let mut locations = Vec::new();
    if cfg!(target_os = "windows") {
        locations.push(PathBuf::from(r"C:\Program Files\MAME\chdman.exe"));
        locations.push(PathBuf::from(r"C:\Program Files (x86)\MAME\chdman.exe"));
    } else if cfg!(target_os = "macos") {
        locations.push(PathBuf::from("/Applications/MAME.app/Contents/MacOS/chdman"));
        if let Some(home) = std::env::var_os("HOME") {
            locations.push(PathBuf::from(home).join("Applications/MAME.app/Contents/MacOS/chdman"));
        }
    } else {
        locations.push(PathBuf::from("/usr/bin/chdman"));
        locations.push(PathBuf::from("/usr/local/bin/chdman"));
        locations.push(PathBuf::from("/usr/games/chdman"));
    }
    locations
}

/// Forward `\r`/`\n` separated segments of `reader` to `progress`, returning
/// the last non-empty segment for diagnostics.
fn pump_progress(mut reader: impl Read, progress: ProgressSink<'_>) -> String {
    let mut last = String::new();
    let mut pending = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\r' || b == b'\n' {
                let segment = String::from_utf8_lossy(&pending).trim().to_string();
                pending.clear();
                if !segment.is_empty() {
                    progress(&segment);
                    last = segment;
                }
            } else {
                pending.push(b);
            }
        }
    }
    let segment = String::from_utf8_lossy(&pending).trim().to_string();
    if !segment.is_empty() {
        progress(&segment);
        last = segment;
    }
    last
}

fn wait_or_kill(child: &mut Child, cancel: &CancellationToken) -> Result<std::process::ExitStatus, JobError> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(JobError::Cancelled);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

impl Converter for Chdman {
    fn probe(&self) -> Result<(), FatalError> {
        Command::new(&self.program)
            .arg("--help")
            .stdin(Stdio::null())
            .output()
            .map(|_| ())
            .map_err(|e| {
                FatalError::ConverterUnavailable(format!(
                    "cannot run {}: {e}",
                    self.program.display()
                ))
            })
    }

    fn convert(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
        progress: ProgressSink<'_>,
    ) -> Result<(), JobError> {
        cancel.check()?;

        let mut command = Command::new(&self.program);
        command
            .arg("createcd")
            .arg("-i")
            .arg(input)
            .arg("-o")
            .arg(output)
            .arg("-f")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        tracing::debug!(?command, "running chdman");

        let mut child = command.spawn().map_err(|e| {
            JobError::Conversion(format!("cannot run {}: {e}", self.program.display()))
        })?;
        let stderr = child.stderr.take();

        let (status, last_line) = std::thread::scope(|s| {
            let reader = s.spawn(move || match stderr {
                Some(stderr) => pump_progress(stderr, progress),
                None => String::new(),
            });
            let status = wait_or_kill(&mut child, cancel);
            let last_line = reader.join().unwrap_or_default();
            (status, last_line)
        });

        let status = status?;
        if !status.success() {
            let detail = if last_line.is_empty() {
                "no diagnostic output".to_string()
            } else {
                last_line
            };
            return Err(JobError::Conversion(format!("chdman exited with {status}: {detail}")));
        }

        match fs::metadata(output) {
            Ok(meta) if meta.len() > 0 => Ok(()),
            Ok(_) => Err(JobError::Conversion("chdman produced an empty file".to_string())),
            Err(_) => Err(JobError::Conversion("chdman produced no output file".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[test]
    fn test_pump_progress_splits_on_carriage_returns() {
        let seen = Mutex::new(Vec::new());
        let sink = |s: &str| seen.lock().unwrap().push(s.to_string());
        let input: &[u8] = b"Compressing, 10.0% complete...\rCompressing, 55.5% complete...\r\nCompression complete ... final ratio = 48.2%\n";
        let last = pump_progress(input, &sink);

        assert_eq!(last, "Compression complete ... final ratio = 48.2%");
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_explicit_missing_path_is_unavailable() {
        let dir = tempdir().unwrap();
        let err = Chdman::discover(Some(&dir.path().join("chdman"))).unwrap_err();
        assert!(matches!(err, FatalError::ConverterUnavailable(_)));
    }

    #[test]
    fn test_probe_fails_for_missing_program() {
        let dir = tempdir().unwrap();
        let chdman = Chdman::new(dir.path().join("no-such-chdman"));
        assert!(chdman.probe().is_err());
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        // Stand-in for chdman: `createcd -i IN -o OUT -f`
        fn script(dir: &Path, body: &str) -> Chdman {
            let path = dir.join("fake-chdman");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            Chdman::new(path)
        }

        #[test]
        fn test_successful_conversion_streams_progress() {
            let dir = tempdir().unwrap();
            let chdman = script(
                dir.path(),
                "printf 'Compressing, 50.0%% complete...\\r' >&2\ncp \"$3\" \"$5\"",
            );
            let input = dir.path().join("in.iso");
            let output = dir.path().join("out.chd");
            fs::write(&input, b"image").unwrap();

            let lines = Mutex::new(Vec::new());
            let sink = |s: &str| lines.lock().unwrap().push(s.to_string());
            chdman
                .convert(&input, &output, &CancellationToken::new(), &sink)
                .unwrap();

            assert_eq!(fs::read(&output).unwrap(), b"image");
            assert_eq!(lines.lock().unwrap().as_slice(), ["Compressing, 50.0% complete..."]);
        }

        #[test]
        fn test_non_zero_exit_is_conversion_error() {
            let dir = tempdir().unwrap();
            let chdman = script(dir.path(), "echo 'Error: unsupported input' >&2\nexit 1");
            let input = dir.path().join("in.iso");
            fs::write(&input, b"image").unwrap();

            let err = chdman
                .convert(&input, &dir.path().join("out.chd"), &CancellationToken::new(), &|_| {})
                .unwrap_err();
            assert!(matches!(err, JobError::Conversion(ref m) if m.contains("unsupported input")));
        }

        #[test]
        fn test_empty_output_is_conversion_error() {
            let dir = tempdir().unwrap();
            let chdman = script(dir.path(), ": > \"$5\"");
            let input = dir.path().join("in.iso");
            fs::write(&input, b"image").unwrap();

            let err = chdman
                .convert(&input, &dir.path().join("out.chd"), &CancellationToken::new(), &|_| {})
                .unwrap_err();
            assert!(matches!(err, JobError::Conversion(ref m) if m.contains("empty")));
        }

        #[test]
        fn test_cancellation_kills_running_conversion() {
            let dir = tempdir().unwrap();
            let chdman = script(dir.path(), "exec sleep 30");
            let input = dir.path().join("in.iso");
            fs::write(&input, b"image").unwrap();

            let token = CancellationToken::new();
            let canceller = token.clone();
            let handle = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(200));
                canceller.cancel();
            });

            let started = std::time::Instant::now();
            let err = chdman
                .convert(&input, &dir.path().join("out.chd"), &token, &|_| {})
                .unwrap_err();
            handle.join().unwrap();

            assert!(matches!(err, JobError::Cancelled));
            assert!(started.elapsed() < Duration::from_secs(10));
        }
    }
}
