use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current ledger file format version
const LEDGER_VERSION: u32 = 1;

/// Default ledger filename, placed in the destination directory
pub const LEDGER_FILENAME: &str = ".chdpack-ledger.json";

/// Identifies an archive by location, size and modification time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveIdentity {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: i64,
}

impl ArchiveIdentity {
    pub fn of(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let mtime = metadata
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            mtime,
        })
    }

    /// Stable key for the ledger map.
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.path.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.size.to_le_bytes());
        hasher.update(self.mtime.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Succeeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub archive: PathBuf,
    pub size: u64,
    pub mtime: i64,
    pub status: LedgerStatus,
    pub timestamp: DateTime<Utc>,
    pub output_path: PathBuf,
}

impl LedgerEntry {
    /// True when the recorded output is still present and non-empty.
    pub fn output_is_valid(&self) -> bool {
        fs::metadata(&self.output_path).is_ok_and(|m| m.is_file() && m.len() > 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    updated: DateTime<Utc>,
    entries: BTreeMap<String, LedgerEntry>,
}

impl LedgerFile {
    fn empty() -> Self {
        Self {
            version: LEDGER_VERSION,
            updated: Utc::now(),
            entries: BTreeMap::new(),
        }
    }
}

/// Persistent record of finished conversions. Safe to share across workers.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    state: Mutex<LedgerFile>,
    warning: Option<String>,
}

impl Ledger {
    /// Load the ledger at `path`.
    ///
    /// A missing file starts empty. An unreadable, corrupt or foreign-version
    /// file is moved aside to `<name>.corrupt` and also starts empty.
    pub fn open(path: &Path) -> Self {
        let (state, warning) = match Self::load(path) {
            Ok(Some(file)) if file.version == LEDGER_VERSION => (file, None),
            Ok(Some(file)) => (
                LedgerFile::empty(),
                Some(format!(
                    "ledger {} has unsupported version {}; starting fresh",
                    path.display(),
                    file.version
                )),
            ),
            Ok(None) => (LedgerFile::empty(), None),
            Err(e) => {
                let aside = path.with_extension("json.corrupt");
                let kept = match fs::rename(path, &aside) {
                    Ok(()) => format!("old copy kept at {}", aside.display()),
                    Err(rename_err) => {
                        format!("old copy could not be moved aside ({rename_err}) and will be overwritten")
                    }
                };
                (
                    LedgerFile::empty(),
                    Some(format!(
                        "ledger {} is unreadable ({e}); starting fresh, {kept}",
                        path.display()
                    )),
                )
            }
        };
        if let Some(w) = &warning {
            tracing::warn!("{w}");
        } else {
            tracing::debug!(ledger = %path.display(), entries = state.entries.len(), "ledger loaded");
        }
        Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
            warning,
        }
    }

    fn load(path: &Path) -> anyhow::Result<Option<LedgerFile>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let ledger: LedgerFile = serde_json::from_reader(reader)?;
        Ok(Some(ledger))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set when the backing file had to be discarded.
    pub fn recovery_warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has(&self, identity: &ArchiveIdentity) -> Option<LedgerEntry> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.get(&identity.key()).cloned()
    }

    /// Record a successful conversion and persist the ledger.
    pub fn record(&self, identity: &ArchiveIdentity, output_path: &Path) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        state.entries.insert(
            identity.key(),
            LedgerEntry {
                archive: identity.path.clone(),
                size: identity.size,
                mtime: identity.mtime,
                status: LedgerStatus::Succeeded,
                timestamp: now,
                output_path: output_path.to_path_buf(),
            },
        );
        state.updated = now;
        Self::save(&self.path, &state)
    }

    fn save(path: &Path, state: &LedgerFile) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("json.tmp");

        // Write to temp file first, then rename for atomicity
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, state)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn archive(dir: &Path, name: &str) -> ArchiveIdentity {
        let path = dir.join(name);
        fs::write(&path, b"archive bytes").unwrap();
        ArchiveIdentity::of(&path).unwrap()
    }

    fn output(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"chd").unwrap();
        path
    }

    #[test]
    fn test_record_survives_reopen() {
        let dir = tempdir().unwrap();
        let ledger_path = dir.path().join(LEDGER_FILENAME);
        let id = archive(dir.path(), "Game.7z");
        let out = output(dir.path(), "Game.chd");

        let ledger = Ledger::open(&ledger_path);
        assert!(ledger.has(&id).is_none());
        ledger.record(&id, &out).unwrap();

        let reopened = Ledger::open(&ledger_path);
        assert!(reopened.recovery_warning().is_none());
        let entry = reopened.has(&id).unwrap();
        assert_eq!(entry.status, LedgerStatus::Succeeded);
        assert_eq!(entry.output_path, out);
        assert!(entry.output_is_valid());
    }

    #[test]
    fn test_corrupt_ledger_degrades_to_empty() {
        let dir = tempdir().unwrap();
        let ledger_path = dir.path().join(LEDGER_FILENAME);
        fs::write(&ledger_path, b"{\"version\": 1, \"entries\": {").unwrap();

        let ledger = Ledger::open(&ledger_path);
        assert!(ledger.is_empty());
        assert!(ledger.recovery_warning().is_some());
        assert!(dir.path().join(".chdpack-ledger.json.corrupt").exists());

        let id = archive(dir.path(), "Game.7z");
        ledger.record(&id, &output(dir.path(), "Game.chd")).unwrap();
        assert_eq!(Ledger::open(&ledger_path).len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_ledger_that_cannot_be_moved_aside() {
        let dir = tempdir().unwrap();
        let ledger_path = dir.path().join(LEDGER_FILENAME);
        fs::create_dir(&ledger_path).unwrap();
        // A directory in the way of the aside name makes the rename fail.
        fs::create_dir(dir.path().join(".chdpack-ledger.json.corrupt")).unwrap();
        fs::write(dir.path().join(".chdpack-ledger.json.corrupt/keep"), b"x").unwrap();

        let ledger = Ledger::open(&ledger_path);
        let warning = ledger.recovery_warning().unwrap();
        assert!(warning.contains("could not be moved aside"), "{warning}");
        assert!(!warning.contains("kept at"));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_unknown_version_degrades_to_empty() {
        let dir = tempdir().unwrap();
        let ledger_path = dir.path().join(LEDGER_FILENAME);
        fs::write(
            &ledger_path,
            br#"{"version": 99, "updated": "2024-01-01T00:00:00Z", "entries": {}}"#,
        )
        .unwrap();

        let ledger = Ledger::open(&ledger_path);
        assert!(ledger.is_empty());
        assert!(ledger.recovery_warning().unwrap().contains("version 99"));
    }

    #[test]
    fn test_identity_changes_with_mtime() {
        let dir = tempdir().unwrap();
        let id = archive(dir.path(), "Game.7z");
        filetime::set_file_mtime(&id.path, filetime::FileTime::from_unix_time(1_000_000, 0))
            .unwrap();
        let touched = ArchiveIdentity::of(&id.path).unwrap();

        assert_ne!(id.key(), touched.key());
        assert_eq!(touched.mtime, 1_000_000);
    }

    #[test]
    fn test_missing_output_is_not_valid() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(&dir.path().join(LEDGER_FILENAME));
        let id = archive(dir.path(), "Game.7z");
        let out = output(dir.path(), "Game.chd");
        ledger.record(&id, &out).unwrap();

        fs::remove_file(&out).unwrap();
        assert!(!ledger.has(&id).unwrap().output_is_valid());
    }

    #[test]
    fn test_concurrent_records_are_all_kept() {
        let dir = tempdir().unwrap();
        let ledger_path = dir.path().join(LEDGER_FILENAME);
        let ledger = Ledger::open(&ledger_path);
        let ids: Vec<_> = (0..16)
            .map(|i| (archive(dir.path(), &format!("g{i}.7z")), output(dir.path(), &format!("g{i}.chd"))))
            .collect();

        std::thread::scope(|s| {
            for (id, out) in &ids {
                let ledger = &ledger;
                s.spawn(move || ledger.record(id, out).unwrap());
            }
        });

        let reopened = Ledger::open(&ledger_path);
        assert_eq!(reopened.len(), 16);
        for (id, _) in &ids {
            assert!(reopened.has(id).is_some());
        }
    }
}
