use std::fs;
use std::path::{Path, PathBuf};

use crate::disc_name::ArchiveEntry;
use crate::error::FatalError;

/// Archive extensions picked up from the source directory.
pub const ARCHIVE_EXTENSIONS: &[&str] = &["7z", "zip"];

fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ARCHIVE_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(ext)))
}

/// Recursively collect supported archives under `source`.
///
/// Only the top-level directory must be readable; unreadable subdirectories
/// are logged and skipped.
pub fn scan_source(source: &Path) -> Result<Vec<ArchiveEntry>, FatalError> {
    let entries = fs::read_dir(source).map_err(|e| FatalError::SourceUnreadable {
        path: source.to_path_buf(),
        source: e,
    })?;

    let mut found = Vec::new();
    collect(entries, &mut found);
    found.sort();

    let archives: Vec<ArchiveEntry> = found
        .iter()
        .filter_map(|p| ArchiveEntry::from_path(p))
        .collect();
    tracing::info!(count = archives.len(), source = %source.display(), "found archives");
    Ok(archives)
}

fn collect(entries: fs::ReadDir, found: &mut Vec<PathBuf>) {
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            match fs::read_dir(&path) {
                Ok(sub) => collect(sub, found),
                Err(e) => tracing::warn!(dir = %path.display(), "skipping unreadable directory: {e}"),
            }
        } else if is_archive(&path) {
            found.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_scan_finds_nested_archives() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("psx/rpg")).unwrap();
        fs::write(dir.path().join("Other Game.7z"), b"x").unwrap();
        fs::write(dir.path().join("psx/rpg/Quest (Disc 1).ZIP"), b"x").unwrap();
        fs::write(dir.path().join("readme.txt"), b"x").unwrap();

        let found = scan_source(dir.path()).unwrap();
        let names: Vec<_> = found.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"Other Game.7z"));
        assert!(names.contains(&"Quest (Disc 1).ZIP"));
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let dir = tempdir().unwrap();
        let err = scan_source(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, FatalError::SourceUnreadable { .. }));
    }
}
