use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::disc_name::parse_stem;
use crate::group::GameGroup;
use crate::keyed_lock::KeyedLocks;

pub const PLAYLIST_EXTENSION: &str = "m3u";

/// First lines of every playlist we write. Files without it are user-made.
const GENERATOR_MARKER: &str = "# Generated by chdpack";

/// Replace characters that are invalid in file names on common platforms.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Disk index an entry line refers to, from its file name.
fn entry_index(entry: &str) -> Option<u32> {
    let stem = Path::new(entry).file_stem()?.to_str()?;
    parse_stem(stem).map(|m| m.index)
}

struct ExistingPlaylist {
    entries: BTreeMap<u32, String>,
    generated: bool,
}

fn read_playlist(path: &Path) -> io::Result<Option<ExistingPlaylist>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let text = String::from_utf8_lossy(&bytes);

    let mut entries = BTreeMap::new();
    let mut generated = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') {
            generated |= line == GENERATOR_MARKER;
            continue;
        }
        match entry_index(line) {
            Some(index) => {
                entries.entry(index).or_insert_with(|| line.to_string());
            }
            None => tracing::warn!(
                playlist = %path.display(),
                entry = line,
                "dropping playlist entry without a disk number"
            ),
        }
    }
    Ok(Some(ExistingPlaylist { entries, generated }))
}

fn render(title: &str, entries: &BTreeMap<u32, String>) -> String {
    let indices: Vec<u32> = entries.keys().copied().collect();
    let max = indices.last().copied().unwrap_or(0);
    let missing: Vec<String> = (1..=max)
        .filter(|i| !entries.contains_key(i))
        .map(|i| i.to_string())
        .collect();

    let mut out = String::new();
    let _ = writeln!(out, "# {title} - multi-disk playlist");
    let _ = writeln!(out, "{GENERATOR_MARKER}");
    let _ = writeln!(
        out,
        "# Disks: {}",
        indices.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
    );
    if !missing.is_empty() {
        let _ = writeln!(out, "# Missing: {}", missing.join(", "));
    }
    for entry in entries.values() {
        let _ = writeln!(out, "{entry}");
    }
    out
}

/// Maintains one `.m3u` per multi-disk game in a directory.
#[derive(Debug)]
pub struct PlaylistManager {
    dir: PathBuf,
    locks: KeyedLocks<PathBuf>,
}

impl PlaylistManager {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn playlist_path(&self, group: &GameGroup) -> PathBuf {
        self.dir.join(format!(
            "{}.{PLAYLIST_EXTENSION}",
            sanitize_file_name(&group.title)
        ))
    }

    /// How the playlist refers to `output`: relative to the playlist when possible.
    fn entry_for(&self, output: &Path) -> String {
        let relative = pathdiff::diff_paths(output, &self.dir).unwrap_or_else(|| output.to_path_buf());
        relative.to_string_lossy().replace('\\', "/")
    }

    /// Merge a finished disk into the group's playlist and rewrite it in disk order.
    ///
    /// Disks not yet converted are simply absent. Calling again with the same
    /// arguments leaves the file byte-identical.
    pub fn on_disk_completed(
        &self,
        group: &GameGroup,
        disk_index: u32,
        output: &Path,
    ) -> io::Result<PathBuf> {
        let path = self.playlist_path(group);
        self.locks.with_lock(&path, || {
            let mut entries = match read_playlist(&path)? {
                Some(existing) => {
                    if !existing.generated {
                        let backup = path.with_extension(format!("{PLAYLIST_EXTENSION}.bak"));
                        if !backup.exists() {
                            fs::copy(&path, &backup)?;
                            tracing::info!(
                                playlist = %path.display(),
                                backup = %backup.display(),
                                "backed up user playlist before rewriting"
                            );
                        }
                    }
                    existing.entries
                }
                None => BTreeMap::new(),
            };
            entries.insert(disk_index, self.entry_for(output));

            let content = render(&group.title, &entries);
            if fs::read(&path).is_ok_and(|current| current == content.as_bytes()) {
                return Ok(path.clone());
            }

            fs::create_dir_all(&self.dir)?;
            let temp_path = path.with_extension(format!("{PLAYLIST_EXTENSION}.tmp"));
            fs::write(&temp_path, content.as_bytes())?;
            fs::rename(&temp_path, &path)?;

            let max = entries.keys().last().copied().unwrap_or(0);
            if entries.len() < max as usize {
                tracing::warn!(
                    playlist = %path.display(),
                    present = entries.len(),
                    highest = max,
                    "playlist written with missing disks"
                );
            } else {
                tracing::info!(playlist = %path.display(), disks = entries.len(), "playlist updated");
            }
            Ok(path.clone())
        })
    }
}
