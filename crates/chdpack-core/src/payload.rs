use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::JobError;

/// Raw disk-image extensions the converter accepts.
pub const IMAGE_EXTENSIONS: &[&str] = &["iso", "bin", "img", "nrg", "cdi"];

/// Track-sheet extensions. A sheet is converted in place of its tracks.
pub const DESCRIPTOR_EXTENSIONS: &[&str] = &["cue", "gdi", "toc"];

/// How far below the extraction root the search descends.
pub const MAX_SEARCH_DEPTH: usize = 4;

static CUE_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?im)^\s*FILE\s+(?:"([^"]+)"|(\S+))"#).unwrap());

/// The file handed to the converter plus the track files it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub primary: PathBuf,
    pub tracks: Vec<PathBuf>,
}

fn has_extension(path: &Path, set: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| set.iter().any(|s| s.eq_ignore_ascii_case(ext)))
}

fn walk(dir: &Path, depth: usize, found: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if depth < MAX_SEARCH_DEPTH {
                walk(&path, depth + 1, found)?;
            }
        } else {
            found.push(path);
        }
    }
    Ok(())
}

fn display_names(paths: &[PathBuf], root: &Path) -> String {
    paths
        .iter()
        .map(|p| p.strip_prefix(root).unwrap_or(p).display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Track files named by a cue sheet, resolved next to the sheet.
fn cue_tracks(cue: &Path) -> Result<Vec<PathBuf>, JobError> {
    let bytes = fs::read(cue)?;
    let text = String::from_utf8_lossy(&bytes);
    let dir = cue.parent().unwrap_or(Path::new("."));

    let mut tracks = Vec::new();
    for caps in CUE_FILE_RE.captures_iter(&text) {
        let Some(name) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        let track = dir.join(name.as_str());
        if !track.is_file() {
            return Err(JobError::MalformedInput(format!(
                "{} references missing track \"{}\"",
                cue.file_name().and_then(|n| n.to_str()).unwrap_or("cue sheet"),
                name.as_str()
            )));
        }
        tracks.push(track);
    }
    Ok(tracks)
}

/// Find the disk image to convert under `root`.
///
/// A single track sheet wins over raw images. Without a sheet exactly one
/// raw image must be present; several are ambiguous and rejected rather than
/// guessed.
pub fn locate_payload(root: &Path) -> Result<Payload, JobError> {
    let mut files = Vec::new();
    walk(root, 0, &mut files)?;
    files.sort();

    let descriptors: Vec<PathBuf> = files
        .iter()
        .filter(|p| has_extension(p, DESCRIPTOR_EXTENSIONS))
        .cloned()
        .collect();
    let images: Vec<PathBuf> = files
        .into_iter()
        .filter(|p| has_extension(p, IMAGE_EXTENSIONS))
        .collect();

    match descriptors.as_slice() {
        [descriptor] => {
            let tracks = if has_extension(descriptor, &["cue"]) {
                cue_tracks(descriptor)?
            } else {
                let dir = descriptor.parent().unwrap_or(root);
                images
                    .iter()
                    .filter(|p| p.parent() == Some(dir))
                    .cloned()
                    .collect()
            };
            Ok(Payload {
                primary: descriptor.clone(),
                tracks,
            })
        }
        [] => match images.as_slice() {
            [image] => Ok(Payload {
                primary: image.clone(),
                tracks: Vec::new(),
            }),
            [] => Err(JobError::MalformedInput(
                "no disk image found in archive".to_string(),
            )),
            many => Err(JobError::MalformedInput(format!(
                "ambiguous disk images without a track sheet: {}",
                display_names(many, root)
            ))),
        },
        many => Err(JobError::MalformedInput(format!(
            "multiple track sheets: {}",
            display_names(many, root)
        ))),
    }
}
