use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// Keyword that introduced a disk marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskKind {
    Disc,
    Disk,
    Cd,
}

impl DiskKind {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_lowercase().as_str() {
            "disc" => Some(Self::Disc),
            "disk" => Some(Self::Disk),
            "cd" => Some(Self::Cd),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Disc => "Disc",
            Self::Disk => "Disk",
            Self::Cd => "CD",
        }
    }
}

/// A recognized `<keyword><number>` marker and the title left once it is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskMarker {
    pub base_title: String,
    pub index: u32,
    pub kind: DiskKind,
}

type Matcher = fn(&str) -> Option<DiskMarker>;

/// Evaluated in order; the first rule that matches wins.
const MATCHERS: &[Matcher] = &[bracketed_marker, separated_marker];

/// `(Disc 1)`, `[CD2]`, `(Disk 3 of 4)`
static BRACKETED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[\(\[]\s*(disc|disk|cd)\s*[-_#.]?\s*(\d+)(?:\s*of\s*\d+)?\s*[\)\]]").unwrap()
});

/// `Game Disc 1`, `Game - CD2`, `Game_Disk_3`
static SEPARATED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[\s\-_.,](disc|disk|cd)\s*[-_#.]?\s*(\d+)\b").unwrap()
});

/// What may follow a marker: only bracketed tags such as `(USA)` or `(Rev 1)`.
static TAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[\s\-_.,]*[\(\[][^\)\]]*[\)\]])*[\s\-_.,]*$").unwrap());

fn is_separator(c: char) -> bool {
    c.is_whitespace() || matches!(c, '-' | '_' | '.' | ',')
}

fn marker_from(name: &str, caps: &Captures<'_>) -> Option<DiskMarker> {
    let whole = caps.get(0)?;
    if !TAIL_RE.is_match(&name[whole.end()..]) {
        return None;
    }
    let base_title = name[..whole.start()].trim_end_matches(is_separator).trim();
    if base_title.is_empty() {
        return None;
    }
    let kind = DiskKind::from_keyword(caps.get(1)?.as_str())?;
    let index = caps.get(2)?.as_str().parse().ok()?;
    Some(DiskMarker {
        base_title: base_title.to_string(),
        index,
        kind,
    })
}

fn last_marker(re: &Regex, name: &str) -> Option<DiskMarker> {
    re.captures_iter(name)
        .filter_map(|caps| marker_from(name, &caps))
        .last()
}

fn bracketed_marker(name: &str) -> Option<DiskMarker> {
    last_marker(&BRACKETED_RE, name)
}

fn separated_marker(name: &str) -> Option<DiskMarker> {
    last_marker(&SEPARATED_RE, name)
}

/// Parse a file stem (no extension) into base title and disk marker.
///
/// A bare number is never a marker: `Game 64` stays a title.
pub fn parse_stem(stem: &str) -> Option<DiskMarker> {
    MATCHERS.iter().find_map(|matcher| matcher(stem))
}

/// Comparison key for titles: NFC, whitespace collapsed, case-folded.
pub fn group_key(title: &str) -> String {
    let normalized: String = title.nfc().collect();
    normalized
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// One archive found in the source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub file_name: String,
    pub base_title: String,
    pub disk_index: Option<u32>,
    pub disk_kind: Option<DiskKind>,
}

impl ArchiveEntry {
    pub fn from_path(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?.to_string();
        let stem = path.file_stem()?.to_str()?.trim();
        if stem.is_empty() {
            return None;
        }
        let entry = match parse_stem(stem) {
            Some(marker) => Self {
                path: path.to_path_buf(),
                file_name,
                base_title: marker.base_title,
                disk_index: Some(marker.index),
                disk_kind: Some(marker.kind),
            },
            None => Self {
                path: path.to_path_buf(),
                file_name,
                base_title: stem.to_string(),
                disk_index: None,
                disk_kind: None,
            },
        };
        Some(entry)
    }

    /// File stem, used to name the converted output.
    pub fn stem(&self) -> &str {
        Path::new(&self.file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.file_name)
    }

    pub fn group_key(&self) -> String {
        group_key(&self.base_title)
    }

    /// `Disc 2`, or `None` for unmarked entries.
    pub fn disk_label(&self) -> Option<String> {
        Some(format!("{} {}", self.disk_kind?.label(), self.disk_index?))
    }
}
