use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::disc_name::{group_key, ArchiveEntry};

/// Archives that make up one logical game, ordered by disk index.
#[derive(Debug, Clone)]
pub struct GameGroup {
    /// Case-folded title used for grouping and per-group locking.
    pub key: String,
    /// Title as written in the first member's file name.
    pub title: String,
    pub members: Vec<ArchiveEntry>,
    pub multi_disk: bool,
}

impl GameGroup {
    fn singleton(entry: ArchiveEntry) -> Self {
        Self {
            key: group_key(entry.stem()),
            title: entry.stem().to_string(),
            members: vec![entry],
            multi_disk: false,
        }
    }

    pub fn is_multi_disk(&self) -> bool {
        self.multi_disk
    }

    pub fn disk_indices(&self) -> Vec<u32> {
        self.members.iter().filter_map(|m| m.disk_index).collect()
    }
}

/// A file name the resolver could not place cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedInput {
    pub path: PathBuf,
    pub conflicts_with: Option<PathBuf>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub groups: Vec<GameGroup>,
    pub issues: Vec<MalformedInput>,
}

impl Resolution {
    pub fn entry_count(&self) -> usize {
        self.groups.iter().map(|g| g.members.len()).sum()
    }
}

/// Group archive entries into games.
///
/// Entries sharing a case-folded base title and carrying a disk marker form one
/// multi-disk group. Unmarked entries are singletons. An entry whose disk index
/// is already taken in its group is reported and falls back to a singleton.
pub fn resolve_groups(mut entries: Vec<ArchiveEntry>) -> Resolution {
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut resolution = Resolution::default();
    let mut marked: BTreeMap<String, Vec<ArchiveEntry>> = BTreeMap::new();

    for entry in entries {
        if entry.disk_index.is_some() {
            marked.entry(entry.group_key()).or_default().push(entry);
        } else {
            resolution.groups.push(GameGroup::singleton(entry));
        }
    }

    for (key, mut members) in marked {
        members.sort_by(|a, b| {
            a.disk_index
                .cmp(&b.disk_index)
                .then_with(|| a.file_name.len().cmp(&b.file_name.len()))
                .then_with(|| a.file_name.cmp(&b.file_name))
        });

        let mut kept: Vec<ArchiveEntry> = Vec::with_capacity(members.len());
        for entry in members {
            match kept.last() {
                Some(prev) if prev.disk_index == entry.disk_index => {
                    let reason = format!(
                        "duplicate disk index {} for \"{}\"",
                        entry.disk_index.unwrap_or_default(),
                        prev.base_title
                    );
                    tracing::warn!(
                        archive = %entry.path.display(),
                        other = %prev.path.display(),
                        "{reason}; converting as a standalone game"
                    );
                    resolution.issues.push(MalformedInput {
                        path: entry.path.clone(),
                        conflicts_with: Some(prev.path.clone()),
                        reason,
                    });
                    resolution.groups.push(GameGroup::singleton(entry));
                }
                _ => kept.push(entry),
            }
        }

        let title = kept
            .first()
            .map(|m| m.base_title.clone())
            .unwrap_or_else(|| key.clone());
        resolution.groups.push(GameGroup {
            key,
            title,
            members: kept,
            multi_disk: true,
        });
    }

    resolution.groups.sort_by(|a, b| a.key.cmp(&b.key));
    resolution
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::Path;

    use super::*;

    fn entries(names: &[&str]) -> Vec<ArchiveEntry> {
        names
            .iter()
            .map(|n| ArchiveEntry::from_path(&Path::new("/src").join(n)).unwrap())
            .collect()
    }

    #[test]
    fn test_multi_disc_and_singleton() {
        let res = resolve_groups(entries(&[
            "Mystic Quest (Disc 2).7z",
            "Other Game.7z",
            "Mystic Quest (Disc 1).7z",
        ]));
        assert!(res.issues.is_empty());
        assert_eq!(res.groups.len(), 2);

        let quest = res.groups.iter().find(|g| g.title == "Mystic Quest").unwrap();
        assert!(quest.is_multi_disk());
        assert_eq!(quest.disk_indices(), vec![1, 2]);

        let other = res.groups.iter().find(|g| g.title == "Other Game").unwrap();
        assert!(!other.is_multi_disk());
        assert_eq!(other.members.len(), 1);
    }

    #[test]
    fn test_order_is_ascending_for_any_input_order() {
        let orders = [
            ["G (Disc 3).7z", "G (Disc 1).7z", "G (Disc 2).7z"],
            ["G (Disc 2).7z", "G (Disc 3).7z", "G (Disc 1).7z"],
            ["G (Disc 1).7z", "G (Disc 2).7z", "G (Disc 3).7z"],
        ];
        for names in orders {
            let res = resolve_groups(entries(&names));
            assert_eq!(res.groups.len(), 1);
            assert_eq!(res.groups[0].disk_indices(), vec![1, 2, 3]);
        }
    }

    #[test]
    fn test_mixed_marker_styles_group_together() {
        let res = resolve_groups(entries(&["game - cd2.zip", "Game (Disc 1).7z"]));
        assert_eq!(res.groups.len(), 1);
        assert_eq!(res.groups[0].title, "Game");
        assert_eq!(res.groups[0].disk_indices(), vec![1, 2]);
    }

    #[test]
    fn test_duplicate_index_degrades_to_singleton() {
        let res = resolve_groups(entries(&["Foo Disc 1.7z", "Foo Disc 1 (copy).7z", "Foo Disc 2.7z"]));
        assert_eq!(res.issues.len(), 1);
        let issue = &res.issues[0];
        assert!(issue.path.ends_with("Foo Disc 1 (copy).7z"));
        assert!(issue.conflicts_with.as_ref().unwrap().ends_with("Foo Disc 1.7z"));

        let foo = res.groups.iter().find(|g| g.multi_disk).unwrap();
        assert_eq!(foo.disk_indices(), vec![1, 2]);
        assert!(foo.members[0].path.ends_with("Foo Disc 1.7z"));

        let copy = res.groups.iter().find(|g| !g.multi_disk).unwrap();
        assert_eq!(copy.members.len(), 1);
        assert_eq!(copy.title, "Foo Disc 1 (copy)");
    }

    #[test]
    fn test_every_entry_lands_in_exactly_one_group() {
        let names = [
            "A (Disc 1).7z",
            "A (Disc 2).7z",
            "A (Disc 2) [alt].7z",
            "B.7z",
            "B 64.7z",
            "C - CD1.zip",
            "c - cd3.zip",
            "D (Disk 1 of 2).7z",
        ];
        let res = resolve_groups(entries(&names));
        assert_eq!(res.entry_count(), names.len());

        let mut seen = HashSet::new();
        for group in &res.groups {
            for m in &group.members {
                assert!(seen.insert(m.path.clone()), "{} grouped twice", m.path.display());
            }
        }
        assert_eq!(seen.len(), names.len());
    }

    #[test]
    fn test_unmarked_titles_with_numbers_stay_separate() {
        let res = resolve_groups(entries(&["Game 64.7z", "Game 65.7z"]));
        assert_eq!(res.groups.len(), 2);
        assert!(res.groups.iter().all(|g| !g.multi_disk));
    }
}
