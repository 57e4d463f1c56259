use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

/// Regular files directly inside a directory, keyed by file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirSnapshot {
    root: PathBuf,
    files: BTreeMap<OsString, FileStamp>,
}

impl DirSnapshot {
    pub fn capture(root: &Path) -> std::io::Result<Self> {
        let mut files = BTreeMap::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            // Entries can vanish between listing and stat.
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            files.insert(
                entry.file_name(),
                FileStamp {
                    len: metadata.len(),
                    modified: metadata.modified().ok(),
                },
            );
        }
        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files present in `self` that were absent from `before` or whose size or
    /// modification time differ.
    pub fn changed_since(&self, before: &DirSnapshot) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter(|(name, stamp)| before.files.get(*name) != Some(*stamp))
            .map(|(name, _)| self.root.join(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn capture_skips_directories() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("a.csv"), "x").expect("write");
        fs::create_dir(dir.path().join("nested")).expect("mkdir");

        let snapshot = DirSnapshot::capture(dir.path()).expect("capture");
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot.is_empty());
    }

    #[test]
    fn changed_since_reports_new_and_resized_files() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("kept.txt"), "same").expect("write kept");
        fs::write(dir.path().join("grown.txt"), "a").expect("write grown");
        let before = DirSnapshot::capture(dir.path()).expect("before");

        fs::write(dir.path().join("grown.txt"), "abc").expect("grow");
        fs::write(dir.path().join("new.png"), "img").expect("new");
        let after = DirSnapshot::capture(dir.path()).expect("after");

        let mut changed = after.changed_since(&before);
        changed.sort();
        assert_eq!(
            changed,
            vec![dir.path().join("grown.txt"), dir.path().join("new.png")]
        );
    }
}
