//! Change detection over the account config directory.
//!
//! Files are keyed by name plus modification time plus length; a scan diffs
//! the directory against the previously recorded set and reports creates,
//! deletes and updates. Hidden files (and therefore our own temporary write
//! files) are ignored.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

/// The outcome of one directory scan. Paths are sorted for determinism.
#[derive(Debug, Default)]
pub(crate) struct ScanDiff {
    pub creates: Vec<PathBuf>,
    pub deletes: Vec<PathBuf>,
    pub updates: Vec<PathBuf>,
}

impl ScanDiff {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.deletes.is_empty() && self.updates.is_empty()
    }
}

/// Tracks the last observed state of every file in the directory.
#[derive(Debug, Default)]
pub(crate) struct FileCache {
    all: HashMap<PathBuf, FileStamp>,
}

impl FileCache {
    /// Diff the directory contents against the recorded state, updating the
    /// recorded state in the process.
    pub fn scan(&mut self, dir: &Path) -> io::Result<ScanDiff> {
        let mut current = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if entry
                .file_name()
                .to_string_lossy()
                .starts_with('.')
            {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };

            let stamp = FileStamp {
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                len: meta.len(),
            };
            current.insert(path, stamp);
        }

        let mut diff = ScanDiff::default();
        for (path, stamp) in &current {
            match self.all.get(path) {
                None => diff.creates.push(path.clone()),
                Some(old) if old != stamp => diff.updates.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in self.all.keys() {
            if !current.contains_key(path) {
                diff.deletes.push(path.clone());
            }
        }

        diff.creates.sort();
        diff.deletes.sort();
        diff.updates.sort();

        self.all = current;
        Ok(diff)
    }
}
