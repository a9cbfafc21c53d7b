//! Point-in-time `{path -> mtime}` maps of a directory tree.
//!
//! Snapshots drive both the polling watcher and the stabilization pass
//! of the native watcher: two snapshots are diffed into `Change`s with
//! the rules of the sync protocol (adds keyed on presence or a newer
//! mtime, removes on disappearance, equal mtimes produce nothing).

use crate::change::{to_posix, Change, ChangeOp};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Mtimes of every non-directory entry under a root.
///
/// Directory entries themselves are skipped: directory mtimes are noisy
/// and the set of files is what matters. Symlinks below the root are
/// not followed.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    files: HashMap<PathBuf, SystemTime>,
}

impl Snapshot {
    /// An empty snapshot. Diffing a fresh tree against this yields the
    /// initial set of adds.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Walk `root` and record every file's mtime.
    ///
    /// Errors on individual entries are treated as "entry absent"; an
    /// unreadable root propagates.
    pub fn take(root: &Path) -> io::Result<Self> {
        let mut files = HashMap::new();
        let mut pending = vec![root.to_path_buf()];
        let mut first = true;

        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if first => return Err(e),
                // Subdirectory vanished mid-walk.
                Err(_) => continue,
            };
            first = false;

            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(_) => continue,
                };
                // symlink_metadata so links below the root are recorded
                // as-is rather than followed.
                let meta = match entry.path().symlink_metadata() {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };
                if meta.is_dir() {
                    pending.push(entry.path());
                } else if let Ok(mtime) = meta.modified() {
                    files.insert(entry.path(), mtime);
                }
            }
        }

        Ok(Self { files })
    }

    /// Diff rule: `self` is the previous snapshot, `newer` the current
    /// one. `root` is the sync root used to relativize paths.
    pub fn diff(&self, newer: &Snapshot, root: &Path) -> Vec<Change> {
        let mut changes = Vec::new();

        for (path, old_mtime) in &self.files {
            match newer.files.get(path) {
                None => changes.push(change_for(ChangeOp::Remove, root, path)),
                Some(new_mtime) if old_mtime < new_mtime => {
                    changes.push(change_for(ChangeOp::Add, root, path));
                }
                // Equal (or regressed) mtime: no event, avoids no-op loops.
                Some(_) => {}
            }
        }

        for path in newer.files.keys() {
            if !self.files.contains_key(path) {
                changes.push(change_for(ChangeOp::Add, root, path));
            }
        }

        changes
    }

    /// The entries of this snapshot that live under `dir`.
    pub fn subtree(&self, dir: &Path) -> Snapshot {
        let files = self
            .files
            .iter()
            .filter(|(path, _)| path.starts_with(dir))
            .map(|(path, mtime)| (path.clone(), *mtime))
            .collect();
        Snapshot { files }
    }

    /// Replace every entry under `dir` with the entries of `newer`.
    ///
    /// Used by the fallback resync, which re-walks one hot directory and
    /// needs the root snapshot to reflect it afterwards.
    pub fn replace_subtree(&mut self, dir: &Path, newer: Snapshot) {
        self.files.retain(|path, _| !path.starts_with(dir));
        self.files.extend(newer.files);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }
}

fn change_for(op: ChangeOp, root: &Path, abs: &Path) -> Change {
    let rel = abs.strip_prefix(root).unwrap_or(abs);
    Change {
        op,
        base: root.to_path_buf(),
        path: to_posix(rel),
    }
}
