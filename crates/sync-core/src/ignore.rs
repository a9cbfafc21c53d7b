//! Ignore rules for the local sync root.
//!
//! `.syncignore` files use docker-style glob patterns, one per line,
//! with `**` matching any number of path components. Files are
//! discovered recursively once at startup; each pattern is rewritten to
//! be relative to the sync root by anchoring it at the directory of the
//! ignore file that declared it.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the ignore files discovered under the sync root.
pub const IGNORE_FILE_NAME: &str = ".syncignore";

#[derive(Debug, Error)]
pub enum IgnoreError {
    #[error("failed to read ignore file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to walk sync root {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to compile ignore patterns: {0}")]
    Build(#[from] ignore::Error),
}

/// Compiled ignore patterns for one sync root.
///
/// Matching is deterministic and side-effect free; the set is built
/// once and shared read-only between both watchers.
pub struct IgnoreSet {
    matcher: Gitignore,
    pattern_count: usize,
}

impl IgnoreSet {
    /// Walk `root` collecting every `.syncignore` and compile the result.
    ///
    /// An unreadable ignore file fails the whole startup; a malformed
    /// pattern is logged and skipped.
    pub fn discover(root: &Path) -> Result<Self, IgnoreError> {
        let mut builder = GitignoreBuilder::new(root);
        let mut pattern_count = 0;

        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let entries = fs::read_dir(&dir).map_err(|source| IgnoreError::Walk {
                path: dir.clone(),
                source,
            })?;
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    // Entry vanished mid-walk; nothing to ignore there.
                    Err(_) => continue,
                };
                let path = entry.path();
                let file_type = match entry.file_type() {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if file_type.is_dir() {
                    pending.push(path);
                } else if path.file_name().map(|n| n == IGNORE_FILE_NAME).unwrap_or(false) {
                    pattern_count += Self::add_file(&mut builder, root, &path)?;
                }
            }
        }

        let matcher = builder.build()?;
        debug!(
            "ignore set compiled: {} pattern(s) under {}",
            pattern_count,
            root.display()
        );
        Ok(Self {
            matcher,
            pattern_count,
        })
    }

    /// Read one ignore file, anchoring each pattern at the file's directory.
    fn add_file(
        builder: &mut GitignoreBuilder,
        root: &Path,
        path: &Path,
    ) -> Result<usize, IgnoreError> {
        let contents = fs::read_to_string(path).map_err(|source| IgnoreError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let prefix = path
            .parent()
            .and_then(|dir| dir.strip_prefix(root).ok())
            .map(crate::change::to_posix)
            .unwrap_or_default();

        let mut added = 0;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let rewritten = Self::rewrite(&prefix, line);
            match builder.add_line(Some(path.to_path_buf()), &rewritten) {
                Ok(_) => added += 1,
                Err(e) => warn!("skipping malformed ignore pattern {:?} in {}: {}", line, path.display(), e),
            }
        }
        Ok(added)
    }

    /// Make a pattern root-relative by prefixing the directory of the
    /// ignore file that declared it.
    ///
    /// Gitignore anchoring rules apply per declaring directory: a
    /// pattern with a slash (other than a trailing one) is anchored
    /// there, any other pattern floats to any depth below it.
    fn rewrite(prefix: &str, line: &str) -> String {
        let (neg, pattern) = match line.strip_prefix('!') {
            Some(rest) => ("!", rest),
            None => ("", line),
        };
        let anchored =
            pattern.starts_with('/') || pattern.trim_end_matches('/').contains('/');
        let pattern = pattern.trim_start_matches('/');

        if prefix.is_empty() {
            if anchored {
                format!("{neg}/{pattern}")
            } else {
                format!("{neg}{pattern}")
            }
        } else if anchored {
            format!("{neg}/{prefix}/{pattern}")
        } else {
            format!("{neg}/{prefix}/**/{pattern}")
        }
    }

    /// Whether `relpath` (POSIX-separated, relative to the sync root)
    /// matches any ignore pattern, directly or via an ignored parent.
    pub fn matches(&self, relpath: &str) -> bool {
        self.matcher
            .matched_path_or_any_parents(relpath, false)
            .is_ignore()
    }

    /// Number of patterns compiled into the set.
    pub fn len(&self) -> usize {
        self.pattern_count
    }

    /// True when no patterns were found under the root.
    pub fn is_empty(&self) -> bool {
        self.pattern_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn root_with(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, contents) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, contents).unwrap();
        }
        dir
    }

    #[test]
    fn test_empty_root_matches_nothing() {
        let dir = TempDir::new().unwrap();
        let set = IgnoreSet::discover(dir.path()).unwrap();
        assert!(set.is_empty());
        assert!(!set.matches("src/main.rs"));
    }

    #[test]
    fn test_simple_glob() {
        let dir = root_with(&[(".syncignore", "*.log\n")]);
        let set = IgnoreSet::discover(dir.path()).unwrap();
        assert!(set.matches("debug.log"));
        assert!(set.matches("nested/deeper/trace.log"));
        assert!(!set.matches("debug.txt"));
    }

    #[test]
    fn test_comments_and_blank_lines_discarded() {
        let dir = root_with(&[(".syncignore", "# build output\n\ntarget\n")]);
        let set = IgnoreSet::discover(dir.path()).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.matches("target"));
        assert!(set.matches("target/debug/app"));
        assert!(!set.matches("# build output"));
    }

    #[test]
    fn test_double_star_spans_components() {
        let dir = root_with(&[(".syncignore", "**/node_modules/**\n")]);
        let set = IgnoreSet::discover(dir.path()).unwrap();
        assert!(set.matches("node_modules/pkg/index.js"));
        assert!(set.matches("web/app/node_modules/pkg/index.js"));
        assert!(!set.matches("src/modules.rs"));
    }

    #[test]
    fn test_nested_ignore_file_is_root_relative() {
        // A pattern declared in sub/.syncignore only applies under sub/.
        let dir = root_with(&[("sub/.syncignore", "*.tmp\n")]);
        let set = IgnoreSet::discover(dir.path()).unwrap();
        assert!(set.matches("sub/a.tmp"));
        assert!(set.matches("sub/deeper/b.tmp"));
        assert!(!set.matches("a.tmp"));
    }

    #[test]
    fn test_nested_file_keeps_anchoring_and_negation() {
        let dir = root_with(&[("sub/.syncignore", "/build\n*.tmp\n!keep.tmp\n")]);
        let set = IgnoreSet::discover(dir.path()).unwrap();

        // "/build" is anchored at the declaring directory.
        assert!(set.matches("sub/build"));
        assert!(!set.matches("build"));
        assert!(!set.matches("sub/other/build"));

        // The later negation wins over "*.tmp".
        assert!(set.matches("sub/a.tmp"));
        assert!(!set.matches("sub/keep.tmp"));
    }

    #[test]
    fn test_malformed_pattern_skipped() {
        let dir = root_with(&[(".syncignore", "a[.txt\n*.log\n")]);
        let set = IgnoreSet::discover(dir.path()).unwrap();
        assert!(set.matches("x.log"));
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("nope");
        assert!(matches!(
            IgnoreSet::discover(&gone),
            Err(IgnoreError::Walk { .. })
        ));
    }
}
