//! Change events and the remote agent's line protocol.
//!
//! A `Change` is the unit of work flowing from either watcher to the
//! transfer engine. The remote agent reports the same shape over its
//! stdout as `<op>|<base>|<relpath>` lines.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    /// File was created or modified (whole-file transfer either way).
    Add,
    /// File was deleted.
    Remove,
}

/// A single observed filesystem change.
///
/// `base` is the absolute sync root on the side that observed the
/// change; `path` is relative to it and always POSIX-separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub op: ChangeOp,
    pub base: PathBuf,
    pub path: String,
}

/// Failure to parse a line from the remote agent.
#[derive(Debug, Error)]
pub enum AgentLineError {
    #[error("expected <op>|<base>|<relpath>, got {0:?}")]
    Malformed(String),

    #[error("unknown op {0:?} (expected add or remove)")]
    UnknownOp(String),

    #[error("agent reported a non-absolute base {0:?}")]
    RelativeBase(String),
}

impl Change {
    /// Create a change, normalizing the relative path to POSIX separators.
    pub fn new(op: ChangeOp, base: impl Into<PathBuf>, path: impl AsRef<Path>) -> Self {
        Self {
            op,
            base: base.into(),
            path: to_posix(path.as_ref()),
        }
    }

    /// Absolute path of the changed file on the side that observed it.
    pub fn absolute(&self) -> PathBuf {
        self.base.join(&self.path)
    }

    /// Parse one line of agent output: `add|/app|gen/out.bin`.
    pub fn parse_agent_line(line: &str) -> Result<Self, AgentLineError> {
        let mut parts = line.splitn(3, '|');
        let (op, base, path) = match (parts.next(), parts.next(), parts.next()) {
            (Some(op), Some(base), Some(path)) if !base.is_empty() && !path.is_empty() => {
                (op, base, path)
            }
            _ => return Err(AgentLineError::Malformed(line.to_string())),
        };

        let op = match op {
            "add" => ChangeOp::Add,
            "remove" => ChangeOp::Remove,
            other => return Err(AgentLineError::UnknownOp(other.to_string())),
        };

        if !base.starts_with('/') {
            return Err(AgentLineError::RelativeBase(base.to_string()));
        }

        Ok(Change::new(op, base, path))
    }
}

/// Render a relative path with forward slashes regardless of platform.
pub fn to_posix(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        raw.into_owned()
    } else {
        raw.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Join a POSIX-style absolute base with a relative path.
///
/// Used for remote paths, which are container-side and therefore always
/// slash-separated strings rather than platform paths.
pub fn posix_join(base: &str, rel: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_add_line() {
        let change = Change::parse_agent_line("add|/app|gen/out.bin").unwrap();
        assert_eq!(change.op, ChangeOp::Add);
        assert_eq!(change.base, PathBuf::from("/app"));
        assert_eq!(change.path, "gen/out.bin");
    }

    #[test]
    fn test_parse_remove_line() {
        let change = Change::parse_agent_line("remove|/app|src/a.txt").unwrap();
        assert_eq!(change.op, ChangeOp::Remove);
        assert_eq!(change.path, "src/a.txt");
    }

    #[test]
    fn test_parse_rejects_unknown_op() {
        assert!(matches!(
            Change::parse_agent_line("rename|/app|a.txt"),
            Err(AgentLineError::UnknownOp(_))
        ));
    }

    #[test]
    fn test_parse_rejects_malformed_line() {
        assert!(Change::parse_agent_line("add|/app").is_err());
        assert!(Change::parse_agent_line("").is_err());
        assert!(Change::parse_agent_line("add||x").is_err());
    }

    #[test]
    fn test_parse_rejects_relative_base() {
        assert!(matches!(
            Change::parse_agent_line("add|app|x.txt"),
            Err(AgentLineError::RelativeBase(_))
        ));
    }

    #[test]
    fn test_path_with_pipes_is_kept_whole() {
        // splitn(3) keeps any further pipes inside the relative path
        let change = Change::parse_agent_line("add|/app|odd|name.txt").unwrap();
        assert_eq!(change.path, "odd|name.txt");
    }

    #[test]
    fn test_absolute_joins_base_and_path() {
        let change = Change::new(ChangeOp::Add, "/work", "src/main.rs");
        assert_eq!(change.absolute(), PathBuf::from("/work/src/main.rs"));
    }

    #[test]
    fn test_posix_join_normalizes_slashes() {
        assert_eq!(posix_join("/app/", "src/a.txt"), "/app/src/a.txt");
        assert_eq!(posix_join("/app", "/src/a.txt"), "/app/src/a.txt");
    }
}
