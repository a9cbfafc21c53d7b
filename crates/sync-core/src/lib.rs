//! sync-core: Shared library for container live-sync.
//!
//! This crate provides the runtime-agnostic pieces of the synchronizer:
//! - The `Change` event model and the remote agent's line protocol
//! - Ignore rule discovery and matching (`.syncignore`)
//! - Directory snapshots and the snapshot diff rule
//! - The echo-suppression registry that keeps the two sides from
//!   replaying each other's writes

pub mod change;
pub mod echo;
pub mod ignore;
pub mod snapshot;

pub use change::{posix_join, to_posix, AgentLineError, Change, ChangeOp};
pub use echo::{Direction, EchoRegistry};
pub use ignore::{IgnoreError, IgnoreSet, IGNORE_FILE_NAME};
pub use snapshot::Snapshot;
