//! sync-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod container;
pub mod engine;
pub mod remote;
pub mod session;
pub mod watcher;

// Re-export key types for convenience
pub use config::{SyncConfig, WatchMode};
pub use container::{ContainerApi, ContainerError, DockerCli, ExecHandle, FakeContainer};
pub use engine::{TransferEngine, MAX_EXEC_PATHS};
pub use remote::{inject_agent, RemoteWatcher, AGENT_REMOTE_PATH};
pub use session::SyncSession;
pub use watcher::LocalWatcher;
