//! Process side of podroid containers.
//!
//! This crate launches container processes under `proot` (or a host-process
//! mock in tests) behind the `ContainerRuntime` trait, provisions the
//! host-writable directories bound over restricted image paths, and tracks
//! processes through PID files and signals.

pub mod backend;
pub mod launch;
pub mod mock;
pub mod prereq;
pub mod process;
pub mod writable;

pub use backend::{select_runtime, ContainerRuntime, ProotRuntime};
pub use launch::{host_binds, parse_env, BindMount, LaunchConfig, DEFAULT_PATH, FAKE_ROOT_ENV};
pub use mock::MockRuntime;
pub use prereq::{check_proot_prereqs, find_executable, format_missing, MissingPrereq};
pub use process::{exit_code, is_alive, read_pid_file, remove_pid_file, terminate};
pub use writable::{prepare_writable_dirs, DEFAULT_WRITABLE_DIRS};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("permission denied at {}: {reason}", .path.display())]
    Permission { path: PathBuf, reason: String },
    #[error("failed to spawn container process: {0}")]
    SpawnFailed(String),
    #[error("failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
    #[error("root emulation wrapper not available: {0}")]
    WrapperNotFound(String),
    #[error("invalid bind mount '{0}': expected HOST:CONTAINER with an absolute container path")]
    InvalidBind(String),
    #[error("runtime '{0}' is not available")]
    BackendUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_error_names_path() {
        let e = RuntimeError::Permission {
            path: PathBuf::from("/data/containers/x/writable/tmp"),
            reason: "read-only file system".to_owned(),
        };
        assert!(e.to_string().contains("/data/containers/x/writable/tmp"));
    }

    #[test]
    fn signal_error_names_pid() {
        let e = RuntimeError::SignalFailed {
            pid: 4242,
            reason: "EPERM".to_owned(),
        };
        assert!(e.to_string().contains("4242"));
    }
}
