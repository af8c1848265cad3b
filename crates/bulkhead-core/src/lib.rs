//! # bulkhead-core
//!
//! Sandboxed execution of build actions, plus the file metadata queries a build
//! scheduler uses to decide whether cached work is still valid.
//!
//! This crate provides:
//! - Execution roots: per-spawn private trees with read-only inputs and writable outputs
//! - Isolation via Linux namespaces (user, pid, mount, net, ipc, uts) and `pivot_root`
//! - Supervision with a wall-clock deadline, cancellation and process-tree reaping
//! - An unsandboxed fallback for hosts without namespace support
//! - `stat`-family and extended-attribute access with errno-classified errors

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod capture;
pub mod config;
pub mod errno;
pub mod error;
pub mod executor;
pub mod fsmeta;
pub mod isolation;
pub mod pipe;
pub mod protocol;
pub mod result;
pub mod spec;
pub mod staging;
pub mod supervisor;

pub use cancel::CancelToken;
pub use config::ExecutorConfig;
pub use error::{ErrorKind, SandboxError, Severity, Stage};
pub use executor::{ExecutorRegistry, SpawnExecutor, UnsandboxedExecutor};
#[cfg(target_os = "linux")]
pub use executor::NamespaceExecutor;
pub use isolation::{HostCapabilities, IsolationPlan};
pub use result::SpawnResult;
pub use spec::{Identity, IsolationLevel, SpawnSpec, Strictness};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, SandboxError>;
