//! A Linux process sandbox core for contest/judge workloads: namespace
//! isolation, a chroot jail, cgroup v1 resource accounting, privilege drop,
//! and a semaphore/pipe handshake between the host and the sandboxed child.
//!
//! See [`api`] for the five operations a host embeds this crate through.

pub mod api;
pub mod cgroup;
pub mod error;
pub mod launcher;
pub mod mount;
pub mod param;
pub mod sync;

pub use error::{Error, Result};
pub use launcher::{Launcher, SandboxHandle};
pub use param::{ExecutionResult, MountSpec, SandboxParameter, SandboxParameterBuilder, StdioRedirect};
