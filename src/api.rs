//! The five operations a host exposes to callers: cgroup property access,
//! cgroup teardown, and starting/waiting on a sandboxed process.
//!
//! These are native-typed Rust functions. Any decimal-string encoding of
//! wide integers for a non-Rust embedding lives in that embedding's adapter
//! layer, not here.

use nix::unistd::Pid;

use crate::cgroup::{self, CgroupInfo};
use crate::error::Result;
use crate::launcher::{Launcher, SandboxHandle};
use crate::param::{ExecutionResult, SandboxParameter};

pub fn get_cgroup_property(controller: &str, group: &str, property: &str) -> Result<i64> {
    let info = CgroupInfo::new(controller, group)?;
    cgroup::read_scalar(&info, property)
}

pub fn get_cgroup_sub_property(controller: &str, group: &str, property: &str, subkey: &str) -> Result<i64> {
    let info = CgroupInfo::new(controller, group)?;
    let map = cgroup::read_map(&info, property)?;
    map.get(subkey).copied().ok_or_else(|| {
        crate::error::Error::configuration(format!("no entry `{subkey}` in `{property}`"))
    })
}

pub fn remove_cgroup(controller: &str, group: &str) -> Result<()> {
    let info = CgroupInfo::new(controller, group)?;
    cgroup::remove(&info)
}

pub fn start_sandbox(param: SandboxParameter) -> Result<(Pid, SandboxHandle)> {
    Launcher::start(param)
}

pub fn wait_for_process(pid: Pid, handle: SandboxHandle) -> Result<ExecutionResult> {
    Launcher::wait(pid, handle)
}
