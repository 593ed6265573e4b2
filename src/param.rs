//! The data model: `MountSpec`, `SandboxParameter` and its builder, and
//! `ExecutionResult`.

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

use crate::error::{Error, Result};

/// An overlay bind-mounted into the chroot.
///
/// `destination` is interpreted relative to the chroot root; both `source`
/// and the resolved target must exist as directories at child-exec time.
/// `limit` sentinels: `0` = read-only, `-1` = unlimited. Positive finite
/// values are accepted but currently not enforced (see `DESIGN.md`).
#[derive(Clone, Debug)]
pub struct MountSpec {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub limit: i64,
}

impl MountSpec {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, limit: i64) -> Result<Self> {
        let destination = destination.into();
        if !destination.is_absolute() {
            return Err(Error::configuration(format!(
                "mount destination {} must be absolute",
                destination.display()
            )));
        }
        Ok(Self {
            source: source.into(),
            destination,
            limit,
        })
    }

    pub fn read_only(&self) -> bool {
        self.limit == 0
    }
}

/// One of the three stdio slots: a pre-opened host descriptor, a path
/// (opened relative to either the host or chrooted filesystem, depending on
/// `SandboxParameter::redirect_before_chroot`), or nothing (connects to
/// `/dev/null`).
#[derive(Debug, Default)]
pub enum StdioRedirect {
    #[default]
    Null,
    Path(PathBuf),
    Fd(OwnedFd),
}

impl StdioRedirect {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.as_os_str().is_empty() {
            StdioRedirect::Null
        } else {
            StdioRedirect::Path(path)
        }
    }

    pub fn fd(fd: OwnedFd) -> Self {
        StdioRedirect::Fd(fd)
    }
}

/// Sentinel for "leave `RLIMIT_STACK` untouched".
pub const STACK_UNCHANGED: i64 = -2;
/// Sentinel for "unlimited" across `memoryLimit`, `processLimit`, `stackSize`.
pub const UNLIMITED: i64 = -1;

/// Immutable once `Launcher::start` is called.
pub struct SandboxParameter {
    pub memory_limit: i64,
    pub process_limit: i64,
    pub stack_size: i64,
    pub redirect_before_chroot: bool,
    pub mount_proc: bool,
    pub chroot_directory: PathBuf,
    pub working_directory: PathBuf,
    pub executable: PathBuf,
    pub executable_parameters: Vec<String>,
    pub environment_variables: Vec<String>,
    pub stdin: StdioRedirect,
    pub stdout: StdioRedirect,
    pub stderr: StdioRedirect,
    pub uid: Uid,
    pub gid: Gid,
    pub cgroup_name: String,
    pub hostname: String,
    pub mounts: Vec<MountSpec>,
}

impl SandboxParameter {
    pub fn builder() -> SandboxParameterBuilder {
        SandboxParameterBuilder::default()
    }
}

/// Builder for `SandboxParameter`. Validation runs eagerly in `build()`,
/// surfacing `Error::Configuration` synchronously (spec.md §7 kind 1) before
/// anything is started.
pub struct SandboxParameterBuilder {
    memory_limit: i64,
    process_limit: i64,
    stack_size: i64,
    redirect_before_chroot: bool,
    mount_proc: bool,
    chroot_directory: Option<PathBuf>,
    working_directory: PathBuf,
    executable: Option<PathBuf>,
    executable_parameters: Vec<String>,
    environment_variables: Vec<String>,
    stdin: StdioRedirect,
    stdout: StdioRedirect,
    stderr: StdioRedirect,
    uid: Uid,
    gid: Gid,
    cgroup_name: Option<String>,
    hostname: String,
    mounts: Vec<MountSpec>,
}

impl Default for SandboxParameterBuilder {
    fn default() -> Self {
        Self {
            memory_limit: UNLIMITED,
            process_limit: UNLIMITED,
            stack_size: STACK_UNCHANGED,
            redirect_before_chroot: false,
            mount_proc: false,
            chroot_directory: None,
            working_directory: PathBuf::from("/"),
            executable: None,
            executable_parameters: Vec::new(),
            environment_variables: Vec::new(),
            stdin: StdioRedirect::Null,
            stdout: StdioRedirect::Null,
            stderr: StdioRedirect::Null,
            uid: Uid::from_raw(65534),
            gid: Gid::from_raw(65534),
            cgroup_name: None,
            hostname: String::new(),
            mounts: Vec::new(),
        }
    }
}

impl SandboxParameterBuilder {
    pub fn memory_limit(mut self, bytes: i64) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn process_limit(mut self, count: i64) -> Self {
        self.process_limit = count;
        self
    }

    pub fn stack_size(mut self, bytes: i64) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn redirect_before_chroot(mut self, value: bool) -> Self {
        self.redirect_before_chroot = value;
        self
    }

    pub fn mount_proc(mut self, value: bool) -> Self {
        self.mount_proc = value;
        self
    }

    pub fn chroot_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.chroot_directory = Some(path.into());
        self
    }

    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = path.into();
        self
    }

    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn executable_parameters(mut self, args: Vec<String>) -> Self {
        self.executable_parameters = args;
        self
    }

    pub fn environment_variables(mut self, env: Vec<String>) -> Self {
        self.environment_variables = env;
        self
    }

    pub fn stdin(mut self, value: StdioRedirect) -> Self {
        self.stdin = value;
        self
    }

    pub fn stdout(mut self, value: StdioRedirect) -> Self {
        self.stdout = value;
        self
    }

    pub fn stderr(mut self, value: StdioRedirect) -> Self {
        self.stderr = value;
        self
    }

    pub fn user(mut self, uid: Uid, gid: Gid) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn cgroup_name(mut self, name: impl Into<String>) -> Self {
        self.cgroup_name = Some(name.into());
        self
    }

    pub fn hostname(mut self, name: impl Into<String>) -> Self {
        self.hostname = name.into();
        self
    }

    pub fn add_mount(mut self, mount: MountSpec) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn build(self) -> Result<SandboxParameter> {
        let chroot_directory = self
            .chroot_directory
            .ok_or_else(|| Error::configuration("chroot_directory is required"))?;
        let executable = self
            .executable
            .ok_or_else(|| Error::configuration("executable is required"))?;
        let cgroup_name = self
            .cgroup_name
            .ok_or_else(|| Error::configuration("cgroup_name is required"))?;
        if cgroup_name.trim().is_empty() {
            return Err(Error::configuration("cgroup_name cannot be blank"));
        }
        if !chroot_directory.is_dir() {
            return Err(Error::configuration(format!(
                "chroot directory {} does not exist or is not a directory",
                chroot_directory.display()
            )));
        }
        if self.stack_size == 0 {
            return Err(Error::configuration(
                "stack_size of 0 is rejected; use -1 for unlimited or -2 to leave untouched",
            ));
        }
        for mount in &self.mounts {
            if !mount.destination.is_absolute() {
                return Err(Error::configuration(format!(
                    "mount destination {} must be absolute",
                    mount.destination.display()
                )));
            }
        }
        Ok(SandboxParameter {
            memory_limit: self.memory_limit,
            process_limit: self.process_limit,
            stack_size: self.stack_size,
            redirect_before_chroot: self.redirect_before_chroot,
            mount_proc: self.mount_proc,
            chroot_directory,
            working_directory: self.working_directory,
            executable,
            executable_parameters: self.executable_parameters,
            environment_variables: self.environment_variables,
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            uid: self.uid,
            gid: self.gid,
            cgroup_name,
            hostname: self.hostname,
            mounts: self.mounts,
        })
    }
}

/// The guest's terminal status: either it called `_exit`, or a signal
/// terminated it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionResult {
    Exited(u8),
    Signaled(i32),
}

pub(crate) fn mount_target(chroot: &Path, destination: &Path) -> PathBuf {
    // `destination` is required absolute; join relative to "/" semantics.
    let relative = destination
        .strip_prefix("/")
        .unwrap_or(destination);
    chroot.join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_spec_rejects_relative_destination() {
        assert!(MountSpec::new("/host/data", "work", 0).is_err());
    }

    #[test]
    fn mount_spec_accepts_absolute_destination() {
        assert!(MountSpec::new("/host/data", "/work", 0).is_ok());
    }

    #[test]
    fn builder_requires_chroot_executable_and_cgroup() {
        let err = SandboxParameter::builder().build();
        assert!(err.is_err());
    }

    #[test]
    fn builder_rejects_zero_stack_size() {
        let err = SandboxParameter::builder()
            .chroot_directory("/")
            .executable("/bin/true")
            .cgroup_name("x")
            .stack_size(0)
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn mount_target_joins_relative_to_root() {
        let target = mount_target(Path::new("/chroot"), Path::new("/work"));
        assert_eq!(target, Path::new("/chroot/work"));
    }
}
