//! Starts and waits on a sandboxed child: the namespace `clone`, the
//! parent/child handshake, and cgroup wiring.
//!
//! The child never returns from its entry function. It builds its entire
//! environment (mounts, stdio, hostname, rlimits, privilege drop) before
//! reporting success or failure over a framed pipe and blocking on the
//! second handshake semaphore; the parent uses the gap between the report
//! and the release to finish wiring cgroup limits while the child is known
//! to be idle.

use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use std::os::fd::{FromRawFd, OwnedFd};

use nix::fcntl::{open, OFlag};
use nix::sched::{clone, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{
    dup, dup2, execvpe, setgid, setgroups, sethostname, setuid, Pid,
};

use crate::cgroup::{self, CgroupInfo};
use crate::error::{Error, Result};
use crate::mount;
use crate::param::{ExecutionResult, SandboxParameter, StdioRedirect, STACK_UNCHANGED, UNLIMITED};
use crate::sync::{self, new_pipe, PipeReader, PipeWriter, Semaphore, SemaphoreRef};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);
const CHILD_STACK_SIZE: usize = 700 * 1024;

/// Returned by `Launcher::start`, consumed by `Launcher::wait`. Holds the
/// error channel (to pick up anything reported after the handshake, e.g. an
/// `execve` failure) and keeps the handshake semaphores alive until the
/// sandboxed process has been reaped.
pub struct SandboxHandle {
    error_rx: PipeReader,
    _s1: Semaphore,
    _s2: Semaphore,
}

pub struct Launcher;

impl Launcher {
    /// Creates the three accounting cgroups, clones the child into its
    /// namespaces, wires it into those cgroups, then releases it into
    /// `execve`. Returns once the child has either reported a setup error
    /// or gone quiet waiting on `S2`.
    pub fn start(param: SandboxParameter) -> Result<(Pid, SandboxHandle)> {
        let mem_cgroup = CgroupInfo::new("memory", param.cgroup_name.as_str())?;
        let cpu_cgroup = CgroupInfo::new("cpuacct", param.cgroup_name.as_str())?;
        let pids_cgroup = CgroupInfo::new("pids", param.cgroup_name.as_str())?;
        let memory_limit = param.memory_limit;
        let process_limit = param.process_limit;

        cgroup::create(&mem_cgroup)?;
        cgroup::create(&cpu_cgroup)?;
        cgroup::create(&pids_cgroup)?;
        // A reused cgroup name may still hold stragglers from a previous run.
        cgroup::kill_members(&mem_cgroup)?;
        cgroup::kill_members(&cpu_cgroup)?;
        cgroup::kill_members(&pids_cgroup)?;

        let s1 = Semaphore::new(0)?;
        let s2 = Semaphore::new(0)?;
        let (error_rx, error_tx) = new_pipe()?;

        let child_s1 = s1.share();
        let child_s2 = s2.share();
        let mut stack = vec![0u8; CHILD_STACK_SIZE].into_boxed_slice();
        let flags = CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS;

        // `clone`'s callback type is `FnMut`, even though the kernel only
        // ever invokes it once; stash the by-value captures behind `Option`
        // so the closure can still satisfy that bound.
        let mut child_param = Some(param);
        let mut child_tx = Some(error_tx);
        let pid = unsafe {
            clone(
                Box::new(move || {
                    let param = child_param.take().expect("clone callback runs once");
                    let tx = child_tx.take().expect("clone callback runs once");
                    child_trampoline(&param, tx, child_s1, child_s2)
                }),
                &mut stack,
                flags,
                Some(Signal::SIGCHLD as i32),
            )
        }
        .map_err(|err| Error::syscall("clone", err))?;

        // From here on the child exists; any error must kill and reap it
        // before propagating, matching `original_source/native/sandbox.cc`'s
        // outer `try`/`catch` around the whole post-clone sequence.
        Self::finish_start(
            pid,
            &mem_cgroup,
            &cpu_cgroup,
            &pids_cgroup,
            memory_limit,
            process_limit,
            &s1,
            &s2,
            error_rx,
        )
        .map(|error_rx| {
            (
                pid,
                SandboxHandle {
                    error_rx,
                    _s1: s1,
                    _s2: s2,
                },
            )
        })
        .map_err(|err| {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
            err
        })
    }

    /// Runs every post-`clone` step up to (and including) releasing the
    /// child into `execve`. Isolated from `start` so every exit from this
    /// function — success or failure — goes through one kill+reap guard at
    /// the call site, mirroring `original_source/native/sandbox.cc`'s single
    /// outer `try`/`catch` around the equivalent sequence.
    #[allow(clippy::too_many_arguments)]
    fn finish_start(
        pid: Pid,
        mem_cgroup: &CgroupInfo,
        cpu_cgroup: &CgroupInfo,
        pids_cgroup: &CgroupInfo,
        memory_limit: i64,
        process_limit: i64,
        s1: &Semaphore,
        s2: &Semaphore,
        mut error_rx: PipeReader,
    ) -> Result<PipeReader> {
        cgroup::write_scalar(mem_cgroup, "tasks", pid.as_raw() as i64, false)?;
        cgroup::write_scalar(cpu_cgroup, "tasks", pid.as_raw() as i64, false)?;
        cgroup::write_scalar(pids_cgroup, "tasks", pid.as_raw() as i64, false)?;
        apply_limits(mem_cgroup, pids_cgroup, memory_limit, process_limit)?;

        let ready = s1.timed_wait(HANDSHAKE_TIMEOUT)?;
        if !ready {
            return match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => Err(Error::handshake(
                    "sandboxed process did not signal readiness within the handshake deadline",
                )),
                Ok(_) => Err(Error::handshake(
                    "sandboxed process exited before completing its setup",
                )),
            };
        }

        if let Some(message) = sync::read_frame(&mut error_rx)? {
            // The child already reported failure and is waiting on S2 purely
            // out of courtesy; release it so it exits promptly. The caller's
            // kill+reap guard still runs afterward, matching the original's
            // single catch-all around this whole sequence.
            s2.post()?;
            return Err(Error::child_setup(message));
        }

        // Counters may have accrued overhead from cgroup setup itself; zero
        // them now, immediately before releasing the child into execve, so
        // accounting reflects only the sandboxed program.
        reset_counters(mem_cgroup, cpu_cgroup, pids_cgroup)?;

        s2.post()?;

        Ok(error_rx)
    }

    /// Blocks until the sandboxed process terminates and classifies how.
    pub fn wait(pid: Pid, mut handle: SandboxHandle) -> Result<ExecutionResult> {
        let status = waitpid(pid, None)?;
        if let Some(message) = sync::read_frame(&mut handle.error_rx)? {
            log::warn!("sandboxed process {pid} reported after handshake: {message}");
        }
        match status {
            WaitStatus::Exited(_, code) => Ok(ExecutionResult::Exited(code as u8)),
            WaitStatus::Signaled(_, signal, _) => Ok(ExecutionResult::Signaled(signal as i32)),
            other => Err(Error::handshake(format!(
                "unexpected wait status for sandboxed process: {other:?}"
            ))),
        }
    }
}

fn apply_limits(
    mem_cgroup: &CgroupInfo,
    pids_cgroup: &CgroupInfo,
    memory_limit: i64,
    process_limit: i64,
) -> Result<()> {
    // Reset to unlimited before applying, so a lowered limit from a previous
    // occupant of this cgroup name never lingers.
    cgroup::write_string(mem_cgroup, "memory.limit_in_bytes", "-1", true)?;
    let _ = cgroup::write_string(mem_cgroup, "memory.memsw.limit_in_bytes", "-1", true);
    if memory_limit != UNLIMITED {
        cgroup::write_scalar(mem_cgroup, "memory.limit_in_bytes", memory_limit, true)?;
        let _ = cgroup::write_scalar(mem_cgroup, "memory.memsw.limit_in_bytes", memory_limit, true);
    }
    if process_limit == UNLIMITED {
        cgroup::write_string(pids_cgroup, "pids.max", "max", true)?;
    } else {
        cgroup::write_scalar(pids_cgroup, "pids.max", process_limit, true)?;
    }
    Ok(())
}

fn reset_counters(mem_cgroup: &CgroupInfo, cpu_cgroup: &CgroupInfo, _pids_cgroup: &CgroupInfo) -> Result<()> {
    // `memory.force_empty` is deliberately not written here: it forces a
    // synchronous page reclaim that the original implementation measured as
    // too slow for this hot path and removed.
    let _ = cgroup::write_scalar(mem_cgroup, "memory.memsw.max_usage_in_bytes", 0, true);
    let _ = cgroup::write_scalar(cpu_cgroup, "cpuacct.usage", 0, true);
    Ok(())
}

/// Runs in the cloned child. Always diverges: either `execve` succeeds and
/// this code stops existing, or every failure path ends in `_exit`.
fn child_trampoline(
    param: &SandboxParameter,
    tx: PipeWriter,
    s1: SemaphoreRef,
    s2: SemaphoreRef,
) -> isize {
    let _ = catch_unwind(AssertUnwindSafe(|| run_child(param, tx, s1, s2)));
    unsafe { nix::libc::_exit(126) }
}

fn run_child(param: &SandboxParameter, mut tx: PipeWriter, s1: SemaphoreRef, s2: SemaphoreRef) -> ! {
    let setup = build_child_environment(param);
    let report = match &setup {
        Ok(()) => sync::write_ok(&mut tx),
        Err(err) => sync::write_error(&mut tx, &err.to_string()),
    };
    if report.is_err() {
        unsafe { nix::libc::_exit(126) };
    }
    if s1.post().is_err() {
        unsafe { nix::libc::_exit(126) };
    }
    if setup.is_err() {
        // Nothing left to do; wait for the parent's courtesy release so it
        // isn't left blocked on S1 forever, then exit.
        let _ = s2.wait();
        unsafe { nix::libc::_exit(125) };
    }
    if s2.wait().is_err() {
        unsafe { nix::libc::_exit(126) };
    }
    match exec_target(param) {
        Ok(never) => match never {},
        Err(err) => {
            let _ = sync::write_error(&mut tx, &format!("execve failed: {err}"));
            unsafe { nix::libc::_exit(127) }
        }
    }
}

fn build_child_environment(param: &SandboxParameter) -> Result<()> {
    if param.redirect_before_chroot {
        setup_stdio(param)?;
    }
    mount::enter(param)?;
    if !param.redirect_before_chroot {
        setup_stdio(param)?;
    }
    if !param.hostname.is_empty() {
        sethostname(&param.hostname)?;
    }
    apply_rlimits(param)?;
    drop_privileges(param)?;
    Ok(())
}

fn apply_rlimits(param: &SandboxParameter) -> Result<()> {
    if param.stack_size != STACK_UNCHANGED {
        let limit = if param.stack_size == UNLIMITED {
            nix::libc::RLIM_INFINITY
        } else {
            param.stack_size as u64
        };
        setrlimit(Resource::RLIMIT_STACK, limit, limit)?;
    }
    // Core dumps from the sandbox are never useful to the caller and can
    // leak memory contents onto disk.
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    Ok(())
}

fn drop_privileges(param: &SandboxParameter) -> Result<()> {
    // Group id, then the single-entry supplementary list, then user id: once
    // the uid is dropped, changing gid or groups would fail with EPERM.
    setgid(param.gid)?;
    setgroups(&[param.gid])?;
    setuid(param.uid)?;
    Ok(())
}

fn dev_null() -> Result<OwnedFd> {
    let raw = open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn open_redirect(slot: &StdioRedirect, for_input: bool) -> Result<Option<OwnedFd>> {
    match slot {
        StdioRedirect::Null => Ok(None),
        StdioRedirect::Fd(fd) => {
            let dup_fd = dup(fd.as_raw_fd())?;
            Ok(Some(unsafe { OwnedFd::from_raw_fd(dup_fd) }))
        }
        StdioRedirect::Path(path) => {
            let flags = if for_input {
                OFlag::O_RDONLY
            } else {
                OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC
            };
            let raw = open(path.as_path(), flags, Mode::from_bits_truncate(0o644))?;
            Ok(Some(unsafe { OwnedFd::from_raw_fd(raw) }))
        }
    }
}

/// `StdioRedirect::Fd` always bypasses path redirection and dup2's directly.
/// Same-path stdout/stderr redirects are opened once and shared, avoiding
/// the `O_TRUNC` race of opening the same path twice.
fn setup_stdio(param: &SandboxParameter) -> Result<()> {
    let stdin_fd = match open_redirect(&param.stdin, true)? {
        Some(fd) => fd,
        None => dev_null()?,
    };
    dup2(stdin_fd.as_raw_fd(), 0)?;

    let same_out_err = match (&param.stdout, &param.stderr) {
        (StdioRedirect::Path(a), StdioRedirect::Path(b)) => a == b,
        _ => false,
    };

    if same_out_err {
        let fd = open_redirect(&param.stdout, false)?.expect("Path variant always opens");
        dup2(fd.as_raw_fd(), 1)?;
        dup2(fd.as_raw_fd(), 2)?;
    } else {
        let stdout_fd = match open_redirect(&param.stdout, false)? {
            Some(fd) => fd,
            None => dev_null()?,
        };
        dup2(stdout_fd.as_raw_fd(), 1)?;

        let stderr_fd = match open_redirect(&param.stderr, false)? {
            Some(fd) => fd,
            None => dev_null()?,
        };
        dup2(stderr_fd.as_raw_fd(), 2)?;
    }
    Ok(())
}

fn exec_target(param: &SandboxParameter) -> std::result::Result<Infallible, nix::errno::Errno> {
    let program = CString::new(param.executable.as_os_str().as_bytes())
        .unwrap_or_else(|_| CString::new("").unwrap());
    let argv: Vec<CString> = if param.executable_parameters.is_empty() {
        vec![program.clone()]
    } else {
        param
            .executable_parameters
            .iter()
            .map(|s| CString::new(s.as_bytes()).unwrap_or_else(|_| CString::new("").unwrap()))
            .collect()
    };
    let envp: Vec<CString> = param
        .environment_variables
        .iter()
        .map(|s| CString::new(s.as_bytes()).unwrap_or_else(|_| CString::new("").unwrap()))
        .collect();
    execvpe(&program, &argv, &envp)
}
