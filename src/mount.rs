//! Mount tree construction for the chroot jail.
//!
//! Unlike the namespace-container idiom of bind-mount-then-`pivot_root`, a
//! judge sandbox chroots into a rootfs that already exists on disk: there is
//! no new root to pivot onto, only the existing one to seal off. Every step
//! below runs inside the child, after `CLONE_NEWNS` but before the privilege
//! drop.

use std::fs;
use std::path::Path;

use nix::mount::{mount, MsFlags};
use nix::unistd::chdir;

use crate::error::Result;
use crate::param::{mount_target, MountSpec, SandboxParameter};

/// Detaches the mount namespace from the host's: makes `/` and everything
/// under it private and non-recursive-propagating, mirroring the first step
/// of every container's mount setup before it touches anything else.
pub fn isolate_root() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_SLAVE,
        None::<&str>,
    )?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;
    Ok(())
}

/// Bind-mounts the chroot directory onto itself and remounts it read-only,
/// recursively, so ordinary write access stops at the jail boundary
/// regardless of what `param.mounts` later overlays on top.
pub fn seal_chroot_root(chroot: &Path) -> Result<()> {
    mount(
        Some(chroot),
        chroot,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    mount(
        None::<&str>,
        chroot,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )?;
    Ok(())
}

/// Bind-mounts one overlay into place. The target directory is created if
/// missing; read-only overlays are bind-mounted then remounted `MS_RDONLY`
/// (a bind mount cannot set `MS_RDONLY` in the same call).
pub fn apply_mount(chroot: &Path, spec: &MountSpec) -> Result<()> {
    let target = mount_target(chroot, &spec.destination);
    fs::create_dir_all(&target)?;
    mount(
        Some(spec.source.as_path()),
        &target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    if spec.read_only() {
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )?;
    }
    Ok(())
}

/// Mounts a fresh `procfs` at `<chroot>/proc`, used only when
/// `param.mount_proc` is set (most judge workloads run with no `/proc` at
/// all, since it leaks host process information across the PID namespace
/// boundary less than one might expect).
pub fn mount_proc(chroot: &Path) -> Result<()> {
    let target = chroot.join("proc");
    fs::create_dir_all(&target)?;
    mount(
        Some("proc"),
        &target,
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )?;
    Ok(())
}

/// Runs the full sequence: isolate, seal, overlay every `param.mounts`
/// entry, optionally mount `/proc`, then `chroot` and `chdir` into the
/// sandbox's working directory.
pub fn enter(param: &SandboxParameter) -> Result<()> {
    isolate_root()?;
    seal_chroot_root(&param.chroot_directory)?;
    for spec in &param.mounts {
        apply_mount(&param.chroot_directory, spec)?;
    }
    if param.mount_proc {
        mount_proc(&param.chroot_directory)?;
    }
    nix::unistd::chroot(&param.chroot_directory)?;
    chdir(&param.working_directory)?;
    Ok(())
}
