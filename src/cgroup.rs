//! v1 cgroup facade: a thin typed mirror of the sysfs interface.
//!
//! Deliberately not a `libcgroup` binding — directly reading and writing the
//! controller files keeps failure modes predictable and avoids an opaque
//! dependency. Only `memory`, `cpuacct` and `pids` are used by the launcher;
//! other controllers are supported but unused.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{Error, Result};

const PROC_CGROUPS: &str = "/proc/cgroups";
const PROC_MOUNTS: &str = "/proc/mounts";

/// `controller -> ordered list of mount points`, discovered once from
/// `/proc/cgroups` and `/proc/mounts` and never mutated afterward.
type Discovery = BTreeMap<String, Vec<PathBuf>>;

static DISCOVERY: OnceLock<Discovery> = OnceLock::new();

fn discovery() -> &'static Discovery {
    DISCOVERY.get_or_init(|| discover().unwrap_or_default())
}

fn discover() -> Result<Discovery> {
    let controllers = read_controller_names()?;
    let mut result: Discovery = BTreeMap::new();

    let mounts = BufReader::new(File::open(PROC_MOUNTS)?);
    for line in mounts.lines() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let _source = fields.next();
        let mount_dir = match fields.next() {
            Some(v) => v,
            None => continue,
        };
        let fs_type = match fields.next() {
            Some(v) => v,
            None => continue,
        };
        if fs_type != "cgroup" {
            continue;
        }
        let options = fields.next().unwrap_or("");
        let opts: Vec<&str> = options.split(',').collect();
        for controller in &controllers {
            if opts.contains(&controller.as_str()) {
                result
                    .entry(controller.clone())
                    .or_default()
                    .push(PathBuf::from(mount_dir));
            }
        }
    }

    Ok(result)
}

fn read_controller_names() -> Result<Vec<String>> {
    let file = BufReader::new(File::open(PROC_CGROUPS)?);
    let mut names = Vec::new();
    for (index, line) in file.lines().enumerate() {
        let line = line?;
        if index == 0 {
            // header: #subsys_name hierarchy num_cgroups enabled
            continue;
        }
        if let Some(name) = line.split_whitespace().next() {
            names.push(name.to_owned());
        }
    }
    Ok(names)
}

fn is_blank(s: &str) -> bool {
    s.chars().all(char::is_whitespace)
}

/// Identifies a cgroup by `(controller, group name)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CgroupInfo {
    controller: String,
    group: String,
}

impl CgroupInfo {
    pub fn new(controller: impl Into<String>, group: impl Into<String>) -> Result<Self> {
        let controller = controller.into();
        let group = group.into();
        if is_blank(&controller) {
            return Err(Error::configuration("cgroup controller name cannot be empty"));
        }
        if is_blank(&group) {
            return Err(Error::configuration("cgroup group name cannot be empty"));
        }
        Ok(Self { controller, group })
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn mount_point(&self) -> Result<&'static Path> {
        match discovery().get(&self.controller).and_then(|v| v.first()) {
            Some(path) => Ok(path.as_path()),
            None => Err(Error::configuration(format!(
                "controller `{}` has no mounted v1 hierarchy",
                self.controller
            ))),
        }
    }

    /// The resolved group directory: `firstMount(controller) / group`.
    pub fn path(&self) -> Result<PathBuf> {
        Ok(self.mount_point()?.join(&self.group))
    }

    fn existing_path(&self) -> Result<PathBuf> {
        let path = self.path()?;
        if !path.is_dir() {
            return Err(Error::configuration(format!(
                "cgroup path {} does not exist or is not a directory",
                path.display()
            )));
        }
        Ok(path)
    }
}

/// Idempotent; fails only if the path exists and is not a directory.
pub fn create(info: &CgroupInfo) -> Result<()> {
    let path = info.path()?;
    if path.exists() {
        if !path.is_dir() {
            return Err(Error::configuration(format!(
                "path {} has already been used and is not a directory",
                path.display()
            )));
        }
        return Ok(());
    }
    fs::create_dir_all(&path)?;
    Ok(())
}

/// Reads a single integer from `<dir>/<property>`.
pub fn read_scalar(info: &CgroupInfo, property: &str) -> Result<i64> {
    let path = info.existing_path()?.join(property);
    let content = fs::read_to_string(&path)?;
    content.trim().parse::<i64>().map_err(|_| {
        Error::configuration(format!("could not parse `{}` as an integer", path.display()))
    })
}

/// Reads whitespace-separated integers; tolerates empty or short reads.
pub fn read_array(info: &CgroupInfo, property: &str) -> Result<Vec<i64>> {
    let path = info.existing_path()?.join(property);
    let content = match fs::read_to_string(&path) {
        Ok(v) => v,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    Ok(content
        .split_whitespace()
        .filter_map(|tok| tok.parse::<i64>().ok())
        .collect())
}

/// Reads `"name value"` lines into a mapping.
pub fn read_map(info: &CgroupInfo, property: &str) -> Result<BTreeMap<String, i64>> {
    let path = info.existing_path()?.join(property);
    let content = fs::read_to_string(&path)?;
    let mut result = BTreeMap::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let name = match parts.next() {
            Some(v) => v,
            None => continue,
        };
        let value = match parts.next().and_then(|v| v.parse::<i64>().ok()) {
            Some(v) => v,
            None => continue,
        };
        result.insert(name.to_owned(), value);
    }
    Ok(result)
}

/// Writes an integer. `overwrite = false` appends instead of truncating.
pub fn write_scalar(info: &CgroupInfo, property: &str, value: i64, overwrite: bool) -> Result<()> {
    write_string(info, property, &value.to_string(), overwrite)
}

/// Writes a literal string (e.g. the `"max"` sentinel).
pub fn write_string(info: &CgroupInfo, property: &str, value: &str, overwrite: bool) -> Result<()> {
    let path = info.existing_path()?.join(property);
    let mut file = OpenOptions::new()
        .write(true)
        .create(false)
        .truncate(overwrite)
        .append(!overwrite)
        .open(&path)?;
    writeln!(file, "{value}")?;
    Ok(())
}

/// Reads `tasks` and sends `SIGKILL` to each pid; a failed signal for any
/// individual pid propagates.
pub fn kill_members(info: &CgroupInfo) -> Result<()> {
    for pid in read_array(info, "tasks")? {
        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => {}
            // The task may have already exited on its own.
            Err(nix::errno::Errno::ESRCH) => {}
            Err(err) => return Err(Error::syscall("kill", err)),
        }
    }
    Ok(())
}

/// `kill_members` then `rmdir` the group directory.
pub fn remove(info: &CgroupInfo) -> Result<()> {
    kill_members(info)?;
    let path = info.existing_path()?;
    fs::remove_dir(&path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_controller_or_group() {
        assert!(CgroupInfo::new("", "g").is_err());
        assert!(CgroupInfo::new("   ", "g").is_err());
        assert!(CgroupInfo::new("c", "").is_err());
        assert!(CgroupInfo::new("c", "  ").is_err());
    }

    #[test]
    fn accepts_normal_names() {
        assert!(CgroupInfo::new("memory", "judge-1").is_ok());
    }
}
