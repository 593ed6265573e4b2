use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Once;

use judge_sandbox::cgroup::{self, CgroupInfo};
use judge_sandbox::Error;
use rand::distributions::{Alphanumeric, DistString as _};
use tar::Archive;

pub struct TempDir(PathBuf);

impl TempDir {
    #[allow(unused)]
    pub fn new() -> Result<Self, Error> {
        let tmpdir = Path::new(env!("CARGO_TARGET_TMPDIR"));
        let path = loop {
            let path = tmpdir.join(format!("test-{}", rand_string(32)));
            match std::fs::metadata(&path) {
                Ok(_) => continue,
                Err(v) if v.kind() == ErrorKind::NotFound => break path,
                Err(v) => return Err(v.into()),
            }
        };
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    #[allow(unused)]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.0.join(path)
    }

    #[allow(unused)]
    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[allow(unused)]
pub fn rand_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

/// Downloads a small static-busybox rootfs once per test binary run and
/// returns a fresh archive handle for unpacking.
#[allow(unused)]
pub fn get_rootfs() -> Result<Archive<File>, Error> {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        assert!(std::process::Command::new("curl")
            .arg("-fsSL")
            .arg("--retry")
            .arg("5")
            .arg("https://github.com/docker-library/busybox/raw/31d342ad033e27c18723a516a2274ab39547be27/stable/glibc/busybox.tar.xz")
            .arg("-o")
            .arg("rootfs.tar.xz")
            .current_dir("./tests")
            .spawn()
            .unwrap()
            .wait()
            .unwrap()
            .success());
        assert!(std::process::Command::new("xz")
            .arg("-df")
            .arg("rootfs.tar.xz")
            .current_dir("./tests")
            .spawn()
            .unwrap()
            .wait()
            .unwrap()
            .success());
    });
    let mut rootfs = Archive::new(File::open("./tests/rootfs.tar")?);
    rootfs.set_preserve_permissions(true);
    rootfs.set_preserve_ownerships(true);
    rootfs.set_unpack_xattrs(true);
    Ok(rootfs)
}

/// A uniquely-named cgroup under `memory`/`cpuacct`/`pids`, removed from all
/// three on drop. `TEST_CGROUP_PREFIX` lets CI pin a writable parent name
/// when the default hierarchy root isn't writable by the test user.
pub struct TempCgroup(String);

const CONTROLLERS: [&str; 3] = ["memory", "cpuacct", "pids"];

impl TempCgroup {
    #[allow(unused)]
    pub fn new() -> Self {
        let prefix = std::env::var("TEST_CGROUP_PREFIX").unwrap_or_default();
        Self(format!("{prefix}judge-sandbox-test-{}", rand_string(16)))
    }

    #[allow(unused)]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Drop for TempCgroup {
    fn drop(&mut self) {
        for controller in CONTROLLERS {
            if let Ok(info) = CgroupInfo::new(controller, self.0.as_str()) {
                let _ = cgroup::remove(&info);
            }
        }
    }
}
