use judge_sandbox::api::{get_cgroup_property, get_cgroup_sub_property, remove_cgroup};
use judge_sandbox::cgroup::{self, CgroupInfo};
use nix::unistd::Uid;

mod common;

use common::TempCgroup;

fn require_root() -> bool {
    if !Uid::effective().is_root() {
        eprintln!("skipping: this test requires root to create cgroups");
        return false;
    }
    true
}

#[test]
fn reads_scalar_property_after_writing_it() {
    if !require_root() {
        return;
    }
    let temp = TempCgroup::new();
    let info = CgroupInfo::new("memory", temp.name()).unwrap();
    cgroup::create(&info).unwrap();
    cgroup::write_scalar(&info, "memory.limit_in_bytes", 64 * 1024 * 1024, true).unwrap();

    let value = get_cgroup_property("memory", temp.name(), "memory.limit_in_bytes").unwrap();
    assert_eq!(value, 64 * 1024 * 1024);
}

#[test]
fn reads_map_property_subkey() {
    if !require_root() {
        return;
    }
    let temp = TempCgroup::new();
    let info = CgroupInfo::new("memory", temp.name()).unwrap();
    cgroup::create(&info).unwrap();

    // A freshly created group has never cached anything.
    let cache = get_cgroup_sub_property("memory", temp.name(), "memory.stat", "cache").unwrap();
    assert_eq!(cache, 0);
}

#[test]
fn remove_cgroup_deletes_the_directory() {
    if !require_root() {
        return;
    }
    let temp = TempCgroup::new();
    let info = CgroupInfo::new("memory", temp.name()).unwrap();
    cgroup::create(&info).unwrap();
    assert!(info.path().unwrap().is_dir());

    remove_cgroup("memory", temp.name()).unwrap();
    assert!(!info.path().unwrap().exists());
}
