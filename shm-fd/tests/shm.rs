#![cfg(target_os = "linux")]
use shm_fd::Shm;
use std::os::fd::AsFd;

fn unique(name: &str) -> String {
    format!("{}-{name}-{}", env!("CARGO_PKG_NAME"), std::process::id())
}

#[test]
fn create_open_unlink() {
    let shm = Shm::new();
    let name = unique("create");

    let fd = shm.create(&name, 0x2000).expect("to create a shared memory object");
    let stat = shm.stat(fd.as_fd()).unwrap();
    assert_eq!(stat.st_size, 0x2000);

    let err = shm.create(&name, 0x1000).err().expect("exclusive creation");
    assert_eq!(err.raw_os_error(), libc::EEXIST);

    let reopened = shm.open(&name).unwrap();
    assert_eq!(shm.stat(reopened.as_fd()).unwrap().st_size, 0x2000);

    shm.unlink(&name).unwrap();
    let err = shm.open(&name).err().expect("unlinked");
    assert_eq!(err.raw_os_error(), libc::ENOENT);
}

#[test]
fn rejects_nested_names() {
    let shm = Shm::new();
    let err = shm.open("a/b").err().unwrap();
    assert_eq!(err.raw_os_error(), libc::EINVAL);
}
