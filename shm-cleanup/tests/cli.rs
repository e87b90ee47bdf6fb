use std::fs;

use assert_cmd::Command;

fn cleanup() -> Command {
    Command::cargo_bin("shm-cleanup").unwrap()
}

#[test]
fn dry_run_lists_leftovers() {
    let tmp = tempfile::tempdir().unwrap();
    let shm = tempfile::tempdir().unwrap();

    fs::create_dir_all(tmp.path().join("na_sm_ghost/17/0")).unwrap();
    fs::write(shm.path().join("na_sm_ghost-17-0"), b"").unwrap();
    fs::write(shm.path().join("na_sm_ghost-17-3"), b"").unwrap();
    fs::write(shm.path().join("na_sm_ghostly-17-0"), b"").unwrap();
    fs::write(shm.path().join("na_sm_other-17-0"), b"").unwrap();

    let output = cleanup()
        .arg("--tmp-dir")
        .arg(tmp.path())
        .arg("--shm-dir")
        .arg(shm.path())
        .args(["--user", "ghost", "--dry-run"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let output = String::from_utf8(output).unwrap();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 3, "{output}");
    assert!(lines[0].ends_with("na_sm_ghost"));
    assert!(lines[1].ends_with("na_sm_ghost-17-0"));
    assert!(lines[2].ends_with("na_sm_ghost-17-3"));
    assert!(lines.iter().all(|line| line.starts_with("would remove ")));

    // Nothing was touched.
    assert!(tmp.path().join("na_sm_ghost/17/0").is_dir());
    assert!(shm.path().join("na_sm_ghost-17-0").exists());
}

#[test]
fn nothing_to_remove() {
    let tmp = tempfile::tempdir().unwrap();
    let shm = tempfile::tempdir().unwrap();

    cleanup()
        .arg("--tmp-dir")
        .arg(tmp.path())
        .arg("--shm-dir")
        .arg(shm.path())
        .args(["--user", "ghost"])
        .assert()
        .success()
        .stdout("");
}

#[test]
fn removes_socket_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let shm = tempfile::tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("na_sm_ghost/17/0")).unwrap();

    cleanup()
        .arg("--tmp-dir")
        .arg(tmp.path())
        .arg("--shm-dir")
        .arg(shm.path())
        .args(["--user", "ghost"])
        .assert()
        .success();

    assert!(!tmp.path().join("na_sm_ghost").exists());
    assert!(tmp.path().exists());
}
