use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn agent_virt(root: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("agent-virt").into();
    cmd.env("AGENT_VIRT_DIR", root.path())
        .env_remove("AGENT_VIRT_LOG");
    cmd
}

fn dirs(root: &tempfile::TempDir) -> (String, String) {
    let read = root.path().join("src");
    let write = root.path().join("out");
    std::fs::create_dir_all(&read).unwrap();
    std::fs::create_dir_all(&write).unwrap();
    (
        read.to_string_lossy().into_owned(),
        write.to_string_lossy().into_owned(),
    )
}

#[test]
fn help_works() {
    let root = tempfile::tempdir().unwrap();
    agent_virt(&root)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("isolated libvirt VMs"))
        .stdout(predicate::str::contains("create-base-image"));
}

#[test]
fn create_without_base_image_fails() {
    let root = tempfile::tempdir().unwrap();
    let (read, write) = dirs(&root);
    agent_virt(&root)
        .args(["create", "noble", &read, &write, "agent1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("base image not found"));
    assert!(!root.path().join("run").join("agent1.qcow2").exists());
}

#[test]
fn create_with_missing_read_dir_fails() {
    let root = tempfile::tempdir().unwrap();
    let (_, write) = dirs(&root);
    let base = root.path().join("base");
    std::fs::create_dir_all(&base).unwrap();
    std::fs::write(base.join("noble.qcow2"), b"not really qcow2").unwrap();

    let missing = root.path().join("nope").to_string_lossy().into_owned();
    agent_virt(&root)
        .args(["create", "noble", &missing, &write, "agent1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("host directory not found"));
    assert!(!root.path().join("run").join("agent1.qcow2").exists());
}

#[test]
fn create_rejects_invalid_name() {
    let root = tempfile::tempdir().unwrap();
    let (read, write) = dirs(&root);
    agent_virt(&root)
        .args(["create", "noble", &read, &write, "../evil"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("name must match"));
}

#[test]
fn create_rejects_bad_ram() {
    let root = tempfile::tempdir().unwrap();
    let (read, write) = dirs(&root);
    agent_virt(&root)
        .args(["create", "--ram", "lots", "noble", &read, &write, "agent1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("validation error"));
}

#[test]
fn run_before_create_fails() {
    let root = tempfile::tempdir().unwrap();
    agent_virt(&root)
        .args(["run", "agent1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("has no disk"));
}

#[test]
fn create_base_image_requires_iso() {
    let root = tempfile::tempdir().unwrap();
    agent_virt(&root)
        .env_remove("UBUNTU_ISO")
        .args(["create-base-image", "noble"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("UBUNTU_ISO is not set"));
    assert!(!root.path().join("base").join("noble.qcow2").exists());
}

#[test]
fn malformed_config_is_reported() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(
        root.path().join("agent-virt.toml"),
        "[defaults]\nram = \"tiny\"\n",
    )
    .unwrap();
    agent_virt(&root)
        .args(["run", "agent1"])
        .assert()
        .failure();
}
