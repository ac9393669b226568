use std::{fs, path::PathBuf};

use assert_cmd::Command;
use escargot::CargoBuild;
use predicates::prelude::*;
use tempfile::TempDir;

fn enclog() -> Command {
    let mut cmd = Command::from_std(CargoBuild::new().bin("enclog").run().unwrap().command());
    cmd.env_remove("ENCLOG_CONFIG")
        .env_remove("ENCLOG_HSM_STATE")
        .env("RUST_LOG", "info");
    cmd
}

fn write_config(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("enclog.yaml");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn help_lists_operator_flags() {
    let mut cmd = enclog();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Encrypted status log"))
        .stdout(predicate::str::contains("--force-regenerate"))
        .stdout(predicate::str::contains("--mount-point"))
        .stdout(predicate::str::contains("a/1 appends an encrypted"));
}

#[test]
fn short_help_keeps_the_summary() {
    let mut cmd = enclog();
    cmd.arg("-h");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "Encrypted status log backed by a secure element",
        ))
        .stdout(predicate::str::contains("c/2 clears the log"));
}

#[test]
fn appends_and_prints_records() {
    let dir = TempDir::new().expect("tempdir");
    let config = write_config(
        &dir,
        &format!(
            "storage:\n  backend: flash\n  mount_point: {}\nhsm:\n  state_file: {}\n",
            dir.path().join("flash").display(),
            dir.path().join("element.json").display()
        ),
    );

    let mut cmd = enclog();
    cmd.arg("--config").arg(&config).write_stdin("a\na\np\n");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("commands:"))
        .stdout(predicate::str::contains("00000080: "))
        .stderr(predicate::str::contains("key slot not provisioned"))
        .stderr(predicate::str::contains("no existing log").not());

    let log = dir.path().join("flash").join("enc_log.bin");
    assert_eq!(fs::metadata(&log).unwrap().len(), 160);

    // second run reuses the persisted key and keeps appending
    let mut cmd = enclog();
    cmd.arg("--config").arg(&config).write_stdin("1");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("00000000: "))
        .stderr(predicate::str::contains("using existing key"));
    assert_eq!(fs::metadata(&log).unwrap().len(), 240);
}

#[test]
fn clear_and_unknown_commands() {
    let dir = TempDir::new().expect("tempdir");
    let mut cmd = enclog();
    cmd.arg("--mount-point")
        .arg(dir.path())
        .write_stdin("a\nx\nc\n");
    cmd.assert()
        .success()
        .stderr(predicate::str::contains("unknown command"))
        .stderr(predicate::str::contains("log cleared."));
    let log = dir.path().join("enc_log.bin");
    assert_eq!(fs::metadata(&log).unwrap().len(), 0);
}

#[test]
fn memory_storage_flag_leaves_no_file() {
    let dir = TempDir::new().expect("tempdir");
    let mut cmd = enclog();
    cmd.current_dir(dir.path())
        .args(["--storage", "memory"])
        .write_stdin("a\np\n");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("00000040: "));
    assert!(!dir.path().join("enc_log.bin").exists());
}

#[test]
fn invalid_configuration_fails_boot() {
    let dir = TempDir::new().expect("tempdir");
    let config = write_config(&dir, "plaintext_max_len: 64\nrecord_size: 64\n");
    let mut cmd = enclog();
    cmd.arg("--config").arg(&config).write_stdin("a");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("record_size"));
}
