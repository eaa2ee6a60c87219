#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_cmd::cargo::cargo_bin_cmd;
use sombra_pagelog::ops::{AppendRecord, IncrementCounter};
use sombra_pagelog::primitives::io::{FileIo, StdFileIo};
use sombra_pagelog::{Lsn, OpLog, OpLogOptions, PageKey, PageOperation};
use tempfile::TempDir;

const SALT: u64 = 77;

fn seed_log(dir: &Path) -> PathBuf {
    let path = dir.join("seed.oplog");
    let io = StdFileIo::open(&path).expect("open log");
    let log = OpLog::open(Arc::new(io), OpLogOptions::new(SALT, Lsn(1))).expect("oplog");
    let page = PageKey::new(3, 9);
    log.append_batch(&[
        PageOperation::new(
            page,
            AppendRecord {
                version: 1,
                payload: b"abc".to_vec(),
                requested: None,
                position: 0,
            },
        ),
        PageOperation::new(page, IncrementCounter { index: 0 }),
        PageOperation::new(page, IncrementCounter { index: 1 }),
    ])
    .expect("append");
    log.sync().expect("sync");
    path
}

fn stdout_of(args: &[&str], log: &Path) -> String {
    let output = cargo_bin_cmd!("sombra-oplog")
        .args(args)
        .arg(log)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    String::from_utf8(output).expect("utf8 output")
}

#[test]
fn dump_prints_records_in_order() {
    let dir = TempDir::new().expect("tempdir");
    let log = seed_log(dir.path());
    let out = stdout_of(&["dump"], &log);
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("append_record page=3:9"));
    assert!(lines[0].contains("payload=616263"));
    assert!(lines[2].contains("increment_counter"));

    let limited = stdout_of(&["dump", "--limit", "1"], &log);
    assert_eq!(limited.lines().count(), 1);
}

#[test]
fn stats_counts_by_type() {
    let dir = TempDir::new().expect("tempdir");
    let log = seed_log(dir.path());
    let out = stdout_of(&["--salt", "77", "stats"], &log);
    assert!(out.contains("append_record"));
    assert!(out.lines().any(|l| l.contains("increment_counter") && l.contains(" 2 (")));
}

#[test]
fn verify_reports_torn_tail_and_salt_mismatch() {
    let dir = TempDir::new().expect("tempdir");
    let log = seed_log(dir.path());
    let clean = stdout_of(&["verify"], &log);
    assert!(clean.contains("ok"));

    let io = StdFileIo::open(&log).expect("open");
    let len = io.len().expect("len");
    io.truncate(len - 2).expect("truncate");
    drop(io);
    let torn = stdout_of(&["verify"], &log);
    assert!(torn.contains("Torn tail"));

    cargo_bin_cmd!("sombra-oplog")
        .args(["--salt", "1", "verify"])
        .arg(&log)
        .assert()
        .failure();
    cargo_bin_cmd!("sombra-oplog")
        .arg("verify")
        .arg(dir.path().join("missing.oplog"))
        .assert()
        .failure();
}
