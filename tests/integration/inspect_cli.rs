#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use bytes::Bytes;
use serde_json::Value;
use tempfile::TempDir;

use gbptree::{BytesLayout, GbpTree, GbpTreeOptions, U64Layout};

fn options() -> GbpTreeOptions {
    GbpTreeOptions::default().with_page_size(512)
}

fn setup_tree(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.gbpt"));
    let tree = GbpTree::open(&path, U64Layout, options()).expect("open tree");
    for key in 0..250u64 {
        tree.put(&key, &(key * 3)).expect("put");
    }
    tree.close().expect("close");
    (dir, path)
}

fn json_output(args: &[&str], path: &Path) -> Value {
    let output = cargo_bin_cmd!("gbptree-inspect")
        .args(["--format", "json", "--page-size", "512"])
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn state_reports_clean_file() {
    let (_dir, path) = setup_tree("state");
    let json = json_output(&["state"], &path);
    assert_eq!(json["page_size"].as_u64(), Some(512));
    assert_eq!(json["clean"].as_bool(), Some(true));
    let stable = json["stable_generation"].as_u64().expect("stable");
    let unstable = json["unstable_generation"].as_u64().expect("unstable");
    assert!(unstable > stable);
}

#[test]
fn check_passes_on_clean_file() {
    let (_dir, path) = setup_tree("check");
    let json = json_output(&["check"], &path);
    assert_eq!(json["violations"].as_array().map(Vec::len), Some(0));
    assert!(json["nodes_visited"].as_u64().unwrap_or(0) > 1);
}

#[test]
fn check_exits_with_two_on_crashed_file() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("crashed.gbpt");
    {
        let tree = GbpTree::open(&path, U64Layout, options()).expect("open tree");
        tree.put(&1, &1).expect("put");
        tree.checkpoint().expect("checkpoint");
        tree.put(&2, &2).expect("put");
        tree.page_file().flush().expect("flush");
    }
    let bytes_before = fs::read(&path).expect("read file");
    cargo_bin_cmd!("gbptree-inspect")
        .args(["--page-size", "512", "check"])
        .arg(&path)
        .assert()
        .code(2);
    assert_eq!(fs::read(&path).expect("read file"), bytes_before);
}

#[test]
fn dump_lists_shape_and_entries() {
    let (_dir, path) = setup_tree("dump");
    let json = json_output(&["dump", "--limit", "10"], &path);
    assert_eq!(json["key_count"].as_u64(), Some(250));
    assert!(json["levels"].as_array().map(Vec::len).unwrap_or(0) >= 1);
    let entries = json["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 10);
    assert_eq!(entries[3]["key"].as_str(), Some("3"));
    assert_eq!(entries[3]["value"].as_str(), Some("9"));
    assert_eq!(json["truncated"].as_bool(), Some(true));
    assert!(json["state"]["root_id"].as_u64().is_some());
}

#[test]
fn stats_counts_the_walk() {
    let (_dir, path) = setup_tree("stats");
    let json = json_output(&["stats"], &path);
    assert!(json["seeks"].as_u64().unwrap_or(0) >= 1);
    assert_eq!(json["checkpoints"].as_u64(), Some(0));
}

#[test]
fn config_file_selects_layout_and_page_size() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("bytes.gbpt");
    let tree = GbpTree::open(&path, BytesLayout, options()).expect("open tree");
    tree.put(&Bytes::from_static(b"\x01\xff"), &Bytes::from_static(b"ok"))
        .expect("put");
    tree.close().expect("close");

    let config = dir.path().join("inspect.toml");
    fs::write(&config, "layout = \"bytes\"\n\n[tree]\npage_size = 512\n").expect("write config");
    let output = cargo_bin_cmd!("gbptree-inspect")
        .args(["--format", "json", "--config"])
        .arg(&config)
        .arg("dump")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["entries"][0]["key"].as_str(), Some("01ff"));
    assert_eq!(json["entries"][0]["value"].as_str(), Some("6f6b"));
}

#[test]
fn wrong_layout_and_missing_files_fail() {
    let (_dir, path) = setup_tree("mismatch");
    cargo_bin_cmd!("gbptree-inspect")
        .args(["--page-size", "512", "--layout", "bytes", "state"])
        .arg(&path)
        .assert()
        .code(1);

    let missing = path.with_extension("missing");
    let output = cargo_bin_cmd!("gbptree-inspect")
        .args(["state"])
        .arg(&missing)
        .assert()
        .code(1)
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("error:"));
}
