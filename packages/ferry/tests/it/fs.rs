//! Local filesystem round-trips on a real temporary directory.

use ferry::fs::{Filesystem, LocalFilesystem};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn path(temp: &TempDir, name: &str) -> String {
    temp.path().join(name).to_string_lossy().into_owned()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn pack_and_unpack_round_trip_selected_files() {
    let temp = TempDir::new().unwrap();
    let fs = LocalFilesystem::new();
    let src = path(&temp, "versions");
    let dst = path(&temp, "unpacked");
    fs.force_mkdir(&src).await.unwrap();
    fs.force_mkdir(&dst).await.unwrap();
    tokio::fs::write(format!("{src}/v1.0.0-tracexit"), b"tracexit binary")
        .await
        .unwrap();
    tokio::fs::write(format!("{src}/v1.0.0-other"), b"unrelated")
        .await
        .unwrap();

    let archive = path(&temp, "tools.tar.gz");
    fs.pack(&archive, &src, &["v1.0.0-tracexit".to_string()])
        .await
        .unwrap();
    fs.unpack(&archive, &dst).await.unwrap();

    let restored = tokio::fs::read(format!("{dst}/v1.0.0-tracexit")).await.unwrap();
    assert_eq!(restored, b"tracexit binary");
    assert!(!fs.file_exists(&format!("{dst}/v1.0.0-other")).await.unwrap());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn packing_everything_includes_hidden_files() {
    let temp = TempDir::new().unwrap();
    let fs = LocalFilesystem::new();
    let src = path(&temp, "src");
    let dst = path(&temp, "dst");
    fs.force_mkdir(&src).await.unwrap();
    fs.force_mkdir(&dst).await.unwrap();
    tokio::fs::write(format!("{src}/visible"), b"a").await.unwrap();
    tokio::fs::write(format!("{src}/.hidden"), b"b").await.unwrap();

    let archive = path(&temp, "all.tar.gz");
    fs.pack(&archive, &src, &[]).await.unwrap();
    fs.unpack(&archive, &dst).await.unwrap();

    assert!(fs.file_exists(&format!("{dst}/visible")).await.unwrap());
    assert!(fs.file_exists(&format!("{dst}/.hidden")).await.unwrap());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn move_link_and_executable_bit() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let fs = LocalFilesystem::new();
    let slot = path(&temp, "v1.0.0-tool");
    let staged = path(&temp, "staged");
    let link = path(&temp, "tool");
    tokio::fs::write(&staged, b"#!/bin/sh\n").await.unwrap();

    fs.move_file(&staged, &slot).await.unwrap();
    fs.make_executable(&slot).await.unwrap();
    fs.link(&slot, &link).await.unwrap();

    assert!(fs.file_exists(&slot).await.unwrap());
    assert!(!fs.file_exists(&staged).await.unwrap());
    let mode = tokio::fs::metadata(&slot).await.unwrap().permissions().mode();
    assert_ne!(mode & 0o111, 0, "slot must be executable");
    let target = tokio::fs::read_link(&link).await.unwrap();
    assert_eq!(target.to_string_lossy(), slot);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn deleting_a_missing_file_is_tolerated() {
    let temp = TempDir::new().unwrap();
    let fs = LocalFilesystem::new();

    fs.delete_file(&path(&temp, "never-existed")).await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn temp_dir_paths_are_unique() {
    let fs = LocalFilesystem::new();
    let first = fs.temp_dir_path();
    let second = fs.temp_dir_path();
    assert_ne!(first, second);
}
