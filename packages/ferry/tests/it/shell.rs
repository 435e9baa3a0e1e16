//! End-to-end runs of the shell transport against a real local shell.

use ferry::{Operation, ScopedSession, ShellTransport, Transport};
use tempfile::TempDir;

use crate::example_definition;

fn transport_with_temp_cache() -> (TempDir, ShellTransport) {
    let temp = TempDir::new().expect("create temporary directory");
    let bin = temp.path().join("bin");
    let versions = bin.join(".versions");
    let transport = ShellTransport::new(&serde_json::json!({ "shell": "/bin/sh" }))
        .expect("parse shell spec")
        .with_cache_paths(
            bin.to_string_lossy().into_owned(),
            versions.to_string_lossy().into_owned(),
        );
    (temp, transport)
}

async fn run_with_factory(
    factory: ferry::command::CommandFactory,
) -> (TempDir, ferry::Result<bool>) {
    let (temp, transport) = transport_with_temp_cache();
    let mut transport = transport.with_command_factory(factory);
    let result = ScopedSession::new(&mut transport)
        .run(
            Vec::new(),
            "--mocked--",
            &example_definition(),
            Operation::Backup,
            "",
        )
        .await;
    (temp, result)
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn executes_command_locally_and_it_returns_fine() {
    let (_temp, result) =
        run_with_factory(|_, _, _, _, _| vec!["test".to_string(), "-d".to_string(), "/".to_string()])
            .await;
    assert!(result.unwrap());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn returns_failure_when_the_command_fails() {
    let (_temp, result) = run_with_factory(|_, _, _, _, _| vec!["false".to_string()]).await;
    assert!(!result.unwrap());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn fails_when_the_command_does_not_exist() {
    let (_temp, result) =
        run_with_factory(|_, _, _, _, _| vec!["some-not-existing-command".to_string()]).await;
    assert!(!result.unwrap());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn preparing_an_empty_binary_set_creates_the_cache_layout() {
    let (temp, mut transport) = transport_with_temp_cache();
    transport.prepare_environment(Vec::new()).await.unwrap();

    assert!(temp.path().join("bin").join(".versions").is_dir());
}
