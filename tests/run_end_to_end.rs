#![cfg(unix)]

use std::fs;
use std::path::Path;

use clap::Parser;
use dagrun::cli::CliArgs;
use dagrun_test_utils::{init_tracing, with_timeout};

const CONFIG: &str = r#"
[config]
parallel = 2

[task."lib:build"]
options = { command = "mkdir -p dist && echo lib > dist/lib.txt && echo lib >> runs.log && echo built lib" }
outputs = ["dist/lib.txt"]

[task."app:build"]
options = { command = "cat dist/lib.txt > app.txt && echo app >> runs.log" }
outputs = ["app.txt"]
after = ["lib:build"]
"#;

fn args(config: &Path, extra: &[&str]) -> CliArgs {
    let mut argv = vec!["dagrun", "--config", config.to_str().unwrap()];
    argv.extend_from_slice(extra);
    CliArgs::parse_from(argv)
}

fn runs(root: &Path) -> Vec<String> {
    fs::read_to_string(root.join("runs.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn second_run_is_served_from_cache_and_restores_outputs() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    let config = ws.path().join("Dagrun.toml");
    fs::write(&config, CONFIG).unwrap();

    let code = with_timeout(dagrun::run(args(&config, &[]))).await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(runs(ws.path()), vec!["lib", "app"]);
    assert_eq!(fs::read_to_string(ws.path().join("app.txt")).unwrap(), "lib\n");
    assert!(ws.path().join(".dagrun/outputs-hashes").exists());

    fs::remove_file(ws.path().join("dist/lib.txt")).unwrap();

    let code = with_timeout(dagrun::run(args(&config, &[]))).await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(runs(ws.path()), vec!["lib", "app"], "nothing ran again");
    assert_eq!(fs::read_to_string(ws.path().join("dist/lib.txt")).unwrap(), "lib\n");

    let code = with_timeout(dagrun::run(args(&config, &["--skip-cache"]))).await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(runs(ws.path()).len(), 4);
}

#[tokio::test]
async fn the_first_failing_task_sets_the_exit_code() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    let config = ws.path().join("Dagrun.toml");
    fs::write(
        &config,
        r#"
        [task."lib:build"]
        options = { command = "exit 5" }

        [task."app:build"]
        options = { command = "echo app >> runs.log" }
        after = ["lib:build"]

        [task."docs:build"]
        options = { command = "exit 2" }
        "#,
    )
    .unwrap();

    let code = with_timeout(dagrun::run(args(&config, &["--parallel", "1"])))
        .await
        .unwrap();

    assert_eq!(code, 5);
    assert!(runs(ws.path()).is_empty(), "app:build is skipped");
}

#[tokio::test]
async fn dry_run_executes_nothing() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    let config = ws.path().join("Dagrun.toml");
    fs::write(&config, CONFIG).unwrap();

    let code = with_timeout(dagrun::run(args(&config, &["--dry-run"]))).await.unwrap();

    assert_eq!(code, 0);
    assert!(runs(ws.path()).is_empty());
    assert!(!ws.path().join(".dagrun").exists());
}

#[tokio::test]
async fn invalid_configs_are_reported_as_errors() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    let config = ws.path().join("Dagrun.toml");
    fs::write(
        &config,
        r#"
        [task."app:build"]
        options = { command = "true" }
        after = ["app:build"]
        "#,
    )
    .unwrap();

    let err = with_timeout(dagrun::run(args(&config, &[]))).await.unwrap_err();
    assert!(format!("{err:#}").contains("cannot depend on itself"));

    fs::write(&config, CONFIG).unwrap();
    let err = with_timeout(dagrun::run(args(&config, &["--parallel", "0"])))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("parallel must be >= 1"), "CLI overrides are validated");
}
