//! End-to-end exercises of the local adapter through the public `Engine` API,
//! spawning real child processes rather than mocking the adapter trait.

use std::time::Duration;

use xec::{CommandBuilder, Engine, PipeOptions, RetryConfig};

#[tokio::test]
async fn executes_a_command_and_reads_its_stdout() {
    let engine = Engine::local();
    let cmd = CommandBuilder::new("echo").arg("hello").arg("world").shell(false).build().unwrap();
    let text = engine.execute(cmd).text().await.unwrap();
    assert_eq!(text.trim(), "hello world");
    engine.dispose().await;
}

#[tokio::test]
async fn nonzero_exit_surfaces_as_command_failure() {
    let engine = Engine::local();
    let cmd = CommandBuilder::new("sh").arg("-c").arg("exit 7").shell(false).build().unwrap();
    let err = engine.execute(cmd).result().await.unwrap_err();
    assert!(matches!(err, xec::Error::CommandFailure { exit_code: Some(7), .. }));
    engine.dispose().await;
}

#[tokio::test]
async fn nothrow_reports_failure_without_propagating_an_error() {
    let engine = Engine::local();
    let cmd = CommandBuilder::new("sh").arg("-c").arg("exit 1").shell(false).build().unwrap();
    let outcome = engine.execute(cmd).nothrow().result().await.unwrap();
    assert!(!outcome.ok());
    engine.dispose().await;
}

#[tokio::test]
async fn lines_splits_stdout_on_newlines() {
    let engine = Engine::local();
    let cmd = CommandBuilder::new("printf").arg("a\nb\nc\n").shell(false).build().unwrap();
    let lines = engine.execute(cmd).lines().await.unwrap();
    assert_eq!(lines, vec!["a", "b", "c"]);
    engine.dispose().await;
}

#[tokio::test]
async fn pipe_to_command_chains_stdout_into_a_downstream_program() {
    let engine = Engine::local();
    let upstream = CommandBuilder::new("printf").arg("one\ntwo\nTHREE\n").shell(false).build().unwrap();
    let downstream = CommandBuilder::new("grep").arg("-i").arg("t").shell(false).build().unwrap();
    let lines = engine
        .execute(upstream)
        .pipe_to_command(downstream, PipeOptions::default())
        .lines()
        .await
        .unwrap();
    assert_eq!(lines, vec!["two", "THREE"]);
    engine.dispose().await;
}

#[tokio::test]
async fn retry_recovers_a_command_that_eventually_succeeds() {
    let engine = Engine::local();
    let marker = tempfile::NamedTempFile::new().unwrap();
    let marker_path = marker.path().display().to_string();
    // Fails until the marker file has grown to 2 bytes, succeeds after that.
    let script = format!(
        "n=$(wc -c < {marker_path} | tr -d ' '); printf x >> {marker_path}; [ \"$n\" -ge 2 ]"
    );
    let cmd = CommandBuilder::new("sh").arg("-c").arg(script).shell(false).build().unwrap();

    let retry = RetryConfig::new().max_retries(5).initial_delay(Duration::from_millis(1));
    let outcome = engine.execute(cmd).retry(retry).result().await.unwrap();
    assert!(outcome.ok());
    engine.dispose().await;
}

#[tokio::test]
async fn timeout_on_a_long_running_command_is_reported() {
    let engine = Engine::local();
    let cmd = CommandBuilder::new("sleep")
        .arg("5")
        .shell(false)
        .timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let err = engine.execute(cmd).result().await.unwrap_err();
    assert!(matches!(err, xec::Error::Timeout { .. }));
    engine.dispose().await;
}

#[tokio::test]
async fn which_finds_a_binary_known_to_exist_on_posix_hosts() {
    let engine = Engine::local();
    let found = engine.which("sh").await;
    assert!(found.is_some());
    assert!(!engine.is_command_available("definitely-not-a-real-binary-xyz").await);
    engine.dispose().await;
}

#[tokio::test]
async fn parallel_all_runs_independent_commands_concurrently() {
    let engine = Engine::local();
    let commands: Vec<_> = (0..4)
        .map(|i| CommandBuilder::new("echo").arg(i.to_string()).shell(false).build().unwrap())
        .collect();
    let outcomes = engine.parallel_all(commands, Default::default()).await.unwrap();
    assert_eq!(outcomes.len(), 4);
    assert!(outcomes.iter().all(|o| o.ok()));
    engine.dispose().await;
}

#[tokio::test]
async fn cache_serves_a_second_call_without_rerunning_the_command() {
    let engine = Engine::local();
    let marker = tempfile::NamedTempFile::new().unwrap();
    let marker_path = marker.path().display().to_string();
    let cache_key = xec::CacheOptions::new().key("count-runs").ttl(Duration::from_secs(30));

    let first_cmd = CommandBuilder::new("sh")
        .arg("-c")
        .arg(format!("printf x >> {marker_path}; wc -c < {marker_path}"))
        .shell(false)
        .build()
        .unwrap();
    let first = engine.execute(first_cmd).cache(cache_key.clone()).text().await.unwrap();

    let second_cmd = CommandBuilder::new("sh")
        .arg("-c")
        .arg(format!("printf x >> {marker_path}; wc -c < {marker_path}"))
        .shell(false)
        .build()
        .unwrap();
    let second = engine.execute(second_cmd).cache(cache_key).text().await.unwrap();

    assert_eq!(first.trim(), second.trim());
    engine.dispose().await;
}
