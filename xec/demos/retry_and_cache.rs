//! Demonstrates a flaky command recovering via retry, then a second handle on the
//! same command serving from cache instead of re-running it.

use std::time::Duration;

use xec::{CacheOptions, CommandBuilder, Engine, RetryConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    xec::init();

    let engine = Engine::local();

    // Fails two thirds of the time, succeeds on retry.
    let flaky = CommandBuilder::new("sh")
        .arg("-c")
        .arg("exit $(( $(date +%N) % 3 ))")
        .shell(false)
        .build()?;

    let retry = RetryConfig::new()
        .max_retries(5)
        .initial_delay(Duration::from_millis(20))
        .on_retry(|attempt, err| eprintln!("retry attempt {attempt} after: {err}"));

    match engine.execute(flaky).retry(retry).nothrow().result().await {
        Ok(outcome) if outcome.ok() => println!("flaky command eventually succeeded"),
        Ok(_) => println!("flaky command never succeeded within the retry budget"),
        Err(err) => println!("flaky command failed: {err}"),
    }

    let cache_key = CacheOptions::new().key("now").ttl(Duration::from_secs(30));
    let date = CommandBuilder::new("date").shell(false).build()?;
    let first = engine.execute(date).cache(cache_key.clone()).text().await?;
    println!("first call: {first}");

    let date_again = CommandBuilder::new("date").shell(false).build()?;
    let second = engine.execute(date_again).cache(cache_key).text().await?;
    println!("second call (served from cache): {second}");
    assert_eq!(first, second);

    engine.dispose().await;
    Ok(())
}
