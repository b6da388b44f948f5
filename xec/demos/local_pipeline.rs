//! Runs a small local pipeline: generate some lines, filter them through `grep`,
//! and uppercase what's left, then prints the result.

use xec::{CommandBuilder, Engine, PipeOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    xec::init();

    let engine = Engine::local();

    let source = CommandBuilder::new("printf")
        .arg("one\ntwo\nTHREE\nfour\n")
        .shell(false)
        .build()?;
    let grep = CommandBuilder::new("grep").arg("-i").arg("t").shell(false).build()?;

    let output = engine
        .execute(source)
        .pipe_to_command(grep, PipeOptions::default())
        .pipe_stage(xec::to_uppercase())
        .text()
        .await?;

    println!("filtered and uppercased:\n{output}");

    for line in engine.execute(CommandBuilder::new("ls").arg("-1").shell(false).build()?).lines().await? {
        println!("entry: {line}");
    }

    engine.dispose().await;
    Ok(())
}
