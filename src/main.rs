use std::error::Error;
use std::sync::Arc;

use serde_json::json;
use tracing::{error, info};

use urlgetter::context::Context;
use urlgetter::logging::{self, LogLevel};
use urlgetter::session::{BasicSession, PrinterCallbacks};
use urlgetter::urlgetter::{measurer, Config, Multi, MultiInput};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let level = std::env::var("URLGETTER_LOG")
        .ok()
        .and_then(|s| LogLevel::parse(&s))
        .unwrap_or(LogLevel::Info);
    logging::init(level);

    let targets: Vec<String> = std::env::args().skip(1).collect();
    if targets.is_empty() {
        eprintln!("usage: urlgetter <target>...");
        std::process::exit(2);
    }

    let mut config: Config = match std::env::var("URLGETTER_CONFIG") {
        Ok(raw) => serde_json::from_str(&raw)?,
        Err(_) => Config::default(),
    };
    config.timeout.get_or_insert(measurer::DEFAULT_TIMEOUT);
    let parallelism = match std::env::var("URLGETTER_PARALLELISM") {
        Ok(raw) => raw.parse()?,
        Err(_) => 0,
    };

    let inputs: Vec<MultiInput> = targets
        .iter()
        .map(|target| MultiInput {
            config: config.clone(),
            target: target.clone(),
        })
        .collect();
    info!("measuring {} targets", inputs.len());

    let mut multi = Multi::new(Arc::new(BasicSession::default()));
    multi.parallelism = parallelism;
    let ctx = Context::background();
    let mut outputs = multi.collect(&ctx, inputs, "urlgetter", Arc::new(PrinterCallbacks));
    while let Some(output) = outputs.recv().await {
        if let Some(err) = &output.err {
            error!("{}: {}", output.input.target, err);
        }
        let entry = json!({
            "input": output.input.target,
            "test_keys": output.test_keys,
        });
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}
