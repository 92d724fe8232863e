use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use colored::Colorize;
use log::{info, warn};
use serde_json::{Map, Value};
use speedcheck::config::resolver::{parse_override, ConfigResolver};
use speedcheck::errors::{exit_codes, format_error_for_display};
use speedcheck::messaging::Messenger;
use speedcheck::output::{self, DisplayMode};
use speedcheck::transport::NetworkTransport;
use speedcheck::{host, SpeedTest, SpeedTestError};
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc::unbounded_channel;
use url::Url;

#[derive(Parser)]
#[command(
    author,
    version = env!("SPEEDCHECK_BUILD_GIT_HASH"),
    about,
    long_about = None
)]
struct Cli {
    /// Base URL of the speed test server
    #[arg(long, default_value = "http://localhost:8080")]
    server: Url,

    /// Override a configuration value, e.g. `download.streams=2`
    #[arg(
        long = "set",
        value_name = "KEY=VALUE",
        value_parser = parse_override
    )]
    overrides: Vec<(String, Value)>,

    /// Print the final status as JSON
    #[arg(long)]
    json: bool,

    /// Accept commands on stdin and write status events to stdout, one
    /// JSON document per line
    #[arg(long, conflicts_with = "json")]
    stdio: bool,

    /// Do not store the result on the server
    #[arg(long)]
    no_save: bool,

    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .target(env_logger::Target::Stderr)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", format_error_for_display(&e).red());
            e.exit_code()
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, SpeedTestError> {
    let mut overrides: Map<String, Value> = cli.overrides.into_iter().collect();
    if cli.no_save {
        overrides.insert("result.enabled".to_string(), Value::Bool(false));
    }

    let config = ConfigResolver::new(cli.server)
        .with_overrides(overrides)
        .load()
        .await?;
    let transport = NetworkTransport::new(config.timeout())?;

    let (tx, rx) = unbounded_channel();
    let messenger = Messenger::new(tx, Duration::ZERO);
    let test = SpeedTest::new(config, Arc::new(transport), messenger)?;

    if cli.stdio {
        let input = BufReader::new(tokio::io::stdin());
        host::serve(test, rx, input, tokio::io::stdout())
            .await
            .map_err(|e| {
                SpeedTestError::transport("stdio host failed").with_source(e)
            })?;
        return Ok(exit_codes::SUCCESS);
    }

    let mode = DisplayMode::detect(cli.json, std::io::stdout().is_terminal());
    let progress = tokio::spawn(output::follow_progress(rx, mode));

    let signal = {
        let test = test.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, aborting the test");
                test.abort();
            }
        })
    };

    let outcome = test.start().await;
    let event = test.status_event();

    // The progress task ends once every handle on the engine is gone.
    signal.abort();
    let _ = signal.await;
    drop(test);
    let _ = progress.await;

    output::report(&event, mode).map_err(|e| {
        SpeedTestError::protocol("could not encode the report").with_source(e)
    })?;

    match outcome {
        Ok(_) => {
            info!("Test finished with status {}", event.status);
            Ok(exit_codes::SUCCESS)
        }
        // The report already carries the error.
        Err(e) => Ok(e.exit_code()),
    }
}
