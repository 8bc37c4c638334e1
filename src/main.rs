//! Mock XHR - CLI Entry Point
//!
//! Loads a rule file and replays a single request against it, printing the
//! synthesized response.

use anyhow::Result;
use clap::Parser;
use mock_xhr::{handler, EventKind, MockXhr, MockXhrConfig, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mock-xhr",
    about = "Replay a request against mock XHR rules and print the synthesized response",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mock-xhr.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Request method
    #[arg(short, long, default_value = "GET")]
    method: String,

    /// Request URL
    #[arg(short, long, default_value = "/")]
    url: String,

    /// Request body
    #[arg(short, long)]
    body: Option<String>,

    /// Complete the request synchronously, ignoring the configured delay
    #[arg(long)]
    sync: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../demos/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    // Load configuration
    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        MockXhrConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no rules)");
        MockXhrConfig::default()
    };

    if args.validate {
        println!(
            "Configuration is valid ({} rules defined)",
            config.rules.len()
        );
        return Ok(());
    }

    let mock = Arc::new(MockXhr::from_config(&config)?);
    let xhr = mock.request();
    xhr.add_event_listener(
        EventKind::ReadyStateChange,
        handler(|event| debug!(state = ?event.target().ready_state(), "readystatechange")),
    );

    let options = OpenOptions {
        asynchronous: !args.sync,
        ..OpenOptions::default()
    };
    xhr.open_with(&args.method, &args.url, options)?;
    info!(delay = ?xhr.mock_delay(), mocked = xhr.is_mocked(), "Sending request");
    xhr.send(args.body.as_deref())?;
    xhr.wait().await?;

    println!("{} {}", xhr.status(), xhr.status_text());
    print!("{}", xhr.get_all_response_headers());
    println!();
    println!("{}", xhr.response_text());

    Ok(())
}
