//! funcsim - Local cloud-function invocation emulator
//!
//! Exercises handler libraries against the platform calling convention
//! without deploying: one-shot invocations from the command line, or an
//! HTTP front end that maps requests to invocations.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use funcsim_runtime::{execute, watch, ClientContext, EventSource, InvokeOptions, WatchOptions};

#[derive(Parser, Debug)]
#[command(name = "funcsim")]
#[command(about = "Local cloud-function invocation emulator", long_about = None)]
struct Args {
    /// Handler library to load
    #[arg(short = 'l', long, env = "FUNCSIM_LIBRARY")]
    library: PathBuf,

    /// Exported handler constructor name
    #[arg(short = 'e', long, default_value = "handler", env = "FUNCSIM_EXPORT")]
    export: String,

    /// Inline JSON event payload
    #[arg(long, conflicts_with = "event_file")]
    event: Option<String>,

    /// Read the JSON event payload from a file
    #[arg(long)]
    event_file: Option<PathBuf>,

    /// Invocation timeout in milliseconds
    #[arg(short = 't', long, default_value = "3000", env = "FUNCSIM_TIMEOUT_MS")]
    timeout: u64,

    /// Memory size hint in MiB
    #[arg(long, env = "FUNCSIM_MEMORY_MB")]
    memory: Option<u64>,

    /// Region staged into the environment
    #[arg(long, env = "FUNCSIM_REGION")]
    region: Option<String>,

    /// Credential profile name
    #[arg(long, env = "FUNCSIM_PROFILE")]
    profile: Option<String>,

    /// Additional credentials file consulted after the default locations
    #[arg(long, env = "FUNCSIM_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Custom environment entry, KEY=VALUE (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    environment: Vec<String>,

    /// Restore custom environment keys after the invocation
    #[arg(long)]
    destroy_env: bool,

    /// Client context JSON forwarded to the handler
    #[arg(long)]
    client_context: Option<String>,

    /// Conclude only after handler-spawned tasks drain
    #[arg(long)]
    wait_for_pending_tasks: bool,

    /// Start the HTTP front end on this port instead of invoking once
    #[arg(short = 'w', long, value_name = "PORT", env = "FUNCSIM_WATCH_PORT")]
    watch: Option<u16>,

    /// Host to bind in watch mode
    #[arg(long, default_value = "127.0.0.1", env = "FUNCSIM_HOST")]
    host: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "FUNCSIM_LOG_LEVEL")]
    log_level: String,
}

fn parse_environment(entries: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut environment = HashMap::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("Invalid environment entry '{}', expected KEY=VALUE", entry))?;
        environment.insert(key.to_string(), value.to_string());
    }
    Ok(environment)
}

fn resolve_event(args: &Args) -> anyhow::Result<Value> {
    if let Some(path) = &args.event_file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid JSON in event file {}", path.display()))
    } else if let Some(inline) = &args.event {
        serde_json::from_str(inline).context("Invalid JSON in --event")
    } else {
        Ok(Value::Null)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("funcsim={},tower_http=debug", args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let event = resolve_event(&args)?;
    let environment = parse_environment(&args.environment)?;

    let options = InvokeOptions {
        library: Some(args.library.clone()),
        export: args.export.clone(),
        event: EventSource::Value(event),
        timeout_ms: args.timeout,
        memory_mb: args.memory,
        region: args.region.clone(),
        environment,
        destroy_environment: args.destroy_env,
        client_context: args.client_context.clone().map(ClientContext::Raw),
        profile: args.profile.clone(),
        credentials_path: args.credentials.clone(),
        wait_for_pending_tasks: args.wait_for_pending_tasks,
        ..Default::default()
    };

    match args.watch {
        Some(port) => {
            info!(
                library = %args.library.display(),
                export = %args.export,
                port,
                "Starting funcsim in watch mode"
            );
            watch(WatchOptions {
                host: args.host.clone(),
                port,
                invoke: options,
            })
            .await?;
        }
        None => match execute(options).await {
            Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
