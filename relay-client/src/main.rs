use std::process::ExitCode;

use clap::{Parser, Subcommand};
use relay_client::{
    CallResponse, ClientConfig, MutateOutcome, PendingWrite, RelayClient, RelayError,
    RemoteCallRequest, TagMap,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "Query processes and cached snapshots")]
struct Cli {
    /// Attempts per remote primitive (overrides RELAY_RETRY_ATTEMPTS).
    #[arg(long, global = true)]
    retries: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate a read-only action against a process.
    Query {
        process_id: String,
        action: String,
        /// Extra tag, `Name=Value`. Repeatable.
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
        #[arg(long)]
        data: Option<String>,
        /// Read identity (defaults to RELAY_OWNER).
        #[arg(long)]
        owner: Option<String>,
    },
    /// Retrieve the result of a previously submitted message.
    Result {
        process_id: String,
        message_id: String,
    },
    /// Read a cached snapshot.
    Cache { path: String },
}

/// What a successful subcommand prints.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Output {
    Response(CallResponse),
    Outcome(MutateOutcome),
    Snapshot(serde_json::Value),
}

fn parse_tag(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected Name=Value, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env()?;
    let retries = cli.retries.unwrap_or(config.retry_attempts);
    let client = RelayClient::over_http(config)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; cancelling");
            on_signal.cancel();
        }
    });

    let outcome = run(&client, cli.command, retries, &cancel).await;
    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            tracing::error!(code = err.code(), error = %err, "relay call failed");
            println!("{}", serde_json::to_string_pretty(&err.to_json())?);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(
    client: &RelayClient,
    command: Command,
    retries: u32,
    cancel: &CancellationToken,
) -> Result<Output, RelayError> {
    match command {
        Command::Query {
            process_id,
            action,
            tags,
            data,
            owner,
        } => {
            let mut request = RemoteCallRequest::new(process_id)
                .action(action)
                .tags(tags.into_iter().collect::<TagMap>())
                .retries(retries)
                .cancel_on(cancel.clone());
            if let Some(data) = data {
                request = request.data(data);
            }
            if let Some(owner) = owner {
                request = request.owner(owner);
            }
            Ok(Output::Response(client.query(request).await?))
        }
        Command::Result {
            process_id,
            message_id,
        } => {
            let pending = PendingWrite {
                message_id,
                process_id,
                submitted_at: chrono::Utc::now(),
            };
            Ok(Output::Outcome(client.reconcile(&pending, retries, cancel).await?))
        }
        Command::Cache { path } => Ok(Output::Snapshot(client.read_cache(&path, cancel).await?)),
    }
}
