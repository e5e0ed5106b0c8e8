// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use awcp_error::AwcpErrorDto;
use awcp_protocol::AwcpMessage;
use clap::{Parser, Subcommand};
use futures::StreamExt as _;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "awcp", version, about = "AWCP daemon client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of the daemon's HTTP listener.
    #[arg(long, global = true, default_value = "http://127.0.0.1:7420")]
    daemon_url: String,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Summary status of the daemon (active delegations, uptime).
    Status,

    /// Current result view for a delegation.
    Result {
        /// Delegation id.
        id: Uuid,
    },

    /// Stream a delegation's task events until it reaches a terminal state.
    Watch {
        /// Delegation id.
        id: Uuid,
    },

    /// Cancel a delegation. Idempotent.
    Cancel {
        /// Delegation id.
        id: Uuid,
    },

    /// Deliver a raw protocol message (an INVITE, typically) from a JSON
    /// file, printing whatever synchronous reply the daemon returns.
    Send {
        /// Path to a JSON-encoded `AwcpMessage`.
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("awcp=debug")
    } else {
        EnvFilter::new("awcp=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let client = reqwest::Client::new();
    let result = match cli.command {
        Commands::Status => cmd_status(&client, &cli.daemon_url).await,
        Commands::Result { id } => cmd_result(&client, &cli.daemon_url, id).await,
        Commands::Watch { id } => cmd_watch(&client, &cli.daemon_url, id).await,
        Commands::Cancel { id } => cmd_cancel(&client, &cli.daemon_url, id).await,
        Commands::Send { file } => cmd_send(&client, &cli.daemon_url, &file).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

async fn cmd_status(client: &reqwest::Client, base: &str) -> Result<()> {
    let resp = client
        .get(format!("{base}/status"))
        .send()
        .await
        .context("request daemon status")?;
    print_response(resp).await
}

async fn cmd_result(client: &reqwest::Client, base: &str, id: Uuid) -> Result<()> {
    let resp = client
        .get(format!("{base}/tasks/{id}/result"))
        .send()
        .await
        .context("request task result")?;
    print_response(resp).await
}

async fn cmd_cancel(client: &reqwest::Client, base: &str, id: Uuid) -> Result<()> {
    let resp = client
        .post(format!("{base}/cancel/{id}"))
        .send()
        .await
        .context("request cancellation")?;
    print_response(resp).await
}

async fn cmd_send(client: &reqwest::Client, base: &str, file: &PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let msg: AwcpMessage = serde_json::from_str(&raw).context("parse message JSON")?;
    let resp = client
        .post(base)
        .json(&msg)
        .send()
        .await
        .context("deliver message to daemon")?;
    print_response(resp).await
}

async fn cmd_watch(client: &reqwest::Client, base: &str, id: Uuid) -> Result<()> {
    let resp = client
        .get(format!("{base}/tasks/{id}/events"))
        .timeout(Duration::from_secs(3600))
        .send()
        .await
        .context("open task-event stream")?;
    if !resp.status().is_success() {
        return print_response(resp).await;
    }

    let mut stream = resp.bytes_stream();
    let mut buf = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("read task-event chunk")?;
        buf.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = buf.find("\n\n") {
            let event = buf[..pos].to_string();
            buf.drain(..pos + 2);
            for line in event.lines() {
                if let Some(data) = line.strip_prefix("data:") {
                    println!("{}", data.trim());
                }
            }
        }
    }
    Ok(())
}

async fn print_response(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("parse daemon response")?;
    if status.is_success() {
        println!("{}", serde_json::to_string_pretty(&body)?);
        Ok(())
    } else {
        let dto: Option<AwcpErrorDto> = body.get("error").and_then(|v| serde_json::from_value(v.clone()).ok());
        match dto {
            Some(dto) => anyhow::bail!("daemon returned {status}: {} ({:?})", dto.message, dto.code),
            None => anyhow::bail!("daemon returned {status}: {body}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_status_with_custom_daemon_url() {
        let cli = Cli::try_parse_from(["awcp", "--daemon-url", "http://example.invalid:9000", "status"]).unwrap();
        assert_eq!(cli.daemon_url, "http://example.invalid:9000");
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn cli_parses_result_with_an_id() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from(["awcp", "result", &id.to_string()]).unwrap();
        match cli.command {
            Commands::Result { id: parsed } => assert_eq!(parsed, id),
            _ => panic!("expected Result command"),
        }
    }

    #[test]
    fn cli_rejects_a_malformed_uuid() {
        assert!(Cli::try_parse_from(["awcp", "cancel", "not-a-uuid"]).is_err());
    }
}
