// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relaypool echo worker
//!
//! A minimal worker used for demos and the integration tests. It connects to
//! the pool through `RELAYPOOL_RELAY` and answers every request according to
//! its mode. Logs go to stderr, filtered by `RELAYPOOL_WORKER_LOG`: in
//! pipes mode stdout carries the relay.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use relaypool_protocol::{Payload, RelayAddr, WorkerEndpoint};
use tracing::{debug, info};

/// Worker answering relaypool requests.
#[derive(Parser, Debug)]
#[command(name = "relaypool-echo-worker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// How to answer requests.
    #[arg(value_enum, default_value_t = Mode::Echo)]
    mode: Mode,

    /// Delay before answering in `sleep` mode.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// File recording that `stop-once` already refused a request.
    #[arg(long)]
    marker: Option<PathBuf>,

    /// Relay address of the pool.
    #[arg(long, env = "RELAYPOOL_RELAY", default_value = "pipes")]
    relay: RelayAddr,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Return the request unchanged.
    Echo,
    /// Return the worker pid as the body.
    Pid,
    /// Wait `--delay-ms`, then return the body with the pid in the context.
    Sleep,
    /// Report a job error for every request.
    Error,
    /// Print to stderr and exit with code 3 on the first request.
    Crash,
    /// Ask to be replaced once per `--marker` file, echo afterwards.
    StopOnce,
    /// Write the body to stderr, then echo.
    Noisy,
    /// Report a wrong pid during the handshake.
    WrongPid,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RELAYPOOL_WORKER_LOG")
                .unwrap_or_else(|_| "relaypool_echo_worker=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let pid = std::process::id();

    let mut endpoint = WorkerEndpoint::connect(&args.relay).await?;
    if args.mode == Mode::WrongPid {
        endpoint = endpoint.with_pid(pid.wrapping_add(1));
    }
    info!(pid = pid, mode = ?args.mode, relay = %args.relay, "Echo worker started");

    while let Some(request) = endpoint.next_request().await? {
        debug!(pid = pid, len = request.body.len(), "Request received");

        match args.mode {
            Mode::Echo | Mode::WrongPid => endpoint.respond(&request).await?,
            Mode::Pid => {
                let reply = Payload::new(request.context.clone(), pid.to_string());
                endpoint.respond(&reply).await?;
            }
            Mode::Sleep => {
                tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
                let context = serde_json::json!({ "pid": pid }).to_string();
                endpoint
                    .respond(&Payload::new(context, request.body.clone()))
                    .await?;
            }
            Mode::Error => {
                let message = format!("job failed: {}", request.body_str().unwrap_or_default());
                endpoint.respond_error(&message).await?;
            }
            Mode::Crash => {
                eprintln!("boom");
                std::process::exit(3);
            }
            Mode::StopOnce => match &args.marker {
                Some(marker) if !marker.exists() => {
                    std::fs::write(marker, pid.to_string())?;
                    endpoint.request_stop().await?;
                }
                _ => endpoint.respond(&request).await?,
            },
            Mode::Noisy => {
                eprintln!("{}", request.body_str().unwrap_or_default());
                endpoint.respond(&request).await?;
            }
        }
    }

    info!(pid = pid, "Echo worker stopping");
    Ok(())
}
