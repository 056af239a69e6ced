// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! `porter` — multi-channel AI-agent gateway.
//!
//! Exit codes: `0` ok, `2` invalid configuration (fail-closed, nothing
//! was bound), `3` authentication failure, `1` anything else.

mod cli;
mod client;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tracing::error;
use tracing_subscriber::EnvFilter;

use cli::{ApprovalCommands, Cli, Commands, GatewayCommands, PairingCommands};
use client::{AuthFailed, ControlClient};
use porter_config::{ConfigError, StateDir};
use porter_gateway::{secret, BootError, Gateway};
use porter_proto::Scope;

const EXIT_CONFIG: u8 = 2;
const EXIT_AUTH: u8 = 3;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.downcast_ref::<AuthFailed>().is_some() {
                error!("{e}");
                ExitCode::from(EXIT_AUTH)
            } else if e.downcast_ref::<BootError>().is_some()
                || e.downcast_ref::<ConfigError>().is_some()
            {
                error!("{e}");
                ExitCode::from(EXIT_CONFIG)
            } else {
                error!("{e:#}");
                ExitCode::FAILURE
            }
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn state_dir(cli: &Cli) -> StateDir {
    cli.state_dir
        .as_ref()
        .map(StateDir::new)
        .unwrap_or_else(StateDir::default_root)
}

/// Control-plane URL for client commands: explicit flag, else derived
/// from the configured bind address.
fn control_url(cli: &Cli, state: &StateDir) -> anyhow::Result<String> {
    if let Some(url) = &cli.url {
        return Ok(url.clone());
    }
    let config = porter_config::load(state)?;
    let bind = config.gateway.bind.replace("0.0.0.0", "127.0.0.1");
    Ok(format!("ws://{bind}/ws"))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = state_dir(&cli);

    match &cli.command {
        Commands::Gateway { command } => match command {
            GatewayCommands::Start => start_gateway(&state).await,
            GatewayCommands::Stop => {
                let url = control_url(&cli, &state)?;
                let mut client =
                    ControlClient::connect(&url, cli.token.as_deref(), vec![Scope::Admin]).await?;
                client.call("gateway.stop", json!({})).await?;
                println!("gateway stopping");
                Ok(())
            }
            GatewayCommands::Restart => {
                let url = control_url(&cli, &state)?;
                match ControlClient::connect(&url, cli.token.as_deref(), vec![Scope::Admin]).await {
                    Ok(mut client) => {
                        let _ = client.call("gateway.stop", json!({})).await;
                        // Give the old listener a moment to release the port.
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    }
                    Err(_) => println!("no running gateway found, starting fresh"),
                }
                start_gateway(&state).await
            }
            GatewayCommands::Status => {
                let url = control_url(&cli, &state)?;
                let mut client =
                    ControlClient::connect(&url, cli.token.as_deref(), vec![Scope::Read]).await?;
                let status = client.call("gateway.status", json!({})).await?;
                println!("{}", serde_json::to_string_pretty(&status)?);
                Ok(())
            }
            GatewayCommands::RegenerateToken => {
                let (issued, _) = secret::rotate(&state.secret_file())?;
                println!("Control-plane secret rotated; the previous one just stopped working.");
                println!("New secret (printed only this once):");
                println!("  {}", issued.expose());
                Ok(())
            }
        },

        Commands::Pairing { command } => {
            let url = control_url(&cli, &state)?;
            let mut client =
                ControlClient::connect(&url, cli.token.as_deref(), vec![Scope::Read, Scope::Pairing])
                    .await?;
            match command {
                PairingCommands::List { channel } => {
                    let result = client
                        .call("pairing.list", json!({"channel": channel}))
                        .await?;
                    print_pairing_list(&result);
                }
                PairingCommands::Approve { channel, sender } => {
                    client
                        .call(
                            "pairing.approve",
                            json!({"channel": channel, "sender": sender}),
                        )
                        .await?;
                    println!("✓ {sender} approved on {channel}");
                }
                PairingCommands::Deny { channel, sender } => {
                    client
                        .call(
                            "pairing.deny",
                            json!({"channel": channel, "sender": sender}),
                        )
                        .await?;
                    println!("✓ {sender} denied on {channel}");
                }
            }
            Ok(())
        }

        Commands::Approvals { command } => {
            let url = control_url(&cli, &state)?;
            let mut client = ControlClient::connect(
                &url,
                cli.token.as_deref(),
                vec![Scope::Read, Scope::Approvals],
            )
            .await?;
            match command {
                ApprovalCommands::List => {
                    let result = client.call("approval.list", json!({})).await?;
                    print_approval_list(&result);
                }
                ApprovalCommands::Resolve {
                    approval_id,
                    decision,
                } => {
                    client
                        .call(
                            "approval.resolve",
                            json!({"approvalId": approval_id, "decision": decision}),
                        )
                        .await?;
                    println!("✓ {approval_id}: {decision}");
                }
            }
            Ok(())
        }

        Commands::Dashboard => {
            let config = porter_config::load(&state)?;
            let (issued, _) = secret::rotate(&state.secret_file())?;
            let bind = config.gateway.bind.replace("0.0.0.0", "127.0.0.1");
            println!("Dashboard URL (secret rotated — the previous one is now invalid):");
            println!("  http://{bind}/?token={}", issued.expose());
            Ok(())
        }

        Commands::ShowConfig => {
            let config = porter_config::load(&state)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }

        Commands::Completions { shell } => {
            cli::print_completions(*shell);
            Ok(())
        }
    }
}

async fn start_gateway(state: &StateDir) -> anyhow::Result<()> {
    let config = porter_config::load(state)?;
    let provider: Arc<dyn porter_model::ModelProvider> = Arc::new(porter_model::MockProvider);
    let gateway = Gateway::build(state.clone(), config, provider)?;
    gateway.run().await
}

fn print_pairing_list(result: &serde_json::Value) {
    let entries = result["entries"].as_array().cloned().unwrap_or_default();
    if entries.is_empty() {
        println!("no pending pairing requests");
        return;
    }
    println!("{:<12} {:<24} {:<10} created", "CHANNEL", "SENDER", "CODE");
    for e in entries {
        println!(
            "{:<12} {:<24} {:<10} {}",
            e["channel"].as_str().unwrap_or("-"),
            e["sender"].as_str().unwrap_or("-"),
            e["code"].as_str().unwrap_or("-"),
            e["createdAtMs"]
        );
    }
}

fn print_approval_list(result: &serde_json::Value) {
    let entries = result["entries"].as_array().cloned().unwrap_or_default();
    if entries.is_empty() {
        println!("no pending approvals");
        return;
    }
    println!("{:<38} {:<12} {:<28} session", "APPROVAL", "HOST", "COMMAND");
    for e in entries {
        println!(
            "{:<38} {:<12} {:<28} {}",
            e["approvalId"].as_str().unwrap_or("-"),
            e["host"].as_str().unwrap_or("-"),
            e["command"].as_str().unwrap_or("-"),
            e["sessionKey"].as_str().unwrap_or("-"),
        );
    }
}
