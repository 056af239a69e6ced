// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

/// `porter gateway` subcommands.
#[derive(Subcommand, Debug)]
pub enum GatewayCommands {
    /// Start the gateway in the foreground.
    ///
    /// Binds the control plane per `config.json`, mints the control-plane
    /// secret on first run (printed once), and serves until Ctrl+C or a
    /// `gateway stop` from an operator.
    Start,

    /// Ask a running gateway to shut down gracefully.
    Stop,

    /// Stop the running gateway (if any), then start in the foreground.
    Restart,

    /// Print a running gateway's status (connections, sessions, uptime).
    Status,

    /// Rotate the control-plane secret.
    ///
    /// The new secret is printed once; the previous one stops working
    /// the moment the rotation lands on disk.
    RegenerateToken,
}

/// `porter pairing` subcommands (scope: pairing).
#[derive(Subcommand, Debug)]
pub enum PairingCommands {
    /// List pending pairing requests.
    List {
        /// Restrict to one channel.
        #[arg(long)]
        channel: Option<String>,
    },
    /// Approve a pending sender (promotes it to the channel allowlist).
    Approve { channel: String, sender: String },
    /// Deny a pending sender.
    Deny { channel: String, sender: String },
}

/// `porter approvals` subcommands (scope: approvals).
#[derive(Subcommand, Debug)]
pub enum ApprovalCommands {
    /// List pending exec approvals.
    List,
    /// Resolve a pending approval.
    Resolve {
        approval_id: String,
        /// allow-once | allow-and-add | deny
        #[arg(value_parser = ["allow-once", "allow-and-add", "deny"])]
        decision: String,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = "porter",
    about = "Multi-channel AI-agent gateway",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// State directory (default: ~/.config/porter)
    #[arg(long, global = true, env = "PORTER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Control-plane URL for client commands
    #[arg(long, global = true, env = "PORTER_URL")]
    pub url: Option<String>,

    /// Control-plane secret, presented as `auth.token` in the handshake
    #[arg(long, global = true, env = "PORTER_TOKEN")]
    pub token: Option<String>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Gateway lifecycle: start, stop, status, token rotation.
    Gateway {
        #[command(subcommand)]
        command: GatewayCommands,
    },

    /// First-contact pairing for gated channels.
    Pairing {
        #[command(subcommand)]
        command: PairingCommands,
    },

    /// Exec approvals posted by agent turns.
    Approvals {
        #[command(subcommand)]
        command: ApprovalCommands,
    },

    /// Print a dashboard URL carrying a fresh control-plane secret.
    ///
    /// Rotates the secret: the raw value is never stored, so a URL can
    /// only be minted alongside a rotation.
    Dashboard,

    /// Print the effective configuration and exit.
    ShowConfig,

    /// Generate shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "porter", &mut std::io::stdout());
}
