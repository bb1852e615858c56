//! portal-presence: command-line front-end for realtime presence.
//!
//! Queries who is online on a topic, watches a topic for presence
//! changes, announces an identity, or joins a direct-message
//! conversation, all through one shared channel registry.

mod commands;
mod session;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use portal_common::PortalError;
use portal_config::PortalConfig;
use tracing_subscriber::EnvFilter;

use crate::session::Session;

#[derive(Parser)]
#[command(name = "portal-presence", about = "Realtime presence tools for the student portal")]
struct Args {
    /// Config file (defaults to the platform config directory).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the identities currently online on a topic.
    Online {
        /// Topic to query (defaults to the configured global topic).
        topic: Option<String>,

        /// Seconds to wait for a snapshot; 0 waits forever.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Report whenever anyone comes online or everyone leaves.
    Watch {
        /// Topic to watch (defaults to the configured global topic).
        topic: Option<String>,
    },

    /// Announce an identity until interrupted.
    Announce {
        identity: String,

        /// Topic to announce on (defaults to the configured global topic).
        #[arg(long)]
        topic: Option<String>,
    },

    /// Send and receive direct messages in one conversation.
    Converse {
        conversation_id: String,

        /// Identity messages are sent as.
        #[arg(long = "as")]
        sender: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<PortalConfig, PortalError> {
    let config = match path {
        Some(path) => {
            let config = portal_config::toml_loader::load_from_path(path)?;
            portal_config::validation::validate(&config)?;
            config
        }
        None => portal_config::load_config()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), PortalError> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let default_filter = format!(
        "portal_presence={level},portal_realtime={level}",
        level = config.logging.level.as_directive()
    );
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let session = Session::connect(&config)?;
    let global = config.presence.global_topic.clone();

    let result = match &args.command {
        Command::Online {
            topic,
            timeout_secs,
        } => {
            let topic = topic.as_deref().unwrap_or(&global);
            commands::online(&session, &config, topic, *timeout_secs).await
        }
        Command::Watch { topic } => {
            commands::watch(&session, topic.as_deref().unwrap_or(&global)).await
        }
        Command::Announce { identity, topic } => {
            commands::announce(&session, topic.as_deref().unwrap_or(&global), identity).await
        }
        Command::Converse {
            conversation_id,
            sender,
        } => commands::converse(&session, &config, conversation_id, sender).await,
    };

    session.shutdown().await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Command failed");
    }
    result
}
