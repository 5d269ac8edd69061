// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! wsrm store inspection CLI
//!
//! # Usage
//!
//! ```bash
//! # Endpoints and row counts
//! wsrm-store --db wsrm.db endpoints
//! wsrm-store --db wsrm.db stats
//!
//! # Sequences of one endpoint, as JSON
//! wsrm-store --db wsrm.db --json sequences client
//!
//! # Messages kept for redelivery on the server side
//! wsrm-store --db wsrm.db messages <sequence-id> --inbound
//!
//! # Drop everything an endpoint left behind
//! wsrm-store --db wsrm.db purge client --confirm
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use wsrm::{DestinationSequenceRecord, Identifier, SourceSequenceRecord};
use wsrm_persistence::SqliteStore;

#[derive(Parser, Debug)]
#[command(name = "wsrm-store")]
#[command(about = "Inspect and maintain a wsrm SQLite store", long_about = None)]
struct Args {
    /// Database path (SQLite file)
    #[arg(short, long, default_value = "wsrm.db")]
    db: String,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List endpoints with stored sequences
    Endpoints,
    /// List the sequences of an endpoint (all endpoints if omitted)
    Sequences {
        /// Endpoint name
        endpoint: Option<String>,
    },
    /// List the stored messages of a sequence
    Messages {
        /// Sequence identifier
        sequence: String,
        /// Show inbound (undelivered) instead of outbound (unacknowledged) copies
        #[arg(long)]
        inbound: bool,
    },
    /// Show row counts
    Stats,
    /// Delete the sequences and messages of one endpoint
    Purge {
        /// Endpoint name
        endpoint: String,
        /// Confirm deletion
        #[arg(long)]
        confirm: bool,
    },
    /// Delete everything
    Clear {
        /// Confirm deletion
        #[arg(long)]
        confirm: bool,
    },
}

#[derive(Serialize)]
struct SequenceListing {
    source: Vec<SourceSequenceRecord>,
    destination: Vec<DestinationSequenceRecord>,
}

#[derive(Serialize)]
struct MessageListing {
    message_number: u64,
    created_ms: u64,
    to: Option<String>,
    content_type: Option<String>,
    size: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let store = SqliteStore::new(&args.db)?;
    tracing::info!("opened store {}", args.db);

    handle_command(args.command.unwrap_or(Commands::Stats), &store, args.json)
}

fn handle_command(cmd: Commands, store: &SqliteStore, json: bool) -> Result<()> {
    match cmd {
        Commands::Endpoints => {
            let endpoints = store.endpoints()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&endpoints)?);
            } else {
                println!("Stored endpoints:");
                for name in &endpoints {
                    println!("  {}", name);
                }
            }
        }
        Commands::Sequences { endpoint } => {
            let listing = SequenceListing {
                source: store.source_sequences(endpoint.as_deref())?,
                destination: store.destination_sequences(endpoint.as_deref())?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
                return Ok(());
            }
            println!("Source sequences:");
            for s in &listing.source {
                println!(
                    "  {} [{}] current={} last={} queued={}",
                    s.identifier,
                    s.endpoint,
                    s.current_message_number,
                    s.last_message,
                    store.message_count(&s.identifier, true)?
                );
            }
            println!("Destination sequences:");
            for d in &listing.destination {
                println!(
                    "  {} [{}] acked={:?} last={} terminated={} undelivered={}",
                    d.identifier,
                    d.endpoint,
                    d.acknowledged.to_pairs(),
                    d.last_message_number,
                    d.terminated,
                    store.message_count(&d.identifier, false)?
                );
            }
        }
        Commands::Messages { sequence, inbound } => {
            let id = Identifier::new(sequence);
            let messages: Vec<MessageListing> = store
                .messages(&id, !inbound)?
                .into_iter()
                .map(|m| MessageListing {
                    message_number: m.message_number,
                    created_ms: m.created_ms,
                    to: m.to,
                    content_type: m.content_type,
                    size: m.content.len(),
                })
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
            } else {
                println!("{} message(s) stored for {}:", messages.len(), id);
                for m in &messages {
                    println!(
                        "  #{} created={} to={} size={} bytes",
                        m.message_number,
                        m.created_ms,
                        m.to.as_deref().unwrap_or("-"),
                        m.size
                    );
                }
            }
        }
        Commands::Stats => {
            let stats = store.stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Source sequences:      {}", stats.source_sequences);
                println!("Destination sequences: {}", stats.destination_sequences);
                println!("Outbound messages:     {}", stats.outbound_messages);
                println!("Inbound messages:      {}", stats.inbound_messages);
            }
        }
        Commands::Purge { endpoint, confirm } => {
            if confirm {
                let removed = store.purge_endpoint(&endpoint)?;
                println!("Removed {} sequence(s) of '{}'.", removed, endpoint);
            } else {
                println!("Use --confirm to actually delete '{}'.", endpoint);
            }
        }
        Commands::Clear { confirm } => {
            if confirm {
                store.clear()?;
                println!("Store cleared.");
            } else {
                println!("Use --confirm to actually delete everything.");
            }
        }
    }

    Ok(())
}
