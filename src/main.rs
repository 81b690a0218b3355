//! Audit Ledger CLI
//!
//! Append to, inspect and verify the tamper-evident audit chain.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_ledger::audit::{EntryDraft, Ledger, SignedEntry};
use audit_ledger::context::LedgerContext;
use audit_ledger::LedgerConfig;

#[derive(Parser)]
#[command(name = "audit-ledger")]
#[command(about = "Tamper-evident audit ledger")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record an audit event
    Append {
        /// Event kind (data_access, data_transfer, consent_validation, ...)
        #[arg(short = 'k', long)]
        event_kind: String,

        #[arg(short, long)]
        actor: String,

        #[arg(short, long)]
        resource: String,

        #[arg(long)]
        action: String,

        #[arg(short, long)]
        jurisdiction: String,

        /// success, failure or violation
        #[arg(short, long)]
        outcome: String,

        /// Additional metadata (key=value pairs; values are parsed as JSON when possible)
        #[arg(short, long)]
        metadata: Vec<String>,
    },

    /// Verify the stored chain
    Verify {
        /// Only verify the most recent N entries
        #[arg(short, long)]
        limit: Option<usize>,

        /// Partition to verify
        #[arg(short, long)]
        jurisdiction: Option<String>,
    },

    /// Show the most recent entries
    Tail {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        /// Only entries at or before this RFC3339 timestamp
        #[arg(long)]
        before: Option<DateTime<Utc>>,

        #[arg(short, long)]
        jurisdiction: Option<String>,
    },

    /// Export a self-verifying bundle
    Export {
        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(short, long)]
        jurisdiction: Option<String>,
    },

    /// Rotate the signing key and record the rotation
    RotateKey {
        #[arg(short, long)]
        actor: String,
    },

    /// Check whether an entry is replicated to every required region
    Replication {
        entry_hash: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = LedgerConfig::load(cli.config.as_deref())?;
    info!(chain_id = %config.chain_id, "configuration loaded");

    let context = LedgerContext::from_config(config).await?;

    match cli.command {
        Commands::Append {
            event_kind,
            actor,
            resource,
            action,
            jurisdiction,
            outcome,
            metadata,
        } => {
            let draft = EntryDraft {
                event_kind,
                actor,
                resource,
                action,
                jurisdiction,
                outcome,
                metadata: parse_metadata(metadata)?,
            };
            let entry = context.append(draft).await?;

            println!("Entry committed:");
            println!("  Hash: {}", entry.entry_hash());
            println!("  Previous: {}", entry.previous_hash());
            println!("  Timestamp: {}", entry.timestamp());
            println!("  Key version: {}", entry.signature().key_version);
        }

        Commands::Verify { limit, jurisdiction } => {
            let ledger = select(&context, jurisdiction.as_deref())?;
            let report = ledger.verify_stored(limit).await?;

            println!("{}", report.summary());
            for finding in &report.findings {
                println!("  {}", serde_json::to_string(finding)?);
            }
            if !report.chain_valid {
                error!(chain_id = %ledger.chain_id(), "audit chain verification failed");
                std::process::exit(1);
            }
        }

        Commands::Tail {
            limit,
            before,
            jurisdiction,
        } => {
            let ledger = select(&context, jurisdiction.as_deref())?;
            let entries = ledger.read_range(limit, before).await?;
            print_entries(&entries);
        }

        Commands::Export {
            output,
            limit,
            jurisdiction,
        } => {
            let ledger = select(&context, jurisdiction.as_deref())?;
            let bundle = ledger.export_bundle(limit).await?;
            bundle.save(&output).await?;

            println!("Bundle written to {}", output.display());
            println!("  Entries: {}", bundle.entries.len());
            println!("  Merkle root: {}", bundle.merkle_root.as_deref().unwrap_or("-"));
            println!("  Digest: {}", bundle.digest);
        }

        Commands::RotateKey { actor } => {
            let (version, entries) = context.rotate_key(&actor).await?;
            println!("Signing key rotated to {}", version);
            for entry in &entries {
                println!("  Rotation entry: {}", entry.entry_hash());
            }
        }

        Commands::Replication { entry_hash } => {
            let verifier = context
                .replication
                .as_ref()
                .ok_or_else(|| anyhow!("replication is not enabled"))?;
            let record = verifier.check_consistency(&entry_hash).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}

fn select<'a>(context: &'a LedgerContext, jurisdiction: Option<&str>) -> Result<&'a Ledger> {
    context
        .ledger_for(jurisdiction)
        .ok_or_else(|| anyhow!("no chain configured for jurisdiction {:?}", jurisdiction))
}

fn parse_metadata(metadata: Vec<String>) -> Result<std::collections::BTreeMap<String, Value>> {
    let mut map = std::collections::BTreeMap::new();

    for item in metadata {
        let (key, raw) = item
            .split_once('=')
            .with_context(|| format!("Invalid metadata format: {}", item))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }

    Ok(map)
}

/// First 16 characters; stored rows may hold shorter, tampered hashes
fn short_hash(hash: &str) -> &str {
    hash.char_indices().nth(16).map_or(hash, |(end, _)| &hash[..end])
}

fn print_entries(entries: &[SignedEntry]) {
    if entries.is_empty() {
        println!("No entries found");
        return;
    }

    println!(
        "{:<32} {:<18} {:<16} {:<10} {:<10} {:<16}",
        "Timestamp", "Kind", "Actor", "Outcome", "Region", "Hash"
    );
    println!("{}", "-".repeat(106));
    for entry in entries {
        let fields = entry.entry();
        println!(
            "{:<32} {:<18} {:<16} {:<10} {:<10} {:<16}",
            entry.timestamp().to_rfc3339(),
            fields.event_kind().as_str(),
            fields.actor(),
            fields.outcome().as_str(),
            fields.jurisdiction(),
            short_hash(entry.entry_hash())
        );
    }
}
