use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::path::Path;
use tracing::{error, info};

use audit_ledger::audit::{AuditBundle, BundleReport};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("verify-bundle")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify an exported audit bundle without access to the ledger")
        .arg(
            Arg::new("bundle")
                .short('b')
                .long("bundle")
                .value_name("PATH")
                .help("Path to the exported bundle")
                .required(true),
        )
        .arg(
            Arg::new("merkle-root")
                .short('m')
                .long("merkle-root")
                .value_name("HASH")
                .help("Expected Merkle root, e.g. from an external anchor"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");
    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let bundle_path = matches
        .get_one::<String>("bundle")
        .ok_or_else(|| anyhow!("--bundle is required"))?;
    let expected_root = matches.get_one::<String>("merkle-root");

    if let Err(e) = verify_bundle_file(bundle_path, expected_root, verbose).await {
        error!("Bundle verification failed: {}", e);
        std::process::exit(1);
    }

    if !quiet {
        println!("✓ Audit bundle verification completed successfully");
    }

    Ok(())
}

async fn verify_bundle_file(path: &str, expected_root: Option<&String>, verbose: bool) -> Result<()> {
    info!("Verifying audit bundle: {}", path);

    if !Path::new(path).exists() {
        return Err(anyhow!("Bundle file not found: {}", path));
    }

    let bundle = AuditBundle::load(path).await?;
    if verbose {
        println!(
            "Loaded bundle for chain {} ({} entries, {} keys)",
            bundle.chain_id,
            bundle.entries.len(),
            bundle.public_keys.len()
        );
    }

    let report = bundle.verify().await?;
    if verbose {
        print_report(&bundle, &report);
    }

    if !report.digest_valid {
        return Err(anyhow!("Bundle digest mismatch; the file was modified after export"));
    }
    if !report.merkle_valid {
        return Err(anyhow!("Merkle root does not cover the bundled entries"));
    }
    if !report.chain.chain_valid {
        return Err(anyhow!("{}", report.chain.summary()));
    }

    if let Some(expected) = expected_root {
        let actual = bundle.merkle_root.as_deref().unwrap_or_default();
        if actual != expected.as_str() {
            return Err(anyhow!("Merkle root mismatch. Expected: {}, Got: {}", expected, actual));
        }
        if verbose {
            println!("✓ Merkle root matches expected value");
        }
    }

    Ok(())
}

fn print_report(bundle: &AuditBundle, report: &BundleReport) {
    let mark = |ok: bool| if ok { "✓" } else { "✗" };

    println!("{} Digest", mark(report.digest_valid));
    println!("{} Merkle root", mark(report.merkle_valid));
    println!("{} {}", mark(report.chain.chain_valid), report.chain.summary());
    for finding in &report.chain.findings {
        println!("    {:?}", finding);
    }

    if let (Some(first), Some(last)) = (bundle.entries.first(), bundle.entries.last()) {
        println!("\nBundle Summary:");
        println!("  Chain: {}", bundle.chain_id);
        println!("  Exported: {}", bundle.exported_at);
        println!("  First entry: {}", first.timestamp());
        println!("  Last entry: {}", last.timestamp());
        println!("  Head hash: {}", last.entry_hash());
        println!("  Merkle root: {}", bundle.merkle_root.as_deref().unwrap_or("-"));
    }
}
