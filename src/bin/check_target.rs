//! Dry-run claim detection for one address.
//!
//! Fetches the address's recent activity, classifies it with the configured
//! fee programs and thresholds, and prints what would be alerted. Nothing is
//! written: no cursor commit, no delivery.
//!
//! Usage:
//!   cargo run --bin check_target -- <address>
//!   cargo run --bin check_target -- <address> --since 1700000000

use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;

use claimwatch::config::Config;
use claimwatch::cursor::Cursor;
use claimwatch::detect::{Classifier, Detector};
use claimwatch::ledger::SolanaRpc;
use claimwatch::notify::shorten;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(address) = args.first().filter(|a| !a.starts_with("--")) else {
        bail!("usage: check_target <address> [--since <unix-seconds>]");
    };
    let since = match args.iter().position(|a| a == "--since") {
        Some(i) => match args.get(i + 1).map(|s| s.parse::<i64>()) {
            Some(Ok(t)) => t,
            _ => bail!("--since needs a unix timestamp"),
        },
        None => 0,
    };

    let config = match Config::load(Path::new("claimwatch.toml")) {
        Ok(c) => c,
        Err(_) => Config::from_env(),
    };

    let ledger = SolanaRpc::new(&config.ledger.endpoint(), config.ledger.request_timeout())?;
    let detector = Detector::new(
        Arc::new(ledger),
        Classifier::new(&config.classify),
        config.ledger.activity_limit,
        0,
    );
    let cursor = Cursor {
        last_checked_at: since,
        ..Cursor::default()
    };

    println!("=== Claim check: {} ===", shorten(address));
    println!(
        "Fee programs: {}  |  Min credit: {} lamports  |  Window: {} entries",
        config.classify.fee_programs.join(", "),
        config.classify.min_balance_delta,
        config.ledger.activity_limit,
    );

    let detection = detector.detect(address, &cursor).await?;

    println!(
        "Fetched {} entries, {} details, {} ambiguous",
        detection.entries_fetched, detection.details_fetched, detection.ambiguous
    );
    if let Some(newest) = detection.newest_seen {
        println!("Watermark would advance to {}", format_time(newest));
    }

    if detection.claims.is_empty() {
        println!("No claims found.");
        return Ok(());
    }

    println!();
    println!("{:<26} {:>14} {:<22} {}", "TIME", "CREDIT (SOL)", "TOKEN", "SIGNATURE");
    for claim in &detection.claims {
        println!(
            "{:<26} {:>14.4} {:<22} {}",
            format_time(claim.occurred_at),
            claim.evidence.credited_lamports as f64 / 1e9,
            claim.display.token.as_deref().map(shorten).unwrap_or_else(|| "-".to_string()),
            claim.claim_id,
        );
    }
    println!("\n{} claim(s)", detection.claims.len());
    Ok(())
}

fn format_time(unix: i64) -> String {
    match Utc.timestamp_opt(unix, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => unix.to_string(),
    }
}
