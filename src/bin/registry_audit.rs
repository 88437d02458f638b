//! Registry consistency check.
//!
//! Replays journal entries left behind by interrupted subscribe/unsubscribe
//! calls, then compares the forward (subscriber) and reverse (target)
//! indices key by key and reports every pair they disagree on.
//!
//! Usage:
//!   cargo run --bin registry_audit                      # report only
//!   cargo run --bin registry_audit -- --repair          # also fix drift
//!   cargo run --bin registry_audit -- --stale-secs 60   # journal age threshold
//!   cargo run --bin registry_audit -- --verify @handle  # re-resolve a memoized handle

use anyhow::{bail, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use claimwatch::config::Config;
use claimwatch::cursor::CursorStore;
use claimwatch::kv;
use claimwatch::registry::Registry;
use claimwatch::resolver::HttpResolver;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let repair = args.iter().any(|a| a == "--repair");
    let stale_secs = match args.iter().position(|a| a == "--stale-secs") {
        Some(i) => match args.get(i + 1).map(|s| s.parse::<u64>()) {
            Some(Ok(n)) => n,
            _ => bail!("--stale-secs needs a number of seconds"),
        },
        None => 300,
    };
    let verify: Vec<&String> = args
        .iter()
        .enumerate()
        .filter(|(i, _)| *i > 0 && args[i - 1] == "--verify")
        .map(|(_, a)| a)
        .collect();

    let config = match Config::load(Path::new("claimwatch.toml")) {
        Ok(c) => c,
        Err(_) => Config::from_env(),
    };
    if config.kv.url.is_empty() {
        bail!("kv.url is empty: nothing persistent to audit");
    }

    let store = kv::connect(&config.kv).await?;
    let cursors = CursorStore::new(
        store.clone(),
        config.monitor.min_interval(),
        config.monitor.rescan_overlap_secs,
    );
    let resolver = HttpResolver::new(
        &config.resolver.base_url,
        Duration::from_secs(config.resolver.request_timeout_secs),
    )?;
    let registry = Registry::new(store, Arc::new(resolver), cursors);

    println!("=== Registry audit ({}) ===", config.kv.prefix);

    let reconciled = registry
        .reconcile(Duration::from_secs(stale_secs), chrono::Utc::now().timestamp())
        .await?;
    println!(
        "Journal: {} pending, {} replayed, {} in flight, {} unreadable",
        reconciled.pending, reconciled.replayed, reconciled.in_flight, reconciled.unreadable
    );

    let report = registry.audit().await?;
    println!(
        "Indices: {} subscribers, {} targets, {} pending intents",
        report.subscribers, report.targets, report.pending_intents
    );
    for (sid, target) in &report.forward_only {
        println!("  forward only: {} -> {}", sid, target);
    }
    for (sid, target) in &report.reverse_only {
        println!("  reverse only: {} <- {}", sid, target);
    }
    for target in &report.unwatched {
        println!("  not in watch set: {}", target);
    }

    if report.is_clean() {
        println!("Clean.");
    } else if repair {
        let fixed = registry.repair(&report).await?;
        info!(fixed, "repair applied");
        let after = registry.audit().await?;
        println!(
            "Repaired {} entries, registry is {}",
            fixed,
            if after.is_clean() { "clean" } else { "still drifting" }
        );
    } else {
        println!("Drift found. Re-run with --repair to fix.");
    }

    for handle in verify {
        match registry.verify_handle(handle).await {
            Ok(Some(address)) => println!("{} -> {} (unchanged)", handle, address),
            Ok(None) => println!("{} is not memoized", handle),
            Err(e) => println!("{}: {}", handle, e),
        }
    }

    Ok(())
}
