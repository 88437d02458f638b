use claimwatch::config::Config;
use claimwatch::cursor::CursorStore;
use claimwatch::detect::{Classifier, Detector};
use claimwatch::kv;
use claimwatch::ledger::SolanaRpc;
use claimwatch::monitor::{self, Monitor};
use claimwatch::notify::{Dispatcher, TelegramChannel};
use claimwatch::registry::Registry;
use claimwatch::resolver::{CachedResolver, HttpResolver};
use claimwatch::server::{self, ServerState};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const CONFIG_PATH: &str = "claimwatch.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = if Path::new(CONFIG_PATH).exists() {
        Config::load(Path::new(CONFIG_PATH))?
    } else {
        Config::from_env()
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("claimwatch v{} starting", env!("CARGO_PKG_VERSION"));

    let auth_token = config.require_auth_token()?.to_string();

    // --- Storage ---
    let store = kv::connect(&config.kv).await?;
    let cursors = CursorStore::new(
        store.clone(),
        config.monitor.min_interval(),
        config.monitor.rescan_overlap_secs,
    );

    // --- Registry ---
    let resolver = HttpResolver::new(
        &config.resolver.base_url,
        Duration::from_secs(config.resolver.request_timeout_secs),
    )?;
    let resolver = CachedResolver::new(Arc::new(resolver));
    let registry = Registry::new(store.clone(), Arc::new(resolver), cursors.clone());

    // --- Detection ---
    let ledger = SolanaRpc::new(&config.ledger.endpoint(), config.ledger.request_timeout())?;
    let detector = Detector::new(
        Arc::new(ledger),
        Classifier::new(&config.classify),
        config.ledger.activity_limit,
        config.monitor.rescan_overlap_secs,
    );
    info!(
        fee_programs = ?config.classify.fee_programs,
        min_balance_delta = config.classify.min_balance_delta,
        activity_limit = config.ledger.activity_limit,
        "claim detection configured"
    );

    // --- Delivery ---
    let dispatcher = if config.has_delivery_credentials() {
        let channel = TelegramChannel::new(
            &config.telegram.api_url,
            &config.telegram.bot_token,
            &config.telegram.parse_mode,
            config.monitor.delivery_timeout(),
        )?;
        Some(Dispatcher::new(
            registry.clone(),
            Arc::new(channel),
            config.monitor.delivery_timeout(),
            config.monitor.max_concurrency,
        ))
    } else {
        warn!("no delivery credentials configured - cycles will abort (set TELEGRAM_BOT_TOKEN)");
        None
    };

    let monitor = Arc::new(Monitor::new(
        registry,
        cursors,
        detector,
        dispatcher,
        config.monitor.clone(),
    ));

    if config.monitor.schedule_secs > 0 {
        let scheduled = monitor.clone();
        let every = Duration::from_secs(config.monitor.schedule_secs);
        tokio::spawn(async move {
            monitor::run_schedule(scheduled, every).await;
        });
    }

    let state = ServerState {
        monitor,
        auth_token: Arc::from(auth_token.as_str()),
    };

    tokio::select! {
        result = server::serve(state, &config.server.bind) => {
            if let Err(e) = result {
                error!(error = %e, "trigger server stopped");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down...");
        }
    }

    Ok(())
}
