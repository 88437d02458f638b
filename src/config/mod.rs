use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub classify: ClassifyConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvConfig {
    /// Valkey/Redis URL. Empty = in-process memory store (dev only).
    #[serde(default = "default_kv_url")]
    pub url: String,
    /// Namespace prefix for every key.
    #[serde(default = "default_kv_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Solana JSON-RPC endpoint. Replaced by the Helius endpoint when a key is set.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Helius API key - loaded from env HELIUS_API_KEY
    #[serde(default)]
    pub helius_api_key: String,
    /// Signatures fetched per target per check.
    #[serde(default = "default_activity_limit")]
    pub activity_limit: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Base URL of the handle → wallet lookup API.
    #[serde(default = "default_resolver_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot token - loaded from env TELEGRAM_BOT_TOKEN
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_telegram_url")]
    pub api_url: String,
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
}

/// Domain constants that decide whether an activity entry is a fee claim.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifyConfig {
    /// Program ids that distribute fees.
    #[serde(default = "default_fee_programs")]
    pub fee_programs: Vec<String>,
    /// Minimum positive lamport delta for an account to count as credited.
    #[serde(default = "default_min_balance_delta")]
    pub min_balance_delta: u64,
    /// Suffix of launchpad token mints, used only for display metadata.
    #[serde(default = "default_token_suffix")]
    pub token_suffix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Quiescence window: a target polled more recently than this is skipped.
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
    /// Max targets processed at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Minimum spacing between the start of two upstream checks.
    #[serde(default = "default_start_spacing_ms")]
    pub start_spacing_ms: u64,
    /// Budget for fetch + classify of one target.
    #[serde(default = "default_target_timeout")]
    pub target_timeout_secs: u64,
    /// Budget for a single notification send.
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,
    /// Targets not started before this deadline are abandoned for the cycle.
    #[serde(default = "default_cycle_deadline")]
    pub cycle_deadline_secs: u64,
    /// How far behind the watermark the activity window is re-scanned.
    #[serde(default = "default_rescan_overlap")]
    pub rescan_overlap_secs: i64,
    /// Internal schedule. 0 = only run when triggered.
    #[serde(default)]
    pub schedule_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token for the trigger endpoint - loaded from env MONITOR_AUTH_TOKEN
    #[serde(default)]
    pub auth_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_kv_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_kv_prefix() -> String {
    "claimwatch".to_string()
}
fn default_rpc_url() -> String {
    "https://api.mainnet-beta.solana.com".to_string()
}
fn default_activity_limit() -> usize {
    20
}
fn default_request_timeout() -> u64 {
    10
}
fn default_resolver_url() -> String {
    "https://hg-beta.vercel.app".to_string()
}
fn default_telegram_url() -> String {
    "https://api.telegram.org".to_string()
}
fn default_parse_mode() -> String {
    "Markdown".to_string()
}
fn default_fee_programs() -> Vec<String> {
    vec!["FEEhPbKVKnco9EXnaY3i4R5rQVUx91wgVfu8qokixywi".to_string()]
}
fn default_min_balance_delta() -> u64 {
    1
}
fn default_token_suffix() -> String {
    "BAGS".to_string()
}
fn default_min_interval() -> u64 {
    30
}
fn default_max_concurrency() -> usize {
    4
}
fn default_start_spacing_ms() -> u64 {
    200
}
fn default_target_timeout() -> u64 {
    20
}
fn default_delivery_timeout() -> u64 {
    10
}
fn default_cycle_deadline() -> u64 {
    50
}
fn default_rescan_overlap() -> i64 {
    120
}
fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: default_kv_url(),
            prefix: default_kv_prefix(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            helius_api_key: String::new(),
            activity_limit: default_activity_limit(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: default_resolver_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_url: default_telegram_url(),
            parse_mode: default_parse_mode(),
        }
    }
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            fee_programs: default_fee_programs(),
            min_balance_delta: default_min_balance_delta(),
            token_suffix: default_token_suffix(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval(),
            max_concurrency: default_max_concurrency(),
            start_spacing_ms: default_start_spacing_ms(),
            target_timeout_secs: default_target_timeout(),
            delivery_timeout_secs: default_delivery_timeout(),
            cycle_deadline_secs: default_cycle_deadline(),
            rescan_overlap_secs: default_rescan_overlap(),
            schedule_secs: 0,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            auth_token: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl LedgerConfig {
    /// The RPC endpoint actually used: Helius when a key is configured.
    pub fn endpoint(&self) -> String {
        if self.helius_api_key.is_empty() {
            self.rpc_url.clone()
        } else {
            format!("https://mainnet.helius-rpc.com/?api-key={}", self.helius_api_key)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl MonitorConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
    pub fn start_spacing(&self) -> Duration {
        Duration::from_millis(self.start_spacing_ms)
    }
    pub fn target_timeout(&self) -> Duration {
        Duration::from_secs(self.target_timeout_secs)
    }
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.overlay_env();
        Ok(config)
    }

    /// Load a default config with env-only secrets (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config {
            kv: KvConfig::default(),
            ledger: LedgerConfig::default(),
            resolver: ResolverConfig::default(),
            telegram: TelegramConfig::default(),
            classify: ClassifyConfig::default(),
            monitor: MonitorConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        };
        if let Ok(url) = std::env::var("SOLANA_RPC_URL") {
            config.ledger.rpc_url = url;
        }
        if let Ok(url) = std::env::var("RESOLVER_URL") {
            config.resolver.base_url = url;
        }
        config.overlay_env();
        config
    }

    // Secrets never live in the config file.
    fn overlay_env(&mut self) {
        if let Ok(url) = std::env::var("KV_URL") {
            self.kv.url = url;
        }
        if let Ok(key) = std::env::var("HELIUS_API_KEY") {
            self.ledger.helius_api_key = key;
        }
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Ok(token) = std::env::var("MONITOR_AUTH_TOKEN") {
            self.server.auth_token = token;
        }
    }

    pub fn has_delivery_credentials(&self) -> bool {
        !self.telegram.bot_token.is_empty()
    }

    /// Fails when the trigger endpoint would be unauthenticated.
    pub fn require_auth_token(&self) -> Result<&str, ConfigError> {
        if self.server.auth_token.is_empty() {
            Err(ConfigError::MissingEnv("MONITOR_AUTH_TOKEN".to_string()))
        } else {
            Ok(&self.server.auth_token)
        }
    }
}
