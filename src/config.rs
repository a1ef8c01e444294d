use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chain::evm::EvmConfig;
use crate::error::{AppError, AppResult};
use crate::ledger::models::{Chain, Currency};
use crate::queue::RetryPolicy;
use crate::settlement::{ReaperConfig, SettlementConfig};

/// Where jobs and installation state are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Service configuration. Each field is read from the environment variable
/// of the same name, upper-cased (`WORKER_COUNT` for `worker_count`).
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: Option<String>,
    pub store_backend: StoreBackend,
    pub bind_address: String,
    pub github_webhook_secret: String,
    pub cors_allowed_origins: String,
    /// Bearer token for `/api/v1/admin`; admin routes refuse every call without it
    pub admin_api_token: Option<String>,
    pub wallet_challenge_ttl_secs: u64,

    // Comment parsing
    pub reward_command_marker: String,
    pub default_currency: String,
    pub source_chain: String,
    pub default_destination_chain: String,

    // Queue
    pub worker_count: usize,
    pub max_attempts: i32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub visibility_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub claim_idle_secs: u64,

    // Settlement
    pub required_confirmations: u64,
    pub confirmation_poll_secs: u64,
    pub max_confirmation_polls: u32,
    pub rpc_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub relay_gas_limit: u64,
    pub relay_fee_buffer_bps: u32,
    pub evm_rpc_url: Option<String>,
    pub reward_vault_address: Option<String>,
    pub treasury_private_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            store_backend: StoreBackend::Postgres,
            bind_address: "0.0.0.0:8080".to_string(),
            github_webhook_secret: String::new(),
            cors_allowed_origins: String::new(),
            admin_api_token: None,
            wallet_challenge_ttl_secs: 600,
            reward_command_marker: "/reward".to_string(),
            default_currency: "usdc".to_string(),
            source_chain: "polygon".to_string(),
            default_destination_chain: "polygon".to_string(),
            worker_count: 4,
            max_attempts: 4,
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 3600,
            visibility_timeout_secs: 900,
            reaper_interval_secs: 30,
            claim_idle_secs: 2,
            required_confirmations: 3,
            confirmation_poll_secs: 6,
            max_confirmation_polls: 20,
            rpc_timeout_secs: 20,
            store_timeout_secs: 10,
            relay_gas_limit: 200_000,
            relay_fee_buffer_bps: 0,
            evm_rpc_url: None,
            reward_vault_address: None,
            treasury_private_key: None,
        }
    }
}

impl Config {
    /// Defaults, overridden by `.env` and then the process environment
    pub fn from_env() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> AppResult<()> {
        // SECURITY: an empty secret would accept any signature computed with an empty key
        if self.github_webhook_secret.trim().is_empty() {
            return Err(AppError::Config(
                "GITHUB_WEBHOOK_SECRET must be set".to_string(),
            ));
        }
        if self.store_backend == StoreBackend::Postgres && self.database_url.is_none() {
            return Err(AppError::Config(
                "DATABASE_URL must be set for the postgres store".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(AppError::Config("WORKER_COUNT must be at least 1".to_string()));
        }
        if self.max_attempts < 1 {
            return Err(AppError::Config("MAX_ATTEMPTS must be at least 1".to_string()));
        }

        if self.wallet_challenge_ttl_secs == 0 {
            return Err(AppError::Config(
                "WALLET_CHALLENGE_TTL_SECS must be at least 1".to_string(),
            ));
        }
        if self.admin_token().is_none() {
            warn!("⚠️ ADMIN_API_TOKEN not set - admin endpoints will refuse every request");
        }

        self.default_currency()?;
        self.source_chain()?;
        self.destination_chain()?;

        if !self.lease_covers_settlement() {
            warn!(
                "⚠️ Visibility timeout {}s does not cover the worst-case settlement of {}s; leases may expire mid-settlement",
                self.visibility_timeout_secs,
                self.settlement_config().worst_case_duration().as_secs()
            );
        }
        Ok(())
    }

    /// Whether a lease outlives a settlement where every call times out
    pub fn lease_covers_settlement(&self) -> bool {
        Duration::from_secs(self.visibility_timeout_secs)
            > self.settlement_config().worst_case_duration()
    }

    pub fn default_currency(&self) -> AppResult<Currency> {
        self.default_currency.parse().map_err(AppError::Config)
    }

    pub fn source_chain(&self) -> AppResult<Chain> {
        self.source_chain.parse().map_err(AppError::Config)
    }

    pub fn destination_chain(&self) -> AppResult<Chain> {
        self.default_destination_chain.parse().map_err(AppError::Config)
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Configured admin token; blank counts as unset
    pub fn admin_token(&self) -> Option<&str> {
        self.admin_api_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    pub fn wallet_challenge_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.wallet_challenge_ttl_secs as i64)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: chrono::Duration::seconds(self.retry_base_delay_secs as i64),
            max_delay: chrono::Duration::seconds(self.retry_max_delay_secs as i64),
            ..RetryPolicy::default()
        }
    }

    pub fn visibility_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.visibility_timeout_secs as i64)
    }

    pub fn settlement_config(&self) -> SettlementConfig {
        SettlementConfig {
            relay_gas_limit: self.relay_gas_limit,
            relay_fee_buffer_bps: self.relay_fee_buffer_bps,
            required_confirmations: self.required_confirmations,
            confirmation_poll_interval: Duration::from_secs(self.confirmation_poll_secs),
            max_confirmation_polls: self.max_confirmation_polls,
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
            store_timeout: Duration::from_secs(self.store_timeout_secs),
            claim_idle: Duration::from_secs(self.claim_idle_secs),
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.reaper_interval_secs),
        }
    }

    /// Chain settings for the reward vault, or `None` when the treasury
    /// key is absent and settlement has to stay off.
    pub fn evm_config(&self) -> AppResult<Option<EvmConfig>> {
        let Some(private_key) = self.treasury_private_key.clone() else {
            return Ok(None);
        };
        let rpc_url = self
            .evm_rpc_url
            .clone()
            .ok_or_else(|| AppError::Config("EVM_RPC_URL must be set with a treasury key".to_string()))?;
        let vault_address = self.reward_vault_address.clone().ok_or_else(|| {
            AppError::Config("REWARD_VAULT_ADDRESS must be set with a treasury key".to_string())
        })?;

        Ok(Some(EvmConfig {
            rpc_url,
            vault_address,
            private_key,
            source_chain: self.source_chain()?,
            poll_interval: Duration::from_secs(self.confirmation_poll_secs),
        }))
    }
}
