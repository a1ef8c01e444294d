use std::{sync::Arc, time::Duration};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{error, info, warn};
use crate::{
    api::handler::AppState,
    chain::{evm::EvmRewardLedger, FeeEstimator, RewardLedger},
    comments::CommentParser,
    config::{Config, StoreBackend},
    error::{AppError, AppResult},
    ledger::{memory::InMemoryLedger, repository::LedgerRepository, store::RewardStore},
    middleware::AdminToken,
    queue::JobQueue,
    settlement::SettlementDeps,
    wallet::WalletVerificationService,
    webhooks::{EventHandlers, WebhookVerifier},
};

/// Everything `main` needs to run the service
pub struct Services {
    pub state: AppState,
    /// `None` when no treasury key is configured
    pub settlement: Option<SettlementDeps>,
}

pub async fn initialize_services(config: &Config) -> AppResult<Services> {
    info!("Initializing application components ...");
    config.validate()?;

    let (store, backend): (Arc<dyn RewardStore>, &'static str) = match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = config.database_url.as_deref().ok_or_else(|| {
                AppError::Config("DATABASE_URL must be set for the postgres store".to_string())
            })?;
            let pool = initialize_database(database_url, config.worker_count).await?;
            let store: Arc<dyn RewardStore> = Arc::new(LedgerRepository::new(pool));
            (store, "postgres")
        }
        StoreBackend::Memory => {
            warn!("⚠️ Using the in-memory store; state is lost on restart");
            let store: Arc<dyn RewardStore> = Arc::new(InMemoryLedger::new());
            (store, "memory")
        }
    };

    let chain = initialize_chain(config)?;
    let state = assemble_state(config, store, backend, chain.is_some())?;

    let settlement = chain.map(|(ledger, fees)| SettlementDeps {
        queue: state.queue.clone(),
        store: state.store.clone(),
        ledger,
        fees,
        config: config.settlement_config(),
    });

    Ok(Services { state, settlement })
}

/// Wire the ingestion side on top of an existing store
pub fn assemble_state(
    config: &Config,
    store: Arc<dyn RewardStore>,
    store_backend: &'static str,
    settlement_enabled: bool,
) -> AppResult<AppState> {
    let queue = Arc::new(JobQueue::new(
        store.clone(),
        config.retry_policy(),
        config.visibility_timeout(),
    ));

    let parser = CommentParser::new(
        config.reward_command_marker.clone(),
        config.default_currency()?,
        config.destination_chain()?,
    );
    let handlers = Arc::new(EventHandlers::new(store.clone(), queue.clone(), parser));
    info!(
        "✅ Comment parser ready: marker {}, default {} on {}",
        config.reward_command_marker, config.default_currency, config.default_destination_chain
    );

    let wallets = Arc::new(WalletVerificationService::new(
        store.clone(),
        config.wallet_challenge_ttl(),
    ));

    Ok(AppState {
        store,
        queue,
        verifier: Arc::new(WebhookVerifier::new(config.github_webhook_secret.clone())),
        handlers,
        wallets,
        admin_token: AdminToken::new(config.admin_token()),
        store_backend,
        settlement_enabled,
    })
}

fn initialize_chain(
    config: &Config,
) -> AppResult<Option<(Arc<dyn RewardLedger>, Arc<dyn FeeEstimator>)>> {
    info!("⚙️  Initializing reward vault...");

    let Some(evm) = config.evm_config()? else {
        error!("⚠️  TREASURY_PRIVATE_KEY not set - settlement disabled, webhooks still accepted");
        return Ok(None);
    };

    let ledger = EvmRewardLedger::connect(&evm)?;
    let fees: Arc<dyn FeeEstimator> = Arc::new(ledger.fee_estimator());
    let ledger: Arc<dyn RewardLedger> = Arc::new(ledger);

    Ok(Some((ledger, fees)))
}

async fn initialize_database(database_url: &str, worker_count: usize) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    // Workers each hold at most one connection; the rest serve webhooks
    let max_connections = (worker_count as u32).saturating_add(16);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
