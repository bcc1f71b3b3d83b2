use chrono::Duration as ChronoDuration;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    config::{Config, StoreBackend},
    error::{AppError, AppResult},
    ledger::{BalanceLedger, InMemoryLedger, LedgerRepository, LedgerStore},
    oracle::{PriceOracle, PythOracle},
    rounds::{Clock, RoundManager, SystemClock},
    settlement::{
        EngineSettings, SchedulerConfig, SchedulerHandle, SettlementBroadcaster,
        SettlementEngine, SettlementScheduler,
    },
    trading::TradePlacementService,
};

/// Everything the process runs, wired once at startup
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub clock: Arc<dyn Clock>,
    pub rounds: Arc<RoundManager>,
    pub placement: Arc<TradePlacementService>,
    pub balances: Arc<BalanceLedger>,
    pub settlement: Arc<SettlementEngine>,
    pub broadcaster: Arc<SettlementBroadcaster>,
    scheduler_config: SchedulerConfig,
}

impl AppState {
    /// Spawn the settlement loop for this process
    pub fn start_scheduler(&self) -> SchedulerHandle {
        SettlementScheduler::new(
            self.scheduler_config.clone(),
            self.rounds.clone(),
            self.settlement.clone(),
            self.clock.clone(),
        )
        .start()
    }
}

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing settlement engine components ...");

    let store: Arc<dyn LedgerStore> = match config.store {
        StoreBackend::Postgres => {
            let pool = initialize_database(&config.database_url, config.db_max_connections).await?;
            Arc::new(LedgerRepository::new(pool))
        }
        StoreBackend::Memory => {
            warn!("⚠️  In-memory store selected - balances are lost on exit");
            Arc::new(InMemoryLedger::new())
        }
    };

    let mut pyth = match &config.pyth.base_url {
        Some(url) => PythOracle::with_base_url(url, config.pyth.max_staleness),
        None => PythOracle::new(&config.pyth.network, config.pyth.max_staleness),
    };
    pyth = pyth.with_feed_ids(config.pyth.feed_ids.clone());
    for symbol in &config.symbols {
        if pyth.feed_id(symbol).is_none() {
            return Err(AppError::Config(format!("No Pyth feed id for symbol {}", symbol)));
        }
    }
    info!("✅ Pyth price oracle initialized for network: {}", config.pyth.network);

    build_app_state(config, store, Arc::new(pyth), Arc::new(SystemClock))
}

/// Wire services over an already constructed store, oracle and clock
pub fn build_app_state(
    config: &Config,
    store: Arc<dyn LedgerStore>,
    oracle: Arc<dyn PriceOracle>,
    clock: Arc<dyn Clock>,
) -> AppResult<AppState> {
    let stale_after = ChronoDuration::from_std(config.tick_interval * config.stale_after_ticks)
        .map_err(|e| AppError::Config(format!("stale_after_ticks out of range: {}", e)))?;

    let broadcaster = Arc::new(SettlementBroadcaster::new());

    let rounds = Arc::new(RoundManager::new(
        store.clone(),
        clock.clone(),
        config.symbols.clone(),
        config.round_duration_ms,
    ));

    let placement = Arc::new(TradePlacementService::new(
        store.clone(),
        oracle.clone(),
        clock.clone(),
        config.stake_limits,
        config.oracle_timeout,
    ));

    let settlement = Arc::new(SettlementEngine::new(
        store.clone(),
        oracle,
        clock.clone(),
        broadcaster.clone(),
        EngineSettings {
            policy: config.policy,
            grace: config.settle_grace,
            oracle_timeout: config.oracle_timeout,
            stale_after,
        },
    ));

    let balances = Arc::new(BalanceLedger::new(store.clone()));

    info!(
        "✅ Engine ready: symbols={} round={}ms payout_ratio={} tie_rule={:?}",
        config.symbols.join(","),
        config.round_duration_ms,
        config.policy.payout_ratio,
        config.policy.tie_rule
    );

    Ok(AppState {
        store,
        clock,
        rounds,
        placement,
        balances,
        settlement,
        broadcaster,
        scheduler_config: SchedulerConfig {
            tick_interval: config.tick_interval,
        },
    })
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
