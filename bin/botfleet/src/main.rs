use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use common::{BotDirectory, Config, ExchangeAdapter, SecretsProvider};
use engine::{BalancePoller, BingXFactory, ExchangeRegistry, IntervalTicks, Scheduler, SchedulerConfig};
use paper::{PaperExchange, PaperFactory};
use store::{seed_bots, EnvSecrets, MemoryStore, SeedFile, SqliteStore};
use strategy::StrategyRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env().context("loading configuration")?;
    info!(
        tick_interval = ?cfg.tick_interval,
        tenant = ?cfg.tenant_id,
        "Botfleet starting"
    );

    // ── Storage ───────────────────────────────────────────────────────────────
    let (directory, secrets): (Arc<dyn BotDirectory>, Arc<dyn SecretsProvider>) =
        match &cfg.database_url {
            Some(url) => {
                let db = Arc::new(
                    SqliteStore::connect(url)
                        .await
                        .with_context(|| format!("opening database {url}"))?,
                );
                info!("Database ready");
                (db.clone() as Arc<dyn BotDirectory>, db as Arc<dyn SecretsProvider>)
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory store and environment credentials");
                (
                    Arc::new(MemoryStore::new()) as Arc<dyn BotDirectory>,
                    Arc::new(EnvSecrets::from_env()) as Arc<dyn SecretsProvider>,
                )
            }
        };

    if Path::new(&cfg.bots_file).exists() {
        let seeds = SeedFile::load(&cfg.bots_file)?;
        let ids = seed_bots(directory.as_ref(), &seeds, cfg.tenant_id.unwrap_or(Uuid::nil())).await?;
        info!(count = ids.len(), file = %cfg.bots_file, "Bots seeded");
    } else {
        info!(file = %cfg.bots_file, "No bot seed file");
    }

    // ── Exchanges ─────────────────────────────────────────────────────────────
    let bingx = BingXFactory::from_config(&cfg)?;
    let market: Arc<dyn ExchangeAdapter> = Arc::new(bingx.public()?);
    let paper = PaperExchange::new(Some(market), "USDT", cfg.paper_start_balance, cfg.paper_slippage_bps);
    let exchanges = ExchangeRegistry::new()
        .register(bingx)
        .register(PaperFactory::new(paper));

    // ── Scheduler ─────────────────────────────────────────────────────────────
    let (scheduler, handle) = Scheduler::new(
        directory.clone(),
        secrets.clone(),
        exchanges.clone(),
        StrategyRegistry::with_defaults(),
        SchedulerConfig::from(&cfg),
    );

    if !cfg.balance_poll_interval.is_zero() {
        let poller = BalancePoller::new(
            directory,
            secrets,
            exchanges,
            cfg.balance_poll_interval,
            cfg.tenant_id,
        );
        tokio::spawn(poller.run(handle.shutdown_signal()));
    }

    let scheduler = tokio::spawn(scheduler.run(IntervalTicks::new(cfg.tick_interval)));

    info!("All subsystems started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown signal received. Draining in-flight ticks.");
    handle.shutdown();
    scheduler.await.context("scheduler task")?;
    info!("Botfleet stopped");
    Ok(())
}
