use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use common::{
    BotDefinition, BotDirectory, BotId, BotState, BotStatus, CandleQuery, Config, Credentials,
    Error, ExchangeAdapter, ExchangeError, SecretsProvider, Signal, TenantId, TradingMode,
    TradingPair,
};
use strategy::{MarketSnapshot, StrategyError, StrategyRegistry};

use crate::backoff::Backoff;
use crate::executor::{OrderExecutor, Reconciliation, Submission};
use crate::lifecycle::{BotCommand, BotHealth, EngineHandle, HealthMap};
use crate::registry::ExchangeRegistry;
use crate::tick::TickSource;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Failures in a row before the circuit breaker suspends a bot.
    pub max_consecutive_failures: u32,
    pub backoff: Backoff,
    /// How long shutdown waits for in-flight ticks before aborting them.
    pub shutdown_grace: Duration,
    /// Only schedule this tenant's bots.
    pub tenant_id: Option<TenantId>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            backoff: Backoff::default(),
            shutdown_grace: Duration::from_secs(10),
            tenant_id: None,
        }
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_consecutive_failures: config.max_consecutive_failures,
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
            shutdown_grace: config.shutdown_grace,
            tenant_id: config.tenant_id,
        }
    }
}

/// Result of a tick that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Strategy produced no signal.
    Held,
    /// No ticker available; nothing evaluated.
    NoMarketData,
    Executed { order_id: String },
    /// A pending order was resolved instead of running the strategy.
    Reconciled { executed: bool },
}

#[derive(Debug, thiserror::Error)]
pub enum TickError {
    /// Not retried; the bot is suspended.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("order {order_id} rejected by exchange")]
    Rejected { order_id: String },

    #[error("store error: {0}")]
    Store(#[from] Error),
}

impl TickError {
    /// Errors raised while resolving the bot's adapter or credentials.
    fn from_setup(err: Error) -> Self {
        match err {
            Error::Config(_) | Error::MissingCredentials { .. } | Error::NotFound(_) => {
                TickError::Config(err.to_string())
            }
            other => TickError::Store(other),
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(
            self,
            TickError::Config(_) | TickError::Exchange(ExchangeError::Unsupported(_))
        )
    }
}

/// What one bot's tick did.
#[derive(Debug)]
pub struct TickReport {
    pub bot_id: BotId,
    pub at: DateTime<Utc>,
    pub result: std::result::Result<TickOutcome, TickError>,
    pub consecutive_failures: u32,
    /// Reason, when this tick suspended the bot.
    pub suspended: Option<String>,
}

/// Per-bot runtime data. Only touched by the tick holding the bot's lock.
#[derive(Default)]
struct BotRuntime {
    adapter: Option<(AdapterKey, Arc<dyn ExchangeAdapter>)>,
    consecutive_failures: u32,
    next_eligible: Option<Instant>,
}

type AdapterKey = (String, TradingMode);

/// Shared, read-only after construction except for the per-bot slots.
struct Inner {
    directory: Arc<dyn BotDirectory>,
    secrets: Arc<dyn SecretsProvider>,
    exchanges: ExchangeRegistry,
    strategies: StrategyRegistry,
    config: SchedulerConfig,
    slots: Mutex<HashMap<BotId, Arc<Mutex<BotRuntime>>>>,
}

/// Drives every active bot: one task per bot per tick, never two at once
/// for the same bot.
pub struct Scheduler {
    inner: Arc<Inner>,
    health: HealthMap,
    commands: mpsc::Receiver<BotCommand>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: JoinSet<TickReport>,
}

impl Scheduler {
    pub fn new(
        directory: Arc<dyn BotDirectory>,
        secrets: Arc<dyn SecretsProvider>,
        exchanges: ExchangeRegistry,
        strategies: StrategyRegistry,
        config: SchedulerConfig,
    ) -> (Self, EngineHandle) {
        let (command_tx, commands) = mpsc::channel(32);
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let health: HealthMap = Arc::new(RwLock::new(HashMap::new()));

        let handle = EngineHandle::new(command_tx, health.clone(), shutdown.clone());
        let scheduler = Scheduler {
            inner: Arc::new(Inner {
                directory,
                secrets,
                exchanges,
                strategies,
                config,
                slots: Mutex::new(HashMap::new()),
            }),
            health,
            commands,
            shutdown,
            tasks: JoinSet::new(),
        };
        (scheduler, handle)
    }

    /// Run until shutdown is requested or `ticks` is exhausted, then give
    /// in-flight ticks the grace period and abort the rest.
    pub async fn run<T: TickSource>(mut self, mut ticks: T) {
        let mut shutdown = self.shutdown.subscribe();
        info!(
            exchanges = ?self.inner.exchanges.names(),
            strategies = ?self.inner.strategies.names(),
            "Scheduler running"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(command) = self.commands.recv() => self.apply_command(command).await,
                tick = ticks.next_tick() => match tick {
                    Some(at) => self.dispatch(at).await,
                    None => {
                        info!("Tick source exhausted");
                        break;
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.on_joined(joined).await;
                }
            }
        }

        self.drain().await;
        info!("Scheduler stopped");
    }

    /// Dispatch one tick and wait for every task it started.
    pub async fn run_tick_to_completion(&mut self, at: DateTime<Utc>) -> Vec<TickReport> {
        self.dispatch(at).await;
        let mut reports = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            if let Some(report) = self.on_joined(joined).await {
                reports.push(report);
            }
        }
        reports
    }

    async fn dispatch(&mut self, at: DateTime<Utc>) {
        let bots = match self
            .inner
            .directory
            .list_active_bots(self.inner.config.tenant_id)
            .await
        {
            Ok(bots) => bots,
            Err(e) => {
                error!(error = %e, "Failed to list active bots; skipping tick");
                return;
            }
        };

        let now = Instant::now();
        let (mut spawned, mut busy, mut backing_off) = (0usize, 0usize, 0usize);

        for bot in bots.into_iter().filter(BotDefinition::is_schedulable) {
            let slot = self.inner.slot(bot.id).await;
            let Ok(runtime) = slot.try_lock_owned() else {
                debug!(bot_id = %bot.id, "Previous tick still running; skipping");
                busy += 1;
                continue;
            };
            if runtime.next_eligible.is_some_and(|t| t > now) {
                backing_off += 1;
                continue;
            }

            if bot.status == BotStatus::Idle {
                if let Err(e) = self
                    .inner
                    .directory
                    .set_bot_status(bot.id, BotStatus::Running, true, None)
                    .await
                {
                    warn!(bot_id = %bot.id, error = %e, "Failed to mark bot running");
                }
            }
            self.health
                .write()
                .await
                .entry(bot.id)
                .or_insert_with(|| BotHealth::new(BotStatus::Running))
                .status = BotStatus::Running;

            let inner = self.inner.clone();
            self.tasks.spawn(inner.run_tick(bot, runtime, at));
            spawned += 1;
        }

        debug!(spawned, busy, backing_off, in_flight = self.tasks.len(), "Tick dispatched");
    }

    async fn on_joined(&mut self, joined: Result<TickReport, JoinError>) -> Option<TickReport> {
        match joined {
            Ok(report) => {
                self.record(&report).await;
                Some(report)
            }
            Err(e) if e.is_cancelled() => {
                debug!("Bot tick aborted");
                None
            }
            Err(e) => {
                error!(error = %e, "Bot tick panicked");
                None
            }
        }
    }

    async fn record(&self, report: &TickReport) {
        let mut health = self.health.write().await;
        let entry = health
            .entry(report.bot_id)
            .or_insert_with(|| BotHealth::new(BotStatus::Running));
        entry.last_tick = Some(report.at);
        entry.consecutive_failures = report.consecutive_failures;
        if let Err(e) = &report.result {
            entry.last_error = Some(e.to_string());
        }
        if let Some(reason) = &report.suspended {
            if entry.status != BotStatus::Stopped {
                entry.status = BotStatus::Suspended;
            }
            entry.last_error = Some(reason.clone());
        }
    }

    async fn apply_command(&mut self, command: BotCommand) {
        match command {
            BotCommand::Stop(bot_id, reply) => {
                let result = self.set_status(bot_id, BotStatus::Stopped, false).await;
                let _ = reply.send(result);
            }
            BotCommand::Start(bot_id, reply) => {
                let result = match self.current_status(bot_id).await {
                    Ok(BotStatus::Suspended) => Err(Error::InvalidState(format!(
                        "bot {bot_id} is suspended; reactivate it instead"
                    ))),
                    Ok(_) => self.set_status(bot_id, BotStatus::Idle, true).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            BotCommand::Reactivate(bot_id, reply) => {
                let result = match self.current_status(bot_id).await {
                    Ok(BotStatus::Suspended) => self.set_status(bot_id, BotStatus::Idle, true).await,
                    Ok(status) => Err(Error::InvalidState(format!(
                        "bot {bot_id} is {status}, not suspended"
                    ))),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn current_status(&self, bot_id: BotId) -> common::Result<BotStatus> {
        self.inner
            .directory
            .get_bot(bot_id)
            .await?
            .map(|bot| bot.status)
            .ok_or_else(|| Error::NotFound(format!("bot {bot_id}")))
    }

    /// Write through to the directory, then mirror into the health map.
    async fn set_status(&self, bot_id: BotId, status: BotStatus, is_active: bool) -> common::Result<()> {
        self.inner
            .directory
            .set_bot_status(bot_id, status, is_active, None)
            .await?;
        self.inner.reset_runtime(bot_id).await;
        let mut health = self.health.write().await;
        let entry = health.entry(bot_id).or_insert_with(|| BotHealth::new(status));
        entry.status = status;
        entry.consecutive_failures = 0;
        entry.last_error = None;
        info!(bot_id = %bot_id, %status, "Bot status changed by operator");
        Ok(())
    }

    async fn drain(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let grace = self.inner.config.shutdown_grace;
        info!(in_flight = self.tasks.len(), ?grace, "Waiting for in-flight ticks");

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(remaining = self.tasks.len(), "Grace period over; aborting in-flight ticks");
                    self.tasks.abort_all();
                    break;
                }
                joined = self.tasks.join_next() => match joined {
                    Some(joined) => {
                        self.on_joined(joined).await;
                    }
                    None => break,
                },
            }
        }
        while let Some(joined) = self.tasks.join_next().await {
            self.on_joined(joined).await;
        }
    }
}

impl Inner {
    async fn slot(&self, bot_id: BotId) -> Arc<Mutex<BotRuntime>> {
        self.slots.lock().await.entry(bot_id).or_default().clone()
    }

    /// Forget failures, backoff and the cached adapter. A tick still in
    /// flight finishes first; the lock is fair, so no later tick runs before
    /// the reset.
    async fn reset_runtime(&self, bot_id: BotId) {
        let slot = self.slot(bot_id).await;
        match slot.clone().try_lock_owned() {
            Ok(mut runtime) => *runtime = BotRuntime::default(),
            Err(_) => {
                tokio::spawn(async move {
                    *slot.lock_owned().await = BotRuntime::default();
                });
            }
        }
    }

    /// One bot's tick. Holds the bot's lock for its whole duration.
    async fn run_tick(
        self: Arc<Self>,
        bot: BotDefinition,
        mut runtime: OwnedMutexGuard<BotRuntime>,
        at: DateTime<Utc>,
    ) -> TickReport {
        let result = self.tick_bot(&bot, &mut runtime, at).await;
        let mut suspended = None;

        match &result {
            Ok(TickOutcome::NoMarketData) => {}
            Ok(outcome) => {
                debug!(bot_id = %bot.id, ?outcome, "Tick complete");
                runtime.consecutive_failures = 0;
                runtime.next_eligible = None;
            }
            Err(e) if e.is_config() => {
                error!(bot_id = %bot.id, tenant = %bot.tenant_id, error = %e, "Configuration error; suspending bot");
                suspended = Some(e.to_string());
            }
            Err(e) => {
                runtime.consecutive_failures += 1;
                let failures = runtime.consecutive_failures;
                if failures >= self.config.max_consecutive_failures {
                    error!(bot_id = %bot.id, failures, error = %e, "Too many consecutive failures; suspending bot");
                    suspended = Some(format!("{failures} consecutive failures, last: {e}"));
                } else {
                    let delay = self.config.backoff.delay(failures);
                    runtime.next_eligible = Some(Instant::now() + delay);
                    warn!(
                        bot_id = %bot.id,
                        exchange = %bot.exchange,
                        symbol = %bot.symbol,
                        failures,
                        ?delay,
                        error = %e,
                        "Tick failed; backing off"
                    );
                }
            }
        }

        let consecutive_failures = runtime.consecutive_failures;
        if let Some(reason) = &suspended {
            self.suspend(&bot, reason).await;
            *runtime = BotRuntime::default();
        }

        TickReport {
            bot_id: bot.id,
            at,
            result,
            consecutive_failures,
            suspended,
        }
    }

    async fn suspend(&self, bot: &BotDefinition, reason: &str) {
        // An operator stop issued mid-tick wins over the suspension.
        if let Ok(Some(current)) = self.directory.get_bot(bot.id).await {
            if current.status == BotStatus::Stopped {
                info!(bot_id = %bot.id, "Bot stopped by operator; not suspending");
                return;
            }
        }
        if let Err(e) = self
            .directory
            .set_bot_status(bot.id, BotStatus::Suspended, false, Some(reason.to_string()))
            .await
        {
            error!(bot_id = %bot.id, error = %e, "Failed to persist suspension");
        }
    }

    async fn tick_bot(
        &self,
        bot: &BotDefinition,
        runtime: &mut BotRuntime,
        at: DateTime<Utc>,
    ) -> Result<TickOutcome, TickError> {
        TradingPair::parse(&bot.symbol).map_err(|e| TickError::Config(e.to_string()))?;
        let strategy = self
            .strategies
            .get(&bot.strategy)
            .ok_or_else(|| TickError::Config(format!("unknown strategy '{}'", bot.strategy)))?;
        let adapter = self.adapter_for(bot, runtime).await?;

        let state = self
            .directory
            .latest_state(bot.id)
            .await?
            .unwrap_or_else(|| BotState::initial(bot.id));
        let executor = OrderExecutor::new(self.directory.as_ref(), adapter.clone());

        if state.pending.is_some() {
            return match executor.reconcile(&state).await? {
                Reconciliation::Executed(_) => Ok(TickOutcome::Reconciled { executed: true }),
                Reconciliation::Abandoned(_) => Ok(TickOutcome::Reconciled { executed: false }),
                Reconciliation::Unresolved(e) => Err(e.into()),
            };
        }

        let Some(ticker) = adapter.get_ticker(&bot.symbol).await else {
            info!(bot_id = %bot.id, symbol = %bot.symbol, "No market data; skipping tick");
            return Ok(TickOutcome::NoMarketData);
        };
        let candles = match strategy.candle_requirement(&bot.config)? {
            Some(req) => {
                let query = CandleQuery {
                    limit: Some(req.count),
                    ..CandleQuery::default()
                };
                adapter.get_candles(&bot.symbol, req.interval, query).await
            }
            None => Vec::new(),
        };
        let snapshot = MarketSnapshot {
            symbol: bot.symbol.clone(),
            ticker: Some(ticker),
            candles,
            observed_at: at,
        };

        let decision = strategy.generate_signal(&snapshot, &bot.config, &state.document)?;
        let Some(intent) = decision.signal else {
            if decision.state != state.document {
                self.directory
                    .update_bot_state(bot.id, &state.next(decision.state, None))
                    .await?;
            }
            return Ok(TickOutcome::Held);
        };

        let signal = Signal::new(
            bot.id,
            bot.symbol.clone(),
            intent.side,
            intent.quantity,
            intent.price,
            intent.reason,
        );
        match executor.submit(&state, signal, decision.state).await? {
            Submission::Executed(result) => Ok(TickOutcome::Executed {
                order_id: result.order_id,
            }),
            Submission::Rejected(result) => Err(TickError::Rejected {
                order_id: result.order_id,
            }),
            Submission::Failed(e) | Submission::Unknown(e) => Err(e.into()),
        }
    }

    /// Connect lazily and reuse the adapter while exchange and mode are unchanged.
    async fn adapter_for(
        &self,
        bot: &BotDefinition,
        runtime: &mut BotRuntime,
    ) -> Result<Arc<dyn ExchangeAdapter>, TickError> {
        let key: AdapterKey = (bot.exchange.to_lowercase(), bot.mode);
        if let Some((cached, adapter)) = &runtime.adapter {
            if *cached == key {
                return Ok(adapter.clone());
            }
        }

        let factory = self
            .exchanges
            .get(&bot.exchange)
            .ok_or_else(|| TickError::Config(format!("unknown exchange '{}'", bot.exchange)))?;
        let credentials = if factory.requires_credentials() {
            self.secrets
                .get_credentials(bot.tenant_id, &key.0)
                .await
                .map_err(TickError::from_setup)?
        } else {
            Credentials::new("", "")
        };
        let adapter = factory
            .connect(credentials, bot.mode)
            .map_err(TickError::from_setup)?;

        info!(bot_id = %bot.id, tenant = %bot.tenant_id, exchange = %key.0, "Exchange adapter connected");
        runtime.adapter = Some((key, adapter.clone()));
        Ok(adapter)
    }
}
