use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use common::{BotDirectory, Credentials, ExchangeAdapter, SecretsProvider, TenantId, TradingMode};

use crate::registry::ExchangeRegistry;

/// Balances of one account summed across assets.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountSummary {
    pub tenant_id: TenantId,
    pub exchange: String,
    pub assets: usize,
    pub total: f64,
    pub available: f64,
    pub locked: f64,
}

type AccountKey = (TenantId, String);

/// Periodically logs the balances of every account that has an active bot.
pub struct BalancePoller {
    directory: Arc<dyn BotDirectory>,
    secrets: Arc<dyn SecretsProvider>,
    exchanges: ExchangeRegistry,
    period: Duration,
    tenant: Option<TenantId>,
    accounts: BTreeMap<AccountKey, Arc<dyn ExchangeAdapter>>,
}

impl BalancePoller {
    pub fn new(
        directory: Arc<dyn BotDirectory>,
        secrets: Arc<dyn SecretsProvider>,
        exchanges: ExchangeRegistry,
        period: Duration,
        tenant: Option<TenantId>,
    ) -> Self {
        Self {
            directory,
            secrets,
            exchanges,
            period,
            tenant,
            accounts: BTreeMap::new(),
        }
    }

    /// Run until `shutdown` flips to `true`. A zero period disables polling.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if self.period.is_zero() {
            info!("Balance poller disabled");
            return;
        }
        info!(period = ?self.period, "Balance poller starting");

        self.refresh_accounts().await;
        for ((tenant, exchange), adapter) in &self.accounts {
            let symbols = adapter.get_symbols().await;
            info!(tenant = %tenant, exchange = %exchange, count = symbols.len(), "Fetched symbols");
        }

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
        info!("Balance poller stopped");
    }

    /// Fetch and log balances for every known account.
    pub async fn poll_once(&mut self) -> Vec<AccountSummary> {
        self.refresh_accounts().await;

        let mut summaries = Vec::with_capacity(self.accounts.len());
        for ((tenant, exchange), adapter) in &self.accounts {
            let balances = adapter.get_all_balances().await;
            if balances.is_empty() {
                info!(tenant = %tenant, exchange = %exchange, "No balances found");
            }
            let summary = AccountSummary {
                tenant_id: *tenant,
                exchange: exchange.clone(),
                assets: balances.len(),
                total: balances.iter().map(|b| b.total).sum(),
                available: balances.iter().map(|b| b.available).sum(),
                locked: balances.iter().map(|b| b.locked).sum(),
            };
            info!(
                tenant = %tenant,
                exchange = %exchange,
                assets = summary.assets,
                total = summary.total,
                available = summary.available,
                locked = summary.locked,
                "Balance summary"
            );
            for b in &balances {
                debug!(asset = %b.asset, total = b.total, available = b.available, locked = b.locked, "Balance");
            }
            summaries.push(summary);
        }
        summaries
    }

    /// Connect any (tenant, exchange) account with an active bot not seen yet.
    async fn refresh_accounts(&mut self) {
        let bots = match self.directory.list_active_bots(self.tenant).await {
            Ok(bots) => bots,
            Err(e) => {
                error!(error = %e, "Balance poller could not list bots");
                return;
            }
        };

        for bot in bots {
            let key = (bot.tenant_id, bot.exchange.to_lowercase());
            if self.accounts.contains_key(&key) {
                continue;
            }
            let Some(factory) = self.exchanges.get(&key.1) else {
                continue;
            };
            let credentials = if factory.requires_credentials() {
                match self.secrets.get_credentials(key.0, &key.1).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(tenant = %key.0, exchange = %key.1, error = %e, "No credentials for balance polling");
                        continue;
                    }
                }
            } else {
                Credentials::new("", "")
            };
            match factory.connect(credentials, TradingMode::Spot) {
                Ok(adapter) => {
                    self.accounts.insert(key, adapter);
                }
                Err(e) => warn!(tenant = %key.0, exchange = %key.1, error = %e, "Cannot poll account"),
            }
        }
    }
}
