use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use common::{
    BotDefinition, BotDirectory, BotId, BotState, BotStatus, Credentials, Error, Result,
    SecretsProvider, Signal, TenantId,
};

/// Process-local store. Used when no database is configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    bots: RwLock<HashMap<BotId, BotDefinition>>,
    states: RwLock<HashMap<BotId, Vec<BotState>>>,
    signals: RwLock<Vec<Signal>>,
    credentials: RwLock<HashMap<(TenantId, String), Credentials>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_credentials(&self, tenant: TenantId, exchange: &str, credentials: Credentials) {
        self.credentials
            .write()
            .await
            .insert((tenant, exchange.to_lowercase()), credentials);
    }

    /// Every snapshot written for a bot, oldest first.
    pub async fn state_history(&self, bot_id: BotId) -> Vec<BotState> {
        self.states
            .read()
            .await
            .get(&bot_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BotDirectory for MemoryStore {
    async fn list_active_bots(&self, tenant: Option<TenantId>) -> Result<Vec<BotDefinition>> {
        let mut bots: Vec<BotDefinition> = self
            .bots
            .read()
            .await
            .values()
            .filter(|b| b.is_schedulable())
            .filter(|b| tenant.map_or(true, |t| b.tenant_id == t))
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.created_at);
        Ok(bots)
    }

    async fn get_bot(&self, bot_id: BotId) -> Result<Option<BotDefinition>> {
        Ok(self.bots.read().await.get(&bot_id).cloned())
    }

    async fn upsert_bot(&self, bot: &BotDefinition) -> Result<()> {
        self.bots.write().await.insert(bot.id, bot.clone());
        Ok(())
    }

    async fn set_bot_status(
        &self,
        bot_id: BotId,
        status: BotStatus,
        is_active: bool,
        reason: Option<String>,
    ) -> Result<()> {
        let mut bots = self.bots.write().await;
        let bot = bots
            .get_mut(&bot_id)
            .ok_or_else(|| Error::NotFound(format!("bot {bot_id}")))?;
        bot.status = status;
        bot.is_active = is_active;
        bot.last_error = reason;
        Ok(())
    }

    async fn update_bot_state(&self, bot_id: BotId, state: &BotState) -> Result<()> {
        self.states
            .write()
            .await
            .entry(bot_id)
            .or_default()
            .push(state.clone());
        Ok(())
    }

    async fn latest_state(&self, bot_id: BotId) -> Result<Option<BotState>> {
        // max_by_key keeps the last of equal timestamps, i.e. the latest write.
        Ok(self
            .states
            .read()
            .await
            .get(&bot_id)
            .and_then(|history| history.iter().max_by_key(|s| s.timestamp).cloned()))
    }

    async fn append_signal(&self, signal: &Signal) -> Result<()> {
        let mut signals = self.signals.write().await;
        if signals.iter().any(|s| s.id == signal.id) {
            return Err(Error::InvalidState(format!("signal {} already recorded", signal.id)));
        }
        signals.push(signal.clone());
        Ok(())
    }

    async fn mark_signal_executed(&self, signal_id: Uuid, executed_at: DateTime<Utc>) -> Result<()> {
        let mut signals = self.signals.write().await;
        let signal = signals
            .iter_mut()
            .find(|s| s.id == signal_id)
            .ok_or_else(|| Error::NotFound(format!("signal {signal_id}")))?;
        if !signal.is_executed {
            signal.is_executed = true;
            signal.executed_at = Some(executed_at);
        }
        Ok(())
    }

    async fn signals_for(&self, bot_id: BotId) -> Result<Vec<Signal>> {
        Ok(self
            .signals
            .read()
            .await
            .iter()
            .filter(|s| s.bot_id == bot_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SecretsProvider for MemoryStore {
    async fn get_credentials(&self, tenant: TenantId, exchange: &str) -> Result<Credentials> {
        self.credentials
            .read()
            .await
            .get(&(tenant, exchange.to_lowercase()))
            .cloned()
            .ok_or_else(|| Error::MissingCredentials {
                tenant: tenant.to_string(),
                exchange: exchange.to_string(),
            })
    }
}
