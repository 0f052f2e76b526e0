use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{BotDefinition, BotId, BotState, BotStatus, Credentials, Result, Signal, TenantId};

/// Durable record of bots, their state history and emitted signals.
///
/// The engine only depends on this trait; `store` provides in-memory and
/// SQLite implementations.
#[async_trait]
pub trait BotDirectory: Send + Sync {
    /// Bots that are switched on and neither suspended nor stopped,
    /// optionally restricted to one tenant.
    async fn list_active_bots(&self, tenant: Option<TenantId>) -> Result<Vec<BotDefinition>>;

    async fn get_bot(&self, bot_id: BotId) -> Result<Option<BotDefinition>>;

    /// Insert or replace a bot definition.
    async fn upsert_bot(&self, bot: &BotDefinition) -> Result<()>;

    /// Record a lifecycle transition with an optional reason.
    async fn set_bot_status(
        &self,
        bot_id: BotId,
        status: BotStatus,
        is_active: bool,
        reason: Option<String>,
    ) -> Result<()>;

    /// Append a snapshot; the latest by timestamp is authoritative.
    async fn update_bot_state(&self, bot_id: BotId, state: &BotState) -> Result<()>;

    async fn latest_state(&self, bot_id: BotId) -> Result<Option<BotState>>;

    async fn append_signal(&self, signal: &Signal) -> Result<()>;

    /// Flip a signal to executed. Idempotent; never flips back.
    async fn mark_signal_executed(&self, signal_id: Uuid, executed_at: DateTime<Utc>) -> Result<()>;

    async fn signals_for(&self, bot_id: BotId) -> Result<Vec<Signal>>;
}

#[async_trait]
pub trait SecretsProvider: Send + Sync {
    /// `Error::MissingCredentials` when the tenant has no key for the exchange.
    async fn get_credentials(&self, tenant: TenantId, exchange: &str) -> Result<Credentials>;
}
