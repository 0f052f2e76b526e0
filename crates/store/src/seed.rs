use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use common::{BotDefinition, BotDirectory, BotId, Error, Result, TenantId, TradingMode};

/// Bot seed file (TOML), upserted into the directory at startup.
///
/// Example `config/bots.toml`:
/// ```toml
/// [[bot]]
/// id = "6f1c2a4e-8a55-4a8b-9d2e-0d6c3c1f4a10"
/// name = "BTC martingale"
/// exchange = "bingx"
/// symbol = "BTC/USDT"
/// strategy = "martingale"
///
/// [bot.params]
/// baseQuantity = 0.001
/// multiplier = 2.0
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SeedFile {
    #[serde(rename = "bot", default)]
    pub bots: Vec<BotSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotSeed {
    /// Stable id so restarts update the same bot.
    pub id: Uuid,
    /// Defaults to the worker's tenant.
    pub tenant_id: Option<TenantId>,
    pub name: String,
    pub exchange: String,
    pub symbol: String,
    pub strategy: String,
    #[serde(default)]
    pub mode: TradingMode,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Strategy parameters, passed through as the bot's config blob.
    #[serde(default)]
    pub params: toml::Table,
}

fn default_active() -> bool {
    true
}

impl SeedFile {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("bot seed file: {e}")))
    }

    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|e| Error::Config(format!("{path}: {e}")))
    }
}

impl BotSeed {
    fn definition(&self, default_tenant: TenantId) -> Result<BotDefinition> {
        let mut bot = BotDefinition::new(
            self.tenant_id.unwrap_or(default_tenant),
            &self.name,
            &self.exchange,
            &self.symbol,
            &self.strategy,
        );
        bot.id = self.id;
        bot.mode = self.mode;
        bot.is_active = self.active;
        bot.config = serde_json::to_value(&self.params)?;
        Ok(bot)
    }
}

/// Upsert every seeded bot. Lifecycle fields of bots that already exist
/// (status, last error, creation time) are preserved so a restart does not
/// clear a suspension.
pub async fn seed_bots(
    directory: &dyn BotDirectory,
    seeds: &SeedFile,
    default_tenant: TenantId,
) -> Result<Vec<BotId>> {
    let mut ids = Vec::with_capacity(seeds.bots.len());
    for seed in &seeds.bots {
        let mut bot = seed.definition(default_tenant)?;
        if let Some(existing) = directory.get_bot(bot.id).await? {
            bot.status = existing.status;
            bot.last_error = existing.last_error;
            bot.created_at = existing.created_at;
            bot.is_active = seed.active && existing.is_active;
        }
        directory.upsert_bot(&bot).await?;
        info!(bot_id = %bot.id, name = %bot.name, exchange = %bot.exchange, symbol = %bot.symbol, "Seeded bot");
        ids.push(bot.id);
    }
    Ok(ids)
}
