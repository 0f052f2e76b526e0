use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use common::{
    BotDefinition, BotDirectory, BotId, BotState, BotStatus, Credentials, Error, Result,
    SecretsProvider, Signal, TenantId,
};

const BOT_COLUMNS: &str = "id, tenant_id, name, exchange, symbol, strategy, mode, config, \
                           is_active, status, last_error, created_at";
const SIGNAL_COLUMNS: &str =
    "id, bot_id, symbol, side, quantity, price, reason, is_executed, executed_at, created_at";

/// Durable store on SQLite. Timestamps are stored as epoch milliseconds,
/// JSON documents as text.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) and migrate the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new().max_connections(5);
        if url.contains(":memory:") {
            // Each connection to an in-memory database is a separate database,
            // so keep exactly one alive for the life of the pool.
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        info!("Database ready");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }

    /// Store or replace a tenant's key for an exchange.
    pub async fn add_credentials(&self, tenant: TenantId, exchange: &str, credentials: &Credentials) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO exchange_api_keys
                (tenant_id, exchange, api_key, api_secret, passphrase, is_testnet, is_active, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)
            ON CONFLICT (tenant_id, exchange) DO UPDATE SET
                api_key = excluded.api_key,
                api_secret = excluded.api_secret,
                passphrase = excluded.passphrase,
                is_testnet = excluded.is_testnet,
                is_active = 1
            "#,
        )
        .bind(tenant.to_string())
        .bind(exchange.to_lowercase())
        .bind(&credentials.api_key)
        .bind(&credentials.api_secret)
        .bind(&credentials.passphrase)
        .bind(credentials.is_testnet)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn decode_err(e: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::Database(sqlx::Error::Decode(Box::new(e)))
}

fn uuid_col(row: &SqliteRow, col: &str) -> Result<Uuid> {
    let raw: String = row.try_get(col)?;
    Uuid::parse_str(&raw).map_err(decode_err)
}

fn millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::InvalidState(format!("timestamp out of range: {ms}")))
}

fn bot_from_row(row: &SqliteRow) -> Result<BotDefinition> {
    let config: String = row.try_get("config")?;
    Ok(BotDefinition {
        id: uuid_col(row, "id")?,
        tenant_id: uuid_col(row, "tenant_id")?,
        name: row.try_get("name")?,
        exchange: row.try_get("exchange")?,
        symbol: row.try_get("symbol")?,
        strategy: row.try_get("strategy")?,
        mode: row.try_get("mode")?,
        config: serde_json::from_str(&config)?,
        is_active: row.try_get("is_active")?,
        status: row.try_get("status")?,
        last_error: row.try_get("last_error")?,
        created_at: millis(row.try_get("created_at")?)?,
    })
}

fn signal_from_row(row: &SqliteRow) -> Result<Signal> {
    let executed_at: Option<i64> = row.try_get("executed_at")?;
    Ok(Signal {
        id: uuid_col(row, "id")?,
        bot_id: uuid_col(row, "bot_id")?,
        symbol: row.try_get("symbol")?,
        side: row.try_get("side")?,
        quantity: row.try_get("quantity")?,
        price: row.try_get("price")?,
        reason: row.try_get("reason")?,
        is_executed: row.try_get("is_executed")?,
        executed_at: executed_at.map(millis).transpose()?,
        created_at: millis(row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl BotDirectory for SqliteStore {
    async fn list_active_bots(&self, tenant: Option<TenantId>) -> Result<Vec<BotDefinition>> {
        let sql = format!(
            "SELECT {BOT_COLUMNS} FROM bots \
             WHERE is_active = 1 AND status NOT IN ('suspended', 'stopped') \
               AND (?1 IS NULL OR tenant_id = ?1) \
             ORDER BY created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant.map(|t| t.to_string()))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(bot_from_row).collect()
    }

    async fn get_bot(&self, bot_id: BotId) -> Result<Option<BotDefinition>> {
        let sql = format!("SELECT {BOT_COLUMNS} FROM bots WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(bot_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bot_from_row).transpose()
    }

    async fn upsert_bot(&self, bot: &BotDefinition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bots
                (id, tenant_id, name, exchange, symbol, strategy, mode, config,
                 is_active, status, last_error, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT (id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                name = excluded.name,
                exchange = excluded.exchange,
                symbol = excluded.symbol,
                strategy = excluded.strategy,
                mode = excluded.mode,
                config = excluded.config,
                is_active = excluded.is_active,
                status = excluded.status,
                last_error = excluded.last_error
            "#,
        )
        .bind(bot.id.to_string())
        .bind(bot.tenant_id.to_string())
        .bind(&bot.name)
        .bind(&bot.exchange)
        .bind(&bot.symbol)
        .bind(&bot.strategy)
        .bind(bot.mode)
        .bind(serde_json::to_string(&bot.config)?)
        .bind(bot.is_active)
        .bind(bot.status)
        .bind(&bot.last_error)
        .bind(bot.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_bot_status(
        &self,
        bot_id: BotId,
        status: BotStatus,
        is_active: bool,
        reason: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE bots SET status = ?1, is_active = ?2, last_error = ?3 WHERE id = ?4")
            .bind(status)
            .bind(is_active)
            .bind(reason)
            .bind(bot_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("bot {bot_id}")));
        }
        Ok(())
    }

    async fn update_bot_state(&self, bot_id: BotId, state: &BotState) -> Result<()> {
        let pending = state.pending.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query("INSERT INTO bot_states (bot_id, document, pending, timestamp) VALUES (?1, ?2, ?3, ?4)")
            .bind(bot_id.to_string())
            .bind(serde_json::to_string(&state.document)?)
            .bind(pending)
            .bind(state.timestamp.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_state(&self, bot_id: BotId) -> Result<Option<BotState>> {
        let row = sqlx::query(
            "SELECT document, pending, timestamp FROM bot_states \
             WHERE bot_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .bind(bot_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let document: String = row.try_get("document")?;
        let pending: Option<String> = row.try_get("pending")?;
        Ok(Some(BotState {
            bot_id,
            document: serde_json::from_str(&document)?,
            pending: pending.as_deref().map(serde_json::from_str).transpose()?,
            timestamp: millis(row.try_get("timestamp")?)?,
        }))
    }

    async fn append_signal(&self, signal: &Signal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO signals
                (id, bot_id, symbol, side, quantity, price, reason, is_executed, executed_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(signal.id.to_string())
        .bind(signal.bot_id.to_string())
        .bind(&signal.symbol)
        .bind(signal.side)
        .bind(signal.quantity)
        .bind(signal.price)
        .bind(&signal.reason)
        .bind(signal.is_executed)
        .bind(signal.executed_at.map(|t| t.timestamp_millis()))
        .bind(signal.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_signal_executed(&self, signal_id: Uuid, executed_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE signals SET is_executed = 1, executed_at = ?1 WHERE id = ?2 AND is_executed = 0",
        )
        .bind(executed_at.timestamp_millis())
        .bind(signal_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM signals WHERE id = ?1")
                .bind(signal_id.to_string())
                .fetch_one(&self.pool)
                .await?;
            if exists == 0 {
                return Err(Error::NotFound(format!("signal {signal_id}")));
            }
        }
        Ok(())
    }

    async fn signals_for(&self, bot_id: BotId) -> Result<Vec<Signal>> {
        let sql = format!("SELECT {SIGNAL_COLUMNS} FROM signals WHERE bot_id = ?1 ORDER BY created_at, rowid");
        let rows = sqlx::query(&sql)
            .bind(bot_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(signal_from_row).collect()
    }
}

#[async_trait]
impl SecretsProvider for SqliteStore {
    async fn get_credentials(&self, tenant: TenantId, exchange: &str) -> Result<Credentials> {
        let row = sqlx::query(
            "SELECT api_key, api_secret, passphrase, is_testnet FROM exchange_api_keys \
             WHERE tenant_id = ?1 AND exchange = ?2 AND is_active = 1",
        )
        .bind(tenant.to_string())
        .bind(exchange.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(Error::MissingCredentials {
                tenant: tenant.to_string(),
                exchange: exchange.to_string(),
            });
        };
        Ok(Credentials {
            api_key: row.try_get("api_key")?,
            api_secret: row.try_get("api_secret")?,
            passphrase: row.try_get("passphrase")?,
            is_testnet: row.try_get("is_testnet")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::{OrderRequest, OrderSide, PendingOrder};
    use serde_json::json;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn bot_round_trips_and_filters_by_status() {
        let store = store().await;
        let tenant = Uuid::new_v4();
        let mut bot = BotDefinition::new(tenant, "grid", "bingx", "ETH/USDT", "martingale");
        bot.config = json!({ "baseQuantity": 0.01 });
        store.upsert_bot(&bot).await.unwrap();

        let loaded = store.get_bot(bot.id).await.unwrap().unwrap();
        assert_eq!(loaded.config, bot.config);
        assert_eq!(loaded.status, BotStatus::Idle);
        assert_eq!(loaded.created_at.timestamp_millis(), bot.created_at.timestamp_millis());
        assert_eq!(store.list_active_bots(Some(tenant)).await.unwrap().len(), 1);
        assert!(store.list_active_bots(Some(Uuid::new_v4())).await.unwrap().is_empty());

        store
            .set_bot_status(bot.id, BotStatus::Suspended, false, Some("bad key".into()))
            .await
            .unwrap();
        assert!(store.list_active_bots(None).await.unwrap().is_empty());
        let loaded = store.get_bot(bot.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_error.as_deref(), Some("bad key"));

        let missing = store.set_bot_status(Uuid::new_v4(), BotStatus::Stopped, false, None).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn latest_state_wins_by_timestamp_then_insertion() {
        let store = store().await;
        let bot_id = Uuid::new_v4();
        let base = BotState::initial(bot_id);

        let mut newer = base.clone();
        newer.document = json!({ "level": 2 });
        let mut older = base.clone();
        older.document = json!({ "level": 1 });
        older.timestamp = base.timestamp - Duration::seconds(30);
        store.update_bot_state(bot_id, &newer).await.unwrap();
        store.update_bot_state(bot_id, &older).await.unwrap();
        assert_eq!(store.latest_state(bot_id).await.unwrap().unwrap().document, json!({ "level": 2 }));

        // Same millisecond: the later write wins.
        let mut same = newer.clone();
        same.document = json!({ "level": 3 });
        same.pending = Some(PendingOrder {
            signal_id: Uuid::new_v4(),
            request: OrderRequest {
                symbol: "ETH/USDT".into(),
                side: OrderSide::Buy,
                quantity: 0.5,
                price: None,
                client_order_id: "bf1".into(),
            },
            proposed: json!({ "level": 4 }),
            submitted_at: Utc::now(),
        });
        store.update_bot_state(bot_id, &same).await.unwrap();
        let latest = store.latest_state(bot_id).await.unwrap().unwrap();
        assert_eq!(latest.document, json!({ "level": 3 }));
        assert_eq!(latest.pending.unwrap().proposed, json!({ "level": 4 }));
    }

    #[tokio::test]
    async fn signals_are_marked_executed_once() {
        let store = store().await;
        let signal = Signal::new(Uuid::new_v4(), "BTC/USDT", OrderSide::Sell, 0.25, Some(64_000.0), "tp");
        store.append_signal(&signal).await.unwrap();

        let at = Utc::now();
        store.mark_signal_executed(signal.id, at).await.unwrap();
        store
            .mark_signal_executed(signal.id, at + Duration::seconds(5))
            .await
            .unwrap();

        let stored = store.signals_for(signal.bot_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_executed);
        assert_eq!(stored[0].price, Some(64_000.0));
        assert_eq!(stored[0].executed_at.unwrap().timestamp_millis(), at.timestamp_millis());

        let missing = store.mark_signal_executed(Uuid::new_v4(), at).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn credentials_are_scoped_to_tenant_and_exchange() {
        let store = store().await;
        let tenant = Uuid::new_v4();
        let mut creds = Credentials::new("key", "secret");
        creds.is_testnet = true;
        store.add_credentials(tenant, "BingX", &creds).await.unwrap();

        let loaded = store.get_credentials(tenant, "bingx").await.unwrap();
        assert_eq!(loaded.api_key, "key");
        assert!(loaded.is_testnet);
        assert!(matches!(
            store.get_credentials(tenant, "paper").await,
            Err(Error::MissingCredentials { .. })
        ));
    }
}
