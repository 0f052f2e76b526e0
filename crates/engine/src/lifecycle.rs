use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::info;

use common::{BotId, BotStatus, Error, Result};

/// Operator commands, applied by the scheduler's coordinator.
#[derive(Debug)]
pub enum BotCommand {
    Stop(BotId, oneshot::Sender<Result<()>>),
    Start(BotId, oneshot::Sender<Result<()>>),
    Reactivate(BotId, oneshot::Sender<Result<()>>),
}

/// Last known health of one bot, as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotHealth {
    pub status: BotStatus,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_tick: Option<DateTime<Utc>>,
}

impl BotHealth {
    pub fn new(status: BotStatus) -> Self {
        Self {
            status,
            consecutive_failures: 0,
            last_error: None,
            last_tick: None,
        }
    }
}

pub(crate) type HealthMap = Arc<RwLock<HashMap<BotId, BotHealth>>>;

/// Cloneable handle for operators (binary, tests) to steer a running scheduler.
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<BotCommand>,
    health: HealthMap,
    shutdown: Arc<watch::Sender<bool>>,
}

impl EngineHandle {
    pub(crate) fn new(
        command_tx: mpsc::Sender<BotCommand>,
        health: HealthMap,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            command_tx,
            health,
            shutdown,
        }
    }

    /// Park a bot until `start_bot`.
    pub async fn stop_bot(&self, bot_id: BotId) -> Result<()> {
        self.send(|reply| BotCommand::Stop(bot_id, reply)).await
    }

    /// Resume a stopped bot.
    pub async fn start_bot(&self, bot_id: BotId) -> Result<()> {
        self.send(|reply| BotCommand::Start(bot_id, reply)).await
    }

    /// Clear a suspension left by the circuit breaker or a configuration error.
    pub async fn reactivate_bot(&self, bot_id: BotId) -> Result<()> {
        self.send(|reply| BotCommand::Reactivate(bot_id, reply)).await
    }

    pub async fn health(&self) -> HashMap<BotId, BotHealth> {
        self.health.read().await.clone()
    }

    pub async fn bot_health(&self, bot_id: BotId) -> Option<BotHealth> {
        self.health.read().await.get(&bot_id).cloned()
    }

    /// Ask the scheduler and every task watching [`shutdown_signal`](Self::shutdown_signal) to stop.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        let _ = self.shutdown.send(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    async fn send<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> BotCommand,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::Other("scheduler is not running".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Other("scheduler dropped the command".into()))?
    }
}
