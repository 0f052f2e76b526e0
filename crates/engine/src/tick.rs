use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Drives the scheduler. `None` means the source is exhausted.
///
/// Implementations must be cancel safe: the scheduler polls `next_tick`
/// inside `select!`.
#[async_trait]
pub trait TickSource: Send {
    async fn next_tick(&mut self) -> Option<DateTime<Utc>>;
}

/// Wall-clock ticks. Ticks missed while the coordinator was busy are skipped,
/// not burst.
pub struct IntervalTicks {
    interval: Interval,
}

impl IntervalTicks {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

#[async_trait]
impl TickSource for IntervalTicks {
    async fn next_tick(&mut self) -> Option<DateTime<Utc>> {
        self.interval.tick().await;
        Some(Utc::now())
    }
}

/// Ticks pushed by hand, for tests and manual triggering.
pub struct ChannelTicks {
    rx: mpsc::Receiver<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct TickSender {
    tx: mpsc::Sender<DateTime<Utc>>,
}

impl ChannelTicks {
    pub fn channel(buffer: usize) -> (TickSender, ChannelTicks) {
        let (tx, rx) = mpsc::channel(buffer);
        (TickSender { tx }, ChannelTicks { rx })
    }
}

impl TickSender {
    /// Returns `false` once the receiving side is gone.
    pub async fn tick(&self) -> bool {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, at: DateTime<Utc>) -> bool {
        self.tx.send(at).await.is_ok()
    }
}

#[async_trait]
impl TickSource for ChannelTicks {
    async fn next_tick(&mut self) -> Option<DateTime<Utc>> {
        self.rx.recv().await
    }
}
