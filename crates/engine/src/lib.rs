pub mod backoff;
pub mod balances;
pub mod bingx;
pub mod executor;
pub mod lifecycle;
pub mod registry;
pub mod rest;
pub mod scheduler;
pub mod tick;

pub use backoff::Backoff;
pub use balances::{AccountSummary, BalancePoller};
pub use bingx::{BingXAdapter, BingXFactory};
pub use executor::{OrderExecutor, Reconciliation, Submission};
pub use lifecycle::{BotCommand, BotHealth, EngineHandle};
pub use registry::ExchangeRegistry;
pub use scheduler::{Scheduler, SchedulerConfig, TickError, TickOutcome, TickReport};
pub use tick::{ChannelTicks, IntervalTicks, TickSender, TickSource};
