pub mod config;
pub mod error;
pub mod exchange;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{Error, ExchangeError, Result};
pub use exchange::{ExchangeAdapter, ExchangeFactory};
pub use store::{BotDirectory, SecretsProvider};
pub use types::*;
