//! Implementations of the bot directory and secrets provider.

pub mod memory;
pub mod secrets;
pub mod seed;
pub mod sqlite;

pub use memory::MemoryStore;
pub use secrets::EnvSecrets;
pub use seed::{seed_bots, BotSeed, SeedFile};
pub use sqlite::SqliteStore;
