//! BingX spot exchange.

mod adapter;
pub mod models;

pub use adapter::{BingXAdapter, BingXFactory, BINGX_BASE_URL, BINGX_TESTNET_URL};
