//! Signed HTTP plumbing shared by exchange adapters.

mod client;
mod error;
mod limiter;
mod signing;

pub use client::{RestConfig, SignedClient};
pub use error::{RestError, RestErrorKind};
pub use limiter::RateLimiter;
pub use signing::{canonical_query, sign, signed_query};
