//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, statistics and timing.
//!
//! ## Components
//! - **Crypto**: XChaCha20-Poly1305 AEAD for encrypted payloads
//! - **Logging**: `tracing-subscriber` setup driven by [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: per-connection atomic counters
//! - **Timeout**: timeout defaults and async wrappers
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom) for nonces
//! - Memory zeroing for key material (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{ConnectionStats, StatsSnapshot};
