//! Shared correlation fabric for the aether reverse HTTP tunnel.
//!
//! This crate carries no networking: it is the frame wire format and the
//! edge-side exchange table, consumed by both the `aether-edge` and
//! `aether-agent` binaries.

pub mod error;
pub mod exchange;
pub mod frame;

pub use error::AetherError;
pub use exchange::ExchangeTable;
pub use frame::{Headers, RequestFrame, ResponseFrame};

/// The fixed reconnect backoff schedule, in milliseconds, used by the
/// agent's channel supervisor. Kept as an explicit bounded sequence rather
/// than exponential-backoff-with-jitter to match observed behavior.
pub const RECONNECT_BACKOFF_MS: &[u64] = &[50, 100, 250, 500, 1000, 2000, 3000];

/// The per-exchange deadline enforced by the edge handler.
pub const EXCHANGE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

/// The default tunnel handshake path.
pub const HANDSHAKE_PATH: &str = "/aether/client/ws";
