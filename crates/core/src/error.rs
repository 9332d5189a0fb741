use std::fmt::{self, Display, Formatter};

/// The error taxonomy shared by the edge and the agent.
///
/// Each variant corresponds to one failure mode named in the design: most
/// are recoverable at the scope of a single exchange or a single channel
/// reconnect attempt, never the whole process.
#[derive(Debug)]
pub enum AetherError {
    /// Agent configuration is missing a required field or malformed.
    ConfigInvalid(String),
    /// The underlying WebSocket transport closed unexpectedly.
    ChannelDown(String),
    /// A second agent attempted to attach while one was already live.
    SingletonConflict,
    /// A frame failed to decode, or decoded with a semantically invalid id.
    MalformedFrame(String),
    /// A response frame arrived for an id with no pending exchange.
    UnknownId(u64),
    /// The 10-minute per-exchange deadline elapsed.
    ExchangeTimeout,
    /// The agent's loopback HTTP dispatch failed.
    OriginFailure(String),
    /// The public HTTP client disconnected while its exchange was pending.
    ClientCancelled,
}

impl Display for AetherError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigInvalid(msg) => write!(f, "invalid configuration: {msg}"),
            Self::ChannelDown(msg) => write!(f, "channel down: {msg}"),
            Self::SingletonConflict => write!(f, "only one client at once"),
            Self::MalformedFrame(msg) => write!(f, "malformed frame: {msg}"),
            Self::UnknownId(id) => write!(f, "unknown exchange id: {id}"),
            Self::ExchangeTimeout => write!(f, "exchange timed out"),
            Self::OriginFailure(msg) => write!(f, "origin request failed: {msg}"),
            Self::ClientCancelled => write!(f, "client cancelled"),
        }
    }
}

impl std::error::Error for AetherError {}
