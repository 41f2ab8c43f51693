use crate::signal::kind::SignalKind;
use smol_str::SmolStr;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the [`Transport`](crate::transport::Transport) on its `error` channel.
///
/// Only [`TransportError::ReconnectExhausted`] is terminal, every other variant either feeds the
/// reconnect policy or is reported and dropped.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {detail}")]
    Connect { url: String, detail: String },

    #[error("connection attempt to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },

    #[error("no data received for {idle:?}, treating connection as dead")]
    ReadTimeout { idle: Duration },

    #[error("connection closed uncleanly (code: {code:?}): {reason}")]
    UncleanClose { code: Option<u16>, reason: String },

    #[error("WebSocket error: {0}")]
    Socket(String),

    #[error("failed to parse inbound frame: {0}")]
    Parse(String),

    #[error("server error on {event}: {message}")]
    Protocol { event: SmolStr, message: String },

    #[error("failed to normalise {event}: {source}")]
    Normalize {
        event: SmolStr,
        source: NormalizeError,
    },

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl TransportError {
    /// Determine if an error stops automatic recovery, requiring an explicit
    /// [`Transport::connect`](crate::transport::Transport::connect) to resume.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportError::ReconnectExhausted { .. })
    }

    /// Close code reported by the peer, where one is available.
    pub fn code(&self) -> Option<u16> {
        match self {
            TransportError::UncleanClose { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Socket(value.to_string())
    }
}

/// Synchronous rejections from [`SubscriptionManager::subscribe`](crate::subscription::SubscriptionManager::subscribe).
///
/// No protocol message is sent when one of these is returned.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum SubscriptionError {
    #[error("cannot subscribe with an empty symbol list")]
    EmptySymbols,

    #[error("cannot subscribe with an empty timeframe list")]
    EmptyTimeframes,

    #[error("cannot subscribe while the transport is not connected")]
    NotConnected,
}

/// Failures converting a raw payload into a canonical [`Signal`](crate::signal::Signal).
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum NormalizeError {
    #[error("{kind} payload is missing required field: {field}")]
    MissingField {
        kind: SignalKind,
        field: &'static str,
    },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid {kind} payload: {detail}")]
    InvalidPayload { kind: SignalKind, detail: String },
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid server url {url}: {detail}")]
    InvalidUrl { url: String, detail: String },

    #[error("transport preference list must include websocket, got: {0:?}")]
    UnsupportedTransports(Vec<String>),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SnapshotError {
    #[error("snapshot request failed: {0}")]
    Request(String),

    #[error("snapshot endpoint returned HTTP {0}")]
    Status(u16),

    #[error("failed to decode snapshot: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for SnapshotError {
    fn from(value: reqwest::Error) -> Self {
        match value.status() {
            Some(status) => Self::Status(status.as_u16()),
            None if value.is_decode() => Self::Decode(value.to_string()),
            None => Self::Request(value.to_string()),
        }
    }
}
