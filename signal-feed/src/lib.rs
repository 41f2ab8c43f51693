/// Signal Feed - real-time market signal ingestion
///
/// Connects to a push-event signal server and keeps bounded, de-duplicated, queryable stores of
/// the signals it publishes:
/// - transport: reconnecting WebSocket connection with exponential backoff and listener channels
/// - router / normalizer: event name aliasing and payload normalisation into [`Signal`]s
/// - store: per-stream capped rings plus latest-per-key indices
/// - subscription: `regime:*` subscribe, acknowledge and resubscribe-on-reconnect handshake
/// - selector / highlight: read-side queries and transient change marks for rendered rows
pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod highlight;
pub mod normalizer;
pub mod router;
pub mod selector;
pub mod signal;
pub mod snapshot;
pub mod store;
pub mod subscription;
pub mod transport;

// Re-export commonly used types for convenience
pub use bus::{SignalBus, SubscriberId};
pub use client::SignalClient;
pub use config::FeedConfig;
pub use error::{ConfigError, NormalizeError, SnapshotError, SubscriptionError, TransportError};
pub use signal::{Signal, SignalData, kind::SignalKind};
pub use store::{SignalStore, StoreCaps, StoreHandle, StreamKey};
pub use subscription::{RegimeSubscription, SubscriptionManager};
pub use transport::{ConnectionStatus, Transport, TransportConfig};

/// Install a `tracing` subscriber filtered by `RUST_LOG`, defaulting to `info`.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
