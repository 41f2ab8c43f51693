//! Composition root of the ingestion core.
//!
//! [`SignalClient`] wires one [`Transport`] to the router, normaliser, store, bus and
//! subscription manager. Every inbound message is processed synchronously on the connection
//! task, in arrival order: route, normalise, insert, publish.

use crate::{
    bus::SignalBus,
    config::FeedConfig,
    error::{ConfigError, NormalizeError, SnapshotError, TransportError},
    normalizer::Normalizer,
    router::{EventRouter, Route},
    signal::{kind::SignalKind, time::now_ms},
    snapshot::SnapshotClient,
    store::{SignalStore, StoreHandle},
    subscription::SubscriptionManager,
    transport::{Channel, ListenerId, RawMessage, Transport, TransportEvent},
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Route, normalise and store one raw message at a time.
#[derive(Debug, Clone)]
struct Pipeline {
    router: Arc<EventRouter>,
    normalizer: Normalizer,
    store: StoreHandle,
    bus: SignalBus,
}

impl Pipeline {
    /// Feed `payload` through every route it maps to. Returns the number of store mutations
    /// and the normalisation failures, one route failing does not prevent the others.
    fn ingest(&self, routes: &[Route], payload: &Value, received_at: i64) -> (usize, Vec<NormalizeError>) {
        let mut stored = 0;
        let mut errors = Vec::new();

        for route in routes {
            let signals = match self.normalizer.normalize(route, payload, received_at) {
                Ok(signals) => signals,
                Err(error) => {
                    errors.push(error);
                    continue;
                }
            };

            for signal in signals {
                let outcome = self.store.write().insert_or_update(signal.clone());
                if outcome.is_mutation() {
                    self.bus.publish(&signal);
                    stored += 1;
                }
            }
        }

        (stored, errors)
    }

    fn on_message(&self, transport: &Transport, message: &RawMessage) {
        let routes = self.router.route(&message.event);
        if routes.is_empty() {
            return;
        }

        let (stored, errors) = self.ingest(&routes, &message.data, now_ms());
        debug!(event = %message.event, stored, "ingested message");

        for error in errors {
            warn!(event = %message.event, %error, "dropping malformed payload");
            transport.report(TransportError::Normalize {
                event: message.event.clone(),
                source: error,
            });
        }
    }
}

#[derive(Debug)]
pub struct SignalClient {
    config: FeedConfig,
    transport: Transport,
    pipeline: Pipeline,
    subscriptions: SubscriptionManager,
    snapshot: Option<SnapshotClient>,
    listener: ListenerId,
}

impl SignalClient {
    pub fn new(config: FeedConfig) -> Result<Self, ConfigError> {
        Self::with_router(config, EventRouter::default())
    }

    /// Build a client with a custom alias table.
    pub fn with_router(config: FeedConfig, router: EventRouter) -> Result<Self, ConfigError> {
        let transport = Transport::new(config.transport.clone())?;
        let store = StoreHandle::new(SignalStore::new(config.caps));
        let snapshot = config
            .snapshot_url
            .as_deref()
            .map(SnapshotClient::new)
            .transpose()?;

        let pipeline = Pipeline {
            router: Arc::new(router),
            normalizer: Normalizer::new(config.normalizer),
            store: store.clone(),
            bus: SignalBus::new(),
        };

        // The listener is owned by the transport, so it must not keep it alive
        let listener = {
            let pipeline = pipeline.clone();
            let weak = transport.downgrade();
            transport.on(Channel::AnyMessage, move |event| {
                if let (TransportEvent::Message(message), Some(transport)) = (event, weak.upgrade())
                {
                    pipeline.on_message(&transport, message);
                }
            })
        };

        let subscriptions = SubscriptionManager::new(
            transport.clone(),
            store,
            config.default_subscription.clone(),
        );

        Ok(Self {
            config,
            transport,
            pipeline,
            subscriptions,
            snapshot,
            listener,
        })
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn store(&self) -> &StoreHandle {
        &self.pipeline.store
    }

    pub fn bus(&self) -> &SignalBus {
        &self.pipeline.bus
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Start the connection. The default subscription, if configured, is sent once connected.
    pub fn connect(&self) {
        self.transport.connect();
    }

    /// Register an `error` channel listener.
    pub fn on_error<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.transport.on(Channel::Error, move |event| {
            if let TransportEvent::Error(error) = event {
                handler(error)
            }
        })
    }

    /// Ingest payloads obtained out of band (eg/ a REST snapshot) as if they arrived as `event`.
    /// Returns the number of signals stored.
    pub fn seed(&self, event: &str, payloads: &[Value]) -> usize {
        let routes = self.pipeline.router.route(event);
        let received_at = now_ms();

        payloads
            .iter()
            .map(|payload| {
                let (stored, errors) = self.pipeline.ingest(&routes, payload, received_at);
                for error in errors {
                    warn!(event, %error, "dropping malformed seed payload");
                }
                stored
            })
            .sum()
    }

    /// Seed regime history for `symbol` on `timeframe` from the snapshot endpoint.
    pub async fn seed_regime_history(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<usize, SnapshotError> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(0);
        };

        let points = snapshot.regime_history(symbol, timeframe, limit).await?;
        let stored = self.seed("regime:update", &points);
        debug!(symbol, timeframe, fetched = points.len(), stored, "seeded regime history");
        Ok(stored)
    }

    /// Disconnect, detach every listener this client registered and drop all stored signals.
    pub fn shutdown(&self) {
        self.transport.disconnect();
        self.subscriptions.detach();
        self.transport.off(self.listener);
        self.pipeline.store.write().clear_all();
    }

    /// Kinds currently holding data, for diagnostics.
    pub fn active_kinds(&self) -> Vec<SignalKind> {
        let mut kinds: Vec<_> = self
            .store()
            .read()
            .stream_keys()
            .into_iter()
            .map(|key| key.kind)
            .collect();
        kinds.dedup();
        kinds
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        self.transport.disconnect();
        self.subscriptions.detach();
        self.transport.off(self.listener);
    }
}
