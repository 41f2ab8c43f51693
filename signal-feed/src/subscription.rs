//! Regime subscription protocol.
//!
//! The server only pushes regime updates for the symbol/timeframe set a client subscribed to,
//! and forgets it whenever the connection drops. [`SubscriptionManager`] tracks that set and
//! re-issues it on every transport `connect`.

use crate::{
    error::{SubscriptionError, TransportError},
    signal::kind::SignalKind,
    store::StoreHandle,
    transport::{Channel, ListenerId, Transport, TransportEvent},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use smol_str::SmolStr;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub const SUBSCRIBE: &str = "regime:subscribe";
pub const UNSUBSCRIBE: &str = "regime:unsubscribe";
pub const SUBSCRIBED: &str = "regime:subscribed";
pub const UNSUBSCRIBED: &str = "regime:unsubscribed";
pub const CONNECTED: &str = "regime:connected";
pub const ERROR: &str = "regime:error";

static NULL: Value = Value::Null;

/// Symbols and timeframes the server streams regime updates for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct RegimeSubscription {
    pub symbols: Vec<SmolStr>,
    pub timeframes: Vec<SmolStr>,
}

impl RegimeSubscription {
    pub fn new<S, T>(symbols: S, timeframes: T) -> Self
    where
        S: IntoIterator,
        S::Item: Into<SmolStr>,
        T: IntoIterator,
        T::Item: Into<SmolStr>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            timeframes: timeframes.into_iter().map(Into::into).collect(),
        }
    }
}

/// `regime:subscribed` acknowledgement.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SubscribedAck {
    symbols: Vec<SmolStr>,
    timeframes: Vec<SmolStr>,
    rooms: Vec<SmolStr>,
}

/// `regime:connected` greeting.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ConnectedGreeting {
    client_id: Option<SmolStr>,
    subscription: Option<RegimeSubscription>,
}

#[derive(Debug, Default)]
struct State {
    /// Set as acknowledged by the server.
    confirmed: Option<RegimeSubscription>,
    /// Last request sent and not yet acknowledged.
    pending: Option<RegimeSubscription>,
    last_error: Option<String>,
    client_id: Option<SmolStr>,
    rooms: Vec<SmolStr>,
    ack_listener: Option<ListenerId>,
    listeners: Vec<ListenerId>,
}

#[derive(Debug)]
struct Inner {
    transport: Transport,
    store: StoreHandle,
    default: Option<RegimeSubscription>,
    state: Mutex<State>,
}

/// Tracks the regime subscription and keeps it alive across reconnects.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    /// Create a manager and attach its protocol listeners to `transport`.
    pub fn new(
        transport: Transport,
        store: StoreHandle,
        default: Option<RegimeSubscription>,
    ) -> Self {
        let manager = Self {
            inner: Arc::new(Inner {
                transport,
                store,
                default,
                state: Mutex::new(State::default()),
            }),
        };
        manager.attach();
        manager
    }

    fn attach(&self) {
        let transport = &self.inner.transport;
        let listeners = vec![
            transport.on(
                Channel::Connect,
                self.handler(|manager, _| {
                    manager.resubscribe();
                }),
            ),
            transport.on(
                Channel::message(CONNECTED),
                self.handler(Self::on_connected),
            ),
            transport.on(Channel::message(ERROR), self.handler(Self::on_error)),
            transport.on(
                Channel::message(UNSUBSCRIBED),
                self.handler(Self::on_unsubscribed),
            ),
        ];

        self.inner.state.lock().listeners = listeners;
    }

    /// Wrap `f` in a transport listener holding only a weak reference to the manager.
    fn handler<F>(&self, f: F) -> impl Fn(&TransportEvent) + Send + Sync + 'static
    where
        F: Fn(&SubscriptionManager, &Value) + Send + Sync + 'static,
    {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let data = match event {
                TransportEvent::Message(message) => &message.data,
                _ => &NULL,
            };
            f(&SubscriptionManager { inner }, data)
        }
    }

    /// Remove every listener this manager registered on the transport.
    pub fn detach(&self) {
        let (listeners, ack) = {
            let mut state = self.inner.state.lock();
            (std::mem::take(&mut state.listeners), state.ack_listener.take())
        };

        for id in listeners.into_iter().chain(ack) {
            self.inner.transport.off(id);
        }
    }

    /// Request regime updates for `symbols` across `timeframes`.
    ///
    /// Rejected without sending anything if either list is empty or the transport is not
    /// connected. The tracked subscription is replaced by the server-confirmed set once
    /// `regime:subscribed` arrives.
    pub fn subscribe<S, T>(&self, symbols: S, timeframes: T) -> Result<(), SubscriptionError>
    where
        S: IntoIterator,
        S::Item: Into<SmolStr>,
        T: IntoIterator,
        T::Item: Into<SmolStr>,
    {
        let request = RegimeSubscription::new(symbols, timeframes);

        let validation = if request.symbols.is_empty() {
            Err(SubscriptionError::EmptySymbols)
        } else if request.timeframes.is_empty() {
            Err(SubscriptionError::EmptyTimeframes)
        } else if !self.inner.transport.is_active() {
            Err(SubscriptionError::NotConnected)
        } else {
            Ok(())
        };

        if let Err(error) = validation {
            warn!(%error, "regime subscription rejected");
            self.inner.state.lock().last_error = Some(error.to_string());
            return Err(error);
        }

        self.send_subscribe(request);
        Ok(())
    }

    /// Leave every regime room and drop all regime entries from the store.
    pub fn unsubscribe(&self) {
        let ack = {
            let mut state = self.inner.state.lock();
            state.confirmed = None;
            state.pending = None;
            state.rooms.clear();
            state.ack_listener.take()
        };
        if let Some(ack) = ack {
            self.inner.transport.off(ack);
        }

        self.inner.transport.emit(UNSUBSCRIBE, Value::Null);
        self.inner.store.write().clear_kind(SignalKind::Regime);
        info!("regime subscription cleared");
    }

    /// Re-issue the last known subscription: confirmed, else pending, else the configured
    /// default. Returns false if there was nothing to send.
    pub fn resubscribe(&self) -> bool {
        match self.target() {
            Some(subscription) => {
                debug!(
                    symbols = subscription.symbols.len(),
                    timeframes = subscription.timeframes.len(),
                    "restoring regime subscription"
                );
                self.send_subscribe(subscription)
            }
            None => false,
        }
    }

    fn target(&self) -> Option<RegimeSubscription> {
        let state = self.inner.state.lock();
        state
            .confirmed
            .clone()
            .or_else(|| state.pending.clone())
            .or_else(|| self.inner.default.clone())
    }

    fn send_subscribe(&self, request: RegimeSubscription) -> bool {
        let weak = Arc::downgrade(&self.inner);
        let ack = self.inner.transport.once(Channel::message(SUBSCRIBED), move |event| {
            if let (Some(inner), TransportEvent::Message(message)) = (weak.upgrade(), event) {
                inner.on_subscribed(&message.data);
            }
        });

        let previous = {
            let mut state = self.inner.state.lock();
            state.pending = Some(request.clone());
            state.last_error = None;
            state.ack_listener.replace(ack)
        };
        if let Some(previous) = previous {
            self.inner.transport.off(previous);
        }

        self.inner.transport.emit(
            SUBSCRIBE,
            json!({ "symbols": request.symbols, "timeframes": request.timeframes }),
        )
    }

    /// Server-confirmed subscription, if any.
    pub fn current(&self) -> Option<RegimeSubscription> {
        self.inner.state.lock().confirmed.clone()
    }

    pub fn pending(&self) -> Option<RegimeSubscription> {
        self.inner.state.lock().pending.clone()
    }

    pub fn rooms(&self) -> Vec<SmolStr> {
        self.inner.state.lock().rooms.clone()
    }

    /// Last subscription failure, cleared by the next successful request.
    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().last_error.clone()
    }

    /// Client id assigned by the server in `regime:connected`.
    pub fn client_id(&self) -> Option<SmolStr> {
        self.inner.state.lock().client_id.clone()
    }

    fn on_connected(&self, data: &Value) {
        let greeting = ConnectedGreeting::deserialize(data).unwrap_or_default();
        debug!(client_id = ?greeting.client_id, subscription = ?greeting.subscription, "regime channel greeting");
        self.inner.state.lock().client_id = greeting.client_id;
    }

    fn on_error(&self, data: &Value) {
        let message = data
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string());

        warn!(%message, "regime subscription error from server");
        self.inner.state.lock().last_error = Some(message.clone());
        self.inner.transport.report(TransportError::Protocol {
            event: SmolStr::new_static(ERROR),
            message,
        });
    }

    fn on_unsubscribed(&self, _: &Value) {
        info!("server confirmed regime unsubscribe");
        let mut state = self.inner.state.lock();
        state.confirmed = None;
        state.rooms.clear();
    }
}

impl Inner {
    fn on_subscribed(&self, data: &Value) {
        let ack = SubscribedAck::deserialize(data).unwrap_or_default();

        let mut state = self.state.lock();
        state.ack_listener = None;
        let pending = state.pending.take().unwrap_or_default();

        let confirmed = RegimeSubscription {
            symbols: if ack.symbols.is_empty() {
                pending.symbols
            } else {
                ack.symbols
            },
            timeframes: if ack.timeframes.is_empty() {
                pending.timeframes
            } else {
                ack.timeframes
            },
        };

        info!(
            symbols = confirmed.symbols.len(),
            timeframes = confirmed.timeframes.len(),
            rooms = ack.rooms.len(),
            "regime subscription confirmed"
        );
        state.rooms = ack.rooms;
        state.confirmed = Some(confirmed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RawMessage, TransportConfig};

    fn manager(default: Option<RegimeSubscription>) -> (Transport, SubscriptionManager) {
        let transport = Transport::new(TransportConfig::default()).unwrap();
        let manager =
            SubscriptionManager::new(transport.clone(), StoreHandle::default(), default);
        (transport, manager)
    }

    fn message(event: &str, data: Value) -> TransportEvent {
        TransportEvent::Message(RawMessage::new(event, data))
    }

    #[test]
    fn test_subscribe_rejections() {
        struct TestCase {
            symbols: Vec<&'static str>,
            timeframes: Vec<&'static str>,
            expected: SubscriptionError,
        }

        let tests = vec![
            TestCase {
                // TC0
                symbols: vec![],
                timeframes: vec!["1m"],
                expected: SubscriptionError::EmptySymbols,
            },
            TestCase {
                // TC1
                symbols: vec!["BTCUSDT"],
                timeframes: vec![],
                expected: SubscriptionError::EmptyTimeframes,
            },
            TestCase {
                // TC2: valid request on a disconnected transport
                symbols: vec!["BTCUSDT"],
                timeframes: vec!["1m"],
                expected: SubscriptionError::NotConnected,
            },
        ];

        let (_transport, manager) = manager(None);
        for (index, test) in tests.into_iter().enumerate() {
            let actual = manager.subscribe(test.symbols, test.timeframes);
            assert_eq!(actual, Err(test.expected), "TC{} failed", index);
            assert_eq!(
                manager.last_error(),
                Some(test.expected.to_string()),
                "TC{} failed",
                index
            );
            assert_eq!(manager.pending(), None, "TC{} failed", index);
        }
    }

    #[test]
    fn test_resubscribe_target_falls_back_to_default() {
        let default = RegimeSubscription::new(["BTCUSDT"], ["5m"]);
        let (_transport, manager) = manager(Some(default.clone()));

        assert_eq!(manager.target(), Some(default));

        manager.inner.state.lock().confirmed =
            Some(RegimeSubscription::new(["ETHUSDT"], ["1h"]));
        assert_eq!(
            manager.target().map(|subscription| subscription.symbols),
            Some(vec![SmolStr::new("ETHUSDT")])
        );
    }

    #[test]
    fn test_ack_replaces_tracked_subscription() {
        let (transport, manager) = manager(None);

        // Connect fires resubscribe, nothing to send without a default
        transport.dispatch(&TransportEvent::Connect);
        assert_eq!(manager.pending(), None);

        // Not connected, so the frame is dropped but the request is still tracked
        assert!(!manager.send_subscribe(RegimeSubscription::new(["BTCUSDT", "ETHUSDT"], ["1m"])));
        assert!(manager.pending().is_some());

        transport.dispatch(&message(
            SUBSCRIBED,
            json!({
                "symbols": ["BTCUSDT"],
                "timeframes": ["1m", "5m"],
                "rooms": ["regime:BTCUSDT:1m", "regime:BTCUSDT:5m"],
                "timestamp": 1_700_000_000_000_i64
            }),
        ));

        assert_eq!(manager.pending(), None);
        assert_eq!(
            manager.current(),
            Some(RegimeSubscription::new(["BTCUSDT"], ["1m", "5m"]))
        );
        assert_eq!(manager.rooms().len(), 2);

        // One-shot: a second ack is ignored
        transport.dispatch(&message(SUBSCRIBED, json!({ "symbols": ["SOLUSDT"] })));
        assert_eq!(
            manager.current().map(|subscription| subscription.symbols),
            Some(vec![SmolStr::new("BTCUSDT")])
        );
    }

    #[test]
    fn test_server_messages() {
        let (transport, manager) = manager(None);

        transport.dispatch(&message(
            CONNECTED,
            json!({ "clientId": "abc123", "subscription": null, "timestamp": 1 }),
        ));
        assert_eq!(manager.client_id(), Some(SmolStr::new("abc123")));

        let surfaced = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&surfaced);
        transport.on(Channel::Error, move |event| sink.lock().push(event.clone()));

        transport.dispatch(&message(ERROR, json!({ "message": "unknown timeframe 7m" })));
        assert_eq!(manager.last_error(), Some("unknown timeframe 7m".to_string()));
        assert_eq!(
            *surfaced.lock(),
            vec![TransportEvent::Error(TransportError::Protocol {
                event: SmolStr::new_static(ERROR),
                message: "unknown timeframe 7m".to_string(),
            })]
        );

        manager.inner.state.lock().confirmed = Some(RegimeSubscription::new(["BTCUSDT"], ["1m"]));
        transport.dispatch(&message(UNSUBSCRIBED, Value::Null));
        assert_eq!(manager.current(), None);
    }

    #[test]
    fn test_unsubscribe_clears_regime_store() {
        use crate::signal::{Regime, RegimeUpdate, Signal, SignalData};
        use crate::store::StreamKey;

        let (transport, manager) = manager(None);
        manager.inner.store.write().insert_or_update(Signal {
            kind: SignalKind::Regime,
            scope: Some(SmolStr::new("1m")),
            symbol: SmolStr::new("BTCUSDT"),
            exchange: None,
            timestamp: 1,
            received_at: 1,
            data: SignalData::Regime(RegimeUpdate {
                timeframe: SmolStr::new("1m"),
                regime: Regime::Ranging,
                adx: 0.0,
                atr_pct: 0.0,
            }),
        });
        manager.inner.state.lock().confirmed = Some(RegimeSubscription::new(["BTCUSDT"], ["1m"]));

        manager.unsubscribe();

        assert_eq!(manager.current(), None);
        assert!(
            manager
                .inner
                .store
                .read()
                .snapshot(&StreamKey::new(SignalKind::Regime))
                .is_empty()
        );

        manager.detach();
        assert_eq!(transport.listener_count(), 0);
    }
}
