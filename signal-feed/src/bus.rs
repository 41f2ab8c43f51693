use crate::signal::{
    Signal,
    kind::{SignalKind, SignalStream},
};
use parking_lot::Mutex;
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tracing::error;

/// Handle returned by [`SignalBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

type Handler = Arc<dyn Fn(&Signal) + Send + Sync>;

struct Subscriber {
    id: SubscriberId,
    /// `None` receives every kind.
    kind: Option<SignalKind>,
    handler: Handler,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<Subscriber>,
}

/// Typed publish/subscribe of normalised [`Signal`]s by canonical kind.
///
/// Handlers run synchronously on the publishing task in subscription order, a panicking handler
/// is logged and does not prevent delivery to the others.
#[derive(Clone, Default)]
pub struct SignalBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one canonical kind, receiving the signal with its typed payload.
    ///
    /// ```rust,no_run
    /// use signal_feed::{bus::SignalBus, signal::kind::RegimeUpdates};
    ///
    /// let bus = SignalBus::new();
    /// bus.subscribe(RegimeUpdates, |signal, update| {
    ///     println!("{} {} -> {}", signal.symbol, update.timeframe, update.regime);
    /// });
    /// ```
    pub fn subscribe<K, F>(&self, stream: K, handler: F) -> SubscriberId
    where
        K: SignalStream + 'static,
        F: Fn(&Signal, &K::Event) + Send + Sync + 'static,
    {
        let erased = move |signal: &Signal| {
            if let Some(event) = K::event(&signal.data) {
                handler(signal, event)
            }
        };

        self.register(Some(stream.kind()), Arc::new(erased))
    }

    /// Subscribe to every signal regardless of kind.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriberId
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.entries.len();
        subscribers.entries.retain(|subscriber| subscriber.id != id);
        subscribers.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `signal` to every matching subscriber, returning how many were invoked.
    pub fn publish(&self, signal: &Signal) -> usize {
        let handlers: Vec<Handler> = self
            .subscribers
            .lock()
            .entries
            .iter()
            .filter(|subscriber| subscriber.kind.is_none_or(|kind| kind == signal.kind))
            .map(|subscriber| Arc::clone(&subscriber.handler))
            .collect();

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(signal))).is_err() {
                error!(kind = %signal.kind, symbol = %signal.symbol, "signal subscriber panicked");
            }
        }

        handlers.len()
    }

    fn register(&self, kind: Option<SignalKind>, handler: Handler) -> SubscriberId {
        let mut subscribers = self.subscribers.lock();
        subscribers.next_id += 1;
        let id = SubscriberId(subscribers.next_id);
        subscribers.entries.push(Subscriber { id, kind, handler });
        id
    }
}
