//! Bounded, de-duplicating signal stores.
//!
//! One [`SignalRing`] per stream (canonical kind, plus timeframe for timeframe scoped kinds), one
//! [`TriggerBoard`] per trigger stream, and a latest-by-key index guarded against out-of-order
//! writes. The store is the only writer of this state, consumers read snapshots.

use crate::signal::{Signal, SignalData, kind::SignalKind};
use fnv::FnvHashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use smol_str::SmolStr;
use std::sync::Arc;
use tracing::debug;

mod ring;
mod trigger;

pub use ring::{InsertOutcome, SignalRing};
pub use trigger::TriggerBoard;

/// Identifies one ring or trigger board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub kind: SignalKind,
    pub scope: Option<SmolStr>,
}

impl StreamKey {
    pub fn new(kind: SignalKind) -> Self {
        Self { kind, scope: None }
    }

    pub fn scoped(kind: SignalKind, timeframe: impl Into<SmolStr>) -> Self {
        Self {
            kind,
            scope: Some(timeframe.into()),
        }
    }

    /// Stream a signal belongs to. Regime updates share a single stream across timeframes, the
    /// timeframe stays part of each entry's identity.
    pub fn of(signal: &Signal) -> Self {
        if signal.kind.is_timeframe_scoped() {
            Self {
                kind: signal.kind,
                scope: signal.scope.clone(),
            }
        } else {
            Self::new(signal.kind)
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{}", self.kind, scope),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Per kind ring capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCaps {
    pub volatility: usize,
    pub volume: usize,
    pub price_change: usize,
    pub top_list: usize,
    pub trigger: usize,
    pub regime: usize,
    /// Maximum keys kept per kind in the latest-by-key index.
    pub latest_per_kind: usize,
}

impl Default for StoreCaps {
    fn default() -> Self {
        Self {
            volatility: 50,
            volume: 50,
            price_change: 50,
            top_list: 20,
            trigger: 20,
            regime: 50,
            latest_per_kind: 500,
        }
    }
}

impl StoreCaps {
    pub fn cap_for(&self, kind: SignalKind) -> usize {
        match kind {
            SignalKind::VolatilitySpike | SignalKind::VolatilityRange => self.volatility,
            SignalKind::VolumeSpike => self.volume,
            SignalKind::PriceChange => self.price_change,
            SignalKind::TopGainers | SignalKind::TopLosers => self.top_list,
            SignalKind::TriggerGainers | SignalKind::TriggerLosers => self.trigger,
            SignalKind::Regime => self.regime,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignalStore {
    caps: StoreCaps,
    rings: FnvHashMap<StreamKey, SignalRing>,
    triggers: FnvHashMap<StreamKey, TriggerBoard>,
    latest: FnvHashMap<SignalKind, FnvHashMap<SmolStr, Signal>>,
    last_updated: FnvHashMap<StreamKey, i64>,
    version: u64,
}

impl SignalStore {
    pub fn new(caps: StoreCaps) -> Self {
        Self {
            caps,
            ..Default::default()
        }
    }

    pub fn caps(&self) -> &StoreCaps {
        &self.caps
    }

    /// Insert or update a normalised signal in its stream.
    ///
    /// Trigger signals are merged into their [`TriggerBoard`], everything else goes through the
    /// stream's [`SignalRing`]. Each mutation bumps the stream's `last_updated` (the signal's
    /// receipt time) and the store version.
    pub fn insert_or_update(&mut self, signal: Signal) -> InsertOutcome {
        let key = StreamKey::of(&signal);
        let received_at = signal.received_at;

        let outcome = match &signal.data {
            SignalData::Trigger(event) => {
                let cap = self.caps.trigger;
                let board = self
                    .triggers
                    .entry(key.clone())
                    .or_insert_with(|| TriggerBoard::new(cap));

                if board.apply(event, signal.timestamp) {
                    InsertOutcome::Inserted { evicted: 0 }
                } else {
                    InsertOutcome::Stale
                }
            }
            _ => {
                self.index_latest(&signal);

                let cap = self.caps.cap_for(signal.kind);
                self.rings
                    .entry(key.clone())
                    .or_insert_with(|| SignalRing::new(cap))
                    .insert_or_update(signal)
            }
        };

        if outcome.is_mutation() {
            self.last_updated.insert(key, received_at);
            self.version = self.version.wrapping_add(1);
        } else {
            debug!(stream = %key, "discarded out-of-order signal");
        }

        outcome
    }

    /// Record the signal as latest for its key unless a newer one is already indexed.
    fn index_latest(&mut self, signal: &Signal) {
        let cap = self.caps.latest_per_kind.max(1);
        let index = self.latest.entry(signal.kind).or_default();
        let key = signal.key();

        match index.get_mut(&key) {
            Some(existing) if signal.timestamp < existing.timestamp => {}
            Some(existing) => {
                let received_at = existing.received_at;
                *existing = Signal {
                    received_at,
                    ..signal.clone()
                };
            }
            None => {
                index.insert(key, signal.clone());

                if index.len() > cap {
                    let oldest = index
                        .iter()
                        .min_by_key(|(_, signal)| signal.timestamp)
                        .map(|(key, _)| key.clone());
                    if let Some(oldest) = oldest {
                        index.remove(&oldest);
                    }
                }
            }
        }
    }

    /// Newest-first snapshot of a stream, empty if nothing was ever stored.
    pub fn snapshot(&self, key: &StreamKey) -> Arc<Vec<Signal>> {
        self.rings
            .get(key)
            .map(SignalRing::snapshot)
            .unwrap_or_default()
    }

    pub fn ring(&self, key: &StreamKey) -> Option<&SignalRing> {
        self.rings.get(key)
    }

    pub fn stream_keys(&self) -> Vec<StreamKey> {
        let mut keys: Vec<_> = self.rings.keys().chain(self.triggers.keys()).cloned().collect();
        keys.sort();
        keys
    }

    /// Latest signal of `kind` for `key` (`symbol` or `symbol:timeframe`).
    pub fn latest(&self, kind: SignalKind, key: &str) -> Option<&Signal> {
        self.latest.get(&kind)?.get(key)
    }

    pub fn trigger_board(&self, key: &StreamKey) -> Option<&TriggerBoard> {
        self.triggers.get(key)
    }

    pub fn last_updated(&self, key: &StreamKey) -> Option<i64> {
        self.last_updated.get(key).copied()
    }

    /// Monotonic counter bumped by every mutation, lets readers skip recomputation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Remove every stream and index entry of `kind`.
    pub fn clear_kind(&mut self, kind: SignalKind) {
        self.rings.retain(|key, _| key.kind != kind);
        self.triggers.retain(|key, _| key.kind != kind);
        self.last_updated.retain(|key, _| key.kind != kind);
        self.latest.remove(&kind);
        self.version = self.version.wrapping_add(1);
    }

    pub fn clear_all(&mut self) {
        self.rings.clear();
        self.triggers.clear();
        self.last_updated.clear();
        self.latest.clear();
        self.version = self.version.wrapping_add(1);
    }
}

/// Shared handle to the process-wide [`SignalStore`].
///
/// Consumers only get read access, writes are reserved to the ingestion path and the
/// subscription manager inside this crate.
#[derive(Debug, Clone, Default)]
pub struct StoreHandle(Arc<RwLock<SignalStore>>);

impl StoreHandle {
    pub fn new(store: SignalStore) -> Self {
        Self(Arc::new(RwLock::new(store)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SignalStore> {
        self.0.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, SignalStore> {
        self.0.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{
        Regime, RegimeUpdate, TriggerDirection, TriggerEvent, VolatilitySignal,
    };

    fn regime(symbol: &str, timeframe: &str, timestamp: i64, regime: Regime) -> Signal {
        Signal {
            kind: SignalKind::Regime,
            scope: Some(SmolStr::new(timeframe)),
            symbol: SmolStr::new(symbol),
            exchange: None,
            timestamp,
            received_at: timestamp + 1,
            data: SignalData::Regime(RegimeUpdate {
                timeframe: SmolStr::new(timeframe),
                regime,
                adx: 20.0,
                atr_pct: 0.5,
            }),
        }
    }

    fn spike(symbol: &str, timestamp: i64) -> Signal {
        Signal {
            kind: SignalKind::VolatilitySpike,
            scope: None,
            symbol: SmolStr::new(symbol),
            exchange: None,
            timestamp,
            received_at: timestamp,
            data: SignalData::Volatility(VolatilitySignal::default()),
        }
    }

    #[test]
    fn test_ring_cap_invariant_for_every_kind() {
        let caps = StoreCaps {
            volatility: 3,
            regime: 4,
            ..Default::default()
        };
        let mut store = SignalStore::new(caps);

        for i in 0..20 {
            store.insert_or_update(spike(&format!("S{i}"), i));
            store.insert_or_update(regime(&format!("S{i}"), "1m", i, Regime::Ranging));
        }

        let spikes = store.snapshot(&StreamKey::new(SignalKind::VolatilitySpike));
        let regimes = store.snapshot(&StreamKey::new(SignalKind::Regime));
        assert_eq!(spikes.len(), 3);
        assert_eq!(regimes.len(), 4);
        assert_eq!(spikes[0].symbol, "S19");
        assert_eq!(spikes[2].symbol, "S17");
    }

    #[test]
    fn test_stale_write_rejection_on_latest_index() {
        let mut store = SignalStore::default();

        store.insert_or_update(regime("BTCUSDT", "1m", 100, Regime::TrendingUp));
        // Same symbol and timeframe, older event arriving late
        store.insert_or_update(regime("BTCUSDT", "1m", 90, Regime::TrendingDown));

        let latest = store.latest(SignalKind::Regime, "BTCUSDT:1m").unwrap();
        assert_eq!(latest.timestamp, 100);
        assert!(matches!(
            &latest.data,
            SignalData::Regime(RegimeUpdate {
                regime: Regime::TrendingUp,
                ..
            })
        ));

        store.insert_or_update(regime("BTCUSDT", "1m", 110, Regime::Volatile));
        assert_eq!(
            store.latest(SignalKind::Regime, "BTCUSDT:1m").map(|s| s.timestamp),
            Some(110)
        );
    }

    #[test]
    fn test_last_updated_and_version() {
        let mut store = SignalStore::default();
        let key = StreamKey::new(SignalKind::Regime);
        assert_eq!(store.last_updated(&key), None);

        store.insert_or_update(regime("ETHUSDT", "5m", 500, Regime::Squeeze));
        assert_eq!(store.last_updated(&key), Some(501));
        assert_eq!(store.version(), 1);

        // Duplicate identity is still a mutation
        store.insert_or_update(regime("ETHUSDT", "5m", 500, Regime::Dead));
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn test_triggers_are_scoped_by_timeframe() {
        let mut store = SignalStore::default();
        let trigger = |timeframe: &str, symbols: &[&str], timestamp: i64| Signal {
            kind: SignalKind::TriggerGainers,
            scope: Some(SmolStr::new(timeframe)),
            symbol: SmolStr::new(symbols[0]),
            exchange: None,
            timestamp,
            received_at: timestamp,
            data: SignalData::Trigger(TriggerEvent {
                direction: TriggerDirection::Gainers,
                symbols: symbols.iter().map(|s| SmolStr::new(s)).collect(),
            }),
        };

        store.insert_or_update(trigger("5min", &["BTCUSDT"], 1));
        store.insert_or_update(trigger("24h", &["ETHUSDT"], 1));
        let outcome = store.insert_or_update(trigger("5min", &["SOLUSDT"], 0));

        assert_eq!(outcome, InsertOutcome::Stale);
        let board = store
            .trigger_board(&StreamKey::scoped(SignalKind::TriggerGainers, "5min"))
            .unwrap();
        assert_eq!(board.symbols(), vec!["BTCUSDT"]);
        assert_eq!(store.stream_keys().len(), 2);
    }

    #[test]
    fn test_clear_kind_only_touches_that_kind() {
        let mut store = SignalStore::default();
        store.insert_or_update(spike("BTCUSDT", 1));
        store.insert_or_update(regime("BTCUSDT", "1m", 1, Regime::Ranging));

        store.clear_kind(SignalKind::Regime);

        assert!(store.snapshot(&StreamKey::new(SignalKind::Regime)).is_empty());
        assert!(store.latest(SignalKind::Regime, "BTCUSDT:1m").is_none());
        assert_eq!(store.snapshot(&StreamKey::new(SignalKind::VolatilitySpike)).len(), 1);
    }

    #[test]
    fn test_latest_index_is_bounded() {
        let mut store = SignalStore::new(StoreCaps {
            latest_per_kind: 2,
            ..Default::default()
        });

        store.insert_or_update(spike("A", 1));
        store.insert_or_update(spike("B", 2));
        store.insert_or_update(spike("C", 3));

        assert!(store.latest(SignalKind::VolatilitySpike, "A").is_none());
        assert!(store.latest(SignalKind::VolatilitySpike, "C").is_some());
    }
}
