//! Read-only views over [`SignalStore`] snapshots.
//!
//! Every function here is pure: given the same store contents it returns the same view and it
//! never mutates the store.

use crate::{
    signal::{RegimeUpdate, Signal, SignalData, TriggerDirection, kind::SignalKind},
    store::{SignalStore, StreamKey},
};
use itertools::Itertools;
use smol_str::SmolStr;
use std::{cmp::Ordering, sync::Arc};

/// Newest-first entries of one stream.
pub fn entries(store: &SignalStore, key: &StreamKey) -> Arc<Vec<Signal>> {
    store.snapshot(key)
}

/// Newest-first ordering: event time, then receipt time.
pub fn by_time_desc(a: &Signal, b: &Signal) -> Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| b.received_at.cmp(&a.received_at))
}

/// All entries of every stream of the given kinds, merged newest first.
pub fn merged_by_time(store: &SignalStore, kinds: &[SignalKind]) -> Vec<Signal> {
    store
        .stream_keys()
        .into_iter()
        .filter(|key| kinds.contains(&key.kind))
        .flat_map(|key| store.snapshot(&key).iter().cloned().collect::<Vec<_>>())
        .sorted_by(by_time_desc)
        .collect()
}

/// Spike and range-expansion events as one feed.
pub fn volatility_feed(store: &SignalStore) -> Vec<Signal> {
    merged_by_time(
        store,
        &[SignalKind::VolatilitySpike, SignalKind::VolatilityRange],
    )
}

/// Latest signal of `kind` for `key`, eg/ `BTCUSDT:1h` for a regime.
pub fn lookup<'a>(store: &'a SignalStore, kind: SignalKind, key: &str) -> Option<&'a Signal> {
    store.latest(kind, key)
}

pub fn regime<'a>(
    store: &'a SignalStore,
    symbol: &str,
    timeframe: &str,
) -> Option<&'a RegimeUpdate> {
    match &lookup(store, SignalKind::Regime, &format!("{symbol}:{timeframe}"))?.data {
        SignalData::Regime(update) => Some(update),
        _ => None,
    }
}

/// Top list for a timeframe: latest entry per symbol, gainers by descending percent change,
/// losers ascending.
pub fn top_list(store: &SignalStore, kind: SignalKind, timeframe: &str) -> Vec<Signal> {
    let percent = |signal: &Signal| match &signal.data {
        SignalData::TimeframeCoin(coin) => coin.percent_change,
        _ => 0.0,
    };

    let snapshot = store.snapshot(&StreamKey::scoped(kind, timeframe));
    let latest = snapshot
        .iter()
        .sorted_by(|a, b| by_time_desc(a, b))
        .unique_by(|signal| signal.symbol.clone())
        .cloned();

    match kind {
        SignalKind::TopLosers => latest
            .sorted_by(|a, b| percent(a).total_cmp(&percent(b)))
            .collect(),
        _ => latest
            .sorted_by(|a, b| percent(b).total_cmp(&percent(a)))
            .collect(),
    }
}

/// Symbols that most recently crossed the trigger, most recent first.
pub fn trigger_symbols(
    store: &SignalStore,
    direction: TriggerDirection,
    timeframe: &str,
) -> Vec<SmolStr> {
    let kind = match direction {
        TriggerDirection::Gainers => SignalKind::TriggerGainers,
        TriggerDirection::Losers => SignalKind::TriggerLosers,
    };

    store
        .trigger_board(&StreamKey::scoped(kind, timeframe))
        .map(|board| board.symbols())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{TimeframeCoin, TriggerEvent, VolatilitySignal};

    fn volatility(kind: SignalKind, symbol: &str, timestamp: i64, received_at: i64) -> Signal {
        Signal {
            kind,
            scope: None,
            symbol: SmolStr::new(symbol),
            exchange: None,
            timestamp,
            received_at,
            data: SignalData::Volatility(VolatilitySignal::default()),
        }
    }

    fn coin(kind: SignalKind, symbol: &str, timestamp: i64, percent_change: f64) -> Signal {
        Signal {
            kind,
            scope: Some(SmolStr::new("5min")),
            symbol: SmolStr::new(symbol),
            exchange: None,
            timestamp,
            received_at: timestamp,
            data: SignalData::TimeframeCoin(TimeframeCoin {
                percent_change,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_merged_sort_across_kinds() {
        let mut store = SignalStore::default();
        store.insert_or_update(volatility(SignalKind::VolatilityRange, "ETHUSDT", 150, 1));
        store.insert_or_update(volatility(SignalKind::VolatilitySpike, "BTCUSDT", 200, 2));
        store.insert_or_update(volatility(SignalKind::VolatilitySpike, "SOLUSDT", 100, 3));

        let feed = volatility_feed(&store);
        let order: Vec<_> = feed
            .iter()
            .map(|signal| (signal.kind, signal.timestamp))
            .collect();

        assert_eq!(
            order,
            vec![
                (SignalKind::VolatilitySpike, 200),
                (SignalKind::VolatilityRange, 150),
                (SignalKind::VolatilitySpike, 100),
            ]
        );
    }

    #[test]
    fn test_merged_sort_breaks_ties_by_receipt() {
        let mut store = SignalStore::default();
        store.insert_or_update(volatility(SignalKind::VolatilitySpike, "A", 100, 10));
        store.insert_or_update(volatility(SignalKind::VolatilityRange, "B", 100, 20));

        let feed = volatility_feed(&store);
        assert_eq!(feed[0].symbol, "B");
        assert_eq!(feed[1].symbol, "A");
    }

    #[test]
    fn test_top_list() {
        struct TestCase {
            kind: SignalKind,
            expected: Vec<&'static str>,
        }

        let tests = vec![
            TestCase {
                // TC0: gainers, highest change first, stale BTCUSDT entry superseded
                kind: SignalKind::TopGainers,
                expected: vec!["SOLUSDT", "BTCUSDT", "ETHUSDT"],
            },
            TestCase {
                // TC1: losers, most negative first
                kind: SignalKind::TopLosers,
                expected: vec!["ETHUSDT", "BTCUSDT", "SOLUSDT"],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut store = SignalStore::default();
            store.insert_or_update(coin(test.kind, "BTCUSDT", 1, 9.0));
            store.insert_or_update(coin(test.kind, "ETHUSDT", 2, -4.0));
            store.insert_or_update(coin(test.kind, "SOLUSDT", 2, 6.0));
            store.insert_or_update(coin(test.kind, "BTCUSDT", 3, 1.5));

            let actual: Vec<_> = top_list(&store, test.kind, "5min")
                .into_iter()
                .map(|signal| signal.symbol)
                .collect();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_lookup_and_triggers() {
        let mut store = SignalStore::default();
        store.insert_or_update(Signal {
            kind: SignalKind::TriggerLosers,
            scope: Some(SmolStr::new("1h")),
            symbol: SmolStr::new("DOGEUSDT"),
            exchange: None,
            timestamp: 5,
            received_at: 5,
            data: SignalData::Trigger(TriggerEvent {
                direction: TriggerDirection::Losers,
                symbols: vec![SmolStr::new("DOGEUSDT"), SmolStr::new("XRPUSDT")],
            }),
        });

        assert_eq!(
            trigger_symbols(&store, TriggerDirection::Losers, "1h"),
            vec!["DOGEUSDT", "XRPUSDT"]
        );
        assert!(trigger_symbols(&store, TriggerDirection::Gainers, "1h").is_empty());
        assert!(regime(&store, "BTCUSDT", "1h").is_none());
        assert!(lookup(&store, SignalKind::VolumeSpike, "BTCUSDT").is_none());
    }
}
