//! Transient "changed" marks for rendered rows.
//!
//! Consecutive renders of the same rows are diffed field by field. Changed fields are marked
//! with a direction and an expiry, and marks are removed by an explicit expiry timer rather than
//! whenever the next update happens to arrive.

use crate::signal::{FieldValue, Signal, kind::SignalKind};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Notify, time::Instant};
use tracing::debug;

pub const DEFAULT_HIGHLIGHT_TTL: Duration = Duration::from_secs(2);

/// Identifies a rendered row across renders.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub kind: SignalKind,
    /// `symbol` or `symbol:timeframe`.
    pub key: SmolStr,
    /// Event time for rows of a time ordered feed, `None` for one-row-per-key views.
    pub timestamp: Option<i64>,
}

impl RowKey {
    /// Row of a feed holding several entries per symbol, keyed by the signal's identity.
    pub fn of(signal: &Signal) -> Self {
        Self {
            kind: signal.kind,
            key: signal.key(),
            timestamp: Some(signal.timestamp),
        }
    }

    /// Row of a latest-per-key view (top lists, regime grid), where a newer signal for the same
    /// key replaces the row.
    pub fn latest(signal: &Signal) -> Self {
        Self {
            kind: signal.kind,
            key: signal.key(),
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ChangeDirection {
    #[display("up")]
    Up,
    #[display("down")]
    Down,
    /// Non numeric field changed.
    #[display("changed")]
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Highlight {
    pub direction: ChangeDirection,
    pub expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct HighlightSet {
    ttl: Duration,
    marks: FnvHashMap<(RowKey, &'static str), Highlight>,
}

impl Default for HighlightSet {
    fn default() -> Self {
        Self::new(DEFAULT_HIGHLIGHT_TTL)
    }
}

impl HighlightSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            marks: FnvHashMap::default(),
        }
    }

    /// Diff `previous` against `next` row by row, keyed by [`RowKey::of`], and mark every changed
    /// field of rows present in both. Returns the number of fields marked.
    pub fn mark_changes(&mut self, previous: &[Signal], next: &[Signal], now: Instant) -> usize {
        self.mark_changes_by(previous, next, now, RowKey::of)
    }

    /// As [`HighlightSet::mark_changes`], with rows matched by `row_key`.
    pub fn mark_changes_by<F>(
        &mut self,
        previous: &[Signal],
        next: &[Signal],
        now: Instant,
        row_key: F,
    ) -> usize
    where
        F: Fn(&Signal) -> RowKey,
    {
        let previous: FnvHashMap<RowKey, &Signal> = previous
            .iter()
            .map(|signal| (row_key(signal), signal))
            .collect();

        let expires_at = now + self.ttl;
        let mut marked = 0;

        for signal in next {
            let row = row_key(signal);
            let Some(before) = previous.get(&row) else {
                continue;
            };

            let before = before.fields();
            for (field, value) in signal.fields() {
                let Some((_, old)) = before.iter().find(|(name, _)| *name == field) else {
                    continue;
                };
                let Some(direction) = compare(old, &value) else {
                    continue;
                };

                self.marks.insert(
                    (row.clone(), field),
                    Highlight {
                        direction,
                        expires_at,
                    },
                );
                marked += 1;
            }
        }

        marked
    }

    /// Direction of a live mark on `field` of `row`.
    pub fn get(&self, row: &RowKey, field: &'static str, now: Instant) -> Option<ChangeDirection> {
        self.marks
            .get(&(row.clone(), field))
            .filter(|highlight| highlight.expires_at > now)
            .map(|highlight| highlight.direction)
    }

    pub fn is_highlighted(&self, row: &RowKey, field: &'static str, now: Instant) -> bool {
        self.get(row, field, now).is_some()
    }

    /// Remove marks expired at `now`, returning how many were removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.marks.len();
        self.marks.retain(|_, highlight| highlight.expires_at > now);
        before - self.marks.len()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.marks.values().map(|highlight| highlight.expires_at).min()
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

fn compare(old: &FieldValue, new: &FieldValue) -> Option<ChangeDirection> {
    match (old, new) {
        (FieldValue::Number(old), FieldValue::Number(new)) if new > old => {
            Some(ChangeDirection::Up)
        }
        (FieldValue::Number(old), FieldValue::Number(new)) if new < old => {
            Some(ChangeDirection::Down)
        }
        (FieldValue::Number(_), FieldValue::Number(_)) => None,
        (old, new) if old != new => Some(ChangeDirection::Changed),
        _ => None,
    }
}

/// Shared [`HighlightSet`] with a timer that clears marks as they expire.
#[derive(Debug, Clone, Default)]
pub struct HighlightTracker {
    set: Arc<Mutex<HighlightSet>>,
    notify: Arc<Notify>,
}

impl HighlightTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            set: Arc::new(Mutex::new(HighlightSet::new(ttl))),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn mark_changes(&self, previous: &[Signal], next: &[Signal]) -> usize {
        self.mark_changes_by(previous, next, RowKey::of)
    }

    pub fn mark_changes_by<F>(&self, previous: &[Signal], next: &[Signal], row_key: F) -> usize
    where
        F: Fn(&Signal) -> RowKey,
    {
        let marked = self
            .set
            .lock()
            .mark_changes_by(previous, next, Instant::now(), row_key);
        if marked > 0 {
            self.notify.notify_one();
        }
        marked
    }

    pub fn get(&self, row: &RowKey, field: &'static str) -> Option<ChangeDirection> {
        self.set.lock().get(row, field, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.set.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.lock().is_empty()
    }

    /// Expire marks as their deadlines pass, calling `on_expired` with the number removed so the
    /// consumer can re-render. Runs until the future is dropped.
    pub async fn run_expiry<F>(&self, mut on_expired: F)
    where
        F: FnMut(usize),
    {
        loop {
            let next = self.set.lock().next_expiry();

            match next {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            let expired = self.set.lock().expire(Instant::now());
                            if expired > 0 {
                                debug!(expired, "highlights expired");
                                on_expired(expired);
                            }
                        }
                        // New marks may expire earlier than the current deadline
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{SignalData, VolumeSignal};

    fn volume_at(symbol: &str, timestamp: i64, volume: f64, change: f64) -> Signal {
        Signal {
            kind: SignalKind::VolumeSpike,
            scope: None,
            symbol: SmolStr::new(symbol),
            exchange: None,
            timestamp,
            received_at: timestamp,
            data: SignalData::Volume(VolumeSignal { volume, change }),
        }
    }

    fn volume(symbol: &str, volume: f64, change: f64) -> Signal {
        volume_at(symbol, 1, volume, change)
    }

    fn row(symbol: &str) -> RowKey {
        RowKey {
            kind: SignalKind::VolumeSpike,
            key: SmolStr::new(symbol),
            timestamp: Some(1),
        }
    }

    #[test]
    fn test_mark_changes() {
        let now = Instant::now();
        let mut set = HighlightSet::new(Duration::from_secs(2));

        let previous = vec![volume("BTCUSDT", 100.0, 5.0), volume("ETHUSDT", 50.0, 1.0)];
        let next = vec![
            volume("BTCUSDT", 120.0, 5.0),
            volume("ETHUSDT", 40.0, 1.0),
            volume("SOLUSDT", 10.0, 1.0),
        ];

        assert_eq!(set.mark_changes(&previous, &next, now), 2);
        assert_eq!(set.get(&row("BTCUSDT"), "volume", now), Some(ChangeDirection::Up));
        assert_eq!(set.get(&row("ETHUSDT"), "volume", now), Some(ChangeDirection::Down));
        assert!(!set.is_highlighted(&row("BTCUSDT"), "change", now));
        assert!(!set.is_highlighted(&row("SOLUSDT"), "volume", now));
    }

    #[test]
    fn test_several_rows_per_symbol() {
        let now = Instant::now();
        let mut set = HighlightSet::new(Duration::from_secs(2));

        let feed = vec![
            volume_at("BTCUSDT", 2, 3.0, 0.0),
            volume_at("BTCUSDT", 1, 1.0, 0.0),
        ];
        assert_eq!(set.mark_changes(&feed, &feed.clone(), now), 0);

        // A new row pushed on top shifts the others without changing them
        let shifted = vec![
            volume_at("BTCUSDT", 3, 5.0, 0.0),
            volume_at("BTCUSDT", 2, 3.0, 0.0),
            volume_at("BTCUSDT", 1, 1.0, 0.0),
        ];
        assert_eq!(set.mark_changes(&feed, &shifted, now), 0);

        // Same identity with a new payload is a change of that row only
        let updated = vec![
            volume_at("BTCUSDT", 3, 5.0, 0.0),
            volume_at("BTCUSDT", 2, 2.0, 0.0),
            volume_at("BTCUSDT", 1, 1.0, 0.0),
        ];
        assert_eq!(set.mark_changes(&shifted, &updated, now), 1);

        let mut second = row("BTCUSDT");
        second.timestamp = Some(2);
        assert_eq!(set.get(&second, "volume", now), Some(ChangeDirection::Down));
        assert!(!set.is_highlighted(&row("BTCUSDT"), "volume", now));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_latest_per_key_rows() {
        let now = Instant::now();
        let mut set = HighlightSet::new(Duration::from_secs(2));

        let previous = vec![volume_at("BTCUSDT", 1, 10.0, 0.0)];
        let next = vec![volume_at("BTCUSDT", 2, 12.0, 0.0)];

        assert_eq!(set.mark_changes(&previous, &next, now), 0);
        assert_eq!(set.mark_changes_by(&previous, &next, now, RowKey::latest), 1);
        assert_eq!(
            set.get(&RowKey::latest(&next[0]), "volume", now),
            Some(ChangeDirection::Up)
        );
    }

    #[test]
    fn test_expire() {
        let now = Instant::now();
        let mut set = HighlightSet::new(Duration::from_secs(2));
        set.mark_changes(
            &[volume("BTCUSDT", 1.0, 0.0)],
            &[volume("BTCUSDT", 2.0, 0.0)],
            now,
        );

        assert_eq!(set.next_expiry(), Some(now + Duration::from_secs(2)));
        assert_eq!(set.expire(now + Duration::from_secs(1)), 0);
        assert_eq!(set.expire(now + Duration::from_secs(2)), 1);
        assert!(set.is_empty());
        assert_eq!(set.next_expiry(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marks_clear_without_further_data() {
        let tracker = HighlightTracker::new(DEFAULT_HIGHLIGHT_TTL);
        let expired = Arc::new(Mutex::new(0));

        let timer = {
            let tracker = tracker.clone();
            let expired = Arc::clone(&expired);
            tokio::spawn(async move {
                tracker.run_expiry(|count| *expired.lock() += count).await;
            })
        };
        tokio::task::yield_now().await;

        tracker.mark_changes(&[volume("BTCUSDT", 1.0, 0.0)], &[volume("BTCUSDT", 2.0, 1.0)]);
        assert_eq!(tracker.get(&row("BTCUSDT"), "volume"), Some(ChangeDirection::Up));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(tracker.len(), 2);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(tracker.is_empty());
        assert_eq!(*expired.lock(), 2);

        timer.abort();
    }
}
