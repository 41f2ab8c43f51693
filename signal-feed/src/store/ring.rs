use crate::signal::Signal;
use std::sync::Arc;

/// Result of [`SignalRing::insert_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New identity, prepended. `evicted` oldest entries were dropped to honour the cap.
    Inserted { evicted: usize },
    /// Existing identity replaced and moved to the front, original `received_at` kept.
    Updated,
    /// Incoming signal is older than the stored entry and was discarded.
    Stale,
}

impl InsertOutcome {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, InsertOutcome::Stale)
    }
}

/// Bounded, newest-first buffer of [`Signal`]s with insert-or-update-by-identity semantics.
///
/// Storage is copy-on-write: [`SignalRing::snapshot`] hands out a cheap `Arc` that is never
/// mutated afterwards, the ring clones the backing `Vec` only if a snapshot is still alive when
/// the next write lands.
#[derive(Debug, Clone)]
pub struct SignalRing {
    cap: usize,
    entries: Arc<Vec<Signal>>,
}

impl SignalRing {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            entries: Arc::new(Vec::with_capacity(cap.max(1) + 1)),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read-only view of the current entries, newest first.
    pub fn snapshot(&self) -> Arc<Vec<Signal>> {
        Arc::clone(&self.entries)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signal> {
        self.entries.iter()
    }

    /// Insert a new signal or replace the entry sharing its identity.
    ///
    /// An update never overwrites a newer timestamp. Updated and new entries both go to the
    /// front, so the tail is always the least recently written entry. New entries keep the
    /// `received_at` the signal arrived with, and the tail is truncated to the cap.
    pub fn insert_or_update(&mut self, signal: Signal) -> InsertOutcome {
        let identity = signal.identity();
        let position = self
            .entries
            .iter()
            .position(|entry| entry.identity() == identity);

        match position {
            Some(index) => {
                if signal.timestamp < self.entries[index].timestamp {
                    return InsertOutcome::Stale;
                }

                let entries = Arc::make_mut(&mut self.entries);
                let received_at = entries.remove(index).received_at;
                entries.insert(
                    0,
                    Signal {
                        received_at,
                        ..signal
                    },
                );
                InsertOutcome::Updated
            }
            None => {
                let entries = Arc::make_mut(&mut self.entries);
                entries.insert(0, signal);

                let evicted = entries.len().saturating_sub(self.cap);
                entries.truncate(self.cap);
                InsertOutcome::Inserted { evicted }
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries = Arc::new(Vec::with_capacity(self.cap + 1));
    }
}
