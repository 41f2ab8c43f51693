use crate::signal::TriggerEvent;
use indexmap::IndexSet;
use smol_str::SmolStr;

/// Bounded ordered set of symbols that crossed a gainers/losers trigger, most recent first.
#[derive(Debug, Clone)]
pub struct TriggerBoard {
    cap: usize,
    symbols: IndexSet<SmolStr>,
    last_timestamp: Option<i64>,
}

impl TriggerBoard {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            symbols: IndexSet::with_capacity(cap.max(1) + 1),
            last_timestamp: None,
        }
    }

    /// Move the event's symbols to the front, preserving their relative order.
    ///
    /// Returns `false` without touching the board if the event is older than the last applied.
    pub fn apply(&mut self, event: &TriggerEvent, timestamp: i64) -> bool {
        if self.last_timestamp.is_some_and(|last| timestamp < last) {
            return false;
        }
        self.last_timestamp = Some(timestamp);

        for symbol in event.symbols.iter().rev() {
            self.symbols.shift_insert(0, symbol.clone());
        }
        self.symbols.truncate(self.cap);
        true
    }

    pub fn symbols(&self) -> Vec<SmolStr> {
        self.symbols.iter().cloned().collect()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
