//! Maps raw server event names onto canonical [`SignalKind`]s.
//!
//! Routing is multicast: one raw event may feed several kinds (eg/ the volatility persistence
//! log feeds both the spike and the range streams). Names missing from the table route nowhere,
//! although transport listeners registered for the literal name still receive them.

use crate::signal::kind::SignalKind;
use fnv::FnvHashMap;
use smol_str::SmolStr;
use tracing::debug;

/// Exact-name aliases, including legacy names and alternate server-side stream names.
const ALIASES: &[(&str, &[SignalKind])] = &[
    ("volatilitySpike", &[SignalKind::VolatilitySpike]),
    ("volatility:spike", &[SignalKind::VolatilitySpike]),
    ("volatilityRange", &[SignalKind::VolatilityRange]),
    ("volatility:range", &[SignalKind::VolatilityRange]),
    (
        "volatilitySpikeLog",
        &[SignalKind::VolatilitySpike, SignalKind::VolatilityRange],
    ),
    (
        "volatility:log",
        &[SignalKind::VolatilitySpike, SignalKind::VolatilityRange],
    ),
    ("volumeSpike", &[SignalKind::VolumeSpike]),
    ("volume:spike", &[SignalKind::VolumeSpike]),
    ("priceChange", &[SignalKind::PriceChange]),
    ("price:change", &[SignalKind::PriceChange]),
    ("priceSpike", &[SignalKind::PriceChange]),
    ("regime:update", &[SignalKind::Regime]),
    ("regime", &[SignalKind::Regime]),
];

/// Event families whose name ends with a timeframe, eg/ `top:gainers:5min`.
const SCOPED_PREFIXES: &[(&str, SignalKind)] = &[
    ("top:gainers:", SignalKind::TopGainers),
    ("top:losers:", SignalKind::TopLosers),
    ("trigger:gainers-", SignalKind::TriggerGainers),
    ("trigger:losers-", SignalKind::TriggerLosers),
];

/// Canonical destination of a raw event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub kind: SignalKind,
    /// Timeframe parsed from the event name for timeframe scoped kinds.
    pub scope: Option<SmolStr>,
}

impl Route {
    pub fn new(kind: SignalKind) -> Self {
        Self { kind, scope: None }
    }

    pub fn scoped(kind: SignalKind, scope: impl Into<SmolStr>) -> Self {
        Self {
            kind,
            scope: Some(scope.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventRouter {
    aliases: FnvHashMap<SmolStr, Vec<SignalKind>>,
}

impl Default for EventRouter {
    fn default() -> Self {
        let aliases = ALIASES
            .iter()
            .map(|(name, kinds)| (SmolStr::new_static(name), kinds.to_vec()))
            .collect();

        Self { aliases }
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an additional alias, appending to any kinds already mapped for `name`.
    pub fn with_alias(mut self, name: impl Into<SmolStr>, kinds: &[SignalKind]) -> Self {
        let entry = self.aliases.entry(name.into()).or_default();
        for kind in kinds {
            if !entry.contains(kind) {
                entry.push(*kind);
            }
        }
        self
    }

    /// Ordered list of [`Route`]s the raw `event` feeds. Empty for unrecognised names.
    pub fn route(&self, event: &str) -> Vec<Route> {
        if let Some(kinds) = self.aliases.get(event) {
            return kinds.iter().copied().map(Route::new).collect();
        }

        let scoped = SCOPED_PREFIXES.iter().find_map(|(prefix, kind)| {
            event
                .strip_prefix(prefix)
                .filter(|timeframe| !timeframe.is_empty())
                .map(|timeframe| Route::scoped(*kind, timeframe))
        });

        match scoped {
            Some(route) => vec![route],
            None => {
                debug!(event, "no canonical route for event");
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route() {
        struct TestCase {
            input: &'static str,
            expected: Vec<Route>,
        }

        let tests = vec![
            TestCase {
                // TC0: canonical name
                input: "volatilitySpike",
                expected: vec![Route::new(SignalKind::VolatilitySpike)],
            },
            TestCase {
                // TC1: namespaced equivalent
                input: "volatility:range",
                expected: vec![Route::new(SignalKind::VolatilityRange)],
            },
            TestCase {
                // TC2: persistence log stream fans out to two kinds, in order
                input: "volatilitySpikeLog",
                expected: vec![
                    Route::new(SignalKind::VolatilitySpike),
                    Route::new(SignalKind::VolatilityRange),
                ],
            },
            TestCase {
                // TC3: legacy regime alias maps like its replacement
                input: "regime",
                expected: vec![Route::new(SignalKind::Regime)],
            },
            TestCase {
                // TC4: timeframe top list
                input: "top:gainers:5min",
                expected: vec![Route::scoped(SignalKind::TopGainers, "5min")],
            },
            TestCase {
                // TC5: trigger event
                input: "trigger:losers-24h",
                expected: vec![Route::scoped(SignalKind::TriggerLosers, "24h")],
            },
            TestCase {
                // TC6: prefix without timeframe is not invented into a kind
                input: "top:losers:",
                expected: vec![],
            },
            TestCase {
                // TC7: unknown event
                input: "dish:updated",
                expected: vec![],
            },
            TestCase {
                // TC8: protocol acknowledgements are not signals
                input: "regime:subscribed",
                expected: vec![],
            },
        ];

        let router = EventRouter::new();
        for (index, test) in tests.into_iter().enumerate() {
            let actual = router.route(test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_with_alias_extends_multicast() {
        let router = EventRouter::new()
            .with_alias("volumeSpike", &[SignalKind::VolumeSpike, SignalKind::PriceChange]);

        assert_eq!(
            router.route("volumeSpike"),
            vec![
                Route::new(SignalKind::VolumeSpike),
                Route::new(SignalKind::PriceChange)
            ]
        );
    }
}
