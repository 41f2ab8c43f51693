//! Canonical signal model.
//!
//! Every raw server payload is converted into a [`Signal`] at the normalisation boundary, nothing
//! downstream of the [`Normalizer`](crate::normalizer::Normalizer) inspects raw shapes again.

use self::kind::SignalKind;
use serde::Serialize;
use smol_str::SmolStr;

pub mod kind;
pub mod time;

/// Normalised signal shared by every canonical kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub kind: SignalKind,
    /// Timeframe partition for timeframe scoped kinds and regime updates.
    pub scope: Option<SmolStr>,
    pub symbol: SmolStr,
    pub exchange: Option<SmolStr>,
    /// Event time in epoch milliseconds.
    pub timestamp: i64,
    /// Local receipt time in epoch milliseconds, fixed on first insert into a ring.
    pub received_at: i64,
    pub data: SignalData,
}

/// Identity used by ring stores to de-duplicate signals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalIdentity {
    pub symbol: SmolStr,
    pub timestamp: i64,
    pub sub_kind: SubKind,
}

/// Distinguishes signals that share a payload shape, eg/ spike vs range volatility, or the same
/// symbol's regime on two timeframes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubKind {
    pub kind: SignalKind,
    pub scope: Option<SmolStr>,
}

impl Signal {
    pub fn identity(&self) -> SignalIdentity {
        SignalIdentity {
            symbol: self.symbol.clone(),
            timestamp: self.timestamp,
            sub_kind: self.sub_kind(),
        }
    }

    pub fn sub_kind(&self) -> SubKind {
        SubKind {
            kind: self.kind,
            scope: self.scope.clone(),
        }
    }

    /// Lookup key: `symbol:scope` for scoped signals, `symbol` otherwise.
    pub fn key(&self) -> SmolStr {
        match &self.scope {
            Some(scope) => smol_str::format_smolstr!("{}:{}", self.symbol, scope),
            None => self.symbol.clone(),
        }
    }

    /// Displayable fields, used to diff consecutive renders.
    pub fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        use FieldValue::Number;

        match &self.data {
            SignalData::Volatility(v) => {
                let mut fields = vec![
                    ("volatility", Number(v.volatility)),
                    ("volatility_change", Number(v.volatility_change)),
                ];
                fields.extend(v.range.map(|range| ("range", Number(range))));
                fields.extend(v.range_ratio.map(|ratio| ("range_ratio", Number(ratio))));
                fields.extend(v.close.map(|close| ("close", Number(close))));
                fields
            }
            SignalData::Volume(v) => vec![("volume", Number(v.volume)), ("change", Number(v.change))],
            SignalData::PriceChange(p) => vec![
                ("price", Number(p.price)),
                ("price_change", Number(p.price_change)),
                ("price_change_percent", Number(p.price_change_percent)),
            ],
            SignalData::TimeframeCoin(c) => {
                let mut fields = vec![("percent_change", Number(c.percent_change))];
                fields.extend(c.last_price.map(|price| ("last_price", Number(price))));
                fields.extend(c.volume.map(|volume| ("volume", Number(volume))));
                fields.extend(c.funding_rate.map(|rate| ("funding_rate", Number(rate))));
                fields
            }
            SignalData::Trigger(t) => vec![(
                "symbols",
                FieldValue::Label(SmolStr::from(t.symbols.join(","))),
            )],
            SignalData::Regime(r) => vec![
                ("regime", FieldValue::Label(SmolStr::new(r.regime.as_str()))),
                ("adx", Number(r.adx)),
                ("atr_pct", Number(r.atr_pct)),
            ],
        }
    }
}

/// Kind specific payload of a [`Signal`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SignalData {
    Volatility(VolatilitySignal),
    Volume(VolumeSignal),
    PriceChange(PriceChangeSignal),
    TimeframeCoin(TimeframeCoin),
    Trigger(TriggerEvent),
    Regime(RegimeUpdate),
}

/// Volatility spike or range-expansion event.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct VolatilitySignal {
    /// Volatility in percent.
    pub volatility: f64,
    /// Signed change in percent, derived from the range ratio when the server omits it.
    pub volatility_change: f64,
    pub interval: Option<SmolStr>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub range: Option<f64>,
    pub avg_range: Option<f64>,
    pub range_ratio: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct VolumeSignal {
    pub volume: f64,
    /// Change versus the reference volume, in percent.
    pub change: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceChangeSignal {
    pub price: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub direction: PriceDirection,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum PriceDirection {
    #[display("up")]
    Up,
    #[display("down")]
    Down,
}

impl PriceDirection {
    pub fn from_change(change: f64) -> Self {
        if change < 0.0 {
            PriceDirection::Down
        } else {
            PriceDirection::Up
        }
    }
}

/// Entry of a timeframe scoped top gainers/losers list.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TimeframeCoin {
    pub percent_change: f64,
    pub last_price: Option<f64>,
    pub volume: Option<f64>,
    pub quote_volume: Option<f64>,
    pub funding_rate: Option<f64>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum TriggerDirection {
    #[display("gainers")]
    Gainers,
    #[display("losers")]
    Losers,
}

/// Symbols that crossed a gainers/losers trigger, most recent first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerEvent {
    pub direction: TriggerDirection,
    pub symbols: Vec<SmolStr>,
}

/// Server computed market regime for a symbol on one timeframe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegimeUpdate {
    pub timeframe: SmolStr,
    pub regime: Regime,
    pub adx: f64,
    pub atr_pct: f64,
}

/// Categorical market state label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Regime {
    TrendingUp,
    TrendingDown,
    Ranging,
    Volatile,
    Squeeze,
    Dead,
    Unknown(SmolStr),
}

impl Regime {
    /// Parse a server label, tolerant of case and `-`/` ` separators.
    pub fn parse(label: &str) -> Self {
        let normalised = label.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalised.as_str() {
            "trending_up" | "trend_up" | "uptrend" | "bull" | "bullish" => Regime::TrendingUp,
            "trending_down" | "trend_down" | "downtrend" | "bear" | "bearish" => {
                Regime::TrendingDown
            }
            "ranging" | "range" | "sideways" => Regime::Ranging,
            "volatile" | "high_volatility" => Regime::Volatile,
            "squeeze" | "compression" => Regime::Squeeze,
            "dead" | "quiet" => Regime::Dead,
            _ => Regime::Unknown(SmolStr::new(label.trim())),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Regime::TrendingUp => "TRENDING_UP",
            Regime::TrendingDown => "TRENDING_DOWN",
            Regime::Ranging => "RANGING",
            Regime::Volatile => "VOLATILE",
            Regime::Squeeze => "SQUEEZE",
            Regime::Dead => "DEAD",
            Regime::Unknown(label) => label.as_str(),
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Field value compared between renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FieldValue {
    Number(f64),
    Label(SmolStr),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regime_signal(symbol: &str, timeframe: &str, timestamp: i64) -> Signal {
        Signal {
            kind: SignalKind::Regime,
            scope: Some(SmolStr::new(timeframe)),
            symbol: SmolStr::new(symbol),
            exchange: None,
            timestamp,
            received_at: timestamp,
            data: SignalData::Regime(RegimeUpdate {
                timeframe: SmolStr::new(timeframe),
                regime: Regime::Ranging,
                adx: 18.0,
                atr_pct: 0.4,
            }),
        }
    }

    #[test]
    fn test_regime_parse() {
        struct TestCase {
            input: &'static str,
            expected: Regime,
        }

        let tests = vec![
            TestCase {
                // TC0: canonical upper case label
                input: "TRENDING_UP",
                expected: Regime::TrendingUp,
            },
            TestCase {
                // TC1: dashed lower case label
                input: "trending-down",
                expected: Regime::TrendingDown,
            },
            TestCase {
                // TC2: synonym
                input: "Sideways",
                expected: Regime::Ranging,
            },
            TestCase {
                // TC3: unknown label is preserved verbatim
                input: "Accumulation",
                expected: Regime::Unknown(SmolStr::new("Accumulation")),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = Regime::parse(test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_signal_key_and_identity() {
        let a = regime_signal("BTCUSDT", "1m", 100);
        let b = regime_signal("BTCUSDT", "5m", 100);

        assert_eq!(a.key(), "BTCUSDT:1m");
        assert_ne!(a.identity(), b.identity());
        assert_eq!(a.identity(), regime_signal("BTCUSDT", "1m", 100).identity());
    }

    #[test]
    fn test_price_direction_from_change() {
        assert_eq!(PriceDirection::from_change(-0.5), PriceDirection::Down);
        assert_eq!(PriceDirection::from_change(0.0), PriceDirection::Up);
        assert_eq!(PriceDirection::Down.to_string(), "down");
    }
}
