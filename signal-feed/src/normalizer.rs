//! Normalisation boundary: converts heterogeneous raw payloads into canonical [`Signal`]s.
//!
//! Servers omit derived fields, mix camelCase and snake_case names and send numbers as strings.
//! All of that is resolved here, deterministically, so a fully-populated signal passes through a
//! second normalisation unchanged.

use crate::{
    error::NormalizeError,
    router::Route,
    signal::{
        PriceChangeSignal, PriceDirection, Regime, RegimeUpdate, Signal, SignalData,
        TimeframeCoin, TriggerDirection, TriggerEvent, VolatilitySignal, VolumeSignal,
        kind::SignalKind,
        time::epoch_millis,
    },
};
use serde_json::{Map, Value};
use smol_str::SmolStr;

const SYMBOL: &[&str] = &["symbol", "s", "ticker", "pair", "coin"];
const EXCHANGE: &[&str] = &["exchange", "ex"];
const TIMESTAMP: &[&str] = &["timestamp", "time", "ts", "t", "eventTime", "createdAt"];

/// Default multiplier applied to `range` when the server omits `avgRange`.
///
/// Placeholder heuristic, not a measured average, hence configurable.
pub const DEFAULT_AVG_RANGE_FACTOR: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizerConfig {
    /// `avg_range = range * avg_range_factor` when `avg_range` is absent.
    pub avg_range_factor: f64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            avg_range_factor: DEFAULT_AVG_RANGE_FACTOR,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Normalise a raw `payload` delivered on `route` into zero or more [`Signal`]s.
    ///
    /// Top lists may carry several coins in one payload, every other kind yields exactly one
    /// signal. `received_at` stamps local receipt time and is the fallback event time.
    pub fn normalize(
        &self,
        route: &Route,
        payload: &Value,
        received_at: i64,
    ) -> Result<Vec<Signal>, NormalizeError> {
        match route.kind {
            SignalKind::VolatilitySpike | SignalKind::VolatilityRange => {
                let object = as_object(route.kind, payload)?;
                let data = self.volatility(route.kind, object)?;
                base(route, object, received_at, SignalData::Volatility(data)).map(|s| vec![s])
            }
            SignalKind::VolumeSpike => {
                let object = as_object(route.kind, payload)?;
                let data = volume(object)?;
                base(route, object, received_at, SignalData::Volume(data)).map(|s| vec![s])
            }
            SignalKind::PriceChange => {
                let object = as_object(route.kind, payload)?;
                let data = price_change(object)?;
                base(route, object, received_at, SignalData::PriceChange(data)).map(|s| vec![s])
            }
            SignalKind::TopGainers | SignalKind::TopLosers => {
                top_list(route, payload, received_at)
            }
            SignalKind::TriggerGainers | SignalKind::TriggerLosers => {
                trigger(route, payload, received_at).map(|s| vec![s])
            }
            SignalKind::Regime => {
                let object = as_object(route.kind, payload)?;
                regime(route, object, received_at).map(|s| vec![s])
            }
        }
    }

    /// Re-apply derivations to an already normalised signal. Idempotent.
    pub fn renormalize(&self, signal: &Signal) -> Signal {
        let mut signal = signal.clone();
        match &mut signal.data {
            SignalData::Volatility(volatility) => self.fill_volatility(volatility),
            SignalData::PriceChange(price) => {
                price.direction = derive_direction(price.direction, price.price_change);
            }
            _ => {}
        }
        signal
    }

    /// Apply the volatility fallback chain in order, later steps consume earlier results:
    /// 1. `range = high - low`
    /// 2. `avg_range = range * avg_range_factor`
    /// 3. `range_ratio = range / avg_range`
    /// 4. `volatility_change = (range_ratio - 1) * 100`, else `(range / avg_range - 1) * 100`,
    ///    else `0`
    ///
    /// Only applied to fields that are absent, so a populated signal is left untouched.
    pub fn fill_volatility(&self, signal: &mut VolatilitySignal) {
        if signal.range.is_none() {
            if let (Some(high), Some(low)) = (signal.high, signal.low) {
                signal.range = Some(high - low);
            }
        }

        if signal.avg_range.is_none() {
            signal.avg_range = signal.range.map(|range| range * self.config.avg_range_factor);
        }

        if signal.range_ratio.is_none() {
            if let (Some(range), Some(avg_range)) = (signal.range, signal.avg_range) {
                if avg_range != 0.0 {
                    signal.range_ratio = Some(range / avg_range);
                }
            }
        }
    }

    fn volatility(
        &self,
        kind: SignalKind,
        object: &Map<String, Value>,
    ) -> Result<VolatilitySignal, NormalizeError> {
        let mut signal = VolatilitySignal {
            volatility: number(object, &["volatility", "vol", "volatilityPercent"])
                .ok_or(NormalizeError::MissingField {
                    kind,
                    field: "volatility",
                })?,
            volatility_change: 0.0,
            interval: text(object, &["interval", "timeframe", "tf"]),
            open: number(object, &["open", "o"]),
            high: number(object, &["high", "h"]),
            low: number(object, &["low", "l"]),
            close: number(object, &["close", "c"]),
            range: number(object, &["range"]),
            avg_range: number(object, &["avgRange", "avg_range", "averageRange"]),
            range_ratio: number(object, &["rangeRatio", "range_ratio"]),
        };
        self.fill_volatility(&mut signal);

        signal.volatility_change = match number(object, &["volatilityChange", "volatility_change"]) {
            Some(change) => change,
            None => volatility_change_fallback(&signal),
        };

        Ok(signal)
    }
}

/// Step 4 of the volatility fallback chain.
fn volatility_change_fallback(signal: &VolatilitySignal) -> f64 {
    if let Some(ratio) = signal.range_ratio {
        return (ratio - 1.0) * 100.0;
    }

    match (signal.range, signal.avg_range) {
        (Some(range), Some(avg_range)) if avg_range != 0.0 => (range / avg_range - 1.0) * 100.0,
        _ => 0.0,
    }
}

fn volume(object: &Map<String, Value>) -> Result<VolumeSignal, NormalizeError> {
    let volume = number(object, &["volume", "vol", "v", "currentVolume"]).ok_or(
        NormalizeError::MissingField {
            kind: SignalKind::VolumeSpike,
            field: "volume",
        },
    )?;

    let change = number(object, &["change", "volumeChange", "changePercent", "volume_change"])
        .or_else(|| {
            number(object, &["avgVolume", "averageVolume", "avg_volume"])
                .filter(|average| *average != 0.0)
                .map(|average| (volume / average - 1.0) * 100.0)
        })
        .unwrap_or(0.0);

    Ok(VolumeSignal { volume, change })
}

fn price_change(object: &Map<String, Value>) -> Result<PriceChangeSignal, NormalizeError> {
    let missing = |field| NormalizeError::MissingField {
        kind: SignalKind::PriceChange,
        field,
    };

    let price = number(object, &["price", "lastPrice", "close", "p"]).ok_or(missing("price"))?;
    let change = number(object, &["priceChange", "price_change", "change"]);
    let percent = number(
        object,
        &["priceChangePercent", "price_change_percent", "changePercent", "percentChange"],
    );

    let (price_change, price_change_percent) = match (change, percent) {
        (Some(change), Some(percent)) => (change, percent),
        (None, Some(percent)) => {
            let scale = 1.0 + percent / 100.0;
            if scale == 0.0 {
                return Err(missing("priceChange"));
            }
            (price - price / scale, percent)
        }
        (Some(change), None) => {
            let reference = price - change;
            if reference == 0.0 {
                return Err(missing("priceChangePercent"));
            }
            (change, change / reference * 100.0)
        }
        (None, None) => return Err(missing("priceChangePercent")),
    };

    let direction = match text(object, &["direction", "dir"]).as_deref() {
        Some("up") | Some("UP") => PriceDirection::Up,
        Some("down") | Some("DOWN") => PriceDirection::Down,
        _ => PriceDirection::from_change(price_change),
    };

    Ok(PriceChangeSignal {
        price,
        price_change,
        price_change_percent,
        direction: derive_direction(direction, price_change),
    })
}

/// An explicit server direction wins unless it contradicts a non-zero change.
fn derive_direction(direction: PriceDirection, price_change: f64) -> PriceDirection {
    if price_change == 0.0 {
        direction
    } else {
        PriceDirection::from_change(price_change)
    }
}

fn top_list(
    route: &Route,
    payload: &Value,
    received_at: i64,
) -> Result<Vec<Signal>, NormalizeError> {
    if route.scope.is_none() {
        return Err(NormalizeError::InvalidPayload {
            kind: route.kind,
            detail: "top list route has no timeframe".to_string(),
        });
    }

    // List level timestamp applies to coins that carry none
    let (coins, list_time) = match payload {
        Value::Array(coins) => (coins.as_slice(), None),
        Value::Object(object) => match field(object, &["data", "coins", "items", "list"]) {
            Some(Value::Array(coins)) => (coins.as_slice(), timestamp(object)?),
            _ => (std::slice::from_ref(payload), None),
        },
        other => {
            return Err(NormalizeError::InvalidPayload {
                kind: route.kind,
                detail: format!("expected object or array, got {other}"),
            });
        }
    };

    coins
        .iter()
        .map(|coin| {
            let object = as_object(route.kind, coin)?;
            let percent_change = number(
                object,
                &["percentChange", "priceChangePercent", "percent_change", "change", "pct"],
            )
            .ok_or(NormalizeError::MissingField {
                kind: route.kind,
                field: "percentChange",
            })?;

            let data = TimeframeCoin {
                percent_change,
                last_price: number(object, &["lastPrice", "price", "close"]),
                volume: number(object, &["volume", "vol"]),
                quote_volume: number(object, &["quoteVolume", "quote_volume", "turnover"]),
                funding_rate: number(object, &["fundingRate", "funding_rate", "funding"]),
            };

            let mut signal = base(route, object, received_at, SignalData::TimeframeCoin(data))?;
            if field(object, TIMESTAMP).is_none() {
                signal.timestamp = list_time.unwrap_or(received_at);
            }
            Ok(signal)
        })
        .collect()
}

fn trigger(route: &Route, payload: &Value, received_at: i64) -> Result<Signal, NormalizeError> {
    let direction = match route.kind {
        SignalKind::TriggerLosers => TriggerDirection::Losers,
        _ => TriggerDirection::Gainers,
    };

    let (symbols, object) = match payload {
        Value::String(symbol) => (vec![SmolStr::new(symbol)], None),
        Value::Array(items) => (symbol_list(items), None),
        Value::Object(object) => {
            let symbols = match field(object, &["symbols", "data", "coins"]) {
                Some(Value::Array(items)) => symbol_list(items),
                _ => text(object, SYMBOL).into_iter().collect(),
            };
            (symbols, Some(object))
        }
        other => {
            return Err(NormalizeError::InvalidPayload {
                kind: route.kind,
                detail: format!("expected symbol, list or object, got {other}"),
            });
        }
    };

    let Some(first) = symbols.first().cloned() else {
        return Err(NormalizeError::MissingField {
            kind: route.kind,
            field: "symbols",
        });
    };

    let timestamp = match object {
        Some(object) => timestamp(object)?,
        None => None,
    };

    Ok(Signal {
        kind: route.kind,
        scope: route.scope.clone(),
        symbol: first,
        exchange: object.and_then(|object| text(object, EXCHANGE)),
        timestamp: timestamp.unwrap_or(received_at),
        received_at,
        data: SignalData::Trigger(TriggerEvent { direction, symbols }),
    })
}

fn symbol_list(items: &[Value]) -> Vec<SmolStr> {
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(symbol) => Some(SmolStr::new(symbol)),
            Value::Object(object) => text(object, SYMBOL),
            _ => None,
        })
        .collect()
}

fn regime(
    route: &Route,
    object: &Map<String, Value>,
    received_at: i64,
) -> Result<Signal, NormalizeError> {
    let missing = |field| NormalizeError::MissingField {
        kind: SignalKind::Regime,
        field,
    };

    let timeframe = text(object, &["timeframe", "tf", "interval"])
        .or_else(|| route.scope.clone())
        .ok_or(missing("timeframe"))?;
    let regime = text(object, &["regime", "state", "label"]).ok_or(missing("regime"))?;

    let data = RegimeUpdate {
        timeframe: timeframe.clone(),
        regime: Regime::parse(&regime),
        adx: number(object, &["adx", "ADX"]).unwrap_or(0.0),
        atr_pct: number(object, &["atrPct", "atr_pct", "atrPercent"]).unwrap_or(0.0),
    };

    let scoped = Route::scoped(SignalKind::Regime, timeframe);
    base(&scoped, object, received_at, SignalData::Regime(data))
}

/// Populate the fields common to every kind.
fn base(
    route: &Route,
    object: &Map<String, Value>,
    received_at: i64,
    data: SignalData,
) -> Result<Signal, NormalizeError> {
    let symbol = text(object, SYMBOL).ok_or(NormalizeError::MissingField {
        kind: route.kind,
        field: "symbol",
    })?;

    Ok(Signal {
        kind: route.kind,
        scope: route.scope.clone(),
        symbol,
        exchange: text(object, EXCHANGE),
        timestamp: timestamp(object)?.unwrap_or(received_at),
        received_at,
        data,
    })
}

fn as_object(kind: SignalKind, payload: &Value) -> Result<&Map<String, Value>, NormalizeError> {
    payload
        .as_object()
        .ok_or_else(|| NormalizeError::InvalidPayload {
            kind,
            detail: format!("expected object, got {payload}"),
        })
}

fn timestamp(object: &Map<String, Value>) -> Result<Option<i64>, NormalizeError> {
    match field(object, TIMESTAMP) {
        Some(value) => epoch_millis(value),
        None => Ok(None),
    }
}

/// First non-null value among `names`.
fn field<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| object.get(*name))
        .find(|value| !value.is_null())
}

fn number(object: &Map<String, Value>, names: &[&str]) -> Option<f64> {
    let number = match field(object, names)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|number| number.is_finite())
}

fn text(object: &Map<String, Value>, names: &[&str]) -> Option<SmolStr> {
    match field(object, names)? {
        Value::String(text) if !text.trim().is_empty() => Some(SmolStr::new(text.trim())),
        Value::Number(number) => Some(SmolStr::new(number.to_string())),
        _ => None,
    }
}
