use super::{
    RegimeUpdate, SignalData, TimeframeCoin, TriggerEvent, VolatilitySignal, VolumeSignal,
    PriceChangeSignal,
};
use serde::{Deserialize, Serialize};

/// Canonical signal kinds recognised by the core, independent of how the server names the raw
/// event.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    VolatilitySpike,
    VolatilityRange,
    VolumeSpike,
    PriceChange,
    TopGainers,
    TopLosers,
    TriggerGainers,
    TriggerLosers,
    Regime,
}

impl SignalKind {
    pub const ALL: [SignalKind; 9] = [
        SignalKind::VolatilitySpike,
        SignalKind::VolatilityRange,
        SignalKind::VolumeSpike,
        SignalKind::PriceChange,
        SignalKind::TopGainers,
        SignalKind::TopLosers,
        SignalKind::TriggerGainers,
        SignalKind::TriggerLosers,
        SignalKind::Regime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::VolatilitySpike => "volatility_spike",
            SignalKind::VolatilityRange => "volatility_range",
            SignalKind::VolumeSpike => "volume_spike",
            SignalKind::PriceChange => "price_change",
            SignalKind::TopGainers => "top_gainers",
            SignalKind::TopLosers => "top_losers",
            SignalKind::TriggerGainers => "trigger_gainers",
            SignalKind::TriggerLosers => "trigger_losers",
            SignalKind::Regime => "regime",
        }
    }

    /// Kinds whose streams are partitioned by a timeframe taken from the raw event name.
    pub fn is_timeframe_scoped(&self) -> bool {
        matches!(
            self,
            SignalKind::TopGainers
                | SignalKind::TopLosers
                | SignalKind::TriggerGainers
                | SignalKind::TriggerLosers
        )
    }

    pub fn is_volatility(&self) -> bool {
        matches!(self, SignalKind::VolatilitySpike | SignalKind::VolatilityRange)
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self, SignalKind::TriggerGainers | SignalKind::TriggerLosers)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pairs a [`SignalKind`] with the payload type its signals carry, so consumers can subscribe to
/// a kind and receive the typed payload without re-inspecting [`SignalData`].
pub trait SignalStream {
    type Event;

    fn kind(&self) -> SignalKind;

    fn event(data: &SignalData) -> Option<&Self::Event>;
}

macro_rules! signal_stream {
    ($(#[$meta:meta])* $name:ident, $kind:expr, $event:ty, $variant:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
        pub struct $name;

        impl SignalStream for $name {
            type Event = $event;

            fn kind(&self) -> SignalKind {
                $kind
            }

            fn event(data: &SignalData) -> Option<&Self::Event> {
                match data {
                    SignalData::$variant(event) => Some(event),
                    _ => None,
                }
            }
        }
    };
}

signal_stream!(
    /// Volatility spikes (`volatilitySpike` and aliases).
    VolatilitySpikes,
    SignalKind::VolatilitySpike,
    VolatilitySignal,
    Volatility
);
signal_stream!(
    /// Range-expansion events sharing the volatility payload.
    VolatilityRanges,
    SignalKind::VolatilityRange,
    VolatilitySignal,
    Volatility
);
signal_stream!(VolumeSpikes, SignalKind::VolumeSpike, VolumeSignal, Volume);
signal_stream!(
    PriceChanges,
    SignalKind::PriceChange,
    PriceChangeSignal,
    PriceChange
);
signal_stream!(
    /// Timeframe scoped top gainers list entries.
    TopGainers,
    SignalKind::TopGainers,
    TimeframeCoin,
    TimeframeCoin
);
signal_stream!(TopLosers, SignalKind::TopLosers, TimeframeCoin, TimeframeCoin);
signal_stream!(
    GainerTriggers,
    SignalKind::TriggerGainers,
    TriggerEvent,
    Trigger
);
signal_stream!(LoserTriggers, SignalKind::TriggerLosers, TriggerEvent, Trigger);
signal_stream!(RegimeUpdates, SignalKind::Regime, RegimeUpdate, Regime);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::VolumeSignal;

    #[test]
    fn test_signal_kind_display() {
        assert_eq!(SignalKind::VolatilitySpike.to_string(), "volatility_spike");
        assert_eq!(SignalKind::Regime.to_string(), "regime");
    }

    #[test]
    fn test_timeframe_scoped_kinds() {
        let scoped: Vec<_> = SignalKind::ALL
            .into_iter()
            .filter(SignalKind::is_timeframe_scoped)
            .collect();

        assert_eq!(
            scoped,
            vec![
                SignalKind::TopGainers,
                SignalKind::TopLosers,
                SignalKind::TriggerGainers,
                SignalKind::TriggerLosers
            ]
        );
    }

    #[test]
    fn test_signal_stream_event_extraction() {
        let data = SignalData::Volume(VolumeSignal {
            volume: 1200.0,
            change: 310.0,
        });

        assert_eq!(VolumeSpikes.kind(), SignalKind::VolumeSpike);
        assert_eq!(VolumeSpikes::event(&data).map(|v| v.change), Some(310.0));
        assert!(VolatilitySpikes::event(&data).is_none());
    }
}
