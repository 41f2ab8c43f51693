use crate::{
    error::ConfigError,
    highlight::DEFAULT_HIGHLIGHT_TTL,
    normalizer::NormalizerConfig,
    store::StoreCaps,
    subscription::RegimeSubscription,
    transport::{TransportConfig, WireFormat},
};
use std::{str::FromStr, time::Duration};

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub transport: TransportConfig,
    pub normalizer: NormalizerConfig,
    pub caps: StoreCaps,
    /// Subscription sent on first connect when nothing was requested explicitly.
    pub default_subscription: Option<RegimeSubscription>,
    /// REST base url used to seed regime history, disabled when `None`.
    pub snapshot_url: Option<String>,
    pub highlight_ttl: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            normalizer: NormalizerConfig::default(),
            caps: StoreCaps::default(),
            default_subscription: None,
            snapshot_url: None,
            highlight_ttl: DEFAULT_HIGHLIGHT_TTL,
        }
    }
}

impl FeedConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            ..Default::default()
        }
    }

    pub fn with_default_subscription(mut self, subscription: RegimeSubscription) -> Self {
        self.default_subscription = Some(subscription);
        self
    }

    pub fn with_caps(mut self, caps: StoreCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_normalizer(mut self, normalizer: NormalizerConfig) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_snapshot_url(mut self, url: impl Into<String>) -> Self {
        self.snapshot_url = Some(url.into());
        self
    }

    /// Build a configuration from `SIGNAL_FEED_*` environment variables, defaulting anything
    /// unset:
    ///
    /// | Variable                              | Default                 |
    /// |---------------------------------------|-------------------------|
    /// | `SIGNAL_FEED_URL`                     | `ws://127.0.0.1:3001`   |
    /// | `SIGNAL_FEED_PATH`                    | per wire format         |
    /// | `SIGNAL_FEED_WIRE_FORMAT`             | `envelope`              |
    /// | `SIGNAL_FEED_TRANSPORTS`              | `websocket`             |
    /// | `SIGNAL_FEED_RECONNECT_ATTEMPTS`      | `5`                     |
    /// | `SIGNAL_FEED_RECONNECT_DELAY_MS`      | `1000`                  |
    /// | `SIGNAL_FEED_RECONNECT_MULTIPLIER`    | `2`, at least `2`       |
    /// | `SIGNAL_FEED_CONNECT_TIMEOUT_SECS`    | `15`                    |
    /// | `SIGNAL_FEED_READ_TIMEOUT_SECS`       | `120`                   |
    /// | `SIGNAL_FEED_PING_INTERVAL_SECS`      | `30`                    |
    /// | `SIGNAL_FEED_SYMBOLS`                 | none                    |
    /// | `SIGNAL_FEED_TIMEFRAMES`              | `1m,5m,15m,1h` with symbols |
    /// | `SIGNAL_FEED_AVG_RANGE_FACTOR`        | `0.8`                   |
    /// | `SIGNAL_FEED_SNAPSHOT_URL`            | none                    |
    /// | `SIGNAL_FEED_HIGHLIGHT_TTL_MS`        | `2000`                  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut config = FeedConfig::default();

        let transport = &mut config.transport;
        if let Some(url) = env.get("SIGNAL_FEED_URL") {
            transport.url = url;
        }
        transport.path = env.get("SIGNAL_FEED_PATH");
        if let Some(format) = env.get("SIGNAL_FEED_WIRE_FORMAT") {
            transport.wire_format =
                WireFormat::from_str(&format).map_err(|value| ConfigError::InvalidValue {
                    key: "SIGNAL_FEED_WIRE_FORMAT",
                    value,
                })?;
        }
        if let Some(transports) = env.list("SIGNAL_FEED_TRANSPORTS", str::to_lowercase) {
            transport.transports = transports;
        }

        let backoff = &mut transport.backoff;
        backoff.max_attempts = env
            .parse("SIGNAL_FEED_RECONNECT_ATTEMPTS")?
            .unwrap_or(backoff.max_attempts);
        backoff.backoff_ms_initial = env
            .parse("SIGNAL_FEED_RECONNECT_DELAY_MS")?
            .unwrap_or(backoff.backoff_ms_initial);
        if let Some(multiplier) = env.parse::<u32>("SIGNAL_FEED_RECONNECT_MULTIPLIER")? {
            // Delays must grow between attempts
            if multiplier < 2 {
                return Err(ConfigError::InvalidValue {
                    key: "SIGNAL_FEED_RECONNECT_MULTIPLIER",
                    value: multiplier.to_string(),
                });
            }
            backoff.backoff_multiplier = multiplier;
        }

        if let Some(secs) = env.parse("SIGNAL_FEED_CONNECT_TIMEOUT_SECS")? {
            transport.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse("SIGNAL_FEED_READ_TIMEOUT_SECS")? {
            transport.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse("SIGNAL_FEED_PING_INTERVAL_SECS")? {
            transport.ping_interval = Duration::from_secs(secs);
        }

        // Validate early so a bad url surfaces at startup rather than on first connect
        transport.endpoint()?;

        if let Some(symbols) = env.list("SIGNAL_FEED_SYMBOLS", str::to_uppercase) {
            let timeframes = env
                .list("SIGNAL_FEED_TIMEFRAMES", str::to_string)
                .unwrap_or_else(|| ["1m", "5m", "15m", "1h"].map(String::from).to_vec());
            config.default_subscription = Some(RegimeSubscription::new(symbols, timeframes));
        }

        if let Some(factor) = env.parse::<f64>("SIGNAL_FEED_AVG_RANGE_FACTOR")? {
            if !factor.is_finite() || factor <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: "SIGNAL_FEED_AVG_RANGE_FACTOR",
                    value: factor.to_string(),
                });
            }
            config.normalizer.avg_range_factor = factor;
        }

        config.snapshot_url = env.get("SIGNAL_FEED_SNAPSHOT_URL");
        if let Some(millis) = env.parse("SIGNAL_FEED_HIGHLIGHT_TTL_MS")? {
            config.highlight_ttl = Duration::from_millis(millis);
        }

        Ok(config)
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        self.get(key)
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue { key, value })
            })
            .transpose()
    }

    /// Comma separated list, `None` if unset or empty.
    fn list(&self, key: &str, map: impl Fn(&str) -> String) -> Option<Vec<String>> {
        let list: Vec<String> = self
            .get(key)?
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(map)
            .collect();

        (!list.is_empty()).then_some(list)
    }
}
