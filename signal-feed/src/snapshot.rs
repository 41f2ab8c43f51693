//! REST snapshot of regime history, used to seed the store before live updates arrive.

use crate::error::{ConfigError, SnapshotError};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone)]
pub struct SnapshotClient {
    http: Client,
    base_url: Url,
}

impl SnapshotClient {
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        let base_url = Url::parse(base_url).map_err(|error| ConfigError::InvalidUrl {
            url: base_url.to_string(),
            detail: error.to_string(),
        })?;

        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    pub fn history_url(&self, symbol: &str, timeframe: &str, limit: usize) -> Url {
        let mut url = self.base_url.clone();
        url.set_path("/api/regime/history");
        url.query_pairs_mut()
            .append_pair("symbol", symbol)
            .append_pair("timeframe", timeframe)
            .append_pair("limit", &limit.to_string());
        url
    }

    /// Fetch up to `limit` regime points as raw `regime:update` payloads.
    pub async fn regime_history(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Value>, SnapshotError> {
        let url = self.history_url(symbol, timeframe, limit);
        debug!(%url, "fetching regime history");

        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;

        parse_history(body, symbol, timeframe)
    }
}

/// Accepts a bare array or `{ "data": [...] }`, filling in `symbol` and `timeframe` where a point
/// omits them.
pub fn parse_history(body: Value, symbol: &str, timeframe: &str) -> Result<Vec<Value>, SnapshotError> {
    let points = match body {
        Value::Array(points) => points,
        Value::Object(mut object) => match object.remove("data") {
            Some(Value::Array(points)) => points,
            _ => {
                return Err(SnapshotError::Decode(
                    "expected an array or an object with a data array".to_string(),
                ));
            }
        },
        other => {
            return Err(SnapshotError::Decode(format!(
                "unexpected snapshot body: {other}"
            )));
        }
    };

    Ok(points
        .into_iter()
        .filter_map(|point| match point {
            Value::Object(mut object) => {
                object
                    .entry("symbol")
                    .or_insert_with(|| Value::from(symbol));
                object
                    .entry("timeframe")
                    .or_insert_with(|| Value::from(timeframe));
                Some(Value::Object(object))
            }
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_url() {
        let client = SnapshotClient::new("https://signals.example.com/app").unwrap();
        assert_eq!(
            client.history_url("BTCUSDT", "1h", 50).as_str(),
            "https://signals.example.com/api/regime/history?symbol=BTCUSDT&timeframe=1h&limit=50"
        );
    }

    #[test]
    fn test_parse_history() {
        struct TestCase {
            input: Value,
            expected: Result<usize, ()>,
        }

        let tests = vec![
            TestCase {
                // TC0: bare array
                input: json!([{ "regime": "RANGING", "timestamp": 1 }, { "regime": "DEAD", "timestamp": 2 }]),
                expected: Ok(2),
            },
            TestCase {
                // TC1: wrapped, non object points dropped
                input: json!({ "data": [{ "regime": "SQUEEZE" }, 42] }),
                expected: Ok(1),
            },
            TestCase {
                // TC2: wrong shape
                input: json!({ "error": "nope" }),
                expected: Err(()),
            },
            TestCase {
                // TC3
                input: json!("nope"),
                expected: Err(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = parse_history(test.input, "BTCUSDT", "1h")
                .map(|points| points.len())
                .map_err(|_| ());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_parse_history_fills_identity() {
        let points = parse_history(
            json!([{ "regime": "VOLATILE", "symbol": "ETHUSDT" }]),
            "BTCUSDT",
            "4h",
        )
        .unwrap();

        assert_eq!(points[0]["symbol"], "ETHUSDT");
        assert_eq!(points[0]["timeframe"], "4h");
    }
}
