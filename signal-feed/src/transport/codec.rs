//! Text frame codecs.
//!
//! Two wire formats are supported:
//! - [`WireFormat::Envelope`]: every text frame is a JSON `{"event": .., "data": ..}` object.
//! - [`WireFormat::SocketIo`]: Engine.IO v4 packets carrying Socket.IO v5 packets, eg/
//!   `0{"sid":..}` (open), `2`/`3` (ping/pong), `40` (namespace connect), `42["event",data]`.

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use smol_str::SmolStr;
use std::str::FromStr;

/// Inbound or outbound named event with its raw JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(alias = "type")]
    pub event: SmolStr,
    #[serde(default)]
    pub data: Value,
}

impl RawMessage {
    pub fn new(event: impl Into<SmolStr>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(RawMessage),
    /// Engine.IO handshake, the namespace connect must follow.
    Open,
    /// Namespace connect acknowledged by the server.
    Connected,
    Ping,
    Pong,
    /// Engine.IO close or Socket.IO namespace disconnect initiated by the server.
    Close,
    /// Namespace connect refused by the server.
    ConnectError(String),
    Ignored,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    #[default]
    #[display("envelope")]
    Envelope,
    #[display("socket_io")]
    SocketIo,
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "envelope" | "json" => Ok(WireFormat::Envelope),
            "socket_io" | "socketio" | "socket.io" => Ok(WireFormat::SocketIo),
            other => Err(other.to_string()),
        }
    }
}

impl WireFormat {
    pub fn decode(&self, text: &str) -> Result<Frame, TransportError> {
        match self {
            WireFormat::Envelope => serde_json::from_str::<RawMessage>(text)
                .map(Frame::Event)
                .map_err(|error| TransportError::Parse(error.to_string())),
            WireFormat::SocketIo => decode_socket_io(text),
        }
    }

    pub fn encode(&self, event: &str, data: &Value) -> Result<String, TransportError> {
        let encoded = match self {
            WireFormat::Envelope => serde_json::to_string(&json!({ "event": event, "data": data })),
            WireFormat::SocketIo if data.is_null() => {
                serde_json::to_string(&json!([event])).map(|array| format!("42{array}"))
            }
            WireFormat::SocketIo => {
                serde_json::to_string(&json!([event, data])).map(|array| format!("42{array}"))
            }
        };

        encoded.map_err(|error| TransportError::Parse(error.to_string()))
    }

    /// Frame sent in response to the Engine.IO handshake.
    pub fn namespace_connect(&self) -> Option<&'static str> {
        match self {
            WireFormat::Envelope => None,
            WireFormat::SocketIo => Some("40"),
        }
    }

    /// Frame answering a server ping.
    pub fn pong(&self) -> Option<&'static str> {
        match self {
            WireFormat::Envelope => None,
            WireFormat::SocketIo => Some("3"),
        }
    }

    /// Envelope connections are kept alive with WebSocket pings, Engine.IO servers ping us.
    pub fn sends_keepalive(&self) -> bool {
        matches!(self, WireFormat::Envelope)
    }
}

fn decode_socket_io(text: &str) -> Result<Frame, TransportError> {
    let mut chars = text.chars();

    let frame = match chars.next() {
        Some('0') => Frame::Open,
        Some('1') => Frame::Close,
        Some('2') => Frame::Ping,
        Some('3') => Frame::Pong,
        Some('6') => Frame::Ignored,
        Some('4') => match chars.next() {
            Some('0') => Frame::Connected,
            Some('1') => Frame::Close,
            Some('2') => decode_socket_io_event(&text[2..])?,
            Some('4') => Frame::ConnectError(connect_error_message(&text[2..])),
            _ => Frame::Ignored,
        },
        _ => {
            return Err(TransportError::Parse(format!(
                "unrecognised Engine.IO packet: {text}"
            )));
        }
    };

    Ok(frame)
}

fn decode_socket_io_event(packet: &str) -> Result<Frame, TransportError> {
    // Strip optional "/namespace," then optional ack id
    let packet = match packet.strip_prefix('/') {
        Some(rest) => rest.split_once(',').map_or("", |(_, payload)| payload),
        None => packet,
    };
    let packet = packet.trim_start_matches(|c: char| c.is_ascii_digit());

    let array = serde_json::from_str::<Vec<Value>>(packet)
        .map_err(|error| TransportError::Parse(error.to_string()))?;

    let mut values = array.into_iter();
    let event = match values.next() {
        Some(Value::String(event)) => SmolStr::from(event),
        _ => {
            return Err(TransportError::Parse(
                "Socket.IO event packet without event name".to_string(),
            ));
        }
    };

    Ok(Frame::Event(RawMessage::new(
        event,
        values.next().unwrap_or(Value::Null),
    )))
}

fn connect_error_message(payload: &str) -> String {
    serde_json::from_str::<Value>(payload)
        .ok()
        .and_then(|value| value.get("message")?.as_str().map(str::to_string))
        .unwrap_or_else(|| payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_envelope() {
        struct TestCase {
            input: &'static str,
            expected: Result<Frame, ()>,
        }

        let tests = vec![
            TestCase {
                // TC0: event with data
                input: r#"{"event":"volumeSpike","data":{"symbol":"BTCUSDT"}}"#,
                expected: Ok(Frame::Event(RawMessage::new(
                    "volumeSpike",
                    json!({"symbol": "BTCUSDT"}),
                ))),
            },
            TestCase {
                // TC1: data omitted
                input: r#"{"event":"regime:unsubscribed"}"#,
                expected: Ok(Frame::Event(RawMessage::new(
                    "regime:unsubscribed",
                    Value::Null,
                ))),
            },
            TestCase {
                // TC2: "type" accepted in place of "event"
                input: r#"{"type":"welcome","data":null}"#,
                expected: Ok(Frame::Event(RawMessage::new("welcome", Value::Null))),
            },
            TestCase {
                // TC3: not JSON
                input: "hello",
                expected: Err(()),
            },
            TestCase {
                // TC4: JSON without an event name
                input: r#"{"data":1}"#,
                expected: Err(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = WireFormat::Envelope.decode(test.input).map_err(|_| ());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_decode_socket_io() {
        struct TestCase {
            input: &'static str,
            expected: Result<Frame, ()>,
        }

        let tests = vec![
            TestCase {
                // TC0: handshake
                input: r#"0{"sid":"abc","pingInterval":25000,"pingTimeout":20000}"#,
                expected: Ok(Frame::Open),
            },
            TestCase {
                // TC1: namespace ack
                input: r#"40{"sid":"def"}"#,
                expected: Ok(Frame::Connected),
            },
            TestCase {
                // TC2: ping
                input: "2",
                expected: Ok(Frame::Ping),
            },
            TestCase {
                // TC3: event with payload
                input: r#"42["regime:update",{"symbol":"ETHUSDT"}]"#,
                expected: Ok(Frame::Event(RawMessage::new(
                    "regime:update",
                    json!({"symbol": "ETHUSDT"}),
                ))),
            },
            TestCase {
                // TC4: namespaced event with ack id
                input: r#"42/feed,17["top:gainers:5min",[]]"#,
                expected: Ok(Frame::Event(RawMessage::new(
                    "top:gainers:5min",
                    json!([]),
                ))),
            },
            TestCase {
                // TC5: connect error
                input: r#"44{"message":"Not authorized"}"#,
                expected: Ok(Frame::ConnectError("Not authorized".to_string())),
            },
            TestCase {
                // TC6: malformed event payload
                input: "42[oops",
                expected: Err(()),
            },
            TestCase {
                // TC7: unknown packet type
                input: "x",
                expected: Err(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = WireFormat::SocketIo.decode(test.input).map_err(|_| ());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_encode() {
        let data = json!({"symbols": ["BTCUSDT"], "timeframes": ["1m"]});

        assert_eq!(
            WireFormat::SocketIo.encode("regime:subscribe", &data).unwrap(),
            r#"42["regime:subscribe",{"symbols":["BTCUSDT"],"timeframes":["1m"]}]"#
        );
        assert_eq!(
            WireFormat::SocketIo
                .encode("regime:unsubscribe", &Value::Null)
                .unwrap(),
            r#"42["regime:unsubscribe"]"#
        );

        let envelope = WireFormat::Envelope.encode("regime:subscribe", &data).unwrap();
        assert_eq!(
            WireFormat::Envelope.decode(&envelope).unwrap(),
            Frame::Event(RawMessage::new("regime:subscribe", data))
        );
    }

    #[test]
    fn test_wire_format_from_str() {
        assert_eq!("socket.io".parse::<WireFormat>(), Ok(WireFormat::SocketIo));
        assert_eq!("Envelope".parse::<WireFormat>(), Ok(WireFormat::Envelope));
        assert_eq!("grpc".parse::<WireFormat>(), Err("grpc".to_string()));
    }
}
