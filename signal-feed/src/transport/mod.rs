//! Reconnecting push-event connection.
//!
//! A [`Transport`] owns at most one physical WebSocket connection at a time. Its connection task
//! decodes inbound text frames with the configured [`WireFormat`], dispatches them to registered
//! listeners in arrival order, and reconnects with exponential backoff after anything other than
//! a clean close, until [`Transport::disconnect`] is called or the attempt cap is reached.

use crate::error::{ConfigError, TransportError};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use smol_str::SmolStr;
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message, Utf8Bytes,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, error, info, warn};
use url::Url;

pub mod backoff;
pub mod codec;
pub mod timeout;

pub use backoff::ReconnectionBackoffPolicy;
pub use codec::{Frame, RawMessage, WireFormat};
use timeout::TimeoutStream;

/// Transport connection configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Server URL, `http(s)` schemes are mapped to `ws(s)`.
    pub url: String,
    /// Request path, defaults to `/socket.io/` for [`WireFormat::SocketIo`] and to the URL's own
    /// path otherwise.
    pub path: Option<String>,
    pub wire_format: WireFormat,
    /// Transport preference list, must include `websocket`.
    pub transports: Vec<String>,
    pub backoff: ReconnectionBackoffPolicy,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Keepalive ping interval for [`WireFormat::Envelope`] connections.
    pub ping_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3001".to_string(),
            path: None,
            wire_format: WireFormat::default(),
            transports: vec!["websocket".to_string()],
            backoff: ReconnectionBackoffPolicy::default(),
            connect_timeout: Duration::from_secs(15),
            read_timeout: timeout::DEFAULT_READ_TIMEOUT,
            ping_interval: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_wire_format(mut self, wire_format: WireFormat) -> Self {
        self.wire_format = wire_format;
        self
    }

    pub fn with_transports(mut self, transports: Vec<String>) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_backoff(mut self, backoff: ReconnectionBackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Build the WebSocket endpoint this configuration connects to.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        if !self
            .transports
            .iter()
            .any(|transport| transport.eq_ignore_ascii_case("websocket"))
        {
            return Err(ConfigError::UnsupportedTransports(self.transports.clone()));
        }

        let invalid = |detail: String| ConfigError::InvalidUrl {
            url: self.url.clone(),
            detail,
        };

        let mut url = Url::parse(&self.url).map_err(|error| invalid(error.to_string()))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(invalid(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|()| invalid(format!("cannot use scheme {scheme}")))?;

        match (&self.path, self.wire_format) {
            (Some(path), _) => url.set_path(path),
            (None, WireFormat::SocketIo) => url.set_path("/socket.io/"),
            (None, WireFormat::Envelope) => {}
        }

        if self.wire_format == WireFormat::SocketIo {
            url.query_pairs_mut()
                .append_pair("EIO", "4")
                .append_pair("transport", "websocket");
        }

        Ok(url)
    }
}

/// Listener channel, see [`Transport::on`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Connect,
    Disconnect,
    Reconnecting,
    Error,
    /// Messages with this literal event name, routed or not.
    Message(SmolStr),
    /// Every inbound message.
    AnyMessage,
}

impl Channel {
    pub fn message(event: impl Into<SmolStr>) -> Self {
        Channel::Message(event.into())
    }

    fn matches(&self, event: &TransportEvent) -> bool {
        match (self, event) {
            (Channel::Connect, TransportEvent::Connect)
            | (Channel::Disconnect, TransportEvent::Disconnect(_))
            | (Channel::Reconnecting, TransportEvent::Reconnecting { .. })
            | (Channel::Error, TransportEvent::Error(_))
            | (Channel::AnyMessage, TransportEvent::Message(_)) => true,
            (Channel::Message(name), TransportEvent::Message(message)) => *name == message.event,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DisconnectReason {
    /// [`Transport::disconnect`] was called.
    #[display("requested")]
    Requested,
    /// The server closed the connection with a normal close frame.
    #[display("closed")]
    Closed,
    /// The connection dropped, a reconnect follows if attempts remain.
    #[display("lost")]
    Lost,
}

/// Event delivered to transport listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connect,
    Disconnect(DisconnectReason),
    Reconnecting { attempt: u32, delay: Duration },
    Error(TransportError),
    Message(RawMessage),
}

/// Connection status updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ConnectionStatus {
    #[display("disconnected")]
    Disconnected,
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected,
    #[display("reconnecting")]
    Reconnecting,
}

/// Handle returned by [`Transport::on`], used to remove exactly that listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

struct Listener {
    id: ListenerId,
    channel: Channel,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<Listener>,
}

#[derive(Debug)]
enum Command {
    Send(String),
    Close,
}

struct Connection {
    /// Bumped by every `connect` and `disconnect`, so tasks from a previous connection can tell
    /// they were superseded.
    generation: u64,
    status: ConnectionStatus,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

struct Inner {
    config: TransportConfig,
    endpoint: Url,
    listeners: Mutex<Listeners>,
    connection: Mutex<Connection>,
}

/// Cloneable handle to one reconnecting connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("status", &self.status())
            .finish()
    }
}

/// Non-owning [`Transport`] handle, for listeners registered on the transport itself.
#[derive(Clone)]
pub struct WeakTransport {
    inner: Weak<Inner>,
}

impl WeakTransport {
    pub fn upgrade(&self) -> Option<Transport> {
        self.inner.upgrade().map(|inner| Transport { inner })
    }
}

impl Transport {
    pub fn new(config: TransportConfig) -> Result<Self, ConfigError> {
        let endpoint = config.endpoint()?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                endpoint,
                listeners: Mutex::new(Listeners::default()),
                connection: Mutex::new(Connection {
                    generation: 0,
                    status: ConnectionStatus::Disconnected,
                    commands: None,
                }),
            }),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakTransport {
        WeakTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.connection.lock().status
    }

    /// True iff a physical connection exists and is open.
    pub fn is_active(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Start the connection task. No-op while connecting, connected or waiting to reconnect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let (generation, commands) = {
            let mut connection = self.inner.connection.lock();
            if connection.status != ConnectionStatus::Disconnected {
                debug!(status = %connection.status, "connect ignored, connection already active");
                return;
            }

            let (tx, rx) = mpsc::unbounded_channel();
            connection.generation += 1;
            connection.status = ConnectionStatus::Connecting;
            connection.commands = Some(tx);
            (connection.generation, rx)
        };

        info!(endpoint = %self.inner.endpoint, "connecting");
        tokio::spawn(Arc::clone(&self.inner).run(generation, commands));
    }

    /// Close the connection and suppress automatic reconnection, cancelling any pending
    /// reconnect timer.
    pub fn disconnect(&self) {
        let previous = {
            let mut connection = self.inner.connection.lock();
            let previous = connection.status;
            connection.generation += 1;
            connection.status = ConnectionStatus::Disconnected;
            if let Some(commands) = connection.commands.take() {
                let _ = commands.send(Command::Close);
            }
            previous
        };

        if previous != ConnectionStatus::Disconnected {
            info!(endpoint = %self.inner.endpoint, "disconnected by request");
            self.inner
                .dispatch(&TransportEvent::Disconnect(DisconnectReason::Requested));
        }
    }

    /// Register a listener, returning the id to remove it with.
    pub fn on<F>(&self, channel: Channel, handler: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.register(channel, false, Arc::new(handler))
    }

    /// Register a listener removed after its first invocation.
    pub fn once<F>(&self, channel: Channel, handler: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.register(channel, true, Arc::new(handler))
    }

    /// Remove exactly one listener. Returns false if it was already removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.entries.len();
        listeners.entries.retain(|listener| listener.id != id);
        listeners.entries.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().entries.len()
    }

    /// Queue `event` for sending if the connection is open, otherwise drop it with a warning.
    pub fn emit(&self, event: &str, data: Value) -> bool {
        let frame = match self.inner.config.wire_format.encode(event, &data) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(event, %error, "failed to encode outbound event");
                return false;
            }
        };

        let connection = self.inner.connection.lock();
        match (&connection.commands, connection.status) {
            (Some(commands), ConnectionStatus::Connected) => {
                commands.send(Command::Send(frame)).is_ok()
            }
            (_, status) => {
                warn!(event, %status, "emit dropped, transport is not connected");
                false
            }
        }
    }

    /// Surface a non-fatal error raised outside the connection task on the `error` channel.
    pub(crate) fn report(&self, error: TransportError) {
        self.inner.dispatch(&TransportEvent::Error(error))
    }

    #[cfg(test)]
    pub(crate) fn dispatch(&self, event: &TransportEvent) {
        self.inner.dispatch(event)
    }
}

/// How a single physical connection ended.
enum Session {
    /// Disconnect requested or transport handle superseded.
    Shutdown,
    /// Server sent a normal close frame.
    Closed,
    Failed {
        error: TransportError,
        opened: bool,
    },
}

impl Inner {
    fn register(&self, channel: Channel, once: bool, handler: Handler) -> ListenerId {
        let mut listeners = self.listeners.lock();
        listeners.next_id += 1;
        let id = ListenerId(listeners.next_id);
        listeners.entries.push(Listener {
            id,
            channel,
            once,
            handler,
        });
        id
    }

    /// Invoke every listener matching `event`, in registration order, without holding the
    /// registry lock. A panicking listener is logged and skipped.
    fn dispatch(&self, event: &TransportEvent) {
        let handlers: Vec<Handler> = {
            let mut listeners = self.listeners.lock();
            let handlers = listeners
                .entries
                .iter()
                .filter(|listener| listener.channel.matches(event))
                .map(|listener| Arc::clone(&listener.handler))
                .collect();
            listeners
                .entries
                .retain(|listener| !(listener.once && listener.channel.matches(event)));
            handlers
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(?event, "transport listener panicked");
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connection.lock().generation == generation
    }

    /// Update the status if `generation` is still current.
    fn transition(&self, generation: u64, status: ConnectionStatus) -> bool {
        let mut connection = self.connection.lock();
        if connection.generation != generation {
            return false;
        }
        connection.status = status;
        if status == ConnectionStatus::Disconnected {
            connection.commands = None;
        }
        true
    }

    async fn run(self: Arc<Self>, generation: u64, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut attempt = 0;

        loop {
            match self.session(generation, &mut commands).await {
                Session::Shutdown => {
                    debug!(endpoint = %self.endpoint, "connection task stopped");
                    return;
                }
                Session::Closed => {
                    info!(endpoint = %self.endpoint, "server closed connection");
                    if self.transition(generation, ConnectionStatus::Disconnected) {
                        self.dispatch(&TransportEvent::Disconnect(DisconnectReason::Closed));
                    }
                    return;
                }
                Session::Failed { error, opened } => {
                    if !self.is_current(generation) {
                        return;
                    }
                    warn!(endpoint = %self.endpoint, %error, "connection failed");
                    if opened {
                        attempt = 0;
                        self.dispatch(&TransportEvent::Disconnect(DisconnectReason::Lost));
                    }
                    self.dispatch(&TransportEvent::Error(error));
                }
            }

            attempt += 1;
            let Some(delay) = self.config.backoff.delay(attempt) else {
                let attempts = attempt - 1;
                error!(endpoint = %self.endpoint, attempts, "reconnect attempts exhausted");
                if self.transition(generation, ConnectionStatus::Disconnected) {
                    self.dispatch(&TransportEvent::Error(TransportError::ReconnectExhausted {
                        attempts,
                    }));
                }
                return;
            };

            if !self.transition(generation, ConnectionStatus::Reconnecting) {
                return;
            }
            debug!(attempt, ?delay, "waiting before reconnecting");
            self.dispatch(&TransportEvent::Reconnecting { attempt, delay });

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = commands.recv() => match command {
                        Some(Command::Send(_)) => continue,
                        Some(Command::Close) | None => return,
                    },
                }
            }

            if !self.transition(generation, ConnectionStatus::Connecting) {
                return;
            }
        }
    }

    async fn session(
        &self,
        generation: u64,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Session {
        let format = self.config.wire_format;
        let url = self.endpoint.as_str();

        let connect = tokio::time::timeout(self.config.connect_timeout, connect_async(url));
        tokio::pin!(connect);
        let connect = loop {
            tokio::select! {
                result = &mut connect => break result,
                command = commands.recv() => match command {
                    Some(Command::Send(_)) => debug!("dropping frame queued by a previous connection"),
                    Some(Command::Close) | None => return Session::Shutdown,
                },
            }
        };

        let socket = match connect {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(error)) => {
                return Session::Failed {
                    error: TransportError::Connect {
                        url: url.to_string(),
                        detail: error.to_string(),
                    },
                    opened: false,
                };
            }
            Err(_) => {
                return Session::Failed {
                    error: TransportError::ConnectTimeout {
                        url: url.to_string(),
                        timeout: self.config.connect_timeout,
                    },
                    opened: false,
                };
            }
        };

        let (mut write, read) = socket.split();
        let mut read = TimeoutStream::new(read, self.config.read_timeout);
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );

        // Engine.IO connections are open once the namespace connect is acknowledged
        let mut opened = false;
        if format.namespace_connect().is_none() {
            if !self.open(generation) {
                return Session::Shutdown;
            }
            opened = true;
        }

        loop {
            tokio::select! {
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            return match frame {
                                Some(CloseFrame { code: CloseCode::Normal, .. }) => Session::Closed,
                                other => Session::Failed {
                                    error: TransportError::UncleanClose {
                                        code: other.as_ref().map(|frame| u16::from(frame.code)),
                                        reason: other
                                            .map(|frame| frame.reason.as_str().to_string())
                                            .unwrap_or_default(),
                                    },
                                    opened,
                                },
                            };
                        }
                        Some(Ok(Message::Binary(_))) => {
                            debug!("ignoring binary frame");
                            continue;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(error)) => {
                            return Session::Failed { error: error.into(), opened };
                        }
                        None if read.timed_out() => {
                            return Session::Failed {
                                error: TransportError::ReadTimeout { idle: read.timeout() },
                                opened,
                            };
                        }
                        None => {
                            return Session::Failed {
                                error: TransportError::UncleanClose {
                                    code: None,
                                    reason: "connection dropped without close frame".to_string(),
                                },
                                opened,
                            };
                        }
                    };

                    match format.decode(text.as_str()) {
                        Ok(Frame::Event(message)) => {
                            if !self.is_current(generation) {
                                return Session::Shutdown;
                            }
                            self.dispatch(&TransportEvent::Message(message));
                        }
                        Ok(Frame::Open) => {
                            if let Some(connect) = format.namespace_connect() {
                                if let Err(error) = write.send(Message::text(connect)).await {
                                    return Session::Failed { error: error.into(), opened };
                                }
                            }
                        }
                        Ok(Frame::Connected) => {
                            if !opened {
                                if !self.open(generation) {
                                    return Session::Shutdown;
                                }
                                opened = true;
                            }
                        }
                        Ok(Frame::Ping) => {
                            if let Some(pong) = format.pong() {
                                if let Err(error) = write.send(Message::text(pong)).await {
                                    return Session::Failed { error: error.into(), opened };
                                }
                            }
                        }
                        Ok(Frame::Close) => {
                            return Session::Failed {
                                error: TransportError::UncleanClose {
                                    code: None,
                                    reason: "server ended the session".to_string(),
                                },
                                opened,
                            };
                        }
                        Ok(Frame::ConnectError(message)) => {
                            return Session::Failed {
                                error: TransportError::Protocol {
                                    event: SmolStr::new_static("connect_error"),
                                    message,
                                },
                                opened,
                            };
                        }
                        Ok(Frame::Pong | Frame::Ignored) => {}
                        Err(error) => {
                            warn!(%error, "dropping malformed frame");
                            debug!(payload = text.as_str(), "malformed frame payload");
                            self.dispatch(&TransportEvent::Error(error));
                        }
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Send(frame)) => {
                        if let Err(error) = write.send(Message::text(frame)).await {
                            return Session::Failed { error: error.into(), opened };
                        }
                    }
                    Some(Command::Close) | None => {
                        let close = CloseFrame {
                            code: CloseCode::Normal,
                            reason: Utf8Bytes::from_static("client disconnect"),
                        };
                        let _ = write.send(Message::Close(Some(close))).await;
                        return Session::Shutdown;
                    }
                },
                _ = ping.tick(), if format.sends_keepalive() => {
                    if let Err(error) = write.send(Message::Ping(Default::default())).await {
                        debug!(%error, "failed to send ping, connection likely dead");
                        return Session::Failed { error: error.into(), opened };
                    }
                }
            }
        }
    }

    /// Mark the connection open and notify listeners. False if superseded.
    fn open(&self, generation: u64) -> bool {
        if !self.transition(generation, ConnectionStatus::Connected) {
            return false;
        }
        info!(endpoint = %self.endpoint, "connected");
        self.dispatch(&TransportEvent::Connect);
        true
    }
}
