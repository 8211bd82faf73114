//! Channel transport: one authenticated WebSocket with ping/pong and
//! reconnection.
//!
//! The transport owns the socket inside a background task and reports
//! everything that happens on it as [`TransportEvent`]s on a single queue.
//! Callers never see socket errors; they see state changes.

use crate::config::TransportConfig;
use crate::credentials::TokenStore;
use crate::error::{ConnectError, Result, SyncError};
use crate::registry::{Listener, ListenerId, ListenerRegistry};
use chrono::Utc;
use common::messages::is_expiry_code;
use common::{ClientFrame, ControlFrame, Event, RecoveryResponse, ServerFrame};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Result of a connection attempt, shared by every caller waiting on it.
pub type ConnectResult = std::result::Result<ConnectOutcome, ConnectError>;

/// Lifecycle of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, handshake not yet answered.
    Connected,
    Authenticated,
    /// Session lost, waiting to retry.
    Reconnecting,
}

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    /// Client-side session epoch, incremented on every successful handshake.
    pub session: u64,
    /// Server session id from `auth_ok`, if any.
    pub server_session_id: Option<String>,
    pub connected_at_ms: i64,
}

/// Result of [`ChannelTransport::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected(ConnectionHandle),
    /// No credential available; nothing was attempted.
    Skipped,
}

/// Everything the transport reports to its consumer, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// First session of this connection is up.
    Authenticated(ConnectionHandle),
    /// A later session is up after a drop.
    Reconnected(ConnectionHandle),
    /// Sequenced event from the server.
    Frame(Event),
    /// Answer to a `request_missing` frame.
    Recovery(RecoveryResponse),
    /// Session lost; the transport may retry.
    Disconnected,
    /// Credential rejected. No retry follows.
    AuthenticationFailed { reason: String, expired: bool },
    /// Transport stopped for good.
    Closed,
}

/// Outbound side of the channel as seen by the sync pipeline.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &ClientFrame) -> Result<()>;
}

#[derive(Debug)]
enum Command {
    Send(String),
    Shutdown,
}

/// Session status of one link, as seen by [`ChannelTransport::connect`].
#[derive(Debug, Clone)]
enum LinkStatus {
    /// Opening a socket or waiting to retry.
    Pending,
    Up(ConnectionHandle),
    /// The connection task has stopped.
    Finished(ConnectError),
}

impl LinkStatus {
    fn resolved(&self) -> Option<ConnectResult> {
        match self {
            LinkStatus::Pending => None,
            LinkStatus::Up(handle) => Some(Ok(ConnectOutcome::Connected(handle.clone()))),
            LinkStatus::Finished(e) => Some(Err(e.clone())),
        }
    }
}

/// One spawned connection task.
struct Link {
    generation: u64,
    status: watch::Receiver<LinkStatus>,
    command_tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

struct Inner {
    config: TransportConfig,
    tokens: Arc<dyn TokenStore>,
    registry: Arc<ListenerRegistry>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    /// Generation of the current link. Tasks of older links stay silent.
    generation: AtomicU64,
    session_epoch: AtomicU64,
}

impl Inner {
    fn lock_link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        if !self.is_current(generation) {
            return;
        }
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("[{}] {:?} -> {:?}", self.config.label, previous, state);
        }
    }

    fn publish(&self, generation: u64, event: TransportEvent) {
        if self.is_current(generation) {
            let _ = self.events_tx.send(event);
        }
    }

    fn release(&self, generation: u64) {
        let mut link = self.lock_link();
        if link.as_ref().is_some_and(|l| l.generation == generation) {
            *link = None;
        }
    }

    fn next_handle(&self, server_session_id: Option<String>) -> ConnectionHandle {
        ConnectionHandle {
            session: self.session_epoch.fetch_add(1, Ordering::SeqCst) + 1,
            server_session_id,
            connected_at_ms: Utc::now().timestamp_millis(),
        }
    }

    fn spawn_link(self: &Arc<Self>, token: String) -> Link {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(LinkStatus::Pending);

        let task = tokio::spawn(connection_task(
            self.clone(),
            generation,
            token,
            command_rx,
            status_tx,
        ));

        Link {
            generation,
            status,
            command_tx,
            task,
        }
    }
}

/// Handle to the push channel. Cheap to clone; all clones share one socket.
#[derive(Clone)]
pub struct ChannelTransport {
    inner: Arc<Inner>,
}

impl ChannelTransport {
    /// Create a transport. Nothing connects until [`connect`](Self::connect).
    pub fn new(
        config: TransportConfig,
        tokens: Arc<dyn TokenStore>,
        registry: Arc<ListenerRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let transport = Self {
            inner: Arc::new(Inner {
                config,
                tokens,
                registry,
                events_tx,
                state,
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                session_epoch: AtomicU64::new(0),
            }),
        };
        (transport, events_rx)
    }

    /// Connect and authenticate.
    ///
    /// Concurrent and repeated calls share one attempt and one socket. A
    /// call made while the link is retrying waits for the next session and
    /// resolves with its handle, or with the error that stopped the link.
    ///
    /// Fails with [`ConnectError::Closed`] once the event consumer is gone.
    pub async fn connect(&self) -> ConnectResult {
        if self.inner.events_tx.is_closed() {
            debug!("[{}] Event consumer gone, refusing to connect", self.inner.config.label);
            return Err(ConnectError::Closed);
        }

        let mut status = {
            let mut link = self.inner.lock_link();
            match link.as_ref() {
                Some(existing) => existing.status.clone(),
                None => {
                    let Some(token) = self.inner.tokens.token() else {
                        info!("[{}] No credential, skipping connection", self.inner.config.label);
                        return Ok(ConnectOutcome::Skipped);
                    };
                    let spawned = self.inner.spawn_link(token);
                    let status = spawned.status.clone();
                    *link = Some(spawned);
                    status
                }
            }
        };

        let result = match status.wait_for(|s| s.resolved().is_some()).await {
            Ok(current) => current.resolved().unwrap_or(Err(ConnectError::Closed)),
            Err(_) => Err(ConnectError::Closed),
        };
        result
    }

    /// Close the socket with a normal close frame and stop reconnecting.
    pub fn disconnect(&self) {
        let Some(link) = self.inner.lock_link().take() else {
            return;
        };
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        info!("[{}] Disconnecting", self.inner.config.label);

        if link.command_tx.send(Command::Shutdown).is_err() {
            link.task.abort();
        }

        self.inner.state.send_replace(ConnectionState::Disconnected);
        let _ = self.inner.events_tx.send(TransportEvent::Disconnected);
        let _ = self.inner.events_tx.send(TransportEvent::Closed);
    }

    /// Publish an application event on the live session.
    pub fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.send_frame(&ClientFrame::Emit {
            event: event.to_string(),
            payload,
        })
    }

    /// Register a listener. Safe to call before connecting.
    pub fn subscribe(&self, event_type: &str, listener: Listener) {
        self.inner.registry.subscribe(event_type, listener);
    }

    pub fn unsubscribe(&self, event_type: &str, id: ListenerId) -> bool {
        self.inner.registry.unsubscribe(event_type, id)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }
}

impl FrameSink for ChannelTransport {
    fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        if !self.is_authenticated() {
            return Err(SyncError::NotConnected);
        }
        let text = frame.to_text()?;
        let link = self.inner.lock_link();
        let link = link.as_ref().ok_or(SyncError::NotConnected)?;
        link.command_tx
            .send(Command::Send(text))
            .map_err(|_| SyncError::ChannelSend)
    }
}

/// How an authenticated session ended without a socket error.
enum SessionEnd {
    Shutdown,
    Rejected(ConnectError),
}

/// Why a connection attempt did not produce a session.
enum OpenError {
    Rejected { reason: String, code: Option<String> },
    Failed(common::Error),
}

impl From<common::Error> for OpenError {
    fn from(e: common::Error) -> Self {
        OpenError::Failed(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for OpenError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        OpenError::Failed(e.into())
    }
}

struct OpenSession {
    ws: WsStream,
    server_session_id: Option<String>,
    /// Events that arrived before `auth_ok`.
    early: Vec<Event>,
}

async fn connection_task(
    inner: Arc<Inner>,
    generation: u64,
    mut token: String,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<LinkStatus>,
) {
    let config = &inner.config;
    let label = config.label.as_str();
    let mut reconnect_delay = config.reconnect_delay;
    let mut failures: u32 = 0;
    let mut sessions: u64 = 0;

    let terminal: Option<ConnectError> = loop {
        let attempt_state = if sessions == 0 && failures == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
        inner.set_state(generation, attempt_state);

        let opened = tokio::select! {
            opened = open_session(&inner, generation, &token) => opened,
            _ = wait_for_shutdown(&mut command_rx) => break None,
        };

        match opened {
            Ok(OpenSession {
                ws,
                server_session_id,
                early,
            }) => {
                failures = 0;
                reconnect_delay = config.reconnect_delay;

                let handle = inner.next_handle(server_session_id);
                for event in early {
                    inner.publish(generation, TransportEvent::Frame(event));
                }
                inner.set_state(generation, ConnectionState::Authenticated);
                if sessions == 0 {
                    info!("[{}] Authenticated, session {}", label, handle.session);
                    inner.publish(generation, TransportEvent::Authenticated(handle.clone()));
                } else {
                    info!("[{}] Reconnected, session {}", label, handle.session);
                    counter!("sync_reconnects_total").increment(1);
                    inner.publish(generation, TransportEvent::Reconnected(handle.clone()));
                }
                sessions += 1;
                status.send_replace(LinkStatus::Up(handle));

                gauge!("sync_active_connections").increment(1.0);
                let ended = run_session(&inner, generation, ws, &mut command_rx).await;
                gauge!("sync_active_connections").decrement(1.0);

                match ended {
                    Ok(SessionEnd::Shutdown) => break None,
                    Ok(SessionEnd::Rejected(e)) => break Some(e),
                    Err(e) => {
                        warn!("[{}] Session lost: {}", label, e);
                        status.send_replace(LinkStatus::Pending);
                        inner.publish(generation, TransportEvent::Disconnected);
                    }
                }
            }
            Err(OpenError::Rejected { reason, code }) => {
                break Some(ConnectError::AuthenticationFailed {
                    expired: is_expiry_code(code.as_deref()),
                    reason,
                });
            }
            Err(OpenError::Failed(e)) => {
                warn!("[{}] Connection attempt failed: {}", label, e);
            }
        }

        failures += 1;
        if failures >= config.max_reconnect_attempts {
            error!("[{}] Giving up after {} attempts", label, failures);
            break Some(ConnectError::Exhausted(failures));
        }

        inner.set_state(generation, ConnectionState::Reconnecting);
        info!("[{}] Reconnecting in {:?}", label, reconnect_delay);
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = wait_for_shutdown(&mut command_rx) => break None,
        }
        reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay);

        match inner.tokens.token() {
            Some(current) => token = current,
            None => {
                info!("[{}] Credential removed, stopping", label);
                break Some(ConnectError::Closed);
            }
        }
    };

    if let Some(ConnectError::AuthenticationFailed { reason, expired }) = &terminal {
        warn!("[{}] Authentication failed: {} (expired: {})", label, reason, expired);
        if *expired {
            inner.tokens.clear();
        }
        inner.publish(
            generation,
            TransportEvent::AuthenticationFailed {
                reason: reason.clone(),
                expired: *expired,
            },
        );
    }

    inner.set_state(generation, ConnectionState::Disconnected);
    inner.publish(generation, TransportEvent::Closed);
    status.send_replace(LinkStatus::Finished(
        terminal.unwrap_or(ConnectError::Closed),
    ));
    inner.release(generation);
    debug!("[{}] Connection task finished", label);
}

/// Resolves once a shutdown is requested. Sends issued before a session is
/// up are dropped.
async fn wait_for_shutdown(command_rx: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match command_rx.recv().await {
            Some(Command::Send(_)) => debug!("Dropping frame sent before authentication"),
            Some(Command::Shutdown) | None => return,
        }
    }
}

async fn connect_tcp(config: &TransportConfig, url: &Url) -> common::Result<TcpStream> {
    let label = config.label.as_str();
    let host = url
        .host_str()
        .ok_or_else(|| common::Error::Generic("No host in URL".to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| common::Error::Generic("No port in URL".to_string()))?;

    // Prefer IPv4 to avoid IPv6 timeout issues
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| common::Error::Generic(format!("DNS resolution failed: {}", e)))?
        .collect();
    let mut sorted_addrs: Vec<SocketAddr> =
        addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
    sorted_addrs.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());

    debug!("[{}] Resolved addresses (IPv4 first): {:?}", label, sorted_addrs);

    for addr in &sorted_addrs {
        match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!("[{}] TCP connected to {}", label, addr);
                return Ok(stream);
            }
            Ok(Err(e)) => debug!("[{}] TCP connect to {} failed: {}", label, addr, e),
            Err(_) => debug!("[{}] TCP connect to {} timed out", label, addr),
        }
    }

    Err(common::Error::Generic("All connection attempts failed".to_string()))
}

fn tls_connector() -> common::Result<Connector> {
    let mut root_store = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        let _ = root_store.add(cert);
    }

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| common::Error::Generic(format!("TLS config error: {}", e)))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(Connector::Rustls(Arc::new(config)))
}

/// Open the socket and run the `auth` handshake.
async fn open_session(
    inner: &Inner,
    generation: u64,
    token: &str,
) -> std::result::Result<OpenSession, OpenError> {
    let config = &inner.config;
    let label = config.label.as_str();
    info!("[{}] Connecting to {}", label, config.url);

    let url = Url::parse(&config.url).map_err(common::Error::from)?;
    let tcp_stream = connect_tcp(config, &url).await?;
    let connector = match url.scheme() {
        "wss" => Some(tls_connector()?),
        _ => None,
    };

    let (mut ws, response) =
        client_async_tls_with_config(url.as_str(), tcp_stream, None, connector).await?;
    debug!(
        "[{}] WebSocket handshake complete, status: {:?}",
        label,
        response.status()
    );
    inner.set_state(generation, ConnectionState::Connected);

    let auth = ClientFrame::Auth {
        token: token.to_string(),
    };
    ws.send(Message::Text(auth.to_text()?)).await?;

    let mut early = Vec::new();
    let handshake =
        tokio::time::timeout(config.auth_timeout, await_auth(&mut ws, &mut early, label)).await;
    let server_session_id = match handshake {
        Ok(Ok(session_id)) => session_id,
        Ok(Err(e)) => {
            let _ = ws.close(None).await;
            return Err(e);
        }
        Err(_) => {
            let _ = ws.close(None).await;
            return Err(common::Error::Generic("Authentication timed out".to_string()).into());
        }
    };

    Ok(OpenSession {
        ws,
        server_session_id,
        early,
    })
}

/// Read frames until the server answers the `auth` frame.
async fn await_auth(
    ws: &mut WsStream,
    early: &mut Vec<Event>,
    label: &str,
) -> std::result::Result<Option<String>, OpenError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match ServerFrame::parse(&text) {
                Ok(ServerFrame::Control(ControlFrame::AuthOk { session_id })) => {
                    return Ok(session_id);
                }
                Ok(ServerFrame::Control(ControlFrame::AuthError { reason, code })) => {
                    return Err(OpenError::Rejected { reason, code });
                }
                Ok(ServerFrame::Event(event)) => {
                    counter!("sync_events_received_total").increment(1);
                    early.push(event);
                }
                Ok(ServerFrame::Control(other)) => {
                    debug!("[{}] Ignoring {:?} before authentication", label, other);
                }
                Err(e) => warn!("[{}] {}", label, e),
            },
            Some(Ok(Message::Ping(data))) => ws.send(Message::Pong(data)).await?,
            Some(Ok(Message::Close(frame))) => {
                info!("[{}] Closed during handshake: {:?}", label, frame);
                return Err(common::Error::ConnectionClosed.into());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err(common::Error::ConnectionClosed.into()),
        }
    }
}

/// Pump one authenticated session until it ends.
async fn run_session(
    inner: &Inner,
    generation: u64,
    ws: WsStream,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> common::Result<SessionEnd> {
    let label = inner.config.label.as_str();
    let (mut write, mut read) = ws.split();

    let mut ping_interval = interval(inner.config.ping_interval);
    ping_interval.reset(); // Don't fire immediately

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match ServerFrame::parse(&text) {
                        Ok(ServerFrame::Event(event)) => {
                            counter!("sync_events_received_total").increment(1);
                            inner.publish(generation, TransportEvent::Frame(event));
                        }
                        Ok(ServerFrame::Control(ControlFrame::MissedEvents(response))) => {
                            debug!("[{}] Received {} missed events", label, response.events.len());
                            inner.publish(generation, TransportEvent::Recovery(response));
                        }
                        Ok(ServerFrame::Control(ControlFrame::AuthError { reason, code })) => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(SessionEnd::Rejected(ConnectError::AuthenticationFailed {
                                expired: is_expiry_code(code.as_deref()),
                                reason,
                            }));
                        }
                        Ok(ServerFrame::Control(ControlFrame::Pong)) => {
                            debug!("[{}] Received pong", label);
                        }
                        Ok(ServerFrame::Control(ControlFrame::AuthOk { .. })) => {
                            debug!("[{}] Ignoring repeated auth_ok", label);
                        }
                        Err(e) => warn!("[{}] {}", label, e),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        debug!("[{}] Received ping, sending pong", label);
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("[{}] Received close frame: {:?}", label, frame);
                        return Err(common::Error::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("[{}] WebSocket error: {:?}", label, e);
                        return Err(common::Error::WebSocket(e));
                    }
                    None => {
                        info!("[{}] WebSocket stream ended", label);
                        return Err(common::Error::ConnectionClosed);
                    }
                }
            }

            cmd = command_rx.recv() => {
                match cmd {
                    Some(Command::Send(text)) => {
                        write.send(Message::Text(text)).await?;
                    }
                    Some(Command::Shutdown) | None => {
                        info!("[{}] Received shutdown command", label);
                        let close_frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "Shutdown".into(),
                        };
                        let _ = write.send(Message::Close(Some(close_frame))).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
            }

            _ = ping_interval.tick() => {
                debug!("[{}] Sending ping", label);
                write.send(Message::Text(ClientFrame::Ping.to_text()?)).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::credentials::MemoryTokenStore;

    fn transport(
        token: Option<&str>,
    ) -> (ChannelTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let tokens = Arc::new(MemoryTokenStore::new(token.map(str::to_string)));
        let registry = Arc::new(ListenerRegistry::new(&RegistryConfig::default()));
        ChannelTransport::new(TransportConfig::default(), tokens, registry)
    }

    #[tokio::test]
    async fn test_connect_without_credential_is_skipped() {
        let (transport, _events) = transport(None);
        assert_eq!(transport.connect().await, Ok(ConnectOutcome::Skipped));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_emit_requires_session() {
        let (transport, _events) = transport(Some("t"));
        assert!(matches!(
            transport.emit("note", serde_json::json!({})),
            Err(SyncError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_without_consumer() {
        let (transport, events) = transport(Some("t"));
        drop(events);
        assert_eq!(transport.connect().await, Err(ConnectError::Closed));
        assert!(transport.inner.lock_link().is_none());
    }

    #[test]
    fn test_link_status_resolution() {
        assert!(LinkStatus::Pending.resolved().is_none());
        let handle = ConnectionHandle {
            session: 3,
            server_session_id: None,
            connected_at_ms: 0,
        };
        assert_eq!(
            LinkStatus::Up(handle.clone()).resolved(),
            Some(Ok(ConnectOutcome::Connected(handle)))
        );
        assert_eq!(
            LinkStatus::Finished(ConnectError::Exhausted(2)).resolved(),
            Some(Err(ConnectError::Exhausted(2)))
        );
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_noop() {
        let (transport, _events) = transport(Some("t"));
        transport.disconnect();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
