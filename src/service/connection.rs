//! Per-client connection shell.
//!
//! [`ClientConnection`] owns one [`Transport`], reassembles frames from the
//! bytes it is fed, runs them through the login handshake and, once the client
//! is authenticated, through the [`Dispatcher`]. It performs no I/O of its own:
//! the driver feeds it bytes with [`ClientConnection::on_read`] and drains what
//! it wrote into the transport.
//!
//! Replies are written whole or not at all. When the transport reports
//! [`TransportError::WouldBlock`] the framed reply is parked and no further
//! frames are processed until [`ClientConnection::resume`] has flushed it.

use crate::config::NetworkConfig;
use crate::core::frame::{frame_bytes, FrameReader, HEADER_LEN};
use crate::core::marshal::{self, Value};
use crate::error::{constants, ProtocolError, Result, TransportError};
use crate::protocol::dispatcher::{Dispatcher, LoggingHandler, PacketHandler};
use crate::protocol::handshake::{
    version_record, Authenticator, HandshakeContext, HandshakeState, LoginGranted, ServerHandshake,
    UserId,
};
use crate::protocol::message::Message;
use crate::protocol::records::Record;
use crate::service::session::{Session, SessionLink, SessionRegistry};
use crate::utils::compression;
use crate::utils::metrics::{Metrics, Timer};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Byte sink for one client socket.
///
/// `write` is all-or-nothing: it either accepts the whole slice or returns an
/// error having written nothing.
pub trait Transport {
    fn peer_addr(&self) -> SocketAddr;

    fn is_connected(&self) -> bool;

    /// Free space in the outgoing buffer.
    fn available(&self) -> usize;

    fn write(&mut self, data: &[u8]) -> std::result::Result<usize, TransportError>;

    fn disconnect(&mut self);
}

/// Passed to [`SessionHandlerFactory::on_authenticated`] once a login succeeds.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub session: Arc<Session>,
    pub user_id: UserId,
    pub peer: SocketAddr,
}

/// Supplies the packet handler for each authenticated connection.
pub trait SessionHandlerFactory: Send + Sync {
    fn on_authenticated(&self, auth: &Authenticated) -> Box<dyn PacketHandler + Send>;
}

/// Factory that logs every message and never replies.
#[derive(Debug, Default)]
pub struct LoggingHandlerFactory;

impl SessionHandlerFactory for LoggingHandlerFactory {
    fn on_authenticated(&self, _auth: &Authenticated) -> Box<dyn PacketHandler + Send> {
        Box::new(LoggingHandler)
    }
}

/// Shared services every connection of a server uses.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<NetworkConfig>,
    pub registry: Arc<SessionRegistry>,
    pub metrics: Arc<Metrics>,
    pub authenticator: Arc<dyn Authenticator>,
    pub handlers: Arc<dyn SessionHandlerFactory>,
}

impl ServerContext {
    pub fn new(
        config: NetworkConfig,
        authenticator: Arc<dyn Authenticator>,
        handlers: Arc<dyn SessionHandlerFactory>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            metrics: Arc::new(Metrics::new()),
            authenticator,
            handlers,
        }
    }
}

/// What the driver should do after feeding bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// All complete frames were processed; read more
    Idle,
    /// Replies are parked; drain the transport and call `resume`
    Blocked,
    /// The connection is closed
    Closed,
}

pub struct ClientConnection<T: Transport> {
    id: u64,
    peer: SocketAddr,
    transport: T,
    ctx: ServerContext,
    reader: FrameReader,
    inbound: BytesMut,
    handshake: ServerHandshake,
    /// Present once authenticated
    dispatcher: Option<Dispatcher>,
    session: Option<Arc<Session>>,
    /// Framed replies the transport had no room for, in send order
    stalled: VecDeque<Bytes>,
    /// Holds one slot of the registry's connected count
    counted: bool,
    announced: bool,
    closed: bool,
}

impl<T: Transport> ClientConnection<T> {
    pub fn new(transport: T, ctx: ServerContext) -> Self {
        let id = ctx.registry.next_connection_id();
        let peer = transport.peer_addr();
        let max_payload = ctx.config.transport.max_payload_size;
        Self {
            id,
            peer,
            transport,
            ctx,
            reader: FrameReader::new(max_payload),
            inbound: BytesMut::with_capacity(4096),
            handshake: ServerHandshake::new(),
            dispatcher: None,
            session: None,
            stalled: VecDeque::new(),
            counted: false,
            announced: false,
            closed: false,
        }
    }

    /// Wrap a transport whose slot was already taken with
    /// [`SessionRegistry::try_increment_connected`]. The slot is given back on
    /// disconnect or drop.
    pub fn with_reserved_slot(transport: T, ctx: ServerContext) -> Self {
        let mut conn = Self::new(transport, ctx);
        conn.counted = true;
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_authenticated(&self) -> bool {
        self.dispatcher.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// Number of framed replies waiting for room in the transport.
    pub fn stalled_frames(&self) -> usize {
        self.stalled.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Count the connection and announce the server version.
    pub fn on_connect(&mut self) -> Result<()> {
        if self.announced || self.closed {
            return Ok(());
        }
        self.announced = true;
        if !self.counted {
            self.counted = true;
            self.ctx.registry.increment_connected();
        }
        self.ctx.metrics.connection_established();
        info!(peer = %self.peer, connection_id = self.id, "Client connected");

        let version = version_record(&self.ctx.config.protocol, self.ctx.registry.authorized_count());
        if let Err(e) = self.send_value(&version) {
            self.on_disconnect();
            return Err(e);
        }
        Ok(())
    }

    /// Feed received bytes and process every complete frame.
    pub fn on_read(&mut self, data: &[u8]) -> ReadStatus {
        if self.closed {
            return ReadStatus::Closed;
        }
        self.inbound.extend_from_slice(data);
        self.pump()
    }

    /// Retry parked replies, then continue with buffered frames.
    pub fn resume(&mut self) -> ReadStatus {
        if self.closed {
            return ReadStatus::Closed;
        }
        while let Some(frame) = self.stalled.front() {
            match self.transport.write(frame) {
                Ok(n) => {
                    self.ctx.metrics.frame_sent(n as u64);
                    self.stalled.pop_front();
                }
                Err(TransportError::WouldBlock) => return ReadStatus::Blocked,
                Err(TransportError::Closed) => {
                    self.on_disconnect();
                    return ReadStatus::Closed;
                }
            }
        }
        self.pump()
    }

    /// Tear the connection down. Safe to call more than once.
    pub fn on_disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.counted {
            self.ctx.registry.decrement_connected();
        }
        if self.announced {
            self.ctx.metrics.connection_closed();
        }

        if let Some(session) = self.session.take() {
            // a newer connection may already own the session
            self.ctx.registry.release(&session, self.id);
        }

        self.dispatcher = None;
        self.stalled.clear();
        self.inbound.clear();
        self.transport.disconnect();
        info!(peer = %self.peer, connection_id = self.id, "Client disconnected");
    }

    fn pump(&mut self) -> ReadStatus {
        loop {
            if self.closed {
                return ReadStatus::Closed;
            }
            if !self.stalled.is_empty() {
                return ReadStatus::Blocked;
            }

            let payload = match self.reader.try_extract_frame(&mut self.inbound) {
                Ok(Some(payload)) => payload,
                Ok(None) => return ReadStatus::Idle,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Framing error, closing connection");
                    self.on_disconnect();
                    return ReadStatus::Closed;
                }
            };

            self.ctx
                .metrics
                .frame_received((payload.len() + HEADER_LEN) as u64);

            if let Err(e) = self.process_frame(&payload) {
                warn!(peer = %self.peer, state = %self.handshake.state(), error = %e, "Closing connection");
                if !self.is_authenticated() {
                    self.ctx.metrics.handshake_failed();
                }
                self.on_disconnect();
                return ReadStatus::Closed;
            }

            if !self.transport.is_connected() {
                self.on_disconnect();
                return ReadStatus::Closed;
            }
        }
    }

    /// Handle one frame payload. An error closes the connection.
    fn process_frame(&mut self, payload: &[u8]) -> Result<()> {
        let _timer = Timer::start("process_frame");
        let max_payload = self.ctx.config.transport.max_payload_size;

        let decoded = compression::maybe_decompress(payload, max_payload)
            .and_then(|raw| marshal::decode(&raw).map_err(ProtocolError::from));

        if self.is_authenticated() {
            match decoded {
                Ok(value) => self.process_message(value),
                Err(e) => {
                    self.ctx.metrics.decode_error();
                    warn!(peer = %self.peer, error = %e, "Dropping undecodable frame");
                    Ok(())
                }
            }
        } else {
            let value = decoded.map_err(|e| {
                self.ctx.metrics.decode_error();
                e
            })?;
            self.process_handshake(value)
        }
    }

    fn process_handshake(&mut self, value: Value) -> Result<()> {
        let transition = {
            let ctx = HandshakeContext {
                config: &self.ctx.config.protocol,
                user_count: self.ctx.registry.authorized_count(),
                peer: self.peer,
                authenticator: self.ctx.authenticator.as_ref(),
            };
            self.handshake.handle(value, &ctx)?
        };

        for reply in &transition.replies {
            self.send_value(reply)?;
        }

        if let Some(login) = transition.login {
            self.establish_session(login);
        }
        Ok(())
    }

    fn establish_session(&mut self, login: LoginGranted) {
        let link = SessionLink {
            connection_id: self.id,
            peer: self.peer,
        };
        let session =
            self.ctx
                .registry
                .attach_and_register(login.user_id, &login.user_name, &login.language_id, link);

        let handler = self.ctx.handlers.on_authenticated(&Authenticated {
            session: session.clone(),
            user_id: login.user_id,
            peer: self.peer,
        });

        self.dispatcher = Some(Dispatcher::new(handler));
        self.session = Some(session);
        self.ctx.metrics.handshake_success();
        debug!(peer = %self.peer, user_id = login.user_id, "Connection authenticated");
    }

    fn process_message(&mut self, value: Value) -> Result<()> {
        if let Value::PackedObject1(exception) = &value {
            // client-side exception report; nothing to route
            warn!(peer = %self.peer, class = %exception.class_path, "Client sent exception, discarding");
            return Ok(());
        }

        let message = match Message::decode(value) {
            Ok(message) => message,
            Err(e) => {
                self.ctx.metrics.decode_error();
                warn!(peer = %self.peer, error = %e, "Dropping malformed message");
                return Ok(());
            }
        };

        let outcome = match self.dispatcher.as_mut() {
            Some(dispatcher) => dispatcher.dispatch(message),
            None => Err(ProtocolError::UnexpectedMessage(constants::ERR_MISSING_LOGIN)),
        };

        match outcome {
            Ok(Some(reply)) => self.send_value(&reply),
            Ok(None) => Ok(()),
            Err(e) => {
                self.ctx.metrics.dispatch_error();
                warn!(peer = %self.peer, error = %e, "Message rejected");
                Ok(())
            }
        }
    }

    /// Marshal, optionally compress, frame and write one value.
    pub fn send_value(&mut self, value: &Value) -> Result<()> {
        if self.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = marshal::encode(value);
        let transport = &self.ctx.config.transport;

        let payload = if transport.compression_enabled {
            let (out, compressed) = compression::maybe_compress(
                &encoded,
                transport.compression_level,
                transport.compression_threshold_bytes,
            )?;
            if compressed {
                self.ctx.metrics.frame_compressed();
            }
            out
        } else {
            encoded
        };

        let frame = frame_bytes(&payload)?;
        self.send_frame(frame)
    }

    fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        if !self.stalled.is_empty() {
            self.stalled.push_back(frame);
            return Ok(());
        }
        match self.transport.write(&frame) {
            Ok(n) => {
                self.ctx.metrics.frame_sent(n as u64);
                Ok(())
            }
            Err(TransportError::WouldBlock) => {
                debug!(
                    peer = %self.peer,
                    available = self.transport.available(),
                    frame_len = frame.len(),
                    "{}", constants::ERR_OUTPUT_BLOCKED
                );
                self.ctx.metrics.write_stalled();
                self.stalled.push_back(frame);
                Ok(())
            }
            Err(TransportError::Closed) => Err(ProtocolError::Transport(TransportError::Closed)),
        }
    }
}

impl<T: Transport> Drop for ClientConnection<T> {
    fn drop(&mut self) {
        self.on_disconnect();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::frame::encode_frame;
    use crate::protocol::handshake::CredentialTable;

    struct MockTransport {
        written: Vec<u8>,
        capacity: usize,
        connected: bool,
    }

    impl Transport for MockTransport {
        fn peer_addr(&self) -> SocketAddr {
            "10.0.0.1:4000".parse().unwrap()
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn available(&self) -> usize {
            self.capacity.saturating_sub(self.written.len())
        }

        fn write(&mut self, data: &[u8]) -> std::result::Result<usize, TransportError> {
            if !self.connected {
                return Err(TransportError::Closed);
            }
            if data.len() > self.available() {
                return Err(TransportError::WouldBlock);
            }
            self.written.extend_from_slice(data);
            Ok(data.len())
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }
    }

    fn context() -> ServerContext {
        let config = NetworkConfig::default_with_overrides(|c| c.transport.compression_enabled = false);
        ServerContext::new(
            config,
            Arc::new(CredentialTable::new()),
            Arc::new(LoggingHandlerFactory),
        )
    }

    fn connection(capacity: usize) -> ClientConnection<MockTransport> {
        ClientConnection::new(
            MockTransport {
                written: Vec::new(),
                capacity,
                connected: true,
            },
            context(),
        )
    }

    fn framed(value: &Value) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_frame(&marshal::encode(value), &mut out).unwrap();
        out.to_vec()
    }

    #[test]
    fn test_connect_sends_version() {
        let mut conn = connection(1 << 16);
        conn.on_connect().unwrap();
        assert_eq!(conn.ctx.registry.connected_count(), 1);
        let expected = framed(&version_record(&conn.ctx.config.protocol, 0));
        assert_eq!(conn.transport().written, expected);
    }

    #[test]
    fn test_bad_version_closes() {
        let mut conn = connection(1 << 16);
        conn.on_connect().unwrap();
        let status = conn.on_read(&framed(&Value::Integer(1)));
        assert_eq!(status, ReadStatus::Closed);
        assert!(conn.is_closed());
        assert!(!conn.transport().connected);
        assert_eq!(conn.ctx.registry.connected_count(), 0);
    }

    #[test]
    fn test_would_block_parks_replies() {
        let mut conn = connection(1 << 16);
        conn.on_connect().unwrap();
        let version = version_record(&conn.ctx.config.protocol, 0);
        let qc = Value::Tuple(vec!["QC".into(), Value::None]);

        let mut input = framed(&version);
        input.extend(framed(&qc));
        input.extend(framed(&version));

        // room for nothing more
        conn.transport_mut().capacity = conn.transport().written.len();
        assert_eq!(conn.on_read(&input), ReadStatus::Blocked);
        assert_eq!(conn.stalled_frames(), 2);
        assert_eq!(conn.handshake_state(), HandshakeState::AwaitingVersion);

        conn.transport_mut().written.clear();
        conn.transport_mut().capacity = 1 << 16;
        assert_eq!(conn.resume(), ReadStatus::Idle);
        assert_eq!(conn.stalled_frames(), 0);
        assert_eq!(conn.handshake_state(), HandshakeState::AwaitingCommand);
    }

    #[test]
    fn test_reserved_slot_is_counted_once() {
        let ctx = context();
        let registry = ctx.registry.clone();
        assert!(registry.try_increment_connected(1));
        let mut conn = ClientConnection::with_reserved_slot(
            MockTransport {
                written: Vec::new(),
                capacity: 1 << 16,
                connected: true,
            },
            ctx,
        );
        conn.on_connect().unwrap();
        assert_eq!(registry.connected_count(), 1);
        drop(conn);
        assert_eq!(registry.connected_count(), 0);
    }

    #[test]
    fn test_reserved_slot_released_without_connect() {
        let ctx = context();
        let registry = ctx.registry.clone();
        assert!(registry.try_increment_connected(1));
        let conn = ClientConnection::with_reserved_slot(
            MockTransport {
                written: Vec::new(),
                capacity: 1 << 16,
                connected: true,
            },
            ctx,
        );
        drop(conn);
        assert_eq!(registry.connected_count(), 0);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut conn = connection(1 << 16);
        conn.on_connect().unwrap();
        let registry = conn.ctx.registry.clone();
        conn.on_disconnect();
        conn.on_disconnect();
        drop(conn);
        assert_eq!(registry.connected_count(), 0);
    }
}
