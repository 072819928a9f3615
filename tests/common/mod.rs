//! Client-side helpers shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use machonet::config::{NetworkConfig, ProtocolConfig};
use machonet::core::codec::FrameCodec;
use machonet::core::frame::{encode_frame, FrameReader};
use machonet::core::marshal::{self, Dict, PackedObject, Value};
use machonet::error::{Result as ProtocolResult, TransportError};
use machonet::protocol::dispatcher::PacketHandler;
use machonet::protocol::handshake::{version_record, CredentialTable};
use machonet::protocol::message::{
    Address, CallRequest, CallResponse, Message, MessageHeader, MessageKind,
};
use machonet::protocol::records::Record;
use machonet::service::connection::{
    Authenticated, ClientConnection, ServerContext, SessionHandlerFactory, Transport,
};
use machonet::service::server;
use machonet::utils::compression;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub const USER: &str = "alice";
pub const PASSWORD: &str = "secret";
pub const USER_ID: i64 = 42;

// ---------------------------------------------------------------------------
// Client values
// ---------------------------------------------------------------------------

pub fn client_version(config: &ProtocolConfig) -> Value {
    version_record(config, 0)
}

pub fn queue_check() -> Value {
    Value::Tuple(vec!["QC".into(), Value::None])
}

pub fn vip_key() -> Value {
    Value::Tuple(vec![Value::None, "VK".into(), "vipkey".into()])
}

pub fn placebo() -> Value {
    Value::Tuple(vec!["placebo".into(), Value::Dict(Dict::new())])
}

pub fn password(secret: &str) -> Value {
    Value::PackedObject2(PackedObject::new("util.PasswordString", vec![secret.into()]))
}

pub fn challenge(user: &str, password: Value) -> Value {
    let mut dict = Dict::new();
    dict.insert("user_name", user);
    dict.insert("user_password", password);
    dict.insert("user_languageid", "EN");
    Value::Tuple(vec!["client-challenge".into(), Value::Dict(dict)])
}

pub fn handshake_result() -> Value {
    Value::Tuple(vec!["response".into(), Value::None, Value::None])
}

/// Every frame a client sends to log in with a plain password.
pub fn login_sequence(config: &ProtocolConfig, user: &str, secret: &str) -> Vec<Value> {
    vec![
        client_version(config),
        vip_key(),
        placebo(),
        challenge(user, password(secret)),
        handshake_result(),
    ]
}

pub fn call_message(type_string: &str, method: &str) -> Value {
    let mut header = MessageHeader::new(
        MessageKind::CallReq,
        Address::client(USER_ID, Some(1)),
        Address::any("charMgr"),
    );
    header.type_string = type_string.to_owned();
    header.user_id = Some(USER_ID);
    let body = CallRequest {
        remote_object: "charMgr".into(),
        method: method.into(),
        args: vec![],
        kwargs: Dict::new(),
    };
    Message::new(header, body.encode()).encode()
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

pub fn frame(value: &Value) -> Vec<u8> {
    let mut out = BytesMut::new();
    encode_frame(&marshal::encode(value), &mut out).unwrap();
    out.to_vec()
}

pub fn frames(values: &[Value]) -> Vec<u8> {
    values.iter().flat_map(frame).collect()
}

/// Split a server byte stream into decoded values, inflating as needed.
pub fn read_values(bytes: &[u8]) -> Vec<Value> {
    let mut reader = FrameReader::new(1 << 24);
    let mut buf = BytesMut::from(bytes);
    let mut values = Vec::new();
    while let Some(payload) = reader.try_extract_frame(&mut buf).unwrap() {
        let raw = compression::maybe_decompress(&payload, 1 << 24).unwrap();
        values.push(marshal::decode(&raw).unwrap());
    }
    assert!(buf.is_empty(), "partial frame left in server output");
    values
}

// ---------------------------------------------------------------------------
// Connection harness
// ---------------------------------------------------------------------------

pub struct MockTransport {
    pub peer: SocketAddr,
    pub written: Vec<u8>,
    pub capacity: usize,
    pub connected: bool,
}

impl MockTransport {
    pub fn new(port: u16) -> Self {
        Self {
            peer: SocketAddr::from(([192, 168, 1, 10], port)),
            written: Vec::new(),
            capacity: 1 << 20,
            connected: true,
        }
    }

    /// Decode and clear everything written so far.
    pub fn drain(&mut self) -> Vec<Value> {
        let values = read_values(&self.written);
        self.written.clear();
        values
    }
}

impl Transport for MockTransport {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn available(&self) -> usize {
        self.capacity.saturating_sub(self.written.len())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
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

/// Handler that records what it saw and answers every call with its method name.
pub struct EchoCallHandler {
    log: Arc<Mutex<Vec<String>>>,
}

impl PacketHandler for EchoCallHandler {
    fn handle_call_req(&mut self, header: &MessageHeader, call: CallRequest) -> Option<Value> {
        self.log.lock().unwrap().push(format!("call:{}", call.method));
        let reply_header = MessageHeader::new(
            MessageKind::CallRsp,
            header.destination.clone(),
            header.source.clone(),
        );
        let body = CallResponse {
            values: vec![call.method.as_str().into()],
        };
        Some(Message::new(reply_header, body.encode()).encode())
    }
}

#[derive(Default)]
pub struct RecordingFactory {
    pub log: Arc<Mutex<Vec<String>>>,
}

impl SessionHandlerFactory for RecordingFactory {
    fn on_authenticated(&self, auth: &Authenticated) -> Box<dyn PacketHandler + Send> {
        self.log
            .lock()
            .unwrap()
            .push(format!("login:{}@{}", auth.user_id, auth.peer.ip()));
        Box::new(EchoCallHandler {
            log: self.log.clone(),
        })
    }
}

pub fn accounts() -> CredentialTable {
    CredentialTable::new()
        .with_account(USER, PASSWORD, USER_ID)
        .with_account("bob", "hunter2", 7)
}

/// Context with compression off so byte-level assertions stay simple.
pub fn context() -> (ServerContext, Arc<Mutex<Vec<String>>>) {
    context_with(accounts(), |c| c.transport.compression_enabled = false)
}

pub fn context_with<F>(accounts: CredentialTable, mutator: F) -> (ServerContext, Arc<Mutex<Vec<String>>>)
where
    F: FnOnce(&mut NetworkConfig),
{
    let config = NetworkConfig::default_with_overrides(mutator);
    let factory = RecordingFactory::default();
    let log = factory.log.clone();
    (
        ServerContext::new(config, Arc::new(accounts), Arc::new(factory)),
        log,
    )
}

pub fn connect(ctx: &ServerContext, port: u16) -> ClientConnection<MockTransport> {
    let mut conn = ClientConnection::new(MockTransport::new(port), ctx.clone());
    conn.on_connect().unwrap();
    conn
}

// ---------------------------------------------------------------------------
// TCP client
// ---------------------------------------------------------------------------

pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RunningServer {
    pub addr: SocketAddr,
    pub shutdown: mpsc::Sender<()>,
    pub handle: JoinHandle<ProtocolResult<()>>,
}

pub async fn spawn_server(ctx: ServerContext) -> RunningServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = mpsc::channel(1);
    let handle = tokio::spawn(server::serve(listener, ctx, rx));
    RunningServer {
        addr,
        shutdown,
        handle,
    }
}

pub struct TcpClient {
    framed: Framed<TcpStream, FrameCodec>,
}

impl TcpClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, FrameCodec::new(1 << 24)),
        }
    }

    pub async fn send(&mut self, value: &Value) {
        self.framed
            .send(Bytes::from(marshal::encode(value)))
            .await
            .unwrap();
    }

    /// Next value from the server, or `None` once it hangs up.
    pub async fn try_recv(&mut self) -> Option<Value> {
        let next = tokio::time::timeout(REPLY_TIMEOUT, self.framed.next())
            .await
            .expect("server answered in time");
        match next {
            Some(Ok(payload)) => {
                let raw = compression::maybe_decompress(&payload, 1 << 24).unwrap();
                Some(marshal::decode(&raw).unwrap())
            }
            Some(Err(_)) | None => None,
        }
    }

    pub async fn recv(&mut self) -> Value {
        self.try_recv().await.expect("connection still open")
    }

    /// Run the whole login and return the ack.
    pub async fn login(&mut self, config: &ProtocolConfig, user: &str, secret: &str) -> Value {
        let _version = self.recv().await;
        for value in login_sequence(config, user, secret) {
            self.send(&value).await;
        }
        let _crypto_ok = self.recv().await;
        let _server_handshake = self.recv().await;
        self.recv().await
    }
}
