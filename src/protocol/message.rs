//! Application message envelope and the bodies carried after login.
//!
//! Every post-login frame decodes to
//! `Object(type_string, (type_tag, source, destination, user_id, payload, named_payload))`.
//! Addresses are `Object("macho.MachoAddress", (kind, ...))`.

use crate::core::marshal::{Dict, Value};
use crate::error::DecodeError;
use crate::protocol::records::{Fields, Record};
use std::fmt;

/// Object type name wrapping every address
pub const ADDRESS_TYPE: &str = "macho.MachoAddress";

/// Message type tags as carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AuthenticationReq,
    AuthenticationRsp,
    IdentificationReq,
    IdentificationRsp,
    CallReq,
    CallRsp,
    TransportClosed,
    ResolveReq,
    ResolveRsp,
    Notification,
    ErrorResponse,
    SessionChangeNotification,
    SessionInitialState,
    PingReq,
    PingRsp,
}

impl MessageKind {
    pub fn from_tag(tag: i64) -> Option<Self> {
        let kind = match tag {
            0 => MessageKind::AuthenticationReq,
            1 => MessageKind::AuthenticationRsp,
            2 => MessageKind::IdentificationReq,
            3 => MessageKind::IdentificationRsp,
            6 => MessageKind::CallReq,
            7 => MessageKind::CallRsp,
            8 => MessageKind::TransportClosed,
            10 => MessageKind::ResolveReq,
            11 => MessageKind::ResolveRsp,
            12 => MessageKind::Notification,
            15 => MessageKind::ErrorResponse,
            16 => MessageKind::SessionChangeNotification,
            18 => MessageKind::SessionInitialState,
            20 => MessageKind::PingReq,
            21 => MessageKind::PingRsp,
            _ => return None,
        };
        Some(kind)
    }

    pub fn tag(self) -> i64 {
        match self {
            MessageKind::AuthenticationReq => 0,
            MessageKind::AuthenticationRsp => 1,
            MessageKind::IdentificationReq => 2,
            MessageKind::IdentificationRsp => 3,
            MessageKind::CallReq => 6,
            MessageKind::CallRsp => 7,
            MessageKind::TransportClosed => 8,
            MessageKind::ResolveReq => 10,
            MessageKind::ResolveRsp => 11,
            MessageKind::Notification => 12,
            MessageKind::ErrorResponse => 15,
            MessageKind::SessionChangeNotification => 16,
            MessageKind::SessionInitialState => 18,
            MessageKind::PingReq => 20,
            MessageKind::PingRsp => 21,
        }
    }

    /// Canonical envelope type string.
    pub fn type_string(self) -> &'static str {
        match self {
            MessageKind::AuthenticationReq => "macho.AuthenticationReq",
            MessageKind::AuthenticationRsp => "macho.AuthenticationRsp",
            MessageKind::IdentificationReq => "macho.IdentificationReq",
            MessageKind::IdentificationRsp => "macho.IdentificationRsp",
            MessageKind::CallReq => "macho.CallReq",
            MessageKind::CallRsp => "macho.CallRsp",
            MessageKind::TransportClosed => "macho.TransportClosed",
            MessageKind::ResolveReq => "macho.ResolveReq",
            MessageKind::ResolveRsp => "macho.ResolveRsp",
            MessageKind::Notification => "macho.Notification",
            MessageKind::ErrorResponse => "macho.ErrorResponse",
            MessageKind::SessionChangeNotification => "macho.SessionChangeNotification",
            MessageKind::SessionInitialState => "macho.SessionInitialStateNotification",
            MessageKind::PingReq => "macho.PingReq",
            MessageKind::PingRsp => "macho.PingRsp",
        }
    }
}

/// Routing endpoint of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Address {
    /// Any node offering `service`
    Any {
        service: Option<String>,
        call_id: Option<i64>,
    },
    Node {
        node_id: i64,
        service: Option<String>,
        call_id: Option<i64>,
    },
    Client {
        client_id: i64,
        call_id: Option<i64>,
        service: Option<String>,
    },
    /// Fan-out to every subscriber of `broadcast_id`
    Broadcast {
        broadcast_id: String,
        narrowcast: Vec<Value>,
        id_type: String,
    },
}

impl Address {
    const ANY: i64 = 8;
    const NODE: i64 = 1;
    const CLIENT: i64 = 2;
    const BROADCAST: i64 = 4;

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Address::Broadcast { .. })
    }

    pub fn any(service: &str) -> Self {
        Address::Any {
            service: Some(service.to_owned()),
            call_id: None,
        }
    }

    pub fn client(client_id: i64, call_id: Option<i64>) -> Self {
        Address::Client {
            client_id,
            call_id,
            service: None,
        }
    }

    pub fn broadcast(broadcast_id: &str, id_type: &str) -> Self {
        Address::Broadcast {
            broadcast_id: broadcast_id.to_owned(),
            narrowcast: Vec::new(),
            id_type: id_type.to_owned(),
        }
    }
}

fn opt_string(value: Value, expected: &'static str) -> Result<Option<String>, DecodeError> {
    match value {
        Value::None => Ok(None),
        Value::String(s) => Ok(Some(s)),
        _ => Err(DecodeError::shape(expected)),
    }
}

fn opt_int(value: Value, expected: &'static str) -> Result<Option<i64>, DecodeError> {
    match value {
        Value::None => Ok(None),
        Value::Integer(i) => Ok(Some(i)),
        _ => Err(DecodeError::shape(expected)),
    }
}

impl Record for Address {
    const NAME: &'static str = "Address";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let items = match value {
            Value::Object { type_name, args } if type_name == ADDRESS_TYPE => match *args {
                Value::Tuple(items) if !items.is_empty() => items,
                _ => return Err(DecodeError::shape(Self::NAME)),
            },
            _ => return Err(DecodeError::shape(Self::NAME)),
        };
        let kind = items[0].as_int().ok_or(DecodeError::shape(Self::NAME))?;
        let arity = items.len();
        let mut f = Fields::tuple(Value::Tuple(items), arity, Self::NAME)?;
        f.any()?;

        let address = match (kind, arity) {
            (Self::ANY, 3) => Address::Any {
                service: opt_string(f.any()?, Self::NAME)?,
                call_id: opt_int(f.any()?, Self::NAME)?,
            },
            (Self::NODE, 4) => Address::Node {
                node_id: f.int()?,
                service: opt_string(f.any()?, Self::NAME)?,
                call_id: opt_int(f.any()?, Self::NAME)?,
            },
            (Self::CLIENT, 4) => Address::Client {
                client_id: f.int()?,
                call_id: opt_int(f.any()?, Self::NAME)?,
                service: opt_string(f.any()?, Self::NAME)?,
            },
            (Self::BROADCAST, 4) => {
                let broadcast_id = f.string()?;
                let narrowcast = match f.any()? {
                    Value::List(items) => items,
                    Value::None => Vec::new(),
                    _ => return Err(DecodeError::shape(Self::NAME)),
                };
                Address::Broadcast {
                    broadcast_id,
                    narrowcast,
                    id_type: f.string()?,
                }
            }
            _ => return Err(DecodeError::shape(Self::NAME)),
        };
        Ok(address)
    }

    fn encode(&self) -> Value {
        let items = match self {
            Address::Any { service, call_id } => vec![
                Value::Integer(Self::ANY),
                service.clone().into(),
                (*call_id).into(),
            ],
            Address::Node {
                node_id,
                service,
                call_id,
            } => vec![
                Value::Integer(Self::NODE),
                Value::Integer(*node_id),
                service.clone().into(),
                (*call_id).into(),
            ],
            Address::Client {
                client_id,
                call_id,
                service,
            } => vec![
                Value::Integer(Self::CLIENT),
                Value::Integer(*client_id),
                (*call_id).into(),
                service.clone().into(),
            ],
            Address::Broadcast {
                broadcast_id,
                narrowcast,
                id_type,
            } => vec![
                Value::Integer(Self::BROADCAST),
                broadcast_id.as_str().into(),
                Value::List(narrowcast.clone()),
                id_type.as_str().into(),
            ],
        };
        Value::Object {
            type_name: ADDRESS_TYPE.to_owned(),
            args: Box::new(Value::Tuple(items)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Any { service, .. } => {
                write!(f, "any:{}", service.as_deref().unwrap_or("-"))
            }
            Address::Node {
                node_id, service, ..
            } => write!(f, "node:{node_id}:{}", service.as_deref().unwrap_or("-")),
            Address::Client { client_id, .. } => write!(f, "client:{client_id}"),
            Address::Broadcast { broadcast_id, .. } => write!(f, "broadcast:{broadcast_id}"),
        }
    }
}

/// Envelope fields shared by every message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    pub type_tag: i64,
    pub type_string: String,
    pub source: Address,
    pub destination: Address,
    pub user_id: Option<i64>,
}

impl MessageHeader {
    pub fn new(kind: MessageKind, source: Address, destination: Address) -> Self {
        Self {
            type_tag: kind.tag(),
            type_string: kind.type_string().to_owned(),
            source,
            destination,
            user_id: None,
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_tag(self.type_tag)
    }
}

/// A decoded application message. The payload is decoded further by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Value,
    pub named_payload: Option<Dict>,
}

impl Message {
    pub fn new(header: MessageHeader, payload: Value) -> Self {
        Self {
            header,
            payload,
            named_payload: None,
        }
    }
}

impl Record for Message {
    const NAME: &'static str = "Message";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let (type_string, args) = match value {
            Value::Object { type_name, args } => (type_name, *args),
            _ => return Err(DecodeError::shape(Self::NAME)),
        };
        let mut f = Fields::tuple(args, 6, Self::NAME)?;
        let type_tag = f.int()?;
        let source = Address::decode(f.any()?)?;
        let destination = Address::decode(f.any()?)?;
        let user_id = opt_int(f.any()?, Self::NAME)?;
        let payload = f.any()?;
        let named_payload = match f.any()? {
            Value::None => None,
            Value::Dict(d) => Some(d),
            _ => return Err(DecodeError::shape(Self::NAME)),
        };
        Ok(Self {
            header: MessageHeader {
                type_tag,
                type_string,
                source,
                destination,
                user_id,
            },
            payload,
            named_payload,
        })
    }

    fn encode(&self) -> Value {
        let h = &self.header;
        Value::Object {
            type_name: h.type_string.clone(),
            args: Box::new(Value::Tuple(vec![
                Value::Integer(h.type_tag),
                h.source.encode(),
                h.destination.encode(),
                h.user_id.into(),
                self.payload.clone(),
                self.named_payload.clone().map_or(Value::None, Value::Dict),
            ])),
        }
    }
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

/// Node-level login request. Payload: `(user_name, password)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationReq {
    pub user_name: String,
    pub password: Value,
}

impl Record for AuthenticationReq {
    const NAME: &'static str = "AuthenticationReq";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut f = Fields::tuple(value, 2, Self::NAME)?;
        Ok(Self {
            user_name: f.string()?,
            password: f.any()?,
        })
    }

    fn encode(&self) -> Value {
        Value::Tuple(vec![self.user_name.as_str().into(), self.password.clone()])
    }
}

/// Node-level login answer. Payload: `(user_id, session_info)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationRsp {
    pub user_id: i64,
    pub session_info: Dict,
}

impl Record for AuthenticationRsp {
    const NAME: &'static str = "AuthenticationRsp";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut f = Fields::tuple(value, 2, Self::NAME)?;
        Ok(Self {
            user_id: f.int()?,
            session_info: f.dict()?,
        })
    }

    fn encode(&self) -> Value {
        Value::Tuple(vec![
            Value::Integer(self.user_id),
            Value::Dict(self.session_info.clone()),
        ])
    }
}

/// Remote call. Payload: `(remote_object, method, args, kwargs)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    /// Bound object reference, or the service name
    pub remote_object: Value,
    pub method: String,
    pub args: Vec<Value>,
    pub kwargs: Dict,
}

impl Record for CallRequest {
    const NAME: &'static str = "CallRequest";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut f = Fields::tuple(value, 4, Self::NAME)?;
        let remote_object = f.any()?;
        let method = f.string()?;
        let args = match f.any()? {
            Value::Tuple(items) => items,
            _ => return Err(DecodeError::shape(Self::NAME)),
        };
        let kwargs = match f.any()? {
            Value::Dict(d) => d,
            Value::None => Dict::new(),
            _ => return Err(DecodeError::shape(Self::NAME)),
        };
        Ok(Self {
            remote_object,
            method,
            args,
            kwargs,
        })
    }

    fn encode(&self) -> Value {
        Value::Tuple(vec![
            self.remote_object.clone(),
            self.method.as_str().into(),
            Value::Tuple(self.args.clone()),
            Value::Dict(self.kwargs.clone()),
        ])
    }
}

/// Result of a remote call. Payload: a tuple of return values.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResponse {
    pub values: Vec<Value>,
}

impl Record for CallResponse {
    const NAME: &'static str = "CallResponse";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::Tuple(values) => Ok(Self { values }),
            _ => Err(DecodeError::shape(Self::NAME)),
        }
    }

    fn encode(&self) -> Value {
        Value::Tuple(self.values.clone())
    }
}

/// Broadcast event. The event name travels in the destination's broadcast id.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationStream {
    pub notify_type: String,
    pub args: Vec<Value>,
}

impl NotificationStream {
    /// Decode the payload of a message sent to `destination`.
    pub fn decode_for(destination: &Address, payload: Value) -> Result<Self, DecodeError> {
        let notify_type = match destination {
            Address::Broadcast { broadcast_id, .. } => broadcast_id.clone(),
            _ => return Err(DecodeError::shape("NotificationStream")),
        };
        match payload {
            Value::Tuple(args) => Ok(Self { notify_type, args }),
            _ => Err(DecodeError::shape("NotificationStream")),
        }
    }
}

/// Failure report for an earlier request. Payload: `(origin_type, error_code, details)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    /// Message tag of the request that failed
    pub origin_type: i64,
    pub error_code: i64,
    pub payload: Value,
}

impl Record for ErrorResponse {
    const NAME: &'static str = "ErrorResponse";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut f = Fields::tuple(value, 3, Self::NAME)?;
        Ok(Self {
            origin_type: f.int()?,
            error_code: f.int()?,
            payload: f.any()?,
        })
    }

    fn encode(&self) -> Value {
        Value::Tuple(vec![
            Value::Integer(self.origin_type),
            Value::Integer(self.error_code),
            self.payload.clone(),
        ])
    }
}

/// One changed session attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionChange {
    pub attribute: String,
    pub old: Value,
    pub new: Value,
}

/// Session attribute delta.
///
/// Payload: `(clueless, (version, {attribute: (old, new)}), [node_ids])`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionChangeNotification {
    pub clueless: i64,
    pub version: i64,
    pub changes: Vec<SessionChange>,
    pub node_ids: Vec<Value>,
}

impl Record for SessionChangeNotification {
    const NAME: &'static str = "SessionChangeNotification";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut f = Fields::tuple(value, 3, Self::NAME)?;
        let clueless = f.int()?;
        let mut inner = Fields::tuple(f.any()?, 2, Self::NAME)?;
        let version = inner.int()?;
        let mut changes = Vec::new();
        for (key, value) in inner.dict()? {
            let attribute = match key {
                Value::String(s) => s,
                _ => return Err(DecodeError::shape(Self::NAME)),
            };
            let mut pair = Fields::tuple(value, 2, Self::NAME)?;
            changes.push(SessionChange {
                attribute,
                old: pair.any()?,
                new: pair.any()?,
            });
        }
        let node_ids = match f.any()? {
            Value::List(ids) => ids,
            _ => return Err(DecodeError::shape(Self::NAME)),
        };
        Ok(Self {
            clueless,
            version,
            changes,
            node_ids,
        })
    }

    fn encode(&self) -> Value {
        let mut dict = Dict::with_capacity(self.changes.len());
        for change in &self.changes {
            dict.push(
                change.attribute.as_str().into(),
                Value::Tuple(vec![change.old.clone(), change.new.clone()]),
            );
        }
        Value::Tuple(vec![
            Value::Integer(self.clueless),
            Value::Tuple(vec![Value::Integer(self.version), Value::Dict(dict)]),
            Value::List(self.node_ids.clone()),
        ])
    }
}
