//! Typed views over the values exchanged during login.
//!
//! Each record decodes from an owned [`Value`] in one step: either every field
//! is present with the right type or a [`DecodeError::ShapeMismatch`] is
//! returned and nothing is kept. Tuple field order is fixed per record and
//! documented on the type.

use crate::core::marshal::{Dict, Value};
use crate::error::DecodeError;

/// A wire record with a fixed value shape.
pub trait Record: Sized {
    /// Human-readable name used in logs and shape errors
    const NAME: &'static str;

    fn decode(value: Value) -> Result<Self, DecodeError>;

    fn encode(&self) -> Value;
}

/// Sequential reader over the items of a fixed-arity tuple.
pub(crate) struct Fields {
    items: std::vec::IntoIter<Value>,
    expected: &'static str,
}

impl Fields {
    /// Open `value` as a tuple of exactly `arity` items.
    pub(crate) fn tuple(value: Value, arity: usize, expected: &'static str) -> Result<Self, DecodeError> {
        match value {
            Value::Tuple(items) if items.len() == arity => Ok(Self {
                items: items.into_iter(),
                expected,
            }),
            _ => Err(DecodeError::shape(expected)),
        }
    }

    pub(crate) fn any(&mut self) -> Result<Value, DecodeError> {
        self.items.next().ok_or(DecodeError::shape(self.expected))
    }

    pub(crate) fn int(&mut self) -> Result<i64, DecodeError> {
        match self.any()? {
            Value::Integer(i) => Ok(i),
            _ => Err(DecodeError::shape(self.expected)),
        }
    }

    pub(crate) fn real(&mut self) -> Result<f64, DecodeError> {
        match self.any()? {
            Value::Real(r) => Ok(r),
            _ => Err(DecodeError::shape(self.expected)),
        }
    }

    pub(crate) fn string(&mut self) -> Result<String, DecodeError> {
        match self.any()? {
            Value::String(s) => Ok(s),
            _ => Err(DecodeError::shape(self.expected)),
        }
    }

    pub(crate) fn dict(&mut self) -> Result<Dict, DecodeError> {
        match self.any()? {
            Value::Dict(d) => Ok(d),
            _ => Err(DecodeError::shape(self.expected)),
        }
    }
}

fn take_string(dict: &mut Dict, key: &str, expected: &'static str) -> Result<String, DecodeError> {
    match dict.take(key) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(DecodeError::shape(expected)),
    }
}

fn take_int(dict: &mut Dict, key: &str, expected: &'static str) -> Result<i64, DecodeError> {
    match dict.take(key) {
        Some(Value::Integer(i)) => Ok(i),
        _ => Err(DecodeError::shape(expected)),
    }
}

/// Version information exchanged in both directions when a client connects.
///
/// Wire shape: `(birthday, macho_version, user_count, version_number, build_version, project_version)`.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionExchange {
    pub birthday: i64,
    pub macho_version: i64,
    pub user_count: i64,
    pub version_number: f64,
    pub build_version: i64,
    pub project_version: String,
}

impl Record for VersionExchange {
    const NAME: &'static str = "VersionExchange";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut f = Fields::tuple(value, 6, Self::NAME)?;
        Ok(Self {
            birthday: f.int()?,
            macho_version: f.int()?,
            user_count: f.int()?,
            version_number: f.real()?,
            build_version: f.int()?,
            project_version: f.string()?,
        })
    }

    fn encode(&self) -> Value {
        Value::Tuple(vec![
            Value::Integer(self.birthday),
            Value::Integer(self.macho_version),
            Value::Integer(self.user_count),
            Value::Real(self.version_number),
            Value::Integer(self.build_version),
            Value::String(self.project_version.clone()),
        ])
    }
}

/// Queue position query. Wire shape: `(command, payload)`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueCheckCommand {
    pub command: String,
    pub payload: Value,
}

impl Record for QueueCheckCommand {
    const NAME: &'static str = "QueueCheckCommand";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut f = Fields::tuple(value, 2, Self::NAME)?;
        Ok(Self {
            command: f.string()?,
            payload: f.any()?,
        })
    }

    fn encode(&self) -> Value {
        Value::Tuple(vec![self.command.as_str().into(), self.payload.clone()])
    }
}

/// Login intent carrying an optional VIP key. Wire shape: `(payload, command, vip_key)`.
#[derive(Debug, Clone, PartialEq)]
pub struct VipKeyCommand {
    pub payload: Value,
    pub command: String,
    pub vip_key: Value,
}

impl Record for VipKeyCommand {
    const NAME: &'static str = "VipKeyCommand";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut f = Fields::tuple(value, 3, Self::NAME)?;
        Ok(Self {
            payload: f.any()?,
            command: f.string()?,
            vip_key: f.any()?,
        })
    }

    fn encode(&self) -> Value {
        Value::Tuple(vec![
            self.payload.clone(),
            self.command.as_str().into(),
            self.vip_key.clone(),
        ])
    }
}

/// Crypto negotiation. Wire shape: `(key_version, key_params)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoRequest {
    pub key_version: String,
    pub key_params: Value,
}

impl Record for CryptoRequest {
    const NAME: &'static str = "CryptoRequest";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut f = Fields::tuple(value, 2, Self::NAME)?;
        Ok(Self {
            key_version: f.string()?,
            key_params: f.any()?,
        })
    }

    fn encode(&self) -> Value {
        Value::Tuple(vec![self.key_version.as_str().into(), self.key_params.clone()])
    }
}

/// Parameters of a non-placebo crypto request. Only decoded for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoApiRequestParams {
    pub session_key: Value,
    pub hash_method: String,
    pub session_key_length: i64,
    pub provider: String,
    pub session_key_method: String,
}

impl Record for CryptoApiRequestParams {
    const NAME: &'static str = "CryptoApiRequestParams";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut dict = match value {
            Value::Dict(d) => d,
            _ => return Err(DecodeError::shape(Self::NAME)),
        };
        Ok(Self {
            session_key: dict.take("crypting_sessionkey").unwrap_or(Value::None),
            hash_method: take_string(&mut dict, "signing_hashmethod", Self::NAME)?,
            session_key_length: take_int(&mut dict, "crypting_sessionkeylength", Self::NAME)?,
            provider: take_string(&mut dict, "crypting_securityprovidertype", Self::NAME)?,
            session_key_method: take_string(&mut dict, "crypting_sessionkeymethod", Self::NAME)?,
        })
    }

    fn encode(&self) -> Value {
        let mut dict = Dict::with_capacity(5);
        dict.insert("crypting_sessionkey", self.session_key.clone());
        dict.insert("signing_hashmethod", self.hash_method.as_str());
        dict.insert("crypting_sessionkeylength", self.session_key_length);
        dict.insert("crypting_securityprovidertype", self.provider.as_str());
        dict.insert("crypting_sessionkeymethod", self.session_key_method.as_str());
        Value::Dict(dict)
    }
}

/// Login request. Wire shape: `(client_challenge, {user_name, user_password, user_languageid, ...})`.
///
/// Keys other than the three required ones are kept in `extra` so the record
/// re-encodes to what the client sent.
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoChallenge {
    pub client_challenge: String,
    pub user_name: String,
    /// `None` when the client sent a hashed password, otherwise a packed password string
    pub user_password: Value,
    pub user_language_id: String,
    pub extra: Dict,
}

impl Record for CryptoChallenge {
    const NAME: &'static str = "CryptoChallenge";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut f = Fields::tuple(value, 2, Self::NAME)?;
        let client_challenge = f.string()?;
        let mut dict = f.dict()?;
        let user_name = take_string(&mut dict, "user_name", Self::NAME)?;
        let user_password = dict
            .take("user_password")
            .ok_or(DecodeError::shape(Self::NAME))?;
        let user_language_id = take_string(&mut dict, "user_languageid", Self::NAME)?;
        Ok(Self {
            client_challenge,
            user_name,
            user_password,
            user_language_id,
            extra: dict,
        })
    }

    fn encode(&self) -> Value {
        let mut dict = Dict::with_capacity(3 + self.extra.len());
        dict.insert("user_name", self.user_name.as_str());
        dict.insert("user_password", self.user_password.clone());
        dict.insert("user_languageid", self.user_language_id.as_str());
        for (key, value) in self.extra.iter() {
            dict.push(key.clone(), value.clone());
        }
        Value::Tuple(vec![self.client_challenge.as_str().into(), Value::Dict(dict)])
    }
}

/// Marshaled code object the client evaluates during the handshake. It only returns `None`.
pub const HANDSHAKE_FUNC: [u8; 9] = [0x74, 0x04, 0x00, 0x00, 0x00, b'N', b'o', b'n', b'e'];

/// Server reply to a login request.
///
/// Wire shape: `(server_challenge, (func_marshaled_code, verification), {context})`.
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoServerHandshake {
    pub server_challenge: String,
    pub func_marshaled_code: Vec<u8>,
    pub verification: bool,
    pub macho_version: i64,
    pub boot_version: f64,
    pub boot_build: i64,
    pub boot_codename: String,
    pub boot_region: String,
    pub cluster_user_count: i64,
    pub proxy_node_id: i64,
    pub user_logon_queue_position: i64,
    pub challenge_response_hash: String,
}

impl Record for CryptoServerHandshake {
    const NAME: &'static str = "CryptoServerHandshake";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut f = Fields::tuple(value, 3, Self::NAME)?;
        let server_challenge = f.string()?;
        let mut func = Fields::tuple(f.any()?, 2, Self::NAME)?;
        let func_marshaled_code = match func.any()? {
            Value::Buffer(b) => b,
            _ => return Err(DecodeError::shape(Self::NAME)),
        };
        let verification = match func.any()? {
            Value::Boolean(b) => b,
            _ => return Err(DecodeError::shape(Self::NAME)),
        };
        let mut ctx = f.dict()?;
        let boot_version = match ctx.take("boot_version") {
            Some(Value::Real(r)) => r,
            _ => return Err(DecodeError::shape(Self::NAME)),
        };
        Ok(Self {
            server_challenge,
            func_marshaled_code,
            verification,
            macho_version: take_int(&mut ctx, "macho_version", Self::NAME)?,
            boot_version,
            boot_build: take_int(&mut ctx, "boot_build", Self::NAME)?,
            boot_codename: take_string(&mut ctx, "boot_codename", Self::NAME)?,
            boot_region: take_string(&mut ctx, "boot_region", Self::NAME)?,
            cluster_user_count: take_int(&mut ctx, "cluster_usercount", Self::NAME)?,
            proxy_node_id: take_int(&mut ctx, "proxy_nodeid", Self::NAME)?,
            user_logon_queue_position: take_int(&mut ctx, "user_logonqueueposition", Self::NAME)?,
            challenge_response_hash: take_string(&mut ctx, "challenge_responsehash", Self::NAME)?,
        })
    }

    fn encode(&self) -> Value {
        let mut ctx = Dict::with_capacity(9);
        ctx.insert("macho_version", self.macho_version);
        ctx.insert("boot_version", self.boot_version);
        ctx.insert("boot_build", self.boot_build);
        ctx.insert("boot_codename", self.boot_codename.as_str());
        ctx.insert("boot_region", self.boot_region.as_str());
        ctx.insert("cluster_usercount", self.cluster_user_count);
        ctx.insert("proxy_nodeid", self.proxy_node_id);
        ctx.insert("user_logonqueueposition", self.user_logon_queue_position);
        ctx.insert("challenge_responsehash", self.challenge_response_hash.as_str());
        Value::Tuple(vec![
            self.server_challenge.as_str().into(),
            Value::Tuple(vec![
                Value::Buffer(self.func_marshaled_code.clone()),
                Value::Boolean(self.verification),
            ]),
            Value::Dict(ctx),
        ])
    }
}

/// Client answer to the server handshake. Wire shape: `(challenge_response, func_output, func_result)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoHandshakeResult {
    pub challenge_response: String,
    pub func_output: Value,
    pub func_result: Value,
}

impl Record for CryptoHandshakeResult {
    const NAME: &'static str = "CryptoHandshakeResult";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut f = Fields::tuple(value, 3, Self::NAME)?;
        Ok(Self {
            challenge_response: f.string()?,
            func_output: f.any()?,
            func_result: f.any()?,
        })
    }

    fn encode(&self) -> Value {
        Value::Tuple(vec![
            self.challenge_response.as_str().into(),
            self.func_output.clone(),
            self.func_result.clone(),
        ])
    }
}

/// Final login acknowledgement. Wire shape: a dict keyed by field name.
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoHandshakeAck {
    /// Language id echoed from the login request
    pub jit: String,
    pub user_id: i64,
    pub max_session_time: Value,
    pub user_type: i64,
    pub role: i64,
    pub address: String,
    pub in_detention: Value,
    pub user_client_id: i64,
    pub connection_log_id: i64,
}

impl Record for CryptoHandshakeAck {
    const NAME: &'static str = "CryptoHandshakeAck";

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut dict = match value {
            Value::Dict(d) => d,
            _ => return Err(DecodeError::shape(Self::NAME)),
        };
        Ok(Self {
            jit: take_string(&mut dict, "jit", Self::NAME)?,
            user_id: take_int(&mut dict, "userid", Self::NAME)?,
            max_session_time: dict.take("maxSessionTime").unwrap_or(Value::None),
            user_type: take_int(&mut dict, "userType", Self::NAME)?,
            role: take_int(&mut dict, "role", Self::NAME)?,
            address: take_string(&mut dict, "address", Self::NAME)?,
            in_detention: dict.take("inDetention").unwrap_or(Value::None),
            user_client_id: take_int(&mut dict, "user_clientid", Self::NAME)?,
            connection_log_id: take_int(&mut dict, "connectionLogID", Self::NAME)?,
        })
    }

    fn encode(&self) -> Value {
        let mut dict = Dict::with_capacity(9);
        dict.insert("jit", self.jit.as_str());
        dict.insert("userid", self.user_id);
        dict.insert("maxSessionTime", self.max_session_time.clone());
        dict.insert("userType", self.user_type);
        dict.insert("role", self.role);
        dict.insert("address", self.address.as_str());
        dict.insert("inDetention", self.in_detention.clone());
        dict.insert("user_clientid", self.user_client_id);
        dict.insert("connectionLogID", self.connection_log_id);
        Value::Dict(dict)
    }
}
