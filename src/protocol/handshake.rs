//! Login handshake state machine.
//!
//! The server side of the login exchange is a pure transition function:
//! each decoded frame plus the current [`HandshakeState`] yields the replies
//! to send and the next state. No I/O happens here; the connection shell
//! frames and writes the replies.
//!
//! ```text
//! AwaitingVersion --VersionExchange--> AwaitingCommand
//! AwaitingCommand --("QC", _)--> AwaitingVersion   (replies: queue position, version)
//! AwaitingCommand --(_, "VK", key)--> AwaitingCryptoRequest
//! AwaitingCryptoRequest --("placebo", _)--> AwaitingCryptoChallenge   (reply: "OK CC")
//! AwaitingCryptoChallenge --password None--> AwaitingCryptoChallenge   (reply: 1)
//! AwaitingCryptoChallenge --password--> AwaitingHandshakeAck   (reply: server handshake)
//! AwaitingHandshakeAck --result + valid login--> Done   (reply: ack)
//! ```
//!
//! Every error returned by [`ServerHandshake::handle`] is fatal to the connection.

use crate::config::ProtocolConfig;
use crate::core::marshal::Value;
use crate::error::{constants, AuthError, ProtocolError, Result};
use crate::protocol::records::{
    CryptoApiRequestParams, CryptoChallenge, CryptoHandshakeAck, CryptoHandshakeResult,
    CryptoRequest, CryptoServerHandshake, QueueCheckCommand, Record, VersionExchange,
    VipKeyCommand, HANDSHAKE_FUNC,
};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Account identifier assigned by the [`Authenticator`]
pub type UserId = i64;

/// The only crypto key version that can reach an authenticated state
pub const PLACEBO_KEY_VERSION: &str = "placebo";

/// Reply sent once the placebo crypto context is accepted
pub const CRYPTO_ACCEPTED: &str = "OK CC";

/// Password type requested when the client sent a hashed password (1 = plain)
pub const PLAIN_PASSWORD_TYPE: i64 = 1;

const QUEUE_CHECK: &str = "QC";
const VIP_KEY: &str = "VK";
const SERVER_CHALLENGE: &str = "hi";
const CHALLENGE_RESPONSE_HASH: &str = "654";
const USER_TYPE: i64 = 1;
const USER_ROLE: i64 = 1;
const CONNECTION_LOG_ID: i64 = 1;

/// Resolves login credentials to an account.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, user_name: &str, password: &str) -> std::result::Result<UserId, AuthError>;
}

/// In-memory credential table.
#[derive(Debug, Default, Clone)]
pub struct CredentialTable {
    accounts: HashMap<String, (String, UserId)>,
}

impl CredentialTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, user_name: &str, password: &str, user_id: UserId) -> Self {
        self.add_account(user_name, password, user_id);
        self
    }

    pub fn add_account(&mut self, user_name: &str, password: &str, user_id: UserId) {
        self.accounts
            .insert(user_name.to_owned(), (password.to_owned(), user_id));
    }
}

impl Authenticator for CredentialTable {
    fn authenticate(&self, user_name: &str, password: &str) -> std::result::Result<UserId, AuthError> {
        match self.accounts.get(user_name) {
            Some((expected, id)) if expected == password => Ok(*id),
            _ => Err(AuthError::InvalidCredentials),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingVersion,
    AwaitingCommand,
    AwaitingCryptoRequest,
    AwaitingCryptoChallenge,
    AwaitingHandshakeAck,
    Done,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::AwaitingVersion => "awaiting_version",
            HandshakeState::AwaitingCommand => "awaiting_command",
            HandshakeState::AwaitingCryptoRequest => "awaiting_crypto_request",
            HandshakeState::AwaitingCryptoChallenge => "awaiting_crypto_challenge",
            HandshakeState::AwaitingHandshakeAck => "awaiting_handshake_ack",
            HandshakeState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Everything a transition may consult besides its own state.
pub struct HandshakeContext<'a> {
    pub config: &'a ProtocolConfig,
    /// Authorized session count reported in version records
    pub user_count: usize,
    pub peer: SocketAddr,
    pub authenticator: &'a dyn Authenticator,
}

/// Account resolved by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginGranted {
    pub user_id: UserId,
    pub user_name: String,
    pub language_id: String,
}

/// Result of feeding one frame to the handshake.
#[derive(Debug, Default)]
pub struct Transition {
    /// Values to send back, in order
    pub replies: Vec<Value>,
    /// Set exactly once, on the transition into [`HandshakeState::Done`]
    pub login: Option<LoginGranted>,
}

impl Transition {
    fn reply(value: Value) -> Self {
        Self {
            replies: vec![value],
            login: None,
        }
    }
}

/// Build the version record the server announces on connect and after each queue check.
pub fn version_record(config: &ProtocolConfig, user_count: usize) -> Value {
    VersionExchange {
        birthday: config.birthday,
        macho_version: config.macho_version,
        user_count: i64::try_from(user_count).unwrap_or(i64::MAX),
        version_number: config.version_number,
        build_version: config.build_version,
        project_version: config.project_version.clone(),
    }
    .encode()
}

/// Per-connection login state.
#[derive(Debug)]
pub struct ServerHandshake {
    state: HandshakeState,
    /// Login request awaiting the client's handshake result
    pending_login: Option<CryptoChallenge>,
}

impl Default for ServerHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHandshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::AwaitingVersion,
            pending_login: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// True while a login request is retained between the challenge and the ack.
    pub fn has_pending_login(&self) -> bool {
        self.pending_login.is_some()
    }

    /// Feed one decoded frame through the state machine.
    pub fn handle(&mut self, input: Value, ctx: &HandshakeContext<'_>) -> Result<Transition> {
        match self.state {
            HandshakeState::AwaitingVersion => self.on_version(input, ctx),
            HandshakeState::AwaitingCommand => self.on_command(input, ctx),
            HandshakeState::AwaitingCryptoRequest => self.on_crypto_request(input, ctx),
            HandshakeState::AwaitingCryptoChallenge => self.on_crypto_challenge(input, ctx),
            HandshakeState::AwaitingHandshakeAck => self.on_handshake_result(input, ctx),
            HandshakeState::Done => Err(ProtocolError::UnexpectedMessage(
                constants::ERR_HANDSHAKE_COMPLETE,
            )),
        }
    }

    fn advance(&mut self, next: HandshakeState, peer: SocketAddr) {
        debug!(%peer, from = %self.state, to = %next, "Handshake state changed");
        self.state = next;
    }

    fn on_version(&mut self, input: Value, ctx: &HandshakeContext<'_>) -> Result<Transition> {
        let ve = VersionExchange::decode(input)?;
        let config = ctx.config;

        let mismatch = if ve.birthday != config.birthday {
            Some("birthday")
        } else if ve.macho_version != config.macho_version {
            Some("macho_version")
        } else if ve.version_number != config.version_number {
            Some("version_number")
        } else if ve.build_version != config.build_version {
            Some("build_version")
        } else if ve.project_version != config.project_version {
            Some("project_version")
        } else {
            None
        };

        if let Some(field) = mismatch {
            warn!(peer = %ctx.peer, field, "Client version does not match ours");
            return Err(ProtocolError::VersionMismatch { field });
        }

        self.advance(HandshakeState::AwaitingCommand, ctx.peer);
        Ok(Transition::default())
    }

    fn on_command(&mut self, input: Value, ctx: &HandshakeContext<'_>) -> Result<Transition> {
        let arity = match &input {
            Value::Tuple(items) => items.len(),
            _ => 0,
        };

        match arity {
            2 => {
                let cmd = QueueCheckCommand::decode(input)?;
                if cmd.command != QUEUE_CHECK {
                    return Err(ProtocolError::UnknownCommand(cmd.command));
                }
                debug!(peer = %ctx.peer, "Queue check");
                // behave as if the client had just connected
                self.advance(HandshakeState::AwaitingVersion, ctx.peer);
                Ok(Transition {
                    replies: vec![
                        Value::Integer(ctx.config.queue_position),
                        version_record(ctx.config, ctx.user_count),
                    ],
                    login: None,
                })
            }
            3 => {
                let cmd = VipKeyCommand::decode(input)?;
                if cmd.command != VIP_KEY {
                    return Err(ProtocolError::UnknownCommand(cmd.command));
                }
                debug!(peer = %ctx.peer, vip_key = %cmd.vip_key, "VIP key command");
                self.advance(HandshakeState::AwaitingCryptoRequest, ctx.peer);
                Ok(Transition::default())
            }
            _ => Err(ProtocolError::UnknownCommand(input.to_string())),
        }
    }

    fn on_crypto_request(&mut self, input: Value, ctx: &HandshakeContext<'_>) -> Result<Transition> {
        let request = CryptoRequest::decode(input)?;

        if request.key_version == PLACEBO_KEY_VERSION {
            debug!(peer = %ctx.peer, "Placebo crypto accepted");
            self.advance(HandshakeState::AwaitingCryptoChallenge, ctx.peer);
            return Ok(Transition::reply(Value::String(CRYPTO_ACCEPTED.to_owned())));
        }

        match CryptoApiRequestParams::decode(request.key_params) {
            Ok(params) => warn!(
                peer = %ctx.peer,
                key_version = %request.key_version,
                hash_method = %params.hash_method,
                session_key_length = params.session_key_length,
                provider = %params.provider,
                session_key_method = %params.session_key_method,
                "{}", constants::ERR_PLACEBO_ONLY
            ),
            Err(e) => warn!(
                peer = %ctx.peer,
                key_version = %request.key_version,
                params_error = %e,
                "{}", constants::ERR_PLACEBO_ONLY
            ),
        }
        Err(ProtocolError::UnsupportedCrypto(request.key_version))
    }

    fn on_crypto_challenge(&mut self, input: Value, ctx: &HandshakeContext<'_>) -> Result<Transition> {
        let challenge = CryptoChallenge::decode(input)?;

        if challenge.user_password.is_none() {
            debug!(peer = %ctx.peer, "Hashed password received, requesting plain");
            self.pending_login = None;
            return Ok(Transition::reply(Value::Integer(PLAIN_PASSWORD_TYPE)));
        }

        debug!(peer = %ctx.peer, user_name = %challenge.user_name, "Client challenge received");
        self.pending_login = Some(challenge);

        let config = ctx.config;
        let shake = CryptoServerHandshake {
            server_challenge: SERVER_CHALLENGE.to_owned(),
            func_marshaled_code: HANDSHAKE_FUNC.to_vec(),
            verification: false,
            macho_version: config.macho_version,
            boot_version: config.version_number,
            boot_build: config.build_version,
            boot_codename: config.codename.clone(),
            boot_region: config.region.clone(),
            cluster_user_count: config.cluster_user_count,
            proxy_node_id: config.proxy_node_id,
            user_logon_queue_position: config.queue_position,
            challenge_response_hash: CHALLENGE_RESPONSE_HASH.to_owned(),
        };

        self.advance(HandshakeState::AwaitingHandshakeAck, ctx.peer);
        Ok(Transition::reply(shake.encode()))
    }

    fn on_handshake_result(&mut self, input: Value, ctx: &HandshakeContext<'_>) -> Result<Transition> {
        // the retained request never outlives this step
        let request = self
            .pending_login
            .take()
            .ok_or(ProtocolError::UnexpectedMessage(constants::ERR_MISSING_LOGIN))?;

        CryptoHandshakeResult::decode(input)?;

        let password = plain_password(request.user_password)?;
        let user_id = ctx
            .authenticator
            .authenticate(&request.user_name, &password)
            .map_err(|e| {
                warn!(peer = %ctx.peer, user_name = %request.user_name, error = %e, "Login rejected");
                ProtocolError::AuthenticationFailed(e)
            })?;

        let ack = CryptoHandshakeAck {
            jit: request.user_language_id.clone(),
            user_id,
            max_session_time: Value::None,
            user_type: USER_TYPE,
            role: USER_ROLE,
            address: ctx.peer.ip().to_string(),
            in_detention: Value::None,
            user_client_id: user_id,
            connection_log_id: CONNECTION_LOG_ID,
        };

        info!(peer = %ctx.peer, user_id, user_name = %request.user_name, "Login accepted");
        self.advance(HandshakeState::Done, ctx.peer);

        Ok(Transition {
            replies: vec![ack.encode()],
            login: Some(LoginGranted {
                user_id,
                user_name: request.user_name,
                language_id: request.user_language_id,
            }),
        })
    }
}

/// Unwrap a packed password string: `PackedObject2` whose args are exactly one string.
fn plain_password(value: Value) -> Result<String> {
    match value {
        Value::PackedObject2(object) => {
            let mut args = object.args.into_iter();
            match (args.next(), args.next()) {
                (Some(Value::String(password)), None) => Ok(password),
                _ => Err(ProtocolError::BadPasswordShape),
            }
        }
        _ => Err(ProtocolError::BadPasswordShape),
    }
}
