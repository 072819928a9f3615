//! # Error Types
//!
//! Error handling for every layer of the connection stack.
//!
//! ## Error Categories
//! - **Decode Errors**: malformed marshal streams or records that do not have the
//!   expected shape. Always local to one frame.
//! - **Protocol Errors**: handshake violations (fatal to the connection) and
//!   dispatch violations (fatal to a single message).
//! - **Auth Errors**: opaque failures reported by the account resolver.
//! - **Transport Errors**: backpressure (`WouldBlock`) and closed sockets.
//!
//! ## Example Usage
//! ```rust
//! use machonet::core::marshal;
//! use machonet::error::{DecodeError, ProtocolError, Result};
//!
//! fn first_byte_value(bytes: &[u8]) -> Result<i64> {
//!     let value = marshal::decode(bytes)?;
//!     value
//!         .as_int()
//!         .ok_or(ProtocolError::Decode(DecodeError::ShapeMismatch { expected: "integer" }))
//! }
//!
//! assert!(first_byte_value(&[]).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    pub const ERR_OUTPUT_BLOCKED: &str = "Outgoing buffer has no room";

    pub const ERR_HANDSHAKE_COMPLETE: &str = "Handshake already completed";
    pub const ERR_MISSING_LOGIN: &str = "No login request retained for handshake result";
    pub const ERR_PLACEBO_ONLY: &str = "Only placebo crypto is supported";
}

/// Failure to turn bytes (or a decoded value) into a structured value.
///
/// Offsets are byte positions inside the frame payload and exist for
/// diagnostics only; a failed frame is always discarded as a whole.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated input at byte {offset}: {needed} more bytes required")]
    Truncated { offset: usize, needed: usize },

    #[error("unknown type marker 0x{tag:02x} at byte {offset}")]
    UnknownTag { offset: usize, tag: u8 },

    #[error("shape mismatch: expected {expected}")]
    ShapeMismatch { expected: &'static str },

    #[error("invalid stream header byte 0x{found:02x}")]
    BadHeader { found: u8 },

    #[error("invalid UTF-8 string at byte {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("nesting exceeds {limit} levels at byte {offset}")]
    DepthExceeded { offset: usize, limit: usize },

    #[error("{count} trailing bytes after value at byte {offset}")]
    TrailingBytes { offset: usize, count: usize },
}

impl DecodeError {
    pub(crate) fn shape(expected: &'static str) -> Self {
        DecodeError::ShapeMismatch { expected }
    }
}

/// Opaque failure from the account resolver. Never forwarded to the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("account unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a write that did not complete.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The outgoing buffer cannot take the whole frame right now. Nothing was written.
    #[error("outgoing buffer has no room")]
    WouldBlock,

    #[error("transport closed")]
    Closed,
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Client {field} does not match server")]
    VersionMismatch { field: &'static str },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Unsupported crypto key version: {0}")]
    UnsupportedCrypto(String),

    #[error("Password is not a packed password string")]
    BadPasswordShape,

    #[error("Authentication failed")]
    AuthenticationFailed(#[source] AuthError),

    #[error("Type string '{found}' does not match expected '{expected}'")]
    TypeStringMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("Notification sent to a non-broadcast destination")]
    BadDestination,

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
