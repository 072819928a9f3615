//! # Service Layer
//!
//! Connection lifecycle on top of the protocol layer.
//!
//! ## Components
//! - **Session**: registry of connected clients and authenticated sessions
//! - **Connection**: per-client shell driving framing, handshake and dispatch
//! - **Server**: tokio TCP accept loop with connection limit and graceful shutdown

pub mod connection;
pub mod server;
pub mod session;
