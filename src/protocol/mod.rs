//! # Protocol Layer
//!
//! Login handshake, typed records and post-login message routing.
//!
//! ## Components
//! - **Records**: typed views over handshake values
//! - **Handshake**: version, crypto and login state machine
//! - **Message**: application envelope, addresses and bodies
//! - **Dispatcher**: per-kind routing to [`dispatcher::PacketHandler`] hooks
//!
//! ## Flow
//! 1. Server announces its version on connect
//! 2. Client echoes the version, optionally polls its queue position
//! 3. Placebo crypto context, then login challenge and server handshake
//! 4. Credentials checked, ack sent, connection becomes authenticated
//! 5. Every later frame is an envelope routed by the dispatcher

pub mod dispatcher;
pub mod handshake;
pub mod message;
pub mod records;
