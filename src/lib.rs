//! # machonet
//!
//! Server side of the client connection protocol used by machoNet game
//! servers: length-prefixed framing, a self-describing marshal codec, the
//! version/crypto/login handshake and typed dispatch of post-login messages.
//!
//! ## Layers
//! - [`core`]: frame reassembly and the marshal value codec
//! - [`protocol`]: handshake records and state machine, message envelope, dispatcher
//! - [`service`]: session registry, connection shell, tokio TCP server
//! - [`utils`]: zlib compression, logging setup, metrics
//!
//! ## Quick Start
//! ```rust,no_run
//! use machonet::config::NetworkConfig;
//! use machonet::protocol::handshake::CredentialTable;
//! use machonet::service::connection::{LoggingHandlerFactory, ServerContext};
//! use machonet::service::server;
//! use std::sync::Arc;
//!
//! # async fn run() -> machonet::error::Result<()> {
//! let accounts = CredentialTable::new().with_account("alice", "secret", 1);
//! let ctx = ServerContext::new(
//!     NetworkConfig::default(),
//!     Arc::new(accounts),
//!     Arc::new(LoggingHandlerFactory),
//! );
//! server::start_server(ctx).await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod utils;

pub use crate::core::marshal::{Dict, Value};
pub use crate::error::{ProtocolError, Result};
