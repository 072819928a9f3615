//! # Core Protocol Components
//!
//! Framing and the marshal value codec.
//!
//! ## Components
//! - **Frame**: incremental `[u32 LE length][payload]` reassembly
//! - **Codec**: Tokio codec for framing over byte streams
//! - **Marshal**: self-describing value encoding carried inside frames
//!
//! ## Wire Format
//! ```text
//! [Length(4, LE)] [Payload(N)]
//! Payload := zlib(marshal) | marshal
//! marshal := [0x7E] [SharedCount(4)] [Value]
//! ```
//!
//! ## Security
//! - Maximum frame size is checked before any allocation
//! - Marshal nesting is limited and container counts are bounded by the input

pub mod codec;
pub mod frame;
pub mod marshal;
