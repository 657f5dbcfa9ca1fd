//! # Core Protocol Components
//!
//! Framing, codecs and payload conversion.
//!
//! ## Components
//! - **Frame**: the wire envelope
//! - **Codec**: Tokio codec for framing over byte streams and datagrams
//! - **Serialization**: serde formats for payloads
//! - **Converter**: pluggable packet <-> payload conversion, optionally encrypted
//!
//! ## Wire Format
//! ```text
//! [Type id(2, LE)] [Frame length(4, LE, includes header)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 16MB by default (prevents memory exhaustion)
//! - Length validation before allocation

pub mod codec;
pub mod converter;
pub mod frame;
pub mod serialization;
