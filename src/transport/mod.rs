//! # Transport Layer
//!
//! Sockets that carry frames between two peers.
//!
//! - **TCP**: [`tcp::TcpServer`] accepts connections, [`tcp::connect`] opens one
//! - **UDP**: [`udp`] binds the datagram sockets of child connections
//!
//! Both transports hand the connection engine a [`Wire`]: a stream of decoded
//! frames and a sink accepting frames. TCP uses a `Framed` stream over the
//! [`FrameCodec`](crate::core::codec::FrameCodec); UDP carries exactly one
//! frame per datagram.

use std::net::SocketAddr;
use std::pin::Pin;

use futures::{Sink, Stream};

use crate::core::frame::Frame;
use crate::error::ProtocolError;

pub mod tcp;
pub mod udp;

pub(crate) type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ProtocolError>> + Send>>;
pub(crate) type FrameSink = Pin<Box<dyn Sink<Frame, Error = ProtocolError> + Send>>;

/// Both directions of one transport, ready for the engine loops
pub(crate) struct Wire {
    pub reader: FrameStream,
    pub writer: FrameSink,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}
