//! Packet model.
//!
//! Application packets are plain serde structs that embed a [`PacketHeader`]
//! and implement [`Packet`]. The engine moves them around type-erased as
//! `Box<dyn AnyPacket>`; the concrete type is recovered with a downcast at
//! the handler boundary, using the closure captured when the handler was
//! registered.

use std::any::{Any, TypeId};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::serialization::SerializationFormat;
use crate::error::Result;

/// Outcome of a transmission as seen by the receiving application code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PacketState {
    /// Packet was received from the peer
    #[default]
    Success,
    /// No response arrived within the timeout; the packet is a default placeholder
    Timeout,
    /// The connection was not alive; the packet is a default placeholder
    ConnectionNotAlive,
}

/// Metadata every packet carries.
///
/// Only `id` travels on the wire. It is zero for ordinary packets, holds the
/// correlation id on requests sent through the correlator, and is copied onto
/// the matching response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketHeader {
    pub id: u64,
    #[serde(skip)]
    pub state: PacketState,
    /// Serialized size of the packet in bytes, filled in by the engine
    #[serde(skip)]
    pub size: usize,
}

impl PartialEq for PacketHeader {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.state == other.state
    }
}

impl PacketHeader {
    /// Header for a response answering `request`
    pub fn reply_to(request: &PacketHeader) -> Self {
        Self {
            id: request.id,
            ..Self::default()
        }
    }

    /// Header of a placeholder packet returned instead of a real response
    pub fn with_state(state: PacketState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn is_correlated(&self) -> bool {
        self.id != 0
    }
}

/// A typed packet that can be sent over a connection.
///
/// ```rust
/// use peer_protocol::protocol::packet::{Packet, PacketHeader};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct Chat {
///     header: PacketHeader,
///     text: String,
/// }
///
/// impl Packet for Chat {
///     const NAME: &'static str = "demo.Chat";
///     fn header(&self) -> &PacketHeader { &self.header }
///     fn header_mut(&mut self) -> &mut PacketHeader { &mut self.header }
/// }
/// ```
pub trait Packet: Serialize + DeserializeOwned + Send + 'static {
    /// Stable type name used by the type-sync protocol. Must be identical on both peers.
    const NAME: &'static str;

    /// Explicit wire id. `None` lets the registry assign one from 100 upwards.
    const WIRE_ID: Option<u16> = None;

    fn header(&self) -> &PacketHeader;

    fn header_mut(&mut self) -> &mut PacketHeader;

    /// Called on the write path right before serialization
    fn before_send(&mut self) {}

    /// Called on the dispatch path right before the packet is routed
    fn before_receive(&mut self) {}

    fn state(&self) -> PacketState {
        self.header().state
    }

    /// Mark this packet as the answer to `request`
    fn in_reply_to<P: Packet>(mut self, request: &P) -> Self
    where
        Self: Sized,
    {
        *self.header_mut() = PacketHeader::reply_to(request.header());
        self
    }
}

/// A packet that expects exactly one response of type `Response`.
pub trait RequestPacket: Packet {
    type Response: Packet + Default;
}

/// Object-safe view of a [`Packet`], implemented for every packet type
pub trait AnyPacket: Send + 'static {
    fn type_key(&self) -> TypeId;

    fn type_name(&self) -> &'static str;

    fn packet_header(&self) -> &PacketHeader;

    fn packet_header_mut(&mut self) -> &mut PacketHeader;

    fn encode(&self, format: SerializationFormat) -> Result<Vec<u8>>;

    fn run_before_send(&mut self);

    fn run_before_receive(&mut self);

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Packet> AnyPacket for T {
    fn type_key(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn type_name(&self) -> &'static str {
        T::NAME
    }

    fn packet_header(&self) -> &PacketHeader {
        self.header()
    }

    fn packet_header_mut(&mut self) -> &mut PacketHeader {
        self.header_mut()
    }

    fn encode(&self, format: SerializationFormat) -> Result<Vec<u8>> {
        format.encode(self)
    }

    fn run_before_send(&mut self) {
        self.before_send();
    }

    fn run_before_receive(&mut self) {
        self.before_receive();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl fmt::Debug for dyn AnyPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyPacket")
            .field("type", &self.type_name())
            .field("id", &self.packet_header().id)
            .finish()
    }
}

impl dyn AnyPacket {
    pub fn is<T: Packet>(&self) -> bool {
        self.type_key() == TypeId::of::<T>()
    }

    pub fn downcast_ref<T: Packet>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Recover the concrete packet. `None` if the packet is of another type.
    pub fn downcast<T: Packet>(self: Box<Self>) -> Option<T> {
        self.into_any().downcast::<T>().ok().map(|packet| *packet)
    }
}

type DecodeFn = fn(&[u8], SerializationFormat) -> Result<Box<dyn AnyPacket>>;

fn decode_erased<T: Packet>(data: &[u8], format: SerializationFormat) -> Result<Box<dyn AnyPacket>> {
    let packet: T = format.decode(data)?;
    Ok(Box::new(packet))
}

/// Everything the engine needs to know about a packet type, captured once at
/// registration time.
#[derive(Clone, Copy)]
pub struct PacketDescriptor {
    type_id: TypeId,
    name: &'static str,
    declared_id: Option<u16>,
    decode: DecodeFn,
}

impl PacketDescriptor {
    pub fn of<T: Packet>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: T::NAME,
            declared_id: T::WIRE_ID,
            decode: decode_erased::<T>,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn declared_id(&self) -> Option<u16> {
        self.declared_id
    }

    pub fn decode(&self, data: &[u8], format: SerializationFormat) -> Result<Box<dyn AnyPacket>> {
        (self.decode)(data, format)
    }
}

impl fmt::Debug for PacketDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketDescriptor")
            .field("name", &self.name)
            .field("declared_id", &self.declared_id)
            .finish()
    }
}

impl PartialEq for PacketDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for PacketDescriptor {}
