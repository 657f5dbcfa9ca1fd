//! Packets the engine itself exchanges. Their wire ids are fixed and
//! registered on both peers before anything else happens, so they never go
//! through the type-sync protocol.

use serde::{Deserialize, Serialize};

use crate::connection::CloseReason;
use crate::protocol::packet::{Packet, PacketDescriptor, PacketHeader};
use crate::protocol::raw::RawData;

/// Fixed wire ids of the built-in packets
pub mod ids {
    pub const PING_REQUEST: u16 = 0;
    pub const PING_RESPONSE: u16 = 1;
    pub const CLOSE_REQUEST: u16 = 2;
    pub const ESTABLISH_UDP_REQUEST: u16 = 3;
    pub const ESTABLISH_UDP_RESPONSE: u16 = 4;
    pub const ESTABLISH_UDP_RESPONSE_ACK: u16 = 5;
    pub const ADD_PACKET_TYPE_REQUEST: u16 = 6;
    pub const ADD_PACKET_TYPE_RESPONSE: u16 = 7;
    pub const UDP_PING_REQUEST: u16 = 8;
    pub const UDP_PING_RESPONSE: u16 = 9;
    pub const RAW_DATA: u16 = 10;
    pub const KEY_INFORMATION_REQUEST: u16 = 11;
    pub const KEY_INFORMATION_RESPONSE: u16 = 12;

    /// First id handed out to application packets
    pub const FIRST_DYNAMIC_ID: u16 = 100;

    /// Ids below this value belong to the protocol itself
    pub fn is_reserved(id: u16) -> bool {
        id < FIRST_DYNAMIC_ID
    }
}

macro_rules! builtin_packet {
    ($ty:ident, $name:literal, $id:path) => {
        impl Packet for $ty {
            const NAME: &'static str = $name;
            const WIRE_ID: Option<u16> = Some($id);

            fn header(&self) -> &PacketHeader {
                &self.header
            }

            fn header_mut(&mut self) -> &mut PacketHeader {
                &mut self.header
            }
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {
    pub header: PacketHeader,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub header: PacketHeader,
}

/// Close notice; the receiver tears down without answering
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub header: PacketHeader,
    pub reason: CloseReason,
}

/// Step 1 of the UDP handshake: the client offers its bound UDP port
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstablishUdpRequest {
    pub header: PacketHeader,
    pub udp_port: u16,
}

/// Step 2 of the UDP handshake: the server answers with its own UDP port
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstablishUdpResponse {
    pub header: PacketHeader,
    pub udp_port: u16,
}

/// Step 3 of the UDP handshake: the client confirms it received the server port
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstablishUdpResponseAck {
    pub header: PacketHeader,
}

/// One `(type name, wire id)` pair announced during type sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeEntry {
    pub name: String,
    pub id: u16,
}

/// Type-sync control packet naming an assembly and the sender's ids for it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddPacketTypeRequest {
    pub header: PacketHeader,
    pub assembly: String,
    pub entries: Vec<TypeEntry>,
}

/// Type-sync answer listing every wire id the receiver can now decode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddPacketTypeResponse {
    pub header: PacketHeader,
    pub assembly: String,
    pub known_ids: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UdpPingRequest {
    pub header: PacketHeader,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UdpPingResponse {
    pub header: PacketHeader,
}

/// Public half of the initiator's ephemeral x25519 key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyInformationRequest {
    pub header: PacketHeader,
    pub public_key: [u8; 32],
}

/// Public half of the responder's ephemeral x25519 key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyInformationResponse {
    pub header: PacketHeader,
    pub public_key: [u8; 32],
}

builtin_packet!(PingRequest, "builtin.PingRequest", ids::PING_REQUEST);
builtin_packet!(PingResponse, "builtin.PingResponse", ids::PING_RESPONSE);
builtin_packet!(CloseRequest, "builtin.CloseRequest", ids::CLOSE_REQUEST);
builtin_packet!(
    EstablishUdpRequest,
    "builtin.EstablishUdpRequest",
    ids::ESTABLISH_UDP_REQUEST
);
builtin_packet!(
    EstablishUdpResponse,
    "builtin.EstablishUdpResponse",
    ids::ESTABLISH_UDP_RESPONSE
);
builtin_packet!(
    EstablishUdpResponseAck,
    "builtin.EstablishUdpResponseAck",
    ids::ESTABLISH_UDP_RESPONSE_ACK
);
builtin_packet!(
    AddPacketTypeRequest,
    "builtin.AddPacketTypeRequest",
    ids::ADD_PACKET_TYPE_REQUEST
);
builtin_packet!(
    AddPacketTypeResponse,
    "builtin.AddPacketTypeResponse",
    ids::ADD_PACKET_TYPE_RESPONSE
);
builtin_packet!(UdpPingRequest, "builtin.UdpPingRequest", ids::UDP_PING_REQUEST);
builtin_packet!(UdpPingResponse, "builtin.UdpPingResponse", ids::UDP_PING_RESPONSE);
builtin_packet!(RawData, "builtin.RawData", ids::RAW_DATA);
builtin_packet!(
    KeyInformationRequest,
    "builtin.KeyInformationRequest",
    ids::KEY_INFORMATION_REQUEST
);
builtin_packet!(
    KeyInformationResponse,
    "builtin.KeyInformationResponse",
    ids::KEY_INFORMATION_RESPONSE
);

/// Descriptors of all built-in packets, in wire id order
pub fn descriptors() -> Vec<PacketDescriptor> {
    vec![
        PacketDescriptor::of::<PingRequest>(),
        PacketDescriptor::of::<PingResponse>(),
        PacketDescriptor::of::<CloseRequest>(),
        PacketDescriptor::of::<EstablishUdpRequest>(),
        PacketDescriptor::of::<EstablishUdpResponse>(),
        PacketDescriptor::of::<EstablishUdpResponseAck>(),
        PacketDescriptor::of::<AddPacketTypeRequest>(),
        PacketDescriptor::of::<AddPacketTypeResponse>(),
        PacketDescriptor::of::<UdpPingRequest>(),
        PacketDescriptor::of::<UdpPingResponse>(),
        PacketDescriptor::of::<RawData>(),
        PacketDescriptor::of::<KeyInformationRequest>(),
        PacketDescriptor::of::<KeyInformationResponse>(),
    ]
}
