#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use peer_protocol::core::converter::{FormatConverter, PacketConverter, SecureConverter};
use peer_protocol::protocol::builtin::AddPacketTypeRequest;
use peer_protocol::protocol::packet::PacketDescriptor;
use peer_protocol::{RawData, SerializationFormat};

fuzz_target!(|data: &[u8]| {
    let raw = PacketDescriptor::of::<RawData>();
    let sync = PacketDescriptor::of::<AddPacketTypeRequest>();

    for format in [
        SerializationFormat::Bincode,
        SerializationFormat::Json,
        SerializationFormat::MessagePack,
    ] {
        let converter = FormatConverter::new(format);
        let _ = converter.deserialize(&raw, data);
        let _ = converter.deserialize(&sync, data);
    }

    let secure = SecureConverter::new(Arc::new(FormatConverter::default()));
    secure.install_key([3u8; 32]).ok();
    let _ = secure.deserialize(&raw, data);
});
