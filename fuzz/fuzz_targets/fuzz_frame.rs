#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use peer_protocol::core::codec::FrameCodec;
use peer_protocol::core::frame::Frame;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // datagram path
    let _ = Frame::from_bytes(data);

    // stream path with a small limit so oversized headers are exercised
    let mut codec = FrameCodec::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        let _ = frame.to_bytes();
    }
});
