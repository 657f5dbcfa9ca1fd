//! Property-based tests using proptest
//!
//! Framing must survive arbitrary payloads, arbitrary stream splits and
//! arbitrary garbage without panicking.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use peer_protocol::core::codec::FrameCodec;
use peer_protocol::core::frame::{Frame, HEADER_SIZE};
use peer_protocol::RawData;
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

proptest! {
    #[test]
    fn prop_frame_bytes_roundtrip(type_id in any::<u16>(), payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let frame = Frame::new(type_id, payload);
        let bytes = frame.to_bytes().unwrap();

        prop_assert_eq!(bytes.len(), HEADER_SIZE + frame.payload.len());
        prop_assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
    }
}

proptest! {
    #[test]
    fn prop_codec_reassembles_any_split(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..8),
        chunk in 1usize..64,
    ) {
        let mut codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        let frames: Vec<Frame> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| Frame::new(100 + i as u16, payload))
            .collect();
        for frame in &frames {
            codec.encode(frame.clone(), &mut wire).unwrap();
        }

        // feed the stream back in small pieces
        let mut buffer = BytesMut::new();
        let mut decoded = Vec::new();
        for piece in wire.chunks(chunk) {
            buffer.extend_from_slice(piece);
            while let Some(frame) = codec.decode(&mut buffer).unwrap() {
                decoded.push(frame);
            }
        }

        prop_assert!(buffer.is_empty());
        prop_assert_eq!(decoded, frames);
    }
}

proptest! {
    #[test]
    fn prop_garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = Frame::from_bytes(&data);

        let mut codec = FrameCodec::new(1024);
        let mut buffer = BytesMut::from(&data[..]);
        while let Ok(Some(_)) = codec.decode(&mut buffer) {}
    }
}

proptest! {
    #[test]
    fn prop_codec_rejects_length_below_header(type_id in any::<u16>(), len in i32::MIN..HEADER_SIZE as i32) {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&type_id.to_le_bytes());
        buffer.extend_from_slice(&len.to_le_bytes());

        prop_assert!(FrameCodec::default().decode(&mut buffer).is_err());
    }
}

proptest! {
    #[test]
    fn prop_raw_values_keep_their_bits(value in any::<i64>(), key in "[a-z]{1,12}") {
        let raw = RawData::encode(key.clone(), value);
        prop_assert_eq!(&raw.key, &key);
        prop_assert_eq!(raw.decode::<i64>().unwrap(), value);
        prop_assert!(raw.decode::<i32>().is_err());
    }
}
