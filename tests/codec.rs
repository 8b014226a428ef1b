//! Black-box coverage of the binary audio frame coexisting with JSON text
//! frames on the same WebSocket (§4.A/§6): arbitrary non-frame binary data
//! must never be mistaken for a frame, and a real frame must still decode
//! correctly once it's traveled through a `Vec<u8>` the way it would over
//! the wire.

use xiaozhi_proxy_core::codec::{self, FrameType};

#[test]
fn arbitrary_binary_payload_is_not_mistaken_for_a_frame() {
    // 20 bytes of payload that happens to not start with the version marker.
    let opaque_opus_bytes: Vec<u8> = (0..20).collect();
    assert!(!codec::is_frame(&opaque_opus_bytes));
    assert!(codec::decode(&opaque_opus_bytes).is_none());
}

#[test]
fn a_frame_with_version_marker_by_coincidence_still_requires_valid_payload_len() {
    // Bytes that happen to start with the frame's version marker (0x00 0x02)
    // but declare a payload size the buffer doesn't have must still be
    // rejected rather than decoded garbage.
    let mut buf = vec![0x00, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF];
    buf.extend_from_slice(&[1, 2, 3]);
    assert!(codec::is_frame(&buf));
    assert!(codec::decode(&buf).is_none());
}

#[test]
fn encoded_frame_survives_a_round_trip_through_a_byte_vector() {
    let payload = b"opus-ish-bytes".to_vec();
    let encoded = codec::encode(&payload, 42_000, FrameType::Opus).unwrap();
    let relayed: Vec<u8> = encoded.iter().copied().collect();
    let decoded = codec::decode(&relayed).expect("valid frame decodes");
    assert_eq!(decoded.payload, payload);
    assert_eq!(decoded.frame_type, FrameType::Opus);
}
