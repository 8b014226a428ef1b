//! Binary audio framing codec (§4.A) — the fixed 16-byte-header format used
//! on the same WebSocket as JSON for the ESP32 audio device variant.
//!
//! All multi-byte fields are big-endian / network byte order, written with
//! the plain `to_be_bytes`/`from_be_bytes` the pack reaches for when it needs
//! a hand-rolled wire format (e.g. zeroclaw's WeCom message framing), rather
//! than pulling in a separate byte-order crate for four integers.
//!
//! The spec calls out a contradictory little-endian draft in the source
//! this was distilled from; per the REDESIGN FLAGS resolution in
//! SPEC_FULL.md, no such code path exists here.

const HEADER_LEN: usize = 16;
const FRAME_VERSION: u16 = 2;

/// Payload type carried in a frame. Any on-wire value other than 0 or 1
/// decodes as `Opus` (§4.A: "any other value ⇒ decode as opus").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Opus,
    Json,
}

impl FrameType {
    fn to_wire(self) -> u16 {
        match self {
            FrameType::Opus => 0,
            FrameType::Json => 1,
        }
    }

    fn from_wire(value: u16) -> Self {
        match value {
            1 => FrameType::Json,
            _ => FrameType::Opus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub version: u16,
    pub frame_type: FrameType,
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("timestamp {0} is out of range")]
    TimestampOutOfRange(i64),
}

/// True iff `buf` is at least 16 bytes long and its version field is 2.
/// Used to distinguish this framing from an opaque opus binary payload on
/// the same WebSocket (§6).
pub fn is_frame(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN && u16::from_be_bytes([buf[0], buf[1]]) == FRAME_VERSION
}

/// Encode a payload into a `16 + len(payload)` byte buffer.
///
/// `ts` is milliseconds; negative values are rejected, oversized values are
/// reduced modulo 2^32 per §4.A.
pub fn encode(payload: &[u8], ts: i64, frame_type: FrameType) -> Result<Vec<u8>, CodecError> {
    if ts < 0 {
        return Err(CodecError::TimestampOutOfRange(ts));
    }
    let wrapped_ts = (ts as u64 % (1u64 << 32)) as u32;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&FRAME_VERSION.to_be_bytes());
    buf.extend_from_slice(&frame_type.to_wire().to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes()); // reserved
    buf.extend_from_slice(&wrapped_ts.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a frame, returning `None` on any of: too short, wrong version, or
/// a declared payload size the buffer doesn't actually have (§4.A). Bytes
/// beyond `16 + payloadSize` are ignored.
pub fn decode(buf: &[u8]) -> Option<DecodedFrame> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let version = u16::from_be_bytes([buf[0], buf[1]]);
    if version != FRAME_VERSION {
        return None;
    }
    let frame_type = u16::from_be_bytes([buf[2], buf[3]]);
    let timestamp = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let payload_size = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;

    if buf.len() < HEADER_LEN + payload_size {
        return None;
    }

    Some(DecodedFrame {
        version,
        frame_type: FrameType::from_wire(frame_type),
        timestamp,
        payload: buf[HEADER_LEN..HEADER_LEN + payload_size].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_payload_type_and_timestamp() {
        let payload = vec![1, 2, 3, 4, 5];
        let encoded = encode(&payload, 1_000, FrameType::Json).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.version, 2);
        assert_eq!(decoded.frame_type, FrameType::Json);
        assert_eq!(decoded.timestamp, 1_000);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn timestamp_wraps_modulo_2_32() {
        let ts: i64 = (1u64 << 32) as i64 + 42;
        let encoded = encode(&[], ts, FrameType::Opus).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.timestamp, 42);
    }

    #[test]
    fn negative_timestamp_rejected() {
        assert!(encode(&[], -1, FrameType::Opus).is_err());
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(decode(&[0u8; 10]).is_none());
    }

    #[test]
    fn decode_rejects_wrong_version() {
        let mut buf = vec![0u8; 16];
        buf[1] = 3; // version = 3
        assert!(decode(&buf).is_none());
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let mut buf = encode(&[1, 2, 3, 4], 0, FrameType::Json).unwrap();
        buf.truncate(buf.len() - 2); // claims 4 bytes of payload, has 2
        assert!(decode(&buf).is_none());
    }

    #[test]
    fn unknown_type_decodes_as_opus() {
        let mut buf = encode(&[9, 9], 5, FrameType::Json).unwrap();
        buf[2] = 0;
        buf[3] = 7; // unknown type id
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Opus);
    }

    #[test]
    fn is_frame_requires_len_and_version() {
        assert!(!is_frame(&[0u8; 10]));
        let mut short_version = vec![0u8; 16];
        short_version[1] = 9;
        assert!(!is_frame(&short_version));
        let valid = encode(&[], 0, FrameType::Opus).unwrap();
        assert!(is_frame(&valid));
    }

    #[test]
    fn trailing_bytes_beyond_declared_payload_are_ignored() {
        let mut buf = encode(&[1, 2], 7, FrameType::Json).unwrap();
        buf.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.payload, vec![1, 2]);
    }

    #[test]
    fn literal_wire_layout_matches_spec_example() {
        // §8 scenario 6.
        let payload = [0xDE, 0xAD, 0xBE, 0xEF];
        let encoded = encode(&payload, 0x1122_3344, FrameType::Json).unwrap();
        assert_eq!(
            encoded,
            vec![
                0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x11, 0x22, 0x33, 0x44, 0x00,
                0x00, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF,
            ]
        );
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.timestamp, 0x1122_3344);
        assert_eq!(decoded.frame_type, FrameType::Json);
    }
}
