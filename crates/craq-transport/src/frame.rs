//! Wire framing for TCP transport.
//!
//! ```text
//! +----------+----------+----------+------------------+
//! | Magic(4) | Id(8)    | Len(4)   | Payload(Len)     |
//! +----------+----------+----------+------------------+
//! ```
//!
//! The id ties a response frame back to its request; payloads are bincode.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use craq_common::{ChainError, ChainResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic number identifying a chain frame.
pub const FRAME_MAGIC: u32 = 0x43524151; // "CRAQ"

/// Maximum payload size (16 MB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 4 + 8 + 4; // magic + id + len

/// Encodes a message into a frame.
pub fn encode<T: Serialize>(id: u64, message: &T) -> ChainResult<Bytes> {
    let payload = bincode::serialize(message).map_err(ChainError::transport)?;

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ChainError::transport(format!(
            "message too large: {} bytes",
            payload.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(FRAME_MAGIC);
    buf.put_u64(id);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decodes a complete frame into `(id, message)`.
pub fn decode<T: DeserializeOwned>(mut data: Bytes) -> ChainResult<(u64, T)> {
    if data.len() < HEADER_SIZE {
        return Err(ChainError::transport("frame too short"));
    }

    let magic = data.get_u32();
    if magic != FRAME_MAGIC {
        return Err(ChainError::transport(format!("invalid magic: {magic:08x}")));
    }

    let id = data.get_u64();
    let len = data.get_u32() as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ChainError::transport(format!("message too large: {len} bytes")));
    }
    if data.len() < len {
        return Err(ChainError::transport("incomplete frame"));
    }

    let payload = data.slice(..len);
    let message = bincode::deserialize(&payload).map_err(ChainError::transport)?;
    Ok((id, message))
}

/// Reads the id of a complete frame without decoding the payload.
pub fn frame_id(data: &[u8]) -> u64 {
    u64::from_be_bytes([
        data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
    ])
}

/// Checks whether `data` starts with a complete frame.
///
/// Returns the total frame size if so, `None` if more bytes are needed.
pub fn frame_size(data: &[u8]) -> Option<usize> {
    if data.len() < HEADER_SIZE {
        return None;
    }

    let len = u32::from_be_bytes([data[12], data[13], data[14], data[15]]) as usize;
    let total = HEADER_SIZE + len;

    if data.len() >= total {
        Some(total)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{NodeRequest, NodeResponse};
    use craq_common::ChainError;

    #[test]
    fn test_encode_decode_roundtrip() {
        let request = NodeRequest::Commit {
            key: "k".to_owned(),
            version: 7,
        };

        let encoded = encode(42, &request).unwrap();
        let (id, decoded): (u64, NodeRequest) = decode(encoded).unwrap();

        assert_eq!(id, 42);
        match decoded {
            NodeRequest::Commit { key, version } => {
                assert_eq!(key, "k");
                assert_eq!(version, 7);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_error_crosses_the_wire() {
        let response = NodeResponse::Error(ChainError::key_not_found("ghost"));
        let encoded = encode(1, &response).unwrap();
        let (_, decoded): (u64, NodeResponse) = decode(encoded).unwrap();

        match decoded {
            NodeResponse::Error(err) => assert_eq!(err, ChainError::key_not_found("ghost")),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_magic() {
        let mut data = bytes::BytesMut::new();
        data.put_u32(0xDEADBEEF);
        data.put_u64(1);
        data.put_u32(0);

        let result: ChainResult<(u64, NodeRequest)> = decode(data.freeze());
        assert!(result.unwrap_err().is_transport());
    }

    #[test]
    fn test_frame_size_and_id() {
        let encoded = encode(9, &NodeRequest::ReadAll).unwrap();

        assert_eq!(frame_size(&encoded), Some(encoded.len()));
        assert_eq!(frame_id(&encoded), 9);

        // Incomplete header and incomplete payload.
        assert_eq!(frame_size(&encoded[..10]), None);
        assert_eq!(frame_size(&encoded[..encoded.len() - 1]), None);
    }
}
