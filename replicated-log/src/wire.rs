//! Wire encoding for everything that crosses the transport.
//!
//! Two layers, both bincode encoded:
//!
//! - [`Frame`]: the transport-level unit carried inside each sealed frame.
//!   It distinguishes fire-and-forget sends from request/response pairs.
//! - [`Envelope`]: the application payload of a send, telling the request
//!   multiplexer whether the bytes are consensus protocol traffic or a client
//!   request.

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// A request submitted by a client for ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client_id: u64,
    pub req_no: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Opaque consensus protocol message.
    Protocol(Vec<u8>),
    Request(ClientRequest),
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("failed to encode envelope")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("failed to decode envelope")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Send(Vec<u8>),
    Request { id: u64, payload: Vec<u8> },
    Response { id: u64, payload: Vec<u8> },
    /// Sent by the server right before it closes a connection it refuses.
    Rejected { reason: String },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("failed to encode frame")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("failed to decode frame")
    }
}

/// Encodes the answer to a watermark query.
pub fn encode_watermark(next_req_no: u64) -> Vec<u8> {
    next_req_no.to_be_bytes().to_vec()
}

/// Decodes the answer to a watermark query; anything but 8 bytes is invalid.
pub fn decode_watermark(bytes: &[u8]) -> Result<u64> {
    ensure!(
        bytes.len() == 8,
        "watermark response must be 8 bytes, got {}",
        bytes.len()
    );
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_is_big_endian() -> Result<()> {
        let encoded = encode_watermark(0x0102);
        assert_eq!(encoded, vec![0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(decode_watermark(&encoded)?, 0x0102);
        Ok(())
    }

    #[test]
    fn test_short_watermark_rejected() {
        assert!(decode_watermark(&[0, 1, 2]).is_err());
        assert!(decode_watermark(&[0; 9]).is_err());
    }

    #[test]
    fn test_truncated_frame_fails_to_decode() -> Result<()> {
        let bytes = Frame::Request {
            id: 9,
            payload: vec![1, 2, 3],
        }
        .encode()?;
        assert!(Frame::decode(&bytes[..bytes.len() - 1]).is_err());
        Ok(())
    }
}
