//! Envelope codec for typed payloads.
//!
//! Envelope format: `[length:4][payload:N]`
//!
//! - **length**: size of the compressed payload in bytes (big-endian u32)
//! - **payload**: raw-deflate-compressed JSON encoding of the value
//!
//! The payload is self-describing (JSON), so a receiver can always recover a
//! typed value without out-of-band schema knowledge. The envelope carries no
//! further framing; ordering on a stream is positional.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Length prefix size: 4 bytes, big-endian.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum compressed payload size (8 MiB).
///
/// Deliberately below 2^24: the first byte of every legal length prefix is
/// then zero, while control lines are uppercase ASCII. A reader positioned
/// where either an envelope or a control line may arrive can dispatch on a
/// single byte.
pub const MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;

/// Envelope codec error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Compressed payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge {
        /// Actual compressed size in bytes.
        size: usize,
    },

    /// Length prefix read off the wire is zero or exceeds the maximum.
    #[error("invalid envelope length: {length}")]
    InvalidLength {
        /// The rejected length value.
        length: u32,
    },

    /// Serialization or compression failed.
    #[error("encode failed: {message}")]
    Encode {
        /// Details of the failure.
        message: String,
    },

    /// Decompression or deserialization failed.
    #[error("decode failed: {message}")]
    Decode {
        /// Details of the failure.
        message: String,
    },
}

/// Serialize, compress and frame `value` into a complete envelope.
///
/// Returns `[length:4 BE][compressed payload]`, ready for a single write.
///
/// # Errors
///
/// Returns `Encode` if serialization fails and `PayloadTooLarge` if the
/// compressed payload exceeds [`MAX_PAYLOAD_SIZE`].
pub fn encode_envelope<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let json = serde_json::to_vec(value).map_err(|e| WireError::Encode {
        message: e.to_string(),
    })?;

    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(json.len() / 2 + 16),
        Compression::default(),
    );
    encoder.write_all(&json).map_err(|e| WireError::Encode {
        message: e.to_string(),
    })?;
    let compressed = encoder.finish().map_err(|e| WireError::Encode {
        message: e.to_string(),
    })?;

    if compressed.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge {
            size: compressed.len(),
        });
    }

    let mut envelope = Vec::with_capacity(LENGTH_PREFIX_SIZE + compressed.len());
    envelope.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
    envelope.extend_from_slice(&compressed);
    Ok(envelope)
}

/// Validate a length prefix read off the wire and return it as a usize.
///
/// # Errors
///
/// Returns `InvalidLength` for zero or oversized lengths.
pub fn payload_length(length: u32) -> Result<usize, WireError> {
    if length == 0 || length as usize > MAX_PAYLOAD_SIZE {
        return Err(WireError::InvalidLength { length });
    }
    Ok(length as usize)
}

/// Decompress and deserialize one envelope payload (length prefix already
/// consumed).
///
/// # Errors
///
/// Returns `Decode` if decompression or deserialization fails.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, WireError> {
    let mut decoder = DeflateDecoder::new(payload);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| WireError::Decode {
            message: e.to_string(),
        })?;
    serde_json::from_slice(&json).map_err(|e| WireError::Decode {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u32,
        text: String,
    }

    #[test]
    fn roundtrip() {
        let value = Sample {
            id: 42,
            text: "hello turnpike".into(),
        };

        let envelope = encode_envelope(&value).expect("encode");
        let length = u32::from_be_bytes([envelope[0], envelope[1], envelope[2], envelope[3]]);
        let size = payload_length(length).expect("length");

        let decoded: Sample = decode_payload(&envelope[LENGTH_PREFIX_SIZE..]).expect("decode");
        assert_eq!(decoded, value);
        assert_eq!(size, envelope.len() - LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn length_prefix_matches_payload() {
        let envelope = encode_envelope(&"payload").expect("encode");
        let length = u32::from_be_bytes([envelope[0], envelope[1], envelope[2], envelope[3]]);
        assert_eq!(length as usize, envelope.len() - LENGTH_PREFIX_SIZE);
        // Max payload fits in 24 bits, so the leading byte is always zero.
        assert_eq!(envelope[0], 0);
        assert_ne!(length, 0);
    }

    #[test]
    fn compressible_payload_shrinks() {
        let value = "a".repeat(64 * 1024);
        let envelope = encode_envelope(&value).expect("encode");
        assert!(envelope.len() < value.len() / 10);

        let decoded: String = decode_payload(&envelope[LENGTH_PREFIX_SIZE..]).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn zero_length_rejected() {
        assert!(matches!(
            payload_length(0),
            Err(WireError::InvalidLength { length: 0 })
        ));
    }

    #[test]
    fn oversized_length_rejected() {
        let result = payload_length(MAX_PAYLOAD_SIZE as u32 + 1);
        assert!(matches!(result, Err(WireError::InvalidLength { .. })));
    }

    #[test]
    fn garbage_payload_fails_decode() {
        let result: Result<Sample, WireError> = decode_payload(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(result, Err(WireError::Decode { .. })));
    }

    #[test]
    fn type_mismatch_fails_decode() {
        let envelope = encode_envelope(&vec![1u32, 2, 3]).expect("encode");
        let result: Result<Sample, WireError> = decode_payload(&envelope[LENGTH_PREFIX_SIZE..]);
        assert!(matches!(result, Err(WireError::Decode { .. })));
    }
}
