//! Packed frame representation for script-side consumers.
//!
//! Spectrum bins travel as base64-encoded little-endian `f32` bytes next to
//! the scalar fields, which keeps per-frame JSON traffic small at typical bin
//! counts. Decoding is strict: the header fields and the payload length must
//! agree exactly, and a malformed frame is an error rather than a best-effort
//! truncation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::snapshot::Snapshot;

/// Identifier for little-endian float32 payloads.
pub const FRAME_FORMAT: &str = "f32-le";
/// Bytes per bin in the packed payload.
pub const FRAME_STRIDE: usize = 4;
/// Current payload schema version.
pub const FRAME_VERSION: u32 = 1;

/// A snapshot packed for transport to a script consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedFrame {
    pub rms: f32,
    pub timestamp: f64,
    /// Base64 of the bins as little-endian `f32` bytes.
    pub payload: String,
    pub format: String,
    pub stride: usize,
    #[serde(rename = "binCount")]
    pub bin_count: usize,
    pub version: u32,
}

impl EncodedFrame {
    /// Packs a snapshot into the transport representation.
    pub fn encode(snapshot: &Snapshot) -> Self {
        let mut bytes = Vec::with_capacity(snapshot.bins.len() * FRAME_STRIDE);
        for bin in &snapshot.bins {
            bytes.extend_from_slice(&bin.to_le_bytes());
        }
        Self {
            rms: snapshot.rms,
            timestamp: snapshot.timestamp,
            payload: STANDARD.encode(&bytes),
            format: FRAME_FORMAT.to_string(),
            stride: FRAME_STRIDE,
            bin_count: snapshot.bins.len(),
            version: FRAME_VERSION,
        }
    }

    /// Unpacks the bins, validating the header fields and payload length.
    pub fn decode_bins(&self) -> Result<Vec<f32>> {
        if self.format != FRAME_FORMAT {
            return Err(BridgeError::MalformedPayload(format!(
                "unsupported format `{}`",
                self.format
            )));
        }
        if self.version != FRAME_VERSION {
            return Err(BridgeError::MalformedPayload(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.stride != FRAME_STRIDE {
            return Err(BridgeError::MalformedPayload(format!(
                "unsupported stride {}",
                self.stride
            )));
        }

        let bytes = STANDARD
            .decode(&self.payload)
            .map_err(|err| BridgeError::MalformedPayload(format!("invalid base64: {err}")))?;
        if bytes.len() % FRAME_STRIDE != 0 {
            return Err(BridgeError::MalformedPayload(format!(
                "payload length {} is not a multiple of the stride",
                bytes.len()
            )));
        }
        let bins_in_payload = bytes.len() / FRAME_STRIDE;
        if bins_in_payload != self.bin_count {
            return Err(BridgeError::MalformedPayload(format!(
                "payload carries {} bins but the header declares {}",
                bins_in_payload, self.bin_count
            )));
        }

        Ok(bytes
            .chunks_exact(FRAME_STRIDE)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    /// Serializes the frame to the JSON shape script consumers poll for.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_packs_bins_in_order() {
        let snapshot = Snapshot {
            bins: vec![1.0, -0.5],
            rms: 0.3,
            timestamp: 12.5,
        };
        let frame = EncodedFrame::encode(&snapshot);

        assert_eq!(frame.format, FRAME_FORMAT);
        assert_eq!(frame.stride, FRAME_STRIDE);
        assert_eq!(frame.version, FRAME_VERSION);
        assert_eq!(frame.bin_count, 2);
        // 1.0f32 then -0.5f32 as little-endian bytes.
        assert_eq!(frame.payload, "AACAPwAAAL8=");
        assert_eq!(frame.decode_bins().unwrap(), vec![1.0, -0.5]);
    }

    #[test]
    fn empty_snapshot_encodes_to_empty_payload() {
        let frame = EncodedFrame::encode(&Snapshot::default());
        assert_eq!(frame.bin_count, 0);
        assert!(frame.payload.is_empty());
        assert!(frame.decode_bins().unwrap().is_empty());
    }

    #[test]
    fn decode_rejects_unknown_format() {
        let mut frame = EncodedFrame::encode(&Snapshot {
            bins: vec![0.1],
            rms: 0.1,
            timestamp: 1.0,
        });
        frame.format = "f64-be".to_string();
        assert!(matches!(
            frame.decode_bins(),
            Err(BridgeError::MalformedPayload(_))
        ));
    }

    #[test]
    fn decode_rejects_foreign_header_values() {
        let good = EncodedFrame::encode(&Snapshot {
            bins: vec![0.1, 0.2],
            rms: 0.1,
            timestamp: 1.0,
        });

        let mut wrong_version = good.clone();
        wrong_version.version = 2;
        assert!(wrong_version.decode_bins().is_err());

        let mut wrong_stride = good;
        wrong_stride.stride = 8;
        assert!(wrong_stride.decode_bins().is_err());
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let mut frame = EncodedFrame::encode(&Snapshot {
            bins: vec![0.1, 0.2],
            rms: 0.1,
            timestamp: 1.0,
        });
        // Drop the last bin's bytes but keep the declared count.
        frame.payload = STANDARD.encode(&0.1f32.to_le_bytes());
        assert!(matches!(
            frame.decode_bins(),
            Err(BridgeError::MalformedPayload(_))
        ));
    }

    #[test]
    fn decode_rejects_ragged_payload_length() {
        let mut frame = EncodedFrame::encode(&Snapshot {
            bins: vec![0.1],
            rms: 0.1,
            timestamp: 1.0,
        });
        frame.payload = STANDARD.encode([0u8, 1, 2, 3, 4, 5]);
        assert!(frame.decode_bins().is_err());
    }

    #[test]
    fn to_json_uses_the_script_facing_keys() {
        let frame = EncodedFrame::encode(&Snapshot {
            bins: vec![0.25, 0.75],
            rms: 0.5,
            timestamp: 2.0,
        });
        let json = frame.to_json().unwrap();
        assert!(json.contains("\"binCount\":2"));
        assert!(json.contains("\"format\":\"f32-le\""));
        assert!(json.contains("\"version\":1"));
    }
}
