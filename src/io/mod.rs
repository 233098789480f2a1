//! Binary model format.
//!
//! A serialized forest is a 32-byte header followed by a postcard-encoded
//! [`Payload`](payload::Payload). The header carries a magic tag, format
//! version, the tree-type tag, the payload length, and a CRC32 checksum of
//! the payload, so truncation and corruption are detected before decoding.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     Magic ("FRST")
//! 4       1     Version major
//! 5       1     Version minor
//! 6       1     Tree type (0 = classification, 1 = regression)
//! 7       1     Reserved
//! 8       2     Flags (reserved bitfield)
//! 10      2     Reserved
//! 12      4     Payload size (bytes, little-endian)
//! 16      4     CRC32 of payload
//! 20      4     Number of predictors
//! 24      4     Number of trees
//! 28      4     Reserved
//! ```

pub mod payload;

use thiserror::Error;

use crate::forest::Forest;
use crate::params::TreeType;
use payload::{ModelMetadata, Payload, PayloadV1};

/// Magic bytes identifying a serialized forest.
pub const MAGIC: &[u8; 4] = b"FRST";

/// Current format version (major).
pub const CURRENT_VERSION_MAJOR: u8 = 1;

/// Current format version (minor).
pub const CURRENT_VERSION_MINOR: u8 = 0;

/// Size of the format header in bytes.
pub const HEADER_SIZE: usize = 32;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while serializing a forest.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),
}

/// Errors raised while deserializing a forest.
#[derive(Debug, Error)]
pub enum DeserializeError {
    /// Wrong magic bytes.
    #[error("not a serialized forest")]
    NotAModel,

    /// The model was written by a newer format version.
    #[error("model requires format version {major}.{minor} or later")]
    UnsupportedVersion { major: u8, minor: u8 },

    /// The byte stream is shorter than the header says.
    #[error("stream truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// The payload checksum does not match.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The payload decoded but its structure is inconsistent.
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("decoding error: {0}")]
    Decoding(#[from] postcard::Error),
}

// ============================================================================
// Header
// ============================================================================

fn tree_type_tag(tree_type: TreeType) -> u8 {
    match tree_type {
        TreeType::Classification => 0,
        TreeType::Regression => 1,
    }
}

fn tree_type_from_tag(tag: u8) -> Result<TreeType, DeserializeError> {
    match tag {
        0 => Ok(TreeType::Classification),
        1 => Ok(TreeType::Regression),
        _ => Err(DeserializeError::CorruptPayload("invalid tree type tag".into())),
    }
}

/// Fixed-size header preceding the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub tree_type: TreeType,
    pub flags: u16,
    pub payload_size: u32,
    pub checksum: u32,
    pub n_predictor: u32,
    pub n_tree: u32,
}

impl FormatHeader {
    pub fn new(tree_type: TreeType, n_predictor: u32, n_tree: u32) -> Self {
        FormatHeader {
            version_major: CURRENT_VERSION_MAJOR,
            version_minor: CURRENT_VERSION_MINOR,
            tree_type,
            flags: 0,
            payload_size: 0,
            checksum: 0,
            n_predictor,
            n_tree,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = self.version_major;
        buf[5] = self.version_minor;
        buf[6] = tree_type_tag(self.tree_type);
        buf[8..10].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf[20..24].copy_from_slice(&self.n_predictor.to_le_bytes());
        buf[24..28].copy_from_slice(&self.n_tree.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self, DeserializeError> {
        if &buf[0..4] != MAGIC {
            return Err(DeserializeError::NotAModel);
        }
        let version_major = buf[4];
        let version_minor = buf[5];
        if version_major > CURRENT_VERSION_MAJOR {
            return Err(DeserializeError::UnsupportedVersion {
                major: version_major,
                minor: version_minor,
            });
        }
        Ok(FormatHeader {
            version_major,
            version_minor,
            tree_type: tree_type_from_tag(buf[6])?,
            flags: u16::from_le_bytes([buf[8], buf[9]]),
            payload_size: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            checksum: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            n_predictor: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            n_tree: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Serialize a forest and its metadata into the binary envelope.
pub fn serialize_forest(
    metadata: &ModelMetadata,
    forest: &Forest,
) -> Result<Vec<u8>, SerializeError> {
    let payload = Payload::V1(PayloadV1 {
        metadata: metadata.clone(),
        forest: payload::forest_to_payload(forest),
    });
    let payload_bytes = postcard::to_allocvec(&payload)?;

    let mut header = FormatHeader::new(
        forest.tree_type(),
        forest.n_predictor() as u32,
        forest.n_tree() as u32,
    );
    header.payload_size = payload_bytes.len() as u32;
    header.checksum = crc32fast::hash(&payload_bytes);

    let mut output = Vec::with_capacity(HEADER_SIZE + payload_bytes.len());
    output.extend_from_slice(&header.to_bytes());
    output.extend_from_slice(&payload_bytes);
    Ok(output)
}

/// Deserialize a forest from the binary envelope.
pub fn deserialize_forest(bytes: &[u8]) -> Result<(ModelMetadata, Forest), DeserializeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(DeserializeError::Truncated {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    let mut header_buf = [0u8; HEADER_SIZE];
    header_buf.copy_from_slice(&bytes[..HEADER_SIZE]);
    let header = FormatHeader::from_bytes(&header_buf)?;

    let expected = HEADER_SIZE + header.payload_size as usize;
    if bytes.len() < expected {
        return Err(DeserializeError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    let payload_bytes = &bytes[HEADER_SIZE..expected];
    let actual_checksum = crc32fast::hash(payload_bytes);
    if actual_checksum != header.checksum {
        return Err(DeserializeError::ChecksumMismatch {
            expected: header.checksum,
            actual: actual_checksum,
        });
    }

    let Payload::V1(decoded) = postcard::from_bytes(payload_bytes)?;
    let forest = payload::forest_from_payload(decoded.forest)?;
    if forest.tree_type() != header.tree_type {
        return Err(DeserializeError::CorruptPayload(
            "header tree type does not match payload".into(),
        ));
    }
    Ok((decoded.metadata, forest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut header = FormatHeader::new(TreeType::Regression, 12, 100);
        header.payload_size = 4096;
        header.checksum = 0xDEADBEEF;
        let parsed = FormatHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn header_rejects_wrong_magic() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(b"XXXX");
        assert!(matches!(
            FormatHeader::from_bytes(&buf),
            Err(DeserializeError::NotAModel)
        ));
    }

    #[test]
    fn header_rejects_future_version() {
        let mut header = FormatHeader::new(TreeType::Classification, 1, 1);
        header.version_major = CURRENT_VERSION_MAJOR + 1;
        assert!(matches!(
            FormatHeader::from_bytes(&header.to_bytes()),
            Err(DeserializeError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn deserialize_rejects_truncated_stream() {
        assert!(matches!(
            deserialize_forest(&[0u8; 4]),
            Err(DeserializeError::Truncated { .. })
        ));
    }
}
