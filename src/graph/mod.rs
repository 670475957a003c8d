//! Graph representations produced during conversion
//!
//! - `interchange`: framework-neutral NCHW graph exported from the source model
//! - `mobile`: flat NHWC graph bundled with the app
//!
//! Both are stored as a 4-byte magic, a little-endian u32 format version and a
//! named MessagePack payload.

pub mod interchange;
pub mod mobile;

pub use interchange::{Dim, InterchangeGraph, Node, NodeKind, ValueInfo};
pub use mobile::{ArtifactOrigin, MobileGraph, MobileGraphBuilder, Operator};

use serde::{de::DeserializeOwned, Serialize};

use crate::utils::error::{ExportError, Result};

const HEADER_LEN: usize = 8;

/// Encode `value` behind a magic and version header
pub(crate) fn encode_framed<T: Serialize>(magic: &[u8; 4], version: u32, value: &T) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(value)?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(magic);
    bytes.extend_from_slice(&version.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode bytes written by [`encode_framed`], checking magic and version
pub(crate) fn decode_framed<T: DeserializeOwned>(
    magic: &[u8; 4],
    version: u32,
    bytes: &[u8],
) -> Result<T> {
    if bytes.len() < HEADER_LEN {
        return Err(ExportError::Serialization(format!(
            "{} bytes is too short for a graph header",
            bytes.len()
        )));
    }
    if &bytes[..4] != magic {
        return Err(ExportError::Serialization(format!(
            "bad magic {:?}, expected {:?}",
            String::from_utf8_lossy(&bytes[..4]),
            String::from_utf8_lossy(magic)
        )));
    }

    let mut raw_version = [0u8; 4];
    raw_version.copy_from_slice(&bytes[4..HEADER_LEN]);
    let found = u32::from_le_bytes(raw_version);
    if found != version {
        return Err(ExportError::Serialization(format!(
            "unsupported format version {}, expected {}",
            found, version
        )));
    }

    rmp_serde::from_slice(&bytes[HEADER_LEN..]).map_err(|e| ExportError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_rejects_foreign_bytes() {
        let bytes = encode_framed(b"TEST", 3, &vec![1u32, 2, 3]).unwrap();
        assert_eq!(&bytes[..4], b"TEST");

        let decoded: Vec<u32> = decode_framed(b"TEST", 3, &bytes).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);

        assert!(decode_framed::<Vec<u32>>(b"NOPE", 3, &bytes).is_err());
        assert!(decode_framed::<Vec<u32>>(b"TEST", 4, &bytes).is_err());
        assert!(decode_framed::<Vec<u32>>(b"TEST", 3, &bytes[..5]).is_err());
    }
}
