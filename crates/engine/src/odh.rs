//! On-disk header of stored records and blobs.
//!
//! Every image written to the store is prefixed by `[MAGIC, version, flags]`,
//! where `version` is the table version the payload was encoded with.

use std::io::Read as _;

use flate2::{
    read::{DeflateDecoder, DeflateEncoder},
    Compression,
};
use thiserror::Error;

pub const MAGIC: u8 = 0x0d;
pub const HEADER_LEN: usize = 3;

const FLAG_DEFLATE: u8 = 0b1;

#[derive(Debug, Error)]
pub enum OdhError {
    #[error("missing on-disk header")]
    NotPacked,
    #[error("unknown flags {0:#x}")]
    Flags(u8),
    #[error("decompression failed")]
    Inflate(#[source] std::io::Error),
}

/// A payload with its on-disk header removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unpacked {
    pub version: u8,
    pub payload: Vec<u8>,
}

pub fn pack(version: u8, payload: &[u8], compress: bool) -> Vec<u8> {
    let mut out = vec![MAGIC, version, 0];
    if compress {
        let mut deflated = Vec::with_capacity(payload.len() / 2);
        if DeflateEncoder::new(payload, Compression::fast())
            .read_to_end(&mut deflated)
            .is_ok()
        {
            out[2] = FLAG_DEFLATE;
            out.extend_from_slice(&deflated);
            return out;
        }
    }
    out.extend_from_slice(payload);
    out
}

/// Strip the header from `buf`, decompressing the payload if necessary.
///
/// Refuses buffers which do not start with a header, such as an already
/// unpacked payload.
pub fn unpack(buf: &[u8]) -> Result<Unpacked, OdhError> {
    if buf.len() < HEADER_LEN || buf[0] != MAGIC {
        return Err(OdhError::NotPacked);
    }
    let (version, flags) = (buf[1], buf[2]);
    let body = &buf[HEADER_LEN..];
    let payload = match flags {
        0 => body.to_vec(),
        FLAG_DEFLATE => {
            let mut out = Vec::with_capacity(body.len() * 2);
            DeflateDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(OdhError::Inflate)?;
            out
        }
        other => return Err(OdhError::Flags(other)),
    };
    Ok(Unpacked { version, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_payload_survives() {
        let payload = vec![7u8; 4096];
        let packed = pack(3, &payload, true);
        assert!(packed.len() < payload.len());
        let unpacked = unpack(&packed).unwrap();
        assert_eq!(unpacked.version, 3);
        assert_eq!(unpacked.payload, payload);
    }

    #[test]
    fn refuses_double_unpack() {
        let packed = pack(1, b"\x01abc", false);
        let once = unpack(&packed).unwrap();
        assert!(matches!(unpack(&once.payload), Err(OdhError::NotPacked)));
        assert!(matches!(unpack(&[MAGIC, 1, 0x80]), Err(OdhError::Flags(0x80))));
    }
}
