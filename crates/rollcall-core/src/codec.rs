//! Self-describing binary encoding for stored embeddings.
//!
//! Layout of one vector:
//!
//! ```text
//! b"RCV1" | element type (u8) | element count (u32 LE) | payload
//! ```
//!
//! Element type `1` is f32 LE, `2` is f64 LE (narrowed to f32 on read).
//! A detection set is a u32 LE count followed by that many vectors.

use crate::types::Embedding;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"RCV1";
const HEADER_LEN: usize = 9;
const TAG_F32: u8 = 1;
const TAG_F64: u8 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("bad magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unknown element type tag {0}")]
    UnknownElementType(u8),
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Encode one embedding as f32.
pub fn encode(embedding: &Embedding) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + embedding.values.len() * 4);
    write_vector(&mut out, embedding);
    out
}

/// Decode one embedding; the buffer must hold exactly one vector.
pub fn decode(bytes: &[u8]) -> Result<Embedding, CodecError> {
    let (embedding, used) = read_vector(bytes)?;
    if used != bytes.len() {
        return Err(CodecError::TrailingBytes(bytes.len() - used));
    }
    Ok(embedding)
}

/// Encode an ordered set of embeddings (e.g. all detections of one photo).
pub fn encode_set(embeddings: &[Embedding]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(embeddings.len() as u32).to_le_bytes());
    for embedding in embeddings {
        write_vector(&mut out, embedding);
    }
    out
}

/// Decode a set written by [`encode_set`], preserving order.
pub fn decode_set(bytes: &[u8]) -> Result<Vec<Embedding>, CodecError> {
    let count = read_u32(bytes, 0)? as usize;
    let mut offset = 4;
    // Every vector carries at least a header, so a count the buffer cannot
    // hold is rejected before allocating for it.
    let needed = count.saturating_mul(HEADER_LEN).saturating_add(offset);
    if bytes.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let (embedding, used) = read_vector(&bytes[offset..])?;
        out.push(embedding);
        offset += used;
    }
    if offset != bytes.len() {
        return Err(CodecError::TrailingBytes(bytes.len() - offset));
    }
    Ok(out)
}

fn write_vector(out: &mut Vec<u8>, embedding: &Embedding) {
    out.extend_from_slice(MAGIC);
    out.push(TAG_F32);
    out.extend_from_slice(&(embedding.values.len() as u32).to_le_bytes());
    for v in &embedding.values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Read one vector from the front of `bytes`, returning it and the bytes used.
fn read_vector(bytes: &[u8]) -> Result<(Embedding, usize), CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }

    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if &magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }

    let tag = bytes[4];
    let width = match tag {
        TAG_F32 => 4,
        TAG_F64 => 8,
        other => return Err(CodecError::UnknownElementType(other)),
    };

    let count = read_u32(bytes, 5)? as usize;
    let end = count.saturating_mul(width).saturating_add(HEADER_LEN);
    if bytes.len() < end {
        return Err(CodecError::Truncated {
            needed: end,
            available: bytes.len(),
        });
    }

    let payload = &bytes[HEADER_LEN..end];
    let values = if tag == TAG_F32 {
        payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    } else {
        payload
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect()
    };

    Ok((Embedding { values }, end))
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, CodecError> {
    match bytes.get(at..at + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(CodecError::Truncated {
            needed: at + 4,
            available: bytes.len(),
        }),
    }
}
