//! Posting-list wire format (§4.9): `u32 count || for each: u32 len || utf8(doc_id)`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Serializes a posting list of document IDs.
#[must_use]
pub fn encode(doc_ids: &[String]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + doc_ids.iter().map(|d| 4 + d.len()).sum::<usize>());
    out.write_u32::<LittleEndian>(doc_ids.len() as u32)
        .expect("writing to a Vec never fails");
    for id in doc_ids {
        out.write_u32::<LittleEndian>(id.len() as u32)
            .expect("writing to a Vec never fails");
        out.extend_from_slice(id.as_bytes());
    }
    out
}

/// Parses a posting list previously produced by [`encode`]. Returns `None`
/// on a malformed buffer (truncated length fields, invalid UTF-8, or a
/// declared length that runs past the end of the buffer).
#[must_use]
pub fn decode(bytes: &[u8]) -> Option<Vec<String>> {
    let mut cursor: &[u8] = bytes;
    let count = cursor.read_u32::<LittleEndian>().ok()? as usize;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let len = cursor.read_u32::<LittleEndian>().ok()? as usize;
        if len > cursor.len() {
            return None;
        }
        let (id_bytes, rest) = cursor.split_at(len);
        cursor = rest;
        ids.push(String::from_utf8(id_bytes.to_vec()).ok()?);
    }
    Some(ids)
}
