//! In-memory node representation and its on-page byte encoding.
//!
//! ```text
//! Leaf:     [kind=1: u8][next: u64][count: u32]{[klen:u32][key][vlen:u32][val]}*
//! Interior: [kind=0: u8][count: u32]{[klen:u32][key]}* {[child: u64]}(count+1)
//! ```
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read};

pub const LEAF_KIND: u8 = 1;
pub const INTERIOR_KIND: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        /// Page id of the next leaf in key order, for range scans.
        next: Option<u64>,
    },
    Interior {
        /// `keys.len() == children.len() - 1`. `children[i]` holds keys
        /// `< keys[i]`; `children[keys.len()]` holds keys `>= keys[last]`.
        keys: Vec<Vec<u8>>,
        children: Vec<u64>,
    },
}

impl Node {
    pub fn new_leaf() -> Self {
        Node::Leaf {
            entries: Vec::new(),
            next: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Node::Leaf { entries, next } => {
                out.write_u8(LEAF_KIND).unwrap();
                out.write_u64::<LittleEndian>(next.unwrap_or(0)).unwrap();
                out.write_u32::<LittleEndian>(entries.len() as u32)
                    .unwrap();
                for (k, v) in entries {
                    out.write_u32::<LittleEndian>(k.len() as u32).unwrap();
                    out.extend_from_slice(k);
                    out.write_u32::<LittleEndian>(v.len() as u32).unwrap();
                    out.extend_from_slice(v);
                }
            }
            Node::Interior { keys, children } => {
                out.write_u8(INTERIOR_KIND).unwrap();
                out.write_u32::<LittleEndian>(keys.len() as u32).unwrap();
                for k in keys {
                    out.write_u32::<LittleEndian>(k.len() as u32).unwrap();
                    out.extend_from_slice(k);
                }
                for c in children {
                    out.write_u64::<LittleEndian>(*c).unwrap();
                }
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(buf);
        let kind = cur.read_u8()?;
        match kind {
            LEAF_KIND => {
                let next_raw = cur.read_u64::<LittleEndian>()?;
                let next = if next_raw == 0 { None } else { Some(next_raw) };
                let count = cur.read_u32::<LittleEndian>()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let klen = cur.read_u32::<LittleEndian>()? as usize;
                    let mut k = vec![0u8; klen];
                    cur.read_exact(&mut k)?;
                    let vlen = cur.read_u32::<LittleEndian>()? as usize;
                    let mut v = vec![0u8; vlen];
                    cur.read_exact(&mut v)?;
                    entries.push((k, v));
                }
                Ok(Node::Leaf { entries, next })
            }
            INTERIOR_KIND => {
                let count = cur.read_u32::<LittleEndian>()? as usize;
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    let klen = cur.read_u32::<LittleEndian>()? as usize;
                    let mut k = vec![0u8; klen];
                    cur.read_exact(&mut k)?;
                    keys.push(k);
                }
                let mut children = Vec::with_capacity(count + 1);
                for _ in 0..=count {
                    children.push(cur.read_u64::<LittleEndian>()?);
                }
                Ok(Node::Interior { keys, children })
            }
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unknown node kind")),
        }
    }
}
