//! Descriptor pool and string table.
//!
//! Registered values and commands hang metadata off a singly-linked chain of
//! typed nodes. Strings are interned into one bounded table shared by both
//! registries. Guest-registered entries describe their chain in memory as
//! `{kind: u8, len: u8, payload}` nodes terminated by kind 0; the pool parses
//! that into host nodes at registration time.

use thiserror::Error;

use hsx_abi::{DESC_END, DESC_GROUP, DESC_NAME, DESC_PERSIST, DESC_RANGE, DESC_UNIT,
    STRING_TABLE_BYTES};

/// Chain terminator / "no descriptor" marker.
pub const NO_NODE: u16 = 0xFFFF;

/// Upper bound on nodes accepted from one guest chain.
const MAX_CHAIN_NODES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("descriptor pool or string table full")]
    NoSpace,
    #[error("malformed descriptor chain")]
    Invalid,
}

/// Interned string reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrRef {
    off: u16,
    len: u16,
}

/// Bounded append-only string table with interning.
pub struct StringTable {
    buf: Vec<u8>,
}

impl StringTable {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(STRING_TABLE_BYTES),
        }
    }

    pub fn intern(&mut self, s: &str) -> Result<StrRef, PoolError> {
        let bytes = s.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(PoolError::Invalid);
        }
        // Reuse an existing occurrence if present.
        if let Some(off) = self
            .buf
            .windows(bytes.len().max(1))
            .position(|w| w == bytes)
        {
            if !bytes.is_empty() {
                return Ok(StrRef {
                    off: off as u16,
                    len: bytes.len() as u16,
                });
            }
        }
        if self.buf.len() + bytes.len() > STRING_TABLE_BYTES {
            return Err(PoolError::NoSpace);
        }
        let off = self.buf.len() as u16;
        self.buf.extend_from_slice(bytes);
        Ok(StrRef {
            off,
            len: bytes.len() as u16,
        })
    }

    pub fn get(&self, r: StrRef) -> &str {
        // Interned refs always point at valid UTF-8 we stored ourselves.
        core::str::from_utf8(&self.buf[r.off as usize..(r.off + r.len) as usize])
            .expect("string table holds UTF-8")
    }

    pub fn used(&self) -> usize {
        self.buf.len()
    }
}

/// One typed descriptor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescNode {
    Group(StrRef),
    Name(StrRef),
    Unit {
        /// f16 bit pattern; changes smaller than this are suppressible.
        epsilon: u16,
        /// Change-event rate limit and persistence debounce, in ms.
        rate_ms: u16,
        unit: StrRef,
    },
    Range {
        min: u16,
        max: u16,
        default: u16,
    },
    Persist {
        ns_id: u8,
        key_id: u8,
        mode: u8,
    },
}

/// The node arena. Chains are linked by index; `NO_NODE` terminates.
pub struct DescPool {
    nodes: Vec<(DescNode, u16)>,
    pub strings: StringTable,
}

impl DescPool {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            strings: StringTable::new(),
        }
    }

    /// Append a chain of nodes, preserving order, returning the head index.
    pub fn append_chain(&mut self, nodes: &[DescNode]) -> Result<u16, PoolError> {
        if nodes.is_empty() {
            return Ok(NO_NODE);
        }
        if self.nodes.len() + nodes.len() > NO_NODE as usize {
            return Err(PoolError::NoSpace);
        }
        let head = self.nodes.len() as u16;
        for (i, node) in nodes.iter().enumerate() {
            let next = if i + 1 == nodes.len() {
                NO_NODE
            } else {
                (self.nodes.len() + 1) as u16
            };
            self.nodes.push((*node, next));
        }
        Ok(head)
    }

    /// Walk a chain from its head.
    pub fn iter(&self, head: u16) -> ChainIter<'_> {
        ChainIter { pool: self, at: head }
    }

    /// Find the first node of a chain matching `f`.
    pub fn find<T>(&self, head: u16, f: impl Fn(&DescNode) -> Option<T>) -> Option<T> {
        self.iter(head).find_map(|n| f(&n))
    }

    /// Parse a guest-side `{kind, len, payload}` chain into pool nodes.
    pub fn parse_guest_chain(&mut self, bytes: &[u8]) -> Result<u16, PoolError> {
        let mut nodes = Vec::new();
        let mut at = 0usize;
        loop {
            if nodes.len() > MAX_CHAIN_NODES {
                return Err(PoolError::Invalid);
            }
            let kind = *bytes.get(at).ok_or(PoolError::Invalid)?;
            if kind == DESC_END {
                break;
            }
            let len = *bytes.get(at + 1).ok_or(PoolError::Invalid)? as usize;
            let payload = bytes.get(at + 2..at + 2 + len).ok_or(PoolError::Invalid)?;
            at += 2 + len;

            let node = match kind {
                DESC_GROUP => DescNode::Group(self.intern_bytes(payload)?),
                DESC_NAME => DescNode::Name(self.intern_bytes(payload)?),
                DESC_UNIT => {
                    if len < 4 {
                        return Err(PoolError::Invalid);
                    }
                    DescNode::Unit {
                        epsilon: u16::from_le_bytes([payload[0], payload[1]]),
                        rate_ms: u16::from_le_bytes([payload[2], payload[3]]),
                        unit: self.intern_bytes(&payload[4..])?,
                    }
                }
                DESC_RANGE => {
                    if len < 6 {
                        return Err(PoolError::Invalid);
                    }
                    DescNode::Range {
                        min: u16::from_le_bytes([payload[0], payload[1]]),
                        max: u16::from_le_bytes([payload[2], payload[3]]),
                        default: u16::from_le_bytes([payload[4], payload[5]]),
                    }
                }
                DESC_PERSIST => {
                    if len < 3 {
                        return Err(PoolError::Invalid);
                    }
                    DescNode::Persist {
                        ns_id: payload[0],
                        key_id: payload[1],
                        mode: payload[2],
                    }
                }
                _ => return Err(PoolError::Invalid),
            };
            nodes.push(node);
        }
        self.append_chain(&nodes)
    }

    fn intern_bytes(&mut self, bytes: &[u8]) -> Result<StrRef, PoolError> {
        let s = core::str::from_utf8(bytes).map_err(|_| PoolError::Invalid)?;
        self.strings.intern(s)
    }
}

impl Default for DescPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a descriptor chain.
pub struct ChainIter<'a> {
    pool: &'a DescPool,
    at: u16,
}

impl Iterator for ChainIter<'_> {
    type Item = DescNode;

    fn next(&mut self) -> Option<DescNode> {
        if self.at == NO_NODE {
            return None;
        }
        let (node, next) = self.pool.nodes.get(self.at as usize).copied()?;
        self.at = next;
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups() {
        let mut table = StringTable::new();
        let a = table.intern("temp").unwrap();
        let b = table.intern("temp").unwrap();
        assert_eq!(a, b);
        assert_eq!(table.get(a), "temp");
        assert_eq!(table.used(), 4);
    }

    #[test]
    fn chain_order_is_preserved() {
        let mut pool = DescPool::new();
        let name = pool.strings.intern("speed").unwrap();
        let head = pool
            .append_chain(&[
                DescNode::Name(name),
                DescNode::Range {
                    min: 0,
                    max: 0x4000,
                    default: 0,
                },
            ])
            .unwrap();
        let nodes: Vec<DescNode> = pool.iter(head).collect();
        assert_eq!(nodes.len(), 2);
        assert!(matches!(nodes[0], DescNode::Name(_)));
        assert!(matches!(nodes[1], DescNode::Range { .. }));
    }

    #[test]
    fn guest_chain_parses() {
        let mut bytes = Vec::new();
        // Name node: "rpm"
        bytes.extend_from_slice(&[hsx_abi::DESC_NAME, 3]);
        bytes.extend_from_slice(b"rpm");
        // Unit node: epsilon 0x2E66, rate 250ms, unit "1/min"
        bytes.extend_from_slice(&[hsx_abi::DESC_UNIT, 9]);
        bytes.extend_from_slice(&0x2E66u16.to_le_bytes());
        bytes.extend_from_slice(&250u16.to_le_bytes());
        bytes.extend_from_slice(b"1/min");
        bytes.push(hsx_abi::DESC_END);

        let mut pool = DescPool::new();
        let head = pool.parse_guest_chain(&bytes).unwrap();
        let name = pool
            .find(head, |n| match n {
                DescNode::Name(r) => Some(*r),
                _ => None,
            })
            .unwrap();
        assert_eq!(pool.strings.get(name), "rpm");
        let (eps, rate) = pool
            .find(head, |n| match n {
                DescNode::Unit { epsilon, rate_ms, .. } => Some((*epsilon, *rate_ms)),
                _ => None,
            })
            .unwrap();
        assert_eq!(eps, 0x2E66);
        assert_eq!(rate, 250);
    }

    #[test]
    fn truncated_guest_chain_is_rejected() {
        let mut pool = DescPool::new();
        assert_eq!(pool.parse_guest_chain(&[]), Err(PoolError::Invalid));
        assert_eq!(
            pool.parse_guest_chain(&[hsx_abi::DESC_NAME, 5, b'a']),
            Err(PoolError::Invalid)
        );
        assert_eq!(
            pool.parse_guest_chain(&[0x77, 0, DESC_END]),
            Err(PoolError::Invalid)
        );
    }
}
