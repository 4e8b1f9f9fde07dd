//! Persistence collaborator interface.
//!
//! The core never talks to storage directly; it goes through
//! [`PersistentStore`] with 16-bit keys `(ns_id << 8) | key_id`. Records are
//! framed as `{len: u8, crc32: u32 LE, payload}` so corruption is detected on
//! load. The in-memory store backs tests and hosts without a medium.

use std::collections::BTreeMap;

/// Keyed byte store injected into the executive.
pub trait PersistentStore: Send {
    fn load(&mut self, key: u16) -> Option<Vec<u8>>;
    fn save(&mut self, key: u16, record: &[u8]);
}

/// Frame a payload for storage.
pub fn encode_record(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(payload.len() as u8);
    out.extend_from_slice(&hsx_image::crc32(payload).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validate a stored record, returning the payload when intact.
pub fn decode_record(record: &[u8]) -> Option<&[u8]> {
    let len = *record.first()? as usize;
    let crc = u32::from_le_bytes(record.get(1..5)?.try_into().ok()?);
    let payload = record.get(5..5 + len)?;
    if record.len() != 5 + len {
        return None;
    }
    if hsx_image::crc32(payload) != crc {
        return None;
    }
    Some(payload)
}

/// Volatile in-memory store.
#[derive(Default)]
pub struct MemStore {
    records: BTreeMap<u16, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert raw bytes without framing, for corrupting records in tests.
    pub fn insert_raw(&mut self, key: u16, record: Vec<u8>) {
        self.records.insert(key, record);
    }

    pub fn get_raw(&self, key: u16) -> Option<&Vec<u8>> {
        self.records.get(&key)
    }
}

impl PersistentStore for MemStore {
    fn load(&mut self, key: u16) -> Option<Vec<u8>> {
        self.records.get(&key).cloned()
    }

    fn save(&mut self, key: u16, record: &[u8]) {
        self.records.insert(key, record.to_vec());
    }
}
