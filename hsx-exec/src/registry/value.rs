//! Value registry operations.
//!
//! Values are f16-typed runtime state addressed by OID. Writes honor the
//! Unit descriptor's epsilon/rate parameters to suppress no-op change
//! events, fan change notifications out to subscribed mailboxes, and drive
//! debounced persistence.

use thiserror::Error;

use hsx_abi::{ENTRY_BOOL, ENTRY_PERSIST, ENTRY_RO, MAX_VALUES, PERSIST_LOAD_SAVE, f16, status};

use crate::mailbox::HOST_PID;
use crate::task::Pid;

use super::pool::{DescNode, NO_NODE, PoolError};
use super::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValError {
    #[error("no such value")]
    NoEnt,
    #[error("value is read-only or auth level insufficient")]
    Perm,
    #[error("value table full")]
    NoSpace,
    #[error("invalid argument")]
    Invalid,
    #[error("value already registered")]
    Exists,
    #[error("value busy")]
    Busy,
}

impl ValError {
    pub fn status(self) -> u32 {
        match self {
            ValError::NoEnt => status::ENOENT,
            ValError::Perm => status::EPERM,
            ValError::NoSpace => status::ENOSPC,
            ValError::Invalid => status::EINVAL,
            ValError::Exists => status::EEXIST,
            ValError::Busy => status::EBUSY,
        }
    }
}

impl From<PoolError> for ValError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::NoSpace => ValError::NoSpace,
            PoolError::Invalid => ValError::Invalid,
        }
    }
}

/// One registered value. Mirrors the packed 10-byte entry layout.
pub struct ValueEntry {
    pub group: u8,
    pub id: u8,
    pub flags: u8,
    pub auth_level: u8,
    pub owner_pid: Pid,
    pub last_f16: u16,
    pub desc_head: u16,
    /// Persistence mode (`PERSIST_VOLATILE` / `LOAD` / `LOAD_SAVE`).
    pub persist_mode: u32,
    pub(crate) last_change_ms: Option<u64>,
    pub(crate) last_persist_ms: Option<u64>,
    pub(crate) dirty: bool,
}

/// Result of an accepted or suppressed `VAL_SET`.
#[derive(Debug, Default)]
pub struct SetOutcome {
    /// False when epsilon/rate suppression swallowed the write.
    pub accepted: bool,
    /// Normalised bits actually stored (BOOL values are canonicalised).
    pub bits: u16,
    /// Mailbox descriptor names owed an `(oid, f16)` notification frame.
    pub notify: Vec<String>,
    /// Persistence record due now: `(key, payload)`.
    pub persist: Option<(u16, Vec<u8>)>,
}

impl Registry {
    /// `VAL_REGISTER`.
    pub fn val_register(
        &mut self,
        caller: Pid,
        oid: u16,
        flags: u8,
        desc_head: u16,
    ) -> Result<u16, ValError> {
        if self.values.contains_key(&oid) {
            return Err(ValError::Exists);
        }
        if self.values.len() >= MAX_VALUES {
            return Err(ValError::NoSpace);
        }
        let default = self
            .pool
            .find(desc_head, |n| match n {
                DescNode::Range { default, .. } => Some(*default),
                _ => None,
            })
            .unwrap_or(0);
        let persist_mode = if flags & ENTRY_PERSIST != 0 {
            PERSIST_LOAD_SAVE
        } else {
            hsx_abi::PERSIST_VOLATILE
        };
        self.values.insert(
            oid,
            ValueEntry {
                group: (oid >> 8) as u8,
                id: oid as u8,
                flags,
                auth_level: 0,
                owner_pid: caller,
                last_f16: default,
                desc_head,
                persist_mode,
                last_change_ms: None,
                last_persist_ms: None,
                dirty: false,
            },
        );
        if let Some(name) = self.value_name(oid) {
            self.value_names.insert(name, oid);
        }
        Ok(oid)
    }

    /// `VAL_LOOKUP` by Name descriptor text.
    pub fn val_lookup(&self, name: &str) -> Option<u16> {
        self.value_names.get(name).copied()
    }

    /// `VAL_GET`.
    pub fn val_get(&self, oid: u16) -> Result<u16, ValError> {
        self.values
            .get(&oid)
            .map(|e| e.last_f16)
            .ok_or(ValError::NoEnt)
    }

    /// `VAL_SET`.
    pub fn val_set(
        &mut self,
        caller: Pid,
        oid: u16,
        bits: u16,
        now_ms: u64,
    ) -> Result<SetOutcome, ValError> {
        let (epsilon, rate_ms) = self.unit_params(oid);
        let persist_key = self.persist_key(oid);
        let entry = self.values.get_mut(&oid).ok_or(ValError::NoEnt)?;

        if entry.flags & ENTRY_RO != 0 && caller != entry.owner_pid && caller != HOST_PID {
            return Err(ValError::Perm);
        }
        if entry.auth_level > 0 && caller != entry.owner_pid && caller != HOST_PID {
            return Err(ValError::Perm);
        }

        let bits = if entry.flags & ENTRY_BOOL != 0 {
            if bits != 0 { f16::F16_ONE } else { 0 }
        } else {
            bits
        };

        // Suppression: identical bits are always a no-op; sub-epsilon
        // changes are swallowed while inside the rate window.
        let suppressed = if bits == entry.last_f16 {
            true
        } else if !f16::differs_by(bits, entry.last_f16, epsilon) {
            rate_ms > 0
                && entry
                    .last_change_ms
                    .is_some_and(|t| now_ms < t + rate_ms as u64)
        } else {
            false
        };
        if suppressed {
            return Ok(SetOutcome {
                accepted: false,
                bits,
                ..Default::default()
            });
        }

        entry.last_f16 = bits;
        entry.last_change_ms = Some(now_ms);

        let persist = if entry.persist_mode == PERSIST_LOAD_SAVE {
            if let Some(key) = persist_key {
                let debounced = entry
                    .last_persist_ms
                    .is_some_and(|t| now_ms < t + rate_ms as u64);
                if debounced {
                    entry.dirty = true;
                    None
                } else {
                    entry.last_persist_ms = Some(now_ms);
                    entry.dirty = false;
                    Some((key, bits.to_le_bytes().to_vec()))
                }
            } else {
                None
            }
        } else {
            None
        };

        Ok(SetOutcome {
            accepted: true,
            bits,
            notify: self.value_subs.get(&oid).cloned().unwrap_or_default(),
            persist,
        })
    }

    /// `VAL_LIST`: snapshot up to `max` OIDs, `0xFF` selecting every group.
    pub fn val_list(&self, group_filter: u32, max: usize) -> Vec<u16> {
        self.values
            .keys()
            .filter(|&&oid| group_filter == hsx_abi::VAL_GROUP_ALL || (oid >> 8) as u32 == group_filter)
            .take(max)
            .copied()
            .collect()
    }

    /// `VAL_SUB`: bind a change-notification stream to a mailbox descriptor.
    pub fn val_subscribe(&mut self, oid: u16, mailbox: String) -> Result<(), ValError> {
        if !self.values.contains_key(&oid) {
            return Err(ValError::NoEnt);
        }
        let subs = self.value_subs.entry(oid).or_default();
        if !subs.contains(&mailbox) {
            subs.push(mailbox);
        }
        Ok(())
    }

    /// `VAL_PERSIST`: select volatile / load / load+save.
    pub fn val_persist(&mut self, oid: u16, mode: u32) -> Result<(), ValError> {
        if mode > PERSIST_LOAD_SAVE {
            return Err(ValError::Invalid);
        }
        let entry = self.values.get_mut(&oid).ok_or(ValError::NoEnt)?;
        entry.persist_mode = mode;
        Ok(())
    }

    pub fn value(&self, oid: u16) -> Option<&ValueEntry> {
        self.values.get(&oid)
    }

    /// Epsilon and rate-limit parameters from the Unit descriptor.
    pub fn unit_params(&self, oid: u16) -> (u16, u16) {
        let head = self
            .values
            .get(&oid)
            .map(|e| e.desc_head)
            .unwrap_or(NO_NODE);
        self.pool
            .find(head, |n| match n {
                DescNode::Unit {
                    epsilon, rate_ms, ..
                } => Some((*epsilon, *rate_ms)),
                _ => None,
            })
            .unwrap_or((0, 0))
    }

    /// Persistence key `(ns_id << 8) | key_id` from the Persist descriptor.
    pub fn persist_key(&self, oid: u16) -> Option<u16> {
        let head = self.values.get(&oid)?.desc_head;
        self.pool.find(head, |n| match n {
            DescNode::Persist { ns_id, key_id, .. } => {
                Some(((*ns_id as u16) << 8) | *key_id as u16)
            }
            _ => None,
        })
    }

    /// The Name descriptor text for an OID.
    pub fn value_name(&self, oid: u16) -> Option<String> {
        let head = self.values.get(&oid)?.desc_head;
        self.pool
            .find(head, |n| match n {
                DescNode::Name(r) => Some(*r),
                _ => None,
            })
            .map(|r| self.pool.strings.get(r).to_string())
    }

    /// Debounced saves that have come due: `(key, payload)` pairs.
    pub fn flush_dirty(&mut self, now_ms: u64) -> Vec<(u16, Vec<u8>)> {
        let mut due = Vec::new();
        let oids: Vec<u16> = self
            .values
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(&oid, _)| oid)
            .collect();
        for oid in oids {
            let (_, rate_ms) = self.unit_params(oid);
            let Some(key) = self.persist_key(oid) else {
                continue;
            };
            let entry = self.values.get_mut(&oid).expect("oid from iteration");
            let ready = entry
                .last_persist_ms
                .is_none_or(|t| now_ms >= t + rate_ms as u64);
            if ready {
                entry.dirty = false;
                entry.last_persist_ms = Some(now_ms);
                due.push((key, entry.last_f16.to_le_bytes().to_vec()));
            }
        }
        due
    }

    /// Hydrate `PERSIST` entries from stored records. Returns the keys whose
    /// records failed CRC validation (callers emit `persist_crc` warnings).
    pub fn hydrate(&mut self, store: &mut dyn crate::persist::PersistentStore) -> Vec<u16> {
        let mut bad = Vec::new();
        let oids: Vec<u16> = self.values.keys().copied().collect();
        for oid in oids {
            let entry = self.values.get(&oid).expect("oid from iteration");
            if entry.persist_mode == hsx_abi::PERSIST_VOLATILE {
                continue;
            }
            let Some(key) = self.persist_key(oid) else {
                continue;
            };
            let Some(record) = store.load(key) else {
                continue;
            };
            match crate::persist::decode_record(&record) {
                Some(payload) if payload.len() >= 2 => {
                    let bits = u16::from_le_bytes([payload[0], payload[1]]);
                    self.values.get_mut(&oid).expect("oid exists").last_f16 = bits;
                }
                _ => bad.push(key),
            }
        }
        bad
    }
}
