//! Value and command registries.
//!
//! Compact OID-addressed state and parameterless actions. Both registries
//! share one descriptor pool and string table; entries carry an f16 payload
//! (values) or a handler binding (commands).

mod command;
mod pool;
mod value;

pub use command::{CallOutcome, CmdError, CmdHandler};
pub use pool::{DescNode, DescPool, NO_NODE, PoolError, StrRef};
pub use value::{SetOutcome, ValError, ValueEntry};

use std::collections::BTreeMap;

use crate::task::Pid;

use command::CommandEntry;

/// Both registries plus their shared descriptor pool.
pub struct Registry {
    pub(crate) pool: DescPool,
    pub(crate) values: BTreeMap<u16, ValueEntry>,
    pub(crate) value_names: BTreeMap<String, u16>,
    /// OID -> subscribed mailbox descriptor names.
    pub(crate) value_subs: BTreeMap<u16, Vec<String>>,
    pub(crate) commands: BTreeMap<u16, CommandEntry>,
    pub(crate) command_names: BTreeMap<String, u16>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            pool: DescPool::new(),
            values: BTreeMap::new(),
            value_names: BTreeMap::new(),
            value_subs: BTreeMap::new(),
            commands: BTreeMap::new(),
            command_names: BTreeMap::new(),
        }
    }

    /// Parse a guest descriptor chain into the shared pool.
    pub fn parse_guest_chain(&mut self, bytes: &[u8]) -> Result<u16, PoolError> {
        self.pool.parse_guest_chain(bytes)
    }

    /// Build a host-side descriptor chain.
    pub fn build_chain(&mut self, nodes: &[DescNode]) -> Result<u16, PoolError> {
        self.pool.append_chain(nodes)
    }

    /// Intern a string for host-side chain construction.
    pub fn intern(&mut self, s: &str) -> Result<StrRef, PoolError> {
        self.pool.strings.intern(s)
    }

    /// Remove non-sticky entries owned by a departed task.
    pub fn release_task(&mut self, pid: Pid) {
        let keep = |flags: u8, owner: Pid| owner != pid || flags & hsx_abi::ENTRY_STICKY != 0;
        let dropped_values: Vec<u16> = self
            .values
            .iter()
            .filter(|(_, e)| !keep(e.flags, e.owner_pid))
            .map(|(&oid, _)| oid)
            .collect();
        for oid in dropped_values {
            self.values.remove(&oid);
            self.value_subs.remove(&oid);
            self.value_names.retain(|_, &mut o| o != oid);
        }
        let dropped_commands: Vec<u16> = self
            .commands
            .iter()
            .filter(|(_, e)| !keep(e.flags, e.owner_pid))
            .map(|(&oid, _)| oid)
            .collect();
        for oid in dropped_commands {
            self.commands.remove(&oid);
            self.command_names.retain(|_, &mut o| o != oid);
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
