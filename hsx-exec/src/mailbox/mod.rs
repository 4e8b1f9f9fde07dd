//! Mailbox subsystem.
//!
//! Namespaced, bounded queues of framed messages. Mailboxes are both the
//! IPC mechanism and the universal wake primitive: value-change
//! notifications, stdio, and command invocation frames all travel through
//! the same descriptor type.
//!
//! The registry is pure with respect to scheduling: operations that unblock
//! tasks return the PIDs to wake in a [`WakeSet`] and the caller (the SVC
//! layer / scheduler) applies the transitions. This keeps wake ordering
//! testable without a running executive.

use std::collections::{BTreeMap, VecDeque};

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use hsx_abi::{
    DEFAULT_MAILBOX_CAPACITY, MAX_DESCRIPTORS, MAX_NAME_BYTES, MBX_MODE_FANOUT_BLOCK,
    MBX_MODE_FANOUT_DROP, MBX_MODE_RDONLY, MBX_MODE_RDWR, MBX_MODE_TAP, MBX_MODE_WRONLY,
    MESSAGE_FRAMING_BYTES, Namespace, status,
};

use crate::task::Pid;

/// Per-open mailbox handle identifier.
pub type Handle = u32;

/// The executive's own PID for host-side opens.
pub const HOST_PID: Pid = 0;

/// Name of the packed mailbox trace stream.
pub const TRACE_MBX: &str = "svc:trace.mbx";

/// Mailbox operation errors. `status()` maps onto the R0 codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MbxError {
    #[error("send would exceed capacity")]
    WouldBlock,
    #[error("operation timed out")]
    Timeout,
    #[error("no message available")]
    NoData,
    #[error("invalid or foreign handle")]
    InvalidHandle,
    #[error("message larger than descriptor capacity")]
    MsgTooLarge,
    #[error("no such descriptor")]
    NoDescriptor,
    #[error("descriptor already exists with a conflicting mode")]
    Exists,
    #[error("namespace permission denied")]
    Perm,
    #[error("descriptor table full")]
    NoSpace,
    #[error("invalid name or mode")]
    Invalid,
    #[error("internal mailbox error")]
    Internal,
}

impl MbxError {
    pub fn status(self) -> u32 {
        match self {
            MbxError::WouldBlock => status::WOULDBLOCK,
            MbxError::Timeout => status::TIMEOUT,
            MbxError::NoData => status::NO_DATA,
            MbxError::InvalidHandle => status::INVALID_HANDLE,
            MbxError::MsgTooLarge => status::MSG_TOO_LARGE,
            MbxError::NoDescriptor => status::NO_DESCRIPTOR,
            MbxError::Exists => status::EEXIST,
            MbxError::Perm => status::EPERM,
            MbxError::NoSpace => status::ENOSPC,
            MbxError::Invalid => status::EINVAL,
            MbxError::Internal => status::INTERNAL_ERROR,
        }
    }
}

/// Delivery policy, derived from the descriptor's mode mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// One consumer; messages are consumed destructively; a full queue
    /// bounces the sender with WOULDBLOCK.
    Exclusive,
    /// Multiple cursor-tracked consumers; head eviction latches OVERRUN on
    /// lagging readers.
    FanoutDrop,
    /// Multiple cursor-tracked consumers; the sender blocks until every
    /// non-tap reader has advanced past the oldest slot.
    FanoutBlock,
}

impl Policy {
    fn from_mode(mode: u32) -> Result<Self, MbxError> {
        match (
            mode & MBX_MODE_FANOUT_DROP != 0,
            mode & MBX_MODE_FANOUT_BLOCK != 0,
        ) {
            (false, false) => Ok(Policy::Exclusive),
            (true, false) => Ok(Policy::FanoutDrop),
            (false, true) => Ok(Policy::FanoutBlock),
            (true, true) => Err(MbxError::Invalid),
        }
    }
}

/// A queued message frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub seq: u32,
    pub src_pid: Pid,
    pub channel: u16,
    pub flags: u16,
    pub payload: Vec<u8>,
}

impl Message {
    fn cost(&self) -> usize {
        self.payload.len() + MESSAGE_FRAMING_BYTES
    }
}

/// Info record written back to the guest on RECV.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RecvInfo {
    pub seq: u32,
    pub src_pid: u16,
    pub channel: u16,
    pub flags: u16,
    pub reserved: u16,
}

/// Packed record appended to `svc:trace.mbx` for every delivered send.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MailboxTraceRecord {
    pub timestamp_lo: u32,
    pub timestamp_hi: u16,
    pub src_pid: u16,
    pub dst_handle: u16,
    pub flags: u16,
    pub length: u16,
    pub reserved: u16,
}

/// Tasks to transition Waiting -> Ready, already ordered per the wake
/// protocol (receivers in ascending PID order, senders FIFO by block time).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WakeSet {
    pub pids: Vec<Pid>,
}

impl WakeSet {
    fn push(&mut self, pid: Pid) {
        if !self.pids.contains(&pid) {
            self.pids.push(pid);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

/// Successful send.
#[derive(Debug)]
pub enum SendOutcome {
    Sent {
        seq: u32,
        bytes: usize,
        name: String,
        wake: WakeSet,
    },
    /// Fan-out-block with a lagging reader: the caller must block and retry.
    MustBlock,
}

/// Successful receive.
#[derive(Debug, PartialEq)]
pub enum RecvOutcome {
    Message {
        msg: Message,
        /// OVERRUN was latched for this reader; reported once, then cleared.
        overrun: bool,
        name: String,
        wake: WakeSet,
    },
    /// Nothing visible to this handle; the caller decides poll vs block.
    Empty,
}

struct Subscriber {
    name: String,
    owner: Pid,
    mode: u32,
    tap: bool,
    /// Highest message seq delivered through this handle (fan-out/tap).
    last_seq: u32,
    overrun: bool,
}

impl Subscriber {
    fn is_reader(&self) -> bool {
        self.mode & MBX_MODE_RDONLY != 0
    }
}

struct Descriptor {
    namespace: Namespace,
    capacity_bytes: usize,
    mode: u32,
    policy: Policy,
    owner_pid: Pid,
    /// Next sequence number to assign; monotonic from 1.
    seq_no: u32,
    messages: VecDeque<Message>,
    queued_bytes: usize,
    /// PIDs blocked in RECV on this descriptor.
    recv_waiters: Vec<Pid>,
    /// PIDs blocked in SEND, FIFO by block time.
    send_waiters: Vec<Pid>,
}

impl Descriptor {
    fn head_seq(&self) -> Option<u32> {
        self.messages.front().map(|m| m.seq)
    }
}

/// The descriptor and handle tables.
pub struct MailboxRegistry {
    descriptors: BTreeMap<String, Descriptor>,
    handles: BTreeMap<Handle, Subscriber>,
    next_handle: Handle,
}

impl MailboxRegistry {
    /// Create the registry with the reserved stdio and trace descriptors.
    pub fn new() -> Self {
        let mut registry = Self {
            descriptors: BTreeMap::new(),
            handles: BTreeMap::new(),
            next_handle: 1,
        };
        for (name, mode) in [
            (hsx_abi::STDIO_IN, MBX_MODE_RDWR),
            (hsx_abi::STDIO_OUT, MBX_MODE_RDWR | MBX_MODE_FANOUT_DROP),
            (hsx_abi::STDIO_ERR, MBX_MODE_RDWR | MBX_MODE_FANOUT_DROP),
            (TRACE_MBX, MBX_MODE_RDWR | MBX_MODE_FANOUT_DROP),
        ] {
            registry
                .create_descriptor(HOST_PID, name, 256, mode)
                .expect("reserved descriptors are valid");
        }
        registry
    }

    fn validate_name(name: &str) -> Result<Namespace, MbxError> {
        if name.len() > MAX_NAME_BYTES {
            return Err(MbxError::Invalid);
        }
        let (ns, rest) = Namespace::parse(name).ok_or(MbxError::Invalid)?;
        if rest.is_empty() {
            return Err(MbxError::Invalid);
        }
        Ok(ns)
    }

    fn create_descriptor(
        &mut self,
        caller: Pid,
        name: &str,
        capacity: usize,
        mode: u32,
    ) -> Result<(), MbxError> {
        let namespace = Self::validate_name(name)?;
        match namespace {
            // Tasks may only bind under their own pid: prefix.
            Namespace::Pid => {
                let own = format!("pid:{caller}.");
                if caller != HOST_PID && !name.starts_with(&own) {
                    return Err(MbxError::Perm);
                }
            }
            // svc: is reserved for the executive.
            Namespace::Svc if caller != HOST_PID => return Err(MbxError::Perm),
            _ => {}
        }
        if self.descriptors.len() >= MAX_DESCRIPTORS {
            return Err(MbxError::NoSpace);
        }
        let policy = Policy::from_mode(mode)?;
        let capacity_bytes = if capacity == 0 {
            DEFAULT_MAILBOX_CAPACITY
        } else {
            capacity
        };
        self.descriptors.insert(
            name.to_string(),
            Descriptor {
                namespace,
                capacity_bytes,
                mode,
                policy,
                owner_pid: caller,
                seq_no: 1,
                messages: VecDeque::new(),
                queued_bytes: 0,
                recv_waiters: Vec::new(),
                send_waiters: Vec::new(),
            },
        );
        Ok(())
    }

    fn insert_handle(&mut self, name: &str, owner: Pid, mode: u32) -> Handle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(
            handle,
            Subscriber {
                name: name.to_string(),
                owner,
                mode,
                tap: mode & MBX_MODE_TAP != 0,
                last_seq: 0,
                overrun: false,
            },
        );
        handle
    }

    /// Readable, non-tap handles open on `name` (fan-out cursors and the
    /// exclusivity check both consult this set).
    fn readers_of(&self, name: &str) -> impl Iterator<Item = &Subscriber> {
        self.handles
            .values()
            .filter(move |s| s.name == name && s.is_reader() && !s.tap)
    }

    /// BIND: create (or re-attach to) a descriptor.
    pub fn bind(
        &mut self,
        caller: Pid,
        name: &str,
        capacity: usize,
        mode: u32,
    ) -> Result<Handle, MbxError> {
        if let Some(desc) = self.descriptors.get(name) {
            // Existing descriptor: the mode masks must agree.
            if desc.mode != mode {
                return Err(MbxError::Exists);
            }
            return self.open(caller, name, mode & (MBX_MODE_RDWR | MBX_MODE_TAP));
        }
        self.create_descriptor(caller, name, capacity, mode)?;
        // The creator's handle carries exactly the access bits it asked
        // for: a producer binding WRONLY does not occupy the consumer slot
        // and holds no fan-out cursor.
        Ok(self.insert_handle(name, caller, mode))
    }

    /// OPEN: attach a handle to an existing descriptor.
    pub fn open(&mut self, caller: Pid, name: &str, mode: u32) -> Result<Handle, MbxError> {
        Self::validate_name(name)?;
        let desc = self.descriptors.get(name).ok_or(MbxError::NoDescriptor)?;
        let policy = desc.policy;
        let wants_read = mode & MBX_MODE_RDONLY != 0;
        let is_tap = mode & MBX_MODE_TAP != 0;
        if policy == Policy::Exclusive
            && wants_read
            && !is_tap
            && self.readers_of(name).next().is_some()
        {
            // Exclusive descriptors admit one consumer.
            return Err(MbxError::Perm);
        }
        Ok(self.insert_handle(name, caller, mode))
    }

    /// Open a host-side handle (executive tooling), bypassing namespace
    /// permission checks but not exclusivity.
    pub fn open_host(&mut self, name: &str, mode: u32) -> Result<Handle, MbxError> {
        self.open(HOST_PID, name, mode)
    }

    fn subscriber(&self, caller: Pid, handle: Handle) -> Result<&Subscriber, MbxError> {
        match self.handles.get(&handle) {
            Some(s) if s.owner == caller => Ok(s),
            _ => Err(MbxError::InvalidHandle),
        }
    }

    pub fn handle_name(&self, caller: Pid, handle: Handle) -> Result<&str, MbxError> {
        Ok(&self.subscriber(caller, handle)?.name)
    }

    /// SEND through a handle.
    pub fn send(
        &mut self,
        caller: Pid,
        handle: Handle,
        payload: &[u8],
        flags: u16,
        channel: u16,
        now_ms: u64,
    ) -> Result<SendOutcome, MbxError> {
        let sub = self.subscriber(caller, handle)?;
        if sub.mode & MBX_MODE_WRONLY == 0 {
            return Err(MbxError::Perm);
        }
        let name = sub.name.clone();
        self.deliver(&name, caller, handle, payload, flags, channel, now_ms, false)
    }

    /// Deliver a frame to a named descriptor on behalf of the executive
    /// (value notifications, command frames, stdin). Never blocks: under
    /// fan-out-block pressure it falls back to drop-eviction.
    pub fn post(
        &mut self,
        name: &str,
        src_pid: Pid,
        payload: &[u8],
        flags: u16,
        channel: u16,
        now_ms: u64,
    ) -> Result<SendOutcome, MbxError> {
        self.deliver(name, src_pid, 0, payload, flags, channel, now_ms, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &mut self,
        name: &str,
        src_pid: Pid,
        dst_handle: Handle,
        payload: &[u8],
        flags: u16,
        channel: u16,
        now_ms: u64,
        force: bool,
    ) -> Result<SendOutcome, MbxError> {
        // Fan-out eviction consults reader cursors, so collect them first.
        let cursors: Vec<u32> = self.readers_of(name).map(|s| s.last_seq).collect();

        let desc = self
            .descriptors
            .get_mut(name)
            .ok_or(MbxError::NoDescriptor)?;
        let cost = payload.len() + MESSAGE_FRAMING_BYTES;
        if cost > desc.capacity_bytes {
            return Err(MbxError::MsgTooLarge);
        }

        let mut overran: Vec<u32> = Vec::new();
        while desc.queued_bytes + cost > desc.capacity_bytes {
            let head = match desc.head_seq() {
                Some(seq) => seq,
                None => return Err(MbxError::Internal),
            };
            let evictable = force
                || match desc.policy {
                    Policy::Exclusive => false,
                    Policy::FanoutDrop => true,
                    // Block policy may only evict slots every reader has seen.
                    Policy::FanoutBlock => cursors.iter().all(|&c| c >= head),
                };
            if !evictable {
                return match desc.policy {
                    Policy::Exclusive => Err(MbxError::WouldBlock),
                    _ => Ok(SendOutcome::MustBlock),
                };
            }
            let evicted = desc.messages.pop_front().expect("head exists");
            desc.queued_bytes -= evicted.cost();
            if desc.policy == Policy::FanoutDrop || force {
                overran.push(evicted.seq);
            }
        }

        let seq = desc.seq_no;
        desc.seq_no = desc.seq_no.wrapping_add(1);
        let msg = Message {
            seq,
            src_pid,
            channel,
            flags,
            payload: payload.to_vec(),
        };
        desc.queued_bytes += msg.cost();
        desc.messages.push_back(msg);

        // Wake every blocked receiver, ascending PID order.
        let mut wake = WakeSet::default();
        let mut waiters = std::mem::take(&mut desc.recv_waiters);
        waiters.sort_unstable();
        for pid in waiters {
            wake.push(pid);
        }

        // Latch OVERRUN on lagging readers that lost evicted messages.
        if let Some(&lost_max) = overran.iter().max() {
            for sub in self.handles.values_mut() {
                if sub.name == name && sub.is_reader() && !sub.tap && sub.last_seq < lost_max {
                    sub.overrun = true;
                }
            }
        }

        if name != TRACE_MBX {
            self.append_trace(src_pid, dst_handle, flags, payload.len(), now_ms);
        }

        Ok(SendOutcome::Sent {
            seq,
            bytes: payload.len(),
            name: name.to_string(),
            wake,
        })
    }

    /// Append a packed trace record to `svc:trace.mbx`, evicting silently
    /// when full.
    fn append_trace(&mut self, src_pid: Pid, dst_handle: Handle, flags: u16, len: usize, now_ms: u64) {
        let record = MailboxTraceRecord {
            timestamp_lo: now_ms as u32,
            timestamp_hi: (now_ms >> 32) as u16,
            src_pid,
            dst_handle: dst_handle as u16,
            flags,
            length: len as u16,
            reserved: 0,
        };
        let Some(desc) = self.descriptors.get_mut(TRACE_MBX) else {
            return;
        };
        let bytes = record.as_bytes();
        let cost = bytes.len() + MESSAGE_FRAMING_BYTES;
        while desc.queued_bytes + cost > desc.capacity_bytes {
            match desc.messages.pop_front() {
                Some(evicted) => desc.queued_bytes -= evicted.cost(),
                None => return,
            }
        }
        let seq = desc.seq_no;
        desc.seq_no = desc.seq_no.wrapping_add(1);
        desc.messages.push_back(Message {
            seq,
            src_pid,
            channel: 0,
            flags: 0,
            payload: bytes.to_vec(),
        });
        desc.queued_bytes += cost;
    }

    /// RECV through a handle. `max_len` bounds the payload the caller can
    /// accept; an oversized head is reported without being consumed.
    pub fn recv(
        &mut self,
        caller: Pid,
        handle: Handle,
        max_len: usize,
    ) -> Result<RecvOutcome, MbxError> {
        let sub = self.subscriber(caller, handle)?;
        if sub.mode & MBX_MODE_RDONLY == 0 {
            return Err(MbxError::Perm);
        }
        let name = sub.name.clone();
        let tap = sub.tap;
        let cursor = sub.last_seq;
        let overrun = sub.overrun;

        let policy = self
            .descriptors
            .get(&name)
            .ok_or(MbxError::NoDescriptor)?
            .policy;

        let destructive = policy == Policy::Exclusive && !tap;
        let msg = if destructive {
            let desc = self.descriptors.get_mut(&name).expect("checked above");
            match desc.messages.front() {
                Some(head) if head.payload.len() > max_len => {
                    return Err(MbxError::MsgTooLarge);
                }
                Some(_) => {
                    let msg = desc.messages.pop_front().expect("front exists");
                    desc.queued_bytes -= msg.cost();
                    msg
                }
                None => return Ok(RecvOutcome::Empty),
            }
        } else {
            let desc = self.descriptors.get(&name).expect("checked above");
            match desc.messages.iter().find(|m| m.seq > cursor) {
                Some(msg) if msg.payload.len() > max_len => {
                    return Err(MbxError::MsgTooLarge);
                }
                Some(msg) => msg.clone(),
                None => return Ok(RecvOutcome::Empty),
            }
        };

        // Commit cursor / overrun latch on the handle.
        {
            let sub = self.handles.get_mut(&handle).expect("checked above");
            sub.last_seq = sub.last_seq.max(msg.seq);
            sub.overrun = false;
        }

        let wake = self.collect_garbage(&name);
        Ok(RecvOutcome::Message {
            msg,
            overrun,
            name,
            wake,
        })
    }

    /// Drop fan-out head slots every non-tap reader has consumed, and wake
    /// one blocked sender if space was reclaimed.
    fn collect_garbage(&mut self, name: &str) -> WakeSet {
        let mut wake = WakeSet::default();
        let Some(desc) = self.descriptors.get(name) else {
            return wake;
        };
        if desc.policy == Policy::Exclusive {
            // Destructive pops already freed space; under exclusive policy
            // senders never block, so nothing to do.
            return wake;
        }
        let cursors: Vec<u32> = self.readers_of(name).map(|s| s.last_seq).collect();
        let desc = self.descriptors.get_mut(name).expect("checked above");
        let mut freed = false;
        while let Some(head) = desc.head_seq() {
            if !cursors.is_empty() && cursors.iter().all(|&c| c >= head) {
                let msg = desc.messages.pop_front().expect("head exists");
                desc.queued_bytes -= msg.cost();
                freed = true;
            } else {
                break;
            }
        }
        if freed && !desc.send_waiters.is_empty() {
            // FIFO by block time: wake the longest-blocked sender.
            wake.push(desc.send_waiters.remove(0));
        }
        wake
    }

    /// PEEK: this handle's view of the queue.
    pub fn peek(&self, caller: Pid, handle: Handle) -> Result<(u32, u32, u32), MbxError> {
        let sub = self.subscriber(caller, handle)?;
        let desc = self
            .descriptors
            .get(&sub.name)
            .ok_or(MbxError::NoDescriptor)?;
        let visible: Vec<&Message> = if desc.policy == Policy::Exclusive && !sub.tap {
            desc.messages.iter().collect()
        } else {
            desc.messages
                .iter()
                .filter(|m| m.seq > sub.last_seq)
                .collect()
        };
        let depth = visible.len() as u32;
        let bytes: usize = visible.iter().map(|m| m.payload.len()).sum();
        let head_seq = visible.first().map(|m| m.seq).unwrap_or(0);
        Ok((depth, bytes as u32, head_seq))
    }

    /// TAP: toggle non-destructive observer mode on a handle.
    pub fn tap(&mut self, caller: Pid, handle: Handle, enable: bool) -> Result<WakeSet, MbxError> {
        self.subscriber(caller, handle)?;
        let name = {
            let sub = self.handles.get_mut(&handle).expect("checked above");
            sub.tap = enable;
            sub.name.clone()
        };
        // A reader turning into a tap may unblock senders.
        Ok(self.collect_garbage(&name))
    }

    /// CLOSE a handle.
    pub fn close(&mut self, caller: Pid, handle: Handle) -> Result<WakeSet, MbxError> {
        self.subscriber(caller, handle)?;
        let sub = self.handles.remove(&handle).expect("checked above");
        Ok(self.collect_garbage(&sub.name))
    }

    /// Register a blocked receiver.
    pub fn add_recv_waiter(&mut self, caller: Pid, handle: Handle) -> Result<(), MbxError> {
        let name = self.subscriber(caller, handle)?.name.clone();
        let desc = self
            .descriptors
            .get_mut(&name)
            .ok_or(MbxError::NoDescriptor)?;
        if !desc.recv_waiters.contains(&caller) {
            desc.recv_waiters.push(caller);
        }
        Ok(())
    }

    /// Register a blocked sender (FIFO by block time).
    pub fn add_send_waiter(&mut self, caller: Pid, handle: Handle) -> Result<(), MbxError> {
        let name = self.subscriber(caller, handle)?.name.clone();
        let desc = self
            .descriptors
            .get_mut(&name)
            .ok_or(MbxError::NoDescriptor)?;
        if !desc.send_waiters.contains(&caller) {
            desc.send_waiters.push(caller);
        }
        Ok(())
    }

    /// Remove a task from every wait list (timeout expiry or kill).
    pub fn remove_waiter(&mut self, pid: Pid) {
        for desc in self.descriptors.values_mut() {
            desc.recv_waiters.retain(|&p| p != pid);
            desc.send_waiters.retain(|&p| p != pid);
        }
    }

    /// Release everything a task owned: handles, wait-list entries, and its
    /// `pid:` namespace descriptors. Returns senders unblocked by the
    /// departure of lagging readers.
    pub fn release_task(&mut self, pid: Pid) -> WakeSet {
        self.remove_waiter(pid);
        let names: Vec<String> = self
            .handles
            .values()
            .filter(|s| s.owner == pid)
            .map(|s| s.name.clone())
            .collect();
        self.handles.retain(|_, s| s.owner != pid);

        let own_prefix = format!("pid:{pid}.");
        self.descriptors
            .retain(|name, d| !(d.namespace == Namespace::Pid && name.starts_with(&own_prefix)));

        let mut wake = WakeSet::default();
        for name in names {
            for pid in self.collect_garbage(&name).pids {
                wake.push(pid);
            }
        }
        wake
    }

    /// Snapshot for `task.list`-style introspection and tests.
    pub fn descriptor_depth(&self, name: &str) -> Option<(usize, usize)> {
        self.descriptors
            .get(name)
            .map(|d| (d.messages.len(), d.queued_bytes))
    }
}

impl Default for MailboxRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent_seq(outcome: SendOutcome) -> u32 {
        match outcome {
            SendOutcome::Sent { seq, .. } => seq,
            SendOutcome::MustBlock => panic!("unexpected MustBlock"),
        }
    }

    #[test]
    fn bind_open_send_recv() {
        let mut reg = MailboxRegistry::new();
        let tx = reg.bind(1, "app:demo", 64, MBX_MODE_WRONLY).unwrap();
        let rx = reg.open(2, "app:demo", MBX_MODE_RDONLY).unwrap();

        // Producer's handle is not readable by another task.
        assert_eq!(reg.recv(2, tx, usize::MAX), Err(MbxError::InvalidHandle));

        // A second consumer on an exclusive descriptor is refused...
        assert_eq!(
            reg.open(3, "app:demo", MBX_MODE_RDONLY),
            Err(MbxError::Perm)
        );
        // ...but a tap is fine.
        reg.open(3, "app:demo", MBX_MODE_RDONLY | MBX_MODE_TAP)
            .unwrap();

        let seq = sent_seq(reg.send(1, tx, b"hello", 0, 7, 0).unwrap());
        assert_eq!(seq, 1);
        match reg.recv(2, rx, usize::MAX).unwrap() {
            RecvOutcome::Message { msg, overrun, .. } => {
                assert_eq!(msg.payload, b"hello");
                assert_eq!(msg.channel, 7);
                assert_eq!(msg.src_pid, 1);
                assert!(!overrun);
            }
            RecvOutcome::Empty => panic!("expected a message"),
        }
        assert!(matches!(reg.recv(2, rx, usize::MAX).unwrap(), RecvOutcome::Empty));
    }

    #[test]
    fn exclusive_full_queue_bounces_sender() {
        let mut reg = MailboxRegistry::new();
        let tx = reg.bind(1, "app:full", 32, MBX_MODE_RDWR).unwrap();
        // 8 payload + 8 framing = 16 per message; two fit in 32.
        assert!(reg.send(1, tx, &[0u8; 8], 0, 0, 0).is_ok());
        assert!(reg.send(1, tx, &[0u8; 8], 0, 0, 0).is_ok());
        assert_eq!(
            reg.send(1, tx, &[0u8; 8], 0, 0, 0).unwrap_err(),
            MbxError::WouldBlock
        );
        // Oversized message is distinct from a full queue.
        assert_eq!(
            reg.send(1, tx, &[0u8; 64], 0, 0, 0).unwrap_err(),
            MbxError::MsgTooLarge
        );
    }

    #[test]
    fn namespace_permissions() {
        let mut reg = MailboxRegistry::new();
        assert_eq!(
            reg.bind(3, "pid:4.inbox", 64, MBX_MODE_RDWR),
            Err(MbxError::Perm)
        );
        assert!(reg.bind(3, "pid:3.inbox", 64, MBX_MODE_RDWR).is_ok());
        assert_eq!(
            reg.bind(3, "svc:custom", 64, MBX_MODE_RDWR),
            Err(MbxError::Perm)
        );
        assert_eq!(
            reg.bind(3, "bogus:x", 64, MBX_MODE_RDWR),
            Err(MbxError::Invalid)
        );
        assert_eq!(
            reg.open(3, "app:absent", MBX_MODE_RDONLY),
            Err(MbxError::NoDescriptor)
        );
    }

    #[test]
    fn fanout_drop_latches_overrun_for_laggards() {
        let mut reg = MailboxRegistry::new();
        let mode = MBX_MODE_WRONLY | MBX_MODE_FANOUT_DROP;
        let tx = reg.bind(1, "app:fan", 16, mode).unwrap();
        let r1 = reg.open(2, "app:fan", MBX_MODE_RDONLY).unwrap();
        let r2 = reg.open(3, "app:fan", MBX_MODE_RDONLY).unwrap();

        // 8-byte payloads cost 16 each: only one fits at a time.
        for i in 0..3u8 {
            reg.send(1, tx, &[i; 8], 0, 0, 0).unwrap();
            // R1 keeps up.
            match reg.recv(2, r1, usize::MAX).unwrap() {
                RecvOutcome::Message { msg, .. } => assert_eq!(msg.payload[0], i),
                RecvOutcome::Empty => panic!("r1 should see message {i}"),
            }
        }

        // R2 never read: sends 2 and 3 evicted messages past it.
        match reg.recv(3, r2, usize::MAX).unwrap() {
            RecvOutcome::Message { msg, overrun, .. } => {
                assert!(overrun, "lagging reader must observe OVERRUN");
                assert_eq!(msg.seq, 3, "reader lands on the surviving head");
            }
            RecvOutcome::Empty => panic!("r2 should see the surviving head"),
        }
        // The latch reports once.
        assert!(matches!(reg.recv(3, r2, usize::MAX).unwrap(), RecvOutcome::Empty));
    }

    #[test]
    fn fanout_block_stalls_sender_until_catch_up() {
        let mut reg = MailboxRegistry::new();
        let mode = MBX_MODE_WRONLY | MBX_MODE_FANOUT_BLOCK;
        let tx = reg.bind(1, "app:blk", 16, mode).unwrap();
        let r1 = reg.open(2, "app:blk", MBX_MODE_RDONLY).unwrap();

        reg.send(1, tx, &[1u8; 8], 0, 0, 0).unwrap();
        // Queue is full and the reader has not consumed the head.
        assert!(matches!(
            reg.send(1, tx, &[2u8; 8], 0, 0, 0).unwrap(),
            SendOutcome::MustBlock
        ));
        reg.add_send_waiter(1, tx).unwrap();

        // Reader consumes; GC frees the slot and wakes the sender.
        let wake = match reg.recv(2, r1, usize::MAX).unwrap() {
            RecvOutcome::Message { wake, .. } => wake,
            RecvOutcome::Empty => panic!("reader should see the message"),
        };
        assert_eq!(wake.pids, vec![1]);

        // Retry now succeeds.
        assert!(matches!(
            reg.send(1, tx, &[2u8; 8], 0, 0, 0).unwrap(),
            SendOutcome::Sent { .. }
        ));
    }

    #[test]
    fn send_wakes_receivers_in_pid_order() {
        let mut reg = MailboxRegistry::new();
        let tx = reg.bind(1, "app:wake", 64, MBX_MODE_WRONLY).unwrap();
        let rx = reg.open(5, "app:wake", MBX_MODE_RDONLY).unwrap();
        // Waiters registered out of order.
        reg.add_recv_waiter(5, rx).unwrap();
        let tap = reg.open(3, "app:wake", MBX_MODE_RDONLY | MBX_MODE_TAP).unwrap();
        reg.add_recv_waiter(3, tap).unwrap();

        match reg.send(1, tx, b"x", 0, 0, 0).unwrap() {
            SendOutcome::Sent { wake, .. } => assert_eq!(wake.pids, vec![3, 5]),
            SendOutcome::MustBlock => panic!("no blocking expected"),
        }
    }

    #[test]
    fn fifo_per_subscriber_is_monotonic() {
        let mut reg = MailboxRegistry::new();
        let mode = MBX_MODE_WRONLY | MBX_MODE_FANOUT_DROP;
        let tx = reg.bind(1, "app:fifo", 256, mode).unwrap();
        let rx = reg.open(2, "app:fifo", MBX_MODE_RDONLY).unwrap();

        for i in 0..5u8 {
            reg.send(1, tx, &[i], 0, 0, 0).unwrap();
        }
        let mut seen = Vec::new();
        while let RecvOutcome::Message { msg, .. } = reg.recv(2, rx, usize::MAX).unwrap() {
            seen.push(msg.seq);
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(seen, sorted, "delivery order must be a monotonic subsequence");
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn release_task_drops_private_descriptors() {
        let mut reg = MailboxRegistry::new();
        reg.bind(3, "pid:3.inbox", 64, MBX_MODE_RDWR).unwrap();
        let shared = reg.bind(3, "shared:keep", 64, MBX_MODE_RDWR).unwrap();
        reg.release_task(3);
        assert!(reg.descriptor_depth("pid:3.inbox").is_none());
        assert!(reg.descriptor_depth("shared:keep").is_some());
        // Handles owned by the departed task are gone.
        assert_eq!(reg.peek(3, shared), Err(MbxError::InvalidHandle));
    }

    #[test]
    fn trace_stream_records_sends() {
        let mut reg = MailboxRegistry::new();
        let tx = reg.bind(1, "app:t", 64, MBX_MODE_WRONLY).unwrap();
        let trace = reg.open_host(TRACE_MBX, MBX_MODE_RDONLY).unwrap();
        reg.send(1, tx, b"abc", FRAME_FLAGS_TEST, 0, 0x1_0000_0001).unwrap();

        match reg.recv(HOST_PID, trace, usize::MAX).unwrap() {
            RecvOutcome::Message { msg, .. } => {
                let record = MailboxTraceRecord::read_from_bytes(&msg.payload).unwrap();
                assert_eq!(record.src_pid, 1);
                assert_eq!(record.length, 3);
                assert_eq!(record.flags, FRAME_FLAGS_TEST);
                assert_eq!(record.timestamp_lo, 1);
                assert_eq!(record.timestamp_hi, 1);
            }
            RecvOutcome::Empty => panic!("expected a trace record"),
        }
    }

    const FRAME_FLAGS_TEST: u16 = hsx_abi::FRAME_OOB;
}
