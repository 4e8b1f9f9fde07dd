//! Shared ABI definitions between the HSX executive and guest images.
//!
//! This crate contains SVC module and function numbers, status codes, the
//! instruction encoding, mailbox modes, value/command flags, and resource
//! ceilings that both the executive and guest-side tooling need to agree on.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

pub mod f16;
pub mod isa;
pub mod status;

// =============================================================================
// SVC modules
// =============================================================================

/// Mailbox operations.
pub const MODULE_MBX: u8 = 0x05;
/// Executive-core operations (version, sleep, yield, exit).
pub const MODULE_EXEC: u8 = 0x06;
/// Value registry operations.
pub const MODULE_VAL: u8 = 0x07;
/// Command registry operations.
pub const MODULE_CMD: u8 = 0x08;
/// First HAL module bank (UART). Banks run through [`MODULE_HAL_LAST`].
pub const MODULE_HAL_FIRST: u8 = 0x10;
/// Last HAL module bank.
pub const MODULE_HAL_LAST: u8 = 0x17;

/// Pack a `(module, function)` pair into an SVC immediate.
#[inline]
pub const fn svc_imm(module: u8, function: u8) -> u16 {
    ((module as u16) << 8) | function as u16
}

/// Split an SVC immediate into its `(module, function)` pair.
#[inline]
pub const fn svc_split(imm: u16) -> (u8, u8) {
    ((imm >> 8) as u8, imm as u8)
}

// =============================================================================
// Mailbox functions (module 0x05)
// =============================================================================

/// Open an existing descriptor: (name_ptr, name_len, mode) -> handle in R1.
pub const MBX_OPEN: u8 = 0x01;
/// Create a descriptor: (name_ptr, name_len, capacity, mode) -> handle in R1.
pub const MBX_BIND: u8 = 0x02;
/// Send a message: (handle, buf, len, flags|channel<<16) -> bytes in R1.
pub const MBX_SEND: u8 = 0x03;
/// Receive a message: (handle, buf, maxlen, timeout_ms, info_ptr) -> len in R1.
pub const MBX_RECV: u8 = 0x04;
/// Inspect queue state: (handle) -> depth in R1, bytes in R2, head seq in R3.
pub const MBX_PEEK: u8 = 0x05;
/// Toggle tap mode on a handle: (handle, enable).
pub const MBX_TAP: u8 = 0x06;
/// Close a handle: (handle).
pub const MBX_CLOSE: u8 = 0x07;

// =============================================================================
// Executive functions (module 0x06)
// =============================================================================

/// Query the executive version: () -> (major<<16)|minor in R1.
pub const EXEC_GET_VERSION: u8 = 0x01;
/// Terminate the calling task: (exit_code) -> !.
pub const EXEC_EXIT: u8 = 0x02;
/// Sleep for a duration: (ms).
pub const EXEC_SLEEP_MS: u8 = 0x03;
/// Give up the rest of the current rotation: ().
pub const EXEC_YIELD: u8 = 0x04;
/// Count of open control sessions: () -> count in R1.
pub const EXEC_SESSION_COUNT: u8 = 0x05;

/// Executive version reported by `EXEC_GET_VERSION`.
pub const EXEC_VERSION_MAJOR: u16 = 1;
pub const EXEC_VERSION_MINOR: u16 = 0;

// =============================================================================
// Value registry functions (module 0x07)
// =============================================================================

/// Register a value: ((group<<8)|id, flags, desc_ptr) -> OID in R1.
pub const VAL_REGISTER: u8 = 0x01;
/// Find an OID by name: (name_ptr, name_len) -> OID in R1.
pub const VAL_LOOKUP: u8 = 0x02;
/// Read a value: (oid) -> f16 bits in R1.
pub const VAL_GET: u8 = 0x03;
/// Write a value: (oid, f16 bits, flags).
pub const VAL_SET: u8 = 0x04;
/// Snapshot OIDs: (group_filter, out_ptr, max) -> count in R1.
pub const VAL_LIST: u8 = 0x05;
/// Subscribe a mailbox to change events: (oid, mbox_handle, flags).
pub const VAL_SUB: u8 = 0x06;
/// Select persistence mode: (oid, mode).
pub const VAL_PERSIST: u8 = 0x07;

/// `VAL_LIST` group filter that selects every group.
pub const VAL_GROUP_ALL: u32 = 0xFF;

// =============================================================================
// Command registry functions (module 0x08)
// =============================================================================

/// Register a command: ((group<<8)|id, flags, desc_ptr) -> OID in R1.
pub const CMD_REGISTER: u8 = 0x01;
/// Find an OID by name: (name_ptr, name_len) -> OID in R1.
pub const CMD_LOOKUP: u8 = 0x02;
/// Invoke a command: (oid, auth_token) -> rc in R1.
pub const CMD_CALL: u8 = 0x03;
/// Invoke with completion frame: (oid, auth_token, mbox_handle).
pub const CMD_CALL_ASYNC: u8 = 0x04;
/// Copy the help/name text: (oid, buf, maxlen) -> bytes in R1.
pub const CMD_HELP: u8 = 0x05;

// =============================================================================
// Mailbox modes, flags, and namespaces
// =============================================================================

/// Handle may receive.
pub const MBX_MODE_RDONLY: u32 = 0x01;
/// Handle may send.
pub const MBX_MODE_WRONLY: u32 = 0x02;
/// Handle may send and receive.
pub const MBX_MODE_RDWR: u32 = 0x03;
/// Fan-out delivery; head eviction latches OVERRUN on lagging readers.
pub const MBX_MODE_FANOUT_DROP: u32 = 0x10;
/// Fan-out delivery; senders block while any reader lags past eviction.
pub const MBX_MODE_FANOUT_BLOCK: u32 = 0x20;
/// Non-destructive observer; never blocks senders.
pub const MBX_MODE_TAP: u32 = 0x40;

/// Message frame flags.
pub const FRAME_STDOUT: u16 = 0x01;
pub const FRAME_STDERR: u16 = 0x02;
pub const FRAME_OOB: u16 = 0x04;
/// Set in the RECV info record when messages were evicted past this reader.
pub const FRAME_OVERRUN: u16 = 0x08;

/// Mailbox namespace tags.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Namespace {
    /// Per-task private namespace, `pid:` prefix.
    Pid = 1,
    /// Executive services, `svc:` prefix.
    Svc = 2,
    /// Application-defined, `app:` prefix.
    App = 3,
    /// Cross-application shared, `shared:` prefix.
    Shared = 4,
}

impl Namespace {
    /// The textual prefix including the trailing colon.
    pub const fn prefix(self) -> &'static str {
        match self {
            Namespace::Pid => "pid:",
            Namespace::Svc => "svc:",
            Namespace::App => "app:",
            Namespace::Shared => "shared:",
        }
    }

    /// Parse the namespace tag off a qualified name.
    /// Returns the namespace and the remainder after the prefix.
    pub fn parse(qualified: &str) -> Option<(Self, &str)> {
        for ns in [
            Namespace::Pid,
            Namespace::Svc,
            Namespace::App,
            Namespace::Shared,
        ] {
            if let Some(rest) = qualified.strip_prefix(ns.prefix()) {
                return Some((ns, rest));
            }
        }
        None
    }
}

/// Reserved stdio descriptor names, created by the executive at boot.
pub const STDIO_IN: &str = "svc:stdio.in";
pub const STDIO_OUT: &str = "svc:stdio.out";
pub const STDIO_ERR: &str = "svc:stdio.err";

/// Timeout value meaning "poll, never block".
pub const TIMEOUT_POLL: u32 = 0;
/// Timeout value meaning "block forever".
pub const TIMEOUT_INFINITE: u32 = 0xFFFF;

// =============================================================================
// Value / command entry flags
// =============================================================================

/// Entry is read-only for tasks other than the owner.
pub const ENTRY_RO: u8 = 0x01;
/// Entry participates in persistence (load on boot, save on change).
pub const ENTRY_PERSIST: u8 = 0x02;
/// Entry survives owner task exit.
pub const ENTRY_STICKY: u8 = 0x04;
/// Mutation/invocation requires the auth token registered with the entry.
pub const ENTRY_PIN: u8 = 0x08;
/// Value is boolean; writes normalise nonzero to f16(1.0).
pub const ENTRY_BOOL: u8 = 0x10;
/// Command handler completes out-of-line (commands only).
pub const ENTRY_ASYNC: u8 = 0x20;

/// Persistence modes for `VAL_PERSIST`.
pub const PERSIST_VOLATILE: u32 = 0;
pub const PERSIST_LOAD: u32 = 1;
pub const PERSIST_LOAD_SAVE: u32 = 2;

/// Descriptor chain node kinds (guest memory, `{kind: u8, len: u8, payload}`
/// nodes terminated by kind 0).
pub const DESC_END: u8 = 0;
pub const DESC_GROUP: u8 = 1;
pub const DESC_NAME: u8 = 2;
/// Payload: epsilon f16 bits (u16 LE), rate_ms (u16 LE), unit string.
pub const DESC_UNIT: u8 = 3;
/// Payload: min, max, default (three u16 LE f16 bit patterns).
pub const DESC_RANGE: u8 = 4;
/// Payload: ns_id (u8), key_id (u8), mode (u8).
pub const DESC_PERSIST: u8 = 5;

/// Compose an OID from group and id.
#[inline]
pub const fn oid(group: u8, id: u8) -> u16 {
    ((group as u16) << 8) | id as u16
}

// =============================================================================
// Resource ceilings
// =============================================================================

/// Maximum number of concurrently loaded tasks. PID 0 is the executive.
pub const MAX_TASKS: usize = 16;
/// Maximum number of mailbox descriptors.
pub const MAX_DESCRIPTORS: usize = 64;
/// Default mailbox capacity in bytes when BIND passes 0.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;
/// Framing overhead charged per queued message.
pub const MESSAGE_FRAMING_BYTES: usize = 8;
/// Maximum registered values.
pub const MAX_VALUES: usize = 256;
/// Maximum registered commands.
pub const MAX_COMMANDS: usize = 256;
/// Registry string table size in bytes.
pub const STRING_TABLE_BYTES: usize = 4096;
/// Default per-task stack in bytes.
pub const DEFAULT_STACK_BYTES: usize = 1536;
/// Smallest permitted per-subscription event queue.
pub const MIN_EVENT_QUEUE: usize = 64;
/// Maximum qualified mailbox name length in bytes, prefix included.
pub const MAX_NAME_BYTES: usize = 32;
/// Default arena size in bytes.
pub const DEFAULT_ARENA_BYTES: usize = 256 * 1024;
