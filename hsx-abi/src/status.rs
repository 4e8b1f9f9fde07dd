//! SVC status codes.
//!
//! Every SVC returns a status in R0. `OK` is zero; nonzero codes are grouped
//! into a common set shared by the registries and a mailbox-specific set.

/// Success.
pub const OK: u32 = 0;

// Common codes (value and command registries, OPEN/BIND lookups).
pub const ENOENT: u32 = 0x01;
pub const EPERM: u32 = 0x02;
pub const ENOSPC: u32 = 0x03;
pub const EINVAL: u32 = 0x04;
pub const EEXIST: u32 = 0x05;
pub const EBUSY: u32 = 0x06;
pub const ENOSYS: u32 = 0x07;
pub const EFAIL: u32 = 0x08;
/// Command does not support asynchronous completion.
pub const ENOASYNC: u32 = 0x09;

// Mailbox codes.
pub const WOULDBLOCK: u32 = 0x10;
pub const TIMEOUT: u32 = 0x11;
pub const NO_DATA: u32 = 0x12;
pub const INVALID_HANDLE: u32 = 0x13;
pub const MSG_TOO_LARGE: u32 = 0x14;
pub const NO_DESCRIPTOR: u32 = 0x15;
pub const INTERNAL_ERROR: u32 = 0x16;

/// Human-readable name for a status code, for logs and debug events.
pub const fn name(code: u32) -> &'static str {
    match code {
        OK => "OK",
        ENOENT => "ENOENT",
        EPERM => "EPERM",
        ENOSPC => "ENOSPC",
        EINVAL => "EINVAL",
        EEXIST => "EEXIST",
        EBUSY => "EBUSY",
        ENOSYS => "ENOSYS",
        EFAIL => "EFAIL",
        ENOASYNC => "ENOASYNC",
        WOULDBLOCK => "WOULDBLOCK",
        TIMEOUT => "TIMEOUT",
        NO_DATA => "NO_DATA",
        INVALID_HANDLE => "INVALID_HANDLE",
        MSG_TOO_LARGE => "MSG_TOO_LARGE",
        NO_DESCRIPTOR => "NO_DESCRIPTOR",
        INTERNAL_ERROR => "INTERNAL_ERROR",
        _ => "UNKNOWN",
    }
}
