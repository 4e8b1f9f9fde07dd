//! Structured debug events.
//!
//! Everything the executive observes — retired instructions, task state
//! transitions, mailbox traffic, value changes, back-pressure — is described
//! by one envelope shape and routed to session subscriptions.

use serde_derive::{Deserialize, Serialize};

use crate::task::Pid;

/// Event categories. Serialised as snake_case strings on the wire and in
/// subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TraceStep,
    DebugBreak,
    Scheduler,
    TaskState,
    MailboxSend,
    MailboxRecv,
    MailboxWait,
    MailboxWake,
    MailboxTimeout,
    MailboxError,
    WatchUpdate,
    Stdout,
    Stderr,
    Warning,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::TraceStep => "trace_step",
            EventKind::DebugBreak => "debug_break",
            EventKind::Scheduler => "scheduler",
            EventKind::TaskState => "task_state",
            EventKind::MailboxSend => "mailbox_send",
            EventKind::MailboxRecv => "mailbox_recv",
            EventKind::MailboxWait => "mailbox_wait",
            EventKind::MailboxWake => "mailbox_wake",
            EventKind::MailboxTimeout => "mailbox_timeout",
            EventKind::MailboxError => "mailbox_error",
            EventKind::WatchUpdate => "watch_update",
            EventKind::Stdout => "stdout",
            EventKind::Stderr => "stderr",
            EventKind::Warning => "warning",
        }
    }
}

/// One event before it is assigned a per-session sequence number.
///
/// `ts` is seconds since executive boot; it is stamped centrally when the
/// event enters the streamer, so producers leave it at zero.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub ts: f64,
    pub pid: Option<Pid>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, pid: Option<Pid>, data: serde_json::Value) -> Self {
        Self {
            kind,
            ts: 0.0,
            pid,
            data,
        }
    }

    /// A `warning` event with the conventional `reason` field.
    pub fn warning(pid: Option<Pid>, reason: &str, mut data: serde_json::Value) -> Self {
        if let Some(map) = data.as_object_mut() {
            map.insert("reason".into(), reason.into());
        }
        Self::new(EventKind::Warning, pid, data)
    }
}
