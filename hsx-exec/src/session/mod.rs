//! Sessions, subscriptions, and the event streamer.
//!
//! Each control client opens a session holding optional exclusive PID locks
//! and any number of event subscriptions. A subscription is a filter plus a
//! bounded [`SeqRing`]: the executive (sole producer) routes events into the
//! rings; each connection's writer thread (sole consumer) drains them.
//! Back-pressure never blocks the executive — full rings evict from the
//! head and the loss is surfaced in-band as a `slow_consumer` warning.

use std::collections::{BTreeMap, BTreeSet};

use crossbeam_channel::Sender;
use log::{debug, info};
use seq_ring::SeqRing;
use serde_json::{Value, json};

use hsx_abi::MIN_EVENT_QUEUE;

use crate::event::{Event, EventKind};
use crate::proto::{self, RpcError};
use crate::task::Pid;

pub type SessionId = u32;
pub type SubId = u32;

/// A filter plus bounded queue plus ACK cursor.
pub struct Subscription {
    pub id: SubId,
    kinds: Option<BTreeSet<EventKind>>,
    pids: Option<BTreeSet<Pid>>,
    queue: SeqRing<Event>,
    pub last_delivered: u64,
    pub last_acked: u64,
    /// The next delivery gap came from a resume, not ring eviction.
    resumed: bool,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(pids) = &self.pids {
            match event.pid {
                Some(pid) if pids.contains(&pid) => {}
                _ => return false,
            }
        }
        true
    }
}

/// One control client's context.
pub struct Session {
    pub id: SessionId,
    pub peer: String,
    pub capabilities: Vec<String>,
    pub pid_locks: BTreeSet<Pid>,
    pub keepalive_deadline: u64,
    pub connected: bool,
    /// Opened without requesting locks; may subscribe but not mutate.
    pub observer: bool,
    pub warnings: Vec<String>,
    next_seq: u64,
    pub subs: BTreeMap<SubId, Subscription>,
    notify: Option<Sender<()>>,
}

impl Session {
    pub fn is_observer(&self) -> bool {
        self.observer
    }
}

/// Handshake result for `session.open`.
#[derive(Debug, Clone)]
pub struct OpenInfo {
    pub id: SessionId,
    pub heartbeat_ms: u64,
    pub max_events_per_sub: usize,
    pub granted_locks: Vec<Pid>,
    pub warnings: Vec<String>,
}

/// Owns every session. Shared (behind a spinlock) between the executive
/// thread (producer) and endpoint writer threads (consumers).
pub struct SessionManager {
    sessions: BTreeMap<SessionId, Session>,
    next_session: SessionId,
    next_sub: SubId,
    pub heartbeat_ms: u64,
    pub max_events_per_sub: usize,
}

impl SessionManager {
    pub fn new(heartbeat_ms: u64, max_events_per_sub: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_session: 1,
            next_sub: 1,
            heartbeat_ms,
            max_events_per_sub: max_events_per_sub.max(MIN_EVENT_QUEUE),
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Which session holds the exclusive lock on `pid`, if any.
    pub fn holder_of(&self, pid: Pid) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.pid_locks.contains(&pid))
            .map(|s| s.id)
    }

    /// Open a new session. `want_locks` must already be validated against
    /// the task table; `warnings` carries notes about requests that could
    /// not be honored.
    pub fn open(
        &mut self,
        peer: String,
        capabilities: Vec<String>,
        want_locks: Vec<Pid>,
        observer: bool,
        warnings: Vec<String>,
        notify: Option<Sender<()>>,
        now_ms: u64,
    ) -> Result<OpenInfo, RpcError> {
        for &pid in &want_locks {
            if let Some(holder) = self.holder_of(pid) {
                return Err(RpcError::new(
                    proto::PID_LOCKED,
                    format!("pid {pid} is locked by session {holder}"),
                )
                .with_details(json!({ "pid": pid, "holder": holder })));
            }
        }
        let id = self.next_session;
        self.next_session += 1;
        let session = Session {
            id,
            peer,
            capabilities,
            pid_locks: want_locks.iter().copied().collect(),
            keepalive_deadline: now_ms + self.heartbeat_ms,
            connected: true,
            observer,
            warnings: warnings.clone(),
            next_seq: 1,
            subs: BTreeMap::new(),
            notify,
        };
        info!("session {id} opened, locks {want_locks:?}");
        self.sessions.insert(id, session);
        Ok(OpenInfo {
            id,
            heartbeat_ms: self.heartbeat_ms,
            max_events_per_sub: self.max_events_per_sub,
            granted_locks: want_locks,
            warnings,
        })
    }

    /// Reattach to a surviving session after a disconnect. Buffered events
    /// newer than `since_seq` will be replayed; older ones are reported
    /// missing at delivery time.
    pub fn resume(
        &mut self,
        id: SessionId,
        since_seq: u64,
        peer: String,
        notify: Option<Sender<()>>,
        now_ms: u64,
    ) -> Result<OpenInfo, RpcError> {
        let heartbeat_ms = self.heartbeat_ms;
        let max_events_per_sub = self.max_events_per_sub;
        let session = self.sessions.get_mut(&id).ok_or_else(|| {
            RpcError::new(
                proto::HEARTBEAT_TIMEOUT,
                format!("session {id} is gone; open a new one"),
            )
        })?;
        session.peer = peer;
        session.connected = true;
        session.notify = notify;
        session.keepalive_deadline = now_ms + heartbeat_ms;
        for sub in session.subs.values_mut() {
            if since_seq < sub.last_delivered {
                sub.last_delivered = since_seq.max(sub.last_acked);
                sub.resumed = true;
            }
        }
        let info = OpenInfo {
            id,
            heartbeat_ms,
            max_events_per_sub,
            granted_locks: session.pid_locks.iter().copied().collect(),
            warnings: Vec::new(),
        };
        session.notify_writer();
        info!("session {id} resumed from seq {since_seq}");
        Ok(info)
    }

    /// Drop a destroyed task's lock from whichever session holds it.
    pub fn release_pid(&mut self, pid: Pid) {
        for session in self.sessions.values_mut() {
            session.pid_locks.remove(&pid);
        }
    }

    /// Close a session, returning the PID locks it held. Idempotent.
    pub fn close(&mut self, id: SessionId) -> Vec<Pid> {
        match self.sessions.remove(&id) {
            Some(session) => {
                info!("session {id} closed");
                session.pid_locks.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn keepalive(&mut self, id: SessionId, now_ms: u64) -> Result<(), RpcError> {
        let heartbeat_ms = self.heartbeat_ms;
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| RpcError::new(proto::SESSION_REQUIRED, "no such session"))?;
        session.keepalive_deadline = now_ms + heartbeat_ms;
        Ok(())
    }

    /// Mark a connection gone without closing the session; the client may
    /// resume until the keepalive lapses.
    pub fn disconnect(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.connected = false;
            session.notify = None;
            debug!("session {id} disconnected (resumable)");
        }
    }

    /// Remove sessions whose keepalive lapsed; returns released locks.
    pub fn expire(&mut self, now_ms: u64) -> Vec<(SessionId, Vec<Pid>)> {
        let lapsed: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.keepalive_deadline <= now_ms)
            .map(|s| s.id)
            .collect();
        lapsed
            .into_iter()
            .map(|id| {
                info!("session {id} keepalive lapsed");
                (id, self.close(id))
            })
            .collect()
    }

    /// `events.subscribe`.
    pub fn subscribe(
        &mut self,
        id: SessionId,
        kinds: Option<BTreeSet<EventKind>>,
        pids: Option<BTreeSet<Pid>>,
    ) -> Result<SubId, RpcError> {
        let capacity = self.max_events_per_sub;
        let sub_id = self.next_sub;
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| RpcError::new(proto::SESSION_REQUIRED, "no such session"))?;
        self.next_sub += 1;
        session.subs.insert(
            sub_id,
            Subscription {
                id: sub_id,
                kinds,
                pids,
                queue: SeqRing::new(capacity),
                last_delivered: 0,
                last_acked: 0,
                resumed: false,
            },
        );
        Ok(sub_id)
    }

    /// `events.ack`: advance the ACK cursor (never backwards) and release
    /// ring slots.
    pub fn ack(&mut self, id: SessionId, sub_id: SubId, up_to: u64) -> Result<u64, RpcError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| RpcError::new(proto::SESSION_REQUIRED, "no such session"))?;
        let sub = session
            .subs
            .get_mut(&sub_id)
            .ok_or_else(|| RpcError::new(proto::NOT_FOUND, "no such subscription"))?;
        // ACKs are clamped into last_acked ..= last_delivered.
        let acked = up_to.min(sub.last_delivered).max(sub.last_acked);
        sub.last_acked = acked;
        sub.queue.release_through(acked);
        Ok(acked)
    }

    pub fn unsubscribe(&mut self, id: SessionId, sub_id: SubId) -> Result<(), RpcError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| RpcError::new(proto::SESSION_REQUIRED, "no such session"))?;
        session
            .subs
            .remove(&sub_id)
            .map(|_| ())
            .ok_or_else(|| RpcError::new(proto::NOT_FOUND, "no such subscription"))
    }

    /// Route one event into every matching subscription.
    pub fn route(&mut self, event: &Event) {
        for session in self.sessions.values_mut() {
            let matching: Vec<SubId> = session
                .subs
                .values()
                .filter(|s| s.matches(event))
                .map(|s| s.id)
                .collect();
            if matching.is_empty() {
                continue;
            }
            let seq = session.next_seq;
            session.next_seq += 1;
            for sub_id in matching {
                let sub = session.subs.get_mut(&sub_id).expect("sub id from iteration");
                sub.queue.push(seq, event.clone());
            }
            session.notify_writer();
        }
    }

    /// Collect the wire frames pending for a session's subscriptions.
    /// Called by the connection writer thread; updates delivery cursors.
    pub fn drain(&mut self, id: SessionId) -> Vec<Value> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Vec::new();
        };
        let mut frames = Vec::new();
        for sub in session.subs.values_mut() {
            sub.queue.take_dropped();
            let pending: Vec<(u64, Event)> = sub
                .queue
                .iter_after(sub.last_delivered)
                .map(|(seq, ev)| (seq, ev.clone()))
                .collect();
            let Some(&(first_seq, _)) = pending.first() else {
                continue;
            };

            // A gap between the cursor and the oldest retained event means
            // eviction (slow consumer) or a resume past the buffer.
            let gap = first_seq - sub.last_delivered - 1;
            if gap > 0 {
                let warning = if sub.resumed {
                    Event::warning(
                        None,
                        "events_missing",
                        json!({
                            "from_seq": sub.last_delivered + 1,
                            "to_seq": first_seq - 1,
                        }),
                    )
                } else {
                    Event::warning(
                        None,
                        "slow_consumer",
                        json!({ "pending": pending.len(), "dropped": gap }),
                    )
                };
                frames.push(envelope(sub.id, first_seq - 1, &warning));
            }
            sub.resumed = false;

            for (seq, event) in &pending {
                frames.push(envelope(sub.id, *seq, event));
                sub.last_delivered = *seq;
            }
        }
        frames
    }
}

impl Session {
    fn notify_writer(&self) {
        if let Some(notify) = &self.notify {
            let _ = notify.try_send(());
        }
    }
}

/// The asynchronous event envelope.
fn envelope(sub_id: SubId, seq: u64, event: &Event) -> Value {
    json!({
        "ev": true,
        "sub_id": sub_id,
        "seq": seq,
        "ts": event.ts,
        "type": event.kind.as_str(),
        "pid": event.pid,
        "data": event.data,
    })
}
