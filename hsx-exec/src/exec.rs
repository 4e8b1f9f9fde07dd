//! The executive.
//!
//! Owns the arena, the task table, the mailbox and value/command
//! registries, the breakpoint and watch sets, and the session manager. All
//! VM-state mutation happens on the thread driving [`Executive::run`]; the
//! control endpoint posts [`ExecMsg`]s through a channel and the session
//! rings are the only state shared outward (behind a spinlock, consumed by
//! connection writer threads).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use serde_derive::Deserialize;
use serde_json::{Value, json};
use spinning_top::Spinlock;
use thiserror::Error;

use hsx_abi::isa::{NUM_REGS, REG_WINDOW_BYTES};
use hsx_abi::f16;

use crate::arena::Arena;
use crate::event::{Event, EventKind};
use crate::hal::HalBank;
use crate::mailbox::{HOST_PID, MailboxRegistry, MbxError, SendOutcome, WakeSet};
use crate::persist::{self, PersistentStore};
use crate::proto::{self, Request, RpcError};
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::session::{SessionId, SessionManager};
use crate::svc;
use crate::task::{Pid, RegWindow, TaskRecord, TaskState, WaitReason};
use crate::time::TimeSource;
use crate::vm::{self, Control, VmFault};

/// Executive tunables.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub arena_bytes: usize,
    pub heartbeat_ms: u64,
    pub max_events_per_sub: usize,
    pub stack_bytes: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            arena_bytes: hsx_abi::DEFAULT_ARENA_BYTES,
            heartbeat_ms: 5000,
            max_events_per_sub: 256,
            stack_bytes: hsx_abi::DEFAULT_STACK_BYTES,
        }
    }
}

/// Image loading failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("image rejected: {0:?}")]
    Image(hsx_image::HxeError),
    #[error("task table is full")]
    TooManyTasks,
    #[error("arena exhausted")]
    ArenaExhausted,
    #[error("entry pc {entry:#x} outside code segment")]
    BadEntry { entry: u32 },
}

/// Result of a successful load.
#[derive(Debug, Clone, Copy)]
pub struct LoadInfo {
    pub pid: Pid,
    pub entry_pc: u32,
    pub code_base: u32,
    pub code_len: u32,
    pub rodata_base: u32,
    pub bss_base: u32,
}

/// Messages from the control endpoint to the executive thread.
pub enum ExecMsg {
    Rpc {
        req: Request,
        session: Option<SessionId>,
        peer: String,
        notify: Sender<()>,
        reply: Sender<RpcOutcome>,
    },
    /// A connection dropped without closing its session.
    Disconnected { session: SessionId },
    /// Advance the clock (free-running mode).
    Tick { rotations: u32 },
    Shutdown,
}

/// Response to one RPC, plus the connection's (possibly updated) session.
pub struct RpcOutcome {
    pub frame: Value,
    pub session: Option<SessionId>,
}

/// Per-connection context threaded through RPC dispatch.
pub struct ConnCtx {
    pub session: Option<SessionId>,
    pub peer: String,
    pub notify: Option<Sender<()>>,
}

impl ConnCtx {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            session: None,
            peer: peer.into(),
            notify: None,
        }
    }
}

pub struct Executive {
    pub(crate) cfg: ExecConfig,
    pub(crate) arena: Arena,
    pub(crate) sched: Scheduler,
    pub(crate) mailboxes: MailboxRegistry,
    pub(crate) registry: Registry,
    pub(crate) hal: HalBank,
    pub(crate) store: Box<dyn PersistentStore>,
    pub(crate) clock: Box<dyn TimeSource>,
    pub(crate) sessions: Arc<Spinlock<SessionManager>>,
    pub(crate) breakpoints: BTreeSet<u32>,
    pub(crate) watches: BTreeSet<u16>,
    /// Bump cursor for segment carve-outs.
    alloc_cursor: u32,
}

impl Executive {
    pub fn new(
        cfg: ExecConfig,
        clock: Box<dyn TimeSource>,
        store: Box<dyn PersistentStore>,
    ) -> Self {
        let sessions = Arc::new(Spinlock::new(SessionManager::new(
            cfg.heartbeat_ms,
            cfg.max_events_per_sub,
        )));
        Self {
            arena: Arena::new(cfg.arena_bytes),
            sched: Scheduler::new(),
            mailboxes: MailboxRegistry::new(),
            registry: Registry::new(),
            hal: HalBank::new(),
            store,
            clock,
            sessions,
            breakpoints: BTreeSet::new(),
            watches: BTreeSet::new(),
            alloc_cursor: 0,
            cfg,
        }
    }

    // ------------------------------------------------------------------
    // Collaborator access (embedding hosts and tests)
    // ------------------------------------------------------------------

    pub fn mailboxes_mut(&mut self) -> &mut MailboxRegistry {
        &mut self.mailboxes
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn hal_mut(&mut self) -> &mut HalBank {
        &mut self.hal
    }

    pub fn sessions_handle(&self) -> Arc<Spinlock<SessionManager>> {
        self.sessions.clone()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn task_state(&self, pid: Pid) -> Option<TaskState> {
        self.sched.task(pid).map(|t| t.state())
    }

    pub fn instr_retired(&self, pid: Pid) -> u64 {
        self.sched.task(pid).map(|t| t.instr_retired).unwrap_or(0)
    }

    /// Snapshot `(regs, pc, sp, psw)` for a task.
    pub fn regs(&self, pid: Pid) -> Option<([u32; NUM_REGS], u32, u32, u32)> {
        let task = self.sched.task(pid)?;
        let window = task.window();
        let mut regs = [0u32; NUM_REGS];
        for (i, slot) in regs.iter_mut().enumerate() {
            *slot = window.reg(&self.arena, i as u8);
        }
        Some((
            regs,
            window.pc(&self.arena),
            window.sp(&self.arena),
            window.psw(&self.arena),
        ))
    }

    pub fn peek_bytes(&self, addr: u32, len: u32) -> Option<Vec<u8>> {
        self.arena.read_bytes(addr, len).ok().map(|b| b.to_vec())
    }

    pub fn poke_bytes(&mut self, addr: u32, data: &[u8]) -> bool {
        self.arena.write_bytes(addr, data).is_ok()
    }

    pub(crate) fn window_of(&self, pid: Pid) -> RegWindow {
        self.sched
            .task(pid)
            .map(|t| t.window())
            .expect("window_of called for a live task")
    }

    /// Host-side value write (provisioning, commands, tests).
    pub fn set_value(&mut self, oid: u16, bits: u16) -> Result<bool, u32> {
        self.apply_value_set(HOST_PID, oid, bits)
    }

    /// Hydrate persisted values; call after host-side registration.
    pub fn hydrate_persisted(&mut self) {
        let bad = self.registry.hydrate(self.store.as_mut());
        for key in bad {
            warn!("persisted record {key:#06x} failed CRC, keeping default");
            self.emit(Event::warning(
                None,
                "persist_crc",
                json!({ "key": key }),
            ));
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub(crate) fn emit(&mut self, mut event: Event) {
        event.ts = self.now_ms() as f64 / 1000.0;
        self.sessions.lock().route(&event);
    }

    pub(crate) fn emit_stdio(&mut self, pid: Pid, kind: EventKind, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).to_string();
        self.emit(Event::new(kind, Some(pid), json!({ "text": text })));
    }

    /// Apply a wake set computed by the mailbox registry.
    pub(crate) fn apply_wakes(&mut self, wake: &WakeSet, mailbox: &str) {
        for &pid in &wake.pids {
            self.mailboxes.remove_waiter(pid);
            if let Some((from, to)) = self.sched.wake(pid) {
                self.emit(Event::new(
                    EventKind::MailboxWake,
                    Some(pid),
                    json!({ "mailbox": mailbox }),
                ));
                self.emit_task_state(pid, from, to);
            }
        }
    }

    fn emit_task_state(&mut self, pid: Pid, from: TaskState, to: TaskState) {
        self.emit(Event::new(
            EventKind::TaskState,
            Some(pid),
            json!({ "from": from.as_str(), "to": to.as_str() }),
        ));
    }

    /// Transition a task and emit `task_state`.
    pub(crate) fn transition(&mut self, pid: Pid, state: TaskState) {
        if let Some((from, to)) = self.sched.set_state(pid, state) {
            self.emit_task_state(pid, from, to);
        }
    }

    /// Park a task in a wait state, emitting `task_state`.
    pub(crate) fn block_task(&mut self, pid: Pid, reason: WaitReason) {
        if let Some((from, to)) = self.sched.block(pid, reason) {
            self.emit_task_state(pid, from, to);
        }
    }

    /// Post a frame to a named descriptor on behalf of the executive,
    /// applying wakes and emitting the send event.
    pub(crate) fn post_frame(
        &mut self,
        name: &str,
        src: Pid,
        payload: &[u8],
        channel: u16,
    ) -> Result<(), MbxError> {
        let now = self.now_ms();
        match self.mailboxes.post(name, src, payload, 0, channel, now)? {
            SendOutcome::Sent {
                seq, bytes, wake, ..
            } => {
                self.emit(Event::new(
                    EventKind::MailboxSend,
                    Some(src),
                    json!({
                        "mailbox": name,
                        "handle": 0,
                        "length": bytes,
                        "channel": channel,
                        "flags": 0,
                        "seq": seq,
                    }),
                ));
                self.apply_wakes(&wake, name);
                Ok(())
            }
            SendOutcome::MustBlock => Err(MbxError::Internal),
        }
    }

    /// Accept a value write from `caller`, fanning out notification frames,
    /// watch events, and persistence.
    pub(crate) fn apply_value_set(
        &mut self,
        caller: Pid,
        oid: u16,
        bits: u16,
    ) -> Result<bool, u32> {
        let now = self.now_ms();
        let outcome = self
            .registry
            .val_set(caller, oid, bits, now)
            .map_err(|e| e.status())?;
        if !outcome.accepted {
            return Ok(false);
        }
        // (oid, f16) notification frame to every subscribed mailbox.
        let mut frame = Vec::with_capacity(4);
        frame.extend_from_slice(&oid.to_le_bytes());
        frame.extend_from_slice(&outcome.bits.to_le_bytes());
        for name in &outcome.notify {
            if let Err(e) = self.post_frame(name, HOST_PID, &frame, 0) {
                debug!("value notify to {name} failed: {e}");
            }
        }
        if self.watches.contains(&oid) {
            self.emit(Event::new(
                EventKind::WatchUpdate,
                Some(caller),
                json!({
                    "oid": oid,
                    "f16": outcome.bits,
                    "value": f16::to_f32(outcome.bits),
                }),
            ));
        }
        if let Some((key, payload)) = outcome.persist {
            self.store.save(key, &persist::encode_record(&payload));
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    fn alloc(&mut self, len: u32, align: u32) -> Result<u32, LoadError> {
        let base = self.alloc_cursor.next_multiple_of(align);
        let end = base.checked_add(len).ok_or(LoadError::ArenaExhausted)?;
        if end as usize > self.arena.size() {
            return Err(LoadError::ArenaExhausted);
        }
        self.alloc_cursor = end;
        Ok(base)
    }

    /// Load a `.hxe` image: carve segments, zero BSS, set up the register
    /// window and stack, and create the task Ready.
    pub fn load_image(
        &mut self,
        bytes: &[u8],
        name: &str,
        origin: &str,
    ) -> Result<LoadInfo, LoadError> {
        let image = hsx_image::parse(bytes).map_err(LoadError::Image)?;
        let header = image.header;
        if header.code_len > 0 && header.entry_pc >= header.code_len {
            return Err(LoadError::BadEntry {
                entry: header.entry_pc,
            });
        }
        let pid = self.sched.allocate_pid().ok_or(LoadError::TooManyTasks)?;

        let code_base = self.alloc(header.code_len.max(2), 4)?;
        let rodata_base = self.alloc(header.rodata_len, 4)?;
        let bss_base = self.alloc(header.bss_len, 4)?;
        let reg_base = self.alloc(REG_WINDOW_BYTES as u32, 4)?;
        let stack_limit = self.alloc(self.cfg.stack_bytes as u32, 4)?;
        let stack_base = stack_limit + self.cfg.stack_bytes as u32;

        self.arena
            .write_bytes(code_base, image.code)
            .expect("allocated in range");
        self.arena
            .write_bytes(rodata_base, image.rodata)
            .expect("allocated in range");
        self.arena
            .fill(bss_base, header.bss_len, 0)
            .expect("allocated in range");

        let window = RegWindow { base: reg_base };
        for i in 0..NUM_REGS as u8 {
            window.set_reg(&mut self.arena, i, 0);
        }
        window.set_pc(&mut self.arena, code_base + header.entry_pc);
        window.set_sp(&mut self.arena, stack_base);
        window.set_psw(&mut self.arena, 0);

        let mut task = TaskRecord::new(pid, name.to_string(), origin.to_string());
        task.reg_base = reg_base;
        task.region_base = code_base;
        task.stack_base = stack_base;
        task.stack_limit = stack_limit;
        self.sched.insert(task);

        info!(
            "loaded {name} as pid {pid}: code {:#x}+{:#x}, entry {:#x}",
            code_base,
            header.code_len,
            code_base + header.entry_pc
        );
        self.emit(Event::new(
            EventKind::TaskState,
            Some(pid),
            json!({ "from": "none", "to": "ready", "app": name }),
        ));
        Ok(LoadInfo {
            pid,
            entry_pc: code_base + header.entry_pc,
            code_base,
            code_len: header.code_len,
            rodata_base,
            bss_base,
        })
    }

    /// Voluntary task exit (`EXEC_EXIT`).
    pub(crate) fn exit_task(&mut self, pid: Pid, code: i32) {
        info!("task {pid} exited with code {code}");
        if let Some(task) = self.sched.task_mut(pid) {
            task.exit_code = Some(code);
        }
        self.transition(pid, TaskState::Exited);
        self.reap(pid);
    }

    /// Host-side kill: any state -> Exited, then destroy the record.
    pub fn kill_task(&mut self, pid: Pid) -> bool {
        if self.sched.task(pid).is_none() {
            return false;
        }
        self.transition(pid, TaskState::Exited);
        self.reap(pid);
        true
    }

    /// Release everything a dead task owned and drop its record.
    fn reap(&mut self, pid: Pid) {
        let wake = self.mailboxes.release_task(pid);
        self.apply_wakes(&wake, "");
        self.registry.release_task(pid);
        self.sessions.lock().release_pid(pid);
        self.sched.remove(pid);
    }

    // ------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------

    /// Run `n` rotations; returns `(rotations, instructions_retired)`.
    pub fn step(&mut self, n: u64) -> (u64, u64) {
        let mut instructions = 0;
        for _ in 0..n {
            instructions += self.rotation();
        }
        (n, instructions)
    }

    /// One rotation: wake expired sleepers/timeouts, then retire one
    /// instruction per Ready PID in ascending PID order.
    fn rotation(&mut self) -> u64 {
        self.wake_expired();
        let mut retired = 0;
        for pid in self.sched.ready_pids() {
            // Readiness can change mid-rotation (a step may wake or kill
            // another task), so re-check before each step.
            if self.sched.task(pid).map(|t| t.state()) != Some(TaskState::Ready) {
                continue;
            }
            if self.step_task(pid) {
                retired += 1;
            }
        }
        self.sched.rotations += 1;
        retired
    }

    fn wake_expired(&mut self) {
        let now = self.now_ms();
        for (pid, reason) in self.sched.collect_expired(now) {
            self.mailboxes.remove_waiter(pid);
            if let Some((from, to)) = self.sched.wake(pid) {
                if matches!(reason, WaitReason::Sleep { .. }) {
                    self.emit(Event::new(
                        EventKind::Scheduler,
                        Some(pid),
                        json!({ "op": "sleep_elapsed" }),
                    ));
                }
                self.emit_task_state(pid, from, to);
            }
        }
    }

    /// Retire (at most) one instruction on `pid`. Returns whether an
    /// instruction actually retired (a breakpoint pause retires nothing).
    fn step_task(&mut self, pid: Pid) -> bool {
        let (window, stack_base, stack_limit) = {
            let task = self.sched.task(pid).expect("stepping a live task");
            (task.window(), task.stack_base, task.stack_limit)
        };
        let pc = window.pc(&self.arena);

        // Breakpoints match the pre-execution PC. A task resumed at its
        // breakpoint address steps over it once.
        if self.breakpoints.contains(&pc) {
            let skip = self.sched.task(pid).and_then(|t| t.bp_skip) == Some(pc);
            if !skip {
                self.transition(pid, TaskState::Paused);
                self.emit(Event::new(
                    EventKind::DebugBreak,
                    Some(pid),
                    json!({ "reason": "breakpoint", "pc": pc }),
                ));
                return false;
            }
        }
        if let Some(task) = self.sched.task_mut(pid) {
            task.bp_skip = None;
        }

        let instr = match vm::decode(&self.arena, pc) {
            Ok(instr) => instr,
            Err(fault) => {
                self.fault_task(pid, pc, fault);
                return false;
            }
        };
        let executed =
            match vm::execute(&mut self.arena, window, stack_base, stack_limit, instr, pc) {
                Ok(executed) => executed,
                Err(fault) => {
                    self.fault_task(pid, pc, fault);
                    return false;
                }
            };

        if let Some(task) = self.sched.task_mut(pid) {
            task.instr_retired += 1;
        }

        let next_pc = window.pc(&self.arena);
        let psw = window.psw(&self.arena);
        let jumped = matches!(executed.control, Control::Jump(_));
        self.emit(Event::new(
            EventKind::TraceStep,
            Some(pid),
            json!({
                "pc": pc,
                "next_pc": next_pc,
                "opcode": instr.op.mnemonic(),
                "psw": psw,
                "regs_snapshot_mask": executed.changed & 0xFFFF,
                "changed_regs": vm::changed_reg_names(executed.changed, jumped),
            }),
        ));

        match executed.control {
            Control::Next | Control::Jump(_) => {}
            Control::Brk => {
                self.transition(pid, TaskState::Paused);
                self.emit(Event::new(
                    EventKind::DebugBreak,
                    Some(pid),
                    json!({ "reason": "BRK", "pc": pc }),
                ));
            }
            Control::Svc { module, function } => {
                svc::dispatch(self, pid, module, function);
            }
        }
        true
    }

    /// Fatal VM fault: emit the fatal event and park the task Faulted.
    fn fault_task(&mut self, pid: Pid, pc: u32, fault: VmFault) {
        warn!("task {pid} faulted at {pc:#x}: {fault}");
        if let Some(task) = self.sched.task_mut(pid) {
            task.fault = Some(fault.to_string());
        }
        self.transition(pid, TaskState::Faulted);
        self.emit(Event::new(
            EventKind::DebugBreak,
            Some(pid),
            json!({ "reason": "fault", "pc": pc, "fault": fault.to_string() }),
        ));
    }

    // ------------------------------------------------------------------
    // Housekeeping and the run loop
    // ------------------------------------------------------------------

    /// Periodic work: session keepalive expiry and debounced persistence.
    pub fn housekeeping(&mut self) {
        let now = self.now_ms();
        let lapsed = self.sessions.lock().expire(now);
        for (sid, locks) in lapsed {
            for pid in locks {
                if let Some(task) = self.sched.task_mut(pid) {
                    if task.owner_session == Some(sid) {
                        task.owner_session = None;
                    }
                }
            }
        }
        for (key, payload) in self.registry.flush_dirty(now) {
            self.store.save(key, &persist::encode_record(&payload));
        }
    }

    /// Serialized command loop. Runs until `Shutdown` or channel close.
    pub fn run(mut self, rx: Receiver<ExecMsg>) {
        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(ExecMsg::Rpc {
                    req,
                    session,
                    peer,
                    notify,
                    reply,
                }) => {
                    let mut ctx = ConnCtx {
                        session,
                        peer,
                        notify: Some(notify),
                    };
                    let frame = self.dispatch_rpc(&mut ctx, req);
                    let _ = reply.send(RpcOutcome {
                        frame,
                        session: ctx.session,
                    });
                }
                Ok(ExecMsg::Disconnected { session }) => {
                    self.sessions.lock().disconnect(session);
                }
                Ok(ExecMsg::Tick { rotations }) => {
                    self.step(rotations as u64);
                }
                Ok(ExecMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.housekeeping();
        }
        info!("executive stopped");
    }

    // ------------------------------------------------------------------
    // Control RPCs
    // ------------------------------------------------------------------

    /// Dispatch one request, producing the response frame.
    pub fn dispatch_rpc(&mut self, ctx: &mut ConnCtx, req: Request) -> Value {
        match self.handle_op(ctx, &req.op, req.args) {
            Ok(result) => proto::ok_frame(&req.id, result),
            Err(error) => proto::err_frame(&req.id, &error),
        }
    }

    fn handle_op(&mut self, ctx: &mut ConnCtx, op: &str, args: Value) -> Result<Value, RpcError> {
        match op {
            "session.open" => self.rpc_session_open(ctx, args),
            "session.close" => self.rpc_session_close(ctx),
            "session.keepalive" => {
                let sid = require_session(ctx)?;
                let now = self.now_ms();
                self.sessions.lock().keepalive(sid, now)?;
                Ok(json!({}))
            }
            "events.subscribe" => self.rpc_subscribe(ctx, args),
            "events.ack" => {
                let sid = require_session(ctx)?;
                let a: AckArgs = parse(args)?;
                let acked = self.sessions.lock().ack(sid, a.sub_id, a.up_to_seq)?;
                Ok(json!({ "acked": acked }))
            }
            "events.unsubscribe" => {
                let sid = require_session(ctx)?;
                let a: SubIdArgs = parse(args)?;
                self.sessions.lock().unsubscribe(sid, a.sub_id)?;
                Ok(json!({}))
            }
            "task.load" => self.rpc_task_load(ctx, args),
            "task.kill" => {
                let a: PidArgs = parse(args)?;
                self.require_lock(ctx, a.pid)?;
                if self.kill_task(a.pid) {
                    Ok(json!({}))
                } else {
                    Err(RpcError::new(proto::NOT_FOUND, format!("no task {}", a.pid)))
                }
            }
            "task.list" => Ok(self.rpc_task_list()),
            "task.pause" => {
                let a: PidArgs = parse(args)?;
                self.require_lock(ctx, a.pid)?;
                self.transition(a.pid, TaskState::Paused);
                Ok(json!({}))
            }
            "task.resume" => {
                let a: PidArgs = parse(args)?;
                self.require_lock(ctx, a.pid)?;
                let task = self
                    .sched
                    .task_mut(a.pid)
                    .ok_or_else(|| RpcError::new(proto::NOT_FOUND, "no such task"))?;
                if task.state() != TaskState::Paused {
                    return Err(RpcError::bad_request("task is not paused"));
                }
                // Step over a breakpoint parked at the resume address.
                let window = task.window();
                let pc = window.pc(&self.arena);
                let task = self.sched.task_mut(a.pid).expect("checked above");
                task.bp_skip = Some(pc);
                self.transition(a.pid, TaskState::Ready);
                Ok(json!({}))
            }
            "clock.status" => Ok(json!({
                "now_ms": self.now_ms(),
                "rotations": self.sched.rotations,
                "tasks": self.sched.live_count(),
                "ready": self.sched.ready_pids().len(),
            })),
            "clock.step" => {
                self.require_non_observer(ctx)?;
                let a: StepArgs = parse(args)?;
                let (rotations, instructions) = self.step(a.n.unwrap_or(1));
                Ok(json!({ "rotations": rotations, "instructions": instructions }))
            }
            "bp.set" => {
                self.require_non_observer(ctx)?;
                let a: AddrArgs = parse(args)?;
                self.breakpoints.insert(a.addr);
                Ok(json!({ "addr": a.addr }))
            }
            "bp.clear" => {
                self.require_non_observer(ctx)?;
                let a: AddrArgs = parse(args)?;
                if self.breakpoints.remove(&a.addr) {
                    Ok(json!({}))
                } else {
                    Err(RpcError::new(proto::NOT_FOUND, "no breakpoint there"))
                }
            }
            "bp.list" => Ok(json!({ "addrs": self.breakpoints.iter().collect::<Vec<_>>() })),
            "watch.add" => {
                require_session(ctx)?;
                let a: OidArgs = parse(args)?;
                self.watches.insert(a.oid);
                Ok(json!({ "oid": a.oid }))
            }
            "watch.remove" => {
                require_session(ctx)?;
                let a: OidArgs = parse(args)?;
                self.watches.remove(&a.oid);
                Ok(json!({}))
            }
            "watch.list" => Ok(json!({ "oids": self.watches.iter().collect::<Vec<_>>() })),
            "mem.peek" => {
                require_session(ctx)?;
                let a: MemPeekArgs = parse(args)?;
                let bytes = self
                    .peek_bytes(a.addr, a.len)
                    .ok_or_else(|| RpcError::new(proto::VM_ERROR, "address out of range"))?;
                Ok(json!({ "addr": a.addr, "data": BASE64.encode(bytes) }))
            }
            "mem.poke" => {
                // Writes are scoped to one task's footprint and gated on
                // that task's lock, exactly like regs.set.
                let a: MemPokeArgs = parse(args)?;
                self.require_lock(ctx, a.pid)?;
                let data = BASE64
                    .decode(&a.data)
                    .map_err(|e| RpcError::bad_request(format!("bad base64: {e}")))?;
                let task = self
                    .sched
                    .task(a.pid)
                    .ok_or_else(|| RpcError::new(proto::NOT_FOUND, "no such task"))?;
                if !task.owns_range(a.addr, data.len() as u32) {
                    return Err(RpcError::new(
                        proto::VM_ERROR,
                        format!("address {:#x}..+{} outside pid {} region", a.addr, data.len(), a.pid),
                    ));
                }
                if self.poke_bytes(a.addr, &data) {
                    Ok(json!({ "written": data.len() }))
                } else {
                    Err(RpcError::new(proto::VM_ERROR, "address out of range"))
                }
            }
            "regs.get" => {
                let a: PidArgs = parse(args)?;
                let (regs, pc, sp, psw) = self
                    .regs(a.pid)
                    .ok_or_else(|| RpcError::new(proto::NOT_FOUND, "no such task"))?;
                Ok(json!({ "regs": regs, "pc": pc, "sp": sp, "psw": psw }))
            }
            "regs.set" => {
                let a: RegSetArgs = parse(args)?;
                self.require_lock(ctx, a.pid)?;
                let window = self
                    .sched
                    .task(a.pid)
                    .map(|t| t.window())
                    .ok_or_else(|| RpcError::new(proto::NOT_FOUND, "no such task"))?;
                match a.reg.as_str() {
                    "PC" => window.set_pc(&mut self.arena, a.value),
                    "SP" => window.set_sp(&mut self.arena, a.value),
                    "PSW" => window.set_psw(&mut self.arena, a.value),
                    name => {
                        let idx = name
                            .strip_prefix('R')
                            .and_then(|n| n.parse::<u8>().ok())
                            .filter(|&n| (n as usize) < NUM_REGS)
                            .ok_or_else(|| RpcError::bad_request("unknown register"))?;
                        window.set_reg(&mut self.arena, idx, a.value);
                    }
                }
                Ok(json!({}))
            }
            "stack.get" => {
                let a: StackArgs = parse(args)?;
                let task = self
                    .sched
                    .task(a.pid)
                    .ok_or_else(|| RpcError::new(proto::NOT_FOUND, "no such task"))?;
                let window = task.window();
                let stack_base = task.stack_base;
                let sp = window.sp(&self.arena);
                let mut words = Vec::new();
                let mut at = sp;
                let limit = a.words.unwrap_or(16);
                while at + 4 <= stack_base && (words.len() as u32) < limit {
                    words.push(self.arena.read_u32(at).unwrap_or(0));
                    at += 4;
                }
                Ok(json!({ "sp": sp, "words": words }))
            }
            "disasm.at" => {
                let a: DisasmArgs = parse(args)?;
                let lines = crate::vm::disasm::lines_at(
                    &self.arena,
                    a.addr,
                    a.count.unwrap_or(8) as usize,
                );
                let rendered: Vec<Value> = lines
                    .iter()
                    .map(|l| json!({ "addr": l.addr, "word": l.word, "text": l.text }))
                    .collect();
                Ok(json!({ "lines": rendered }))
            }
            _ => Err(RpcError::new(
                proto::UNSUPPORTED_CATEGORY,
                format!("unknown op {op}"),
            )),
        }
    }

    fn rpc_session_open(&mut self, ctx: &mut ConnCtx, args: Value) -> Result<Value, RpcError> {
        let a: OpenArgs = parse(args)?;
        let now = self.now_ms();

        if let Some(resume) = a.resume {
            let info = self.sessions.lock().resume(
                resume,
                a.since_seq.unwrap_or(0),
                ctx.peer.clone(),
                ctx.notify.clone(),
                now,
            )?;
            ctx.session = Some(info.id);
            return Ok(open_info_json(&info));
        }

        // `want_locks` absent means observer mode; an explicit empty list
        // opens a full session that acquires locks later via task.load.
        let observer = a.want_locks.is_none();
        let mut want = Vec::new();
        let mut warnings = Vec::new();
        for pid in a.want_locks.unwrap_or_default() {
            if self.sched.task(pid).is_some() {
                want.push(pid);
            } else {
                warnings.push(format!("pid {pid} is not loaded; lock not granted"));
            }
        }
        let info = self.sessions.lock().open(
            ctx.peer.clone(),
            a.capabilities.unwrap_or_default(),
            want.clone(),
            observer,
            warnings,
            ctx.notify.clone(),
            now,
        )?;
        for pid in want {
            if let Some(task) = self.sched.task_mut(pid) {
                task.owner_session = Some(info.id);
            }
        }
        ctx.session = Some(info.id);
        Ok(open_info_json(&info))
    }

    fn rpc_session_close(&mut self, ctx: &mut ConnCtx) -> Result<Value, RpcError> {
        // Idempotent: closing without a session is fine.
        if let Some(sid) = ctx.session.take() {
            let locks = self.sessions.lock().close(sid);
            for pid in locks {
                if let Some(task) = self.sched.task_mut(pid) {
                    task.owner_session = None;
                }
            }
        }
        Ok(json!({}))
    }

    fn rpc_subscribe(&mut self, ctx: &mut ConnCtx, args: Value) -> Result<Value, RpcError> {
        let sid = require_session(ctx)?;
        let a: SubscribeArgs = parse(args)?;
        let kinds = a.kinds.map(|k| k.into_iter().collect());
        let pids = a.pids.map(|p| p.into_iter().collect());
        let sub_id = self.sessions.lock().subscribe(sid, kinds, pids)?;
        Ok(json!({ "sub_id": sub_id }))
    }

    fn rpc_task_load(&mut self, ctx: &mut ConnCtx, args: Value) -> Result<Value, RpcError> {
        self.require_non_observer(ctx)?;
        let a: LoadArgs = parse(args)?;
        let (bytes, origin) = match (&a.path, &a.image) {
            (Some(path), None) => {
                let bytes = std::fs::read(path)
                    .map_err(|e| RpcError::bad_request(format!("cannot read {path}: {e}")))?;
                (bytes, path.clone())
            }
            (None, Some(image)) => {
                let bytes = BASE64
                    .decode(image)
                    .map_err(|e| RpcError::bad_request(format!("bad base64 image: {e}")))?;
                (bytes, "inline".to_string())
            }
            _ => return Err(RpcError::bad_request("pass exactly one of path or image")),
        };
        let name = a.name.unwrap_or_else(|| "app".to_string());
        let info = self
            .load_image(&bytes, &name, &origin)
            .map_err(|e| RpcError::new(proto::VM_ERROR, e.to_string()))?;
        // The loader grants the loading session the task's lock.
        if let Some(sid) = ctx.session {
            self.sessions
                .lock()
                .session_mut(sid)
                .expect("session checked above")
                .pid_locks
                .insert(info.pid);
            if let Some(task) = self.sched.task_mut(info.pid) {
                task.owner_session = Some(sid);
            }
        }
        Ok(json!({
            "pid": info.pid,
            "entry_pc": info.entry_pc,
            "code_base": info.code_base,
            "code_len": info.code_len,
            "rodata_base": info.rodata_base,
            "bss_base": info.bss_base,
        }))
    }

    fn rpc_task_list(&self) -> Value {
        let tasks: Vec<Value> = self
            .sched
            .iter()
            .map(|task| {
                let window = task.window();
                json!({
                    "pid": task.pid(),
                    "name": task.app_name,
                    "origin": task.origin,
                    "state": task.state().as_str(),
                    "pc": window.pc(&self.arena),
                    "instr_budget": task.instr_retired,
                    "locked_by": task.owner_session,
                })
            })
            .collect();
        json!({ "tasks": tasks })
    }

    fn require_lock(&self, ctx: &ConnCtx, pid: Pid) -> Result<SessionId, RpcError> {
        let sid = require_session(ctx)?;
        let holds = self
            .sessions
            .lock()
            .session(sid)
            .map(|s| s.pid_locks.contains(&pid))
            .unwrap_or(false);
        if holds {
            Ok(sid)
        } else {
            Err(
                RpcError::new(proto::PID_LOCKED, format!("session does not hold pid {pid}"))
                    .with_details(json!({ "pid": pid })),
            )
        }
    }

    fn require_non_observer(&self, ctx: &ConnCtx) -> Result<SessionId, RpcError> {
        let sid = require_session(ctx)?;
        let observer = self
            .sessions
            .lock()
            .session(sid)
            .map(|s| s.is_observer())
            .unwrap_or(true);
        if observer {
            Err(RpcError::new(
                proto::PID_LOCKED,
                "observer sessions cannot mutate task state",
            ))
        } else {
            Ok(sid)
        }
    }
}

fn require_session(ctx: &ConnCtx) -> Result<SessionId, RpcError> {
    ctx.session
        .ok_or_else(|| RpcError::new(proto::SESSION_REQUIRED, "open a session first"))
}

fn parse<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, RpcError> {
    serde_json::from_value(args).map_err(|e| RpcError::bad_request(format!("bad args: {e}")))
}

fn open_info_json(info: &crate::session::OpenInfo) -> Value {
    json!({
        "id": info.id,
        "heartbeat_ms": info.heartbeat_ms,
        "max_events_per_sub": info.max_events_per_sub,
        "granted_locks": info.granted_locks,
        "warnings": info.warnings,
    })
}

#[derive(Deserialize)]
struct OpenArgs {
    capabilities: Option<Vec<String>>,
    want_locks: Option<Vec<Pid>>,
    resume: Option<SessionId>,
    since_seq: Option<u64>,
}

#[derive(Deserialize)]
struct SubscribeArgs {
    kinds: Option<Vec<EventKind>>,
    pids: Option<Vec<Pid>>,
}

#[derive(Deserialize)]
struct AckArgs {
    sub_id: u32,
    up_to_seq: u64,
}

#[derive(Deserialize)]
struct SubIdArgs {
    sub_id: u32,
}

#[derive(Deserialize)]
struct LoadArgs {
    path: Option<String>,
    image: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct PidArgs {
    pid: Pid,
}

#[derive(Deserialize)]
struct StepArgs {
    n: Option<u64>,
}

#[derive(Deserialize)]
struct AddrArgs {
    addr: u32,
}

#[derive(Deserialize)]
struct OidArgs {
    oid: u16,
}

#[derive(Deserialize)]
struct MemPeekArgs {
    addr: u32,
    len: u32,
}

#[derive(Deserialize)]
struct MemPokeArgs {
    pid: Pid,
    addr: u32,
    data: String,
}

#[derive(Deserialize)]
struct RegSetArgs {
    pid: Pid,
    reg: String,
    value: u32,
}

#[derive(Deserialize)]
struct StackArgs {
    pid: Pid,
    words: Option<u32>,
}

#[derive(Deserialize)]
struct DisasmArgs {
    addr: u32,
    count: Option<u32>,
}
