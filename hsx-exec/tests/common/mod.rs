//! Shared test harness: a tiny assembler, executive construction with a
//! manual clock, and RPC plumbing.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use hsx_abi::isa::{MODE_IMM, MODE_REG, Opcode, encode};
use hsx_exec::exec::{ConnCtx, ExecConfig, Executive};
use hsx_exec::persist::{MemStore, PersistentStore};
use hsx_exec::proto::Request;
use hsx_exec::time::ManualClock;

/// Hand assembler for test images.
#[derive(Default)]
pub struct Asm {
    words: Vec<u16>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len_bytes(&self) -> u32 {
        self.words.len() as u32 * 2
    }

    pub fn nop(mut self) -> Self {
        self.words.push(encode(Opcode::Nop, MODE_REG, 0, 0));
        self
    }

    pub fn mov_imm(mut self, rd: u8, imm: u16) -> Self {
        self.words.push(encode(Opcode::Mov, MODE_IMM, rd, 0));
        self.words.push(imm);
        self
    }

    pub fn movt_imm(mut self, rd: u8, imm: u16) -> Self {
        self.words.push(encode(Opcode::Movt, MODE_IMM, rd, 0));
        self.words.push(imm);
        self
    }

    pub fn add_imm(mut self, rd: u8, imm: u16) -> Self {
        self.words.push(encode(Opcode::Add, MODE_IMM, rd, 0));
        self.words.push(imm);
        self
    }

    pub fn cmp_imm(mut self, rd: u8, imm: u16) -> Self {
        self.words.push(encode(Opcode::Cmp, MODE_IMM, rd, 0));
        self.words.push(imm);
        self
    }

    pub fn br(mut self, offset: i16) -> Self {
        self.words.push(encode(Opcode::Br, MODE_IMM, 0, 0));
        self.words.push(offset as u16);
        self
    }

    pub fn brnz(mut self, offset: i16) -> Self {
        self.words.push(encode(Opcode::Brnz, MODE_IMM, 0, 0));
        self.words.push(offset as u16);
        self
    }

    pub fn ldw(mut self, rd: u8, rs: u8) -> Self {
        self.words.push(encode(Opcode::Ldw, MODE_REG, rd, rs));
        self
    }

    pub fn svc(mut self, module: u8, function: u8) -> Self {
        self.words.push(encode(Opcode::Svc, MODE_IMM, 0, 0));
        self.words.push(hsx_abi::svc_imm(module, function));
        self
    }

    pub fn brk(mut self) -> Self {
        self.words.push(encode(Opcode::Brk, MODE_REG, 0, 0));
        self
    }

    pub fn raw(mut self, word: u16) -> Self {
        self.words.push(word);
        self
    }

    pub fn image(self) -> Vec<u8> {
        self.image_with(0, &[])
    }

    pub fn image_with(self, bss_len: u32, rodata: &[u8]) -> Vec<u8> {
        hsx_image::ImageBuilder::new()
            .entry_pc(0)
            .bss_len(bss_len)
            .code_words(&self.words)
            .rodata(rodata)
            .build()
    }
}

/// In-memory store the test keeps a handle on after the executive takes
/// ownership.
#[derive(Clone, Default)]
pub struct SharedStore(pub Arc<Mutex<MemStore>>);

impl PersistentStore for SharedStore {
    fn load(&mut self, key: u16) -> Option<Vec<u8>> {
        self.0.lock().unwrap().load(key)
    }

    fn save(&mut self, key: u16, record: &[u8]) {
        self.0.lock().unwrap().save(key, record);
    }
}

pub fn new_exec() -> (Executive, ManualClock) {
    let clock = ManualClock::new();
    let exec = Executive::new(
        ExecConfig::default(),
        Box::new(clock.clone()),
        Box::new(MemStore::new()),
    );
    (exec, clock)
}

pub fn new_exec_with_store(store: SharedStore) -> (Executive, ManualClock) {
    let clock = ManualClock::new();
    let exec = Executive::new(
        ExecConfig::default(),
        Box::new(clock.clone()),
        Box::new(store),
    );
    (exec, clock)
}

/// Issue one RPC, returning the whole response frame.
pub fn rpc(exec: &mut Executive, ctx: &mut ConnCtx, op: &str, args: Value) -> Value {
    exec.dispatch_rpc(
        ctx,
        Request {
            id: json!(1),
            op: op.to_string(),
            args,
        },
    )
}

/// Issue one RPC that must succeed; returns its `result`.
pub fn rpc_ok(exec: &mut Executive, ctx: &mut ConnCtx, op: &str, args: Value) -> Value {
    let frame = rpc(exec, ctx, op, args);
    assert_eq!(frame["ok"], true, "rpc {op} failed: {frame}");
    frame["result"].clone()
}

/// Open a full (non-observer) session.
pub fn open_session(exec: &mut Executive) -> ConnCtx {
    let mut ctx = ConnCtx::new("test");
    rpc_ok(exec, &mut ctx, "session.open", json!({ "want_locks": [] }));
    ctx
}

/// Load an image through `task.load`, granting this session the PID lock.
/// Returns the load result (`pid`, `entry_pc`, `code_base`, `bss_base`, …).
pub fn load_rpc(exec: &mut Executive, ctx: &mut ConnCtx, image: &[u8], name: &str) -> Value {
    use base64::Engine as _;
    let encoded = base64::engine::general_purpose::STANDARD.encode(image);
    rpc_ok(
        exec,
        ctx,
        "task.load",
        json!({ "image": encoded, "name": name }),
    )
}

/// Pull this connection's pending event frames.
pub fn drain(exec: &Executive, ctx: &ConnCtx) -> Vec<Value> {
    let sid = ctx.session.expect("session open");
    exec.sessions_handle().lock().drain(sid)
}

/// Events of one type from a drained batch.
pub fn of_type(frames: &[Value], ty: &str) -> Vec<Value> {
    frames
        .iter()
        .filter(|f| f["type"] == ty)
        .cloned()
        .collect()
}
