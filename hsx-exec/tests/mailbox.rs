//! Mailbox IPC through the SVC interface: producer/consumer, blocking
//! receive with wake, timeouts, and fan-out overrun.

mod common;

use common::*;
use serde_json::json;

use hsx_abi::{
    FRAME_OVERRUN, MBX_BIND, MBX_MODE_FANOUT_DROP, MBX_MODE_RDONLY, MBX_MODE_WRONLY, MBX_OPEN,
    MBX_RECV, MBX_SEND, MODULE_MBX, TIMEOUT_INFINITE, status,
};
use hsx_exec::mailbox::{HOST_PID, RecvOutcome};
use hsx_exec::task::TaskState;

fn producer_image() -> Vec<u8> {
    // BIND, then SEND, then stop.
    Asm::new()
        .svc(MODULE_MBX, MBX_BIND)
        .svc(MODULE_MBX, MBX_SEND)
        .brk()
        .image_with(64, &[])
}

fn consumer_image() -> Vec<u8> {
    Asm::new()
        .svc(MODULE_MBX, MBX_OPEN)
        .svc(MODULE_MBX, MBX_RECV)
        .brk()
        .image_with(64, &[])
}

struct Loaded {
    pid: u16,
    bss: u32,
}

fn load(exec: &mut hsx_exec::Executive, ctx: &mut hsx_exec::ConnCtx, image: &[u8], name: &str) -> Loaded {
    let info = load_rpc(exec, ctx, image, name);
    Loaded {
        pid: info["pid"].as_u64().unwrap() as u16,
        bss: info["bss_base"].as_u64().unwrap() as u32,
    }
}

fn set_regs(
    exec: &mut hsx_exec::Executive,
    ctx: &mut hsx_exec::ConnCtx,
    pid: u16,
    regs: &[(u8, u32)],
) {
    for &(idx, value) in regs {
        rpc_ok(
            exec,
            ctx,
            "regs.set",
            json!({ "pid": pid, "reg": format!("R{idx}"), "value": value }),
        );
    }
}

/// Scenario: A binds `app:demo`, B opens RDONLY, A sends "hello", B's RECV
/// returns 5 bytes and the payload; both mailbox events reach a subscribed
/// session.
#[test]
fn producer_consumer_round_trip() {
    let (mut exec, _clock) = new_exec();
    let mut ctx = open_session(&mut exec);
    rpc_ok(
        &mut exec,
        &mut ctx,
        "events.subscribe",
        json!({"kinds": ["mailbox_send", "mailbox_recv"]}),
    );

    let a = load(&mut exec, &mut ctx, &producer_image(), "producer");
    let b = load(&mut exec, &mut ctx, &consumer_image(), "consumer");

    assert!(exec.poke_bytes(a.bss, b"app:demo"));
    assert!(exec.poke_bytes(a.bss + 16, b"hello"));
    assert!(exec.poke_bytes(b.bss, b"app:demo"));

    // First rotation: A binds (capacity 64), B opens read-only.
    set_regs(&mut exec, &mut ctx, a.pid, &[(1, a.bss), (2, 8), (3, 64), (4, MBX_MODE_WRONLY)]);
    set_regs(&mut exec, &mut ctx, b.pid, &[(1, b.bss), (2, 8), (3, MBX_MODE_RDONLY)]);
    exec.step(1);

    let a_regs = rpc_ok(&mut exec, &mut ctx, "regs.get", json!({ "pid": a.pid }));
    let b_regs = rpc_ok(&mut exec, &mut ctx, "regs.get", json!({ "pid": b.pid }));
    assert_eq!(a_regs["regs"][0], 0, "bind succeeded");
    assert_eq!(b_regs["regs"][0], 0, "open succeeded");
    let a_handle = a_regs["regs"][1].as_u64().unwrap() as u32;
    let b_handle = b_regs["regs"][1].as_u64().unwrap() as u32;

    // Second rotation: A sends on channel 7, B receives with info record.
    set_regs(
        &mut exec,
        &mut ctx,
        a.pid,
        &[(1, a_handle), (2, a.bss + 16), (3, 5), (4, 7 << 16)],
    );
    set_regs(
        &mut exec,
        &mut ctx,
        b.pid,
        &[
            (1, b_handle),
            (2, b.bss + 32),
            (3, 16),
            (4, TIMEOUT_INFINITE),
            (5, b.bss + 48),
        ],
    );
    exec.step(1);

    let b_regs = rpc_ok(&mut exec, &mut ctx, "regs.get", json!({ "pid": b.pid }));
    assert_eq!(b_regs["regs"][0], 0);
    assert_eq!(b_regs["regs"][1], 5, "RECV returns the payload length");
    assert_eq!(exec.peek_bytes(b.bss + 32, 5).unwrap(), b"hello");

    // Info record: seq 1, src A, channel 7.
    let info = exec.peek_bytes(b.bss + 48, 12).unwrap();
    assert_eq!(u32::from_le_bytes(info[0..4].try_into().unwrap()), 1);
    assert_eq!(
        u16::from_le_bytes(info[4..6].try_into().unwrap()),
        a.pid
    );
    assert_eq!(u16::from_le_bytes(info[6..8].try_into().unwrap()), 7);

    let frames = drain(&exec, &ctx);
    let sends = of_type(&frames, "mailbox_send");
    let recvs = of_type(&frames, "mailbox_recv");
    assert_eq!(sends.len(), 1);
    assert_eq!(recvs.len(), 1);
    assert_eq!(sends[0]["data"]["mailbox"], "app:demo");
    assert_eq!(sends[0]["data"]["length"], 5);
    assert_eq!(recvs[0]["data"]["channel"], 7);
}

/// A consumer blocking on an empty mailbox is woken by the producer's send
/// and completes its RECV on the next rotation.
#[test]
fn blocked_receiver_is_woken_by_send() {
    let (mut exec, _clock) = new_exec();
    let mut ctx = open_session(&mut exec);
    rpc_ok(
        &mut exec,
        &mut ctx,
        "events.subscribe",
        json!({"kinds": ["mailbox_wait", "mailbox_wake"]}),
    );

    // Consumer loads first so it gets the lower PID and runs first.
    let b = load(&mut exec, &mut ctx, &consumer_image(), "consumer");
    let a = load(&mut exec, &mut ctx, &producer_image(), "producer");

    assert!(exec.poke_bytes(a.bss, b"app:queue"));
    assert!(exec.poke_bytes(a.bss + 16, b"ping"));
    assert!(exec.poke_bytes(b.bss, b"app:queue"));

    // B (lower PID) steps before A within a rotation, so its OPEN would
    // beat A's BIND. Pre-create the descriptor host-side.
    exec.mailboxes_mut()
        .bind(HOST_PID, "app:queue", 64, MBX_MODE_WRONLY)
        .unwrap();

    set_regs(&mut exec, &mut ctx, b.pid, &[(1, b.bss), (2, 9), (3, MBX_MODE_RDONLY)]);
    set_regs(&mut exec, &mut ctx, a.pid, &[(1, a.bss), (2, 9), (3, 64), (4, MBX_MODE_WRONLY)]);
    exec.step(1);

    let b_handle = rpc_ok(&mut exec, &mut ctx, "regs.get", json!({ "pid": b.pid }))["regs"][1]
        .as_u64()
        .unwrap() as u32;
    let a_handle = rpc_ok(&mut exec, &mut ctx, "regs.get", json!({ "pid": a.pid }))["regs"][1]
        .as_u64()
        .unwrap() as u32;

    // Rotation 2: B RECVs first (blocks, infinite timeout), then A sends —
    // which wakes B within the same rotation.
    set_regs(
        &mut exec,
        &mut ctx,
        b.pid,
        &[(1, b_handle), (2, b.bss + 32), (3, 16), (4, TIMEOUT_INFINITE), (5, 0)],
    );
    set_regs(
        &mut exec,
        &mut ctx,
        a.pid,
        &[(1, a_handle), (2, a.bss + 16), (3, 4), (4, 0)],
    );
    exec.step(1);
    assert_eq!(exec.task_state(b.pid), Some(TaskState::Ready), "woken");

    // Rotation 3: B's retried RECV completes.
    exec.step(1);
    let b_regs = rpc_ok(&mut exec, &mut ctx, "regs.get", json!({ "pid": b.pid }));
    assert_eq!(b_regs["regs"][0], 0);
    assert_eq!(b_regs["regs"][1], 4);
    assert_eq!(exec.peek_bytes(b.bss + 32, 4).unwrap(), b"ping");

    let frames = drain(&exec, &ctx);
    assert_eq!(of_type(&frames, "mailbox_wait").len(), 1);
    assert_eq!(of_type(&frames, "mailbox_wake").len(), 1);
}

/// RECV with a finite timeout returns TIMEOUT once the executive clock
/// passes the deadline, and emits `mailbox_timeout`.
#[test]
fn recv_timeout_expires_against_executive_clock() {
    let (mut exec, clock) = new_exec();
    let mut ctx = open_session(&mut exec);
    rpc_ok(
        &mut exec,
        &mut ctx,
        "events.subscribe",
        json!({"kinds": ["mailbox_timeout"]}),
    );

    let b = load(&mut exec, &mut ctx, &consumer_image(), "consumer");
    assert!(exec.poke_bytes(b.bss, b"app:slow"));
    exec.mailboxes_mut()
        .bind(HOST_PID, "app:slow", 64, MBX_MODE_WRONLY)
        .unwrap();

    set_regs(&mut exec, &mut ctx, b.pid, &[(1, b.bss), (2, 8), (3, MBX_MODE_RDONLY)]);
    exec.step(1);
    let handle = rpc_ok(&mut exec, &mut ctx, "regs.get", json!({ "pid": b.pid }))["regs"][1]
        .as_u64()
        .unwrap() as u32;

    set_regs(
        &mut exec,
        &mut ctx,
        b.pid,
        &[(1, handle), (2, b.bss + 32), (3, 16), (4, 100), (5, 0)],
    );
    exec.step(1);
    assert_eq!(exec.task_state(b.pid), Some(TaskState::Waiting));

    // Not yet: 99ms in, still parked.
    clock.advance(99);
    exec.step(1);
    assert_eq!(exec.task_state(b.pid), Some(TaskState::Waiting));

    clock.advance(1);
    exec.step(1);
    let regs = rpc_ok(&mut exec, &mut ctx, "regs.get", json!({ "pid": b.pid }));
    assert_eq!(regs["regs"][0].as_u64().unwrap() as u32, status::TIMEOUT);

    let frames = drain(&exec, &ctx);
    assert_eq!(of_type(&frames, "mailbox_timeout").len(), 1);
}

/// RECV with timeout 0 polls: NO_DATA immediately, no state change.
#[test]
fn recv_poll_returns_no_data() {
    let (mut exec, _clock) = new_exec();
    let mut ctx = open_session(&mut exec);
    let b = load(&mut exec, &mut ctx, &consumer_image(), "poller");
    assert!(exec.poke_bytes(b.bss, b"app:poll"));
    exec.mailboxes_mut()
        .bind(HOST_PID, "app:poll", 64, MBX_MODE_WRONLY)
        .unwrap();

    set_regs(&mut exec, &mut ctx, b.pid, &[(1, b.bss), (2, 8), (3, MBX_MODE_RDONLY)]);
    exec.step(1);
    let handle = rpc_ok(&mut exec, &mut ctx, "regs.get", json!({ "pid": b.pid }))["regs"][1]
        .as_u64()
        .unwrap() as u32;

    set_regs(&mut exec, &mut ctx, b.pid, &[(1, handle), (2, b.bss + 32), (3, 16), (4, 0), (5, 0)]);
    exec.step(1);
    let regs = rpc_ok(&mut exec, &mut ctx, "regs.get", json!({ "pid": b.pid }));
    assert_eq!(regs["regs"][0].as_u64().unwrap() as u32, status::NO_DATA);
    assert_eq!(exec.task_state(b.pid), Some(TaskState::Ready));
}

/// Scenario: fan-out-drop with a lagging reader. After eviction, the
/// laggard's next RECV lands on the surviving head with OVERRUN set in the
/// info record.
#[test]
fn fanout_drop_overrun_via_svc() {
    let (mut exec, _clock) = new_exec();
    let mut ctx = open_session(&mut exec);

    // Host-side producer and keeper-upper; the guest is the laggard.
    let mode = MBX_MODE_WRONLY | MBX_MODE_FANOUT_DROP;
    let tx = exec.mailboxes_mut().bind(HOST_PID, "app:fan", 16, mode).unwrap();
    let keeper = exec
        .mailboxes_mut()
        .open(HOST_PID, "app:fan", MBX_MODE_RDONLY)
        .unwrap();

    let b = load(&mut exec, &mut ctx, &consumer_image(), "laggard");
    assert!(exec.poke_bytes(b.bss, b"app:fan"));
    set_regs(&mut exec, &mut ctx, b.pid, &[(1, b.bss), (2, 7), (3, MBX_MODE_RDONLY)]);
    exec.step(1);
    let handle = rpc_ok(&mut exec, &mut ctx, "regs.get", json!({ "pid": b.pid }))["regs"][1]
        .as_u64()
        .unwrap() as u32;

    // Four 8-byte sends into a 16-byte queue; the keeper drains, the guest
    // never reads.
    for i in 0..4u8 {
        let now = exec.now_ms();
        exec.mailboxes_mut()
            .send(HOST_PID, tx, &[i; 8], 0, 0, now)
            .unwrap();
        match exec.mailboxes_mut().recv(HOST_PID, keeper, usize::MAX).unwrap() {
            RecvOutcome::Message { .. } => {}
            RecvOutcome::Empty => panic!("keeper should see message {i}"),
        }
    }

    // Laggard's RECV: surviving head, OVERRUN flagged in the info record.
    set_regs(
        &mut exec,
        &mut ctx,
        b.pid,
        &[(1, handle), (2, b.bss + 16), (3, 16), (4, 0), (5, b.bss + 32)],
    );
    exec.step(1);
    let regs = rpc_ok(&mut exec, &mut ctx, "regs.get", json!({ "pid": b.pid }));
    assert_eq!(regs["regs"][0], 0);
    let info = exec.peek_bytes(b.bss + 32, 12).unwrap();
    let flags = u16::from_le_bytes(info[8..10].try_into().unwrap());
    assert_ne!(flags & FRAME_OVERRUN, 0, "laggard must observe OVERRUN");
    let seq = u32::from_le_bytes(info[0..4].try_into().unwrap());
    assert_eq!(seq, 4, "laggard lands on the surviving head");
}
