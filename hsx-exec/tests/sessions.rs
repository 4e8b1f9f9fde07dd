//! Session lifecycle over RPC: lock exclusivity, observer limits,
//! back-pressure, acknowledgements, reconnect, and keepalive expiry.

mod common;

use common::*;
use serde_json::json;

use hsx_exec::exec::ConnCtx;

fn spin_image() -> Vec<u8> {
    Asm::new().br(-4).image()
}

/// With S1 holding a PID lock, S2's open naming the same PID fails with
/// `pid_locked`; an observer session can still subscribe to its events.
#[test]
fn pid_lock_exclusivity_and_observer_mode() {
    let (mut exec, _clock) = new_exec();
    let mut s1 = open_session(&mut exec);
    let pid = load_rpc(&mut exec, &mut s1, &spin_image(), "spin")["pid"]
        .as_u64()
        .unwrap();

    let mut s2 = ConnCtx::new("rival");
    let frame = rpc(
        &mut exec,
        &mut s2,
        "session.open",
        json!({ "want_locks": [pid] }),
    );
    assert_eq!(frame["ok"], false);
    assert_eq!(frame["error"]["kind"], "pid_locked");

    // Observer mode bypasses the lock: subscribe works, mutation doesn't.
    let mut obs = ConnCtx::new("observer");
    rpc_ok(&mut exec, &mut obs, "session.open", json!({}));
    rpc_ok(
        &mut exec,
        &mut obs,
        "events.subscribe",
        json!({ "pids": [pid], "kinds": ["trace_step"] }),
    );
    let step = rpc(&mut exec, &mut obs, "clock.step", json!({ "n": 1 }));
    assert_eq!(step["ok"], false);
    assert_eq!(step["error"]["kind"], "pid_locked");
    let poke = rpc(
        &mut exec,
        &mut obs,
        "regs.set",
        json!({ "pid": pid, "reg": "R1", "value": 1 }),
    );
    assert_eq!(poke["ok"], false);

    // The lock holder steps; the observer sees the trace.
    rpc_ok(&mut exec, &mut s1, "clock.step", json!({ "n": 1 }));
    let frames = drain(&exec, &obs);
    assert_eq!(of_type(&frames, "trace_step").len(), 1);
}

/// `mem.poke` is scoped to a locked task's footprint: without PID N's lock
/// the write is refused, and holding some other lock does not reach N's
/// region either.
#[test]
fn mem_poke_requires_the_target_tasks_lock() {
    use base64::Engine as _;
    let encode = |bytes: &[u8]| base64::engine::general_purpose::STANDARD.encode(bytes);

    let (mut exec, _clock) = new_exec();
    let mut s1 = open_session(&mut exec);
    let mut s2 = ConnCtx::new("rival");
    rpc_ok(&mut exec, &mut s2, "session.open", json!({ "want_locks": [] }));

    let a = load_rpc(&mut exec, &mut s1, &spin_image(), "a");
    let b = load_rpc(&mut exec, &mut s2, &spin_image(), "b");
    let a_addr = a["code_base"].clone();

    // S2 holds only B's lock: naming A is refused outright.
    let frame = rpc(
        &mut exec,
        &mut s2,
        "mem.poke",
        json!({ "pid": a["pid"], "addr": a_addr.clone(), "data": encode(&[0, 0]) }),
    );
    assert_eq!(frame["ok"], false);
    assert_eq!(frame["error"]["kind"], "pid_locked");

    // Nor does B's lock reach into A's region.
    let frame = rpc(
        &mut exec,
        &mut s2,
        "mem.poke",
        json!({ "pid": b["pid"], "addr": a_addr.clone(), "data": encode(&[0, 0]) }),
    );
    assert_eq!(frame["ok"], false);
    assert_eq!(frame["error"]["kind"], "vm_error");

    // The lock holder writes inside its own footprint.
    let result = rpc_ok(
        &mut exec,
        &mut s1,
        "mem.poke",
        json!({ "pid": a["pid"], "addr": a_addr, "data": encode(&[0, 0]) }),
    );
    assert_eq!(result["written"], 2);
}

/// RPCs without a session are rejected with `session_required`.
#[test]
fn session_required_for_control() {
    let (mut exec, _clock) = new_exec();
    let mut ctx = ConnCtx::new("anon");
    let frame = rpc(&mut exec, &mut ctx, "events.subscribe", json!({}));
    assert_eq!(frame["error"]["kind"], "session_required");
    let frame = rpc(&mut exec, &mut ctx, "clock.step", json!({}));
    assert_eq!(frame["error"]["kind"], "session_required");
    // Unknown ops are called out as such.
    let frame = rpc(&mut exec, &mut ctx, "no.such.op", json!({}));
    assert_eq!(frame["error"]["kind"], "unsupported_category");
}

/// Scenario: the event queue overflows while the client never ACKs; the
/// next delivery is a `slow_consumer` warning followed by the survivors,
/// in order.
#[test]
fn slow_consumer_warning_precedes_survivors() {
    let (mut exec, _clock) = new_exec();
    let mut ctx = ConnCtx::new("test");
    let result = rpc_ok(&mut exec, &mut ctx, "session.open", json!({ "want_locks": [] }));
    let capacity = result["max_events_per_sub"].as_u64().unwrap();
    rpc_ok(&mut exec, &mut ctx, "events.subscribe", json!({"kinds": ["trace_step"]}));

    load_rpc(&mut exec, &mut ctx, &spin_image(), "spin");
    // Twice the queue capacity in trace events without a drain.
    rpc_ok(&mut exec, &mut ctx, "clock.step", json!({ "n": capacity * 2 }));

    let frames = drain(&exec, &ctx);
    assert_eq!(frames[0]["type"], "warning");
    assert_eq!(frames[0]["data"]["reason"], "slow_consumer");
    assert_eq!(frames[0]["data"]["dropped"], capacity);
    assert_eq!(frames[0]["data"]["pending"], capacity);
    assert_eq!(frames.len() as u64, capacity + 1);

    let seqs: Vec<u64> = frames[1..]
        .iter()
        .map(|f| f["seq"].as_u64().unwrap())
        .collect();
    let mut expected = seqs.clone();
    expected.sort_unstable();
    assert_eq!(seqs, expected, "survivors arrive in seq order");
    assert_eq!(
        frames[0]["seq"].as_u64().unwrap() + 1,
        seqs[0],
        "warning slots in immediately before the survivors"
    );
}

/// ACKs advance monotonically and never regress the cursor.
#[test]
fn ack_cursor_is_monotonic() {
    let (mut exec, _clock) = new_exec();
    let mut ctx = open_session(&mut exec);
    let sub = rpc_ok(&mut exec, &mut ctx, "events.subscribe", json!({"kinds": ["trace_step"]}))
        ["sub_id"]
        .as_u64()
        .unwrap();

    load_rpc(&mut exec, &mut ctx, &spin_image(), "spin");
    rpc_ok(&mut exec, &mut ctx, "clock.step", json!({ "n": 6 }));
    let delivered = drain(&exec, &ctx).len() as u64;
    assert_eq!(delivered, 6);

    let acked = rpc_ok(
        &mut exec,
        &mut ctx,
        "events.ack",
        json!({ "sub_id": sub, "up_to_seq": 4 }),
    );
    assert_eq!(acked["acked"], 4);
    let acked = rpc_ok(
        &mut exec,
        &mut ctx,
        "events.ack",
        json!({ "sub_id": sub, "up_to_seq": 2 }),
    );
    assert_eq!(acked["acked"], 4, "regressive ACK is clamped");
}

/// Scenario: reconnect with `since_seq` replays the still-buffered tail.
#[test]
fn reconnect_replays_since_seq() {
    let (mut exec, _clock) = new_exec();
    let mut ctx = open_session(&mut exec);
    let sid = ctx.session.unwrap();
    rpc_ok(&mut exec, &mut ctx, "events.subscribe", json!({"kinds": ["trace_step"]}));

    load_rpc(&mut exec, &mut ctx, &spin_image(), "spin");
    rpc_ok(&mut exec, &mut ctx, "clock.step", json!({ "n": 10 }));
    assert_eq!(drain(&exec, &ctx).len(), 10);

    // Connection drops; the client saw up to seq 4 (its own claim).
    exec.sessions_handle().lock().disconnect(sid);
    let mut back = ConnCtx::new("reconnect");
    let info = rpc_ok(
        &mut exec,
        &mut back,
        "session.open",
        json!({ "resume": sid, "since_seq": 4 }),
    );
    assert_eq!(info["id"].as_u64().unwrap(), sid as u64);

    let frames = drain(&exec, &back);
    let seqs: Vec<u64> = frames.iter().map(|f| f["seq"].as_u64().unwrap()).collect();
    assert_eq!(seqs, vec![5, 6, 7, 8, 9, 10]);
}

/// Keepalive lapse closes the session and releases its locks.
#[test]
fn keepalive_lapse_releases_locks() {
    let (mut exec, clock) = new_exec();
    let mut ctx = open_session(&mut exec);
    let pid = load_rpc(&mut exec, &mut ctx, &spin_image(), "spin")["pid"]
        .as_u64()
        .unwrap();

    // Keepalives hold the session open.
    clock.advance(4000);
    exec.housekeeping();
    rpc_ok(&mut exec, &mut ctx, "session.keepalive", json!({}));
    clock.advance(4000);
    exec.housekeeping();
    rpc_ok(&mut exec, &mut ctx, "session.keepalive", json!({}));

    // A lapse sweeps the session away.
    clock.advance(6000);
    exec.housekeeping();
    let frame = rpc(&mut exec, &mut ctx, "session.keepalive", json!({}));
    assert_eq!(frame["error"]["kind"], "session_required");

    // The lock is free again for a new session.
    let mut fresh = ConnCtx::new("fresh");
    let info = rpc_ok(
        &mut exec,
        &mut fresh,
        "session.open",
        json!({ "want_locks": [pid] }),
    );
    assert_eq!(info["granted_locks"], json!([pid]));
}

/// `session.close` is idempotent.
#[test]
fn close_is_idempotent() {
    let (mut exec, _clock) = new_exec();
    let mut ctx = open_session(&mut exec);
    rpc_ok(&mut exec, &mut ctx, "session.close", json!({}));
    rpc_ok(&mut exec, &mut ctx, "session.close", json!({}));
}
