//! End-to-end control channel: a real TCP client driving a live executive.

mod common;

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use base64::Engine as _;
use common::Asm;
use crossbeam_channel::unbounded;
use serde_json::{Value, json};

use hsx_exec::exec::{ExecConfig, ExecMsg, Executive};
use hsx_exec::persist::MemStore;
use hsx_exec::time::SystemClock;

struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    next_id: u64,
}

impl Client {
    fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to endpoint");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self {
            stream,
            reader,
            next_id: 1,
        }
    }

    fn read_frame(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read frame");
        serde_json::from_str(&line).expect("frame is JSON")
    }

    /// Send a request and wait for its response, collecting any event
    /// frames that arrive in between.
    fn call(&mut self, op: &str, args: Value) -> (Value, Vec<Value>) {
        let id = self.next_id;
        self.next_id += 1;
        let line = json!({ "id": id, "op": op, "args": args }).to_string();
        self.stream.write_all(line.as_bytes()).unwrap();
        self.stream.write_all(b"\n").unwrap();

        let mut events = Vec::new();
        loop {
            let frame = self.read_frame();
            if frame["ev"] == true {
                events.push(frame);
                continue;
            }
            assert_eq!(frame["id"], id, "correlation id must match");
            return (frame, events);
        }
    }

    fn call_ok(&mut self, op: &str, args: Value) -> (Value, Vec<Value>) {
        let (frame, events) = self.call(op, args);
        assert_eq!(frame["ok"], true, "rpc {op} failed: {frame}");
        (frame["result"].clone(), events)
    }

    /// Wait for an event of the given type, skipping others.
    fn wait_event(&mut self, ty: &str) -> Value {
        loop {
            let frame = self.read_frame();
            if frame["ev"] == true && frame["type"] == ty {
                return frame;
            }
        }
    }
}

fn start_server() -> std::net::SocketAddr {
    let exec = Executive::new(
        ExecConfig::default(),
        Box::new(SystemClock::new()),
        Box::new(MemStore::new()),
    );
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().unwrap();
    let sessions = exec.sessions_handle();
    let (tx, rx) = unbounded::<ExecMsg>();
    thread::spawn(move || hsx_exec::endpoint::serve(listener, tx, sessions));
    thread::spawn(move || exec.run(rx));
    addr
}

/// Full debugging session over the wire: open, load, subscribe, step to a
/// BRK, inspect registers, close.
#[test]
fn tcp_session_load_step_and_inspect() {
    let addr = start_server();
    let mut client = Client::connect(addr);

    let (session, _) = client.call_ok("session.open", json!({ "want_locks": [] }));
    assert!(session["heartbeat_ms"].as_u64().unwrap() > 0);

    let image = Asm::new().mov_imm(1, 42).brk().image();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&image);
    let (load, _) = client.call_ok("task.load", json!({ "image": encoded, "name": "demo" }));
    let pid = load["pid"].as_u64().unwrap();

    client.call_ok("events.subscribe", json!({ "kinds": ["debug_break"] }));
    let (_, events) = client.call_ok("clock.step", json!({ "n": 2 }));

    // The break event may beat the step response onto the wire.
    let ev = events
        .into_iter()
        .find(|e| e["type"] == "debug_break")
        .unwrap_or_else(|| client.wait_event("debug_break"));
    assert_eq!(ev["data"]["reason"], "BRK");
    assert_eq!(ev["pid"].as_u64().unwrap(), pid);

    let (regs, _) = client.call_ok("regs.get", json!({ "pid": pid }));
    assert_eq!(regs["regs"][1], 42);

    let (list, _) = client.call_ok("task.list", json!({}));
    assert_eq!(list["tasks"][0]["state"], "paused");

    client.call_ok("session.close", json!({}));
}

/// Malformed lines get an error response without killing the connection.
#[test]
fn malformed_request_reports_bad_request() {
    let addr = start_server();
    let mut client = Client::connect(addr);

    client.stream.write_all(b"this is not json\n").unwrap();
    let frame = client.read_frame();
    assert_eq!(frame["ok"], false);
    assert_eq!(frame["error"]["kind"], "bad_request");

    // Connection still works.
    let (result, _) = client.call_ok("clock.status", json!({}));
    assert_eq!(result["tasks"], 0);
}

/// Two clients: the second cannot lock what the first holds, and events
/// keep flowing to the first while the second observes.
#[test]
fn tcp_lock_conflict_between_clients() {
    let addr = start_server();
    let mut holder = Client::connect(addr);
    let mut rival = Client::connect(addr);

    holder.call_ok("session.open", json!({ "want_locks": [] }));
    let image = Asm::new().br(-4).image();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&image);
    let (load, _) = holder.call_ok("task.load", json!({ "image": encoded, "name": "spin" }));
    let pid = load["pid"].as_u64().unwrap();

    let (frame, _) = rival.call("session.open", json!({ "want_locks": [pid] }));
    assert_eq!(frame["ok"], false);
    assert_eq!(frame["error"]["kind"], "pid_locked");

    // Observer rides along.
    rival.call_ok("session.open", json!({}));
    rival.call_ok(
        "events.subscribe",
        json!({ "kinds": ["trace_step"], "pids": [pid] }),
    );
    holder.call_ok("clock.step", json!({ "n": 3 }));
    let ev = rival.wait_event("trace_step");
    assert_eq!(ev["pid"].as_u64().unwrap(), pid);
    assert!(ev["seq"].as_u64().unwrap() >= 1);
}
