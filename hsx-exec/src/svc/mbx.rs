//! Mailbox SVC handlers (module 0x05).

use serde_json::json;
use zerocopy::IntoBytes;

use hsx_abi::{FRAME_OVERRUN, FRAME_STDERR, FRAME_STDOUT, MBX_CLOSE, MBX_OPEN, MBX_PEEK, MBX_RECV,
    MBX_SEND, MBX_TAP, MBX_BIND, STDIO_ERR, STDIO_OUT, TIMEOUT_INFINITE, TIMEOUT_POLL, status};

use crate::event::{Event, EventKind};
use crate::exec::Executive;
use crate::mailbox::{RecvInfo, RecvOutcome, SendOutcome};
use crate::task::{Pid, WaitReason};

use super::{args, complete, guest_str, rewind_svc, set_reg};

pub(super) fn dispatch(exec: &mut Executive, pid: Pid, function: u8) {
    match function {
        MBX_OPEN => open(exec, pid),
        MBX_BIND => bind(exec, pid),
        MBX_SEND => send(exec, pid),
        MBX_RECV => recv(exec, pid),
        MBX_PEEK => peek(exec, pid),
        MBX_TAP => tap(exec, pid),
        MBX_CLOSE => close(exec, pid),
        _ => complete(exec, pid, status::ENOSYS),
    }
}

fn open(exec: &mut Executive, pid: Pid) {
    let [name_ptr, name_len, mode, ..] = args(exec, pid);
    let Some(name) = guest_str(exec, name_ptr, name_len) else {
        return complete(exec, pid, status::EINVAL);
    };
    match exec.mailboxes.open(pid, &name, mode) {
        Ok(handle) => {
            set_reg(exec, pid, 1, handle);
            complete(exec, pid, status::OK);
        }
        Err(e) => complete(exec, pid, e.status()),
    }
}

fn bind(exec: &mut Executive, pid: Pid) {
    let [name_ptr, name_len, capacity, mode, _] = args(exec, pid);
    let Some(name) = guest_str(exec, name_ptr, name_len) else {
        return complete(exec, pid, status::EINVAL);
    };
    match exec.mailboxes.bind(pid, &name, capacity as usize, mode) {
        Ok(handle) => {
            set_reg(exec, pid, 1, handle);
            complete(exec, pid, status::OK);
        }
        Err(e) => complete(exec, pid, e.status()),
    }
}

fn send(exec: &mut Executive, pid: Pid) {
    let [handle, buf, len, packed, _] = args(exec, pid);
    let flags = packed as u16;
    let channel = (packed >> 16) as u16;
    let payload = match exec.arena.read_bytes(buf, len) {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => return complete(exec, pid, status::EINVAL),
    };
    let now = exec.now_ms();
    match exec.mailboxes.send(pid, handle, &payload, flags, channel, now) {
        Ok(SendOutcome::Sent {
            seq,
            bytes,
            name,
            wake,
        }) => {
            exec.emit(Event::new(
                EventKind::MailboxSend,
                Some(pid),
                json!({
                    "mailbox": name,
                    "handle": handle,
                    "length": bytes,
                    "channel": channel,
                    "flags": flags,
                    "seq": seq,
                }),
            ));
            // stdio frames double as stdout/stderr debug events.
            if name == STDIO_OUT || flags & FRAME_STDOUT != 0 {
                exec.emit_stdio(pid, EventKind::Stdout, &payload);
            } else if name == STDIO_ERR || flags & FRAME_STDERR != 0 {
                exec.emit_stdio(pid, EventKind::Stderr, &payload);
            }
            exec.apply_wakes(&wake, &name);
            set_reg(exec, pid, 1, bytes as u32);
            complete(exec, pid, status::OK);
        }
        Ok(SendOutcome::MustBlock) => {
            let name = exec
                .mailboxes
                .handle_name(pid, handle)
                .unwrap_or_default()
                .to_string();
            let _ = exec.mailboxes.add_send_waiter(pid, handle);
            announce_wait(exec, pid, &name, handle, "send");
            rewind_svc(exec, pid);
            exec.block_task(pid, WaitReason::SendBlocked { handle });
        }
        Err(e) => {
            emit_mbx_error(exec, pid, handle, "send", e.status());
            complete(exec, pid, e.status())
        }
    }
}

fn recv(exec: &mut Executive, pid: Pid) {
    let [handle, buf, maxlen, timeout, info_ptr] = args(exec, pid);
    // Validate the destination buffer up front: a destructive RECV must
    // not consume a message it cannot deliver.
    if exec.arena.read_bytes(buf, maxlen).is_err() {
        return complete(exec, pid, status::EINVAL);
    }
    match exec.mailboxes.recv(pid, handle, maxlen as usize) {
        Ok(RecvOutcome::Message {
            msg,
            overrun,
            name,
            wake,
        }) => {
            if exec.arena.write_bytes(buf, &msg.payload).is_err() {
                return complete(exec, pid, status::EINVAL);
            }
            let mut flags = msg.flags;
            if overrun {
                flags |= FRAME_OVERRUN;
            }
            if info_ptr != 0 {
                let info = RecvInfo {
                    seq: msg.seq,
                    src_pid: msg.src_pid,
                    channel: msg.channel,
                    flags,
                    reserved: 0,
                };
                if exec.arena.write_bytes(info_ptr, info.as_bytes()).is_err() {
                    return complete(exec, pid, status::EINVAL);
                }
            }
            exec.emit(Event::new(
                EventKind::MailboxRecv,
                Some(pid),
                json!({
                    "mailbox": name,
                    "handle": handle,
                    "length": msg.payload.len(),
                    "channel": msg.channel,
                    "flags": flags,
                    "seq": msg.seq,
                }),
            ));
            exec.apply_wakes(&wake, &name);
            set_reg(exec, pid, 1, msg.payload.len() as u32);
            complete(exec, pid, status::OK);
        }
        Ok(RecvOutcome::Empty) => {
            if timeout == TIMEOUT_POLL {
                return complete(exec, pid, status::NO_DATA);
            }
            let now = exec.now_ms();
            // A retried RECV keeps its original deadline.
            let deadline = match exec.sched.task_mut(pid).and_then(|t| t.svc_deadline.take()) {
                Some(deadline) => Some(deadline),
                None if timeout == TIMEOUT_INFINITE => None,
                None => Some(now + timeout as u64),
            };
            if let Some(d) = deadline {
                if now >= d {
                    let name = exec
                        .mailboxes
                        .handle_name(pid, handle)
                        .unwrap_or_default()
                        .to_string();
                    exec.emit(Event::new(
                        EventKind::MailboxTimeout,
                        Some(pid),
                        json!({ "mailbox": name, "handle": handle, "op": "recv" }),
                    ));
                    return complete(exec, pid, status::TIMEOUT);
                }
            }
            let name = exec
                .mailboxes
                .handle_name(pid, handle)
                .unwrap_or_default()
                .to_string();
            let _ = exec.mailboxes.add_recv_waiter(pid, handle);
            if let Some(task) = exec.sched.task_mut(pid) {
                task.svc_deadline = deadline;
            }
            announce_wait(exec, pid, &name, handle, "recv");
            rewind_svc(exec, pid);
            exec.block_task(pid, WaitReason::Recv { handle, deadline });
        }
        Err(e) => {
            emit_mbx_error(exec, pid, handle, "recv", e.status());
            complete(exec, pid, e.status())
        }
    }
}

fn peek(exec: &mut Executive, pid: Pid) {
    let [handle, ..] = args(exec, pid);
    match exec.mailboxes.peek(pid, handle) {
        Ok((depth, bytes, head_seq)) => {
            set_reg(exec, pid, 1, depth);
            set_reg(exec, pid, 2, bytes);
            set_reg(exec, pid, 3, head_seq);
            complete(exec, pid, status::OK);
        }
        Err(e) => complete(exec, pid, e.status()),
    }
}

fn tap(exec: &mut Executive, pid: Pid) {
    let [handle, enable, ..] = args(exec, pid);
    match exec.mailboxes.tap(pid, handle, enable != 0) {
        Ok(wake) => {
            let name = exec
                .mailboxes
                .handle_name(pid, handle)
                .unwrap_or_default()
                .to_string();
            exec.apply_wakes(&wake, &name);
            complete(exec, pid, status::OK);
        }
        Err(e) => complete(exec, pid, e.status()),
    }
}

fn close(exec: &mut Executive, pid: Pid) {
    let [handle, ..] = args(exec, pid);
    let name = exec
        .mailboxes
        .handle_name(pid, handle)
        .unwrap_or_default()
        .to_string();
    match exec.mailboxes.close(pid, handle) {
        Ok(wake) => {
            exec.apply_wakes(&wake, &name);
            complete(exec, pid, status::OK);
        }
        Err(e) => complete(exec, pid, e.status()),
    }
}

/// Emit the blocking `mailbox_wait` event once per logical wait.
fn announce_wait(exec: &mut Executive, pid: Pid, name: &str, handle: u32, op: &str) {
    let announced = exec
        .sched
        .task(pid)
        .map(|t| t.wait_announced)
        .unwrap_or(true);
    if announced {
        return;
    }
    if let Some(task) = exec.sched.task_mut(pid) {
        task.wait_announced = true;
    }
    exec.emit(Event::new(
        EventKind::MailboxWait,
        Some(pid),
        json!({ "mailbox": name, "handle": handle, "op": op }),
    ));
}

fn emit_mbx_error(exec: &mut Executive, pid: Pid, handle: u32, op: &str, code: u32) {
    exec.emit(Event::new(
        EventKind::MailboxError,
        Some(pid),
        json!({
            "handle": handle,
            "op": op,
            "code": code,
            "error": status::name(code),
        }),
    ));
}
