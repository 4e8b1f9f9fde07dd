//! Command registry SVC handlers (module 0x08).

use hsx_abi::{CMD_CALL, CMD_CALL_ASYNC, CMD_HELP, CMD_LOOKUP, CMD_REGISTER, status};

use crate::exec::Executive;
use crate::registry::NO_NODE;
use crate::task::Pid;

use super::{args, complete, guest_str, set_reg};

const MAX_CHAIN_BYTES: u32 = 256;

/// Channel tag on command invocation and completion frames.
pub(crate) const CMD_CHANNEL: u16 = 0xC0;

pub(super) fn dispatch(exec: &mut Executive, pid: Pid, function: u8) {
    match function {
        CMD_REGISTER => register(exec, pid),
        CMD_LOOKUP => lookup(exec, pid),
        CMD_CALL => call(exec, pid, false),
        CMD_CALL_ASYNC => call(exec, pid, true),
        CMD_HELP => help(exec, pid),
        _ => complete(exec, pid, status::ENOSYS),
    }
}

fn guest_chain(exec: &mut Executive, desc_ptr: u32) -> Result<u16, u32> {
    if desc_ptr == 0 {
        return Ok(NO_NODE);
    }
    let avail = (exec.arena.size() as u32).saturating_sub(desc_ptr);
    let window = avail.min(MAX_CHAIN_BYTES);
    if window == 0 {
        return Err(status::EINVAL);
    }
    let bytes = exec
        .arena
        .read_bytes(desc_ptr, window)
        .map_err(|_| status::EINVAL)?
        .to_vec();
    exec.registry
        .parse_guest_chain(&bytes)
        .map_err(|e| crate::registry::CmdError::from(e).status())
}

fn register(exec: &mut Executive, pid: Pid) {
    let [oid, flags, desc_ptr, ..] = args(exec, pid);
    let head = match guest_chain(exec, desc_ptr) {
        Ok(head) => head,
        Err(code) => return complete(exec, pid, code),
    };
    match exec
        .registry
        .cmd_register(pid, oid as u16, flags as u8, head)
    {
        Ok(oid) => {
            set_reg(exec, pid, 1, oid as u32);
            complete(exec, pid, status::OK);
        }
        Err(e) => complete(exec, pid, e.status()),
    }
}

fn lookup(exec: &mut Executive, pid: Pid) {
    let [name_ptr, name_len, ..] = args(exec, pid);
    let Some(name) = guest_str(exec, name_ptr, name_len) else {
        return complete(exec, pid, status::EINVAL);
    };
    match exec.registry.cmd_lookup(&name) {
        Some(oid) => {
            set_reg(exec, pid, 1, oid as u32);
            complete(exec, pid, status::OK);
        }
        None => complete(exec, pid, status::ENOENT),
    }
}

fn call(exec: &mut Executive, pid: Pid, wants_async: bool) {
    let [oid_arg, auth_token, mbox_handle, ..] = args(exec, pid);
    let oid = oid_arg as u16;
    let outcome = match exec.registry.cmd_call(oid, auth_token, wants_async) {
        Ok(outcome) => outcome,
        Err(e) => return complete(exec, pid, e.status()),
    };

    let mut rc = outcome.rc;
    // Task-owned command: deliver the invocation frame to the owner's
    // command mailbox. A missing mailbox is the handler's failure.
    if let Some(owner) = outcome.post_owner {
        let name = format!("pid:{owner}.cmd");
        let mut frame = Vec::with_capacity(4);
        frame.extend_from_slice(&oid.to_le_bytes());
        frame.extend_from_slice(&[0, 0]);
        if exec.post_frame(&name, pid, &frame, CMD_CHANNEL).is_err() {
            rc = status::EFAIL;
        }
    }

    if wants_async {
        // Completion frame `(oid, rc)` to the caller-supplied mailbox.
        let name = match exec.mailboxes.handle_name(pid, mbox_handle) {
            Ok(name) => name.to_string(),
            Err(e) => return complete(exec, pid, e.status()),
        };
        let mut frame = Vec::with_capacity(4);
        frame.extend_from_slice(&oid.to_le_bytes());
        frame.extend_from_slice(&(rc as u16).to_le_bytes());
        let _ = exec.post_frame(&name, crate::mailbox::HOST_PID, &frame, CMD_CHANNEL);
    }

    set_reg(exec, pid, 1, rc);
    complete(exec, pid, status::OK);
}

fn help(exec: &mut Executive, pid: Pid) {
    let [oid, buf, maxlen, ..] = args(exec, pid);
    match exec.registry.cmd_help(oid as u16) {
        Ok(text) => {
            let bytes = text.as_bytes();
            let len = bytes.len().min(maxlen as usize);
            if exec.arena.write_bytes(buf, &bytes[..len]).is_err() {
                return complete(exec, pid, status::EINVAL);
            }
            set_reg(exec, pid, 1, len as u32);
            complete(exec, pid, status::OK);
        }
        Err(e) => complete(exec, pid, e.status()),
    }
}
