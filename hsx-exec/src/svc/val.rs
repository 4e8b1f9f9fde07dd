//! Value registry SVC handlers (module 0x07).

use hsx_abi::{VAL_GET, VAL_LIST, VAL_LOOKUP, VAL_PERSIST, VAL_REGISTER, VAL_SET, VAL_SUB, status};

use crate::exec::Executive;
use crate::registry::NO_NODE;
use crate::task::Pid;

use super::{args, complete, guest_str, set_reg};

/// Largest guest descriptor chain the registry will read.
const MAX_CHAIN_BYTES: u32 = 256;

pub(super) fn dispatch(exec: &mut Executive, pid: Pid, function: u8) {
    match function {
        VAL_REGISTER => register(exec, pid),
        VAL_LOOKUP => lookup(exec, pid),
        VAL_GET => get(exec, pid),
        VAL_SET => set(exec, pid),
        VAL_LIST => list(exec, pid),
        VAL_SUB => subscribe(exec, pid),
        VAL_PERSIST => persist(exec, pid),
        _ => complete(exec, pid, status::ENOSYS),
    }
}

/// Read and parse a guest descriptor chain; `0` means "no descriptors".
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
        .map_err(|e| crate::registry::ValError::from(e).status())
}

fn register(exec: &mut Executive, pid: Pid) {
    let [oid, flags, desc_ptr, ..] = args(exec, pid);
    let head = match guest_chain(exec, desc_ptr) {
        Ok(head) => head,
        Err(code) => return complete(exec, pid, code),
    };
    match exec
        .registry
        .val_register(pid, oid as u16, flags as u8, head)
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
    match exec.registry.val_lookup(&name) {
        Some(oid) => {
            set_reg(exec, pid, 1, oid as u32);
            complete(exec, pid, status::OK);
        }
        None => complete(exec, pid, status::ENOENT),
    }
}

fn get(exec: &mut Executive, pid: Pid) {
    let [oid, ..] = args(exec, pid);
    match exec.registry.val_get(oid as u16) {
        Ok(bits) => {
            set_reg(exec, pid, 1, bits as u32);
            complete(exec, pid, status::OK);
        }
        Err(e) => complete(exec, pid, e.status()),
    }
}

fn set(exec: &mut Executive, pid: Pid) {
    let [oid, bits, _flags, ..] = args(exec, pid);
    match exec.apply_value_set(pid, oid as u16, bits as u16) {
        Ok(_) => complete(exec, pid, status::OK),
        Err(code) => complete(exec, pid, code),
    }
}

fn list(exec: &mut Executive, pid: Pid) {
    let [group_filter, out_ptr, max, ..] = args(exec, pid);
    let oids = exec.registry.val_list(group_filter, max as usize);
    let mut at = out_ptr;
    for oid in &oids {
        if exec.arena.write_u16(at, *oid).is_err() {
            return complete(exec, pid, status::EINVAL);
        }
        at += 2;
    }
    set_reg(exec, pid, 1, oids.len() as u32);
    complete(exec, pid, status::OK);
}

fn subscribe(exec: &mut Executive, pid: Pid) {
    let [oid, handle, _flags, ..] = args(exec, pid);
    let name = match exec.mailboxes.handle_name(pid, handle) {
        Ok(name) => name.to_string(),
        Err(e) => return complete(exec, pid, e.status()),
    };
    match exec.registry.val_subscribe(oid as u16, name) {
        Ok(()) => complete(exec, pid, status::OK),
        Err(e) => complete(exec, pid, e.status()),
    }
}

fn persist(exec: &mut Executive, pid: Pid) {
    let [oid, mode, ..] = args(exec, pid);
    match exec.registry.val_persist(oid as u16, mode) {
        Ok(()) => complete(exec, pid, status::OK),
        Err(e) => complete(exec, pid, e.status()),
    }
}
