//! Executive-core SVC handlers (module 0x06).

use serde_json::json;

use hsx_abi::{EXEC_EXIT, EXEC_GET_VERSION, EXEC_SESSION_COUNT, EXEC_SLEEP_MS, EXEC_VERSION_MAJOR,
    EXEC_VERSION_MINOR, EXEC_YIELD, status};

use crate::event::{Event, EventKind};
use crate::exec::Executive;
use crate::task::{Pid, WaitReason};

use super::{args, complete, set_reg};

pub(super) fn dispatch(exec: &mut Executive, pid: Pid, function: u8) {
    match function {
        EXEC_GET_VERSION => {
            set_reg(
                exec,
                pid,
                1,
                ((EXEC_VERSION_MAJOR as u32) << 16) | EXEC_VERSION_MINOR as u32,
            );
            complete(exec, pid, status::OK);
        }
        EXEC_EXIT => {
            let [code, ..] = args(exec, pid);
            exec.exit_task(pid, code as i32);
        }
        EXEC_SLEEP_MS => {
            let [ms, ..] = args(exec, pid);
            // R0 is written before parking; the task resumes past the SVC
            // once the deadline wakes it.
            complete(exec, pid, status::OK);
            if ms > 0 {
                let deadline = exec.now_ms() + ms as u64;
                exec.block_task(pid, WaitReason::Sleep { deadline });
            }
        }
        EXEC_YIELD => {
            exec.emit(Event::new(
                EventKind::Scheduler,
                Some(pid),
                json!({ "op": "yield" }),
            ));
            complete(exec, pid, status::OK);
        }
        EXEC_SESSION_COUNT => {
            let count = exec.sessions.lock().count() as u32;
            set_reg(exec, pid, 1, count);
            complete(exec, pid, status::OK);
        }
        _ => complete(exec, pid, status::ENOSYS),
    }
}
