//! Command registry operations.
//!
//! Commands are parameterless actions. Host-registered commands run a
//! closure synchronously; task-registered commands deliver an invocation
//! frame to the owner's `pid:<n>.cmd` mailbox (the SVC layer performs the
//! actual post so this module stays free of mailbox state).

use thiserror::Error;

use hsx_abi::{ENTRY_ASYNC, ENTRY_PIN, MAX_COMMANDS, status};

use crate::task::Pid;

use super::pool::{DescNode, PoolError};
use super::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CmdError {
    #[error("no such command")]
    NoEnt,
    #[error("auth token rejected")]
    Perm,
    #[error("command table full")]
    NoSpace,
    #[error("invalid argument")]
    Invalid,
    #[error("command already registered")]
    Exists,
    #[error("command does not support async completion")]
    NoAsync,
    #[error("handler failed")]
    Fail,
}

impl CmdError {
    pub fn status(self) -> u32 {
        match self {
            CmdError::NoEnt => status::ENOENT,
            CmdError::Perm => status::EPERM,
            CmdError::NoSpace => status::ENOSPC,
            CmdError::Invalid => status::EINVAL,
            CmdError::Exists => status::EEXIST,
            CmdError::NoAsync => status::ENOASYNC,
            CmdError::Fail => status::EFAIL,
        }
    }
}

impl From<PoolError> for CmdError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::NoSpace => CmdError::NoSpace,
            PoolError::Invalid => CmdError::Invalid,
        }
    }
}

/// How a command executes.
pub enum CmdHandler {
    /// Executive-side closure; runs synchronously, returns the rc.
    Host(Box<dyn FnMut() -> u32 + Send>),
    /// Task-side handler; invocation frames go to the owner's command
    /// mailbox.
    Task,
}

pub(crate) struct CommandEntry {
    pub flags: u8,
    pub pin: u32,
    pub owner_pid: Pid,
    pub desc_head: u16,
    pub handler: CmdHandler,
}

/// Result of `CMD_CALL` / `CMD_CALL_ASYNC`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CallOutcome {
    pub rc: u32,
    /// Task-owned command: post an invocation frame to this owner.
    pub post_owner: Option<Pid>,
}

impl Registry {
    /// `CMD_REGISTER` from a task.
    pub fn cmd_register(
        &mut self,
        caller: Pid,
        oid: u16,
        flags: u8,
        desc_head: u16,
    ) -> Result<u16, CmdError> {
        self.cmd_insert(caller, oid, flags, 0, desc_head, CmdHandler::Task)
    }

    /// Register an executive-side command.
    pub fn cmd_register_host(
        &mut self,
        oid: u16,
        flags: u8,
        pin: u32,
        desc_head: u16,
        handler: Box<dyn FnMut() -> u32 + Send>,
    ) -> Result<u16, CmdError> {
        self.cmd_insert(
            crate::mailbox::HOST_PID,
            oid,
            flags,
            pin,
            desc_head,
            CmdHandler::Host(handler),
        )
    }

    fn cmd_insert(
        &mut self,
        owner: Pid,
        oid: u16,
        flags: u8,
        pin: u32,
        desc_head: u16,
        handler: CmdHandler,
    ) -> Result<u16, CmdError> {
        if self.commands.contains_key(&oid) {
            return Err(CmdError::Exists);
        }
        if self.commands.len() >= MAX_COMMANDS {
            return Err(CmdError::NoSpace);
        }
        self.commands.insert(
            oid,
            CommandEntry {
                flags,
                pin,
                owner_pid: owner,
                desc_head,
                handler,
            },
        );
        if let Some(name) = self.command_name(oid) {
            self.command_names.insert(name, oid);
        }
        Ok(oid)
    }

    /// `CMD_LOOKUP` by Name descriptor text.
    pub fn cmd_lookup(&self, name: &str) -> Option<u16> {
        self.command_names.get(name).copied()
    }

    /// `CMD_CALL`. `wants_async` distinguishes `CMD_CALL_ASYNC`, which is
    /// only legal on commands carrying the ASYNC flag.
    pub fn cmd_call(
        &mut self,
        oid: u16,
        auth_token: u32,
        wants_async: bool,
    ) -> Result<CallOutcome, CmdError> {
        let entry = self.commands.get_mut(&oid).ok_or(CmdError::NoEnt)?;
        if entry.flags & ENTRY_PIN != 0 && auth_token != entry.pin {
            return Err(CmdError::Perm);
        }
        if wants_async && entry.flags & ENTRY_ASYNC == 0 {
            return Err(CmdError::NoAsync);
        }
        match &mut entry.handler {
            CmdHandler::Host(f) => Ok(CallOutcome {
                rc: f(),
                post_owner: None,
            }),
            CmdHandler::Task => Ok(CallOutcome {
                rc: status::OK,
                post_owner: Some(entry.owner_pid),
            }),
        }
    }

    /// `CMD_HELP`: the Name descriptor text (empty when undescribed).
    pub fn cmd_help(&self, oid: u16) -> Result<String, CmdError> {
        if !self.commands.contains_key(&oid) {
            return Err(CmdError::NoEnt);
        }
        Ok(self.command_name(oid).unwrap_or_default())
    }

    /// The Name descriptor text for a command OID.
    pub fn command_name(&self, oid: u16) -> Option<String> {
        let head = self.commands.get(&oid)?.desc_head;
        self.pool
            .find(head, |n| match n {
                DescNode::Name(r) => Some(*r),
                _ => None,
            })
            .map(|r| self.pool.strings.get(r).to_string())
    }
}
