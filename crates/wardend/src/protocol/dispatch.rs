//! Command codes, handler trait, and the dispatch table.
//!
//! Each inbound request carries a `u16` task code. The table maps the
//! code to a handler plus the privilege it requires; the connection
//! driver checks privilege BEFORE the handler reads any arguments, so
//! an unprivileged caller never drives privileged argument parsing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::grants::AccessKeyRegistry;

use super::auth::Privilege;
use super::error::HandlerError;
use super::wire::RequestReader;

/// Task code carried on the wire for each request.
pub type TaskCode = u16;

/// Reserved task code: orderly session termination.
pub const TASK_QUIT: TaskCode = 0;

/// Privilege a task demands of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredPrivilege {
    /// Any authenticated session may run this task.
    Any,
    /// Only sessions holding the daemon key may run this task.
    MasterOnly,
}

impl RequiredPrivilege {
    /// Whether `privilege` satisfies this requirement.
    #[must_use]
    pub const fn permits(self, privilege: Privilege) -> bool {
        match self {
            Self::Any => true,
            Self::MasterOnly => privilege.is_master(),
        }
    }
}

/// Per-request context handed to handlers.
pub struct RequestContext<'a> {
    /// Privilege level of the calling session.
    pub privilege: Privilege,
    /// Remote address of the calling session.
    pub peer_addr: SocketAddr,
    /// Shared one-time access key registry.
    pub grants: &'a AccessKeyRegistry,
}

/// A command handler.
///
/// The handler reads its own arguments from the request stream (the
/// argument shape is part of the task's contract) and returns the
/// encoded success payload. The connection driver writes the reply
/// marker; handlers only produce what follows it.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Serve one request.
    ///
    /// # Errors
    ///
    /// [`HandlerError::Command`] fails this request only;
    /// [`HandlerError::Fatal`] tears down the connection. Argument
    /// decode errors are fatal: once a handler has partially read its
    /// arguments the stream position is unrecoverable.
    async fn handle(
        &self,
        request: &mut RequestReader,
        ctx: &RequestContext<'_>,
    ) -> Result<Vec<u8>, HandlerError>;
}

/// One registered task.
#[derive(Clone)]
pub struct DispatchEntry {
    /// Privilege required to invoke the task.
    pub privilege: RequiredPrivilege,
    /// The handler implementation.
    pub handler: Arc<dyn CommandHandler>,
}

/// Immutable task-code-to-handler table, built once at startup and
/// shared by every connection.
#[derive(Default)]
pub struct DispatchTable {
    entries: HashMap<TaskCode, DispatchEntry>,
}

impl DispatchTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `code`.
    ///
    /// # Panics
    ///
    /// Panics if `code` is [`TASK_QUIT`] or already registered; both
    /// are startup-time wiring bugs.
    pub fn register(
        &mut self,
        code: TaskCode,
        privilege: RequiredPrivilege,
        handler: Arc<dyn CommandHandler>,
    ) {
        assert_ne!(code, TASK_QUIT, "task code 0 is reserved for quit");
        let previous = self
            .entries
            .insert(code, DispatchEntry { privilege, handler });
        assert!(previous.is_none(), "task code {code} registered twice");
    }

    /// Look up the entry for `code`, if any.
    #[must_use]
    pub fn lookup(&self, code: TaskCode) -> Option<&DispatchEntry> {
        self.entries.get(&code)
    }

    /// Registered task codes, for startup logging.
    pub fn codes(&self) -> impl Iterator<Item = TaskCode> + '_ {
        self.entries.keys().copied()
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut codes: Vec<_> = self.entries.keys().collect();
        codes.sort_unstable();
        f.debug_struct("DispatchTable").field("codes", &codes).finish()
    }
}
