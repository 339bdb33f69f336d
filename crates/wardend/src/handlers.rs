//! Built-in task handlers and the standard dispatch table.
//!
//! Argument and payload shapes are part of each task's wire contract
//! and documented on the handler. Handlers read exactly their declared
//! arguments; a decode error leaves the stream position unknown and is
//! therefore connection-fatal.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::exec::{ExecCommand, ExecError};
use crate::grants::{GrantError, GRANT_PARAMS};
use crate::protocol::dispatch::{RequestContext, TaskCode};
use crate::protocol::error::{CommandError, HandlerError, ProtocolError};
use crate::protocol::wire::{put_blob, put_string, RequestReader};
use crate::protocol::{CommandHandler, DispatchTable, RequiredPrivilege};

/// Report the daemon's clock. Unprivileged.
pub const TASK_TIME: TaskCode = 1;
/// Run an external command and return its output. Master only.
pub const TASK_EXEC: TaskCode = 2;
/// Restart a managed service via the service control program. Master
/// only, and the task an access key grant typically pre-authorizes.
pub const TASK_RESTART_SERVICE: TaskCode = 3;
/// Issue a one-time access key. Master only.
pub const TASK_GRANT_ACCESS: TaskCode = 4;
/// Redeem an access key, receiving the pinned grant back. Open to
/// unprivileged sessions; the key itself is the authorization.
pub const TASK_REDEEM_ACCESS: TaskCode = 5;

/// Build the standard table with every built-in task registered.
#[must_use]
pub fn standard_table(service_control: impl Into<String>) -> DispatchTable {
    let mut table = DispatchTable::new();
    table.register(TASK_TIME, RequiredPrivilege::Any, Arc::new(TimeHandler));
    table.register(TASK_EXEC, RequiredPrivilege::MasterOnly, Arc::new(ExecHandler));
    table.register(
        TASK_RESTART_SERVICE,
        RequiredPrivilege::MasterOnly,
        Arc::new(RestartServiceHandler {
            control_program: service_control.into(),
        }),
    );
    table.register(
        TASK_GRANT_ACCESS,
        RequiredPrivilege::MasterOnly,
        Arc::new(GrantAccessHandler),
    );
    table.register(
        TASK_REDEEM_ACCESS,
        RequiredPrivilege::Any,
        Arc::new(RedeemAccessHandler),
    );
    table
}

/// `TASK_TIME`: no arguments; payload is the daemon's current Unix
/// timestamp in seconds as an `i64`.
struct TimeHandler;

#[async_trait]
impl CommandHandler for TimeHandler {
    async fn handle(
        &self,
        _request: &mut RequestReader,
        _ctx: &RequestContext<'_>,
    ) -> Result<Vec<u8>, HandlerError> {
        let now = chrono::Utc::now().timestamp();
        Ok(now.to_be_bytes().to_vec())
    }
}

/// `TASK_EXEC`: arguments are the program (string), an argument count
/// (`u16`) with that many strings, and a stdin blob. Payload is the
/// captured stdout blob followed by the stderr text string.
struct ExecHandler;

/// Cap on exec argument counts; more than this is a malformed frame.
const MAX_EXEC_ARGS: usize = 256;

#[async_trait]
impl CommandHandler for ExecHandler {
    async fn handle(
        &self,
        request: &mut RequestReader,
        ctx: &RequestContext<'_>,
    ) -> Result<Vec<u8>, HandlerError> {
        let program = request.read_string().await.map_err(HandlerError::Fatal)?;
        let arg_count = usize::from(request.read_u16().await.map_err(HandlerError::Fatal)?);
        if arg_count > MAX_EXEC_ARGS {
            return Err(HandlerError::Fatal(ProtocolError::invalid_frame(format!(
                "exec request listed {arg_count} arguments, maximum is {MAX_EXEC_ARGS}"
            ))));
        }
        let mut args = Vec::with_capacity(arg_count);
        for _ in 0..arg_count {
            args.push(request.read_string().await.map_err(HandlerError::Fatal)?);
        }
        let stdin = request.read_blob().await.map_err(HandlerError::Fatal)?;

        info!(peer = %ctx.peer_addr, program = %program, "running external command");

        let output = ExecCommand::new(&program)
            .args(args)
            .stdin(stdin)
            .run_capture()
            .await
            .map_err(exec_failure)?;

        let mut payload = Vec::with_capacity(output.stdout.len() + output.stderr.len() + 8);
        put_blob(&mut payload, &output.stdout);
        put_string(&mut payload, bounded(&output.stderr));
        Ok(payload)
    }
}

/// `TASK_RESTART_SERVICE`: argument is the service name (string);
/// payload is empty. Runs `<control_program> restart <service>`.
struct RestartServiceHandler {
    control_program: String,
}

#[async_trait]
impl CommandHandler for RestartServiceHandler {
    async fn handle(
        &self,
        request: &mut RequestReader,
        ctx: &RequestContext<'_>,
    ) -> Result<Vec<u8>, HandlerError> {
        let service = request.read_string().await.map_err(HandlerError::Fatal)?;
        if service.is_empty() {
            return Err(CommandError::data("service name must not be empty").into());
        }

        info!(peer = %ctx.peer_addr, service = %service, "restarting service");

        ExecCommand::new(&self.control_program)
            .arg("restart")
            .arg(&service)
            .run_capture()
            .await
            .map_err(exec_failure)?;

        Ok(Vec::new())
    }
}

/// `TASK_GRANT_ACCESS`: arguments are the caller-chosen random key
/// (`u64`), the command code (`u16`) it will authorize, and four
/// parameter strings (empty string meaning unset). Payload is empty.
struct GrantAccessHandler;

#[async_trait]
impl CommandHandler for GrantAccessHandler {
    async fn handle(
        &self,
        request: &mut RequestReader,
        ctx: &RequestContext<'_>,
    ) -> Result<Vec<u8>, HandlerError> {
        let key = request.read_u64().await.map_err(HandlerError::Fatal)?;
        let command = request.read_u16().await.map_err(HandlerError::Fatal)?;
        let mut params: [Option<String>; GRANT_PARAMS] = Default::default();
        for slot in &mut params {
            let value = request.read_string().await.map_err(HandlerError::Fatal)?;
            if !value.is_empty() {
                *slot = Some(value);
            }
        }

        ctx.grants.grant(key, command, params);
        info!(peer = %ctx.peer_addr, command, "issued one-time access key");

        Ok(Vec::new())
    }
}

/// `TASK_REDEEM_ACCESS`: arguments are the key (`u64`) and the command
/// code (`u16`) the caller intends to run. Payload is the four pinned
/// parameter strings (empty string for unset slots).
///
/// Both failure modes are request-scoped and the key is consumed
/// either way, but they are reported distinctly: an unknown key versus
/// a key that authorizes a different command.
struct RedeemAccessHandler;

#[async_trait]
impl CommandHandler for RedeemAccessHandler {
    async fn handle(
        &self,
        request: &mut RequestReader,
        ctx: &RequestContext<'_>,
    ) -> Result<Vec<u8>, HandlerError> {
        let key = request.read_u64().await.map_err(HandlerError::Fatal)?;
        let command = request.read_u16().await.map_err(HandlerError::Fatal)?;

        let grant = match ctx.grants.redeem(key, command) {
            Ok(grant) => grant,
            Err(GrantError::UnknownKey) => {
                return Err(CommandError::data("access key is not recognized").into());
            }
            Err(err @ GrantError::CommandMismatch { .. }) => {
                return Err(CommandError::denied(err.to_string()).into());
            }
        };

        info!(peer = %ctx.peer_addr, command, "access key redeemed");

        let mut payload = Vec::new();
        for slot in &grant.params {
            put_string(&mut payload, slot.as_deref().unwrap_or(""));
        }
        Ok(payload)
    }
}

/// Map an exec failure onto the reply channels: spawn and stream
/// trouble is I/O, a clean non-zero exit is a data failure carrying
/// the child's stderr. Stream failures whose kinds are all ordinary
/// peer disconnects stay benign so the loop logs them quietly.
fn exec_failure(err: ExecError) -> HandlerError {
    match err {
        ExecError::Failed {
            summary,
            failures,
            stderr,
            code: Some(_),
        } if failures.is_empty() => {
            let message = if stderr.is_empty() {
                summary
            } else {
                format!("{summary}: {}", stderr.trim_end())
            };
            CommandError::data(message).into()
        }
        ExecError::Failed {
            summary, failures, ..
        } if !failures.is_empty() => {
            let detail = failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            let benign = failures
                .into_iter()
                .map(CommandError::from)
                .all(|f| f.is_benign());
            CommandError::Io {
                message: format!("{summary}: {detail}"),
                benign,
            }
            .into()
        }
        other => CommandError::io(other.to_string()).into(),
    }
}

/// Clamp stderr text so the reply string stays within the wire limit.
fn bounded(text: &str) -> &str {
    const LIMIT: usize = crate::protocol::error::MAX_STRING_LEN;
    if text.len() <= LIMIT {
        return text;
    }
    let mut end = LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
