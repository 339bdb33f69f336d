//! The daemon's wire protocol: framing, handshake, authentication,
//! and the per-connection command loop.
//!
//! Layering, bottom up:
//!
//! - [`wire`]: length-prefixed binary primitives over any async
//!   transport.
//! - [`version`] and [`handshake`]: version negotiation and session
//!   establishment.
//! - [`auth`]: allow-list and shared-key privilege assignment.
//! - [`dispatch`]: the task-code-to-handler table.
//! - [`connection`]: the session driver tying the above together.
//! - [`acceptor`]: listeners, TLS, and connection task spawning.
//! - [`client`]: the controller side, used by tests and tooling.

pub mod acceptor;
pub mod auth;
pub mod client;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod version;
pub mod wire;

pub use acceptor::{Acceptor, Endpoint, Transport};
pub use auth::{AuthRejection, Authenticator, DaemonKey, Privilege};
pub use connection::ConnectionDriver;
pub use dispatch::{
    CommandHandler, DispatchTable, RequestContext, RequiredPrivilege, TaskCode, TASK_QUIT,
};
pub use error::{CommandError, HandlerError, ProtocolError, ProtocolResult};
pub use version::{ProtocolVersion, SUPPORTED};
