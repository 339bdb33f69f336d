//! wardend: a server-management daemon speaking a sequenced binary
//! command protocol over plain TCP or TLS.
//!
//! Controllers connect, negotiate a protocol version, optionally
//! present the shared daemon key for master privilege, and then issue
//! sequence-numbered requests against a task dispatch table. One-time
//! access keys let a privileged session pre-authorize a single command
//! for a later unprivileged one.

#![warn(missing_docs)]

pub mod config;
pub mod exec;
pub mod grants;
pub mod handlers;
pub mod protocol;
