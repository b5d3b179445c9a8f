//! The restricted SSH layer.
//!
//! Terminates SSH connections, authenticates clients by public key, and
//! enforces the channel policy: no interactive shells, no environment
//! passing, and at most one honored `exec` per session channel. The exec
//! payload is handed to a [`CommandHandler`] together with the channel's
//! byte streams; everything else about git stays out of this module.

pub mod server;
pub mod session;
pub mod stream;

pub use server::RestrictedServer;

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use russh_keys::key::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::registry::SessionId;

/// Connection metadata available to dispatchers and hooks.
#[derive(Clone, Debug)]
pub struct SessionMeta {
    pub session_id: SessionId,
    /// Username the SSH client presented.
    pub user: String,
    pub remote_addr: Option<SocketAddr>,
}

impl SessionMeta {
    /// Remote address in display form, for logging and hook argv.
    pub fn remote(&self) -> String {
        self.remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Policy and dispatch for a restricted server: who may connect, and what
/// the single exec command on a channel does.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Decide whether the presented public key may open sessions. Returning
    /// `Ok(false)` or an error rejects the authentication.
    async fn auth_publickey(&self, meta: &SessionMeta, key: &PublicKey) -> Result<bool>;

    /// Run `command` against the channel's streams. The returned value is
    /// sent to the client as the SSH exit status; an error is logged and
    /// maps to exit-status 1.
    async fn run_command(
        &self,
        command: &str,
        stdin: &mut (dyn AsyncRead + Send + Unpin),
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
        meta: &SessionMeta,
    ) -> Result<u32>;

    /// Called exactly once when a connection that completed its handshake
    /// goes away, after all of the session's channel work has finished
    /// observing any per-session state.
    async fn session_closed(&self, _session_id: SessionId) {}
}
