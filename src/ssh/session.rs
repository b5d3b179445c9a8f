//! Per-connection SSH handler implementing the restricted channel policy.
//!
//! Every session channel runs a small state machine: `pty-req` is noted,
//! `env` is denied, `shell` gets the MOTD plus the shell-error message and
//! exit-status 1, and only the first `exec` on a channel (and only if no
//! PTY was requested before it) is handed to the dispatcher. The dispatcher
//! runs in a detached task wired to the channel through
//! [`ChannelInput`]/[`ChannelWriter`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::PublicKey;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::stream::{ChannelInput, ChannelWriter, STDERR_ID};
use super::{CommandHandler, SessionMeta};
use crate::metrics::Metrics;
use crate::registry::SessionId;

/// How many inbound data packets may queue per channel before the SSH event
/// loop stops draining the socket (back-pressure onto the client).
const STDIN_QUEUE_DEPTH: usize = 32;

#[derive(Default)]
struct ChannelState {
    exec_happened: bool,
    pty_requested: bool,
    stdin: Option<mpsc::Sender<Vec<u8>>>,
}

pub(crate) struct SshSession<H> {
    handler: Arc<H>,
    session_id: SessionId,
    peer_addr: Option<SocketAddr>,
    user: Option<String>,
    motd: String,
    shell_error: String,
    metrics: Arc<Metrics>,
    channels: HashMap<ChannelId, ChannelState>,
    /// Detached exec workers; the connection task awaits them before firing
    /// the session-end notification.
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<H> SshSession<H> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handler: Arc<H>,
        session_id: SessionId,
        peer_addr: Option<SocketAddr>,
        motd: String,
        shell_error: String,
        metrics: Arc<Metrics>,
        tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ) -> Self {
        Self {
            handler,
            session_id,
            peer_addr,
            user: None,
            motd,
            shell_error,
            metrics,
            channels: HashMap::new(),
            tasks,
        }
    }

    fn meta(&self, user: &str) -> SessionMeta {
        SessionMeta {
            session_id: self.session_id,
            user: user.to_string(),
            remote_addr: self.peer_addr,
        }
    }
}

#[async_trait]
impl<H: CommandHandler> Handler for SshSession<H> {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let meta = self.meta(user);
        match self.handler.auth_publickey(&meta, key).await {
            Ok(true) => {
                debug!(session = %self.session_id, user = %user, "public key accepted");
                self.user = Some(user.to_string());
                Ok(Auth::Accept)
            }
            Ok(false) => {
                self.metrics.auth_rejections.inc();
                info!(session = %self.session_id, user = %user, "public key rejected");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
            Err(error) => {
                self.metrics.auth_rejections.inc();
                warn!(
                    session = %self.session_id,
                    user = %user,
                    error = %format!("{error:#}"),
                    "public-key authentication failed"
                );
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.pty_requested = true;
        }
        session.channel_success(channel);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.metrics.shells_rejected.inc();
        info!(session = %self.session_id, "interactive shell refused");
        session.channel_success(channel);
        if !self.motd.is_empty() {
            session.extended_data(channel, STDERR_ID, CryptoVec::from_slice(self.motd.as_bytes()));
        }
        if !self.shell_error.is_empty() {
            session.extended_data(
                channel,
                STDERR_ID,
                CryptoVec::from_slice(self.shell_error.as_bytes()),
            );
        }
        session.exit_status_request(channel, 1);
        session.eof(channel);
        session.close(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let state = self.channels.entry(channel).or_default();
        if state.exec_happened || state.pty_requested {
            debug!(session = %self.session_id, "refusing exec: channel already used");
            session.channel_failure(channel);
            return Ok(());
        }
        state.exec_happened = true;

        let command = String::from_utf8_lossy(data).into_owned();
        info!(session = %self.session_id, command = %command, "exec request");
        self.metrics.execs.inc();

        let (tx, rx) = mpsc::channel(STDIN_QUEUE_DEPTH);
        state.stdin = Some(tx);
        session.channel_success(channel);

        // The session registry entry is resolved by the dispatcher through
        // this metadata; it was created by the auth callback, which strictly
        // precedes any exec on the connection.
        let meta = self.meta(self.user.clone().unwrap_or_default().as_str());
        let worker = run_dispatch(
            Arc::clone(&self.handler),
            session.handle(),
            channel,
            command,
            rx,
            self.motd.clone(),
            meta,
            Arc::clone(&self.metrics),
        );
        self.tasks.lock().unwrap().push(tokio::spawn(worker));
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let tx = self
            .channels
            .get(&channel)
            .and_then(|state| state.stdin.clone());
        if let Some(tx) = tx {
            // A send error means the dispatcher is gone; remaining input is
            // discarded.
            let _ = tx.send(data.to_vec()).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

/// The detached worker for one honored exec request: MOTD first, then the
/// dispatcher, then exit-status and channel teardown.
#[allow(clippy::too_many_arguments)]
async fn run_dispatch<H: CommandHandler>(
    handler: Arc<H>,
    handle: Handle,
    channel: ChannelId,
    command: String,
    stdin_rx: mpsc::Receiver<Vec<u8>>,
    motd: String,
    meta: SessionMeta,
    metrics: Arc<Metrics>,
) {
    let mut stdout = ChannelWriter::stdout(handle.clone(), channel);
    let mut stderr = ChannelWriter::stderr(handle.clone(), channel);

    let motd_ok = motd.is_empty() || stderr.write_all(motd.as_bytes()).await.is_ok();
    let status = if !motd_ok {
        warn!(session = %meta.session_id, "client went away before dispatch");
        1
    } else {
        let mut stdin = ChannelInput::new(stdin_rx);
        match handler
            .run_command(&command, &mut stdin, &mut stdout, &mut stderr, &meta)
            .await
        {
            Ok(status) => status,
            Err(error) => {
                metrics.exec_failures.inc();
                warn!(
                    session = %meta.session_id,
                    command = %command,
                    error = %format!("{error:#}"),
                    "command dispatch failed"
                );
                1
            }
        }
    };

    let _ = handle.exit_status_request(channel, status).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}
