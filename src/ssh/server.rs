//! SSH server bootstrap: the accept loop and per-connection sessions.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::session::SshSession;
use super::CommandHandler;
use crate::metrics::Metrics;
use crate::registry::SessionId;

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Server-wide presentation options.
pub struct ServerOptions {
    pub host_key: KeyPair,
    /// Banner written to stderr before every command and shell response.
    /// Include trailing line endings as they should appear on the wire.
    pub motd: String,
    /// Message shown to interactive shell users.
    pub shell_error: String,
}

/// A restricted SSH server: public-key auth only, session channels only,
/// one exec per channel, everything else refused.
pub struct RestrictedServer<H> {
    handler: Arc<H>,
    config: Arc<russh::server::Config>,
    motd: String,
    shell_error: String,
    metrics: Arc<Metrics>,
}

impl<H: CommandHandler> RestrictedServer<H> {
    pub fn new(options: ServerOptions, handler: Arc<H>, metrics: Arc<Metrics>) -> Self {
        let config = Arc::new(russh::server::Config {
            keys: vec![options.host_key],
            methods: MethodSet::PUBLICKEY,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        });
        Self {
            handler,
            config,
            motd: options.motd,
            shell_error: options.shell_error,
            metrics,
        }
    }

    /// Bind `addr` (accepting the Go-style `:port` shorthand) and serve
    /// until a permanent accept error occurs.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<()> {
        let addr = normalize_listen_addr(addr);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind ssh listener on {addr}"))?;
        info!(address = %listener.local_addr()?, "ssh server listening");
        self.serve(listener).await
    }

    /// Accept loop. Transient errors back off exponentially from 5 ms to a
    /// 1 s cap and the delay resets on the next successful accept;
    /// permanent errors abort the loop.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut delay = Duration::ZERO;
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    delay = Duration::ZERO;
                    self.metrics.connections.inc();
                    self.spawn_connection(stream, peer_addr);
                }
                Err(error) if is_transient_accept_error(&error) => {
                    delay = if delay.is_zero() {
                        ACCEPT_BACKOFF_INITIAL
                    } else {
                        (delay * 2).min(ACCEPT_BACKOFF_MAX)
                    };
                    warn!(error = %error, delay = ?delay, "transient accept error, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error).context("ssh accept failed"),
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let session_id = SessionId::random();
        debug!(session = %session_id, peer = %peer_addr, "new ssh connection");

        let tasks = Arc::new(Mutex::new(Vec::new()));
        let ssh_session = SshSession::new(
            Arc::clone(&self.handler),
            session_id,
            Some(peer_addr),
            self.motd.clone(),
            self.shell_error.clone(),
            Arc::clone(&self.metrics),
            Arc::clone(&tasks),
        );
        let handler = Arc::clone(&self.handler);
        let config = Arc::clone(&self.config);

        tokio::spawn(async move {
            match russh::server::run_stream(config, stream, ssh_session).await {
                Ok(session) => {
                    if let Err(error) = session.await {
                        debug!(session = %session_id, error = %error, "ssh session ended with error");
                    }
                    // Let every exec worker finish observing per-session
                    // state before announcing the session end.
                    let pending: Vec<_> = tasks.lock().unwrap().drain(..).collect();
                    for task in pending {
                        let _ = task.await;
                    }
                    handler.session_closed(session_id).await;
                }
                Err(error) => {
                    debug!(session = %session_id, error = %error, "ssh handshake failed");
                }
            }
        });
    }
}

fn is_transient_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Accept Go-style `:port` listen addresses alongside full `host:port`.
pub fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
