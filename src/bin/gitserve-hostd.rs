//! gitserve-hostd: restricted SSH hosting for pre-existing bare repos.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use gitserve::host::RepoHosting;
use gitserve::keys;
use gitserve::metrics::MetricsRegistry;
use gitserve::ssh::server::ServerOptions;
use gitserve::ssh::RestrictedServer;

#[derive(Parser, Debug)]
#[command(name = "gitserve-hostd", about = "Restricted SSH git hosting server")]
struct Cli {
    /// Address to listen on for SSH.
    #[arg(long, default_value = ":7022")]
    addr: String,
    /// Path to the server private key; empty generates an ephemeral key.
    #[arg(long, default_value = "")]
    private_key: String,
    /// Message displayed to interactive shell users.
    #[arg(long, default_value = "Sorry, no interactive shell available.")]
    shell_error: String,
    /// Banner written before every response.
    #[arg(long, default_value = "Welcome to the gitserve git hosting service!")]
    motd: String,
    /// Folder to serve git repos out of. Ignored if --repo is set.
    #[arg(long, default_value = "")]
    repo_base: String,
    /// Single repo to serve, overriding --repo_base.
    #[arg(long, default_value = "")]
    repo: String,
    /// authorized_keys file restricting access; empty allows any key.
    #[arg(long, default_value = "")]
    authorized_keys: String,
    /// Address to listen on for debug http endpoints.
    #[arg(long, default_value = "127.0.0.1:0")]
    debug_addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("starting gitserve-hostd");

    let host_key = keys::load_or_generate_host_key(&cli.private_key)?;

    let authorized_keys = if cli.authorized_keys.is_empty() {
        Vec::new()
    } else {
        let blob = std::fs::read_to_string(&cli.authorized_keys)
            .with_context(|| format!("failed to read {}", cli.authorized_keys))?;
        keys::load_authorized_keys(&blob)?
    };

    let handler = Arc::new(RepoHosting {
        repo_base: (!cli.repo_base.is_empty()).then(|| PathBuf::from(&cli.repo_base)),
        repo: (!cli.repo.is_empty()).then(|| PathBuf::from(&cli.repo)),
        authorized_keys,
        ..Default::default()
    });

    let registry = Arc::new(MetricsRegistry::new());

    tokio::spawn({
        let registry = Arc::clone(&registry);
        let debug_addr = cli.debug_addr.clone();
        async move {
            if let Err(error) = gitserve::debug::serve(&debug_addr, registry).await {
                tracing::error!(error = %format!("{error:#}"), "debug endpoint failed");
            }
        }
    });

    let server = RestrictedServer::new(
        ServerOptions {
            host_key,
            motd: format!("{}\r\n", cli.motd),
            shell_error: format!("{}\r\n", cli.shell_error),
        },
        handler,
        Arc::clone(&registry.metrics),
    );
    server.listen_and_serve(&cli.addr).await
}
