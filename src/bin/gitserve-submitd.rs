//! gitserve-submitd: accept pushes into per-user submission repositories.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use gitserve::hooks::HookCommand;
use gitserve::keys;
use gitserve::metrics::MetricsRegistry;
use gitserve::ssh::server::ServerOptions;
use gitserve::ssh::RestrictedServer;
use gitserve::submit::{
    hmac_repo_id, AuthHook, NewRepoHook, RepoSubmissions, StoragePathFn, SubmissionHook,
    DEFAULT_MAX_PUSH_SIZE,
};

#[derive(Parser, Debug)]
#[command(name = "gitserve-submitd", about = "SSH git submission server")]
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
    #[arg(long, default_value = "Welcome to the gitserve git submission service!")]
    motd: String,
    /// Storage root for submission repos; empty uses /tmp/submissions.
    #[arg(long, default_value = "")]
    storage_path: String,
    /// Delete repos after processing, instead of keeping them.
    #[arg(long)]
    clean: bool,
    /// Subprocess to run on a completed git submission.
    #[arg(long, default_value = "")]
    inspect: String,
    /// If set, run with incoming SSH keys prior to receiving packs; a
    /// successful exit status lets the connection through.
    #[arg(long, default_value = "")]
    auth: String,
    /// If set, run to initiate a new repo; the --repo argument given will
    /// be an empty folder that must be a bare git repo when the command is
    /// done.
    #[arg(long, default_value = "")]
    new_repo: String,
    /// Address to listen on for debug http endpoints.
    #[arg(long, default_value = "127.0.0.1:0")]
    debug_addr: String,
    /// Maximum push size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_PUSH_SIZE)]
    max_push_size: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("starting gitserve-submitd");

    let host_key = keys::load_or_generate_host_key(&cli.private_key)?;

    let storage_path: Option<StoragePathFn> = (!cli.storage_path.is_empty()).then(|| {
        let root = PathBuf::from(&cli.storage_path);
        Box::new(move |user_id: &str, repo_name: &str| {
            root.join(hmac_repo_id(user_id, repo_name))
        }) as StoragePathFn
    });

    let auth_hook: Option<Arc<dyn AuthHook>> = (!cli.auth.is_empty())
        .then(|| Arc::new(HookCommand::new(&cli.auth)) as Arc<dyn AuthHook>);
    let new_repo_hook: Option<Arc<dyn NewRepoHook>> = (!cli.new_repo.is_empty())
        .then(|| Arc::new(HookCommand::new(&cli.new_repo)) as Arc<dyn NewRepoHook>);
    let submission_hook: Option<Arc<dyn SubmissionHook>> = (!cli.inspect.is_empty())
        .then(|| Arc::new(HookCommand::new(&cli.inspect)) as Arc<dyn SubmissionHook>);

    let mut submissions = RepoSubmissions::default();
    submissions.storage_path = storage_path;
    submissions.clean = cli.clean;
    submissions.auth_hook = auth_hook;
    submissions.new_repo_hook = new_repo_hook;
    submissions.submission_hook = submission_hook;
    submissions.max_push_size = cli.max_push_size;
    let handler = Arc::new(submissions);

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
