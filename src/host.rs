//! Hosting dispatcher: serve pre-existing bare repositories over SSH.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use russh_keys::key::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{info, warn};

use crate::command::{parse_command, GitVerb};
use crate::exec::run_exec;
use crate::keys::authorized_key_line;
use crate::ssh::{CommandHandler, SessionMeta};

/// Serves push and fetch for bare repositories under a base directory, or
/// for a single fixed repository.
#[derive(Default)]
pub struct RepoHosting {
    /// Directory containing the repositories to serve. Ignored when `repo`
    /// is set.
    pub repo_base: Option<PathBuf>,
    /// Single repository served regardless of the requested name. When
    /// neither this nor `repo_base` is set, the current directory is
    /// served.
    pub repo: Option<PathBuf>,
    /// Keys allowed to connect. An empty list accepts any key.
    pub authorized_keys: Vec<PublicKey>,
    /// Override for the push-side binary.
    pub receive_pack_bin: Option<String>,
    /// Override for the fetch-side binary.
    pub upload_pack_bin: Option<String>,
}

impl RepoHosting {
    fn resolve_repo_path(&self, repo: &str) -> PathBuf {
        if let Some(fixed) = &self.repo {
            fixed.clone()
        } else if let Some(base) = &self.repo_base {
            base.join(repo)
        } else {
            PathBuf::from(".")
        }
    }

    fn binary_for(&self, verb: GitVerb) -> String {
        let override_bin = match verb {
            GitVerb::ReceivePack => &self.receive_pack_bin,
            GitVerb::UploadPack => &self.upload_pack_bin,
        };
        override_bin
            .clone()
            .unwrap_or_else(|| verb.binary().to_string())
    }
}

#[async_trait]
impl CommandHandler for RepoHosting {
    async fn auth_publickey(&self, meta: &SessionMeta, key: &PublicKey) -> Result<bool> {
        if self.authorized_keys.is_empty() {
            info!(user = %meta.user, "all users authorized");
            return Ok(true);
        }
        let presented = authorized_key_line(key);
        if self
            .authorized_keys
            .iter()
            .any(|authorized| authorized_key_line(authorized) == presented)
        {
            info!(user = %meta.user, "user authorized");
            Ok(true)
        } else {
            warn!(user = %meta.user, "key not in authorized list, rejecting");
            Ok(false)
        }
    }

    async fn run_command(
        &self,
        command: &str,
        stdin: &mut (dyn AsyncRead + Send + Unpin),
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
        meta: &SessionMeta,
    ) -> Result<u32> {
        let (verb, repo) = match parse_command(command) {
            Ok(parsed) => parsed,
            Err(rejection) => {
                stderr
                    .write_all(rejection.message(command).as_bytes())
                    .await?;
                return Ok(1);
            }
        };

        let repo_path = self.resolve_repo_path(&repo);
        info!(
            user = %meta.user,
            verb = %verb,
            repo = %repo_path.display(),
            "remote repo request"
        );

        let mut cmd = Command::new(self.binary_for(verb));
        cmd.arg(&repo_path);
        run_exec(cmd, stdin, stdout, stderr).await
    }
}
