//! External hook binaries for submission mode.
//!
//! Each extension point of [`crate::submit::RepoSubmissions`] can be backed
//! by a subprocess. The argv contracts are part of the deployment
//! interface: every hook receives `--user`, `--remote`, and `--key`
//! (canonical authorized-keys form), plus point-specific arguments.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::ssh::SessionMeta;
use crate::submit::{AuthHook, NewRepoHook, SubmissionHook};
use crate::tagger::NewTags;

/// An external program invoked at one of the submission extension points.
#[derive(Clone, Debug)]
pub struct HookCommand {
    program: PathBuf,
}

impl HookCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

fn identity_args(cmd: &mut Command, meta: &SessionMeta, key_line: &str) {
    cmd.arg("--user")
        .arg(&meta.user)
        .arg("--remote")
        .arg(meta.remote())
        .arg("--key")
        .arg(key_line);
}

/// Run a hook, forwarding its stdout and stderr to `output` as they appear.
async fn run_hook(
    program: &Path,
    mut cmd: Command,
    output: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<u32> {
    debug!(hook = %program.display(), "running hook");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn hook {}", program.display()))?;

    let mut child_stdout = child.stdout.take().expect("stdout was piped");
    let mut child_stderr = child.stderr.take().expect("stderr was piped");
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let mut out_open = true;
    let mut err_open = true;
    while out_open || err_open {
        tokio::select! {
            read = child_stdout.read(&mut out_buf), if out_open => {
                let n = read.context("error reading hook stdout")?;
                if n == 0 {
                    out_open = false;
                } else {
                    output
                        .write_all(&out_buf[..n])
                        .await
                        .context("error forwarding hook output")?;
                }
            }
            read = child_stderr.read(&mut err_buf), if err_open => {
                let n = read.context("error reading hook stderr")?;
                if n == 0 {
                    err_open = false;
                } else {
                    output
                        .write_all(&err_buf[..n])
                        .await
                        .context("error forwarding hook output")?;
                }
            }
        }
    }

    let status = child.wait().await.context("failed to wait for hook")?;
    if !status.success() {
        bail!("hook {} exited with {status}", program.display());
    }
    Ok(0)
}

/// `--auth` hook: a clean exit allows the key; identity stays key-derived.
#[async_trait]
impl AuthHook for HookCommand {
    async fn authenticate(&self, meta: &SessionMeta, key_line: &str) -> Result<Option<String>> {
        let mut cmd = Command::new(&self.program);
        identity_args(&mut cmd, meta, key_line);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let status = cmd
            .status()
            .await
            .with_context(|| format!("failed to run auth hook {}", self.program.display()))?;
        if !status.success() {
            bail!("auth hook {} exited with {status}", self.program.display());
        }
        Ok(None)
    }
}

/// `--new_repo` hook: must leave a valid bare repository at `--repo`.
#[async_trait]
impl NewRepoHook for HookCommand {
    async fn create(
        &self,
        repo_path: &Path,
        output: &mut (dyn AsyncWrite + Send + Unpin),
        meta: &SessionMeta,
        key_line: &str,
        repo_name: &str,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--repo").arg(repo_path);
        identity_args(&mut cmd, meta, key_line);
        cmd.arg("--name").arg(repo_name);
        run_hook(&self.program, cmd, output).await.map(|_| ())
    }
}

/// `--inspect` hook: receives the created submission tags NUL-joined; its
/// output reaches the client and its exit status is forwarded.
#[async_trait]
impl SubmissionHook for HookCommand {
    async fn submitted(
        &self,
        repo_path: &Path,
        output: &mut (dyn AsyncWrite + Send + Unpin),
        meta: &SessionMeta,
        key_line: &str,
        repo_name: &str,
        tags: &NewTags,
    ) -> Result<u32> {
        let tag_list: Vec<&str> = tags.values().flatten().map(String::as_str).collect();
        let mut cmd = Command::new(&self.program);
        cmd.arg("--repo").arg(repo_path);
        identity_args(&mut cmd, meta, key_line);
        cmd.arg("--name")
            .arg(repo_name)
            .arg("--tags")
            .arg(tag_list.join("\x00"));
        run_hook(&self.program, cmd, output).await
    }
}
