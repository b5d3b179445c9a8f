//! Subprocess execution with fully wired standard streams.

use std::io;
use std::process::Stdio;

use anyhow::{bail, Context as _, Result};
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Run `cmd` to completion with stdin fed from `stdin` and stdout/stderr
/// streamed into `stdout`/`stderr`.
///
/// All three streams are pumped concurrently; output left in the pipes when
/// the child exits is drained before returning. A clean exit yields
/// `Ok(0)`; every other outcome (spawn failure, non-zero status, signal
/// death, broken output stream) is an error, which callers translate to SSH
/// exit-status 1. A failure reading the supplied `stdin` fails the run even
/// when the child exits cleanly; only the child closing its end of the pipe
/// early is tolerated.
#[instrument(level = "debug", skip_all, fields(program = ?cmd.as_std().get_program()))]
pub async fn run_exec<R, O, E>(
    mut cmd: Command,
    stdin: &mut R,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<u32>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    O: AsyncWrite + Unpin + Send + ?Sized,
    E: AsyncWrite + Unpin + Send + ?Sized,
{
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().context("failed to spawn subprocess")?;

    let mut child_stdin = child.stdin.take().expect("stdin was piped");
    let mut child_stdout = child.stdout.take().expect("stdout was piped");
    let mut child_stderr = child.stderr.take().expect("stderr was piped");

    let mut stdin_pump = Box::pin(async move {
        let copied = tokio::io::copy(stdin, &mut child_stdin).await;
        // Closing the pipe tells the child the client is done sending.
        let _ = child_stdin.shutdown().await;
        copied
    });
    let mut stdout_pump = Box::pin(tokio::io::copy(&mut child_stdout, stdout));
    let mut stderr_pump = Box::pin(tokio::io::copy(&mut child_stderr, stderr));
    let mut stdin_done = false;
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut stdin_error: Option<io::Error> = None;

    let status = loop {
        tokio::select! {
            copied = &mut stdin_pump, if !stdin_done => {
                stdin_done = true;
                match copied {
                    Ok(_) => {}
                    // The child closing its stdin early is routine.
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        debug!(error = %e, "child closed stdin early");
                    }
                    Err(e) => stdin_error = Some(e),
                }
            }
            copied = &mut stdout_pump, if !stdout_done => {
                stdout_done = true;
                copied.context("error streaming subprocess stdout")?;
            }
            copied = &mut stderr_pump, if !stderr_done => {
                stderr_done = true;
                copied.context("error streaming subprocess stderr")?;
            }
            status = child.wait() => {
                break status.context("failed to wait for subprocess")?;
            }
        }
    };

    // Harvest a stdin failure that raced the child's exit.
    if !stdin_done {
        if let Some(Err(e)) = (&mut stdin_pump).now_or_never() {
            if e.kind() != io::ErrorKind::BrokenPipe {
                stdin_error = Some(e);
            }
        }
    }

    // The pipes may still hold buffered output after exit.
    if !stdout_done {
        stdout_pump
            .await
            .context("error draining subprocess stdout")?;
    }
    if !stderr_done {
        stderr_pump
            .await
            .context("error draining subprocess stderr")?;
    }

    if !status.success() {
        bail!("subprocess exited with {status}");
    }
    if let Some(error) = stdin_error {
        return Err(error).context("error streaming subprocess stdin");
    }
    Ok(0)
}
