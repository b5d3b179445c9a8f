//! Submission dispatcher: per-user repositories, rewritten pushes, hooks.
//!
//! Every push lands as tags under `refs/tags/submissions/<id>/` in a bare
//! repository keyed by the authenticated user and the requested repo name.
//! Repository creation is all-or-nothing under a per-repo lock; pushes are
//! size-capped and streamed through the ref rewriter; pluggable hooks run
//! around authentication, repository creation, and submission processing.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use russh_keys::key::PublicKey;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{info, warn};

use crate::bounded::BoundedReader;
use crate::command::{parse_command, GitVerb};
use crate::exec::run_exec;
use crate::keys::{authorized_key_line, user_id_from_key};
use crate::locks::RepoLocks;
use crate::registry::{SessionId, SessionRecord, SessionRegistry};
use crate::ssh::{CommandHandler, SessionMeta};
use crate::tagger::{NewTags, Tagger};

type HmacSha256 = Hmac<Sha256>;

/// Default ceiling on client-to-server bytes for one push: 256 MiB.
pub const DEFAULT_MAX_PUSH_SIZE: u64 = 256 * 1024 * 1024;

/// Decides whether a key may connect, optionally assigning its identity.
#[async_trait]
pub trait AuthHook: Send + Sync {
    /// `Ok(Some(id))` assigns an opaque unique user id, `Ok(None)` falls
    /// back to the key-derived id, and an error rejects the connection.
    async fn authenticate(&self, meta: &SessionMeta, key_line: &str) -> Result<Option<String>>;
}

/// Turns a freshly created directory into a bare repository.
#[async_trait]
pub trait NewRepoHook: Send + Sync {
    async fn create(
        &self,
        repo_path: &Path,
        output: &mut (dyn AsyncWrite + Send + Unpin),
        meta: &SessionMeta,
        key_line: &str,
        repo_name: &str,
    ) -> Result<()>;
}

/// Runs before a push is accepted; an error refuses the push.
#[async_trait]
pub trait PresubmissionHook: Send + Sync {
    async fn check(
        &self,
        repo_path: &Path,
        output: &mut (dyn AsyncWrite + Send + Unpin),
        meta: &SessionMeta,
        key_line: &str,
        repo_name: &str,
    ) -> Result<()>;
}

/// Runs after a completed push; the returned value becomes the SSH exit
/// status the client sees.
#[async_trait]
pub trait SubmissionHook: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn submitted(
        &self,
        repo_path: &Path,
        output: &mut (dyn AsyncWrite + Send + Unpin),
        meta: &SessionMeta,
        key_line: &str,
        repo_name: &str,
        tags: &NewTags,
    ) -> Result<u32>;
}

/// Computes the on-disk location for a `(user id, repo name)` pair.
pub type StoragePathFn = Box<dyn Fn(&str, &str) -> PathBuf + Send + Sync>;

/// Deterministic repository key: HMAC-SHA256 over the repo name keyed by
/// the user id, hex encoded.
pub fn hmac_repo_id(user_id: &str, repo_name: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(user_id.as_bytes())
        .expect("HMAC-SHA256 accepts keys of any length");
    mac.update(repo_name.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// The submission-mode dispatcher.
pub struct RepoSubmissions {
    /// Storage layout override. The default keys repositories under
    /// `/tmp/submissions/` by [`hmac_repo_id`].
    pub storage_path: Option<StoragePathFn>,
    /// Delete the repository once the operation completes; the per-repo
    /// lock is held until the deletion is done.
    pub clean: bool,
    pub auth_hook: Option<Arc<dyn AuthHook>>,
    pub new_repo_hook: Option<Arc<dyn NewRepoHook>>,
    pub presubmission_hook: Option<Arc<dyn PresubmissionHook>>,
    pub submission_hook: Option<Arc<dyn SubmissionHook>>,
    /// Ceiling on client-to-server bytes for one push.
    pub max_push_size: u64,
    /// Override for the push-side binary.
    pub receive_pack_bin: Option<String>,
    /// Override for the fetch-side binary.
    pub upload_pack_bin: Option<String>,
    registry: SessionRegistry,
    locks: RepoLocks,
}

impl Default for RepoSubmissions {
    fn default() -> Self {
        Self {
            storage_path: None,
            clean: false,
            auth_hook: None,
            new_repo_hook: None,
            presubmission_hook: None,
            submission_hook: None,
            max_push_size: DEFAULT_MAX_PUSH_SIZE,
            receive_pack_bin: None,
            upload_pack_bin: None,
            registry: SessionRegistry::default(),
            locks: RepoLocks::default(),
        }
    }
}

impl RepoSubmissions {
    fn repo_path(&self, user_id: &str, repo_name: &str) -> PathBuf {
        match &self.storage_path {
            Some(storage_path) => storage_path(user_id, repo_name),
            None => PathBuf::from("/tmp/submissions").join(hmac_repo_id(user_id, repo_name)),
        }
    }

    /// Make sure `repo_path` holds an initialized bare repository. Creation
    /// is all-or-nothing: if the new-repo hook or `git init` fails, the
    /// directory is removed again.
    async fn ensure_repo(
        &self,
        repo_path: &Path,
        output: &mut (dyn AsyncWrite + Send + Unpin),
        meta: &SessionMeta,
        key_line: &str,
        repo_name: &str,
    ) -> Result<()> {
        match tokio::fs::metadata(repo_path).await {
            Ok(_) => return Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to stat {}", repo_path.display()))
            }
        }

        tokio::fs::create_dir_all(repo_path)
            .await
            .with_context(|| format!("failed to create {}", repo_path.display()))?;
        tokio::fs::set_permissions(repo_path, std::fs::Permissions::from_mode(0o755))
            .await
            .with_context(|| format!("failed to set permissions on {}", repo_path.display()))?;

        let initialized = match &self.new_repo_hook {
            Some(hook) => {
                hook.create(repo_path, output, meta, key_line, repo_name)
                    .await
            }
            None => init_bare(repo_path).await,
        };
        if let Err(error) = initialized {
            if let Err(cleanup) = tokio::fs::remove_dir_all(repo_path).await {
                warn!(
                    repo = %repo_path.display(),
                    error = %cleanup,
                    "failed to remove repo after init failure"
                );
            }
            return Err(error);
        }
        Ok(())
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

    async fn run_upload(
        &self,
        repo_path: &Path,
        stdin: &mut (dyn AsyncRead + Send + Unpin),
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
        repo_name: &str,
        meta: &SessionMeta,
    ) -> Result<u32> {
        info!(user = %meta.user, repo = %repo_name, path = %repo_path.display(), "git fetch");
        let started = Instant::now();
        let mut cmd = Command::new(self.binary_for(GitVerb::UploadPack));
        cmd.arg(repo_path);
        let result = run_exec(cmd, stdin, stdout, stderr).await;
        info!(
            user = %meta.user,
            repo = %repo_name,
            elapsed = ?started.elapsed(),
            "git fetch finished"
        );
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_receive(
        &self,
        repo_path: &Path,
        stdin: &mut (dyn AsyncRead + Send + Unpin),
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
        session: &SessionRecord,
        repo_name: &str,
        meta: &SessionMeta,
    ) -> Result<u32> {
        if let Some(hook) = &self.presubmission_hook {
            hook.check(repo_path, stderr, meta, &session.key_line, repo_name)
                .await
                .context("presubmission hook refused the push")?;
        }

        info!(user = %meta.user, repo = %repo_name, path = %repo_path.display(), "git push");
        let started = Instant::now();
        let mut cmd = Command::new(self.binary_for(GitVerb::ReceivePack));
        cmd.arg(repo_path);

        let mut tagger = Tagger::new(BoundedReader::new(stdin, self.max_push_size));
        let result = run_exec(cmd, &mut tagger, stdout, stderr).await;
        info!(
            user = %meta.user,
            repo = %repo_name,
            elapsed = ?started.elapsed(),
            "git push finished"
        );

        let status = match result {
            Ok(status) => status,
            Err(error) => {
                if let Some(protocol_error) = tagger.error() {
                    let _ = stderr
                        .write_all(format!("error: {protocol_error}\n").as_bytes())
                        .await;
                }
                return Err(error);
            }
        };

        if let Some(hook) = &self.submission_hook {
            let hook_started = Instant::now();
            let hook_status = hook
                .submitted(
                    repo_path,
                    stderr,
                    meta,
                    &session.key_line,
                    repo_name,
                    tagger.new_tags(),
                )
                .await?;
            info!(
                user = %meta.user,
                repo = %repo_name,
                elapsed = ?hook_started.elapsed(),
                "processed submission"
            );
            return Ok(hook_status);
        }
        Ok(status)
    }
}

async fn init_bare(repo_path: &Path) -> Result<()> {
    let output = Command::new("git")
        .arg("--git-dir")
        .arg(repo_path)
        .arg("init")
        .arg("--bare")
        .output()
        .await
        .context("failed to run git init")?;
    if !output.status.success() {
        bail!(
            "git init --bare failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[async_trait]
impl CommandHandler for RepoSubmissions {
    async fn auth_publickey(&self, meta: &SessionMeta, key: &PublicKey) -> Result<bool> {
        let key_line = authorized_key_line(key);
        let user_id = match &self.auth_hook {
            Some(hook) => match hook.authenticate(meta, &key_line).await {
                Ok(Some(assigned)) => assigned,
                Ok(None) => user_id_from_key(key),
                Err(error) => {
                    warn!(
                        user = %meta.user,
                        error = %format!("{error:#}"),
                        "auth hook rejected key"
                    );
                    return Ok(false);
                }
            },
            None => user_id_from_key(key),
        };
        self.registry
            .insert(meta.session_id, SessionRecord { key_line, user_id });
        Ok(true)
    }

    async fn run_command(
        &self,
        command: &str,
        stdin: &mut (dyn AsyncRead + Send + Unpin),
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
        meta: &SessionMeta,
    ) -> Result<u32> {
        let session = self
            .registry
            .get(meta.session_id)
            .context("session missing from registry: exec before successful public-key auth")?;

        let (verb, repo_name) = match parse_command(command) {
            Ok(parsed) => parsed,
            Err(rejection) => {
                stderr
                    .write_all(rejection.message(command).as_bytes())
                    .await?;
                return Ok(1);
            }
        };

        let repo_path = self.repo_path(&session.user_id, &repo_name);
        let guard = self.locks.acquire(&repo_path.to_string_lossy()).await;

        if let Err(error) = self
            .ensure_repo(&repo_path, stderr, meta, &session.key_line, &repo_name)
            .await
        {
            return Err(error);
        }

        // After initialization the lock only matters for clean teardown;
        // concurrent git subprocesses share the directory under git's own
        // locking.
        let guard = if self.clean {
            Some(guard)
        } else {
            drop(guard);
            None
        };

        let result = match verb {
            GitVerb::UploadPack => {
                self.run_upload(&repo_path, stdin, stdout, stderr, &repo_name, meta)
                    .await
            }
            GitVerb::ReceivePack => {
                self.run_receive(&repo_path, stdin, stdout, stderr, &session, &repo_name, meta)
                    .await
            }
        };

        if let Some(guard) = guard {
            if let Err(error) = tokio::fs::remove_dir_all(&repo_path).await {
                warn!(
                    repo = %repo_path.display(),
                    error = %error,
                    "failed to remove repo during clean teardown"
                );
            }
            drop(guard);
        }
        result
    }

    async fn session_closed(&self, session_id: SessionId) {
        self.registry.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::load_authorized_keys;
    use crate::pktline;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

    fn test_key() -> PublicKey {
        load_authorized_keys(KEY).unwrap().remove(0)
    }

    fn meta() -> SessionMeta {
        SessionMeta {
            session_id: SessionId::random(),
            user: "git".to_string(),
            remote_addr: None,
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn storage_in(dir: &Path) -> StoragePathFn {
        let root = dir.to_path_buf();
        Box::new(move |user_id, repo_name| root.join(hmac_repo_id(user_id, repo_name)))
    }

    /// Stands in for `git init --bare` so tests need no real git binary.
    struct MarkerNewRepo;

    #[async_trait]
    impl NewRepoHook for MarkerNewRepo {
        async fn create(
            &self,
            repo_path: &Path,
            _output: &mut (dyn AsyncWrite + Send + Unpin),
            _meta: &SessionMeta,
            _key_line: &str,
            _repo_name: &str,
        ) -> Result<()> {
            std::fs::write(repo_path.join("HEAD"), "ref: refs/heads/master\n")?;
            Ok(())
        }
    }

    struct FailingNewRepo;

    #[async_trait]
    impl NewRepoHook for FailingNewRepo {
        async fn create(
            &self,
            _repo_path: &Path,
            _output: &mut (dyn AsyncWrite + Send + Unpin),
            _meta: &SessionMeta,
            _key_line: &str,
            _repo_name: &str,
        ) -> Result<()> {
            bail!("new repo hook exploded")
        }
    }

    #[derive(Default)]
    struct CaptureSubmission {
        seen: Mutex<Option<(String, NewTags)>>,
    }

    #[async_trait]
    impl SubmissionHook for CaptureSubmission {
        async fn submitted(
            &self,
            _repo_path: &Path,
            _output: &mut (dyn AsyncWrite + Send + Unpin),
            _meta: &SessionMeta,
            _key_line: &str,
            repo_name: &str,
            tags: &NewTags,
        ) -> Result<u32> {
            *self.seen.lock().unwrap() = Some((repo_name.to_string(), tags.clone()));
            Ok(0)
        }
    }

    fn push_stream(ref_line: &str, pack: &[u8]) -> Vec<u8> {
        let mut input = format!("{:04x}", ref_line.len() + 4).into_bytes();
        input.extend_from_slice(ref_line.as_bytes());
        input.extend_from_slice(pktline::FLUSH);
        input.extend_from_slice(pack);
        input
    }

    async fn authed(subs: &RepoSubmissions) -> SessionMeta {
        let meta = meta();
        assert!(subs.auth_publickey(&meta, &test_key()).await.unwrap());
        meta
    }

    #[tokio::test]
    async fn hmac_repo_ids_are_deterministic_and_scoped() {
        let a = hmac_repo_id("alice", "repo");
        assert_eq!(a, hmac_repo_id("alice", "repo"));
        assert_ne!(a, hmac_repo_id("alice", "other"));
        assert_ne!(a, hmac_repo_id("bob", "repo"));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn exec_without_auth_is_fatal() {
        let subs = RepoSubmissions::default();
        let mut stdin: &[u8] = b"";
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let err = subs
            .run_command(
                "git-upload-pack 'repo'",
                &mut stdin,
                &mut stdout,
                &mut stderr,
                &meta(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("session missing from registry"));
    }

    #[tokio::test]
    async fn fetch_initializes_and_serves_the_repo() {
        let tmp = TempDir::new().unwrap();
        let subs = RepoSubmissions {
            storage_path: Some(storage_in(tmp.path())),
            new_repo_hook: Some(Arc::new(MarkerNewRepo)),
            upload_pack_bin: Some("echo".to_string()),
            ..Default::default()
        };
        let meta = authed(&subs).await;

        let mut stdin: &[u8] = b"";
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let status = subs
            .run_command(
                "git-upload-pack 'myrepo'",
                &mut stdin,
                &mut stdout,
                &mut stderr,
                &meta,
            )
            .await
            .unwrap();
        assert_eq!(status, 0);

        let printed = String::from_utf8(stdout).unwrap();
        let repo_path = PathBuf::from(printed.trim());
        assert!(repo_path.starts_with(tmp.path()));
        assert!(repo_path.join("HEAD").is_file());
    }

    #[tokio::test]
    async fn failed_init_removes_the_directory() {
        let tmp = TempDir::new().unwrap();
        let subs = RepoSubmissions {
            storage_path: Some(storage_in(tmp.path())),
            new_repo_hook: Some(Arc::new(FailingNewRepo)),
            upload_pack_bin: Some("echo".to_string()),
            ..Default::default()
        };
        let meta = authed(&subs).await;

        let mut stdin: &[u8] = b"";
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let err = subs
            .run_command(
                "git-upload-pack 'myrepo'",
                &mut stdin,
                &mut stdout,
                &mut stderr,
                &meta,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("new repo hook exploded"));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn push_rewrites_refs_and_reports_tags() {
        let tmp = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        // Stand-in receive-pack that records its rewritten stdin.
        let receive = write_script(
            scripts.path(),
            "receive-pack",
            "#!/bin/sh\ncat > \"$1/input\"\n",
        );
        let capture = Arc::new(CaptureSubmission::default());
        let subs = RepoSubmissions {
            storage_path: Some(storage_in(tmp.path())),
            new_repo_hook: Some(Arc::new(MarkerNewRepo)),
            submission_hook: Some(capture.clone()),
            receive_pack_bin: Some(receive),
            ..Default::default()
        };
        let meta = authed(&subs).await;

        let new_oid = "b".repeat(40);
        let input = push_stream(
            &format!("{} {new_oid} refs/heads/main\0report-status", "a".repeat(40)),
            b"PACKDATA",
        );
        let mut stdin: &[u8] = &input;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let status = subs
            .run_command(
                "git-receive-pack 'myrepo'",
                &mut stdin,
                &mut stdout,
                &mut stderr,
                &meta,
            )
            .await
            .unwrap();
        assert_eq!(status, 0);

        let (name, tags) = capture.seen.lock().unwrap().clone().unwrap();
        assert_eq!(name, "myrepo");
        let created = &tags[&new_oid];
        assert_eq!(created.len(), 1);
        assert!(created[0].starts_with("submissions/"));
        assert!(created[0].ends_with("/refs/heads/main"));

        // The subprocess saw the rewritten section followed by the pack.
        let recorded = std::fs::read(
            tmp.path()
                .join(hmac_repo_id(&user_id_from_key(&test_key()), "myrepo"))
                .join("input"),
        )
        .unwrap();
        let text = String::from_utf8_lossy(&recorded);
        assert!(text.contains("refs/tags/submissions/"));
        assert!(!text.contains("report-status"));
        assert!(text.ends_with("PACKDATA"));
    }

    #[tokio::test]
    async fn clean_mode_removes_the_repo_after_the_operation() {
        let tmp = TempDir::new().unwrap();
        let subs = RepoSubmissions {
            storage_path: Some(storage_in(tmp.path())),
            new_repo_hook: Some(Arc::new(MarkerNewRepo)),
            upload_pack_bin: Some("echo".to_string()),
            clean: true,
            ..Default::default()
        };
        let meta = authed(&subs).await;

        let mut stdin: &[u8] = b"";
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        subs.run_command(
            "git-upload-pack 'myrepo'",
            &mut stdin,
            &mut stdout,
            &mut stderr,
            &meta,
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn oversized_push_fails() {
        let tmp = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        // Consumes whatever arrives and exits 0: the quota trip alone must
        // fail the push.
        let receive = write_script(
            scripts.path(),
            "receive-pack",
            "#!/bin/sh\ncat > /dev/null\n",
        );
        let subs = RepoSubmissions {
            storage_path: Some(storage_in(tmp.path())),
            new_repo_hook: Some(Arc::new(MarkerNewRepo)),
            receive_pack_bin: Some(receive),
            max_push_size: 1024,
            ..Default::default()
        };
        let meta = authed(&subs).await;

        let input = push_stream(
            &format!("{} {} refs/heads/main\0caps", "a".repeat(40), "b".repeat(40)),
            &vec![b'x'; 2048],
        );
        let mut stdin: &[u8] = &input;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let err = subs
            .run_command(
                "git-receive-pack 'myrepo'",
                &mut stdin,
                &mut stdout,
                &mut stderr,
                &meta,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("error streaming subprocess stdin"));
    }

    #[tokio::test]
    async fn pushing_submission_tags_is_refused() {
        let tmp = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        // Tolerant stand-in again: the rewriter's refusal alone must fail
        // the push.
        let receive = write_script(
            scripts.path(),
            "receive-pack",
            "#!/bin/sh\ncat > /dev/null\n",
        );
        let subs = RepoSubmissions {
            storage_path: Some(storage_in(tmp.path())),
            new_repo_hook: Some(Arc::new(MarkerNewRepo)),
            receive_pack_bin: Some(receive),
            ..Default::default()
        };
        let meta = authed(&subs).await;

        let input = push_stream(
            &format!(
                "{} {} refs/tags/submissions/foo\0caps",
                "a".repeat(40),
                "b".repeat(40)
            ),
            b"PACK",
        );
        let mut stdin: &[u8] = &input;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let result = subs
            .run_command(
                "git-receive-pack 'myrepo'",
                &mut stdin,
                &mut stdout,
                &mut stderr,
                &meta,
            )
            .await;
        assert!(result.is_err());
        assert!(String::from_utf8_lossy(&stderr)
            .contains("error: pushing submission tags disallowed"));
    }

    #[tokio::test]
    async fn presubmission_hook_can_refuse_a_push() {
        struct Refuse;

        #[async_trait]
        impl PresubmissionHook for Refuse {
            async fn check(
                &self,
                _repo_path: &Path,
                _output: &mut (dyn AsyncWrite + Send + Unpin),
                _meta: &SessionMeta,
                _key_line: &str,
                _repo_name: &str,
            ) -> Result<()> {
                bail!("not today")
            }
        }

        let tmp = TempDir::new().unwrap();
        let subs = RepoSubmissions {
            storage_path: Some(storage_in(tmp.path())),
            new_repo_hook: Some(Arc::new(MarkerNewRepo)),
            presubmission_hook: Some(Arc::new(Refuse)),
            ..Default::default()
        };
        let meta = authed(&subs).await;

        let mut stdin: &[u8] = b"";
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let err = subs
            .run_command(
                "git-receive-pack 'myrepo'",
                &mut stdin,
                &mut stdout,
                &mut stderr,
                &meta,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("presubmission hook"));
    }

    #[tokio::test]
    async fn auth_hook_identity_overrides_key_hash() {
        struct FixedId;

        #[async_trait]
        impl AuthHook for FixedId {
            async fn authenticate(
                &self,
                _meta: &SessionMeta,
                _key_line: &str,
            ) -> Result<Option<String>> {
                Ok(Some("team-shared".to_string()))
            }
        }

        let tmp = TempDir::new().unwrap();
        let subs = RepoSubmissions {
            storage_path: Some(storage_in(tmp.path())),
            new_repo_hook: Some(Arc::new(MarkerNewRepo)),
            upload_pack_bin: Some("echo".to_string()),
            auth_hook: Some(Arc::new(FixedId)),
            ..Default::default()
        };
        let meta = authed(&subs).await;

        let mut stdin: &[u8] = b"";
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        subs.run_command(
            "git-upload-pack 'myrepo'",
            &mut stdin,
            &mut stdout,
            &mut stderr,
            &meta,
        )
        .await
        .unwrap();
        let printed = String::from_utf8(stdout).unwrap();
        assert!(printed.contains(&hmac_repo_id("team-shared", "myrepo")));
    }

    #[tokio::test]
    async fn rejecting_auth_hook_blocks_the_connection() {
        struct Deny;

        #[async_trait]
        impl AuthHook for Deny {
            async fn authenticate(
                &self,
                _meta: &SessionMeta,
                _key_line: &str,
            ) -> Result<Option<String>> {
                bail!("unknown key")
            }
        }

        let subs = RepoSubmissions {
            auth_hook: Some(Arc::new(Deny)),
            ..Default::default()
        };
        assert!(!subs.auth_publickey(&meta(), &test_key()).await.unwrap());
    }

    #[tokio::test]
    async fn session_end_clears_the_registry() {
        let subs = RepoSubmissions::default();
        let meta = authed(&subs).await;
        subs.session_closed(meta.session_id).await;

        let mut stdin: &[u8] = b"";
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        assert!(subs
            .run_command(
                "git-upload-pack 'repo'",
                &mut stdin,
                &mut stdout,
                &mut stderr,
                &meta,
            )
            .await
            .is_err());
    }
}
