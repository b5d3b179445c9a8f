//! gitserve: a restricted SSH transport front-end for git repositories.
//!
//! The server terminates SSH, authenticates clients by public key, refuses
//! interactive shells, and brokers exactly one git smart-transport
//! subprocess (`git-receive-pack` or `git-upload-pack`) per exec request,
//! streaming the pack protocol between the SSH channel and the subprocess.
//!
//! Two dispatchers implement the policy layer on top of the shared
//! [`ssh::RestrictedServer`]:
//!
//! - [`host::RepoHosting`] serves pre-existing bare repositories from a
//!   base directory (or one fixed repository), optionally restricted to an
//!   authorized-keys list.
//! - [`submit::RepoSubmissions`] maintains per-user submission
//!   repositories, rewrites every pushed ref into a tag under
//!   `refs/tags/submissions/<id>/`, and drives the auth, new-repo,
//!   presubmission, and submission hooks.

pub mod bounded;
pub mod command;
pub mod debug;
pub mod exec;
pub mod hooks;
pub mod host;
pub mod keys;
pub mod locks;
pub mod metrics;
pub mod pktline;
pub mod registry;
pub mod ssh;
pub mod submit;
pub mod tagger;
