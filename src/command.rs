//! Validation of the exec command a git client sends over SSH.

use std::fmt;

/// The two git smart-transport subcommands a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitVerb {
    ReceivePack,
    UploadPack,
}

impl GitVerb {
    /// Default server-side binary for the verb.
    pub fn binary(&self) -> &'static str {
        match self {
            GitVerb::ReceivePack => "git-receive-pack",
            GitVerb::UploadPack => "git-upload-pack",
        }
    }
}

impl fmt::Display for GitVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// Why an exec command string was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Not two space-separated tokens with a known verb.
    InvalidCommand,
    /// Repository name escapes the flat namespace.
    InvalidRepo(String),
}

impl CommandError {
    /// Message written to the client's stderr before exit-status 1.
    pub fn message(&self, command: &str) -> String {
        match self {
            CommandError::InvalidCommand => format!("invalid command: {command:?}\r\n"),
            CommandError::InvalidRepo(repo) => format!("invalid repo: {repo:?}\r\n"),
        }
    }
}

/// Parse an exec payload of the form `git-upload-pack 'name'`.
///
/// The repository name is stripped of surrounding quotes and slashes and
/// must not contain a path separator afterwards: the namespace is flat and
/// traversal is refused outright.
pub fn parse_command(command: &str) -> Result<(GitVerb, String), CommandError> {
    let parts: Vec<&str> = command.split(' ').collect();
    if parts.len() != 2 {
        return Err(CommandError::InvalidCommand);
    }
    let verb = match parts[0] {
        "git-receive-pack" => GitVerb::ReceivePack,
        "git-upload-pack" => GitVerb::UploadPack,
        _ => return Err(CommandError::InvalidCommand),
    };
    let repo = parts[1].trim_matches(|c| c == '\'' || c == '/');
    if repo.contains('/') {
        return Err(CommandError::InvalidRepo(repo.to_string()));
    }
    Ok((verb, repo.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_verbs() {
        assert_eq!(
            parse_command("git-upload-pack 'myrepo'").unwrap(),
            (GitVerb::UploadPack, "myrepo".to_string())
        );
        assert_eq!(
            parse_command("git-receive-pack 'myrepo'").unwrap(),
            (GitVerb::ReceivePack, "myrepo".to_string())
        );
    }

    #[test]
    fn strips_quotes_and_slashes() {
        assert_eq!(
            parse_command("git-upload-pack '/myrepo/'").unwrap().1,
            "myrepo"
        );
        assert_eq!(parse_command("git-upload-pack myrepo").unwrap().1, "myrepo");
    }

    #[test]
    fn rejects_unknown_commands() {
        assert_eq!(
            parse_command("ls -la").unwrap_err(),
            CommandError::InvalidCommand
        );
        assert_eq!(
            parse_command("git-upload-pack").unwrap_err(),
            CommandError::InvalidCommand
        );
        assert_eq!(
            parse_command("git-upload-pack a b").unwrap_err(),
            CommandError::InvalidCommand
        );
    }

    #[test]
    fn rejects_path_traversal() {
        assert_eq!(
            parse_command("git-upload-pack '../etc'").unwrap_err(),
            CommandError::InvalidRepo("../etc".to_string())
        );
        assert_eq!(
            parse_command("git-upload-pack 'a/b'").unwrap_err(),
            CommandError::InvalidRepo("a/b".to_string())
        );
    }

    #[test]
    fn rejection_messages_name_the_offender() {
        let err = parse_command("git-upload-pack '../etc'").unwrap_err();
        assert!(err
            .message("git-upload-pack '../etc'")
            .starts_with("invalid repo:"));
        let err = parse_command("rm -rf").unwrap_err();
        assert!(err.message("rm -rf").starts_with("invalid command:"));
    }
}
