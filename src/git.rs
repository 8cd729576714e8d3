use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use log::{debug, info};
use thiserror::Error;
use crate::auth;

const SSH_USER: &str = "git";
const TAG_REFSPEC: &str = "refs/tags/*:refs/tags/*";

#[derive(Error, Debug)]
pub enum Error {
    #[error("ssh key {path}: {source}")]
    SshKey {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("github token: {0}")]
    Token(#[from] auth::Error),

    #[error("no git credentials: set an ssh key or a token file")]
    NoCredentials,

    #[error("failed to run git: {0}")]
    Spawn(std::io::Error),

    #[error("git {args} exited with {status}: {stderr}")]
    Command {
        args: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("git rev-parse HEAD returned empty output")]
    EmptyHead,
}

/// How git authenticates against the release repository.
#[derive(Debug, Clone, PartialEq)]
pub enum GitAuth {
    /// Public key authentication as user `git`, host keys are not verified.
    Ssh { key_path: PathBuf },
    /// `Authorization: Bearer` over https.
    Token { token: String },
}

/// The release repository as seen from git: its URL and the credentials to push to it.
#[derive(Debug, Clone)]
pub struct GitRemote {
    auth: GitAuth,
    url: String,
}

impl GitRemote {
    /// An ssh key wins over a token file.
    pub fn compose(
        ssh_key: Option<&Path>,
        token_path: Option<&Path>,
        server: &str,
        organization: &str,
        repository: &str,
    ) -> Result<Self, Error> {
        if let Some(key_path) = ssh_key {
            std::fs::metadata(key_path).map_err(|source| Error::SshKey {
                path: key_path.to_path_buf(),
                source,
            })?;
            return Ok(Self {
                auth: GitAuth::Ssh {
                    key_path: key_path.to_path_buf(),
                },
                url: format!("ssh://{SSH_USER}@{server}/{organization}/{repository}.git"),
            });
        }
        if let Some(token_path) = token_path {
            return Ok(Self {
                auth: GitAuth::Token {
                    token: auth::read_token_file(token_path)?,
                },
                url: format!("https://{server}/{organization}/{repository}.git"),
            });
        }
        Err(Error::NoCredentials)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn auth(&self) -> &GitAuth {
        &self.auth
    }

    /// Pass credentials to a git child process through its environment.
    fn apply(&self, command: &mut Command) {
        command.env("GIT_TERMINAL_PROMPT", "0");
        match &self.auth {
            GitAuth::Ssh { key_path } => {
                command.env(
                    "GIT_SSH_COMMAND",
                    format!(
                        "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -o BatchMode=yes",
                        shell_quote(&key_path.display().to_string())
                    ),
                );
            }
            GitAuth::Token { token } => {
                command
                    .env("GIT_CONFIG_COUNT", "1")
                    .env("GIT_CONFIG_KEY_0", "http.extraHeader")
                    .env("GIT_CONFIG_VALUE_0", format!("Authorization: Bearer {token}"));
            }
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Tags the head of a kubevirtci working tree and pushes the tag.
#[derive(Debug, Clone)]
pub struct Tagger {
    remote: GitRemote,
    push_target: String,
    user_name: String,
    user_email: String,
}

impl Tagger {
    /// `push_target` defaults to the remote's URL.
    pub fn new(remote: GitRemote, push_target: Option<String>, user_name: &str, user_email: &str) -> Self {
        let push_target = push_target.unwrap_or_else(|| remote.url().to_string());
        Self {
            remote,
            push_target,
            user_name: user_name.to_string(),
            user_email: user_email.to_string(),
        }
    }

    /// Create an annotated tag named after the current unix time at HEAD and push all tags.
    /// Two calls within the same second produce the same name.
    pub fn tag_repository(&self, path: &Path) -> Result<String, Error> {
        let head = self.git(path, ["rev-parse", "HEAD"])?;
        let head = head.trim();
        if head.is_empty() {
            return Err(Error::EmptyHead);
        }

        let tag = chrono::Utc::now().timestamp().to_string();
        info!("Tagging {head} as {tag}");
        self.git(path, ["tag", "--annotate", "--message", tag.as_str(), tag.as_str(), head])?;

        info!("Pushing tags to {}", self.push_target);
        self.git(path, ["push", self.push_target.as_str(), TAG_REFSPEC])?;
        Ok(tag)
    }

    fn git<I, S>(&self, path: &Path, args: I) -> Result<String, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let printable = args
            .iter()
            .map(|arg| arg.as_ref().to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        debug!("git {printable}");

        let mut command = Command::new("git");
        command
            .args(&args)
            .current_dir(path)
            .env("GIT_AUTHOR_NAME", &self.user_name)
            .env("GIT_AUTHOR_EMAIL", &self.user_email)
            .env("GIT_COMMITTER_NAME", &self.user_name)
            .env("GIT_COMMITTER_EMAIL", &self.user_email);
        self.remote.apply(&mut command);

        let output = command.output().map_err(Error::Spawn)?;
        if !output.status.success() {
            return Err(Error::Command {
                args: printable,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
