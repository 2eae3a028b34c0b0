use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

const LOCAL_HOST: &str = "local";
/// Enables `pipefail` where the remote `sh` supports it, so a failing command
/// early in a chain fails the whole chain.
pub const PIPEFAIL_PREAMBLE: &str = "(set -o pipefail) 2>/dev/null && set -o pipefail;";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum Host {
    Local,
    Remote(String),
}

impl Host {
    pub fn is_local(&self) -> bool {
        matches!(self, Host::Local)
    }
}

impl From<String> for Host {
    fn from(value: String) -> Self {
        match value.trim() {
            "" | LOCAL_HOST => Host::Local,
            remote => Host::Remote(remote.to_string()),
        }
    }
}

impl From<&str> for Host {
    fn from(value: &str) -> Self {
        Host::from(value.to_string())
    }
}

impl From<Host> for String {
    fn from(host: Host) -> Self {
        host.to_string()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Local => f.write_str(LOCAL_HOST),
            Host::Remote(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SshOptions {
    pub connect_timeout: Duration,
    pub extra_options: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            extra_options: Vec::new(),
        }
    }
}

impl SshOptions {
    /// The `-o` style options without the destination, suitable for `ssh` or
    /// for passing through `syncoid --sshoption`.
    pub fn option_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        args.extend(self.extra_options.iter().cloned());
        args
    }

    /// Wrap a remote shell command line in an `ssh` invocation for `user@host`.
    pub fn wrap_command_line(&self, host: &str, ssh_user: &str, command_line: String) -> Vec<String> {
        let mut argv = vec!["ssh".to_string()];
        argv.extend(self.option_args());
        argv.push(format!("{}@{}", ssh_user, host));
        argv.push(command_line);
        argv
    }

    /// Wrap a single argv for execution on `host`. Arguments are quoted so the
    /// remote shell sees the same argument boundaries.
    pub fn wrap(&self, host: &str, ssh_user: &str, argv: &[String]) -> Vec<String> {
        self.wrap_command_line(host, ssh_user, shell_words::join(argv))
    }

    /// Wrap a chain of argvs that run connected by pipes on `host`. A chain of
    /// more than one command runs under `sh -c` with `pipefail`.
    pub fn wrap_chain(&self, host: &str, ssh_user: &str, chain: &[Vec<String>]) -> Vec<String> {
        let pipeline = chain
            .iter()
            .map(|argv| shell_words::join(argv))
            .collect::<Vec<_>>()
            .join(" | ");
        let command_line = if chain.len() > 1 {
            shell_words::join(&["sh".to_string(), "-c".to_string(), format!("{} {}", PIPEFAIL_PREAMBLE, pipeline)])
        } else {
            pipeline
        };
        self.wrap_command_line(host, ssh_user, command_line)
    }
}
