use crate::argv;
use crate::observer::Reporter;
use crate::sys::process::{ExecError, Executor, RawOutput};
use crate::sys::sanoid::{PRUNE_SNAPSHOTS, SYNCOID_DRY_RUN, TAKE_SNAPSHOTS};
use crate::sys::ssh::{Host, SshOptions};
use std::path::Path;
use std::time::Duration;
use strum_macros::Display;
use thiserror::Error;

/// Remote shells report a missing command with this status.
const COMMAND_NOT_FOUND: i32 = 127;
const EXCERPT_CHARS: usize = 300;
const TOOL_LOOKUP: &str = "command -v ";

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("'{program}' is not installed on {host}")]
    ToolMissing { program: String, host: Host },
    #[error("`{command}` on {host} failed with {}: {}", describe_code(.code), excerpt(.stderr))]
    CommandFailed {
        command: String,
        host: Host,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("`{command}` on {host} did not finish within {timeout:?}")]
    Timeout {
        command: String,
        host: Host,
        timeout: Duration,
    },
    #[error("unable to run `{command}` on {host}")]
    Launch {
        command: String,
        host: Host,
        #[source]
        source: std::io::Error,
    },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

/// The last meaningful stderr line, shortened for a log line.
pub fn excerpt(stderr: &str) -> String {
    let line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("no error output");
    let line = line.trim();
    if line.chars().count() > EXCERPT_CHARS {
        format!("{}...", line.chars().take(EXCERPT_CHARS).collect::<String>())
    } else {
        line.to_string()
    }
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    #[strum(serialize = "read-only")]
    ReadOnly,
    #[strum(serialize = "action")]
    Action,
}

/// A read-only check that `program` is on the `PATH` of the host that runs it.
pub fn tool_lookup(program: &str) -> Vec<String> {
    argv!("sh", "-c", format!("{}{}", TOOL_LOOKUP, program))
}

fn is_tool_lookup(argv: &[String]) -> bool {
    match argv {
        [_, flag, script] if flag == "-c" => script.strip_prefix(TOOL_LOOKUP).map_or(false, |program| {
            !program.is_empty()
                && program
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "._/+-".contains(c))
        }),
        _ => false,
    }
}

/// Decide whether an argv may change state. Anything not known to be a query is an action.
pub fn classify(argv: &[String]) -> Classification {
    let program = match argv.first() {
        Some(program) => Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program),
        None => return Classification::Action,
    };
    let has_flag = |flag: &str| argv.iter().skip(1).any(|a| a == flag);

    match program {
        "zfs" => match argv.get(1).map(String::as_str) {
            Some("list") | Some("get") | Some("version") => Classification::ReadOnly,
            _ => Classification::Action,
        },
        "sanoid" if has_flag(TAKE_SNAPSHOTS) || has_flag(PRUNE_SNAPSHOTS) => Classification::Action,
        "sanoid" => Classification::ReadOnly,
        "syncoid" if has_flag(SYNCOID_DRY_RUN) => Classification::ReadOnly,
        "sh" if is_tool_lookup(argv) => Classification::ReadOnly,
        _ => Classification::Action,
    }
}

/// Runs commands for one job on the local machine or over SSH.
pub struct CommandRunner<'a> {
    executor: &'a dyn Executor,
    ssh: SshOptions,
    ssh_user: String,
    timeout: Option<Duration>,
    dry_run: bool,
    reporter: Reporter,
}

impl<'a> CommandRunner<'a> {
    pub fn new(
        executor: &'a dyn Executor,
        ssh: SshOptions,
        ssh_user: &str,
        timeout: Option<Duration>,
        dry_run: bool,
        reporter: Reporter,
    ) -> Self {
        Self {
            executor,
            ssh,
            ssh_user: ssh_user.to_string(),
            timeout,
            dry_run,
            reporter,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// The argv that actually executes `argv` on `host`.
    pub fn resolve(&self, argv: &[String], host: &Host) -> Vec<String> {
        match host {
            Host::Local => argv.to_vec(),
            Host::Remote(name) => self.ssh.wrap(name, &self.ssh_user, argv),
        }
    }

    /// Run `argv` on `host`. With `check`, a non-zero exit is an error;
    /// without it the caller inspects the output.
    pub fn run(&self, argv: &[String], host: &Host, check: bool) -> Result<RawOutput, CommandError> {
        let command = shell_words::join(argv);
        let resolved = self.resolve(argv, host);

        if self.dry_run && classify(argv) == Classification::Action {
            self.reporter
                .info(format!("[dry-run] Would run on {}: {}", host, shell_words::join(&resolved)));
            return Ok(RawOutput {
                code: Some(0),
                ..Default::default()
            });
        }

        let program = argv.first().cloned().unwrap_or_default();
        let output = self.executor.execute(&resolved, self.timeout).map_err(|e| match e {
            ExecError::NotFound(missing) => CommandError::ToolMissing {
                program: missing,
                host: Host::Local,
            },
            ExecError::TimedOut(timeout) => CommandError::Timeout {
                command: command.clone(),
                host: host.clone(),
                timeout,
            },
            ExecError::Io(source) => CommandError::Launch {
                command: command.clone(),
                host: host.clone(),
                source,
            },
        })?;

        if !host.is_local() && output.code == Some(COMMAND_NOT_FOUND) {
            return Err(CommandError::ToolMissing {
                program,
                host: host.clone(),
            });
        }
        if check && !output.success() {
            return Err(CommandError::CommandFailed {
                command,
                host: host.clone(),
                code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::observer::{ChannelObserver, JobEvent};
    use crossbeam_channel::{unbounded, Receiver};
    use std::sync::Arc;

    pub fn reporter() -> (Reporter, Receiver<JobEvent>) {
        let (sender, receiver) = unbounded();
        (Reporter::new(Arc::new(ChannelObserver::new(sender))), receiver)
    }

    pub fn ok(stdout: &str) -> Result<RawOutput, ExecError> {
        Ok(RawOutput {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    pub fn failed(code: i32, stderr: &str) -> Result<RawOutput, ExecError> {
        Ok(RawOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    pub fn runner<'a>(executor: &'a dyn Executor, dry_run: bool) -> CommandRunner<'a> {
        CommandRunner::new(executor, SshOptions::default(), "root", None, dry_run, reporter().0)
    }
}
