use log::*;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    io,
    process::{Child, Command, ExitStatus, Output, Stdio},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Build an argv from anything displayable, in the manner of `duct::cmd!`.
#[macro_export]
macro_rules! argv {
    ( $( $arg:expr ),* $(,)? ) => {
        vec![ $( $arg.to_string() ),* ]
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<Output> for RawOutput {
    fn from(output: Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("executable '{0}' was not found")]
    NotFound(String),
    #[error("process did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("process failed to launch or be waited on")]
    Io(#[from] io::Error),
}

/// Runs a single argv to completion and captures its output.
#[cfg_attr(test, mockall::automock)]
pub trait Executor {
    fn execute(&self, argv: &[String], timeout: Option<Duration>) -> Result<RawOutput, ExecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DuctExecutor;

impl Executor for DuctExecutor {
    fn execute(&self, argv: &[String], timeout: Option<Duration>) -> Result<RawOutput, ExecError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExecError::Io(io::Error::new(io::ErrorKind::InvalidInput, "empty command")))?;
        let expression = duct::cmd(program, args)
            .stdin_null()
            .stdout_capture()
            .stderr_capture()
            .unchecked();
        let handle = expression.start().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ExecError::NotFound(program.clone()),
            _ => ExecError::Io(e),
        })?;

        let timeout = match timeout {
            Some(timeout) => timeout,
            None => return Ok(handle.into_output()?.into()),
        };
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(output) = handle.try_wait()? {
                return Ok(output.clone().into());
            }
            if Instant::now() >= deadline {
                if let Err(e) = handle.kill() {
                    warn!("Failed to kill timed out process '{}': {}", program, e);
                }
                return Err(ExecError::TimedOut(timeout));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Starts one stage of a process pipeline with the given standard streams.
pub trait Spawner: Send + Sync {
    fn spawn(&self, argv: &[String], stdin: Stdio, stdout: Stdio, stderr: Stdio) -> io::Result<Child>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpawner;

impl Spawner for SystemSpawner {
    fn spawn(&self, argv: &[String], stdin: Stdio, stdout: Stdio, stderr: Stdio) -> io::Result<Child> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
        Command::new(program)
            .args(args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
    }
}

pub fn exit_code_description(status: ExitStatus) -> String {
    match status.code() {
        Some(c) => format!("exit code {}", c),
        None => "termination by signal".to_string(),
    }
}

/// Ask a child to exit with SIGTERM, then kill it if it is still running after `grace`.
pub fn terminate(child: &mut Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(e) => warn!("Unable to query process {}: {}", child.id(), e),
    }

    warn!("Terminating pipeline process PID {}.", child.id());
    if let Err(e) = signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
        debug!("SIGTERM to {} failed: {}", child.id(), e);
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }

    warn!("Killing pipeline process PID {}.", child.id());
    if let Err(e) = child.kill() {
        debug!("Kill of {} failed: {}", child.id(), e);
    }
    let _ = child.wait();
}
