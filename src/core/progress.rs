use super::Cancellation;
use crate::observer::Reporter;
use crate::parsing::{format_size, parse_progress_line};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError};
use log::*;
use std::collections::VecDeque;
use std::io::Read;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TAIL_LINES: usize = 10;
const COMPLETION_TOLERANCE: f64 = 0.10;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    pub completed_bytes: u64,
    pub total_bytes: Option<u64>,
    pub action: Option<String>,
}

/// Turns diagnostic lines into monotonic progress samples.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    completed: Option<u64>,
    total: Option<u64>,
    action: Option<String>,
}

impl ProgressTracker {
    pub fn new(total: Option<u64>, action: Option<String>) -> Self {
        Self {
            completed: None,
            total,
            action,
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed.unwrap_or(0)
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Returns a sample only when the line moves completed bytes forward.
    pub fn observe_line(&mut self, line: &str) -> Option<ProgressSample> {
        let parsed = match parse_progress_line(line) {
            Some(parsed) => parsed,
            None => {
                debug!("No progress in: {}", line.trim_end());
                return None;
            }
        };

        if let Some(total) = parsed.total.filter(|t| *t > 0) {
            self.total = Some(total);
        }
        let completed = parsed.completed?;
        match self.completed {
            Some(last) if completed <= last => {
                trace!("Discarding stale progress {} after {}.", completed, last);
                None
            }
            _ => {
                self.completed = Some(completed);
                Some(self.sample())
            }
        }
    }

    /// Close out the stream after the transfer succeeded.
    ///
    /// A shortfall within tolerance of the known total is reported as
    /// complete. A larger shortfall is left alone.
    pub fn finish(&mut self) -> Option<ProgressSample> {
        let completed = self.completed();
        match self.total {
            Some(total) if completed >= total => None,
            Some(total) => {
                let shortfall = (total - completed) as f64 / total as f64;
                if shortfall <= COMPLETION_TOLERANCE {
                    self.completed = Some(total);
                    Some(self.sample())
                } else {
                    warn!(
                        "Transfer reported {} of an estimated {}; leaving progress as reported.",
                        format_size(completed),
                        format_size(total)
                    );
                    None
                }
            }
            None if completed > 0 => {
                self.total = Some(completed);
                Some(self.sample())
            }
            None => None,
        }
    }

    fn sample(&self) -> ProgressSample {
        ProgressSample {
            completed_bytes: self.completed(),
            total_bytes: self.total,
            action: self.action.clone(),
        }
    }
}

#[derive(Debug)]
pub struct MonitorOutcome {
    pub tracker: ProgressTracker,
    pub tail: Vec<String>,
}

/// Reads one stage's diagnostic stream on a background thread and reports progress.
pub struct ProgressMonitor {
    done: Receiver<MonitorOutcome>,
    handle: JoinHandle<()>,
}

impl ProgressMonitor {
    pub fn spawn<R>(stream: R, tracker: ProgressTracker, reporter: Reporter, cancel: Cancellation) -> Self
    where
        R: Read + Send + 'static,
    {
        let (line_sender, lines) = unbounded();
        thread::spawn(move || split_lines(stream, |line| line_sender.send(line).is_ok()));

        let (done_sender, done) = bounded(1);
        let handle = thread::spawn(move || {
            let outcome = monitor(lines, tracker, &reporter, &cancel);
            let _ = done_sender.send(outcome);
        });
        Self { done, handle }
    }

    /// Wait up to `timeout` for the monitor to drain its stream. A monitor
    /// that does not finish in time is abandoned.
    pub fn join(self, timeout: Duration) -> Option<MonitorOutcome> {
        match self.done.recv_timeout(timeout) {
            Ok(outcome) => {
                if self.handle.join().is_err() {
                    warn!("Progress monitor thread panicked.");
                }
                Some(outcome)
            }
            Err(_) => {
                warn!("Progress monitor did not finish within {:?}.", timeout);
                None
            }
        }
    }
}

fn monitor(
    lines: Receiver<String>,
    mut tracker: ProgressTracker,
    reporter: &Reporter,
    cancel: &Cancellation,
) -> MonitorOutcome {
    let mut tail = Tail::default();
    loop {
        if cancel.is_cancelled() {
            debug!("Progress monitor stopping on cancellation.");
            break;
        }
        match lines.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                if let Some(sample) = tracker.observe_line(&line) {
                    reporter.progress(&sample);
                }
                tail.push(line);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    MonitorOutcome {
        tracker,
        tail: tail.into_lines(),
    }
}

#[derive(Default)]
struct Tail(VecDeque<String>);

impl Tail {
    fn push(&mut self, line: String) {
        if self.0.len() == TAIL_LINES {
            self.0.pop_front();
        }
        self.0.push_back(line);
    }

    fn into_lines(self) -> Vec<String> {
        self.0.into_iter().collect()
    }
}

/// Drains a stage's error output on a background thread, logging each line
/// and keeping the last few for failure reports.
pub struct StreamTail {
    done: Receiver<Vec<String>>,
}

impl StreamTail {
    pub fn spawn<R>(stream: R, label: String) -> Self
    where
        R: Read + Send + 'static,
    {
        let (sender, done) = bounded(1);
        thread::spawn(move || {
            let mut tail = Tail::default();
            split_lines(stream, |line| {
                debug!("{}: {}", label, line);
                tail.push(line);
                true
            });
            let _ = sender.send(tail.into_lines());
        });
        Self { done }
    }

    /// The last lines of the stream, or nothing if it is still open after `timeout`.
    pub fn join(self, timeout: Duration) -> Vec<String> {
        self.done.recv_timeout(timeout).unwrap_or_else(|_| {
            warn!("Error output reader did not finish within {:?}.", timeout);
            Vec::new()
        })
    }
}

/// Split on `\n` and `\r`; progress meters redraw a line with bare carriage returns.
/// Stops early when `on_line` returns false.
fn split_lines<R, F>(mut stream: R, mut on_line: F)
where
    R: Read,
    F: FnMut(String) -> bool,
{
    let mut buffer = [0u8; 4096];
    let mut pending = Vec::new();
    loop {
        let count = match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => count,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Diagnostic stream read failed: {}", e);
                break;
            }
        };
        for byte in &buffer[..count] {
            if *byte == b'\n' || *byte == b'\r' {
                if !pending.is_empty() && !on_line(String::from_utf8_lossy(&pending).into_owned()) {
                    return;
                }
                pending.clear();
            } else {
                pending.push(*byte);
            }
        }
    }
    if !pending.is_empty() {
        on_line(String::from_utf8_lossy(&pending).into_owned());
    }
}
