use crate::core::progress::ProgressSample;
use crate::parsing::format_size;
use chrono::{DateTime, Local};
use crossbeam_channel::Sender;
use log::*;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Receives job events. Called from the job's thread and from the progress
/// monitor thread, so implementations hand events off rather than touching
/// caller state directly.
pub trait Observer: Send + Sync {
    fn log_message(&self, text: &str, level: Level);
    fn progress_update(&self, sample: &ProgressSample);
    fn job_finished(&self, success: bool);
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub message: String,
}

/// Fans job messages out to the `log` facade, the job's log trail and the observer.
#[derive(Clone)]
pub struct Reporter {
    observer: Arc<dyn Observer>,
    trail: Arc<Mutex<Vec<LogEntry>>>,
}

impl Reporter {
    pub fn new(observer: Arc<dyn Observer>) -> Self {
        Self {
            observer,
            trail: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn log<S: Into<String>>(&self, level: Level, message: S) {
        let message = message.into();
        log!(level, "{}", message);
        self.observer.log_message(&message, level);
        self.trail.lock().unwrap_or_else(PoisonError::into_inner).push(LogEntry {
            timestamp: Local::now(),
            level,
            message,
        });
    }

    pub fn error<S: Into<String>>(&self, message: S) {
        self.log(Level::Error, message)
    }

    pub fn warn<S: Into<String>>(&self, message: S) {
        self.log(Level::Warn, message)
    }

    pub fn info<S: Into<String>>(&self, message: S) {
        self.log(Level::Info, message)
    }

    pub fn debug<S: Into<String>>(&self, message: S) {
        self.log(Level::Debug, message)
    }

    pub fn progress(&self, sample: &ProgressSample) {
        trace!("Progress: {:?}", sample);
        self.observer.progress_update(sample);
    }

    pub fn finished(&self, success: bool) {
        self.observer.job_finished(success);
    }

    pub fn trail(&self) -> Vec<LogEntry> {
        self.trail.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Log { level: Level, message: String },
    Progress(ProgressSample),
    Finished(bool),
}

/// Posts every event onto a channel for another thread to drain.
#[derive(Clone)]
pub struct ChannelObserver {
    sender: Sender<JobEvent>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<JobEvent>) -> Self {
        Self { sender }
    }

    fn post(&self, event: JobEvent) {
        if self.sender.send(event).is_err() {
            trace!("Job event receiver is gone.");
        }
    }
}

impl Observer for ChannelObserver {
    fn log_message(&self, text: &str, level: Level) {
        self.post(JobEvent::Log {
            level,
            message: text.to_string(),
        });
    }

    fn progress_update(&self, sample: &ProgressSample) {
        self.post(JobEvent::Progress(sample.clone()));
    }

    fn job_finished(&self, success: bool) {
        self.post(JobEvent::Finished(success));
    }
}

/// Terminal observer for the command line. Messages already reach the
/// logger through the `Reporter`, so only progress is rendered here,
/// at most once per interval.
pub struct ConsoleObserver {
    interval: Duration,
    last_report: Mutex<Option<Instant>>,
}

impl ConsoleObserver {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_report: Mutex::new(None),
        }
    }
}

impl Observer for ConsoleObserver {
    fn log_message(&self, _text: &str, _level: Level) {}

    fn progress_update(&self, sample: &ProgressSample) {
        let mut last_report = self.last_report.lock().unwrap_or_else(PoisonError::into_inner);
        let complete = sample.total_bytes == Some(sample.completed_bytes);
        if !complete && last_report.map_or(false, |at| at.elapsed() < self.interval) {
            return;
        }
        *last_report = Some(Instant::now());

        let action = sample.action.as_deref().unwrap_or("Transferred");
        match sample.total_bytes {
            Some(total) if total > 0 => info!(
                "{} {} of {} ({:.0}%)",
                action,
                format_size(sample.completed_bytes),
                format_size(total),
                sample.completed_bytes as f64 * 100.0 / total as f64
            ),
            _ => info!("{} {}", action, format_size(sample.completed_bytes)),
        }
    }

    fn job_finished(&self, success: bool) {
        if success {
            info!("Job finished successfully.");
        } else {
            error!("Job failed.");
        }
    }
}
