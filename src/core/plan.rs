use super::inspect::Inspector;
use super::runner::CommandError;
use super::Snapshot;
use crate::model::{DivergedPolicy, JobConfig};
use chrono::{DateTime, Local};
use std::fmt;
use strum_macros::Display;
use thiserror::Error;

const SNAPSHOT_TIME_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Full,
    Incremental,
}

/// What this run will send. Derived fresh on every run.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferPlan {
    pub mode: TransferMode,
    pub base_snapshot: Option<Snapshot>,
    pub new_snapshot_name: String,
    /// The source already has a snapshot with the new name; it is reused rather than created.
    pub reuse_snapshot: bool,
    pub destination_exists: bool,
    pub resume_token: Option<String>,
}

impl TransferPlan {
    pub fn is_resume(&self) -> bool {
        self.resume_token.is_some()
    }

    /// The newest shared snapshot is the one this run would send.
    pub fn is_up_to_date(&self) -> bool {
        self.resume_token.is_none()
            && self
                .base_snapshot
                .as_ref()
                .map_or(false, |base| base.name == self.new_snapshot_name)
    }

    /// Receive must be forced when a full stream lands on an existing dataset.
    pub fn force_receive(&self) -> bool {
        self.mode == TransferMode::Full && self.destination_exists && !self.is_resume()
    }
}

impl fmt::Display for TransferPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(token) = &self.resume_token {
            return write!(f, "resume interrupted transfer (token {})", token);
        }
        match &self.base_snapshot {
            Some(base) => write!(f, "{} from {} to {}", self.mode, base.name, self.new_snapshot_name),
            None => write!(f, "{} of {}", self.mode, self.new_snapshot_name),
        }
    }
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("{dataset} on {host} exists but shares no verified snapshot with the source; refusing to overwrite it")]
    Diverged { dataset: String, host: String },
}

pub fn snapshot_name(prefix: &str, now: DateTime<Local>) -> String {
    format!("{}-{}", prefix, now.format(SNAPSHOT_TIME_FORMAT))
}

/// Full when there is no destination or no verified common point, otherwise
/// incremental from the newest common snapshot.
pub fn decide(destination_exists: bool, common: &[Snapshot]) -> (TransferMode, Option<Snapshot>) {
    match (destination_exists, common.first()) {
        (true, Some(base)) => (TransferMode::Incremental, Some(base.clone())),
        _ => (TransferMode::Full, None),
    }
}

pub struct Planner<'i, 'r, 'a> {
    inspector: &'i Inspector<'r, 'a>,
}

impl<'i, 'r, 'a> Planner<'i, 'r, 'a> {
    pub fn new(inspector: &'i Inspector<'r, 'a>) -> Self {
        Self { inspector }
    }

    pub fn plan(&self, job: &JobConfig, now: DateTime<Local>) -> Result<TransferPlan, PlanError> {
        let source = job.source();
        let destination = job.destination();
        let new_snapshot_name = snapshot_name(&job.snapshot_prefix, now);

        let source_snapshots = self.inspector.list_snapshots(source.dataset, source.host)?;
        let reuse_snapshot = source_snapshots.iter().any(|s| s.name == new_snapshot_name);

        let destination_exists = self.inspector.dataset_exists(destination.dataset, destination.host);
        let resume_token = if job.resume_support {
            self.inspector.resume_token(destination.dataset, destination.host)
        } else {
            None
        };

        let common = if destination_exists {
            self.inspector.find_verified_common_snapshots(
                source.dataset,
                source.host,
                destination.dataset,
                destination.host,
            )?
        } else {
            Vec::new()
        };
        let (mode, base_snapshot) = decide(destination_exists, &common);

        let plan = TransferPlan {
            mode,
            base_snapshot,
            new_snapshot_name,
            reuse_snapshot,
            destination_exists,
            resume_token,
        };

        if plan.force_receive() && job.on_diverged == DivergedPolicy::Abort {
            return Err(PlanError::Diverged {
                dataset: destination.dataset.to_string(),
                host: destination.host.to_string(),
            });
        }
        Ok(plan)
    }
}
