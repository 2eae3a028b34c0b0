use super::inspect::Inspector;
use super::runner::{CommandError, CommandRunner};
use super::Snapshot;
use crate::model::{Endpoint, JobConfig, Retention};
use crate::sys::{sanoid, zfs};
use log::*;

#[derive(Debug, PartialEq)]
pub struct RetentionEvaluation {
    pub keep: Vec<Snapshot>,
    pub drop: Vec<Snapshot>,
}

/// Keep the `newest_count` newest snapshots carrying `prefix`. Snapshots
/// without the prefix belong to someone else and are never dropped.
pub fn evaluate_retention(mut snapshots: Vec<Snapshot>, prefix: &str, newest_count: usize) -> RetentionEvaluation {
    let owned_prefix = format!("{}-", prefix);
    snapshots.retain(|s| s.name.starts_with(&owned_prefix));
    snapshots.sort_unstable_by(|a, b| b.creation.cmp(&a.creation).then_with(|| b.name.cmp(&a.name)));

    let drop = if snapshots.len() > newest_count {
        snapshots.split_off(newest_count)
    } else {
        Vec::new()
    };
    RetentionEvaluation { keep: snapshots, drop }
}

pub struct Pruner<'r, 'a> {
    runner: &'r CommandRunner<'a>,
    sanoid_path: &'r str,
}

impl<'r, 'a> Pruner<'r, 'a> {
    pub fn new(runner: &'r CommandRunner<'a>, sanoid_path: &'r str) -> Self {
        Self { runner, sanoid_path }
    }

    /// Apply the job's retention on one side. Returns the number of snapshots destroyed,
    /// or `None` when pruning was delegated to sanoid or disabled.
    pub fn prune(&self, job: &JobConfig, endpoint: Endpoint<'_>) -> Result<Option<usize>, CommandError> {
        match &job.retention {
            Retention::None => Ok(None),
            Retention::Sanoid { config_dir } => {
                self.runner.run(
                    &sanoid::prune_snapshots(self.sanoid_path, config_dir.as_deref()),
                    endpoint.host,
                    true,
                )?;
                Ok(None)
            }
            Retention::KeepNewest(count) => {
                let snapshots = Inspector::new(self.runner).list_snapshots(endpoint.dataset, endpoint.host)?;
                let evaluation = evaluate_retention(snapshots, &job.snapshot_prefix, count.get());
                for snapshot in &evaluation.drop {
                    info!("Pruning {} on {}.", snapshot, endpoint.host);
                    self.runner.run(
                        &zfs::destroy_snapshot(&snapshot.dataset, &snapshot.name, job.recursive),
                        endpoint.host,
                        true,
                    )?;
                }
                Ok(Some(evaluation.drop.len()))
            }
        }
    }
}
