use super::inspect::Inspector;
use super::pipeline::{required_tools, PipelineExecutor, Topology};
use super::plan::{Planner, TransferPlan};
use super::retention::Pruner;
use super::runner::CommandRunner;
use super::Cancellation;
use crate::contextualize::Validation;
use crate::model::settings::RunnerSettings;
use crate::model::{Endpoint, JobConfig, Retention, Transport};
use crate::observer::{LogEntry, Observer, Reporter};
use crate::parsing::format_size;
use crate::sys::process::{Executor, Spawner};
use crate::sys::zfs;
use chrono::{DateTime, Local};
use std::sync::Arc;
use strum_macros::Display;

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Verifying,
    Planning,
    Transferring,
    Pruning,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: String,
    pub success: bool,
    pub final_state: JobState,
    /// The state the job was in when it failed.
    pub failed_in: Option<JobState>,
    pub plan: Option<TransferPlan>,
    pub log: Vec<LogEntry>,
}

impl JobReport {
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }
}

/// Sequences verification, planning, transfer and pruning for one job at a time.
pub struct JobRunner<'a> {
    executor: &'a dyn Executor,
    spawner: &'a dyn Spawner,
    settings: &'a RunnerSettings,
    observer: Arc<dyn Observer>,
    cancel: Cancellation,
    clock: fn() -> DateTime<Local>,
}

struct Failure {
    state: JobState,
    message: String,
}

impl Failure {
    fn new<S: Into<String>>(state: JobState, message: S) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }
}

impl<'a> JobRunner<'a> {
    pub fn new(
        executor: &'a dyn Executor,
        spawner: &'a dyn Spawner,
        settings: &'a RunnerSettings,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            executor,
            spawner,
            settings,
            observer,
            cancel: Cancellation::default(),
            clock: Local::now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Local>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    /// Run one job to completion. Never panics on job failure; the outcome
    /// and the full log trail are in the report.
    pub fn run(&self, job: &JobConfig) -> JobReport {
        let reporter = Reporter::new(self.observer.clone());
        let dry_run = self.settings.dry_run || job.dry_run;
        let runner = CommandRunner::new(
            self.executor,
            self.settings.ssh_options(),
            &job.ssh_user,
            Some(self.settings.command_timeout),
            dry_run,
            reporter.clone(),
        );

        reporter.info(format!(
            "Starting job {}: {} to {}{}.",
            job.display_name(),
            job.source(),
            job.destination(),
            if dry_run { " (dry run)" } else { "" }
        ));

        let mut plan = None;
        let result = self.run_states(job, &runner, &reporter, &mut plan);
        let (success, final_state, failed_in) = match result {
            Ok(()) => {
                reporter.info(format!("Job {} finished.", job.display_name()));
                (true, JobState::Done, None)
            }
            Err(failure) => {
                reporter.error(format!(
                    "Job {} failed while {}: {}",
                    job.display_name(),
                    failure.state.to_string().to_lowercase(),
                    failure.message
                ));
                (false, JobState::Failed, Some(failure.state))
            }
        };
        reporter.finished(success);

        JobReport {
            job: job.display_name().to_string(),
            success,
            final_state,
            failed_in,
            plan,
            log: reporter.trail(),
        }
    }

    fn run_states(
        &self,
        job: &JobConfig,
        runner: &CommandRunner<'_>,
        reporter: &Reporter,
        plan_slot: &mut Option<TransferPlan>,
    ) -> Result<(), Failure> {
        let inspector = Inspector::new(runner);

        self.enter(JobState::Verifying, reporter)?;
        self.verify(job, &inspector, reporter)?;

        self.enter(JobState::Planning, reporter)?;
        let plan = Planner::new(&inspector)
            .plan(job, (self.clock)())
            .map_err(|e| Failure::new(JobState::Planning, e.to_string()))?;
        reporter.info(format!("Plan: {}.", plan));
        *plan_slot = Some(plan.clone());

        self.enter(JobState::Transferring, reporter)?;
        self.transfer(job, &plan, runner, &inspector, reporter)?;

        if runner.dry_run() {
            reporter.info("[dry-run] Skipping snapshot pruning.");
            return Ok(());
        }
        self.enter(JobState::Pruning, reporter)?;
        self.prune(job, runner, reporter);
        Ok(())
    }

    fn enter(&self, state: JobState, reporter: &Reporter) -> Result<(), Failure> {
        if self.cancel.is_cancelled() {
            return Err(Failure::new(state, "cancelled"));
        }
        reporter.debug(format!("Entering {} state.", state));
        Ok(())
    }

    fn verify(&self, job: &JobConfig, inspector: &Inspector<'_, '_>, reporter: &Reporter) -> Result<(), Failure> {
        let fail = |message: String| Failure::new(JobState::Verifying, message);

        job.validate().map_err(|e| fail(e.to_string()))?;
        Topology::resolve(&job.source_host, &job.dest_host).map_err(|e| fail(e.to_string()))?;

        let mut validation = Validation::new(&format!("hosts for job {}", job.display_name()));
        for (side, endpoint) in &[("source", job.source()), ("destination", job.destination())] {
            let reachable = match inspector.check_pool(endpoint.dataset, endpoint.host) {
                Ok(()) => true,
                Err(e) => {
                    reporter.error(format!("The {} host {} is not usable: {}", side, endpoint.host, e));
                    false
                }
            };
            validation.require(&format!("{} host {} is reachable", side, endpoint.host), reachable);
        }
        if validation.is_valid() {
            let tools = required_tools(job, &self.settings.syncoid_path).map_err(|e| fail(e.to_string()))?;
            for tool in tools {
                let found = inspector.tool_available(&tool.program, &tool.host);
                if !found {
                    reporter.error(format!("{} is not installed on {}.", tool.program, tool.host));
                }
                validation.require(&format!("{} is installed on {}", tool.program, tool.host), found);
            }

            let source = job.source();
            let exists = inspector.dataset_exists(source.dataset, source.host);
            if !exists {
                reporter.error(format!("Source dataset {} does not exist on {}.", source.dataset, source.host));
            }
            validation.require("source dataset exists", exists);
        }
        validation.validate().map_err(|e| fail(e.to_string()))
    }

    fn transfer(
        &self,
        job: &JobConfig,
        plan: &TransferPlan,
        runner: &CommandRunner<'_>,
        inspector: &Inspector<'_, '_>,
        reporter: &Reporter,
    ) -> Result<(), Failure> {
        let fail = |message: String| Failure::new(JobState::Transferring, message);
        let source = job.source();
        let destination = job.destination();

        if plan.is_up_to_date() {
            reporter.info(format!(
                "Destination already has {}; nothing to send.",
                zfs::snapshot_path(source.dataset, &plan.new_snapshot_name)
            ));
            return Ok(());
        }

        if !job.resume_support
            && plan.destination_exists
            && inspector.resume_token(destination.dataset, destination.host).is_some()
        {
            reporter.warn(format!(
                "{} holds partially received state from an interrupted transfer; discarding it.",
                destination
            ));
            runner
                .run(&zfs::abort_receive(destination.dataset), destination.host, true)
                .map_err(|e| fail(format!("Unable to discard the partially received state: {}", e)))?;
        }

        if plan.is_resume() {
            reporter.info("Resuming the interrupted transfer; the new snapshot follows on the next run.");
        } else if plan.reuse_snapshot {
            reporter.info(format!(
                "Snapshot {} already exists; reusing it.",
                zfs::snapshot_path(source.dataset, &plan.new_snapshot_name)
            ));
        } else {
            runner
                .run(
                    &zfs::create_snapshot(source.dataset, &plan.new_snapshot_name, job.recursive),
                    source.host,
                    true,
                )
                .map_err(|e| fail(format!("Unable to create the new snapshot: {}", e)))?;
            reporter.info(format!(
                "Created snapshot {} on {}.",
                zfs::snapshot_path(source.dataset, &plan.new_snapshot_name),
                source.host
            ));
        }

        let total = if job.estimate_size && job.transport == Transport::Native && !plan.is_resume() {
            let base = plan.base_snapshot.as_ref().map(|b| b.name.as_str());
            let estimate = inspector.estimate_size(source.dataset, source.host, &plan.new_snapshot_name, base);
            if let Some(bytes) = estimate {
                reporter.info(format!("Estimated transfer size: {}.", format_size(bytes)));
            }
            estimate
        } else {
            None
        };

        let executor = PipelineExecutor::new(
            self.spawner,
            reporter.clone(),
            self.cancel.clone(),
            self.settings.ssh_options(),
            &self.settings.syncoid_path,
            self.settings.transfer_timeout,
            runner.dry_run(),
        );
        let outcome = executor.transfer(job, plan, total).map_err(|e| {
            fail(format!(
                "Transfer of {} to {} failed: {}",
                job.source(),
                job.destination(),
                e
            ))
        })?;
        if !runner.dry_run() {
            reporter.info(format!("Transferred {}.", format_size(outcome.bytes)));
        }
        Ok(())
    }

    /// Each side is pruned independently; failures only warn.
    fn prune(&self, job: &JobConfig, runner: &CommandRunner<'_>, reporter: &Reporter) {
        let pruner = Pruner::new(runner, &self.settings.sanoid_path);
        let mut sides: Vec<Endpoint<'_>> = vec![job.source()];
        let same_host_sanoid = matches!(job.retention, Retention::Sanoid { .. })
            && job.source_host == job.dest_host;
        if !same_host_sanoid {
            sides.push(job.destination());
        }

        for endpoint in sides {
            match pruner.prune(job, endpoint) {
                Ok(Some(count)) => reporter.info(format!("Pruned {} snapshots of {}.", count, endpoint)),
                Ok(None) => {}
                Err(e) => reporter.warn(format!("Pruning {} on {} failed: {}", endpoint.dataset, endpoint.host, e)),
            }
        }
    }
}
