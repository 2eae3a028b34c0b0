use super::plan::TransferPlan;
use super::progress::{ProgressMonitor, ProgressTracker, StreamTail};
use super::runner::excerpt;
use super::Cancellation;
use crate::argv;
use crate::model::{JobConfig, Transport};
use crate::observer::Reporter;
use crate::sys::process::{exit_code_description, terminate, Spawner};
use crate::sys::sanoid::{self, SyncoidRequest};
use crate::sys::ssh::{Host, SshOptions};
use crate::sys::zfs::{self, SendSource};
use log::*;
use std::io::{self, Read};
use std::process::{Child, ChildStdout, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use strum_macros::Display;
use thiserror::Error;

pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);
pub const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(50);
const FAILURE_DRAIN_GRACE: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("replicating from {from} to {to} is not supported; at least one side must be local")]
    UnsupportedTopology { from: Host, to: Host },
    #[error("unable to start {role} stage `{command}`")]
    Spawn {
        role: StageRole,
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{role} stage `{command}` failed with {status}: {detail}")]
    StageFailed {
        role: StageRole,
        command: String,
        status: String,
        detail: String,
    },
    #[error("transfer was cancelled")]
    Cancelled,
    #[error("transfer did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("pipeline supervision failed")]
    Io(#[from] io::Error),
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Send,
    Compress,
    Throttle,
    SshHop,
    Decompress,
    Receive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStage {
    pub role: StageRole,
    pub argv: Vec<String>,
}

impl PipelineStage {
    pub fn new(role: StageRole, argv: Vec<String>) -> Self {
        Self { role, argv }
    }

    pub fn command_line(&self) -> String {
        shell_words::join(&self.argv)
    }
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    LocalToLocal,
    LocalToRemote,
    RemoteToLocal,
}

impl Topology {
    pub fn resolve(source: &Host, destination: &Host) -> Result<Self, PipelineError> {
        match (source, destination) {
            (Host::Local, Host::Local) => Ok(Topology::LocalToLocal),
            (Host::Local, Host::Remote(_)) => Ok(Topology::LocalToRemote),
            (Host::Remote(_), Host::Local) => Ok(Topology::RemoteToLocal),
            (Host::Remote(_), Host::Remote(_)) => Err(PipelineError::UnsupportedTopology {
                from: source.clone(),
                to: destination.clone(),
            }),
        }
    }
}

/// An ordered chain of stages; each stage's stdout feeds the next stage's
/// stdin. The first stage's stderr is the monitored diagnostic stream; the
/// others are drained to the debug log.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSpec {
    pub topology: Topology,
    pub stages: Vec<PipelineStage>,
    pub action: String,
}

impl PipelineSpec {
    pub fn for_job(job: &JobConfig, plan: &TransferPlan, ssh: &SshOptions, syncoid_path: &str) -> Result<Self, PipelineError> {
        match job.transport {
            Transport::Native => Self::native(job, plan, ssh),
            Transport::Syncoid => Self::syncoid(job, plan, ssh, syncoid_path),
        }
    }

    pub fn native(job: &JobConfig, plan: &TransferPlan, ssh: &SshOptions) -> Result<Self, PipelineError> {
        let topology = Topology::resolve(&job.source_host, &job.dest_host)?;

        let source = match (&plan.resume_token, &plan.base_snapshot) {
            (Some(token), _) => SendSource::Resume { token },
            (None, Some(base)) => SendSource::Incremental {
                dataset: &job.source_dataset,
                base: &base.name,
                snapshot: &plan.new_snapshot_name,
            },
            (None, None) => SendSource::Full {
                dataset: &job.source_dataset,
                snapshot: &plan.new_snapshot_name,
            },
        };
        let send = zfs::send(&source, job.recursive);
        let receive = zfs::receive(&job.dest_dataset, job.resume_support, plan.force_receive());
        let throttle = job.bwlimit.as_ref().map(|limit| argv!("pv", "-q", "-L", limit));
        let (compress, decompress) = match job.compression_method.commands() {
            Some((compress, decompress)) => (Some(compress), Some(decompress)),
            None => (None, None),
        };

        let stages = match (topology, &job.source_host, &job.dest_host) {
            (Topology::LocalToRemote, _, Host::Remote(host)) => {
                let mut stages = vec![PipelineStage::new(StageRole::Send, send)];
                stages.extend(compress.map(|c| PipelineStage::new(StageRole::Compress, c)));
                stages.extend(throttle.map(|t| PipelineStage::new(StageRole::Throttle, t)));
                let remote = decompress.into_iter().chain(Some(receive)).collect::<Vec<_>>();
                stages.push(PipelineStage::new(
                    StageRole::SshHop,
                    ssh.wrap_chain(host, &job.ssh_user, &remote),
                ));
                stages
            }
            (Topology::RemoteToLocal, Host::Remote(host), _) => {
                let remote = Some(send)
                    .into_iter()
                    .chain(compress)
                    .chain(throttle)
                    .collect::<Vec<_>>();
                let mut stages = vec![PipelineStage::new(
                    StageRole::SshHop,
                    ssh.wrap_chain(host, &job.ssh_user, &remote),
                )];
                stages.extend(decompress.map(|d| PipelineStage::new(StageRole::Decompress, d)));
                stages.push(PipelineStage::new(StageRole::Receive, receive));
                stages
            }
            _ => {
                let mut stages = vec![PipelineStage::new(StageRole::Send, send)];
                stages.extend(throttle.map(|t| PipelineStage::new(StageRole::Throttle, t)));
                stages.push(PipelineStage::new(StageRole::Receive, receive));
                stages
            }
        };

        Ok(Self {
            topology,
            stages,
            action: plan.to_string(),
        })
    }

    pub fn syncoid(
        job: &JobConfig,
        plan: &TransferPlan,
        ssh: &SshOptions,
        syncoid_path: &str,
    ) -> Result<Self, PipelineError> {
        let topology = Topology::resolve(&job.source_host, &job.dest_host)?;
        let ssh_options = sanoid::syncoid_ssh_options(&ssh.option_args());
        let request = SyncoidRequest {
            source: sanoid::syncoid_target(&job.source_host, &job.ssh_user, &job.source_dataset),
            destination: sanoid::syncoid_target(&job.dest_host, &job.ssh_user, &job.dest_dataset),
            recursive: job.recursive,
            compression: job.compression_method,
            resume: job.resume_support,
            bwlimit: job.bwlimit.as_deref(),
            ssh_options: &ssh_options,
        };
        Ok(Self {
            topology,
            stages: vec![PipelineStage::new(
                StageRole::Send,
                sanoid::syncoid(syncoid_path, &request),
            )],
            action: format!("syncoid of {}", plan.new_snapshot_name),
        })
    }
}

/// A program one of the job's stages runs, and the host it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRequirement {
    pub host: Host,
    pub program: String,
}

impl ToolRequirement {
    fn new(host: &Host, program: &str) -> Self {
        Self {
            host: host.clone(),
            program: program.to_string(),
        }
    }
}

/// Programs besides `zfs` the job's pipeline needs, placed the way the stage
/// builders place them.
pub fn required_tools(job: &JobConfig, syncoid_path: &str) -> Result<Vec<ToolRequirement>, PipelineError> {
    let topology = Topology::resolve(&job.source_host, &job.dest_host)?;
    let mut tools = Vec::new();
    if topology != Topology::LocalToLocal {
        tools.push(ToolRequirement::new(&Host::Local, "ssh"));
    }

    match job.transport {
        Transport::Syncoid => tools.push(ToolRequirement::new(&Host::Local, syncoid_path)),
        Transport::Native => {
            if job.bwlimit.is_some() {
                tools.push(ToolRequirement::new(&job.source_host, "pv"));
            }
            if let Some(program) = job.compression_method.program().filter(|_| topology != Topology::LocalToLocal) {
                tools.push(ToolRequirement::new(&job.source_host, program));
                tools.push(ToolRequirement::new(&job.dest_host, program));
            }
        }
    }
    Ok(tools)
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TransferOutcome {
    pub bytes: u64,
    pub receive_output: String,
}

struct RunningStage {
    role: StageRole,
    command: String,
    child: Child,
    status: Option<ExitStatus>,
    stderr: Option<StreamTail>,
}

#[derive(Default)]
struct RunningPipeline {
    stages: Vec<RunningStage>,
    monitor: Option<ProgressMonitor>,
    capture: Option<JoinHandle<String>>,
}

impl RunningPipeline {
    fn terminate_all(&mut self) {
        for stage in self.stages.iter_mut().filter(|s| s.status.is_none()) {
            terminate(&mut stage.child, TERMINATE_GRACE);
            stage.status = stage.child.try_wait().unwrap_or(None);
        }
    }
}

/// Spawns and supervises the stage chain for one transfer.
pub struct PipelineExecutor<'a> {
    spawner: &'a dyn Spawner,
    reporter: Reporter,
    cancel: Cancellation,
    ssh: SshOptions,
    syncoid_path: String,
    timeout: Option<Duration>,
    dry_run: bool,
}

impl<'a> PipelineExecutor<'a> {
    pub fn new(
        spawner: &'a dyn Spawner,
        reporter: Reporter,
        cancel: Cancellation,
        ssh: SshOptions,
        syncoid_path: &str,
        timeout: Option<Duration>,
        dry_run: bool,
    ) -> Self {
        Self {
            spawner,
            reporter,
            cancel,
            ssh,
            syncoid_path: syncoid_path.to_string(),
            timeout,
            dry_run,
        }
    }

    pub fn spec_for(&self, job: &JobConfig, plan: &TransferPlan) -> Result<PipelineSpec, PipelineError> {
        PipelineSpec::for_job(job, plan, &self.ssh, &self.syncoid_path)
    }

    /// Build the pipeline for `plan` and run it. `total` is the expected stream size, if known.
    pub fn transfer(
        &self,
        job: &JobConfig,
        plan: &TransferPlan,
        total: Option<u64>,
    ) -> Result<TransferOutcome, PipelineError> {
        let spec = self.spec_for(job, plan)?;
        self.execute(&spec, total)
    }

    pub fn execute(&self, spec: &PipelineSpec, total: Option<u64>) -> Result<TransferOutcome, PipelineError> {
        if spec.stages.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "pipeline has no stages").into());
        }

        if self.dry_run {
            for (index, stage) in spec.stages.iter().enumerate() {
                self.reporter.info(format!(
                    "[dry-run] Stage {} ({}): {}",
                    index + 1,
                    stage.role,
                    stage.command_line()
                ));
            }
            return Ok(TransferOutcome::default());
        }
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        info!("Starting {} stage {} pipeline.", spec.stages.len(), spec.topology);
        let mut running = RunningPipeline::default();
        let result = self
            .start(spec, total, &mut running)
            .and_then(|_| self.supervise(&mut running.stages));
        if result.is_err() {
            running.terminate_all();
        }

        let monitored = running.monitor.take().and_then(|m| m.join(MONITOR_JOIN_TIMEOUT));
        let receive_output = match running.capture.take().map(JoinHandle::join) {
            Some(Ok(output)) => output,
            Some(Err(_)) => {
                warn!("Receive output reader panicked.");
                String::new()
            }
            None => String::new(),
        };
        if !receive_output.trim().is_empty() {
            debug!("Receive output:\n{}", receive_output.trim_end());
        }

        if let Some(index) = result? {
            let tail = match index {
                0 => monitored.as_ref().map(|outcome| outcome.tail.clone()).unwrap_or_default(),
                _ => running.stages[index]
                    .stderr
                    .take()
                    .map(|stderr| stderr.join(MONITOR_JOIN_TIMEOUT))
                    .unwrap_or_default(),
            };
            let stage = &running.stages[index];
            return Err(PipelineError::StageFailed {
                role: stage.role,
                command: stage.command.clone(),
                status: stage.status.map_or_else(|| "unknown status".to_string(), exit_code_description),
                detail: excerpt(&tail.join("\n")),
            });
        }

        let mut outcome = TransferOutcome {
            receive_output,
            ..Default::default()
        };
        if let Some(mut monitored) = monitored {
            if let Some(sample) = monitored.tracker.finish() {
                self.reporter.progress(&sample);
            }
            outcome.bytes = monitored.tracker.completed();
        }
        Ok(outcome)
    }

    fn start(&self, spec: &PipelineSpec, total: Option<u64>, running: &mut RunningPipeline) -> Result<(), PipelineError> {
        let last = spec.stages.len() - 1;
        let mut upstream: Option<ChildStdout> = None;
        for (index, stage) in spec.stages.iter().enumerate() {
            let command = stage.command_line();
            debug!("Starting {} stage: {}", stage.role, command);

            let stdin = upstream.take().map_or_else(Stdio::null, Stdio::from);
            let mut child = self
                .spawner
                .spawn(&stage.argv, stdin, Stdio::piped(), Stdio::piped())
                .map_err(|source| PipelineError::Spawn {
                    role: stage.role,
                    command: command.clone(),
                    source,
                })?;

            let mut stderr = None;
            if let Some(stream) = child.stderr.take() {
                if index == 0 {
                    running.monitor = Some(ProgressMonitor::spawn(
                        stream,
                        ProgressTracker::new(total, Some(spec.action.clone())),
                        self.reporter.clone(),
                        self.cancel.clone(),
                    ));
                } else {
                    stderr = Some(StreamTail::spawn(stream, format!("{} stage", stage.role)));
                }
            }
            if index == last {
                if let Some(mut stdout) = child.stdout.take() {
                    running.capture = Some(thread::spawn(move || {
                        let mut output = String::new();
                        if let Err(e) = stdout.read_to_string(&mut output) {
                            debug!("Receive output unreadable: {}", e);
                        }
                        output
                    }));
                }
            } else {
                upstream = child.stdout.take();
            }

            running.stages.push(RunningStage {
                role: stage.role,
                command,
                child,
                status: None,
                stderr,
            });
        }
        Ok(())
    }

    /// Wait for every stage. Returns the index of the first stage to exit unsuccessfully.
    fn supervise(&self, stages: &mut [RunningStage]) -> Result<Option<usize>, PipelineError> {
        let started = Instant::now();
        let mut first_failure = None;
        let mut failed_at: Option<Instant> = None;
        loop {
            for (index, stage) in stages.iter_mut().enumerate() {
                if stage.status.is_some() {
                    continue;
                }
                if let Some(status) = stage.child.try_wait()? {
                    debug!("{} stage finished with {}.", stage.role, exit_code_description(status));
                    stage.status = Some(status);
                    if !status.success() && first_failure.is_none() {
                        first_failure = Some(index);
                        failed_at = Some(Instant::now());
                    }
                }
            }

            if stages.iter().all(|s| s.status.is_some()) {
                return Ok(first_failure);
            }
            if self.cancel.is_cancelled() {
                warn!("Transfer cancelled; stopping pipeline.");
                return Err(PipelineError::Cancelled);
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    return Err(PipelineError::TimedOut(timeout));
                }
            }
            if failed_at.map_or(false, |at| at.elapsed() >= FAILURE_DRAIN_GRACE) {
                warn!("Stages still running {:?} after a stage failed; stopping them.", FAILURE_DRAIN_GRACE);
                for stage in stages.iter_mut().filter(|s| s.status.is_none()) {
                    terminate(&mut stage.child, TERMINATE_GRACE);
                }
                failed_at = None;
            }
            thread::sleep(SUPERVISE_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::TransferMode;
    use crate::core::runner::testing::reporter;
    use crate::core::Snapshot;
    use crate::model::fixtures::local_job;
    use crate::model::Compression;
    use crate::observer::JobEvent;
    use crate::sys::process::SystemSpawner;
    use crate::sys::ssh::PIPEFAIL_PREAMBLE;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSpawner {
        spawned: AtomicUsize,
    }

    impl Spawner for CountingSpawner {
        fn spawn(&self, argv: &[String], stdin: Stdio, stdout: Stdio, stderr: Stdio) -> io::Result<Child> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            SystemSpawner.spawn(argv, stdin, stdout, stderr)
        }
    }

    fn plan(base: Option<&str>) -> TransferPlan {
        TransferPlan {
            mode: if base.is_some() {
                TransferMode::Incremental
            } else {
                TransferMode::Full
            },
            base_snapshot: base.map(|name| Snapshot {
                dataset: "tank/src".to_string(),
                name: name.to_string(),
                guid: 7,
                creation: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            }),
            new_snapshot_name: "zfsync-new".to_string(),
            reuse_snapshot: false,
            destination_exists: base.is_some(),
            resume_token: None,
        }
    }

    fn roles(spec: &PipelineSpec) -> Vec<StageRole> {
        spec.stages.iter().map(|s| s.role).collect()
    }

    fn sh(role: StageRole, script: &str) -> PipelineStage {
        PipelineStage::new(role, argv!("sh", "-c", script))
    }

    fn spec(stages: Vec<PipelineStage>) -> PipelineSpec {
        PipelineSpec {
            topology: Topology::LocalToLocal,
            stages,
            action: "test".to_string(),
        }
    }

    fn executor<'a>(spawner: &'a dyn Spawner, reporter: Reporter, cancel: Cancellation) -> PipelineExecutor<'a> {
        PipelineExecutor::new(spawner, reporter, cancel, SshOptions::default(), "syncoid", None, false)
    }

    #[test]
    fn local_pipeline_has_no_compression() {
        let mut job = local_job();
        job.compression_method = Compression::Zstd;
        let spec = PipelineSpec::native(&job, &plan(Some("zfsync-old")), &SshOptions::default()).unwrap();
        assert_eq!(spec.topology, Topology::LocalToLocal);
        assert_eq!(roles(&spec), vec![StageRole::Send, StageRole::Receive]);
        assert_eq!(
            spec.stages[0].argv,
            argv!("zfs", "send", "-p", "-v", "-i", "tank/src@zfsync-old", "tank/src@zfsync-new")
        );
        assert_eq!(spec.stages[1].argv, argv!("zfs", "receive", "-u", "-v", "backup/dst"));
    }

    #[test]
    fn push_to_remote_wraps_receiving_side() {
        let mut job = local_job();
        job.dest_host = Host::from("nas");
        job.compression_method = Compression::Lz4;
        job.bwlimit = Some("10M".to_string());
        job.resume_support = true;
        let spec = PipelineSpec::native(&job, &plan(None), &SshOptions::default()).unwrap();

        assert_eq!(
            roles(&spec),
            vec![StageRole::Send, StageRole::Compress, StageRole::Throttle, StageRole::SshHop]
        );
        assert_eq!(spec.stages[1].argv, argv!("lz4", "-c"));
        assert_eq!(spec.stages[2].argv, argv!("pv", "-q", "-L", "10M"));
        let hop = &spec.stages[3].argv;
        assert_eq!(hop[0], "ssh");
        assert_eq!(hop[hop.len() - 2], "root@nas");
        assert_eq!(
            hop[hop.len() - 1],
            format!("sh -c '{} lz4 -dc | zfs receive -s -u -v backup/dst'", PIPEFAIL_PREAMBLE)
        );
    }

    #[test]
    fn pull_from_remote_wraps_sending_side() {
        let mut job = local_job();
        job.source_host = Host::from("prod");
        job.compression_method = Compression::Gzip;
        job.recursive = true;
        let spec = PipelineSpec::native(&job, &plan(None), &SshOptions::default()).unwrap();

        assert_eq!(
            roles(&spec),
            vec![StageRole::SshHop, StageRole::Decompress, StageRole::Receive]
        );
        assert_eq!(
            spec.stages[0].argv.last().unwrap(),
            &format!("sh -c '{} zfs send -p -R -v tank/src@zfsync-new | gzip -c'", PIPEFAIL_PREAMBLE)
        );
        assert_eq!(spec.stages[1].argv, argv!("gzip", "-dc"));
    }

    #[test]
    fn resume_and_force_change_commands() {
        let job = local_job();
        let mut resumed = plan(None);
        resumed.resume_token = Some("1-abc".to_string());
        let spec = PipelineSpec::native(&job, &resumed, &SshOptions::default()).unwrap();
        assert_eq!(spec.stages[0].argv, argv!("zfs", "send", "-v", "-t", "1-abc"));

        let mut forced = plan(None);
        forced.destination_exists = true;
        let spec = PipelineSpec::native(&job, &forced, &SshOptions::default()).unwrap();
        assert_eq!(spec.stages[1].argv, argv!("zfs", "receive", "-u", "-v", "-F", "backup/dst"));
    }

    #[test]
    fn syncoid_is_a_single_monitored_stage() {
        let mut job = local_job();
        job.transport = Transport::Syncoid;
        job.dest_host = Host::from("nas");
        let spec = PipelineSpec::for_job(&job, &plan(None), &SshOptions::default(), "/usr/sbin/syncoid").unwrap();
        assert_eq!(roles(&spec), vec![StageRole::Send]);
        assert_eq!(spec.stages[0].argv[0], "/usr/sbin/syncoid");
        assert_eq!(spec.stages[0].argv.last().unwrap(), "root@nas:backup/dst");
    }

    #[test]
    fn remote_to_remote_spawns_nothing() {
        let mut job = local_job();
        job.source_host = Host::from("a");
        job.dest_host = Host::from("b");
        let spawner = CountingSpawner::default();
        let (reporter, _events) = reporter();

        let result = executor(&spawner, reporter, Cancellation::default()).transfer(&job, &plan(None), None);
        assert!(matches!(result, Err(PipelineError::UnsupportedTopology { .. })));
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dry_run_logs_instead_of_spawning() {
        let spawner = CountingSpawner::default();
        let (reporter, events) = reporter();
        let executor = PipelineExecutor::new(
            &spawner,
            reporter,
            Cancellation::default(),
            SshOptions::default(),
            "syncoid",
            None,
            true,
        );

        let outcome = executor.transfer(&local_job(), &plan(None), Some(1024)).unwrap();
        assert_eq!(outcome, TransferOutcome::default());
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 0);
        let logged = events
            .try_iter()
            .filter_map(|e| match e {
                JobEvent::Log { message, .. } => Some(message),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            logged,
            vec![
                "[dry-run] Stage 1 (Send): zfs send -p -v tank/src@zfsync-new",
                "[dry-run] Stage 2 (Receive): zfs receive -u -v backup/dst"
            ]
        );
    }

    #[test]
    fn data_flows_through_every_stage() {
        let spawner = CountingSpawner::default();
        let (reporter, events) = reporter();
        let spec = spec(vec![
            sh(
                StageRole::Send,
                "printf 'total estimated size is 1K\\n12:00:01   1K   tank/a@s\\n' >&2; echo payload",
            ),
            PipelineStage::new(StageRole::Compress, argv!("cat")),
            PipelineStage::new(StageRole::Receive, argv!("cat")),
        ]);

        let outcome = executor(&spawner, reporter, Cancellation::default())
            .execute(&spec, None)
            .unwrap();
        assert_eq!(outcome.receive_output, "payload\n");
        assert_eq!(outcome.bytes, 1024);
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 3);
        let progress = events
            .try_iter()
            .filter_map(|e| match e {
                JobEvent::Progress(sample) => Some((sample.completed_bytes, sample.total_bytes)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(progress, vec![(1024, Some(1024))]);
    }

    #[test]
    fn first_failure_wins_and_all_stages_are_reaped() {
        let spawner = SystemSpawner;
        let (reporter, _events) = reporter();
        let spec = spec(vec![
            sh(StageRole::Send, "echo 'cannot open tank/a@s: no such snapshot' >&2; exit 3"),
            sh(StageRole::Compress, "cat; exit 4"),
            PipelineStage::new(StageRole::Receive, argv!("cat")),
        ]);

        match executor(&spawner, reporter, Cancellation::default()).execute(&spec, None) {
            Err(PipelineError::StageFailed {
                role, status, detail, ..
            }) => {
                assert_eq!(role, StageRole::Send);
                assert_eq!(status, "exit code 3");
                assert_eq!(detail, "cannot open tank/a@s: no such snapshot");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn downstream_failure_is_reported() {
        let spawner = SystemSpawner;
        let (reporter, _events) = reporter();
        let spec = spec(vec![
            sh(StageRole::Send, "sleep 0.3"),
            PipelineStage::new(StageRole::Receive, argv!("false")),
        ]);

        let error = executor(&spawner, reporter, Cancellation::default())
            .execute(&spec, None)
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "Receive stage `false` failed with exit code 1: no error output"
        );
    }

    #[test]
    fn receive_error_output_reaches_the_failure() {
        let spawner = SystemSpawner;
        let (reporter, _events) = reporter();
        let spec = spec(vec![
            sh(StageRole::Send, "echo data"),
            sh(
                StageRole::Receive,
                "cat >/dev/null; echo 'cannot receive incremental stream: destination backup/dst has been modified' >&2; exit 1",
            ),
        ]);

        match executor(&spawner, reporter, Cancellation::default()).execute(&spec, None) {
            Err(PipelineError::StageFailed {
                role, status, detail, ..
            }) => {
                assert_eq!(role, StageRole::Receive);
                assert_eq!(status, "exit code 1");
                assert_eq!(
                    detail,
                    "cannot receive incremental stream: destination backup/dst has been modified"
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_stage_program_stops_started_stages() {
        let spawner = CountingSpawner::default();
        let (reporter, _events) = reporter();
        let spec = spec(vec![
            PipelineStage::new(StageRole::Send, argv!("sleep", "30")),
            PipelineStage::new(StageRole::Receive, argv!("zfsync-no-such-receiver")),
        ]);

        let started = Instant::now();
        let result = executor(&spawner, reporter, Cancellation::default()).execute(&spec, None);
        assert!(matches!(result, Err(PipelineError::Spawn { role: StageRole::Receive, .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancellation_terminates_running_stages() {
        let spawner = SystemSpawner;
        let (reporter, _events) = reporter();
        let cancel = Cancellation::default();
        let spec = spec(vec![
            PipelineStage::new(StageRole::Send, argv!("sleep", "30")),
            PipelineStage::new(StageRole::Receive, argv!("cat")),
        ]);

        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let started = Instant::now();
        let result = executor(&spawner, reporter, cancel).execute(&spec, None);
        canceller.join().unwrap();

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn overall_timeout_stops_the_transfer() {
        let spawner = SystemSpawner;
        let (reporter, _events) = reporter();
        let executor = PipelineExecutor::new(
            &spawner,
            reporter,
            Cancellation::default(),
            SshOptions::default(),
            "syncoid",
            Some(Duration::from_millis(200)),
            false,
        );

        let result = executor.execute(
            &spec(vec![PipelineStage::new(StageRole::Send, argv!("sleep", "30"))]),
            None,
        );
        assert!(matches!(result, Err(PipelineError::TimedOut(_))));
    }

    fn requirement(host: &str, program: &str) -> ToolRequirement {
        ToolRequirement::new(&Host::from(host), program)
    }

    #[test]
    fn tools_are_required_where_their_stage_runs() {
        let mut job = local_job();
        job.compression_method = Compression::Zstd;
        assert!(required_tools(&job, "syncoid").unwrap().is_empty());

        job.bwlimit = Some("10M".to_string());
        job.source_host = Host::from("prod");
        assert_eq!(
            required_tools(&job, "syncoid").unwrap(),
            vec![
                requirement("local", "ssh"),
                requirement("prod", "pv"),
                requirement("prod", "zstd"),
                requirement("local", "zstd"),
            ]
        );

        job.transport = Transport::Syncoid;
        assert_eq!(
            required_tools(&job, "/usr/sbin/syncoid").unwrap(),
            vec![requirement("local", "ssh"), requirement("local", "/usr/sbin/syncoid")]
        );

        job.dest_host = Host::from("nas");
        assert!(matches!(
            required_tools(&job, "syncoid"),
            Err(PipelineError::UnsupportedTopology { .. })
        ));
    }
}
