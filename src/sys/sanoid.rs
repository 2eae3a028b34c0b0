use crate::model::Compression;
use crate::sys::ssh::Host;
use log::*;
use std::path::Path;

pub const TAKE_SNAPSHOTS: &str = "--take-snapshots";
pub const PRUNE_SNAPSHOTS: &str = "--prune-snapshots";
pub const SYNCOID_DRY_RUN: &str = "-n";

pub fn prune_snapshots(sanoid: &str, config_dir: Option<&Path>) -> Vec<String> {
    let mut args = vec![sanoid.to_string(), PRUNE_SNAPSHOTS.to_string()];
    if let Some(dir) = config_dir {
        args.push(format!("--configdir={}", dir.display()));
    }
    args
}

/// A `syncoid` endpoint: a bare dataset locally, `user@host:dataset` otherwise.
pub fn syncoid_target(host: &Host, ssh_user: &str, dataset: &str) -> String {
    match host {
        Host::Local => dataset.to_string(),
        Host::Remote(name) => format!("{}@{}:{}", ssh_user, name, dataset),
    }
}

#[derive(Debug, Clone)]
pub struct SyncoidRequest<'a> {
    pub source: String,
    pub destination: String,
    pub recursive: bool,
    pub compression: Compression,
    pub resume: bool,
    pub bwlimit: Option<&'a str>,
    pub ssh_options: &'a [String],
}

/// `syncoid` picks the incremental base itself. The job has already taken
/// the snapshot to send, so syncoid is told not to take its own.
pub fn syncoid(syncoid: &str, request: &SyncoidRequest<'_>) -> Vec<String> {
    let mut args = vec![syncoid.to_string(), "--no-sync-snap".to_string()];
    if request.recursive {
        args.push("--recursive".to_string());
    }
    // syncoid has no way to turn compression off other than "none".
    args.push(format!("--compress={}", request.compression));
    if !request.resume {
        args.push("--no-resume".to_string());
    }
    if let Some(limit) = request.bwlimit {
        args.push(format!("--source-bwlimit={}", limit));
    }
    args.extend(request.ssh_options.iter().map(|o| format!("--sshoption={}", o)));
    args.push(request.source.clone());
    args.push(request.destination.clone());
    args
}

/// Reduce `-o Key=Value` pairs to the bare `Key=Value` form `--sshoption` expects.
/// Other ssh arguments have no syncoid equivalent and are dropped.
pub fn syncoid_ssh_options(ssh_args: &[String]) -> Vec<String> {
    let mut options = Vec::new();
    let mut args = ssh_args.iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-o" => options.extend(args.next().cloned()),
            option if option.starts_with("-o") => options.push(option[2..].to_string()),
            other => warn!("SSH argument {:?} cannot be passed to syncoid.", other),
        }
    }
    options
}
