use crate::argv;
use crate::parsing::{parse_integer, ParseError};
use chrono::{DateTime, TimeZone, Utc};
use log::*;
use std::fmt;

pub const ZFS: &str = "zfs";

/// A snapshot as reported by `zfs list -t snapshot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub dataset: String,
    pub name: String,
    pub guid: u64,
    pub creation: DateTime<Utc>,
}

impl Snapshot {
    pub fn full_name(&self) -> String {
        snapshot_path(&self.dataset, &self.name)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dataset, self.name)
    }
}

pub fn snapshot_path(dataset: &str, name: &str) -> String {
    format!("{}@{}", dataset, name)
}

/// The root pool of a dataset path.
pub fn pool_of(dataset: &str) -> &str {
    dataset.split('/').next().unwrap_or(dataset)
}

pub fn list_dataset(dataset: &str) -> Vec<String> {
    argv!(ZFS, "list", "-H", "-o", "name", dataset)
}

pub fn list_snapshots(dataset: &str) -> Vec<String> {
    argv!(ZFS, "list", "-t", "snapshot", "-o", "name,guid,creation", "-Hp", "-r", dataset)
}

pub fn get_value(property: &str, target: &str) -> Vec<String> {
    argv!(ZFS, "get", "-Hp", "-o", "value", property, target)
}

pub fn get_resume_token(dataset: &str) -> Vec<String> {
    argv!(ZFS, "get", "-H", "-o", "value", "receive_resume_token", dataset)
}

pub fn create_snapshot(dataset: &str, name: &str, recursive: bool) -> Vec<String> {
    let mut args = argv!(ZFS, "snapshot");
    if recursive {
        args.push("-r".to_string());
    }
    args.push(snapshot_path(dataset, name));
    args
}

pub fn destroy_snapshot(dataset: &str, name: &str, recursive: bool) -> Vec<String> {
    let mut args = argv!(ZFS, "destroy");
    if recursive {
        args.push("-r".to_string());
    }
    args.push(snapshot_path(dataset, name));
    args
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendSource<'a> {
    Full {
        dataset: &'a str,
        snapshot: &'a str,
    },
    Incremental {
        dataset: &'a str,
        base: &'a str,
        snapshot: &'a str,
    },
    Resume {
        token: &'a str,
    },
}

/// `zfs send` with verbose progress on stderr.
///
/// A resumed send takes its flags from the token, so `-p` and `-R` are only
/// given for fresh sends.
pub fn send(source: &SendSource<'_>, recursive: bool) -> Vec<String> {
    let mut args = argv!(ZFS, "send");
    let fresh_flags = |args: &mut Vec<String>| {
        args.push("-p".to_string());
        if recursive {
            args.push("-R".to_string());
        }
        args.push("-v".to_string());
    };
    match source {
        SendSource::Resume { token } => args.extend(argv!("-v", "-t", token)),
        SendSource::Full { dataset, snapshot } => {
            fresh_flags(&mut args);
            args.push(snapshot_path(dataset, snapshot));
        }
        SendSource::Incremental {
            dataset,
            base,
            snapshot,
        } => {
            fresh_flags(&mut args);
            args.extend(argv!("-i", snapshot_path(dataset, base), snapshot_path(dataset, snapshot)));
        }
    }
    args
}

pub fn receive(dataset: &str, resumable: bool, force: bool) -> Vec<String> {
    let mut args = argv!(ZFS, "receive");
    if resumable {
        args.push("-s".to_string());
    }
    args.extend(argv!("-u", "-v"));
    if force {
        args.push("-F".to_string());
    }
    args.push(dataset.to_string());
    args
}

/// Discard the partially received state an interrupted resumable receive left behind.
pub fn abort_receive(dataset: &str) -> Vec<String> {
    argv!(ZFS, "receive", "-A", dataset)
}

/// Parse `zfs list -t snapshot -o name,guid,creation -Hp` output, keeping
/// only snapshots of `dataset` itself. Unparsable lines are logged and skipped.
pub fn parse_snapshot_listing(output: &str, dataset: &str) -> Vec<Snapshot> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match parse_snapshot_line(line) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Skipping snapshot listing line: {}", e);
                None
            }
        })
        .filter(|s| s.dataset == dataset)
        .collect()
}

fn parse_snapshot_line(line: &str) -> Result<Snapshot, ParseError> {
    let invalid = || ParseError::InvalidLine {
        line: line.to_string(),
        separator: "\t".to_string(),
    };
    let fields = line.trim_end().split('\t').collect::<Vec<_>>();
    let (full_name, guid, creation) = match fields.as_slice() {
        [full_name, guid, creation] => (*full_name, *guid, *creation),
        _ => return Err(invalid()),
    };
    let (dataset, name) = match full_name.split_once('@') {
        Some((dataset, name)) if !dataset.is_empty() && !name.is_empty() => (dataset, name),
        _ => return Err(invalid()),
    };
    let creation = Utc
        .timestamp_opt(parse_integer(creation)? as i64, 0)
        .single()
        .ok_or_else(invalid)?;

    Ok(Snapshot {
        dataset: dataset.to_string(),
        name: name.to_string(),
        guid: parse_integer(guid)?,
        creation,
    })
}

/// `-` (or nothing) means no interrupted receive is pending.
pub fn parse_resume_token(output: &str) -> Option<String> {
    match output.trim() {
        "" | "-" => None,
        token => Some(token.to_string()),
    }
}

pub fn parse_byte_value(output: &str) -> Result<Option<u64>, ParseError> {
    match output.trim() {
        "" | "-" => Ok(None),
        value => parse_integer(value).map(Some),
    }
}
