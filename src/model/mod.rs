pub mod settings;
pub mod storage;

use crate::contextualize::{Validation, ValidationError};
use crate::parsing::try_parse_size;
use crate::sys::ssh::Host;
use serde::{Deserialize, Serialize};
use std::{num::NonZeroUsize, path::PathBuf};
use strum_macros::{Display, EnumString};

fn default_true() -> bool {
    true
}

/// Everything needed to replicate one dataset from a source to a destination.
///
/// Immutable for the duration of a job run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub source_host: Host,
    pub source_dataset: String,
    pub dest_host: Host,
    pub dest_dataset: String,
    pub ssh_user: String,
    pub recursive: bool,
    pub snapshot_prefix: String,
    #[serde(default)]
    pub compression_method: Compression,
    #[serde(default)]
    pub bwlimit: Option<String>,
    #[serde(default)]
    pub resume_support: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_true")]
    pub estimate_size: bool,
    #[serde(default)]
    pub on_diverged: DivergedPolicy,
    #[serde(default)]
    pub retention: Retention,
}

impl JobConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.source_dataset)
    }

    pub fn source(&self) -> Endpoint<'_> {
        Endpoint {
            host: &self.source_host,
            ssh_user: &self.ssh_user,
            dataset: &self.source_dataset,
        }
    }

    pub fn destination(&self) -> Endpoint<'_> {
        Endpoint {
            host: &self.dest_host,
            ssh_user: &self.ssh_user,
            dataset: &self.dest_dataset,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut validation = Validation::new(&format!("job {}", self.display_name()));
        validation.require("source dataset is set", !self.source_dataset.trim().is_empty());
        validation.require("destination dataset is set", !self.dest_dataset.trim().is_empty());
        validation.require(
            "datasets do not name snapshots",
            !self.source_dataset.contains('@') && !self.dest_dataset.contains('@'),
        );
        validation.require("ssh user is set", !self.ssh_user.trim().is_empty());
        validation.require("snapshot prefix is set", !self.snapshot_prefix.trim().is_empty());
        validation.require(
            "snapshot prefix has no '@' or whitespace",
            !self.snapshot_prefix.contains(|c: char| c == '@' || c.is_whitespace()),
        );
        if let Some(limit) = &self.bwlimit {
            validation.require(
                "bandwidth limit is a positive size",
                try_parse_size(limit).map_or(false, |b| b > 0),
            );
        }
        validation.validate()
    }
}

/// One side of a replication job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Endpoint<'a> {
    pub host: &'a Host,
    pub ssh_user: &'a str,
    pub dataset: &'a str,
}

impl<'a> std::fmt::Display for Endpoint<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.host {
            Host::Local => write!(f, "{}", self.dataset),
            Host::Remote(host) => write!(f, "{}@{}:{}", self.ssh_user, host, self.dataset),
        }
    }
}

#[derive(Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Compression {
    None,
    Lz4,
    Gzip,
    Pigz,
    Zstd,
    Xz,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::None
    }
}

impl Compression {
    pub fn program(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Lz4 => Some("lz4"),
            Compression::Gzip => Some("gzip"),
            Compression::Pigz => Some("pigz"),
            Compression::Zstd => Some("zstd"),
            Compression::Xz => Some("xz"),
        }
    }

    /// The compress and decompress argvs, or `None` when no compression is used.
    pub fn commands(self) -> Option<(Vec<String>, Vec<String>)> {
        let program = self.program()?;
        Some((
            vec![program.to_string(), "-c".to_string()],
            vec![program.to_string(), "-dc".to_string()],
        ))
    }
}

#[derive(Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Transport {
    Native,
    Syncoid,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Native
    }
}

/// What to do when a full send is required but the destination already exists.
#[derive(Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DivergedPolicy {
    Abort,
    Force,
}

impl Default for DivergedPolicy {
    fn default() -> Self {
        DivergedPolicy::Abort
    }
}

/// Written as `{"keep_newest": N}`, `{"sanoid": {"config_dir": DIR}}`,
/// `"sanoid"` or `"none"`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case", from = "RetentionSetting")]
pub enum Retention {
    KeepNewest(NonZeroUsize),
    Sanoid {
        #[serde(default)]
        config_dir: Option<PathBuf>,
    },
    None,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RetentionSetting {
    Shorthand(RetentionShorthand),
    Full(FullRetention),
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum RetentionShorthand {
    Sanoid,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum FullRetention {
    KeepNewest(NonZeroUsize),
    Sanoid {
        #[serde(default)]
        config_dir: Option<PathBuf>,
    },
    None,
}

impl From<RetentionSetting> for Retention {
    fn from(setting: RetentionSetting) -> Self {
        match setting {
            RetentionSetting::Shorthand(RetentionShorthand::Sanoid) => Retention::Sanoid { config_dir: None },
            RetentionSetting::Full(FullRetention::KeepNewest(count)) => Retention::KeepNewest(count),
            RetentionSetting::Full(FullRetention::Sanoid { config_dir }) => Retention::Sanoid { config_dir },
            RetentionSetting::Full(FullRetention::None) => Retention::None,
        }
    }
}

impl Default for Retention {
    fn default() -> Self {
        Retention::KeepNewest(NonZeroUsize::new(5).expect("5 is nonzero"))
    }
}
