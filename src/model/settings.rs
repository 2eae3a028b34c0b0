use crate::sys::ssh::SshOptions;
use anyhow::{Context, Result};
use log::*;
use serde::Deserialize;
use std::time::Duration;

const ENV_PREFIX: &str = "ZFSYNC_";

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_sanoid() -> String {
    "sanoid".to_string()
}

fn default_syncoid() -> String {
    "syncoid".to_string()
}

/// Engine-wide settings shared by every job in a run.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub ssh_connect_timeout: Duration,
    #[serde(default)]
    pub ssh_extra_options: Option<String>,
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    #[serde(default, with = "humantime_serde")]
    pub transfer_timeout: Option<Duration>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_sanoid")]
    pub sanoid_path: String,
    #[serde(default = "default_syncoid")]
    pub syncoid_path: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            ssh_connect_timeout: default_connect_timeout(),
            ssh_extra_options: None,
            command_timeout: default_command_timeout(),
            transfer_timeout: None,
            dry_run: false,
            sanoid_path: default_sanoid(),
            syncoid_path: default_syncoid(),
        }
    }
}

impl RunnerSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_iter(std::env::vars())
    }

    pub fn from_iter<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .with_context(|| format!("Invalid {}* environment settings.", ENV_PREFIX))
    }

    pub fn ssh_options(&self) -> SshOptions {
        let extra_options = match &self.ssh_extra_options {
            None => Vec::new(),
            Some(options) => shell_words::split(options).unwrap_or_else(|e| {
                error!("Ignoring extra SSH options {:?}: {}", options, e);
                Vec::new()
            }),
        };
        SshOptions {
            connect_timeout: self.ssh_connect_timeout,
            extra_options,
        }
    }
}
