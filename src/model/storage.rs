use super::JobConfig;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub type JobSet = BTreeMap<String, JobConfig>;

#[derive(Deserialize)]
#[serde(untagged)]
enum JobFile {
    Single(Box<JobConfig>),
    Named(JobSet),
}

pub fn load_jobs(path: &Path) -> Result<JobSet> {
    let file = File::open(path).with_context(|| format!("Unable to open job file {:?}.", path))?;
    read_jobs(BufReader::new(file)).with_context(|| format!("Unable to load job file {:?}.", path))
}

/// Read a single job object or a map of job names to job objects.
///
/// A single job is keyed by its `name`, falling back to its source dataset.
/// Jobs from a map take their key as their name when they carry none.
pub fn read_jobs<R: Read>(reader: R) -> Result<JobSet> {
    let jobs = match serde_json::from_reader(reader).context("Job file is not a valid job or job map.")? {
        JobFile::Single(job) => {
            let mut jobs = JobSet::new();
            jobs.insert(job.display_name().to_string(), *job);
            jobs
        }
        JobFile::Named(mut jobs) => {
            for (name, job) in jobs.iter_mut() {
                job.name.get_or_insert_with(|| name.clone());
            }
            jobs
        }
    };

    if jobs.is_empty() {
        bail!("Job file defines no jobs.");
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn single_job_is_keyed_by_dataset() {
        let jobs = read_jobs(
            indoc!(
                r#"
                {
                    "source_host": "local",
                    "source_dataset": "tank/home",
                    "dest_host": "nas",
                    "dest_dataset": "backup/home",
                    "ssh_user": "root",
                    "recursive": true,
                    "snapshot_prefix": "zfsync"
                }"#
            )
            .as_bytes(),
        )
        .unwrap();
        assert_eq!(jobs.keys().collect::<Vec<_>>(), vec!["tank/home"]);
    }

    #[test]
    fn job_map_names_jobs_by_key() {
        let jobs = read_jobs(
            indoc!(
                r#"
                {
                    "home": {
                        "source_host": "local",
                        "source_dataset": "tank/home",
                        "dest_host": "nas",
                        "dest_dataset": "backup/home",
                        "ssh_user": "root",
                        "recursive": true,
                        "snapshot_prefix": "zfsync"
                    },
                    "media": {
                        "name": "media-offsite",
                        "source_host": "local",
                        "source_dataset": "tank/media",
                        "dest_host": "offsite",
                        "dest_dataset": "vault/media",
                        "ssh_user": "backup",
                        "recursive": false,
                        "snapshot_prefix": "zfsync",
                        "compression_method": "lz4"
                    }
                }"#
            )
            .as_bytes(),
        )
        .unwrap();
        assert_eq!(jobs["home"].name.as_deref(), Some("home"));
        assert_eq!(jobs["media"].name.as_deref(), Some("media-offsite"));
    }

    #[test]
    fn empty_and_malformed_files_fail() {
        assert!(read_jobs("{}".as_bytes()).is_err());
        assert!(read_jobs(r#"{"source_host": "local"}"#.as_bytes()).is_err());
        assert!(read_jobs("not json".as_bytes()).is_err());
    }
}
