use super::runner::{tool_lookup, CommandError, CommandRunner};
use super::Snapshot;
use crate::sys::ssh::Host;
use crate::sys::zfs;
use log::*;
use std::collections::{BTreeMap, BTreeSet};

/// Read-only queries against dataset and snapshot state on one or two hosts.
pub struct Inspector<'r, 'a> {
    runner: &'r CommandRunner<'a>,
}

impl<'r, 'a> Inspector<'r, 'a> {
    pub fn new(runner: &'r CommandRunner<'a>) -> Self {
        Self { runner }
    }

    /// Existence is a query; any failure to list means "does not exist".
    pub fn dataset_exists(&self, dataset: &str, host: &Host) -> bool {
        match self.runner.run(&zfs::list_dataset(dataset), host, false) {
            Ok(output) => output.success(),
            Err(e) => {
                debug!("Existence check for {} on {} failed: {}", dataset, host, e);
                false
            }
        }
    }

    /// Confirms SSH and `zfs` work on `host` by listing the pool that holds `dataset`.
    pub fn check_pool(&self, dataset: &str, host: &Host) -> Result<(), CommandError> {
        self.runner
            .run(&zfs::list_dataset(zfs::pool_of(dataset)), host, true)
            .map(|_| ())
    }

    pub fn tool_available(&self, program: &str, host: &Host) -> bool {
        match self.runner.run(&tool_lookup(program), host, false) {
            Ok(output) => output.success(),
            Err(e) => {
                debug!("Looking up {} on {} failed: {}", program, host, e);
                false
            }
        }
    }

    pub fn list_snapshots(&self, dataset: &str, host: &Host) -> Result<Vec<Snapshot>, CommandError> {
        let output = self.runner.run(&zfs::list_snapshots(dataset), host, true)?;
        Ok(zfs::parse_snapshot_listing(&output.stdout, dataset))
    }

    pub fn list_snapshots_with_guid(&self, dataset: &str, host: &Host) -> Result<BTreeMap<String, u64>, CommandError> {
        Ok(self
            .list_snapshots(dataset, host)?
            .into_iter()
            .map(|s| (s.name, s.guid))
            .collect())
    }

    /// Snapshots of the source that the destination holds with the same GUID, newest name first.
    pub fn find_verified_common_snapshots(
        &self,
        src_dataset: &str,
        src_host: &Host,
        dst_dataset: &str,
        dst_host: &Host,
    ) -> Result<Vec<Snapshot>, CommandError> {
        let source = self.list_snapshots(src_dataset, src_host)?;
        let destination = self.list_snapshots_with_guid(dst_dataset, dst_host)?;
        let common = verified_common_snapshots(source, &destination);
        debug!(
            "{} verified common snapshots between {} on {} and {} on {}.",
            common.len(),
            src_dataset,
            src_host,
            dst_dataset,
            dst_host
        );
        Ok(common)
    }

    /// A pending resume token on the destination. Query failures mean none.
    pub fn resume_token(&self, dataset: &str, host: &Host) -> Option<String> {
        match self.runner.run(&zfs::get_resume_token(dataset), host, true) {
            Ok(output) => zfs::parse_resume_token(&output.stdout),
            Err(e) => {
                debug!("No resume token for {} on {}: {}", dataset, host, e);
                None
            }
        }
    }

    /// Estimated stream size for sending `snapshot`, from `base` when incremental.
    pub fn estimate_size(&self, dataset: &str, host: &Host, snapshot: &str, base: Option<&str>) -> Option<u64> {
        let queries = match base {
            Some(base) => vec![zfs::get_value(&format!("written@{}", base), dataset)],
            None => vec![
                zfs::get_value("referenced", &zfs::snapshot_path(dataset, snapshot)),
                zfs::get_value("referenced", dataset),
            ],
        };
        queries.iter().find_map(|query| {
            let output = self.runner.run(query, host, true).map_err(|e| debug!("{}", e)).ok()?;
            zfs::parse_byte_value(&output.stdout)
                .map_err(|e| debug!("Unusable size estimate: {}", e))
                .ok()
                .flatten()
        })
    }
}

/// Keep source snapshots whose name exists on the destination with an equal GUID.
pub fn verified_common_snapshots(source: Vec<Snapshot>, destination: &BTreeMap<String, u64>) -> Vec<Snapshot> {
    let mut common = source
        .into_iter()
        .filter(|s| match destination.get(&s.name) {
            Some(guid) if *guid == s.guid => true,
            Some(guid) => {
                warn!(
                    "Snapshot {} exists on both sides with different GUIDs ({} and {}); not a common point.",
                    s.name, s.guid, guid
                );
                false
            }
            None => false,
        })
        .collect::<Vec<_>>();
    common.sort_by(|a, b| b.name.cmp(&a.name));
    common
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotComparison {
    pub name: String,
    pub source_guid: Option<u64>,
    pub destination_guid: Option<u64>,
}

impl SnapshotComparison {
    pub fn verified(&self) -> bool {
        self.source_guid.is_some() && self.source_guid == self.destination_guid
    }
}

/// Side-by-side view of both snapshot maps, newest name first.
pub fn compare_snapshots(source: &BTreeMap<String, u64>, destination: &BTreeMap<String, u64>) -> Vec<SnapshotComparison> {
    let names = source.keys().chain(destination.keys()).collect::<BTreeSet<_>>();
    names
        .into_iter()
        .rev()
        .map(|name| SnapshotComparison {
            name: name.clone(),
            source_guid: source.get(name).copied(),
            destination_guid: destination.get(name).copied(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argv;
    use crate::core::runner::testing::*;
    use crate::sys::process::MockExecutor;
    use chrono::{TimeZone, Utc};
    use indoc::indoc;
    use mockall::predicate::*;

    fn snapshot(name: &str, guid: u64) -> Snapshot {
        Snapshot {
            dataset: "tank/a".to_string(),
            name: name.to_string(),
            guid,
            creation: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn guids(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(n, g)| (n.to_string(), *g)).collect()
    }

    #[test]
    fn common_snapshots_require_matching_guid() {
        let source = vec![snapshot("p-20240101", 1), snapshot("p-20240102", 2), snapshot("p-20240103", 3)];
        let destination = guids(&[("p-20240101", 1), ("p-20240102", 99), ("other", 5)]);
        let common = verified_common_snapshots(source, &destination);
        assert_eq!(common.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["p-20240101"]);
    }

    #[test]
    fn identical_maps_share_everything_newest_first() {
        let source = vec![snapshot("p-20240102", 2), snapshot("p-20240101", 1), snapshot("p-20240103", 3)];
        let destination = guids(&[("p-20240101", 1), ("p-20240102", 2), ("p-20240103", 3)]);
        let common = verified_common_snapshots(source, &destination);
        assert_eq!(
            common.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["p-20240103", "p-20240102", "p-20240101"]
        );
        assert!(verified_common_snapshots(vec![], &destination).is_empty());
    }

    #[test]
    fn comparison_marks_mismatches() {
        let rows = compare_snapshots(&guids(&[("a", 1), ("b", 2)]), &guids(&[("b", 2), ("c", 3), ("a", 9)]));
        assert_eq!(rows.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["c", "b", "a"]);
        assert_eq!(rows.iter().map(|r| r.verified()).collect::<Vec<_>>(), vec![false, true, false]);
    }

    #[test]
    fn inspector_queries_both_hosts() {
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .with(eq(zfs::list_snapshots("tank/a")), always())
            .returning(|_, _| {
                ok(indoc!(
                    "
                    tank/a@p-1\t11\t1700000000
                    tank/a@p-2\t22\t1700000100
                    "
                ))
            });
        executor
            .expect_execute()
            .withf(|argv, _| argv[0] == "ssh" && argv.last().map_or(false, |c| c.contains("backup/a")))
            .returning(|_, _| ok("backup/a@p-1\t11\t1700000000\nbackup/a@p-2\t23\t1700000100\n"));
        let runner = runner(&executor, false);
        let inspector = Inspector::new(&runner);

        let common = inspector
            .find_verified_common_snapshots("tank/a", &Host::Local, "backup/a", &Host::from("nas"))
            .unwrap();
        assert_eq!(common.len(), 1);
        assert_eq!(common[0].full_name(), "tank/a@p-1");
    }

    #[test]
    fn existence_and_tokens_never_fail() {
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .with(eq(zfs::list_dataset("backup/a")), always())
            .returning(|_, _| failed(1, "cannot open 'backup/a': dataset does not exist"));
        executor
            .expect_execute()
            .with(eq(zfs::get_resume_token("backup/a")), always())
            .returning(|_, _| failed(1, "cannot open 'backup/a': dataset does not exist"));
        let runner = runner(&executor, false);
        let inspector = Inspector::new(&runner);

        assert!(!inspector.dataset_exists("backup/a", &Host::Local));
        assert_eq!(inspector.resume_token("backup/a", &Host::Local), None);
    }

    #[test]
    fn full_estimate_falls_back_to_dataset() {
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .with(eq(argv!("zfs", "get", "-Hp", "-o", "value", "referenced", "tank/a@new")), always())
            .returning(|_, _| failed(1, "dataset does not exist"));
        executor
            .expect_execute()
            .with(eq(argv!("zfs", "get", "-Hp", "-o", "value", "referenced", "tank/a")), always())
            .returning(|_, _| ok("1048576\n"));
        executor
            .expect_execute()
            .with(eq(argv!("zfs", "get", "-Hp", "-o", "value", "written@old", "tank/a")), always())
            .returning(|_, _| ok("4096\n"));
        let runner = runner(&executor, false);
        let inspector = Inspector::new(&runner);

        assert_eq!(inspector.estimate_size("tank/a", &Host::Local, "new", None), Some(1048576));
        assert_eq!(inspector.estimate_size("tank/a", &Host::Local, "new", Some("old")), Some(4096));
    }
}
