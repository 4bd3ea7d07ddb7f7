//! Classifying processes into I/O limit groups via cgroups.
//!
//! A `/proc/<pid>/cgroup` line reads `hierarchy-id:subsystems:path`; the
//! group of a process is the path of the line whose comma-separated
//! subsystem list contains the configured subsystem.

use std::io::BufRead;

use once_cell::sync::Lazy;
use regex::Regex;

use super::UNCLASSIFIED;

static CGROUP_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+):([^:]*):(.*)$").expect("cgroup line pattern"));

/// Parse `/proc/<pid>/cgroup`-formatted data.
pub fn group_id_from_reader<R: BufRead>(reader: R, subsystem: &str) -> Option<String> {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => return None,
        };
        let captures = match CGROUP_LINE.captures(&line) {
            Some(captures) => captures,
            None => continue,
        };
        let subsystems = &captures[2];
        if subsystems.split(',').any(|candidate| candidate == subsystem) {
            return Some(captures[3].to_string());
        }
    }
    None
}

/// Group of a process, or [`UNCLASSIFIED`] when the process cannot be
/// classified (no such pid, no such subsystem).
pub fn group_id_for_pid(pid: u32, subsystem: &str) -> String {
    let path = format!("/proc/{}/cgroup", pid);
    match std::fs::File::open(path) {
        Ok(file) => group_id_from_reader(std::io::BufReader::new(file), subsystem)
            .unwrap_or_else(|| UNCLASSIFIED.to_string()),
        Err(_) => UNCLASSIFIED.to_string(),
    }
}

/// How the proxy maps a calling pid to a group. Injectable for tests.
pub trait GroupClassifier: Send + Sync {
    fn classify(&self, pid: u32, subsystem: &str) -> String;
}

pub struct CgroupClassifier;

impl GroupClassifier for CgroupClassifier {
    fn classify(&self, pid: u32, subsystem: &str) -> String {
        group_id_for_pid(pid, subsystem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
12:blkio:/user.slice
11:cpu,cpuacct:/workload/batch
10:devices:/
0::/init.scope
";

    #[test]
    fn finds_subsystem_in_list() {
        assert_eq!(
            group_id_from_reader(SAMPLE.as_bytes(), "cpuacct"),
            Some("/workload/batch".to_string())
        );
        assert_eq!(
            group_id_from_reader(SAMPLE.as_bytes(), "blkio"),
            Some("/user.slice".to_string())
        );
    }

    #[test]
    fn partial_names_do_not_match() {
        assert_eq!(group_id_from_reader(SAMPLE.as_bytes(), "cpu_extra"), None);
        assert_eq!(group_id_from_reader(SAMPLE.as_bytes(), "dev"), None);
    }

    #[test]
    fn missing_subsystem_is_unclassified() {
        assert_eq!(group_id_from_reader(SAMPLE.as_bytes(), "memory"), None);
        // a pid that does not exist falls back as well
        assert_eq!(group_id_for_pid(u32::MAX, "blkio"), UNCLASSIFIED);
    }
}
