use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::report::Report;
use crate::store::{self, StateDir};

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";
const SUFFIX: &str = ".report.json";

/// Short revision of the workspace's git HEAD, or `norev`.
pub fn source_revision(root: &Path) -> String {
    let out = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(root)
        .output();
    match out {
        Ok(o) if o.status.success() => {
            let rev = String::from_utf8_lossy(&o.stdout).trim().to_string();
            if rev.is_empty() || !rev.chars().all(|c| c.is_ascii_alphanumeric()) {
                "norev".to_string()
            } else {
                rev
            }
        }
        _ => "norev".to_string(),
    }
}

pub fn snapshot_name(at: DateTime<Utc>, rev: &str, report: &Report) -> String {
    let status = if report.any_fail() { "FAIL" } else { "PASS" };
    format!("{}_{rev}_{status}{SUFFIX}", at.format(STAMP_FORMAT))
}

fn stamp_of(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(SUFFIX)?;
    let (stamp, _) = stem.split_once('_')?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|n| n.and_utc())
}

pub fn write_snapshot(state: &StateDir, report: &Report, at: DateTime<Utc>, rev: &str) -> Result<String> {
    let name = snapshot_name(at, rev, report);
    store::write_json_atomic(&state.history_dir().join(&name), report)?;
    Ok(name)
}

/// History entries as `(stamp, file name)`, oldest first. Files that do not
/// follow the naming scheme are ignored.
pub fn entries(state: &StateDir) -> Result<Vec<(DateTime<Utc>, String)>> {
    let dir = state.history_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(&dir).with_context(|| format!("read history dir: {}", dir.display()))? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(at) = stamp_of(&name) {
            out.push((at, name));
        }
    }
    out.sort();
    Ok(out)
}

/// Deletes entries older than `max_age_days`, then the oldest remaining ones
/// until at most `max_snapshots` are left. Returns the deleted names.
pub fn rotate(
    state: &StateDir,
    max_snapshots: usize,
    max_age_days: u64,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let cutoff = now - chrono::Duration::days(max_age_days.min(365_000) as i64);
    let mut keep = Vec::new();
    let mut doomed = Vec::new();
    for (at, name) in entries(state)? {
        if at < cutoff {
            doomed.push(name);
        } else {
            keep.push(name);
        }
    }
    if keep.len() > max_snapshots {
        let excess = keep.len() - max_snapshots;
        doomed.extend(keep.drain(..excess));
    }
    for name in &doomed {
        let path = state.history_dir().join(name);
        std::fs::remove_file(&path).with_context(|| format!("remove: {}", path.display()))?;
    }
    if !doomed.is_empty() {
        tracing::debug!(deleted = doomed.len(), "history rotated");
    }
    Ok(doomed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{RuleResult, Status, Violation};
    use chrono::TimeZone;

    fn at(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, sec).unwrap()
    }

    #[test]
    fn name_encodes_stamp_rev_and_status() {
        let mut report = Report::default();
        assert_eq!(
            snapshot_name(at(5), "abc1234", &report),
            "20260301T120005.000Z_abc1234_PASS.report.json"
        );
        report.upsert(vec![RuleResult::from_violations(
            "1.4-boundary-internal",
            "t",
            Status::Fail,
            vec![Violation::new("1.4-boundary-internal", "a.ts", 1, "m", "h")],
        )]);
        assert!(snapshot_name(at(5), "norev", &report).ends_with("_norev_FAIL.report.json"));
        assert_eq!(stamp_of("20260301T120005.000Z_norev_PASS.report.json"), Some(at(5)));
    }

    #[test]
    fn rotation_keeps_the_most_recent_by_count() {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateDir::new(tmp.path());
        let report = Report::default();
        let mut names = Vec::new();
        for i in 0..5 {
            names.push(write_snapshot(&state, &report, at(i), "norev").unwrap());
            rotate(&state, 3, 14, at(i)).unwrap();
        }
        let left: Vec<String> = entries(&state).unwrap().into_iter().map(|(_, n)| n).collect();
        assert_eq!(left, names[2..].to_vec());
    }

    #[test]
    fn rotation_drops_aged_entries_first() {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateDir::new(tmp.path());
        let report = Report::default();
        let old = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        write_snapshot(&state, &report, old, "norev").unwrap();
        let fresh = write_snapshot(&state, &report, at(0), "norev").unwrap();
        std::fs::write(state.history_dir().join("notes.txt"), b"x").unwrap();

        let deleted = rotate(&state, 10, 14, at(30)).unwrap();
        assert_eq!(deleted.len(), 1);
        let left: Vec<String> = entries(&state).unwrap().into_iter().map(|(_, n)| n).collect();
        assert_eq!(left, vec![fresh]);
        assert!(state.history_dir().join("notes.txt").is_file());
    }
}
