use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use archgate_contracts::ARCHGATE_AUDIT_ENTRY_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};

use crate::report::Counts;
use crate::util;

pub const STATE_DIR_NAME: &str = ".governance";

static TMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Paths of every artifact under the governance state directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    pub root: PathBuf,
    pub dir: PathBuf,
}

impl StateDir {
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            root: workspace_root.to_path_buf(),
            dir: workspace_root.join(STATE_DIR_NAME),
        }
    }

    pub fn report(&self) -> PathBuf {
        self.dir.join("report.json")
    }
    pub fn results(&self) -> PathBuf {
        self.dir.join("results.json")
    }
    pub fn certificate(&self) -> PathBuf {
        self.dir.join("certificate.json")
    }
    pub fn sarif(&self) -> PathBuf {
        self.dir.join("results.sarif")
    }
    pub fn junit(&self) -> PathBuf {
        self.dir.join("junit.xml")
    }
    pub fn html(&self) -> PathBuf {
        self.dir.join("report.html")
    }
    pub fn hints(&self) -> PathBuf {
        self.dir.join("hints.json")
    }
    pub fn ui_registry(&self) -> PathBuf {
        self.dir.join("ui-registry.json")
    }
    pub fn routing_table(&self) -> PathBuf {
        self.dir.join("routing-table.json")
    }
    pub fn history_dir(&self) -> PathBuf {
        self.dir.join("history")
    }
    pub fn backups_dir(&self) -> PathBuf {
        self.dir.join("backups")
    }
    pub fn rollback_log(&self) -> PathBuf {
        self.backups_dir().join("rollback.log")
    }
    pub fn audit_log(&self) -> PathBuf {
        self.dir.join("audit.log")
    }
    pub fn fix_plan(&self) -> PathBuf {
        self.dir.join("fix-plan.json")
    }
    pub fn fix_patch(&self) -> PathBuf {
        self.dir.join("fix.patch")
    }
    pub fn fix_apply(&self) -> PathBuf {
        self.dir.join("fix-apply.json")
    }
    pub fn ingest_state(&self) -> PathBuf {
        self.dir.join("ingest.state.json")
    }
    pub fn config(&self) -> PathBuf {
        self.dir.join("config.yml")
    }

    /// Artifacts copied into every rollback snapshot.
    pub fn snapshot_set(&self) -> Vec<PathBuf> {
        vec![
            self.report(),
            self.certificate(),
            self.ui_registry(),
            self.routing_table(),
            self.hints(),
        ]
    }

    pub fn rel(&self, path: &Path) -> String {
        util::rel_posix(&self.root, path)
    }
}

/// Writes via a sibling temp file and a rename, so readers observe either the
/// previous file or the complete new one.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir: {}", parent.display()))?;
    }

    let tmp = temp_path_next_to(path);
    let res = write_temp(&tmp, contents).and_then(|()| {
        std::fs::rename(&tmp, path).with_context(|| format!("rename: {}", path.display()))
    });
    if res.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    res
}

fn write_temp(tmp: &Path, contents: &[u8]) -> Result<()> {
    let mut f =
        std::fs::File::create(tmp).with_context(|| format!("create temp: {}", tmp.display()))?;
    f.write_all(contents)
        .with_context(|| format!("write temp: {}", tmp.display()))?;
    f.sync_all()
        .with_context(|| format!("sync temp: {}", tmp.display()))
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = util::pretty_json_bytes(value)?;
    write_atomic(path, &bytes)
}

pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("read: {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse JSON: {}", path.display()))
}

/// Leftover temp files are the only trace an interrupted write can leave.
pub fn is_temp_artifact(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

fn temp_path_next_to(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let pid = std::process::id();
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{file_name}.{pid}.{n}.tmp"))
}

/// Appends one JSON line. The file is opened in append mode and never truncated.
pub fn append_ndjson<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir: {}", parent.display()))?;
    }
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open for append: {}", path.display()))?;
    f.write_all(&line)
        .with_context(|| format!("append: {}", path.display()))?;
    f.sync_data()
        .with_context(|| format!("sync: {}", path.display()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub schema_version: String,
    pub timestamp: String,
    pub mode: String,
    pub phases: BTreeMap<String, String>,
    pub counts: Counts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_hash: Option<String>,
}

impl AuditEntry {
    pub fn new(
        mode: &str,
        phases: BTreeMap<String, String>,
        counts: Counts,
        certificate_hash: Option<String>,
    ) -> Self {
        Self {
            schema_version: ARCHGATE_AUDIT_ENTRY_SCHEMA_VERSION.to_string(),
            timestamp: now_rfc3339(),
            mode: mode.to_string(),
            phases,
            counts,
            certificate_hash,
        }
    }
}

pub fn append_audit(state: &StateDir, entry: &AuditEntry) -> Result<()> {
    tracing::debug!(mode = %entry.mode, "append audit entry");
    append_ndjson(&state.audit_log(), entry)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_and_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("state/report.json");
        write_atomic(&path, b"one").expect("first write");
        write_atomic(&path, b"two").expect("second write");
        assert_eq!(std::fs::read(&path).expect("read"), b"two");

        let leftovers: Vec<String> = std::fs::read_dir(path.parent().unwrap())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| is_temp_artifact(n))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
    }

    #[test]
    fn failed_rename_keeps_the_destination_and_cleans_the_temp_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("report.json");
        std::fs::create_dir_all(path.join("occupied")).expect("mkdir");

        let err = write_atomic(&path, b"new").expect_err("rename over a directory");
        assert!(format!("{err:#}").contains("rename"), "{err:#}");
        assert!(path.join("occupied").is_dir());

        let leftovers: Vec<String> = std::fs::read_dir(tmp.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| is_temp_artifact(n))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
    }

    #[test]
    fn append_ndjson_preserves_previous_lines() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("audit.log");
        append_ndjson(&path, &serde_json::json!({"n": 1})).expect("append 1");
        append_ndjson(&path, &serde_json::json!({"n": 2})).expect("append 2");
        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec![r#"{"n":1}"#, r#"{"n":2}"#]);
    }
}
