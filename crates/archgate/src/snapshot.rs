use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use archgate_contracts::ARCHGATE_ROLLBACK_ENTRY_SCHEMA_VERSION;
use serde::Serialize;

use crate::report;
use crate::store::{self, AuditEntry, StateDir};
use crate::util;

const ID_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTarget {
    Latest,
    LatestGreen,
    To(String),
}

impl RollbackTarget {
    fn label(&self) -> String {
        match self {
            RollbackTarget::Latest => "latest".to_string(),
            RollbackTarget::LatestGreen => "latest-green".to_string(),
            RollbackTarget::To(id) => format!("to:{id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub id: String,
    pub dir: String,
    pub files: Vec<String>,
}

/// Copies the snapshot artifact set into `backups/<YYYYMMDDTHHMMSSZ>/`.
/// Missing artifacts are skipped. When the current second is already taken
/// the call waits for the next one.
pub fn create(state: &StateDir) -> Result<SnapshotInfo> {
    let backups = state.backups_dir();
    std::fs::create_dir_all(&backups)
        .with_context(|| format!("create backups dir: {}", backups.display()))?;

    let (id, dir) = loop {
        let id = chrono::Utc::now().format(ID_FORMAT).to_string();
        let dir = backups.join(&id);
        match std::fs::create_dir(&dir) {
            Ok(()) => break (id, dir),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                wait_past_second();
            }
            Err(err) => {
                return Err(err).with_context(|| format!("create snapshot: {}", dir.display()))
            }
        }
    };

    let mut files = Vec::new();
    for src in state.snapshot_set() {
        let Some(name) = src.file_name() else { continue };
        let bytes = match std::fs::read(&src) {
            Ok(b) => b,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err).with_context(|| format!("read: {}", src.display())),
        };
        store::write_atomic(&dir.join(name), &bytes)?;
        files.push(name.to_string_lossy().to_string());
    }
    tracing::info!(snapshot = %id, files = files.len(), "snapshot created");
    Ok(SnapshotInfo {
        id,
        dir: state.rel(&dir),
        files,
    })
}

fn wait_past_second() {
    let now = chrono::Utc::now();
    let ms = 1000 - u64::from(now.timestamp_subsec_millis().min(999));
    std::thread::sleep(std::time::Duration::from_millis(ms + 5));
}

/// Snapshot ids, oldest first.
pub fn list(state: &StateDir) -> Result<Vec<String>> {
    let backups = state.backups_dir();
    if !backups.is_dir() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(&backups)
        .with_context(|| format!("read backups dir: {}", backups.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            ids.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

fn snapshot_is_green(dir: &Path) -> bool {
    util::read_json_file(&dir.join("certificate.json"))
        .ok()
        .and_then(|v| v.get("pass").and_then(|p| p.as_bool()))
        .unwrap_or(false)
}

pub fn select(state: &StateDir, target: &RollbackTarget) -> Result<String> {
    let ids = list(state)?;
    let picked = match target {
        RollbackTarget::Latest => ids.last().cloned(),
        RollbackTarget::LatestGreen => ids
            .iter()
            .rev()
            .find(|id| snapshot_is_green(&state.backups_dir().join(id)))
            .cloned(),
        RollbackTarget::To(id) => ids.iter().find(|i| *i == id).cloned(),
    };
    match picked {
        Some(id) => Ok(id),
        None => bail!("no snapshot matches {}", target.label()),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackEntry {
    pub schema_version: String,
    pub timestamp: String,
    pub target: String,
    pub snapshot: String,
    pub restored: Vec<String>,
}

/// Restores the chosen snapshot's files over the live artifacts, then logs
/// the rollback to `rollback.log` and the audit log. The restored report is
/// not rewritten.
pub fn rollback(state: &StateDir, target: &RollbackTarget) -> Result<RollbackEntry> {
    let id = select(state, target)?;
    let dir = state.backups_dir().join(&id);

    let mut restored = Vec::new();
    for live in state.snapshot_set() {
        let Some(name) = live.file_name() else { continue };
        let src: PathBuf = dir.join(name);
        if !src.is_file() {
            continue;
        }
        let bytes = std::fs::read(&src).with_context(|| format!("read: {}", src.display()))?;
        store::write_atomic(&live, &bytes)?;
        restored.push(state.rel(&live));
    }

    let entry = RollbackEntry {
        schema_version: ARCHGATE_ROLLBACK_ENTRY_SCHEMA_VERSION.to_string(),
        timestamp: store::now_rfc3339(),
        target: target.label(),
        snapshot: id.clone(),
        restored,
    };
    store::append_ndjson(&state.rollback_log(), &entry)?;

    let report = report::load_or_default(state);
    let cert_hash = std::fs::read(state.certificate())
        .ok()
        .map(|b| util::sha256_hex(&b));
    store::append_audit(
        state,
        &AuditEntry::new("rollback", report.phases.clone(), report.classify().counts, cert_hash),
    )?;
    tracing::info!(snapshot = %id, "rolled back");
    Ok(entry)
}
