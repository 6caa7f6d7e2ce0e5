//! At-most-once admission of inbound files into the locked area.
//!
//! Each file is renamed individually and the cursor in `ingest.state.json`
//! is persisted after every move, so an interrupted run resumes exactly
//! where it stopped.

use std::path::Path;

use anyhow::{Context, Result};
use archgate_contracts::ARCHGATE_INGEST_STATE_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::GovConfig;
use crate::store::{self, StateDir};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Running,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestState {
    pub schema_version: String,
    pub status: IngestStatus,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_file: Option<String>,
    pub moved_count: u64,
    pub pending_files: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    pub resume: bool,
    /// Stop after this many moves, leaving the run `running`.
    pub limit: Option<u64>,
}

pub fn load_state(state: &StateDir) -> Result<Option<IngestState>> {
    let path = state.ingest_state();
    if !path.is_file() {
        return Ok(None);
    }
    store::read_json(&path).map(Some)
}

/// Inbound files relative to the inbound dir, sorted.
fn discover(inbound: &Path) -> Vec<String> {
    if !inbound.is_dir() {
        return Vec::new();
    }
    let mut out: Vec<String> = WalkDir::new(inbound)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| util::rel_posix(inbound, e.path()))
        .filter(|rel| {
            let name = rel.rsplit('/').next().unwrap_or(rel);
            !store::is_temp_artifact(name)
        })
        .collect();
    out.sort();
    out
}

pub fn run(state: &StateDir, cfg: &GovConfig, opts: IngestOptions) -> Result<IngestState> {
    let inbound = state.root.join(&cfg.ingest_inbound);
    let locked = state.root.join(&cfg.ingest_locked);

    let resumed = if opts.resume {
        load_state(state)?.filter(|s| s.status == IngestStatus::Running)
    } else {
        None
    };
    let mut cursor = match resumed {
        Some(s) => {
            tracing::info!(pending = s.pending_files.len(), "resuming ingest");
            s
        }
        None => IngestState {
            schema_version: ARCHGATE_INGEST_STATE_SCHEMA_VERSION.to_string(),
            status: IngestStatus::Running,
            started_at: store::now_rfc3339(),
            last_file: None,
            moved_count: 0,
            pending_files: discover(&inbound),
        },
    };
    store::write_json_atomic(&state.ingest_state(), &cursor)?;

    let mut moved_this_run = 0u64;
    while let Some(rel) = cursor.pending_files.first().cloned() {
        if opts.limit.is_some_and(|n| moved_this_run >= n) {
            tracing::info!(moved = moved_this_run, "ingest stopped at limit");
            return Ok(cursor);
        }
        let src = inbound.join(&rel);
        let dst = locked.join(&rel);
        if src.is_file() {
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create dir: {}", parent.display()))?;
            }
            std::fs::rename(&src, &dst)
                .with_context(|| format!("move {} -> {}", src.display(), dst.display()))?;
            cursor.moved_count += 1;
        } else if dst.is_file() {
            // moved before the cursor was persisted
            cursor.moved_count += 1;
        } else {
            tracing::warn!(file = %rel, "pending file vanished; dropping");
        }
        cursor.pending_files.remove(0);
        cursor.last_file = Some(rel);
        moved_this_run += 1;
        store::write_json_atomic(&state.ingest_state(), &cursor)?;
    }

    cursor.status = IngestStatus::Complete;
    store::write_json_atomic(&state.ingest_state(), &cursor)?;
    tracing::info!(moved = cursor.moved_count, "ingest complete");
    Ok(cursor)
}
