use anyhow::Result;
use archgate_contracts::ARCHGATE_DOCTOR_REPORT_SCHEMA_VERSION;
use serde::Serialize;
use walkdir::WalkDir;

use crate::ingest::{self, IngestStatus};
use crate::pipeline::Workspace;
use crate::registry;
use crate::report::{self, RuleResult, Status, Violation};
use crate::store::{self, AuditEntry, StateDir};

pub const RULE_DOCTOR: &str = "0.6-doctor";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorReport {
    pub schema_version: &'static str,
    pub ok: bool,
    pub checks: Vec<Check>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct Check {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip)]
    file: String,
}

impl Check {
    fn new(name: &str, ok: bool, detail: Option<String>, file: String) -> Self {
        Self {
            name: name.to_string(),
            ok,
            detail,
            file,
        }
    }
}

fn check_state_dir(state: &StateDir) -> Check {
    let rel = state.rel(&state.dir);
    let probe = state.dir.join("doctor.probe");
    let res = store::write_atomic(&probe, b"ok").and_then(|()| {
        std::fs::remove_file(&probe).map_err(anyhow::Error::from)
    });
    match res {
        Ok(()) => Check::new("state_dir_writable", true, None, rel),
        Err(err) => Check::new("state_dir_writable", false, Some(format!("{err:#}")), rel),
    }
}

/// Removes leftover atomic-write temp files anywhere under the state dir.
fn clean_stale_temp_files(state: &StateDir) -> Check {
    let rel = state.rel(&state.dir);
    let mut removed = Vec::new();
    let mut failed = Vec::new();
    for entry in WalkDir::new(&state.dir).into_iter().filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy();
        if !entry.file_type().is_file() || !store::is_temp_artifact(&name) {
            continue;
        }
        let path_rel = state.rel(entry.path());
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed.push(path_rel),
            Err(err) => failed.push(format!("{path_rel}: {err}")),
        }
    }
    if failed.is_empty() {
        Check::new(
            "stale_temp_files",
            true,
            Some(format!("removed {}", removed.len())),
            rel,
        )
    } else {
        Check::new("stale_temp_files", false, Some(failed.join("; ")), rel)
    }
}

fn check_audit_log(state: &StateDir) -> Check {
    let rel = state.rel(&state.audit_log());
    let text = match std::fs::read_to_string(state.audit_log()) {
        Ok(t) => t,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Check::new("audit_log", true, Some("absent".to_string()), rel)
        }
        Err(err) => return Check::new("audit_log", false, Some(err.to_string()), rel),
    };
    let bad: Vec<String> = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .filter(|(_, l)| serde_json::from_str::<AuditEntry>(l).is_err())
        .map(|(i, _)| (i + 1).to_string())
        .collect();
    if bad.is_empty() {
        Check::new(
            "audit_log",
            true,
            Some(format!("{} entries", text.lines().count())),
            rel,
        )
    } else {
        Check::new(
            "audit_log",
            false,
            Some(format!("unparseable lines: {}", bad.join(", "))),
            rel,
        )
    }
}

fn check_ingest(state: &StateDir) -> Check {
    let rel = state.rel(&state.ingest_state());
    match ingest::load_state(state) {
        Ok(None) => Check::new("ingest_state", true, Some("absent".to_string()), rel),
        Ok(Some(s)) if s.status == IngestStatus::Running => Check::new(
            "ingest_state",
            false,
            Some(format!(
                "ingest stuck in running with {} pending file(s)",
                s.pending_files.len()
            )),
            rel,
        ),
        Ok(Some(s)) => Check::new(
            "ingest_state",
            true,
            Some(format!("complete, {} moved", s.moved_count)),
            rel,
        ),
        Err(err) => Check::new("ingest_state", false, Some(format!("{err:#}")), rel),
    }
}

pub fn run(ws: &Workspace) -> Result<DoctorReport> {
    let state = &ws.state;
    let mut checks = vec![check_state_dir(state)];

    let loaded = registry::load(ws.root(), &ws.cfg);
    checks.push(Check::new(
        "registry",
        loaded.issues.is_empty(),
        (!loaded.issues.is_empty()).then(|| loaded.issues.join("; ")),
        loaded.path.clone(),
    ));
    checks.push(Check::new(
        "config",
        ws.config_error.is_none(),
        ws.config_error.clone(),
        state.rel(&state.config()),
    ));
    checks.push(clean_stale_temp_files(state));
    checks.push(check_audit_log(state));
    checks.push(check_ingest(state));

    let mut suggestions = Vec::new();
    for c in checks.iter().filter(|c| !c.ok) {
        suggestions.push(match c.name.as_str() {
            "state_dir_writable" => "Make .governance writable by the current user.".to_string(),
            "registry" => "Fix the registry; run `archgate scan` to see 0.4-registry-valid.".to_string(),
            "config" => "Fix config.yml; defaults are in effect until then.".to_string(),
            "ingest_state" => "Run `archgate ingest --resume` to finish the interrupted run.".to_string(),
            _ => format!("Inspect {} by hand.", c.file),
        });
    }

    let violations: Vec<Violation> = checks
        .iter()
        .filter(|c| !c.ok)
        .zip(&suggestions)
        .map(|(c, hint)| {
            Violation::new(
                RULE_DOCTOR,
                c.file.clone(),
                1,
                format!("{}: {}", c.name, c.detail.clone().unwrap_or_default()),
                hint.clone(),
            )
        })
        .collect();
    let rule = RuleResult::from_violations(
        RULE_DOCTOR,
        "Governance state is healthy",
        Status::Fail,
        violations,
    )
    .with_evidence("checks", checks.len() as u64);

    // Only record when the state dir is usable; otherwise the report cannot be written.
    if checks[0].ok {
        let report = report::update(state, vec![rule])?;
        store::append_audit(
            state,
            &AuditEntry::new("doctor", report.phases.clone(), report.classify().counts, None),
        )?;
    }

    Ok(DoctorReport {
        schema_version: ARCHGATE_DOCTOR_REPORT_SCHEMA_VERSION,
        ok: checks.iter().all(|c| c.ok),
        checks,
        suggestions,
    })
}
