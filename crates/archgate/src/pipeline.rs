//! The pipeline stages behind every command. Each stage reads the shared
//! state it needs, upserts its own rule results into `report.json` and
//! appends one audit entry.

use std::path::{Component, Path};

use anyhow::{anyhow, bail, Result};
use serde::Serialize;

use crate::certificate::{self, CertificateCheck};
use crate::config::{self, GovConfig};
use crate::crawl;
use crate::emit;
use crate::fix::{self, AtomicEditor, FixOutcome};
use crate::gate::{self, Verdict};
use crate::history;
use crate::registry;
use crate::report::{self, ClassifiedSet, Counts, Report};
use crate::rules::{self, ui_coverage, Inputs};
use crate::snapshot::{self, RollbackEntry, RollbackTarget, SnapshotInfo};
use crate::store::{self, AuditEntry, StateDir};
use crate::util;

/// Workspace root, state dir and the config in effect for one invocation.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub state: StateDir,
    pub cfg: GovConfig,
    pub config_error: Option<String>,
}

impl Workspace {
    pub fn open(root: &Path) -> Self {
        let state = StateDir::new(root);
        let (cfg, config_error) = config::load(&state);
        Self {
            state,
            cfg,
            config_error,
        }
    }

    pub fn root(&self) -> &Path {
        &self.state.root
    }

    pub fn signing_key(&self) -> Option<Vec<u8>> {
        certificate::signing_key(self.root(), &self.cfg)
    }
}

fn audit(state: &StateDir, mode: &str, report: &Report) -> Result<()> {
    let cert_hash = std::fs::read(state.certificate())
        .ok()
        .map(|b| util::sha256_hex(&b));
    store::append_audit(
        state,
        &AuditEntry::new(mode, report.phases.clone(), report.classify().counts, cert_hash),
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub modules: usize,
    pub files: usize,
    pub edges: usize,
    pub violating_edges: usize,
    pub ui_coverage: f64,
    pub phases: std::collections::BTreeMap<String, String>,
    pub counts: Counts,
}

/// Workspace-relative POSIX form of a scan path. `None` means the whole
/// workspace. Paths that leave the root or do not exist are rejected.
fn resolve_scope(root: &Path, path: &str) -> Result<Option<String>> {
    let base = util::normalize_lexical(root);
    let abs = util::normalize_lexical(&base.join(path));
    let rel = abs
        .strip_prefix(&base)
        .ok()
        .filter(|rel| rel.components().all(|c| matches!(c, Component::Normal(_))))
        .ok_or_else(|| anyhow!("scan path `{path}` is outside the workspace"))?;
    if !root.join(rel).exists() {
        bail!("scan path `{path}` does not exist");
    }
    let rel = util::rel_posix(Path::new(""), rel);
    Ok((!rel.is_empty()).then_some(rel))
}

/// Registry, crawl and the full rule battery. `path` narrows the source set
/// and the edge list to files under that workspace-relative path; findings
/// outside it are carried over from the current report.
pub fn scan(ws: &Workspace, path: Option<&str>) -> Result<(ScanSummary, Report)> {
    let root = ws.root();
    let cfg = &ws.cfg;
    let scope = match path {
        Some(p) => resolve_scope(root, p)?,
        None => None,
    };

    let loaded = registry::load(root, cfg);
    let modules = registry::resolve_modules(root, &loaded.registry);
    let files = crawl::walk_sources(root, scope.as_deref().unwrap_or(""), cfg);
    let mut graph = crawl::crawl(root, &modules, cfg);
    if let Some(prefix) = &scope {
        let under = format!("{prefix}/");
        graph
            .edges
            .retain(|e| e.source_file == *prefix || e.source_file.starts_with(&under));
    }
    let ui_keys = ui_coverage::load_registry_keys(&ws.state);

    let inputs = Inputs {
        root,
        cfg,
        registry: &loaded.registry,
        modules: &modules,
        files: &files,
        ui_registry_keys: &ui_keys,
    };
    let evaluation = rules::evaluate(&inputs, &mut graph);
    if scope.is_none() {
        store::write_json_atomic(&ws.state.routing_table(), &evaluation.routing_table)?;
    }

    let workspace_rules = vec![
        registry::registry_rule(&loaded),
        config::config_rule(&ws.state, ws.config_error.as_deref()),
    ];
    let report = report::update_with(&ws.state, |report| {
        match &scope {
            Some(prefix) => report.merge_scoped(evaluation.results, prefix),
            None => report.upsert(evaluation.results),
        }
        report.upsert(workspace_rules);
    })?;
    audit(&ws.state, "scan", &report)?;

    let summary = ScanSummary {
        mode: "scan",
        path: scope,
        modules: modules.len(),
        files: files.len(),
        edges: graph.edges.len(),
        violating_edges: graph.edges.iter().filter(|e| e.violates).count(),
        ui_coverage: evaluation.routing_table.coverage,
        phases: report.phases.clone(),
        counts: report.classify().counts,
    };
    tracing::info!(edges = summary.edges, red = summary.counts.red, "scan complete");
    Ok((summary, report))
}

fn classify_and_gate(ws: &Workspace, report: &Report) -> Result<(ClassifiedSet, Verdict)> {
    let classified = report.classify();
    store::write_json_atomic(&ws.state.results(), &classified)?;
    let verdict = gate::evaluate(&ws.cfg.policy(), classified.counts);
    Ok((classified, verdict))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySummary {
    pub mode: &'static str,
    pub verdict: Verdict,
    pub signed: bool,
    pub certificate: String,
    pub snapshot: SnapshotInfo,
}

/// Classify, gate, render evidence, sign, snapshot. Scans first when no
/// report exists yet.
pub fn verify(ws: &Workspace) -> Result<VerifySummary> {
    let state = &ws.state;
    if !state.report().is_file() {
        tracing::info!("no report yet; scanning first");
        scan(ws, None)?;
    }

    let key = ws.signing_key();
    let report = report::update(state, vec![certificate::signing_rule(state, key.is_some())])?;
    let (_, verdict) = classify_and_gate(ws, &report)?;

    emit::write_sarif(state, &report)?;
    emit::write_junit(state, &report)?;
    emit::write_hints(state, &report)?;
    emit::write_html(state, &report, Some(&verdict))?;

    let (cert, _) = certificate::issue(state, &verdict, ws.cfg.policy(), key.as_deref())?;
    let snapshot = snapshot::create(state)?;
    audit(state, "verify", &report)?;

    tracing::info!(pass = verdict.pass, "verify complete");
    Ok(VerifySummary {
        mode: "verify",
        signed: cert.signature.is_some(),
        certificate: state.rel(&state.certificate()),
        verdict,
        snapshot,
    })
}

/// Re-checks the written certificate against its evidence. An intact
/// certificate leaves the report alone; a broken one records a FAIL on
/// `0.2-certificate-signature`.
pub fn check_certificate(ws: &Workspace) -> Result<CertificateCheck> {
    let check = certificate::check(&ws.state, ws.signing_key().as_deref())?;
    if let Some(rule) = check.failure_rule(&ws.state) {
        tracing::warn!(signature_ok = check.signature_ok, "certificate check failed");
        let report = report::update(&ws.state, vec![rule])?;
        audit(&ws.state, "certificate-check", &report)?;
    }
    Ok(check)
}

/// Plans fixes from the current report. Apply runs record the guard rule;
/// dry runs write nothing beyond the plan and the preview patch.
pub fn fix(ws: &Workspace, dry_run: bool) -> Result<FixOutcome> {
    let state = &ws.state;
    let current = report::load_or_default(state);
    let outcome = fix::run(state, &ws.cfg, &current, dry_run, &AtomicEditor)?;
    if !dry_run {
        let report = report::update(state, vec![outcome.guard_rule()])?;
        audit(state, "fix", &report)?;
    }
    Ok(outcome)
}

pub fn rollback(ws: &Workspace, target: &RollbackTarget) -> Result<RollbackEntry> {
    snapshot::rollback(&ws.state, target)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassSummary {
    pub scan: ScanSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    pub hints: usize,
    pub history: String,
}

/// One watch pass: scan, gate when results exist, hints, HTML, history.
pub fn watch_pass(ws: &Workspace) -> Result<PassSummary> {
    let state = &ws.state;
    let had_results = state.results().is_file();
    let (summary, report) = scan(ws, None)?;

    let verdict = if had_results {
        Some(classify_and_gate(ws, &report)?.1)
    } else {
        None
    };
    let hints = emit::write_hints(state, &report)?;
    emit::write_html(state, &report, verdict.as_ref())?;

    let now = chrono::Utc::now();
    let rev = history::source_revision(ws.root());
    let name = history::write_snapshot(state, &report, now, &rev)?;
    history::rotate(
        state,
        ws.cfg.history_max_snapshots,
        ws.cfg.history_max_age_days,
        now,
    )?;
    audit(state, "watch", &report)?;

    Ok(PassSummary {
        scan: summary,
        verdict,
        hints: hints.hints.len(),
        history: name,
    })
}

pub fn current_report(ws: &Workspace) -> Report {
    report::load_or_default(&ws.state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Status;

    const REGISTRY: &str = r#"{
  "version": "1",
  "modules": [
    {"name": "billing", "root": "modules/billing", "serviceId": "svc.billing"},
    {"name": "orders", "root": "modules/orders", "serviceId": "svc.orders"}
  ],
  "ids": {"API": [], "SVC": ["svc.billing", "svc.orders"], "DB": []}
}
"#;

    fn write(root: &Path, rel: &str, text: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, text).unwrap();
    }

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write(root, ".governance/registry.json", REGISTRY);
        for m in ["billing", "orders"] {
            write(root, &format!("modules/{m}/contracts/index.ts"), "export type X = {};\n");
            write(root, &format!("modules/{m}/internal/impl.ts"), "export const y = 1;\n");
        }
        write(
            root,
            "modules/orders/src/use.ts",
            "import { charge } from '../../billing/internal/impl';\n",
        );
        let ws = Workspace::open(root);
        (tmp, ws)
    }

    #[test]
    fn scan_reports_internal_import_and_writes_artifacts() {
        let (_tmp, ws) = workspace();
        let (summary, report) = scan(&ws, None).unwrap();
        assert_eq!(summary.modules, 2);
        assert_eq!(summary.violating_edges, 1);
        let r = report.get("1.4-boundary-internal").unwrap();
        assert_eq!(r.status, Status::Fail);
        assert_eq!(r.violations[0].file, "modules/orders/src/use.ts");
        assert_eq!(report.get(registry::RULE_REGISTRY_VALID).unwrap().status, Status::Pass);
        assert_eq!(report.get(config::RULE_CONFIG_VALID).unwrap().status, Status::Pass);
        assert!(ws.state.routing_table().is_file());
        assert_eq!(std::fs::read_to_string(ws.state.audit_log()).unwrap().lines().count(), 1);
    }

    #[test]
    fn scan_twice_keeps_one_result_per_rule() {
        let (_tmp, ws) = workspace();
        let (_, first) = scan(&ws, None).unwrap();
        let (_, second) = scan(&ws, None).unwrap();
        assert_eq!(first.results.len(), second.results.len());
        let mut ids: Vec<&str> = second.results.iter().map(|r| r.rule_id.as_str()).collect();
        ids.dedup();
        assert_eq!(ids.len(), second.results.len());
    }

    #[test]
    fn scoped_scan_keeps_failures_outside_its_path() {
        let (tmp, ws) = workspace();
        write(
            tmp.path(),
            "modules/billing/repo.ts",
            "export async function save(db) {\n  await db.user.create({ data: {} });\n}\n",
        );
        let rule = "2.4-audit-wrapped-mutations";
        let (_, full) = scan(&ws, None).unwrap();
        assert_eq!(full.get(rule).unwrap().status, Status::Fail);

        let (summary, scoped) = scan(&ws, Some("modules/orders/")).unwrap();
        assert_eq!(summary.path.as_deref(), Some("modules/orders"));
        let r = scoped.get(rule).unwrap();
        assert_eq!(r.status, Status::Fail);
        assert_eq!(r.violations[0].file, "modules/billing/repo.ts");
        assert_eq!(scoped.phases["2"], "FAIL");

        let saved = current_report(&ws);
        assert_eq!(saved.get(rule).unwrap().status, Status::Fail);
        let internal = saved.get("1.4-boundary-internal").unwrap();
        assert_eq!(internal.status, Status::Fail, "in-scope finding re-evaluated and kept");
    }

    #[test]
    fn scan_path_must_exist_and_stay_inside_the_workspace() {
        let (tmp, ws) = workspace();
        let outside = tmp.path().join("..").join("elsewhere");
        for bad in ["does/not/exist", "../secret", "modules/../../x"] {
            let err = scan(&ws, Some(bad)).unwrap_err();
            assert!(format!("{err:#}").contains(bad), "{err:#}");
        }
        let err = scan(&ws, Some(outside.to_str().unwrap())).unwrap_err();
        assert!(format!("{err:#}").contains("outside the workspace"), "{err:#}");
        assert!(!ws.state.report().exists(), "rejected scans write nothing");

        let (summary, _) = scan(&ws, Some(".")).unwrap();
        assert_eq!(summary.path, None);
    }

    #[test]
    fn malformed_registry_degrades_instead_of_aborting() {
        let (tmp, _) = workspace();
        write(tmp.path(), ".governance/registry.json", "{ not json");
        let ws = Workspace::open(tmp.path());
        let (_, report) = scan(&ws, None).unwrap();
        assert_eq!(report.get(registry::RULE_REGISTRY_VALID).unwrap().status, Status::Fail);
    }

    #[test]
    fn verify_without_key_writes_unsigned_certificate_and_fails() {
        if std::env::var(certificate::SIGNING_KEY_ENV).is_ok() {
            return;
        }
        let (_tmp, mut ws) = workspace();
        ws.cfg.signing_key_file = Some("missing.key".to_string());
        let summary = verify(&ws).unwrap();
        assert!(!summary.signed);
        assert!(!summary.verdict.pass);
        assert!(ws.state.certificate().is_file());
        assert!(ws.state.sarif().is_file());
        assert!(ws.state.junit().is_file());
        let report = current_report(&ws);
        assert_eq!(
            report.get(certificate::RULE_CERTIFICATE_SIGNATURE).unwrap().status,
            Status::Fail
        );
    }

    #[test]
    fn signed_verify_then_check_passes() {
        let (tmp, mut ws) = workspace();
        write(tmp.path(), "gov.key", "s3cret\n");
        ws.cfg.signing_key_file = Some("gov.key".to_string());
        let summary = verify(&ws).unwrap();
        assert!(summary.signed);
        assert!(!summary.verdict.pass, "internal import keeps the gate red");
        let before = std::fs::read(ws.state.report()).unwrap();
        let check = check_certificate(&ws).unwrap();
        assert!(check.ok, "{check:?}");
        assert_eq!(std::fs::read(ws.state.report()).unwrap(), before);
    }

    #[test]
    fn tampered_evidence_records_signature_rule_failure() {
        let (tmp, mut ws) = workspace();
        write(tmp.path(), "gov.key", "s3cret\n");
        ws.cfg.signing_key_file = Some("gov.key".to_string());
        verify(&ws).unwrap();
        assert_eq!(
            current_report(&ws).get(certificate::RULE_CERTIFICATE_SIGNATURE).unwrap().status,
            Status::Pass
        );

        let mut junit = std::fs::read(ws.state.junit()).unwrap();
        junit.extend_from_slice(b"<!-- edited -->\n");
        std::fs::write(ws.state.junit(), junit).unwrap();

        let check = check_certificate(&ws).unwrap();
        assert!(!check.ok);
        let report = current_report(&ws);
        let rule = report.get(certificate::RULE_CERTIFICATE_SIGNATURE).unwrap();
        assert_eq!(rule.status, Status::Fail);
        assert!(rule.violations.iter().any(|v| v.file == ".governance/junit.xml"));
    }

    #[test]
    fn watch_pass_writes_hints_html_and_history() {
        let (_tmp, ws) = workspace();
        let pass = watch_pass(&ws).unwrap();
        assert!(pass.verdict.is_none());
        assert!(pass.hints > 0);
        assert!(pass.history.ends_with("_FAIL.report.json"));
        assert!(ws.state.html().is_file());
        assert!(ws.state.history_dir().join(&pass.history).is_file());
    }
}
