use std::collections::BTreeMap;

use anyhow::Result;
use archgate_contracts::{ARCHGATE_REPORT_SCHEMA_VERSION, ARCHGATE_RESULTS_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{self, StateDir};

/// Phases rolled up in `Report::phases`, keyed by rule id prefix.
pub const PHASES: [&str; 4] = ["1", "2", "3", "4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Warn,
    Fail,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pass => "PASS",
            Status::Warn => "WARN",
            Status::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub rule_id: String,
    pub file: String,
    pub line: usize,
    pub message: String,
    pub fix_hint: String,
}

impl Violation {
    pub fn new(
        rule_id: &str,
        file: impl Into<String>,
        line: usize,
        message: impl Into<String>,
        fix_hint: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            file: file.into(),
            line,
            message: message.into(),
            fix_hint: fix_hint.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResult {
    pub rule_id: String,
    pub title: String,
    pub status: Status,
    pub severity: Severity,
    #[serde(default)]
    pub evidence: BTreeMap<String, Value>,
    #[serde(default)]
    pub violations: Vec<Violation>,
}

impl RuleResult {
    pub fn pass(rule_id: &str, title: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            title: title.to_string(),
            status: Status::Pass,
            severity: Severity::Info,
            evidence: BTreeMap::new(),
            violations: Vec::new(),
        }
    }

    /// PASS when `violations` is empty, `failing` otherwise.
    pub fn from_violations(
        rule_id: &str,
        title: &str,
        failing: Status,
        violations: Vec<Violation>,
    ) -> Self {
        let mut r = Self::pass(rule_id, title);
        if !violations.is_empty() {
            r.status = failing;
            r.severity = severity_for(failing);
        }
        r.violations = violations;
        r
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self.severity = severity_for(status);
        self
    }

    pub fn with_evidence(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.evidence.insert(key.to_string(), value.into());
        self
    }

    pub fn phase(&self) -> &str {
        self.rule_id.split('.').next().unwrap_or("")
    }
}

/// True when `file` is `scope` itself or lies beneath it.
pub fn in_scope(file: &str, scope: &str) -> bool {
    file == scope
        || file
            .strip_prefix(scope)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn merge_rule(old: Option<&RuleResult>, new: RuleResult, scope: &str) -> RuleResult {
    let reported = !new.violations.is_empty();
    let mut merged = new;
    merged.violations.retain(|v| in_scope(&v.file, scope));

    let mut status = if reported && merged.violations.is_empty() {
        Status::Pass
    } else {
        merged.status
    };
    if let Some(old) = old {
        let kept: Vec<Violation> = old
            .violations
            .iter()
            .filter(|v| !in_scope(&v.file, scope))
            .cloned()
            .collect();
        if !kept.is_empty() {
            status = status.max(old.status);
            merged.violations.extend(kept);
        }
    }
    merged
        .violations
        .sort_by(|a, b| (a.file.as_str(), a.line).cmp(&(b.file.as_str(), b.line)));
    merged.with_status(status)
}

fn severity_for(status: Status) -> Severity {
    match status {
        Status::Pass => Severity::Info,
        Status::Warn => Severity::Warning,
        Status::Fail => Severity::Error,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub schema_version: String,
    pub generated_at: String,
    pub phases: BTreeMap<String, String>,
    pub results: Vec<RuleResult>,
}

impl Default for Report {
    fn default() -> Self {
        let mut r = Self {
            schema_version: ARCHGATE_REPORT_SCHEMA_VERSION.to_string(),
            generated_at: String::new(),
            phases: BTreeMap::new(),
            results: Vec::new(),
        };
        r.recompute_phases();
        r
    }
}

impl Report {
    /// Replaces results with matching rule ids and inserts the rest. At most
    /// one result per rule id survives.
    pub fn upsert(&mut self, results: impl IntoIterator<Item = RuleResult>) {
        for result in results {
            match self.results.iter_mut().find(|r| r.rule_id == result.rule_id) {
                Some(existing) => *existing = result,
                None => self.results.push(result),
            }
        }
        self.results.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        self.recompute_phases();
        self.generated_at = store::now_rfc3339();
    }

    /// Upsert for a scan limited to `scope`. Findings inside the scope come
    /// from `results`, findings outside it are kept from this report, and each
    /// status is recomputed from the merged violations.
    pub fn merge_scoped(&mut self, results: impl IntoIterator<Item = RuleResult>, scope: &str) {
        let merged: Vec<RuleResult> = results
            .into_iter()
            .map(|r| merge_rule(self.get(&r.rule_id), r, scope))
            .collect();
        self.upsert(merged);
    }

    pub fn recompute_phases(&mut self) {
        self.phases.clear();
        for phase in PHASES {
            let failed = self
                .results
                .iter()
                .any(|r| r.phase() == phase && r.status == Status::Fail);
            self.phases.insert(
                phase.to_string(),
                if failed { "FAIL" } else { "PASS" }.to_string(),
            );
        }
    }

    pub fn get(&self, rule_id: &str) -> Option<&RuleResult> {
        self.results.iter().find(|r| r.rule_id == rule_id)
    }

    pub fn any_fail(&self) -> bool {
        self.results.iter().any(|r| r.status == Status::Fail)
    }

    pub fn classify(&self) -> ClassifiedSet {
        let mut set = ClassifiedSet {
            schema_version: ARCHGATE_RESULTS_SCHEMA_VERSION.to_string(),
            red: Vec::new(),
            amber: Vec::new(),
            green: Vec::new(),
            counts: Counts::default(),
        };
        for r in &self.results {
            match r.status {
                Status::Fail => set.red.extend(r.violations.iter().cloned()),
                Status::Warn => set.amber.extend(r.violations.iter().cloned()),
                Status::Pass => set.green.push(GreenEntry {
                    rule_id: r.rule_id.clone(),
                    title: r.title.clone(),
                }),
            }
        }
        set.counts = Counts {
            red: set.red.len() as u64,
            amber: set.amber.len() as u64,
            green: set.green.len() as u64,
        };
        set
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub red: u64,
    pub amber: u64,
    pub green: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GreenEntry {
    pub rule_id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedSet {
    pub schema_version: String,
    pub red: Vec<Violation>,
    pub amber: Vec<Violation>,
    pub green: Vec<GreenEntry>,
    pub counts: Counts,
}

/// Reads the shared report, or an empty one when none exists or it cannot be parsed.
pub fn load_or_default(state: &StateDir) -> Report {
    let path = state.report();
    if !path.is_file() {
        return Report::default();
    }
    match store::read_json::<Report>(&path) {
        Ok(r) => r,
        Err(err) => {
            tracing::warn!("report.json unreadable, starting fresh: {err:#}");
            Report::default()
        }
    }
}

/// Read-modify-write of `report.json` with upsert-by-rule-id semantics.
pub fn update(state: &StateDir, results: Vec<RuleResult>) -> Result<Report> {
    update_with(state, |report| report.upsert(results))
}

pub fn update_with(state: &StateDir, change: impl FnOnce(&mut Report)) -> Result<Report> {
    let mut report = load_or_default(state);
    change(&mut report);
    store::write_json_atomic(&state.report(), &report)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing(id: &str) -> RuleResult {
        RuleResult::from_violations(
            id,
            "t",
            Status::Fail,
            vec![Violation::new(id, "a.ts", 1, "bad", "fix it")],
        )
    }

    #[test]
    fn upsert_twice_keeps_one_result_per_rule() {
        let inputs = vec![failing("1.4-boundary-internal"), RuleResult::pass("2.1-x", "t")];
        let mut report = Report::default();
        report.upsert(inputs.clone());
        report.upsert(inputs);
        assert_eq!(report.results.len(), 2);
        let ids: Vec<&str> = report.results.iter().map(|r| r.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["1.4-boundary-internal", "2.1-x"]);
    }

    #[test]
    fn upsert_replaces_and_recomputes_phase() {
        let mut report = Report::default();
        report.upsert(vec![failing("3.5-ghost-routes")]);
        assert_eq!(report.phases["3"], "FAIL");
        report.upsert(vec![RuleResult::pass("3.5-ghost-routes", "t")]);
        assert_eq!(report.phases["3"], "PASS");
        assert_eq!(report.phases["1"], "PASS");
    }

    #[test]
    fn operational_rules_do_not_roll_up_into_phases() {
        let mut report = Report::default();
        report.upsert(vec![failing("0.2-certificate-signature")]);
        assert!(report.phases.values().all(|s| s == "PASS"));
        assert!(report.any_fail());
    }

    fn violation(id: &str, file: &str) -> Violation {
        Violation::new(id, file, 1, "bad", "fix it")
    }

    #[test]
    fn scoped_merge_keeps_findings_outside_the_scope() {
        let id = "2.4-audit-wrapped-mutations";
        let mut report = Report::default();
        report.upsert(vec![RuleResult::from_violations(
            id,
            "t",
            Status::Fail,
            vec![violation(id, "mod/billing/repo.ts"), violation(id, "mod/orders/a.ts")],
        )]);

        report.merge_scoped(vec![RuleResult::pass(id, "t")], "mod/orders");
        let r = report.get(id).unwrap();
        assert_eq!(r.status, Status::Fail);
        assert_eq!(r.severity, Severity::Error);
        let files: Vec<&str> = r.violations.iter().map(|v| v.file.as_str()).collect();
        assert_eq!(files, vec!["mod/billing/repo.ts"]);

        report.merge_scoped(vec![RuleResult::pass(id, "t")], "mod/billing");
        assert_eq!(report.get(id).unwrap().status, Status::Pass);
        assert!(report.get(id).unwrap().violations.is_empty());
    }

    #[test]
    fn scoped_merge_drops_new_findings_outside_the_scope() {
        let id = "3.3-contract-spec";
        let mut report = Report::default();
        report.merge_scoped(
            vec![RuleResult::from_violations(
                id,
                "t",
                Status::Fail,
                vec![violation(id, "mod/orders"), violation(id, "mod/orders/src/x.ts")],
            )],
            "mod/orders/src",
        );
        let r = report.get(id).unwrap();
        assert_eq!(r.status, Status::Fail);
        assert_eq!(r.violations.len(), 1);
        assert_eq!(r.violations[0].file, "mod/orders/src/x.ts");
    }

    #[test]
    fn in_scope_matches_whole_segments_only() {
        assert!(in_scope("mod/orders", "mod/orders"));
        assert!(in_scope("mod/orders/a.ts", "mod/orders"));
        assert!(!in_scope("mod/orders-v2/a.ts", "mod/orders"));
        assert!(!in_scope("mod/billing/a.ts", "mod/orders"));
    }

    #[test]
    fn classify_buckets_by_status() {
        let mut report = Report::default();
        let warn = RuleResult::from_violations(
            "4.1-ui",
            "t",
            Status::Warn,
            vec![Violation::new("4.1-ui", "p.tsx", 1, "m", "h")],
        );
        report.upsert(vec![failing("1.5-x"), warn, RuleResult::pass("2.2-y", "t")]);
        let set = report.classify();
        assert_eq!(set.counts, Counts { red: 1, amber: 1, green: 1 });
        assert_eq!(set.green[0].rule_id, "2.2-y");
    }
}
