//! Structural-only remediation.
//!
//! Every fix inserts one fixed marker line at the start or end of a file and
//! changes nothing else. The apply loop computes the expected content, lets the
//! editor produce the edit in memory and only writes when the two are equal;
//! any difference aborts the run with [`FixError::SemanticBlock`].

use std::path::Path;

use anyhow::Result;
use archgate_contracts::{ARCHGATE_FIX_APPLY_SCHEMA_VERSION, ARCHGATE_FIX_PLAN_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};

use crate::config::GovConfig;
use crate::error::FixError;
use crate::report::{Report, RuleResult, Status, Violation};
use crate::rules::{contracts, data_admission};
use crate::store::{self, StateDir};
use crate::util;

pub const RULE_FIX_SEMANTIC_GUARD: &str = "0.3-fix-semantic-guard";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    Prepend,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixKind {
    InsertWrapper,
    InsertIdMarker,
    InsertAuditMarker,
}

impl FixKind {
    pub fn for_rule(rule_id: &str) -> Option<Self> {
        match rule_id {
            data_admission::RULE_AUDIT_WRAPPED_MUTATIONS => Some(FixKind::InsertWrapper),
            contracts::RULE_GHOST_ROUTES => Some(FixKind::InsertIdMarker),
            data_admission::RULE_AUDIT_APPEND_ONLY => Some(FixKind::InsertAuditMarker),
            _ => None,
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            FixKind::InsertWrapper => "// @gov:audit-wrapper withAudit",
            FixKind::InsertIdMarker => "// @api UNREGISTERED",
            FixKind::InsertAuditMarker => "// @gov:audit-append-only",
        }
    }

    pub fn mode(self) -> InsertMode {
        match self {
            FixKind::InsertWrapper | FixKind::InsertIdMarker => InsertMode::Prepend,
            FixKind::InsertAuditMarker => InsertMode::Append,
        }
    }

    /// The only content this kind may ever produce from `content`.
    pub fn expected(self, content: &str) -> String {
        self.insert(&util::normalize_newlines(content))
    }

    fn insert(self, content: &str) -> String {
        match self.mode() {
            InsertMode::Prepend => format!("{}\n{content}", self.marker()),
            InsertMode::Append => {
                let mut out = content.to_string();
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(self.marker());
                out.push('\n');
                out
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixAction {
    pub file: String,
    pub kind: FixKind,
    pub message: String,
    pub rule_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixPlan {
    pub schema_version: String,
    pub generated_at: String,
    pub dry_run: bool,
    pub actions: Vec<FixAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedFix {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixApplyReport {
    pub schema_version: String,
    pub generated_at: String,
    pub applied: Vec<FixAction>,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BlockedFix>,
}

/// File access and edit production used by [`apply`]. The default editor
/// writes atomically.
pub trait Editor {
    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>>;

    /// Post-edit content for `kind` applied to `content`. Never touches disk.
    fn edit(&self, kind: FixKind, content: &str) -> String {
        kind.insert(&util::normalize_newlines(content))
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()>;
}

pub struct AtomicEditor;

impl Editor for AtomicEditor {
    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        store::write_atomic(path, bytes).map_err(|err| std::io::Error::other(format!("{err:#}")))
    }
}

/// Maps fixable violations to actions, sorted by `(file, kind)` with one action
/// per pair. Files that already carry the marker, or cannot be read, are left out.
pub fn plan(root: &Path, report: &Report) -> Vec<FixAction> {
    let mut actions: Vec<FixAction> = Vec::new();
    for result in report.results.iter().filter(|r| r.status != Status::Pass) {
        let Some(kind) = FixKind::for_rule(&result.rule_id) else {
            continue;
        };
        for v in &result.violations {
            if actions.iter().any(|a| a.file == v.file && a.kind == kind) {
                continue;
            }
            let text = match std::fs::read(root.join(&v.file)) {
                Ok(b) => String::from_utf8_lossy(&b).into_owned(),
                Err(err) => {
                    tracing::warn!(file = %v.file, "fix plan skips unreadable file: {err}");
                    continue;
                }
            };
            if text.contains(kind.marker()) {
                tracing::debug!(file = %v.file, ?kind, "marker already present");
                continue;
            }
            actions.push(FixAction {
                file: v.file.clone(),
                kind,
                message: v.message.clone(),
                rule_id: result.rule_id.clone(),
            });
        }
    }
    actions.sort_by(|a, b| (a.file.as_str(), a.kind).cmp(&(b.file.as_str(), b.kind)));
    actions
}

fn guard(cfg: &GovConfig, action: &FixAction, content: &str) -> Result<(), FixError> {
    let rel = action.file.replace('\\', "/");
    if rel.starts_with('/') || rel.split('/').any(|seg| seg == "..") {
        return Err(FixError::semantic_block(&action.file, "path escapes the workspace"));
    }
    if let Some(p) = cfg
        .fix_protected_paths
        .iter()
        .find(|p| rel.contains(p.as_str()))
    {
        return Err(FixError::semantic_block(
            &action.file,
            format!("path matches protected pattern `{p}`"),
        ));
    }
    if content.contains(&cfg.semantic_lock_marker) {
        return Err(FixError::semantic_block(
            &action.file,
            format!("file carries semantic lock `{}`", cfg.semantic_lock_marker),
        ));
    }
    Ok(())
}

/// Applies actions in order and stops at the first blocked one. Actions
/// before the block stay applied; later ones are never attempted.
pub fn apply(
    root: &Path,
    cfg: &GovConfig,
    actions: &[FixAction],
    editor: &dyn Editor,
) -> (Vec<FixAction>, Result<(), FixError>) {
    let mut applied = Vec::new();
    for action in actions {
        if let Err(err) = apply_one(root, cfg, action, editor) {
            tracing::error!(file = %action.file, "fix apply aborted: {err}");
            return (applied, Err(err));
        }
        tracing::info!(file = %action.file, kind = ?action.kind, "fix applied");
        applied.push(action.clone());
    }
    (applied, Ok(()))
}

fn apply_one(root: &Path, cfg: &GovConfig, action: &FixAction, editor: &dyn Editor) -> Result<(), FixError> {
    let path = root.join(&action.file);
    let io = |source: std::io::Error| FixError::Io {
        path: path.clone(),
        source,
    };

    let original = editor.read(&path).map_err(io)?;
    let current = String::from_utf8_lossy(&original);
    guard(cfg, action, &current)?;

    let expected = action.kind.expected(&current);
    let actual = util::normalize_newlines(&editor.edit(action.kind, &current));
    if actual != expected {
        return Err(FixError::semantic_block(
            &action.file,
            format!(
                "edit diverged from the `{}` insertion; refusing a non-structural change",
                action.kind.marker()
            ),
        ));
    }
    editor.write(&path, actual.as_bytes()).map_err(io)
}

/// Unified-diff style preview of every action, computed in plan order.
pub fn preview_patch(root: &Path, actions: &[FixAction]) -> String {
    let mut simulated: std::collections::BTreeMap<&str, String> = std::collections::BTreeMap::new();
    let mut out = String::new();
    for action in actions {
        let current = match simulated.get(action.file.as_str()) {
            Some(t) => t.clone(),
            None => match std::fs::read(root.join(&action.file)) {
                Ok(b) => util::normalize_newlines(&String::from_utf8_lossy(&b)),
                Err(err) => {
                    tracing::warn!(file = %action.file, "preview skips unreadable file: {err}");
                    continue;
                }
            },
        };
        let lines = current.lines().count();
        let hunk = match action.kind.mode() {
            InsertMode::Prepend => "@@ -0,0 +1,1 @@".to_string(),
            InsertMode::Append => format!("@@ -{lines},0 +{},1 @@", lines + 1),
        };
        out.push_str(&format!(
            "--- a/{f}\n+++ b/{f}\n{hunk}\n+{}\n",
            action.kind.marker(),
            f = action.file
        ));
        simulated.insert(action.file.as_str(), action.kind.expected(&current));
    }
    out
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixOutcome {
    pub dry_run: bool,
    pub plan: Vec<FixAction>,
    pub applied: Vec<FixAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<BlockedFix>,
}

impl FixOutcome {
    /// `0.3-fix-semantic-guard` result for this run.
    pub fn guard_rule(&self) -> RuleResult {
        let violations = self
            .blocked
            .iter()
            .map(|b| {
                Violation::new(
                    RULE_FIX_SEMANTIC_GUARD,
                    b.file.clone(),
                    1,
                    format!("semantic block: {}", b.reason),
                    "Resolve the blocking condition by hand, or remove the file from the fix plan.",
                )
            })
            .collect();
        RuleResult::from_violations(
            RULE_FIX_SEMANTIC_GUARD,
            "Fixes are structural only",
            Status::Fail,
            violations,
        )
        .with_evidence("planned", self.plan.len() as u64)
        .with_evidence("applied", self.applied.len() as u64)
    }
}

/// Plans from the current report and either previews (`dry_run`) or applies.
/// Dry runs write only `fix-plan.json` and `fix.patch`.
pub fn run(state: &StateDir, cfg: &GovConfig, report: &Report, dry_run: bool, editor: &dyn Editor) -> Result<FixOutcome> {
    let actions = plan(&state.root, report);
    let plan_doc = FixPlan {
        schema_version: ARCHGATE_FIX_PLAN_SCHEMA_VERSION.to_string(),
        generated_at: store::now_rfc3339(),
        dry_run,
        actions: actions.clone(),
    };
    store::write_json_atomic(&state.fix_plan(), &plan_doc)?;
    tracing::info!(actions = actions.len(), dry_run, "fix plan written");

    if dry_run {
        store::write_atomic(&state.fix_patch(), preview_patch(&state.root, &actions).as_bytes())?;
        return Ok(FixOutcome {
            dry_run,
            plan: actions,
            applied: Vec::new(),
            blocked: None,
        });
    }

    let (applied, result) = apply(&state.root, cfg, &actions, editor);
    let blocked = match result {
        Ok(()) => None,
        Err(FixError::SemanticBlock { file, reason }) => Some(BlockedFix { file, reason }),
        Err(err) => return Err(err.into()),
    };
    let apply_doc = FixApplyReport {
        schema_version: ARCHGATE_FIX_APPLY_SCHEMA_VERSION.to_string(),
        generated_at: store::now_rfc3339(),
        applied: applied.clone(),
        result: if blocked.is_some() { "blocked" } else { "ok" }.to_string(),
        error: blocked.clone(),
    };
    store::write_json_atomic(&state.fix_apply(), &apply_doc)?;

    Ok(FixOutcome {
        dry_run,
        plan: actions,
        applied,
        blocked,
    })
}
