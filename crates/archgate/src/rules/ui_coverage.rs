//! UI registry coverage.
//!
//! The inventory is derived from file paths only: each configured UI root is
//! matched against the routing conventions of Next.js (`app/**/page.*` and
//! `pages/`), React Router / Remix (`routes/`), SvelteKit (`+page.svelte`)
//! and Vue (`views/`). Files outside those conventions are not inventoried.

use std::collections::BTreeSet;

use archgate_contracts::ARCHGATE_ROUTING_TABLE_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CoverageMode;
use crate::report::{RuleResult, Status, Violation};
use crate::store::StateDir;

use super::{files_under, Inputs};

pub const RULE_UI_REGISTRY_COVERAGE: &str = "4.1-ui-registry-coverage";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiItem {
    pub scope: String,
    pub file: String,
    pub route: String,
    pub framework: String,
    pub candidates: Vec<String>,
    pub mapped_keys: Vec<String>,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingTable {
    pub schema_version: String,
    pub total: u64,
    pub mapped: u64,
    pub coverage: f64,
    pub items: Vec<UiItem>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            schema_version: ARCHGATE_ROUTING_TABLE_SCHEMA_VERSION.to_string(),
            total: 0,
            mapped: 0,
            coverage: 1.0,
            items: Vec::new(),
        }
    }
}

/// Keys declared in `ui-registry.json`. Accepts `{"entries": {..}}`,
/// `{"keys": [..]}`, a plain object keyed by registry key, or an array of
/// strings / `{"key": ..}` objects. A missing or unreadable file yields no keys.
pub fn load_registry_keys(state: &StateDir) -> BTreeSet<String> {
    let path = state.ui_registry();
    if !path.is_file() {
        return BTreeSet::new();
    }
    match crate::util::read_json_file(&path) {
        Ok(v) => registry_keys(&v),
        Err(err) => {
            tracing::warn!("ui-registry.json unreadable: {err:#}");
            BTreeSet::new()
        }
    }
}

fn registry_keys(v: &Value) -> BTreeSet<String> {
    match v {
        Value::Object(obj) => {
            if let Some(entries) = obj.get("entries") {
                return registry_keys(entries);
            }
            if let Some(keys) = obj.get("keys") {
                return registry_keys(keys);
            }
            obj.keys().cloned().collect()
        }
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("key").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn normalize_segment(seg: &str) -> Option<String> {
    if seg.is_empty() || seg == "index" || seg == "_index" {
        return None;
    }
    if seg.starts_with('(') && seg.ends_with(')') {
        return None;
    }
    let inner = seg
        .trim_start_matches('[')
        .trim_end_matches(']');
    if seg.starts_with('[') {
        return Some(match inner.strip_prefix("...") {
            Some(rest) => format!("*{rest}"),
            None => format!(":{inner}"),
        });
    }
    if let Some(param) = seg.strip_prefix('$') {
        return Some(if param.is_empty() {
            "*".to_string()
        } else {
            format!(":{param}")
        });
    }
    Some(seg.to_string())
}

fn strip_ext(name: &str) -> &str {
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

/// Route and framework for a path relative to its UI root, if it follows a
/// known routing convention.
pub fn route_of(rel_in_root: &str) -> Option<(String, &'static str)> {
    let parts: Vec<&str> = rel_in_root.split('/').collect();
    let (name, dirs) = parts.split_last()?;
    let after = |marker: &str| dirs.iter().position(|d| *d == marker).map(|i| &dirs[i + 1..]);

    let (framework, raw): (&'static str, Vec<String>) = if name.starts_with("+page.") {
        let tail = after("routes")?;
        ("sveltekit", tail.iter().map(|s| s.to_string()).collect())
    } else if strip_ext(name) == "page" && after("app").is_some() {
        let tail = after("app")?;
        ("next-app", tail.iter().map(|s| s.to_string()).collect())
    } else if let Some(tail) = after("pages") {
        if name.starts_with('_') || tail.first() == Some(&"api") {
            return None;
        }
        let mut segs: Vec<String> = tail.iter().map(|s| s.to_string()).collect();
        segs.push(strip_ext(name).to_string());
        ("next-pages", segs)
    } else if let Some(tail) = after("routes") {
        let mut segs: Vec<String> = tail.iter().map(|s| s.to_string()).collect();
        let stem = strip_ext(name);
        if stem.starts_with("__") || stem == "root" {
            return None;
        }
        segs.extend(stem.split('.').map(str::to_string));
        ("react-router", segs)
    } else if let Some(tail) = after("views") {
        let mut segs: Vec<String> = tail.iter().map(|s| s.to_string()).collect();
        segs.push(strip_ext(name).to_string());
        ("vue", segs)
    } else {
        return None;
    };

    let segs: Vec<String> = raw.iter().filter_map(|s| normalize_segment(s)).collect();
    Some((format!("/{}", segs.join("/")), framework))
}

/// `scope:/route`, `scope.seg.seg` (or `scope.index`) and `/route`.
pub fn key_candidates(scope: &str, route: &str) -> Vec<String> {
    let dotted: Vec<&str> = route
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_start_matches([':', '*']))
        .collect();
    let dotted = if dotted.is_empty() {
        format!("{scope}.index")
    } else {
        format!("{scope}.{}", dotted.join("."))
    };
    vec![format!("{scope}:{route}"), dotted, route.to_string()]
}

fn scope_of(root: &str) -> String {
    root.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(root)
        .to_string()
}

pub fn inventory(inputs: &Inputs<'_>) -> Vec<UiItem> {
    let cfg = inputs.cfg;
    let critical: Vec<String> = cfg
        .ui_critical_patterns
        .iter()
        .map(|p| p.to_ascii_lowercase())
        .collect();

    let mut roots: Vec<&String> = vec![&cfg.ui_root, &cfg.dealer_ui_root, &cfg.admin_ui_root];
    roots.dedup();

    let mut items = Vec::new();
    for root in roots {
        let scope = scope_of(root);
        let prefix = format!("{}/", root.trim_end_matches('/'));
        for file in files_under(inputs.files, root) {
            let Some(rel_in_root) = file.rel.strip_prefix(&prefix) else {
                continue;
            };
            let Some((route, framework)) = route_of(rel_in_root) else {
                tracing::debug!(file = %file.rel, "no routing convention matched");
                continue;
            };
            let candidates = key_candidates(&scope, &route);
            let mapped_keys = candidates
                .iter()
                .filter(|k| inputs.ui_registry_keys.contains(*k))
                .cloned()
                .collect();
            let haystack = format!("{} {}", file.rel, route).to_ascii_lowercase();
            items.push(UiItem {
                scope: scope.clone(),
                file: file.rel.clone(),
                route,
                framework: framework.to_string(),
                candidates,
                mapped_keys,
                critical: critical.iter().any(|p| haystack.contains(p.as_str())),
            });
        }
    }
    items
}

pub fn evaluate(inputs: &Inputs<'_>) -> (RuleResult, RoutingTable) {
    let items = inventory(inputs);
    let total = items.len() as u64;
    let mapped = items.iter().filter(|i| !i.mapped_keys.is_empty()).count() as u64;
    let coverage = if total == 0 {
        1.0
    } else {
        mapped as f64 / total as f64
    };
    let table = RoutingTable {
        total,
        mapped,
        coverage,
        items,
        ..RoutingTable::default()
    };

    let title = "UI inventory is covered by the UI registry";
    let mode = inputs.cfg.ui_coverage_mode;
    let with_evidence = |r: RuleResult| {
        r.with_evidence("total", total)
            .with_evidence("mapped", mapped)
            .with_evidence("coverage", coverage)
            .with_evidence("mode", format!("{mode:?}").to_ascii_lowercase())
    };

    if mode == CoverageMode::Off {
        return (with_evidence(RuleResult::pass(RULE_UI_REGISTRY_COVERAGE, title)), table);
    }

    let mut violations: Vec<Violation> = table
        .items
        .iter()
        .filter(|i| i.critical && i.mapped_keys.is_empty())
        .map(|i| {
            Violation::new(
                RULE_UI_REGISTRY_COVERAGE,
                i.file.clone(),
                1,
                format!("critical UI route `{}` ({}) has no UI registry entry", i.route, i.scope),
                format!("Register one of: {}.", i.candidates.join(", ")),
            )
        })
        .collect();
    let mut status = match mode {
        CoverageMode::Fail => Status::Fail,
        _ => Status::Warn,
    };

    if let Some(min) = inputs.cfg.ui_min_coverage {
        if coverage < min {
            if violations.is_empty() {
                status = Status::Warn;
            }
            let first_unmapped = table
                .items
                .iter()
                .find(|i| i.mapped_keys.is_empty())
                .map(|i| i.file.clone())
                .unwrap_or_else(|| inputs.cfg.ui_root.clone());
            violations.push(Violation::new(
                RULE_UI_REGISTRY_COVERAGE,
                first_unmapped,
                1,
                format!("UI registry coverage {:.2} is below the minimum {min:.2}", coverage),
                "Register the unmapped routes listed in routing-table.json.",
            ));
        }
    }

    let result = RuleResult::from_violations(RULE_UI_REGISTRY_COVERAGE, title, status, violations);
    (with_evidence(result), table)
}
