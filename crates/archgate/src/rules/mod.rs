//! The fixed rule battery.
//!
//! Rule ids carry their phase number as a prefix (`1.` structural, `2.` data
//! admission, `3.` contract and boundary, `4.` UI registry coverage); `0.`
//! rules are operational and do not roll up into a phase. Rules share inputs
//! but no mutable state: each returns its own `RuleResult`.

use std::collections::BTreeSet;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::GovConfig;
use crate::crawl::{DependencyGraph, SourceFile};
use crate::registry::{Module, Registry};
use crate::report::RuleResult;

pub mod contracts;
pub mod data_admission;
pub mod payload;
pub mod structural;
pub mod ui_coverage;

pub struct Inputs<'a> {
    pub root: &'a Path,
    pub cfg: &'a GovConfig,
    pub registry: &'a Registry,
    pub modules: &'a [Module],
    /// Every source file of the workspace.
    pub files: &'a [SourceFile],
    pub ui_registry_keys: &'a BTreeSet<String>,
}

pub struct Evaluation {
    pub results: Vec<RuleResult>,
    pub routing_table: ui_coverage::RoutingTable,
}

pub fn evaluate(inputs: &Inputs<'_>, graph: &mut DependencyGraph) -> Evaluation {
    let mut results = Vec::new();
    results.extend(structural::evaluate(inputs, graph));
    results.extend(data_admission::evaluate(inputs));
    results.extend(contracts::evaluate(inputs));
    let (coverage, routing_table) = ui_coverage::evaluate(inputs);
    results.push(coverage);
    results.push(payload::validate(&results));

    tracing::info!(rules = results.len(), "rule battery evaluated");
    Evaluation {
        results,
        routing_table,
    }
}

pub(crate) fn compile_globset(globs: &[String]) -> GlobSet {
    let mut b = GlobSetBuilder::new();
    for g in globs {
        match Glob::new(g) {
            Ok(glob) => {
                b.add(glob);
            }
            Err(err) => tracing::warn!(glob = %g, "ignoring invalid glob: {err}"),
        }
    }
    b.build().unwrap_or_else(|err| {
        tracing::warn!("glob set failed to build: {err}");
        GlobSet::empty()
    })
}

pub(crate) fn files_matching<'a>(files: &'a [SourceFile], set: &GlobSet) -> Vec<&'a SourceFile> {
    files.iter().filter(|f| set.is_match(&f.rel)).collect()
}

pub(crate) fn files_under<'a>(files: &'a [SourceFile], dir_rel: &str) -> Vec<&'a SourceFile> {
    let prefix = format!("{}/", dir_rel.trim_end_matches('/'));
    files.iter().filter(|f| f.rel.starts_with(&prefix)).collect()
}

/// 1-based line of the first line containing `needle`, or 1.
pub(crate) fn line_containing(text: &str, needle: &str) -> usize {
    text.lines()
        .position(|l| l.contains(needle))
        .map(|i| i + 1)
        .unwrap_or(1)
}
