use crate::crawl::{DependencyGraph, Edge};
use crate::registry::Module;
use crate::report::{RuleResult, Status, Violation};

use super::Inputs;

pub const RULE_MODULE_LAYOUT: &str = "1.1-module-layout";
pub const RULE_KERNEL_BOOT: &str = "1.2-kernel-boot";
pub const RULE_MODULE_SUBTREES: &str = "1.3-module-subtrees";
pub const RULE_BOUNDARY_INTERNAL: &str = "1.4-boundary-internal";
pub const RULE_BOUNDARY_CONTRACTS: &str = "1.5-boundary-contracts-only";
pub const RULE_BOUNDARY_ROLLUP: &str = "1.6-boundary-rollup";

pub fn evaluate(inputs: &Inputs<'_>, graph: &mut DependencyGraph) -> Vec<RuleResult> {
    let (internal, contracts_only) = boundary_rules(inputs.modules, graph);
    let rollup = boundary_rollup(&internal, &contracts_only);
    vec![
        module_layout(inputs),
        kernel_boot(inputs),
        module_subtrees(inputs),
        internal,
        contracts_only,
        rollup,
    ]
}

fn module_layout(inputs: &Inputs<'_>) -> RuleResult {
    let violations = inputs
        .modules
        .iter()
        .filter(|m| !m.root_abs.is_dir())
        .map(|m| {
            Violation::new(
                RULE_MODULE_LAYOUT,
                m.root.clone(),
                1,
                format!("module `{}` root `{}` does not exist", m.name, m.root),
                "Create the module root or fix its path in the registry.",
            )
        })
        .collect();
    RuleResult::from_violations(
        RULE_MODULE_LAYOUT,
        "Module roots exist",
        Status::Fail,
        violations,
    )
    .with_evidence("modules", inputs.modules.len() as u64)
}

fn kernel_boot(inputs: &Inputs<'_>) -> RuleResult {
    let cfg = inputs.cfg;
    let found = cfg
        .kernel_entries
        .iter()
        .find(|rel| inputs.root.join(rel).is_file());

    let violation = match found {
        None => Some(Violation::new(
            RULE_KERNEL_BOOT,
            cfg.kernel_entries
                .first()
                .cloned()
                .unwrap_or_else(|| "kernel/index.ts".to_string()),
            1,
            format!(
                "no kernel entry found (looked for {})",
                cfg.kernel_entries.join(", ")
            ),
            "Add a kernel/bootstrap entry that calls the boot marker.",
        )),
        Some(rel) => match std::fs::read_to_string(inputs.root.join(rel)) {
            Ok(text) if text.contains(&cfg.boot_marker) => None,
            Ok(_) => Some(Violation::new(
                RULE_KERNEL_BOOT,
                rel.clone(),
                1,
                format!("kernel entry does not contain boot marker `{}`", cfg.boot_marker),
                format!("Call `{}` from the kernel entry.", cfg.boot_marker),
            )),
            Err(err) => {
                tracing::warn!(file = %rel, "kernel entry unreadable: {err}");
                Some(Violation::new(
                    RULE_KERNEL_BOOT,
                    rel.clone(),
                    1,
                    format!("kernel entry unreadable: {err}"),
                    "Make the kernel entry readable.",
                ))
            }
        },
    };

    let mut r = RuleResult::from_violations(
        RULE_KERNEL_BOOT,
        "Kernel entry boots",
        Status::Fail,
        violation.into_iter().collect(),
    );
    if let Some(rel) = found {
        r = r.with_evidence("entry", rel.clone());
    }
    r
}

fn module_subtrees(inputs: &Inputs<'_>) -> RuleResult {
    let mut violations = Vec::new();
    for m in inputs.modules.iter().filter(|m| m.root_abs.is_dir()) {
        for (present, sub) in [(m.has_contracts, "contracts"), (m.has_internal, "internal")] {
            if !present {
                violations.push(Violation::new(
                    RULE_MODULE_SUBTREES,
                    format!("{}/{sub}", m.root),
                    1,
                    format!("module `{}` has no `{sub}/` subtree", m.name),
                    format!("Create `{}/{sub}/`.", m.root),
                ));
            }
        }
    }
    RuleResult::from_violations(
        RULE_MODULE_SUBTREES,
        "Modules expose contracts/ and internal/",
        Status::Fail,
        violations,
    )
}

fn has_segment(path: &str, seg: &str) -> bool {
    path.split('/').any(|p| p == seg)
}

fn under(path: &str, dir: &str) -> bool {
    path == dir || path.starts_with(&format!("{dir}/"))
}

/// An edge reaches internals when the raw import names an `internal` segment
/// or resolves under the target module's `internal/` tree.
pub fn edge_touches_internal(edge: &Edge, target: &Module) -> bool {
    has_segment(&edge.import_path, "internal")
        || under(&edge.resolved_path, &format!("{}/internal", target.root))
}

fn edge_uses_contracts(edge: &Edge, target: &Module) -> bool {
    has_segment(&edge.import_path, "contracts")
        || under(&edge.resolved_path, &format!("{}/contracts", target.root))
}

fn boundary_rules(modules: &[Module], graph: &mut DependencyGraph) -> (RuleResult, RuleResult) {
    let mut internal = Vec::new();
    let mut contracts_only = Vec::new();

    for edge in graph.edges.iter_mut() {
        let Some(target) = modules.iter().find(|m| m.name == edge.to_module) else {
            continue;
        };
        if edge_touches_internal(edge, target) {
            edge.violates = true;
            edge.rule_id = Some(RULE_BOUNDARY_INTERNAL.to_string());
            internal.push(Violation::new(
                RULE_BOUNDARY_INTERNAL,
                edge.source_file.clone(),
                edge.line,
                format!(
                    "module `{}` imports `{}` internals via `{}`",
                    edge.from_module, edge.to_module, edge.import_path
                ),
                format!(
                    "Import from `{}/contracts/` instead of its internal/ tree.",
                    target.root
                ),
            ));
        } else if !edge_uses_contracts(edge, target) {
            edge.violates = true;
            edge.rule_id = Some(RULE_BOUNDARY_CONTRACTS.to_string());
            contracts_only.push(Violation::new(
                RULE_BOUNDARY_CONTRACTS,
                edge.source_file.clone(),
                edge.line,
                format!(
                    "module `{}` imports `{}` outside its contracts/ via `{}`",
                    edge.from_module, edge.to_module, edge.import_path
                ),
                format!("Route the import through `{}/contracts/`.", target.root),
            ));
        }
    }

    let edges = graph.edges.len() as u64;
    (
        RuleResult::from_violations(
            RULE_BOUNDARY_INTERNAL,
            "No cross-module imports of internal/",
            Status::Fail,
            internal,
        )
        .with_evidence("edges", edges),
        RuleResult::from_violations(
            RULE_BOUNDARY_CONTRACTS,
            "Cross-module imports go through contracts/",
            Status::Fail,
            contracts_only,
        )
        .with_evidence("edges", edges),
    )
}

/// Derived only from the specific boundary rules; no detection of its own.
fn boundary_rollup(internal: &RuleResult, contracts_only: &RuleResult) -> RuleResult {
    let violations = internal
        .violations
        .iter()
        .chain(contracts_only.violations.iter())
        .map(|v| Violation {
            rule_id: RULE_BOUNDARY_ROLLUP.to_string(),
            message: format!("[{}] {}", v.rule_id, v.message),
            ..v.clone()
        })
        .collect();
    RuleResult::from_violations(
        RULE_BOUNDARY_ROLLUP,
        "Module boundaries hold",
        Status::Fail,
        violations,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl;
    use crate::rules::fixture::Fixture;

    fn two_modules(import_line: &str) -> (Fixture, DependencyGraph) {
        let mut fx = Fixture::new();
        fx.module("billing", "modules/billing", None);
        fx.module("orders", "modules/orders", None);
        fx.write("modules/billing/contracts/api.ts", "export type Api = {};\n");
        fx.write("modules/billing/internal/ledger.ts", "export const L = 1;\n");
        fx.write("modules/orders/contracts/api.ts", "export type Api = {};\n");
        fx.write("modules/orders/internal/a.ts", &format!("{import_line}\n"));
        fx.refresh();
        let graph = crawl::crawl(fx.tmp.path(), &fx.modules, &fx.cfg);
        (fx, graph)
    }

    fn result<'a>(results: &'a [RuleResult], id: &str) -> &'a RuleResult {
        results.iter().find(|r| r.rule_id == id).expect("rule present")
    }

    #[test]
    fn internal_import_fails_and_names_both_modules() {
        let (fx, mut graph) =
            two_modules("import { L } from '../../billing/internal/ledger';");
        let results = evaluate(&fx.inputs(), &mut graph);

        let internal = result(&results, RULE_BOUNDARY_INTERNAL);
        assert_eq!(internal.status, Status::Fail);
        let v = &internal.violations[0];
        assert!(v.message.contains("`orders`") && v.message.contains("`billing`"));
        assert!(v.message.contains("../../billing/internal/ledger"));
        assert_eq!(v.file, "modules/orders/internal/a.ts");
        assert_eq!(v.line, 1);

        let rollup = result(&results, RULE_BOUNDARY_ROLLUP);
        assert_eq!(rollup.status, Status::Fail);
        assert_eq!(rollup.violations.len(), 1);
        assert!(graph.edges[0].violates);
    }

    #[test]
    fn internal_segment_fails_even_with_contracts_in_path() {
        let (fx, mut graph) =
            two_modules("import { L } from '../../billing/contracts/../internal/ledger';");
        let results = evaluate(&fx.inputs(), &mut graph);
        assert_eq!(result(&results, RULE_BOUNDARY_INTERNAL).status, Status::Fail);

        let (fx, mut graph) = two_modules("import { L } from 'billing/internal/contracts/x';");
        let results = evaluate(&fx.inputs(), &mut graph);
        assert_eq!(result(&results, RULE_BOUNDARY_INTERNAL).status, Status::Fail);
        assert_eq!(result(&results, RULE_BOUNDARY_CONTRACTS).status, Status::Pass);
    }

    #[test]
    fn contracts_import_passes_and_other_paths_fail_contracts_rule() {
        let (fx, mut graph) = two_modules("import { Api } from '../../billing/contracts/api';");
        let results = evaluate(&fx.inputs(), &mut graph);
        assert_eq!(result(&results, RULE_BOUNDARY_INTERNAL).status, Status::Pass);
        assert_eq!(result(&results, RULE_BOUNDARY_CONTRACTS).status, Status::Pass);
        assert_eq!(result(&results, RULE_BOUNDARY_ROLLUP).status, Status::Pass);

        let (fx, mut graph) = two_modules("import { x } from 'billing/src/x';");
        let results = evaluate(&fx.inputs(), &mut graph);
        assert_eq!(result(&results, RULE_BOUNDARY_CONTRACTS).status, Status::Fail);
        assert_eq!(result(&results, RULE_BOUNDARY_ROLLUP).status, Status::Fail);
    }

    #[test]
    fn layout_subtrees_and_kernel() {
        let mut fx = Fixture::new();
        fx.module("ghost", "modules/ghost", None);
        fx.module("bare", "modules/bare", None);
        fx.write("modules/bare/index.ts", "export {};\n");
        fx.write("kernel/index.ts", "start();\n");
        fx.refresh();
        let mut graph = DependencyGraph::default();
        let results = evaluate(&fx.inputs(), &mut graph);

        let layout = result(&results, RULE_MODULE_LAYOUT);
        assert_eq!(layout.violations.len(), 1);
        assert_eq!(layout.violations[0].file, "modules/ghost");

        let subtrees = result(&results, RULE_MODULE_SUBTREES);
        assert_eq!(subtrees.violations.len(), 2);

        let kernel = result(&results, RULE_KERNEL_BOOT);
        assert_eq!(kernel.status, Status::Fail);
        assert!(kernel.violations[0].message.contains("boot marker"));

        fx.write("kernel/index.ts", "bootKernel();\n");
        let results = evaluate(&fx.inputs(), &mut graph);
        assert_eq!(result(&results, RULE_KERNEL_BOOT).status, Status::Pass);
    }
}
