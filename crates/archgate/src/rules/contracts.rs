use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use walkdir::WalkDir;

use crate::config::GovConfig;
use crate::crawl::{self, SourceFile};
use crate::registry::{self, Module};
use crate::report::{RuleResult, Status, Violation};
use crate::util;

use super::{compile_globset, files_matching, files_under, Inputs};

pub const RULE_SERVICE_ID: &str = "3.1-service-id";
pub const RULE_VERSIONED_CONTRACT: &str = "3.2-versioned-contract";
pub const RULE_CONTRACT_SPEC: &str = "3.3-contract-spec";
pub const RULE_UI_THROUGH_BFF: &str = "3.4-ui-through-bff";
pub const RULE_GHOST_ROUTES: &str = "3.5-ghost-routes";
pub const RULE_LLID_TRACEABILITY: &str = "3.6-llid-traceability";

const CONTRACT_SCHEMA_BYTES: &[u8] = include_bytes!("../../schemas/contract.schema.json");

static SEMVER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("semver regex"));
static TYPED_EXPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bexport\s+(?:type|interface|const|enum|class|function)\b").expect("export regex")
});

const SPEC_FILE_NAMES: [&str; 6] = [
    "openapi.json",
    "openapi.yaml",
    "openapi.yml",
    "swagger.json",
    "swagger.yaml",
    "swagger.yml",
];

pub fn evaluate(inputs: &Inputs<'_>) -> Vec<RuleResult> {
    vec![
        service_id(inputs),
        versioned_contract(inputs),
        contract_spec(inputs),
        ui_through_bff(inputs),
        ghost_routes(inputs),
        llid_traceability(inputs),
    ]
}

fn present_modules<'a>(inputs: &'a Inputs<'_>) -> impl Iterator<Item = &'a Module> {
    inputs.modules.iter().filter(|m| m.root_abs.is_dir())
}

fn service_id(inputs: &Inputs<'_>) -> RuleResult {
    let mut violations = Vec::new();
    for m in present_modules(inputs) {
        let file = format!("{}/module.json", m.root);
        match m.service_id.as_deref() {
            None => violations.push(Violation::new(
                RULE_SERVICE_ID,
                file,
                1,
                format!("module `{}` declares no service id", m.name),
                "Set serviceId in the registry entry or the module manifest.",
            )),
            Some(id) if !inputs.registry.has_id("SVC", id) => violations.push(Violation::new(
                RULE_SERVICE_ID,
                file,
                1,
                format!("module `{}` service id `{id}` is not registered under SVC", m.name),
                format!("Add `{id}` to ids.SVC in the registry."),
            )),
            Some(_) => {}
        }
    }
    RuleResult::from_violations(
        RULE_SERVICE_ID,
        "Modules declare a registered service id",
        Status::Fail,
        violations,
    )
}

fn versioned_contract(inputs: &Inputs<'_>) -> RuleResult {
    let mut violations = Vec::new();
    for m in present_modules(inputs) {
        let rel = format!("{}/contracts/contract.json", m.root);
        let violation = |message: String, hint: &str| {
            Violation::new(RULE_VERSIONED_CONTRACT, rel.clone(), 1, message, hint)
        };

        let bytes = match std::fs::read(inputs.root.join(&rel)) {
            Ok(b) => b,
            Err(err) => {
                violations.push(violation(
                    format!("module `{}` publishes no contract file ({err})", m.name),
                    "Add contracts/contract.json with name, version, serviceId and compatibility.",
                ));
                continue;
            }
        };
        let value: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(err) => {
                violations.push(violation(
                    format!("contract file is not valid JSON: {err}"),
                    "Fix the JSON syntax of the contract file.",
                ));
                continue;
            }
        };

        match registry::validate_schema(CONTRACT_SCHEMA_BYTES, "contract.schema.json", &value) {
            Ok(errors) => violations.extend(
                errors
                    .into_iter()
                    .map(|e| violation(e, "Supply every required contract field.")),
            ),
            Err(err) => violations.push(violation(format!("{err:#}"), "Check the contract schema.")),
        }

        if let Some(version) = value.get("version").and_then(Value::as_str) {
            if !SEMVER_RE.is_match(version) {
                violations.push(violation(
                    format!("contract version `{version}` is not MAJOR.MINOR.PATCH"),
                    "Use a semantic version such as 1.0.0.",
                ));
            }
        }
        if let Some(tag) = value.get("compatibility").and_then(Value::as_str) {
            if !inputs.cfg.compatibility_tags.iter().any(|t| t == tag) {
                violations.push(violation(
                    format!("compatibility `{tag}` is not one of {}", inputs.cfg.compatibility_tags.join(", ")),
                    "Pick an allowed compatibility tag.",
                ));
            }
        }
    }
    RuleResult::from_violations(
        RULE_VERSIONED_CONTRACT,
        "Modules publish a versioned contract",
        Status::Fail,
        violations,
    )
}

fn find_spec_files(root: &Path, cfg: &GovConfig) -> Vec<std::path::PathBuf> {
    let mut out: Vec<_> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !cfg
                    .exclude_dirs
                    .iter()
                    .any(|d| e.file_name().to_string_lossy() == d.as_str())
        })
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            SPEC_FILE_NAMES.contains(&&*name)
        })
        .map(|e| e.into_path())
        .collect();
    out.sort();
    out
}

fn parses_as_openapi(path: &Path) -> Result<(), String> {
    let text = std::fs::read_to_string(path).map_err(|err| format!("unreadable: {err}"))?;
    let is_json = path.extension().is_some_and(|e| e == "json");
    let value: Value = if is_json {
        serde_json::from_str(&text).map_err(|err| format!("invalid JSON: {err}"))?
    } else {
        serde_yaml::from_str(&text).map_err(|err| format!("invalid YAML: {err}"))?
    };
    if value.get("openapi").is_some() || value.get("swagger").is_some() {
        Ok(())
    } else {
        Err("no `openapi` or `swagger` key".to_string())
    }
}

fn is_typed_schema_module(file: &SourceFile) -> bool {
    let name = file.rel.rsplit('/').next().unwrap_or("");
    let named = name == "schema.ts"
        || name.ends_with(".schema.ts")
        || name.ends_with(".schema.js");
    named && crawl::read_text(file).is_some_and(|t| TYPED_EXPORT_RE.is_match(&t))
}

fn contract_spec(inputs: &Inputs<'_>) -> RuleResult {
    let mut violations = Vec::new();
    for m in present_modules(inputs) {
        let mut problems = Vec::new();
        let mut ok = false;
        for path in find_spec_files(&m.root_abs, inputs.cfg) {
            match parses_as_openapi(&path) {
                Ok(()) => {
                    ok = true;
                    break;
                }
                Err(why) => problems.push(format!("{}: {why}", util::rel_posix(inputs.root, &path))),
            }
        }
        if !ok {
            ok = files_under(inputs.files, &m.root)
                .into_iter()
                .any(is_typed_schema_module);
        }
        if ok {
            continue;
        }
        let detail = if problems.is_empty() {
            String::new()
        } else {
            format!(" ({})", problems.join("; "))
        };
        violations.push(Violation::new(
            RULE_CONTRACT_SPEC,
            format!("{}/contracts", m.root),
            1,
            format!("module `{}` has no parseable OpenAPI/Swagger spec or typed schema module{detail}", m.name),
            "Add contracts/openapi.yaml or a *.schema.ts module exporting its types.",
        ));
    }
    RuleResult::from_violations(
        RULE_CONTRACT_SPEC,
        "Modules expose a contract spec",
        Status::Fail,
        violations,
    )
}

fn under(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    !dir.is_empty() && (path == dir || path.starts_with(&format!("{dir}/")))
}

fn ui_through_bff(inputs: &Inputs<'_>) -> RuleResult {
    let cfg = inputs.cfg;
    let audiences = [
        ("dealer", &cfg.dealer_ui_root, &cfg.admin_bff_root),
        ("admin", &cfg.admin_ui_root, &cfg.dealer_bff_root),
    ];
    let mut violations = Vec::new();
    for (audience, ui_root, foreign_bff) in audiences {
        for file in files_under(inputs.files, ui_root) {
            let Some(text) = crawl::read_text(file) else {
                continue;
            };
            for imp in crawl::extract_imports(&text) {
                let target = crawl::import_target(&imp.spec, &file.rel);
                let lower = target.to_ascii_lowercase();
                if let Some(p) = cfg
                    .persistence_patterns
                    .iter()
                    .find(|p| lower.contains(&p.to_ascii_lowercase()))
                {
                    violations.push(Violation::new(
                        RULE_UI_THROUGH_BFF,
                        file.rel.clone(),
                        imp.line,
                        format!("{audience} UI imports persistence code `{}` (matches `{p}`)", imp.spec),
                        "Fetch the data through the audience's BFF handlers instead.",
                    ));
                } else if under(&target, foreign_bff) {
                    violations.push(Violation::new(
                        RULE_UI_THROUGH_BFF,
                        file.rel.clone(),
                        imp.line,
                        format!("{audience} UI reaches the other audience's BFF via `{}`", imp.spec),
                        format!("Only import from the {audience} BFF."),
                    ));
                }
            }
        }
    }
    RuleResult::from_violations(
        RULE_UI_THROUGH_BFF,
        "UI reaches data only through its BFF",
        Status::Fail,
        violations,
    )
}

fn api_id_regex(cfg: &GovConfig) -> Regex {
    Regex::new(&cfg.api_id_pattern).unwrap_or_else(|err| {
        tracing::warn!(pattern = %cfg.api_id_pattern, "invalid api_id_pattern, using default: {err}");
        Regex::new(&GovConfig::default().api_id_pattern).expect("default api id pattern")
    })
}

fn ghost_routes(inputs: &Inputs<'_>) -> RuleResult {
    let set = compile_globset(&inputs.cfg.route_handler_globs);
    let re = api_id_regex(inputs.cfg);
    let handlers = files_matching(inputs.files, &set);

    let mut violations = Vec::new();
    for file in &handlers {
        let Some(text) = crawl::read_text(file) else {
            continue;
        };
        let ids: Vec<(usize, String)> = re
            .captures_iter(&text)
            .filter_map(|cap| {
                let m = cap.get(1)?;
                Some((util::line_of_offset(&text, m.start()), m.as_str().to_string()))
            })
            .collect();
        if ids.is_empty() {
            violations.push(Violation::new(
                RULE_GHOST_ROUTES,
                file.rel.clone(),
                1,
                "ghost route: handler declares no API identifier",
                "Declare `@api <API id>` on the handler and register the id under ids.API.",
            ));
            continue;
        }
        for (line, id) in ids {
            if !inputs.registry.has_id("API", &id) {
                violations.push(Violation::new(
                    RULE_GHOST_ROUTES,
                    file.rel.clone(),
                    line,
                    format!("ghost route: API id `{id}` is not registered"),
                    format!("Add `{id}` to ids.API in the registry or correct the id."),
                ));
            }
        }
    }
    RuleResult::from_violations(
        RULE_GHOST_ROUTES,
        "Route handlers declare registered API ids",
        Status::Fail,
        violations,
    )
    .with_evidence("handlers", handlers.len() as u64)
}

fn llid_traceability(inputs: &Inputs<'_>) -> RuleResult {
    let cfg = inputs.cfg;
    let contract_set = compile_globset(&cfg.dealer_contract_globs);
    let mut violations = Vec::new();

    for file in files_matching(inputs.files, &contract_set) {
        let Some(text) = crawl::read_text(file) else {
            continue;
        };
        if !text.contains(&cfg.llid_field) {
            violations.push(Violation::new(
                RULE_LLID_TRACEABILITY,
                file.rel.clone(),
                1,
                format!("dealer contract lacks the `{}` traceability field", cfg.llid_field),
                format!("Add a `{}` field to the contract/DTO.", cfg.llid_field),
            ));
        }
    }

    for file in files_under(inputs.files, &cfg.dealer_ui_root) {
        let Some(text) = crawl::read_text(file) else {
            continue;
        };
        let data_import = crawl::extract_imports(&text).into_iter().find(|imp| {
            let target = crawl::import_target(&imp.spec, &file.rel);
            under(&target, &cfg.dealer_bff_root)
                || contract_set.is_match(&target)
                || target.split('/').any(|seg| seg == "dto" || seg == "contracts")
        });
        let Some(imp) = data_import else {
            continue;
        };
        if !text.contains(&cfg.llid_display_marker) {
            violations.push(Violation::new(
                RULE_LLID_TRACEABILITY,
                file.rel.clone(),
                imp.line,
                format!(
                    "dealer page renders dealer data from `{}` without `{}`",
                    imp.spec, cfg.llid_display_marker
                ),
                format!("Render the record's {} with a `{}` attribute.", cfg.llid_field, cfg.llid_display_marker),
            ));
        }
    }

    RuleResult::from_violations(
        RULE_LLID_TRACEABILITY,
        "Dealer data carries LLID traceability",
        Status::Fail,
        violations,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::fixture::Fixture;

    fn get<'a>(results: &'a [RuleResult], id: &str) -> &'a RuleResult {
        results.iter().find(|r| r.rule_id == id).expect("rule present")
    }

    fn run(fx: &mut Fixture) -> Vec<RuleResult> {
        fx.refresh();
        evaluate(&fx.inputs())
    }

    fn healthy_module(fx: &mut Fixture) {
        fx.module("billing", "modules/billing", Some("SVC.billing"));
        fx.ids("SVC", &["SVC.billing"]);
        fx.write(
            "modules/billing/contracts/contract.json",
            r#"{"name":"billing","version":"1.2.0","serviceId":"SVC.billing","compatibility":"backward"}"#,
        );
        fx.write(
            "modules/billing/contracts/openapi.yaml",
            "openapi: 3.0.0\ninfo:\n  title: billing\n  version: 1.2.0\npaths: {}\n",
        );
    }

    #[test]
    fn healthy_module_passes_contract_rules() {
        let mut fx = Fixture::new();
        healthy_module(&mut fx);
        let results = run(&mut fx);
        for id in [RULE_SERVICE_ID, RULE_VERSIONED_CONTRACT, RULE_CONTRACT_SPEC] {
            assert_eq!(get(&results, id).status, Status::Pass, "{id}: {:?}", get(&results, id));
        }
    }

    #[test]
    fn unregistered_service_and_bad_contract_fail() {
        let mut fx = Fixture::new();
        fx.module("orders", "modules/orders", Some("SVC.orders"));
        fx.write(
            "modules/orders/contracts/contract.json",
            r#"{"name":"orders","version":"v1","compatibility":"sideways"}"#,
        );
        let results = run(&mut fx);

        assert!(get(&results, RULE_SERVICE_ID).violations[0]
            .message
            .contains("not registered"));

        let msgs: Vec<&str> = get(&results, RULE_VERSIONED_CONTRACT)
            .violations
            .iter()
            .map(|v| v.message.as_str())
            .collect();
        assert!(msgs.iter().any(|m| m.contains("serviceId")), "{msgs:?}");
        assert!(msgs.iter().any(|m| m.contains("MAJOR.MINOR.PATCH")));
        assert!(msgs.iter().any(|m| m.contains("sideways")));

        assert_eq!(get(&results, RULE_CONTRACT_SPEC).status, Status::Fail);
    }

    #[test]
    fn typed_schema_module_satisfies_contract_spec() {
        let mut fx = Fixture::new();
        fx.module("orders", "modules/orders", None);
        fx.write(
            "modules/orders/contracts/order.schema.ts",
            "export interface Order { id: string }\n",
        );
        let results = run(&mut fx);
        assert_eq!(get(&results, RULE_CONTRACT_SPEC).status, Status::Pass);
    }

    #[test]
    fn ui_importing_persistence_or_foreign_bff_fails() {
        let mut fx = Fixture::new();
        fx.write(
            "apps/dealer/pages/list.tsx",
            "import { repo } from '../../../modules/orders/repository/orders';\n\
             import { x } from '../../../bff/admin/routes/x';\n\
             import { ok } from '../../../bff/dealer/client';\n",
        );
        let results = run(&mut fx);
        let r = get(&results, RULE_UI_THROUGH_BFF);
        assert_eq!(r.violations.len(), 2);
        assert_eq!(r.violations[0].line, 1);
        assert!(r.violations[0].message.contains("persistence"));
        assert_eq!(r.violations[1].line, 2);
    }

    #[test]
    fn ghost_routes_need_registered_api_ids() {
        let mut fx = Fixture::new();
        fx.ids("API", &["API.orders.list"]);
        fx.write("bff/dealer/routes/orders.ts", "// @api API.orders.list\nexport default h;\n");
        fx.write("bff/dealer/routes/ghost.ts", "export default h;\n");
        fx.write("bff/admin/routes/stale.ts", "export const apiId = 'API.gone';\n");
        let results = run(&mut fx);
        let r = get(&results, RULE_GHOST_ROUTES);
        assert_eq!(r.violations.len(), 2);
        assert!(r.violations.iter().any(|v| v.file == "bff/dealer/routes/ghost.ts"));
        assert!(r.violations.iter().any(|v| v.message.contains("API.gone")));
        assert_eq!(r.evidence["handlers"], 3);
    }

    #[test]
    fn llid_field_and_display_marker_are_required() {
        let mut fx = Fixture::new();
        fx.write("shared/dto/dealerOrder.ts", "export interface DealerOrder { id: string }\n");
        fx.write(
            "apps/dealer/pages/order.tsx",
            "import { DealerOrder } from '../../../shared/dto/dealerOrder';\nexport default () => null;\n",
        );
        fx.write(
            "apps/dealer/pages/ok.tsx",
            "import { DealerOrder } from '../../../shared/dto/dealerOrder';\n<td data-llid={o.llid} />\n",
        );
        let results = run(&mut fx);
        let r = get(&results, RULE_LLID_TRACEABILITY);
        let files: Vec<&str> = r.violations.iter().map(|v| v.file.as_str()).collect();
        assert_eq!(files, vec!["shared/dto/dealerOrder.ts", "apps/dealer/pages/order.tsx"]);
    }
}
