use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::GovConfig;
use crate::report::{RuleResult, Status, Violation};

const REGISTRY_SCHEMA_BYTES: &[u8] = include_bytes!("../schemas/registry.schema.json");

pub const NAMESPACES: [&str; 3] = ["API", "SVC", "DB"];

pub const RULE_REGISTRY_VALID: &str = "0.4-registry-valid";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryModule {
    pub name: String,
    pub root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub version: String,
    pub modules: Vec<RegistryModule>,
    pub ids: BTreeMap<String, BTreeSet<String>>,
}

impl Registry {
    pub fn has_id(&self, namespace: &str, id: &str) -> bool {
        self.ids.get(namespace).is_some_and(|set| set.contains(id))
    }
}

/// A registry plus every problem found while loading it. Problems never abort
/// the pipeline; they fail the registry rule and evaluation continues.
#[derive(Debug, Clone)]
pub struct LoadedRegistry {
    pub path: String,
    pub registry: Registry,
    pub issues: Vec<String>,
}

/// Registry module resolved against the workspace, rebuilt on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub root: String,
    pub root_abs: PathBuf,
    pub service_id: Option<String>,
    pub has_contracts: bool,
    pub has_internal: bool,
}

impl Module {
    pub fn contains(&self, rel_path: &str) -> bool {
        rel_path == self.root || rel_path.starts_with(&format!("{}/", self.root))
    }
}

pub fn normalize_root(root: &str) -> String {
    let r = root.trim().replace('\\', "/");
    let r = r.trim_start_matches("./");
    r.trim_end_matches('/').to_string()
}

pub fn load(workspace_root: &Path, cfg: &GovConfig) -> LoadedRegistry {
    let path = workspace_root.join(&cfg.registry_path);
    let mut loaded = LoadedRegistry {
        path: cfg.registry_path.clone(),
        registry: Registry::default(),
        issues: Vec::new(),
    };

    let value: Value = match std::fs::read(&path)
        .with_context(|| format!("read registry: {}", path.display()))
        .and_then(|b| serde_json::from_slice(&b).context("parse registry JSON"))
    {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!("registry unavailable: {err:#}");
            loaded.issues.push(format!("{err:#}"));
            return loaded;
        }
    };

    match validate_schema(REGISTRY_SCHEMA_BYTES, "registry.schema.json", &value) {
        Ok(errors) => loaded.issues.extend(errors),
        Err(err) => loaded.issues.push(format!("{err:#}")),
    }

    loaded.registry = registry_from_value(&value);
    loaded.issues.extend(semantic_issues(&loaded.registry));
    loaded
}

/// Best-effort extraction; schema problems are reported separately.
fn registry_from_value(value: &Value) -> Registry {
    let version = match value.get("version") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };

    let modules = value
        .get("modules")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|m| serde_json::from_value::<RegistryModule>(m.clone()).ok())
                .map(|mut m| {
                    m.root = normalize_root(&m.root);
                    m
                })
                .collect()
        })
        .unwrap_or_default();

    let mut ids: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    if let Some(obj) = value.get("ids").and_then(Value::as_object) {
        for (ns, list) in obj {
            let set = list
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            ids.insert(ns.clone(), set);
        }
    }

    Registry {
        version,
        modules,
        ids,
    }
}

fn semantic_issues(registry: &Registry) -> Vec<String> {
    let mut issues = Vec::new();
    for ns in NAMESPACES {
        if !registry.ids.contains_key(ns) {
            issues.push(format!("registry does not declare the {ns} namespace"));
        }
    }

    let mut names = BTreeSet::new();
    for m in &registry.modules {
        if !names.insert(m.name.as_str()) {
            issues.push(format!("duplicate module name {:?}", m.name));
        }
    }

    for (i, a) in registry.modules.iter().enumerate() {
        for b in registry.modules.iter().skip(i + 1) {
            if a.root == b.root {
                issues.push(format!(
                    "modules {:?} and {:?} share root {:?}",
                    a.name, b.name, a.root
                ));
            } else if b.root.starts_with(&format!("{}/", a.root))
                || a.root.starts_with(&format!("{}/", b.root))
            {
                issues.push(format!(
                    "module roots overlap: {:?} ({}) and {:?} ({})",
                    a.name, a.root, b.name, b.root
                ));
            }
        }
    }
    issues
}

pub fn resolve_modules(workspace_root: &Path, registry: &Registry) -> Vec<Module> {
    registry
        .modules
        .iter()
        .map(|m| {
            let root_abs = workspace_root.join(&m.root);
            let service_id = m
                .service_id
                .clone()
                .or_else(|| manifest_service_id(&root_abs.join("module.json")))
                .or_else(|| manifest_service_id(&root_abs.join("contracts/contract.json")));
            Module {
                name: m.name.clone(),
                root: m.root.clone(),
                has_contracts: root_abs.join("contracts").is_dir(),
                has_internal: root_abs.join("internal").is_dir(),
                root_abs,
                service_id,
            }
        })
        .collect()
}

fn manifest_service_id(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let v: Value = serde_json::from_slice(&bytes).ok()?;
    v.get("serviceId")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

pub fn registry_rule(loaded: &LoadedRegistry) -> RuleResult {
    let violations = loaded
        .issues
        .iter()
        .map(|issue| {
            Violation::new(
                RULE_REGISTRY_VALID,
                loaded.path.clone(),
                1,
                issue.clone(),
                "Fix the registry so it declares API, SVC and DB ids and non-overlapping module roots.",
            )
        })
        .collect();
    RuleResult::from_violations(
        RULE_REGISTRY_VALID,
        "Registry is well-formed",
        Status::Fail,
        violations,
    )
    .with_evidence("modules", loaded.registry.modules.len() as u64)
    .with_evidence("version", loaded.registry.version.clone())
}

/// Validates `value` against an embedded Draft 2020-12 schema and returns one
/// message per error, prefixed with the instance path.
pub fn validate_schema(schema_bytes: &[u8], schema_name: &str, value: &Value) -> Result<Vec<String>> {
    let schema_json: Value =
        serde_json::from_slice(schema_bytes).with_context(|| format!("parse {schema_name}"))?;
    let validator = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema_json)
        .with_context(|| format!("build {schema_name} validator"))?;

    let mut out = Vec::new();
    for error in validator.iter_errors(value) {
        let ptr = error.instance_path().to_string();
        let at = if ptr.is_empty() { "/".to_string() } else { ptr };
        out.push(format!("{schema_name} {at}: {error}"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, text: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, text).unwrap();
    }

    #[test]
    fn valid_registry_has_no_issues() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            ".governance/registry.json",
            r#"{"version":"1","modules":[{"name":"billing","root":"modules/billing/","serviceId":"SVC.billing"}],
               "ids":{"API":[],"SVC":["SVC.billing"],"DB":[]}}"#,
        );
        let loaded = load(tmp.path(), &GovConfig::default());
        assert!(loaded.issues.is_empty(), "{:?}", loaded.issues);
        assert_eq!(loaded.registry.modules[0].root, "modules/billing");
        assert!(loaded.registry.has_id("SVC", "SVC.billing"));
        assert_eq!(registry_rule(&loaded).status, Status::Pass);
    }

    #[test]
    fn missing_namespace_and_overlap_degrade_without_aborting() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            ".governance/registry.json",
            r#"{"version":1,"modules":[{"name":"a","root":"m"},{"name":"b","root":"m/b"}],
               "ids":{"API":[],"SVC":[]}}"#,
        );
        let loaded = load(tmp.path(), &GovConfig::default());
        assert_eq!(loaded.registry.modules.len(), 2);
        assert!(loaded.issues.iter().any(|i| i.contains("DB namespace")));
        assert!(loaded.issues.iter().any(|i| i.contains("overlap")));
        let rule = registry_rule(&loaded);
        assert_eq!(rule.status, Status::Fail);
        assert_eq!(rule.violations.len(), 2);
    }

    #[test]
    fn missing_registry_file_is_a_rule_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = load(tmp.path(), &GovConfig::default());
        assert!(loaded.registry.modules.is_empty());
        assert_eq!(registry_rule(&loaded).status, Status::Fail);
    }

    #[test]
    fn module_service_id_falls_back_to_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "m/a/module.json", r#"{"serviceId":"SVC.a"}"#);
        std::fs::create_dir_all(tmp.path().join("m/a/internal")).unwrap();
        let registry = Registry {
            modules: vec![RegistryModule {
                name: "a".into(),
                root: "m/a".into(),
                service_id: None,
            }],
            ..Registry::default()
        };
        let modules = resolve_modules(tmp.path(), &registry);
        assert_eq!(modules[0].service_id.as_deref(), Some("SVC.a"));
        assert!(modules[0].has_internal);
        assert!(!modules[0].has_contracts);
        assert!(modules[0].contains("m/a/internal/x.ts"));
        assert!(!modules[0].contains("m/ab/x.ts"));
    }
}
