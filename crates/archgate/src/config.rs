use anyhow::{Context, Result};
use serde::Deserialize;

use crate::gate::VerifyPolicy;
use crate::report::{RuleResult, Status, Violation};
use crate::store::StateDir;

pub const RULE_CONFIG_VALID: &str = "0.5-config-valid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageMode {
    Off,
    Warn,
    Fail,
}

/// Gating policy and scan tuning read from `.governance/config.yml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GovConfig {
    pub fail_on_red: Option<bool>,
    pub allow_amber: Option<bool>,
    pub max_red: Option<u64>,
    pub max_amber: Option<u64>,

    pub registry_path: String,
    pub source_extensions: Vec<String>,
    pub exclude_dirs: Vec<String>,

    pub kernel_entries: Vec<String>,
    pub boot_marker: String,

    pub ingest_globs: Vec<String>,
    pub ingest_inbound: String,
    pub ingest_locked: String,
    pub atomic_writer_globs: Vec<String>,
    pub audit_log_name: String,
    pub audit_markers: Vec<String>,
    pub audit_window_tokens: usize,
    pub mutation_patterns: Vec<String>,

    pub compatibility_tags: Vec<String>,
    pub dealer_ui_root: String,
    pub admin_ui_root: String,
    pub dealer_bff_root: String,
    pub admin_bff_root: String,
    pub persistence_patterns: Vec<String>,
    pub route_handler_globs: Vec<String>,
    pub api_id_pattern: String,
    pub llid_field: String,
    pub llid_display_marker: String,
    pub dealer_contract_globs: Vec<String>,

    pub ui_root: String,
    pub ui_critical_patterns: Vec<String>,
    pub ui_coverage_mode: CoverageMode,
    pub ui_min_coverage: Option<f64>,

    pub fix_protected_paths: Vec<String>,
    pub semantic_lock_marker: String,

    pub history_max_snapshots: usize,
    pub history_max_age_days: u64,
    pub watch_debounce_ms: u64,
    pub watch_poll_ms: u64,

    pub signing_key_file: Option<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for GovConfig {
    fn default() -> Self {
        Self {
            fail_on_red: None,
            allow_amber: None,
            max_red: None,
            max_amber: None,

            registry_path: ".governance/registry.json".to_string(),
            source_extensions: strings(&["ts", "tsx", "js", "jsx", "mjs", "cjs", "vue", "svelte"]),
            exclude_dirs: strings(&["node_modules", ".git", "dist", "build", "target", ".next"]),

            kernel_entries: strings(&[
                "kernel/index.ts",
                "kernel/index.js",
                "src/kernel/index.ts",
                "src/kernel/index.js",
                "kernel/boot.ts",
            ]),
            boot_marker: "bootKernel(".to_string(),

            ingest_globs: strings(&["**/ingest*.ts", "**/ingest*.js", "**/ingest/**/*.ts"]),
            ingest_inbound: "ingest/inbound".to_string(),
            ingest_locked: "ingest/locked".to_string(),
            atomic_writer_globs: strings(&["**/atomic*.ts", "**/atomic*.js", "**/atomic/**"]),
            audit_log_name: "audit.log".to_string(),
            audit_markers: strings(&["withAudit(", "@audited", "auditLog("]),
            audit_window_tokens: 40,
            mutation_patterns: strings(&[
                r"\.(create|createMany|update|updateMany|upsert|delete|deleteMany|destroy)\(",
                r"(?i)\b(insert\s+into|delete\s+from)\b",
                r"(?i)\bupdate\s+\w+\s+set\b",
                r"\$transaction\(|\.transaction\(",
            ]),

            compatibility_tags: strings(&["backward", "forward", "full", "none"]),
            dealer_ui_root: "apps/dealer".to_string(),
            admin_ui_root: "apps/admin".to_string(),
            dealer_bff_root: "bff/dealer".to_string(),
            admin_bff_root: "bff/admin".to_string(),
            persistence_patterns: strings(&[
                "repository",
                "repositories",
                "/db/",
                "prisma",
                "persistence",
            ]),
            route_handler_globs: strings(&["bff/**/routes/**", "bff/**/*.route.ts", "bff/**/*.route.js"]),
            api_id_pattern: r#"(?:@api\s+|apiId\s*[:=]\s*["'])([A-Za-z0-9_.:-]+)"#.to_string(),
            llid_field: "llid".to_string(),
            llid_display_marker: "data-llid".to_string(),
            dealer_contract_globs: strings(&["**/dealer*/contracts/**", "**/dto/dealer*"]),

            ui_root: "apps/web".to_string(),
            ui_critical_patterns: strings(&["checkout", "payment", "login", "admin"]),
            ui_coverage_mode: CoverageMode::Warn,
            ui_min_coverage: None,

            fix_protected_paths: strings(&["node_modules/", ".governance/", "migrations/", "vendor/"]),
            semantic_lock_marker: "@gov:semantic-lock".to_string(),

            history_max_snapshots: 50,
            history_max_age_days: 14,
            watch_debounce_ms: 300,
            watch_poll_ms: 250,

            signing_key_file: None,
        }
    }
}

impl GovConfig {
    pub fn policy(&self) -> VerifyPolicy {
        VerifyPolicy {
            fail_on_red: self.fail_on_red,
            allow_amber: self.allow_amber,
            max_red: self.max_red,
            max_amber: self.max_amber,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("parse config.yml")
    }
}

/// Loads `config.yml`. A missing file yields defaults; a malformed one yields
/// defaults plus the error text so the caller can fail the config rule.
pub fn load(state: &StateDir) -> (GovConfig, Option<String>) {
    let path = state.config();
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return (GovConfig::default(), None)
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), "config unreadable: {err}");
            return (GovConfig::default(), Some(format!("read config.yml: {err}")));
        }
    };
    match GovConfig::parse(&text) {
        Ok(cfg) => (cfg, None),
        Err(err) => {
            tracing::warn!("config.yml is malformed, using defaults: {err:#}");
            (GovConfig::default(), Some(format!("{err:#}")))
        }
    }
}

/// `0.5-config-valid`: FAIL with the parse error when `config.yml` was rejected.
pub fn config_rule(state: &StateDir, error: Option<&str>) -> RuleResult {
    let violations = error
        .map(|err| {
            vec![Violation::new(
                RULE_CONFIG_VALID,
                state.rel(&state.config()),
                1,
                format!("config.yml rejected, defaults in effect: {err}"),
                "Fix the YAML; every key is optional and unknown keys are rejected.",
            )]
        })
        .unwrap_or_default();
    RuleResult::from_violations(RULE_CONFIG_VALID, "Config is valid", Status::Fail, violations)
        .with_evidence("present", state.config().is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_keys_override_defaults() {
        let cfg = GovConfig::parse("fail_on_red: false\nmax_red: 5\nui_coverage_mode: fail\n")
            .expect("parse");
        assert_eq!(cfg.fail_on_red, Some(false));
        assert_eq!(cfg.max_red, Some(5));
        assert_eq!(cfg.ui_coverage_mode, CoverageMode::Fail);
        assert_eq!(cfg.audit_window_tokens, 40);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(GovConfig::parse("max_redd: 5\n").is_err());
    }

    #[test]
    fn malformed_file_degrades_to_defaults_and_fails_rule() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let state = StateDir::new(tmp.path());
        std::fs::create_dir_all(&state.dir).expect("mkdir");
        std::fs::write(state.config(), "max_red: [oops\n").expect("write");
        let (cfg, err) = load(&state);
        assert_eq!(cfg.history_max_snapshots, 50);
        let rule = config_rule(&state, err.as_deref());
        assert_eq!(rule.status, Status::Fail);
        assert_eq!(rule.violations[0].file, ".governance/config.yml");
    }

    #[test]
    fn empty_file_is_defaults() {
        let cfg = GovConfig::parse("\n").expect("parse");
        assert_eq!(cfg.history_max_snapshots, 50);
    }
}
