//! Renderers for the evidence artifacts: SARIF 2.1.0, JUnit XML, the HTML
//! HUD and `hints.json`.

use anyhow::Result;
use archgate_contracts::{ARCHGATE_HINTS_SCHEMA_VERSION, SARIF_SCHEMA_URI, SARIF_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::gate::Verdict;
use crate::report::{Report, Severity, Status, Violation};
use crate::store::{self, StateDir};
use crate::util::{self, html_escape, xml_escape};

fn sarif_level(severity: Severity) -> &'static str {
    match severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Info => "note",
    }
}

pub fn sarif(report: &Report) -> Value {
    let rules: Vec<Value> = report
        .results
        .iter()
        .map(|r| {
            json!({
                "id": r.rule_id,
                "name": r.rule_id,
                "shortDescription": { "text": r.title },
            })
        })
        .collect();

    let mut results = Vec::new();
    for (index, r) in report.results.iter().enumerate() {
        if r.status == Status::Pass {
            continue;
        }
        for v in &r.violations {
            results.push(json!({
                "ruleId": v.rule_id,
                "ruleIndex": index,
                "level": sarif_level(r.severity),
                "message": { "text": format!("{} (fix: {})", v.message, v.fix_hint) },
                "locations": [{
                    "physicalLocation": {
                        "artifactLocation": { "uri": v.file },
                        "region": { "startLine": v.line.max(1) },
                    }
                }],
            }));
        }
    }

    json!({
        "$schema": SARIF_SCHEMA_URI,
        "version": SARIF_VERSION,
        "runs": [{
            "tool": {
                "driver": {
                    "name": "archgate",
                    "version": env!("CARGO_PKG_VERSION"),
                    "rules": rules,
                }
            },
            "results": results,
        }],
    })
}

/// One `<testcase>` per rule; FAIL rules carry a `<failure>`, WARN rules a
/// `<skipped>` with the amber detail.
pub fn junit(report: &Report) -> String {
    let tests = report.results.len();
    let failures = report.results.iter().filter(|r| r.status == Status::Fail).count();
    let skipped = report.results.iter().filter(|r| r.status == Status::Warn).count();

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!(
        "<testsuites><testsuite name=\"archgate\" tests=\"{tests}\" failures=\"{failures}\" errors=\"0\" skipped=\"{skipped}\">"
    ));
    for r in &report.results {
        out.push_str(&format!(
            "<testcase classname=\"phase.{}\" name=\"{}\">",
            xml_escape(r.phase()),
            xml_escape(&r.rule_id)
        ));
        let detail = || {
            r.violations
                .iter()
                .map(|v| format!("{}:{}: {}", v.file, v.line, v.message))
                .collect::<Vec<_>>()
                .join("; ")
        };
        match r.status {
            Status::Pass => {}
            Status::Warn => {
                out.push_str(&format!("<skipped message=\"{}\"/>", xml_escape(detail())));
            }
            Status::Fail => {
                let d = detail();
                out.push_str(&format!(
                    "<failure message=\"{}\">{}</failure>",
                    xml_escape(&d),
                    xml_escape(&d)
                ));
            }
        }
        out.push_str("</testcase>");
    }
    out.push_str("</testsuite></testsuites>\n");
    out
}

pub fn html(report: &Report, verdict: Option<&Verdict>) -> String {
    let mut s = String::new();
    s.push_str("<!doctype html>\n<html><head><meta charset=\"utf-8\">");
    s.push_str("<title>archgate governance report</title>");
    s.push_str("<style>body{font-family:system-ui,Segoe UI,Helvetica,Arial,sans-serif;margin:24px;line-height:1.45}code{background:#f6f8fa;padding:2px 4px;border-radius:4px}table{border-collapse:collapse}td,th{padding:6px 8px;border:1px solid #ddd}.PASS{color:#1a7f37}.WARN{color:#9a6700}.FAIL{color:#cf222e}h2{margin-top:28px}</style>");
    s.push_str("</head><body>");
    s.push_str("<h1>archgate governance report</h1>");
    s.push_str("<p><b>generated:</b> <code>");
    s.push_str(&html_escape(&report.generated_at));
    s.push_str("</code></p>");

    if let Some(v) = verdict {
        s.push_str(&format!(
            "<p class=\"{}\"><b>verdict:</b> {}</p>",
            if v.pass { "PASS" } else { "FAIL" },
            html_escape(&v.message)
        ));
    }

    s.push_str("<h2>Phases</h2><table><tr><th>phase</th><th>status</th></tr>");
    for (phase, status) in &report.phases {
        s.push_str(&format!(
            "<tr><td>{}</td><td class=\"{}\">{}</td></tr>",
            html_escape(phase),
            html_escape(status),
            html_escape(status)
        ));
    }
    s.push_str("</table>");

    s.push_str("<h2>Rules</h2><table><tr><th>rule</th><th>title</th><th>status</th><th>violations</th></tr>");
    for r in &report.results {
        s.push_str(&format!(
            "<tr><td><code>{}</code></td><td>{}</td><td class=\"{}\">{}</td><td>{}</td></tr>",
            html_escape(&r.rule_id),
            html_escape(&r.title),
            r.status.as_str(),
            r.status.as_str(),
            r.violations.len()
        ));
    }
    s.push_str("</table>");

    let open: Vec<&Violation> = report
        .results
        .iter()
        .filter(|r| r.status != Status::Pass)
        .flat_map(|r| r.violations.iter())
        .collect();
    if !open.is_empty() {
        s.push_str("<h2>Violations</h2><ul>");
        for v in open {
            s.push_str(&format!(
                "<li><code>{}</code> <code>{}:{}</code> {}<br><i>{}</i></li>",
                html_escape(&v.rule_id),
                html_escape(&v.file),
                v.line,
                html_escape(&v.message),
                html_escape(&v.fix_hint)
            ));
        }
        s.push_str("</ul>");
    }
    s.push_str("</body></html>\n");
    s
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub status: Status,
    #[serde(flatten)]
    pub violation: Violation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hints {
    pub schema_version: String,
    pub generated_at: String,
    pub hints: Vec<Hint>,
}

/// Open violations for watch consumers, red before amber.
pub fn hints(report: &Report) -> Hints {
    let mut hints: Vec<Hint> = report
        .results
        .iter()
        .filter(|r| r.status != Status::Pass)
        .flat_map(|r| {
            r.violations.iter().map(|v| Hint {
                status: r.status,
                violation: v.clone(),
            })
        })
        .collect();
    hints.sort_by(|a, b| b.status.cmp(&a.status));
    Hints {
        schema_version: ARCHGATE_HINTS_SCHEMA_VERSION.to_string(),
        generated_at: report.generated_at.clone(),
        hints,
    }
}

pub fn write_sarif(state: &StateDir, report: &Report) -> Result<()> {
    store::write_atomic(&state.sarif(), &util::pretty_json_bytes(&sarif(report))?)
}

pub fn write_junit(state: &StateDir, report: &Report) -> Result<()> {
    store::write_atomic(&state.junit(), junit(report).as_bytes())
}

pub fn write_html(state: &StateDir, report: &Report, verdict: Option<&Verdict>) -> Result<()> {
    store::write_atomic(&state.html(), html(report, verdict).as_bytes())
}

pub fn write_hints(state: &StateDir, report: &Report) -> Result<Hints> {
    let h = hints(report);
    store::write_json_atomic(&state.hints(), &h)?;
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RuleResult;

    fn sample() -> Report {
        let mut report = Report::default();
        report.upsert(vec![
            RuleResult::from_violations(
                "1.4-boundary-internal",
                "No internal imports",
                Status::Fail,
                vec![Violation::new(
                    "1.4-boundary-internal",
                    "modules/a/x.ts",
                    7,
                    "module `a` imports `b` internals via `<b/internal>`",
                    "use contracts",
                )],
            ),
            RuleResult::from_violations(
                "4.1-ui-registry-coverage",
                "UI coverage",
                Status::Warn,
                vec![Violation::new("4.1-ui-registry-coverage", "apps/web/app/page.tsx", 1, "m", "h")],
            ),
            RuleResult::pass("2.1-ingest-atomic-move", "Ingest moves"),
        ]);
        report
    }

    #[test]
    fn sarif_lists_only_open_violations() {
        let v = sarif(&sample());
        assert_eq!(v["version"], "2.1.0");
        let results = v["runs"][0]["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["level"], "error");
        assert_eq!(
            results[0]["locations"][0]["physicalLocation"]["region"]["startLine"],
            7
        );
        assert_eq!(results[1]["level"], "warning");
        assert_eq!(v["runs"][0]["tool"]["driver"]["rules"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn junit_counts_and_escapes() {
        let x = junit(&sample());
        assert!(x.contains("tests=\"3\" failures=\"1\" errors=\"0\" skipped=\"1\""));
        assert!(x.contains("&lt;b/internal&gt;"));
        assert!(!x.contains("<b/internal>"));
    }

    #[test]
    fn hints_put_red_before_amber() {
        let h = hints(&sample());
        assert_eq!(h.hints.len(), 2);
        assert_eq!(h.hints[0].status, Status::Fail);
        assert_eq!(h.hints[1].status, Status::Warn);
    }

    #[test]
    fn html_escapes_messages() {
        let page = html(&sample(), None);
        assert!(page.contains("&lt;b/internal&gt;"));
        assert!(page.contains("archgate governance report"));
    }
}
