use crate::report::{RuleResult, Status, Violation};

pub const RULE_PAYLOAD: &str = "0.1-rule-payload";

fn defects(v: &Violation) -> Vec<&'static str> {
    let mut out = Vec::new();
    if v.rule_id.trim().is_empty() {
        out.push("ruleId");
    }
    if v.file.trim().is_empty() {
        out.push("file");
    }
    if v.line == 0 {
        out.push("line");
    }
    if v.message.trim().is_empty() {
        out.push("message");
    }
    if v.fix_hint.trim().is_empty() {
        out.push("fixHint");
    }
    out
}

/// Machine-checks that every violation of every other rule is fully populated.
pub fn validate(results: &[RuleResult]) -> RuleResult {
    let mut checked = 0u64;
    let mut violations = Vec::new();
    for r in results.iter().filter(|r| r.rule_id != RULE_PAYLOAD) {
        if r.status != Status::Pass && r.violations.is_empty() {
            violations.push(Violation::new(
                RULE_PAYLOAD,
                "report.json",
                1,
                format!("rule {} is {} but carries no violations", r.rule_id, r.status.as_str()),
                "Emit at least one violation for every non-passing rule.",
            ));
        }
        for (idx, v) in r.violations.iter().enumerate() {
            checked += 1;
            let missing = defects(v);
            if missing.is_empty() {
                continue;
            }
            violations.push(Violation::new(
                RULE_PAYLOAD,
                if v.file.trim().is_empty() {
                    "report.json".to_string()
                } else {
                    v.file.clone()
                },
                v.line.max(1),
                format!(
                    "violation #{idx} of {} has empty {}",
                    r.rule_id,
                    missing.join(", ")
                ),
                "Populate ruleId, file, line, message and fixHint on every violation.",
            ));
        }
    }
    RuleResult::from_violations(
        RULE_PAYLOAD,
        "Violations carry a complete payload",
        Status::Fail,
        violations,
    )
    .with_evidence("checked", checked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_violations_pass() {
        let r = RuleResult::from_violations(
            "1.4-boundary-internal",
            "t",
            Status::Fail,
            vec![Violation::new("1.4-boundary-internal", "a.ts", 3, "m", "h")],
        );
        let out = validate(&[r]);
        assert_eq!(out.status, Status::Pass);
        assert_eq!(out.evidence["checked"], 1);
    }

    #[test]
    fn empty_fields_and_zero_lines_fail() {
        let r = RuleResult::from_violations(
            "2.4-audit-wrapped-mutations",
            "t",
            Status::Fail,
            vec![Violation::new("2.4-audit-wrapped-mutations", "", 0, "m", " ")],
        );
        let out = validate(&[r]);
        assert_eq!(out.status, Status::Fail);
        assert!(out.violations[0].message.contains("file, line, fixHint"));
        assert_eq!(out.violations[0].line, 1);
    }

    #[test]
    fn non_passing_rule_without_violations_fails() {
        let r = RuleResult::pass("3.1-service-id", "t").with_status(Status::Warn);
        assert_eq!(validate(&[r]).status, Status::Fail);
    }
}
