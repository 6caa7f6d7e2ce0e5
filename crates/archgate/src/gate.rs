use serde::{Deserialize, Serialize};

use crate::report::Counts;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_on_red: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_amber: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_red: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amber: Option<u64>,
}

impl VerifyPolicy {
    pub fn fail_on_red(&self) -> bool {
        self.fail_on_red.unwrap_or(true)
    }

    pub fn allow_amber(&self) -> bool {
        self.allow_amber.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub pass: bool,
    pub message: String,
    pub counts: Counts,
    pub reasons: Vec<String>,
}

/// Caps are evaluated first, then booleans. A count inside its cap still
/// fails when the matching boolean rule trips.
pub fn evaluate(policy: &VerifyPolicy, counts: Counts) -> Verdict {
    let mut reasons = Vec::new();

    if let Some(max_red) = policy.max_red {
        if counts.red > max_red {
            reasons.push(format!(
                "red count {} exceeds max_red {max_red}",
                counts.red
            ));
        }
    }
    if let Some(max_amber) = policy.max_amber {
        if counts.amber > max_amber {
            reasons.push(format!(
                "amber count {} exceeds max_amber {max_amber}",
                counts.amber
            ));
        }
    }
    if policy.fail_on_red() && counts.red > 0 {
        reasons.push(format!(
            "fail_on_red: {} red violation(s) present",
            counts.red
        ));
    }
    if !policy.allow_amber() && counts.amber > 0 {
        reasons.push(format!(
            "allow_amber=false: {} amber violation(s) present",
            counts.amber
        ));
    }

    match reasons.first() {
        Some(first) => Verdict {
            pass: false,
            message: format!("FAIL: {first}"),
            counts,
            reasons,
        },
        None => {
            let mut message = format!(
                "PASS: red={} amber={} green={}",
                counts.red, counts.amber, counts.green
            );
            if let Some(max_red) = policy.max_red {
                message.push_str(&format!(" (red {}/{max_red} max_red)", counts.red));
            }
            if let Some(max_amber) = policy.max_amber {
                message.push_str(&format!(
                    " (amber {}/{max_amber} max_amber)",
                    counts.amber
                ));
            }
            Verdict {
                pass: true,
                message,
                counts,
                reasons,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(red: u64, amber: u64) -> Counts {
        Counts {
            red,
            amber,
            green: 4,
        }
    }

    #[test]
    fn caps_never_override_fail_on_red() {
        for red in 1..=6u64 {
            for max_red in red..=8 {
                let policy = VerifyPolicy {
                    fail_on_red: Some(true),
                    max_red: Some(max_red),
                    ..VerifyPolicy::default()
                };
                let v = evaluate(&policy, counts(red, 0));
                assert!(!v.pass, "red={red} max_red={max_red} must fail");
                assert!(v.message.contains("fail_on_red"), "{}", v.message);
            }
        }
    }

    #[test]
    fn red_within_cap_passes_when_fail_on_red_disabled() {
        let policy = VerifyPolicy {
            fail_on_red: Some(false),
            max_red: Some(5),
            ..VerifyPolicy::default()
        };
        let v = evaluate(&policy, counts(3, 0));
        assert!(v.pass, "{v:?}");
        assert!(v.message.contains("max_red"), "{}", v.message);
    }

    #[test]
    fn red_over_cap_fails_with_max_red_message() {
        let policy = VerifyPolicy {
            fail_on_red: Some(false),
            max_red: Some(2),
            ..VerifyPolicy::default()
        };
        let v = evaluate(&policy, counts(3, 0));
        assert!(!v.pass);
        assert!(v.message.contains("max_red"), "{}", v.message);
        assert_eq!(v.reasons.len(), 1);
    }

    #[test]
    fn cap_reason_precedes_boolean_reason() {
        let policy = VerifyPolicy {
            fail_on_red: Some(true),
            max_red: Some(1),
            ..VerifyPolicy::default()
        };
        let v = evaluate(&policy, counts(2, 0));
        assert!(!v.pass);
        assert!(v.reasons[0].contains("max_red"));
        assert!(v.reasons[1].contains("fail_on_red"));
        assert!(v.message.contains("max_red"));
    }

    #[test]
    fn defaults_reject_amber() {
        let v = evaluate(&VerifyPolicy::default(), counts(0, 1));
        assert!(!v.pass);
        assert!(v.message.contains("allow_amber"));

        let policy = VerifyPolicy {
            allow_amber: Some(true),
            ..VerifyPolicy::default()
        };
        assert!(evaluate(&policy, counts(0, 1)).pass);
    }

    #[test]
    fn clean_counts_pass_with_no_reasons() {
        let v = evaluate(&VerifyPolicy::default(), counts(0, 0));
        assert!(v.pass);
        assert!(v.reasons.is_empty());
        assert_eq!(v.message, "PASS: red=0 amber=0 green=4");
    }
}
