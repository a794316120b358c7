//! # Matcher
//!
//! Select the consumer targets whose rules match a record.
use tracing::debug;

use crate::record::EmailRecord;
use crate::target::ConsumerTarget;

/// Return every enabled target whose rule expression matches `record`, in the order given.
/// Every target is evaluated independently: there is no priority and no first-match-wins.
pub fn match_targets<'t>(
    record: &EmailRecord,
    targets: &'t [ConsumerTarget],
) -> Vec<&'t ConsumerTarget> {
    targets
        .iter()
        .filter(|target| target.enabled)
        .filter(|target| {
            let matched = target.rule.evaluate(record);
            debug!(
                target_name = target.label(),
                matched,
                internet_message_id = record.log_id(),
                "evaluated target rule"
            );
            matched
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Condition, ConditionGroup, RuleExpression};
    use crate::target::Endpoint;
    use serde_json::json;

    fn target(id: &str, enabled: bool, subject_contains: Option<&str>) -> ConsumerTarget {
        let condition_groups = subject_contains
            .map(|needle| {
                vec![ConditionGroup {
                    conditions: vec![Condition::new("subject", "contains", json!(needle))],
                    ..Default::default()
                }]
            })
            .unwrap_or_default();

        ConsumerTarget {
            id: id.to_owned(),
            name: id.to_owned(),
            enabled,
            rule: RuleExpression {
                condition_groups,
                ..Default::default()
            },
            endpoint: Endpoint::new(&format!("https://{id}.internal/hook")),
        }
    }

    fn record(subject: &str) -> EmailRecord {
        EmailRecord {
            subject: subject.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_match_targets_keeps_input_order() {
        let targets = vec![
            target("zeta", true, Some("invoice")),
            target("alpha", true, None),
            target("receipts", true, Some("receipt")),
            target("mu", true, Some("INVOICE")),
        ];

        let matched: Vec<&str> = match_targets(&record("Invoice #1"), &targets)
            .iter()
            .map(|t| t.id.as_str())
            .collect();

        assert_eq!(matched, vec!["zeta", "alpha", "mu"]);
    }

    #[test]
    fn test_disabled_targets_never_match() {
        let targets = vec![target("off", false, None), target("on", true, None)];

        let matched = match_targets(&record("anything"), &targets);

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "on");
    }

    #[test]
    fn test_unfiltered_target_matches_every_record() {
        let targets = vec![target("all", true, None)];

        assert_eq!(match_targets(&record(""), &targets).len(), 1);
        assert_eq!(match_targets(&EmailRecord::default(), &targets).len(), 1);
    }

    #[test]
    fn test_no_match() {
        let targets = vec![target("receipts", true, Some("receipt"))];

        assert!(match_targets(&record("Invoice #1"), &targets).is_empty());
    }

    #[test]
    fn test_or_target_without_groups_matches_every_record() {
        let parsed = crate::target::parse_targets(
            r#"[
                {"id": "all", "group_logic": "OR", "condition_groups": [],
                 "endpoint": {"url": "https://all.internal/hook"}},
                {"id": "empty-group", "group_logic": "OR",
                 "condition_groups": [{"logic": "OR", "conditions": []}],
                 "endpoint": {"url": "https://empty.internal/hook"}}
            ]"#,
        )
        .unwrap();

        let matched: Vec<&str> = match_targets(&EmailRecord::default(), &parsed.targets)
            .iter()
            .map(|t| t.id.as_str())
            .collect();

        assert_eq!(matched, vec!["all", "empty-group"]);
    }
}
