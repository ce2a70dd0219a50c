//! Category and tag rule violations for transactions on paid workspaces
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::onyx::{OnyxKey, OnyxUpdate, to_json};
use crate::policy::{Policy, PolicyCategories, PolicyTagLists, ordered_tag_lists};
use crate::transaction::Transaction;

pub const MISSING_CATEGORY: &str = "missingCategory";
pub const CATEGORY_OUT_OF_POLICY: &str = "categoryOutOfPolicy";
pub const MISSING_TAG: &str = "missingTag";
pub const TAG_OUT_OF_POLICY: &str = "tagOutOfPolicy";

const MANAGED: [&str; 4] = [MISSING_CATEGORY, CATEGORY_OUT_OF_POLICY, MISSING_TAG, TAG_OUT_OF_POLICY];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub name: String,
    #[serde(rename = "type", default = "violation_type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn violation_type() -> String {
    "violation".to_string()
}

impl Violation {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: violation_type(),
            data: None,
        }
    }
}

/// Whether violations should be recomputed for transactions under `policy`.
pub fn should_compute(policy: Option<&Policy>, violations_enabled: bool) -> bool {
    violations_enabled && policy.is_some_and(Policy::is_paid_group_policy)
}

/// Recomputes category/tag violations, keeping any violation this module
/// does not manage (e.g. server-side duplicate detection).
pub fn compute_violations(
    transaction: &Transaction,
    existing: &[Violation],
    policy: &Policy,
    categories: &PolicyCategories,
    tag_lists: &PolicyTagLists,
) -> Vec<Violation> {
    let mut violations: Vec<Violation> = existing
        .iter()
        .filter(|v| !MANAGED.contains(&v.name.as_str()))
        .cloned()
        .collect();

    let category = transaction.category.as_deref().unwrap_or_default();
    if policy.requires_category && category.is_empty() {
        violations.push(Violation::new(MISSING_CATEGORY));
    } else if !category.is_empty() && !categories.is_empty() {
        let enabled = categories.get(category).is_some_and(|c| c.enabled);
        if !enabled {
            violations.push(Violation::new(CATEGORY_OUT_OF_POLICY));
        }
    }

    let tag = transaction.tag.as_deref().unwrap_or_default();
    if policy.requires_tag && tag.is_empty() {
        violations.push(Violation::new(MISSING_TAG));
    } else if !tag.is_empty() && !tag_lists.is_empty() {
        let levels = ordered_tag_lists(tag_lists);
        for (level, part) in tag.split(':').enumerate() {
            let Some((_, list)) = levels.get(level) else {
                break;
            };
            if part.is_empty() {
                if list.required {
                    violations.push(Violation {
                        data: Some(serde_json::json!({"tagName": list.name})),
                        ..Violation::new(MISSING_TAG)
                    });
                }
                continue;
            }
            if !list.tags.get(part).is_some_and(|t| t.enabled) {
                violations.push(Violation {
                    data: Some(serde_json::json!({"tagName": list.name})),
                    ..Violation::new(TAG_OUT_OF_POLICY)
                });
            }
        }
    }
    violations
}

/// SET patch replacing the transaction's violations.
pub fn get_violations_onyx_data(
    transaction: &Transaction,
    existing: &[Violation],
    policy: &Policy,
    categories: &PolicyCategories,
    tag_lists: &PolicyTagLists,
) -> OnyxUpdate {
    let violations = compute_violations(transaction, existing, policy, categories, tag_lists);
    OnyxUpdate::set(
        OnyxKey::TransactionViolations(transaction.transaction_id.clone()),
        to_json(&violations),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyCategory, PolicyTag, PolicyTagList, PolicyType};
    use std::collections::BTreeMap;

    #[test]
    fn flags_missing_and_disabled_categories() {
        let policy = Policy {
            id: "P".into(),
            policy_type: PolicyType::Corporate,
            requires_category: true,
            ..Default::default()
        };
        let mut categories = PolicyCategories::new();
        categories.insert("Meals".into(), PolicyCategory { name: "Meals".into(), enabled: false });
        let kept = Violation::new("duplicatedTransaction");

        let mut transaction = Transaction {
            transaction_id: "t".into(),
            ..Default::default()
        };
        let violations = compute_violations(&transaction, &[kept.clone()], &policy, &categories, &PolicyTagLists::new());
        assert_eq!(violations, vec![kept.clone(), Violation::new(MISSING_CATEGORY)]);

        transaction.category = Some("Meals".into());
        let violations = compute_violations(&transaction, &[], &policy, &categories, &PolicyTagLists::new());
        assert_eq!(violations, vec![Violation::new(CATEGORY_OUT_OF_POLICY)]);
    }

    fn tag_list(name: &str, order: u32, tags: &[&str]) -> PolicyTagList {
        PolicyTagList {
            name: name.into(),
            order,
            required: false,
            tags: tags
                .iter()
                .map(|tag| (tag.to_string(), PolicyTag { name: tag.to_string(), enabled: true }))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    /// Levels follow the list weights, not the list names
    #[test]
    fn multi_level_tags_follow_list_order() {
        let policy = Policy {
            id: "P".into(),
            policy_type: PolicyType::Corporate,
            ..Default::default()
        };
        let mut tag_lists = PolicyTagLists::new();
        tag_lists.insert("Region".into(), tag_list("Region", 1, &["West"]));
        tag_lists.insert("Department".into(), tag_list("Department", 0, &["Sales"]));
        tag_lists.insert("Area".into(), tag_list("Area", 2, &["North"]));

        let mut transaction = Transaction {
            transaction_id: "t".into(),
            tag: Some("Sales:West".into()),
            ..Default::default()
        };
        let violations = compute_violations(&transaction, &[], &policy, &PolicyCategories::new(), &tag_lists);
        assert!(violations.is_empty());

        transaction.tag = Some("Sales:West:South".into());
        let violations = compute_violations(&transaction, &[], &policy, &PolicyCategories::new(), &tag_lists);
        assert_eq!(
            violations,
            vec![Violation {
                data: Some(serde_json::json!({"tagName": "Area"})),
                ..Violation::new(TAG_OUT_OF_POLICY)
            }]
        );
    }
}
