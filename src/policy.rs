//! Workspace policies and the category/tag lists they enforce
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::AccountId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    #[default]
    Personal,
    Free,
    Team,
    Corporate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApprovalMode {
    Optional,
    Basic,
    Advanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReimbursementChoice {
    #[serde(rename = "reimburseYes")]
    Yes,
    #[serde(rename = "reimburseNo")]
    No,
    #[serde(rename = "reimburseManual")]
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoReportingFrequency {
    Instant,
    Immediate,
    Weekly,
    Monthly,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyRole {
    Admin,
    Auditor,
    #[default]
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceUnit {
    #[default]
    Mi,
    Km,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MileageRate {
    /// Minor units per distance unit, e.g. 67 for $0.67/mi.
    pub rate: f64,
    pub currency: String,
    #[serde(default)]
    pub unit: DistanceUnit,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub policy_type: PolicyType,
    #[serde(default)]
    pub role: PolicyRole,
    #[serde(rename = "ownerAccountID", skip_serializing_if = "Option::is_none")]
    pub owner_account_id: Option<AccountId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_mode: Option<ApprovalMode>,
    /// Account that receives submitted reports. Falls back to the owner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submits_to: Option<AccountId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reimbursement_choice: Option<ReimbursementChoice>,
    #[serde(default)]
    pub auto_reporting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_reporting_frequency: Option<AutoReportingFrequency>,
    /// Reports at or below this total are reimbursed automatically.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_reimbursement_limit: Option<i64>,
    #[serde(default)]
    pub requires_category: bool,
    #[serde(default)]
    pub requires_tag: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mileage_rates: BTreeMap<String, MileageRate>,
}

impl Policy {
    pub fn is_paid_group_policy(&self) -> bool {
        matches!(self.policy_type, PolicyType::Team | PolicyType::Corporate)
    }
    pub fn is_free_group_policy(&self) -> bool {
        self.policy_type == PolicyType::Free
    }
    pub fn is_instant_submit_enabled(&self) -> bool {
        self.auto_reporting && self.auto_reporting_frequency == Some(AutoReportingFrequency::Instant)
    }
    pub fn is_submit_and_close(&self) -> bool {
        self.approval_mode == Some(ApprovalMode::Optional)
    }
    pub fn is_admin(&self) -> bool {
        self.role == PolicyRole::Admin
    }
    pub fn reimburses(&self) -> bool {
        self.reimbursement_choice != Some(ReimbursementChoice::No)
    }
    pub fn submit_to_account_id(&self) -> Option<AccountId> {
        self.submits_to.or(self.owner_account_id)
    }
    /// First mileage rate by id, used for new distance drafts.
    pub fn default_mileage_rate_id(&self) -> Option<&str> {
        self.mileage_rates.keys().next().map(String::as_str)
    }
    pub fn mileage_rate(&self, rate_id: &str) -> Option<&MileageRate> {
        self.mileage_rates.get(rate_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCategory {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTag {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTagList {
    pub name: String,
    /// Level of this list in a multi-level tag, `a:b` picks from level 0 then 1.
    #[serde(rename = "orderWeight", default)]
    pub order: u32,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, PolicyTag>,
}

fn enabled_by_default() -> bool {
    true
}

pub type PolicyCategories = BTreeMap<String, PolicyCategory>;
pub type PolicyTagLists = BTreeMap<String, PolicyTagList>;

/// Tag lists in level order. Lists with the same weight keep their name order.
pub fn ordered_tag_lists(tag_lists: &PolicyTagLists) -> Vec<(&String, &PolicyTagList)> {
    let mut lists: Vec<_> = tag_lists.iter().collect();
    lists.sort_by_key(|(_, list)| list.order);
    lists
}

/// Category/tag lists of the policy a request is filed under, plus the user's
/// recently used values for it.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    pub policy: Option<Policy>,
    pub categories: PolicyCategories,
    pub tag_lists: PolicyTagLists,
    pub recently_used_categories: Vec<String>,
    pub recently_used_tags: BTreeMap<String, Vec<String>>,
}

impl PolicyContext {
    pub fn policy_id(&self) -> Option<&str> {
        self.policy.as_ref().map(|p| p.id.as_str())
    }

    /// Most recent first, no duplicates.
    pub fn recently_used_categories_with(&self, category: &str) -> Vec<String> {
        if category.is_empty() {
            return Vec::new();
        }
        let mut updated = vec![category.to_string()];
        updated.extend(
            self.recently_used_categories
                .iter()
                .filter(|existing| existing.as_str() != category)
                .cloned(),
        );
        updated
    }

    /// Per tag-list recency after using `tag` (`a:b` selects one tag per list level).
    pub fn recently_used_tags_with(&self, tag: &str) -> BTreeMap<String, Vec<String>> {
        let mut updated = BTreeMap::new();
        if tag.is_empty() {
            return updated;
        }
        let list_names: Vec<&String> = ordered_tag_lists(&self.tag_lists).into_iter().map(|(name, _)| name).collect();
        for (index, part) in tag.split(':').enumerate() {
            if part.is_empty() {
                continue;
            }
            let list_name = list_names
                .get(index)
                .map(|name| name.to_string())
                .unwrap_or_else(|| format!("level{index}"));
            let mut recent = vec![part.to_string()];
            if let Some(previous) = self.recently_used_tags.get(&list_name) {
                recent.extend(previous.iter().filter(|t| t.as_str() != part).cloned());
            }
            updated.insert(list_name, recent);
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recently_used_categories_move_to_front() {
        let context = PolicyContext {
            recently_used_categories: vec!["Travel".into(), "Meals".into()],
            ..Default::default()
        };
        assert_eq!(context.recently_used_categories_with("Meals"), vec!["Meals", "Travel"]);
        assert!(context.recently_used_categories_with("").is_empty());
    }

    #[test]
    fn policy_flags() {
        let policy = Policy {
            id: "P".into(),
            policy_type: PolicyType::Corporate,
            approval_mode: Some(ApprovalMode::Optional),
            auto_reporting: true,
            auto_reporting_frequency: Some(AutoReportingFrequency::Instant),
            owner_account_id: Some(9),
            ..Default::default()
        };
        assert!(policy.is_paid_group_policy());
        assert!(policy.is_submit_and_close());
        assert!(policy.is_instant_submit_enabled());
        assert_eq!(policy.submit_to_account_id(), Some(9));
    }
}
