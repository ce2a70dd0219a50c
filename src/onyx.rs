//! Typed state patches over the key space of the local store.
//!
//! Every mutating use case produces an [`OnyxData`]: three ordered lists of
//! [`OnyxUpdate`]s. The optimistic list is applied immediately, the success
//! list once the server confirms and the failure list if it rejects the write.
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::types::TransactionRef;

/// Keyed collections. A collection member key is `prefix + id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Report,
    ReportActions,
    Transaction,
    TransactionDraft,
    TransactionViolations,
    NextStep,
    Policy,
    PolicyCategories,
    PolicyTags,
    PolicyRecentlyUsedCategories,
    PolicyRecentlyUsedTags,
}

impl Collection {
    pub const ALL: [Collection; 11] = [
        Collection::Report,
        Collection::ReportActions,
        Collection::Transaction,
        Collection::TransactionDraft,
        Collection::TransactionViolations,
        Collection::NextStep,
        Collection::Policy,
        Collection::PolicyCategories,
        Collection::PolicyTags,
        Collection::PolicyRecentlyUsedCategories,
        Collection::PolicyRecentlyUsedTags,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Collection::Report => "report_",
            Collection::ReportActions => "reportActions_",
            Collection::Transaction => "transactions_",
            Collection::TransactionDraft => "transactionsDraft_",
            Collection::TransactionViolations => "transactionViolations_",
            Collection::NextStep => "reportNextStep_",
            Collection::Policy => "policy_",
            Collection::PolicyCategories => "policyCategories_",
            Collection::PolicyTags => "policyTags_",
            Collection::PolicyRecentlyUsedCategories => "policyRecentlyUsedCategories_",
            Collection::PolicyRecentlyUsedTags => "policyRecentlyUsedTags_",
        }
    }

    pub fn member(self, id: &str) -> OnyxKey {
        let id = id.to_string();
        match self {
            Collection::Report => OnyxKey::Report(id),
            Collection::ReportActions => OnyxKey::ReportActions(id),
            Collection::Transaction => OnyxKey::Transaction(id),
            Collection::TransactionDraft => OnyxKey::TransactionDraft(TransactionRef::from_id(&id)),
            Collection::TransactionViolations => OnyxKey::TransactionViolations(id),
            Collection::NextStep => OnyxKey::NextStep(id),
            Collection::Policy => OnyxKey::Policy(id),
            Collection::PolicyCategories => OnyxKey::PolicyCategories(id),
            Collection::PolicyTags => OnyxKey::PolicyTags(id),
            Collection::PolicyRecentlyUsedCategories => OnyxKey::PolicyRecentlyUsedCategories(id),
            Collection::PolicyRecentlyUsedTags => OnyxKey::PolicyRecentlyUsedTags(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OnyxKey {
    Session,
    PersonalDetailsList,
    QuickAction,
    LastPaymentMethod,
    Report(String),
    ReportActions(String),
    Transaction(String),
    TransactionDraft(TransactionRef),
    TransactionViolations(String),
    NextStep(String),
    Policy(String),
    PolicyCategories(String),
    PolicyTags(String),
    PolicyRecentlyUsedCategories(String),
    PolicyRecentlyUsedTags(String),
}

impl OnyxKey {
    const SESSION: &'static str = "session";
    const PERSONAL_DETAILS_LIST: &'static str = "personalDetailsList";
    const QUICK_ACTION: &'static str = "nvp_quickActionGlobalCreate";
    const LAST_PAYMENT_METHOD: &'static str = "nvp_private_lastPaymentMethod";

    pub fn collection(&self) -> Option<Collection> {
        match self {
            OnyxKey::Session
            | OnyxKey::PersonalDetailsList
            | OnyxKey::QuickAction
            | OnyxKey::LastPaymentMethod => None,
            OnyxKey::Report(_) => Some(Collection::Report),
            OnyxKey::ReportActions(_) => Some(Collection::ReportActions),
            OnyxKey::Transaction(_) => Some(Collection::Transaction),
            OnyxKey::TransactionDraft(_) => Some(Collection::TransactionDraft),
            OnyxKey::TransactionViolations(_) => Some(Collection::TransactionViolations),
            OnyxKey::NextStep(_) => Some(Collection::NextStep),
            OnyxKey::Policy(_) => Some(Collection::Policy),
            OnyxKey::PolicyCategories(_) => Some(Collection::PolicyCategories),
            OnyxKey::PolicyTags(_) => Some(Collection::PolicyTags),
            OnyxKey::PolicyRecentlyUsedCategories(_) => Some(Collection::PolicyRecentlyUsedCategories),
            OnyxKey::PolicyRecentlyUsedTags(_) => Some(Collection::PolicyRecentlyUsedTags),
        }
    }

    fn member_id(&self) -> Option<&str> {
        match self {
            OnyxKey::Session
            | OnyxKey::PersonalDetailsList
            | OnyxKey::QuickAction
            | OnyxKey::LastPaymentMethod => None,
            OnyxKey::TransactionDraft(reference) => Some(reference.id()),
            OnyxKey::Report(id)
            | OnyxKey::ReportActions(id)
            | OnyxKey::Transaction(id)
            | OnyxKey::TransactionViolations(id)
            | OnyxKey::NextStep(id)
            | OnyxKey::Policy(id)
            | OnyxKey::PolicyCategories(id)
            | OnyxKey::PolicyTags(id)
            | OnyxKey::PolicyRecentlyUsedCategories(id)
            | OnyxKey::PolicyRecentlyUsedTags(id) => Some(id),
        }
    }
}

impl fmt::Display for OnyxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.collection(), self.member_id()) {
            (Some(collection), Some(id)) => write!(f, "{}{}", collection.prefix(), id),
            _ => f.write_str(match self {
                OnyxKey::Session => Self::SESSION,
                OnyxKey::PersonalDetailsList => Self::PERSONAL_DETAILS_LIST,
                OnyxKey::QuickAction => Self::QUICK_ACTION,
                _ => Self::LAST_PAYMENT_METHOD,
            }),
        }
    }
}

impl FromStr for OnyxKey {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            Self::SESSION => return Ok(OnyxKey::Session),
            Self::PERSONAL_DETAILS_LIST => return Ok(OnyxKey::PersonalDetailsList),
            Self::QUICK_ACTION => return Ok(OnyxKey::QuickAction),
            Self::LAST_PAYMENT_METHOD => return Ok(OnyxKey::LastPaymentMethod),
            _ => {}
        }
        // longest prefix first so `policyTags_` never parses as `policy_`
        let mut collections = Collection::ALL;
        collections.sort_by_key(|c| std::cmp::Reverse(c.prefix().len()));
        collections
            .iter()
            .find_map(|collection| {
                raw.strip_prefix(collection.prefix())
                    .filter(|id| !id.is_empty())
                    .map(|id| collection.member(id))
            })
            .ok_or_else(|| StoreError::InvalidKey(raw.to_string()))
    }
}

/// What a store subscriber listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    Key(OnyxKey),
    Collection(Collection),
}

impl KeyPattern {
    pub fn matches(&self, key: &OnyxKey) -> bool {
        match self {
            KeyPattern::Key(expected) => expected == key,
            KeyPattern::Collection(collection) => key.collection() == Some(*collection),
        }
    }
}

/// A single state mutation. `Set` replaces (or clears, with `None`) the value
/// under a key; `Merge` deep-merges a partial value into it.
#[derive(Debug, Clone, PartialEq)]
pub enum OnyxUpdate {
    Set { key: OnyxKey, value: Option<Value> },
    Merge { key: OnyxKey, value: Value },
}

impl OnyxUpdate {
    pub fn set(key: OnyxKey, value: Value) -> Self {
        OnyxUpdate::Set { key, value: Some(value) }
    }

    pub fn clear(key: OnyxKey) -> Self {
        OnyxUpdate::Set { key, value: None }
    }

    pub fn merge(key: OnyxKey, value: Value) -> Self {
        OnyxUpdate::Merge { key, value }
    }

    /// SET for entities that do not exist yet, MERGE otherwise.
    pub fn set_or_merge(is_new: bool, key: OnyxKey, value: Value) -> Self {
        if is_new { Self::set(key, value) } else { Self::merge(key, value) }
    }

    pub fn key(&self) -> &OnyxKey {
        match self {
            OnyxUpdate::Set { key, .. } | OnyxUpdate::Merge { key, .. } => key,
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, OnyxUpdate::Set { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            OnyxUpdate::Set { value, .. } => value.as_ref(),
            OnyxUpdate::Merge { value, .. } => Some(value),
        }
    }
}

/// The optimistic/success/failure triad attached to one network write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnyxData {
    pub optimistic_data: Vec<OnyxUpdate>,
    pub success_data: Vec<OnyxUpdate>,
    pub failure_data: Vec<OnyxUpdate>,
}

impl OnyxData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends another triad phase by phase, keeping both orders.
    pub fn extend(&mut self, other: OnyxData) {
        self.optimistic_data.extend(other.optimistic_data);
        self.success_data.extend(other.success_data);
        self.failure_data.extend(other.failure_data);
    }

    pub fn touched_keys(&self) -> BTreeSet<OnyxKey> {
        self.optimistic_data.iter().map(|update| update.key().clone()).collect()
    }

    /// Keys reconciled by the success or failure lists that the optimistic
    /// list never touched.
    pub fn untracked_keys(&self) -> Vec<OnyxKey> {
        let touched = self.touched_keys();
        let mut untracked: Vec<OnyxKey> = self
            .success_data
            .iter()
            .chain(self.failure_data.iter())
            .map(|update| update.key().clone())
            .filter(|key| !touched.contains(key))
            .collect();
        untracked.sort();
        untracked.dedup();
        untracked
    }

    /// Last optimistic value written under `key`, for inspection.
    pub fn optimistic_value(&self, key: &OnyxKey) -> Option<&OnyxUpdate> {
        self.optimistic_data.iter().rev().find(|update| update.key() == key)
    }
}

/// Serializes an entity into a patch value.
///
/// Entities in this crate only hold string-keyed maps, so serialization does
/// not fail in practice; a failure is logged and yields `null`.
pub fn to_json<T: Serialize>(entity: &T) -> Value {
    match serde_json::to_value(entity) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(error = %err, "entity could not be serialized into a patch");
            Value::Null
        }
    }
}

/// Drops `null` members at every depth. Stored values never contain nulls.
pub fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Deep-merges `patch` into `target`. Objects merge member-wise, a `null`
/// member removes the key and anything else (arrays included) replaces.
pub fn merge_value(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(changes)) => {
            for (key, change) in changes {
                if change.is_null() {
                    existing.remove(key);
                    continue;
                }
                match existing.get_mut(key) {
                    Some(current) if current.is_object() && change.is_object() => {
                        merge_value(current, change)
                    }
                    _ => {
                        existing.insert(key.clone(), strip_nulls(change.clone()));
                    }
                }
            }
        }
        (target, patch) => *target = strip_nulls(patch.clone()),
    }
}

/// Result of merging `patch` into the value currently stored (if any).
pub fn apply_merge(existing: Option<Value>, patch: &Value) -> Option<Value> {
    if patch.is_null() {
        return None;
    }
    match existing {
        Some(mut current) => {
            merge_value(&mut current, patch);
            Some(current)
        }
        None => Some(strip_nulls(patch.clone())),
    }
}

/// Merge patch that turns `from` back into `to`: members only present in
/// `from` are nulled, everything else takes `to`'s value.
pub fn revert_patch(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(current), Value::Object(snapshot)) => {
            let mut patch = Map::new();
            for key in current.keys() {
                if !snapshot.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, old) in snapshot {
                match current.get(key) {
                    Some(now) if now == old => {}
                    Some(now) if now.is_object() && old.is_object() => {
                        patch.insert(key.clone(), revert_patch(now, old));
                    }
                    _ => {
                        patch.insert(key.clone(), old.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        (_, snapshot) => snapshot.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_round_trip_through_strings() {
        let keys = [
            OnyxKey::Report("42".into()),
            OnyxKey::ReportActions("42".into()),
            OnyxKey::TransactionDraft(TransactionRef::Draft),
            OnyxKey::TransactionDraft(TransactionRef::Persisted("77".into())),
            OnyxKey::PolicyTags("P1".into()),
            OnyxKey::Policy("P1".into()),
            OnyxKey::QuickAction,
        ];
        for key in keys {
            let parsed: OnyxKey = key.to_string().parse().unwrap();
            assert_eq!(parsed, key);
        }
        assert_eq!(OnyxKey::TransactionDraft(TransactionRef::Draft).to_string(), "transactionsDraft_1");
        assert!("nonsense".parse::<OnyxKey>().is_err());
        assert!("report_".parse::<OnyxKey>().is_err());
    }

    #[test]
    fn merge_removes_nulls_and_replaces_arrays() {
        let mut target = json!({"a": 1, "nested": {"x": 1, "y": 2}, "list": [1, 2]});
        merge_value(&mut target, &json!({"a": null, "nested": {"y": null, "z": 3}, "list": [3]}));
        assert_eq!(target, json!({"nested": {"x": 1, "z": 3}, "list": [3]}));
    }

    #[test]
    fn merging_null_deletes_the_value() {
        assert_eq!(apply_merge(Some(json!({"a": 1})), &Value::Null), None);
        assert_eq!(apply_merge(None, &json!({"a": 1, "b": null})), Some(json!({"a": 1})));
    }

    #[test]
    fn revert_patch_restores_snapshot() {
        let snapshot = json!({"total": 100, "pendingFields": {"preview": "update"}, "name": "x"});
        let mut current = json!({"total": 250, "pendingFields": {"preview": "update", "createChat": "add"}, "extra": true, "name": "x"});
        let patch = revert_patch(&current, &snapshot);
        merge_value(&mut current, &patch);
        assert_eq!(current, snapshot);
    }

    #[test]
    fn untracked_keys_are_reported() {
        let data = OnyxData {
            optimistic_data: vec![OnyxUpdate::merge(OnyxKey::Report("1".into()), json!({}))],
            success_data: vec![OnyxUpdate::merge(OnyxKey::Report("1".into()), json!({}))],
            failure_data: vec![OnyxUpdate::clear(OnyxKey::Transaction("9".into()))],
        };
        assert_eq!(data.untracked_keys(), vec![OnyxKey::Transaction("9".into())]);
    }
}
