//! Smoke Screen Unit tests for the IOU engine components
//!
//! These tests are unit tests that span the codebase, testing behavior in
//! isolation from the end to end scenarios. They are intended as a smoke
//! screen and mostly cover the happy path.
//!
#![allow(unused_imports)]

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

use iou_engine::{
    onyx::{Collection, OnyxData, OnyxKey, OnyxUpdate, apply_merge, merge_value, revert_patch},
    report::{Report, ReportType, update_iou_owner_and_total},
    split::{calculate_amount, remaining_split_shares, split_shares_patch},
    store::{KeyValueStore, MemoryStore, StoreExt},
    transaction::{SplitShare, Transaction},
    types::{OptimisticClock, StatusNum, TransactionRef},
    utils::{format_amount, generate_id, idempotency_key},
};

// UTILS MODULE TESTS
#[cfg(test)]
mod utils_tests {
    use super::*;

    /// Ids are numeric strings and never repeat
    #[test]
    fn generates_unique_numeric_ids() {
        let ids: Vec<String> = (0..50).map(|_| generate_id()).collect();
        for id in &ids {
            assert!(id.parse::<i64>().is_ok());
        }
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
    }

    /// Retries of the same write hash to the same key
    #[test]
    fn idempotency_keys_follow_the_params() {
        let params = json!({"reportID": "1", "amount": 100});
        assert_eq!(idempotency_key("PayMoneyRequest", &params), idempotency_key("PayMoneyRequest", &params));
        assert_ne!(
            idempotency_key("PayMoneyRequest", &params),
            idempotency_key("PayInvoice", &params)
        );
    }

    #[test]
    fn zero_decimal_currencies_drop_the_cents() {
        assert_eq!(format_amount(12_345, "JPY"), "¥123");
        assert_eq!(format_amount(12_345, "USD"), "$123.45");
    }
}

// ONYX MODULE TESTS
#[cfg(test)]
mod onyx_tests {
    use super::*;

    /// Keys print with their collection prefix and parse back
    #[test]
    fn keys_round_trip_through_strings() {
        let keys = [
            OnyxKey::Report("42".into()),
            OnyxKey::ReportActions("42".into()),
            OnyxKey::TransactionDraft(TransactionRef::Draft),
            OnyxKey::PolicyTags("p1".into()),
            OnyxKey::Session,
        ];
        for key in keys {
            let parsed: OnyxKey = key.to_string().parse().unwrap();
            assert_eq!(parsed, key);
        }
    }

    /// Unknown prefixes are rejected instead of landing in a random collection
    #[test]
    fn rejects_unknown_keys() {
        assert!("nothing_1".parse::<OnyxKey>().is_err());
        assert!("report_".parse::<OnyxKey>().is_err());
    }

    /// A null member deletes the key, arrays are replaced wholesale
    #[test]
    fn merge_semantics() {
        let mut stored = json!({"a": 1, "b": {"c": 2, "d": 3}, "list": [1, 2, 3]});
        merge_value(&mut stored, &json!({"a": null, "b": {"c": null}, "list": [9]}));
        assert_eq!(stored, json!({"b": {"d": 3}, "list": [9]}));
    }

    #[test]
    fn merging_null_removes_the_value() {
        assert_eq!(apply_merge(Some(json!({"a": 1})), &Value::Null), None);
        assert_eq!(apply_merge(None, &json!({"a": 1, "b": null})), Some(json!({"a": 1})));
    }

    /// Applying the revert patch gives back the snapshot
    #[test]
    fn revert_patch_restores_the_snapshot() {
        let snapshot = json!({"total": 100, "nested": {"x": 1}});
        let current = json!({"total": 250, "nested": {"x": 1, "y": 2}, "extra": true});
        let mut restored = current.clone();
        merge_value(&mut restored, &revert_patch(&current, &snapshot));
        assert_eq!(restored, snapshot);
    }

    /// Failure lists may only touch keys the optimistic list touched
    #[test]
    fn untracked_keys_are_detected() {
        let mut data = OnyxData::new();
        data.optimistic_data
            .push(OnyxUpdate::merge(OnyxKey::Report("1".into()), json!({"total": 1})));
        data.failure_data
            .push(OnyxUpdate::clear(OnyxKey::Transaction("9".into())));
        assert_eq!(data.untracked_keys(), vec![OnyxKey::Transaction("9".into())]);
    }
}

// STORE MODULE TESTS
#[cfg(test)]
mod store_tests {
    use super::*;
    use parking_lot::Mutex;

    /// Subscribers see every change of the collection they listen to
    #[test]
    fn collection_subscribers_are_notified() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(
            iou_engine::onyx::KeyPattern::Collection(Collection::Report),
            Arc::new(move |key, _| sink.lock().push(key.to_string())),
        );

        store.set(&OnyxKey::Report("1".into()), Some(json!({"reportID": "1"})))?;
        store.merge(&OnyxKey::Report("1".into()), json!({"total": 5}))?;
        store.set(&OnyxKey::Transaction("1".into()), Some(json!({"transactionID": "1"})))?;

        assert_eq!(*seen.lock(), vec!["report_1".to_string(), "report_1".to_string()]);
        Ok(())
    }

    #[test]
    fn typed_reads_decode_the_document() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.set(
            &OnyxKey::Report("7".into()),
            Some(json!({"reportID": "7", "type": "iou", "total": 300, "currency": "USD"})),
        )?;
        let report: Report = store.get_as(&OnyxKey::Report("7".into()))?.unwrap();
        assert_eq!(report.report_type, ReportType::Iou);
        assert_eq!(report.total(), 300);
        Ok(())
    }
}

// REPORT MODULE TESTS
#[cfg(test)]
mod report_tests {
    use super::*;

    fn iou(total: i64) -> Report {
        Report {
            report_id: "r".into(),
            report_type: ReportType::Iou,
            owner_account_id: Some(1),
            manager_id: Some(2),
            currency: Some("USD".into()),
            total: Some(total),
            ..Default::default()
        }
    }

    /// The owner adding to the report grows the total
    #[test]
    fn owner_requests_add_to_the_total() {
        let updated = update_iou_owner_and_total(&iou(500), 1, 300, "USD", false);
        assert_eq!(updated.total(), 800);
        assert_eq!(updated.owner_account_id, Some(1));
    }

    /// When the other side ends up owing more, owner and manager trade places
    #[test]
    fn negative_totals_flip_the_owner() {
        let updated = update_iou_owner_and_total(&iou(500), 2, 800, "USD", false);
        assert_eq!(updated.total(), 300);
        assert_eq!(updated.owner_account_id, Some(2));
        assert_eq!(updated.manager_id, Some(1));
    }

    #[test]
    fn other_currencies_leave_the_total() {
        let updated = update_iou_owner_and_total(&iou(500), 1, 300, "EUR", false);
        assert_eq!(updated, iou(500));
    }
}

// SPLIT MODULE TESTS
#[cfg(test)]
mod split_tests {
    use super::*;

    /// The payer absorbs the rounding remainder
    #[test]
    fn payer_takes_the_remainder() {
        assert_eq!(calculate_amount(2, 100, "USD", false), 33);
        assert_eq!(calculate_amount(2, 100, "USD", true), 34);
    }

    /// Currencies without minor units split in whole units
    #[test]
    fn zero_decimal_shares_are_whole() {
        let share = calculate_amount(2, 1000, "JPY", false);
        assert_eq!(share % 100, 0);
        assert_eq!(calculate_amount(2, 1000, "JPY", true) + 2 * share, 1000);
    }

    /// Small whole-unit totals round the others up and leave the payer short
    #[test]
    fn zero_decimal_payer_share_can_go_negative() {
        assert_eq!(calculate_amount(2, 150, "JPY", false), 100);
        assert_eq!(calculate_amount(2, 150, "JPY", true), -50);
    }

    /// Hand-entered shares are kept, the rest share what is left
    #[test]
    fn redistributes_around_modified_shares() {
        let mut shares = BTreeMap::new();
        shares.insert("1".to_string(), SplitShare { amount: 0, is_modified: false });
        shares.insert("2".to_string(), SplitShare { amount: 600, is_modified: true });
        shares.insert("3".to_string(), SplitShare { amount: 0, is_modified: false });
        let transaction = Transaction {
            transaction_id: "1".into(),
            amount: 1000,
            currency: "USD".into(),
            split_shares: shares,
            ..Default::default()
        };

        let remaining = remaining_split_shares(&transaction).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining.values().sum::<i64>(), 400);
    }

    /// People dropped from the split get a null share so the merge removes them
    #[test]
    fn dropped_people_are_nulled() {
        let mut existing = BTreeMap::new();
        existing.insert("9".to_string(), SplitShare { amount: 50, is_modified: false });
        let patch = split_shares_patch(&existing, 1, 100, "USD", &[1, 2]);
        assert!(patch["9"].is_null());
        assert_eq!(patch["1"]["amount"].as_i64().unwrap() + patch["2"]["amount"].as_i64().unwrap(), 100);
    }
}

// TYPES MODULE TESTS
#[cfg(test)]
mod types_tests {
    use super::*;

    /// Created stamps keep sorting in call order
    #[test]
    fn optimistic_timestamps_are_ordered() {
        let clock = OptimisticClock::new();
        let stamps: Vec<String> = (0..20).map(|_| clock.db_time()).collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);
    }

    #[test]
    fn the_draft_has_a_reserved_id() {
        assert_eq!(TransactionRef::from_id("1"), TransactionRef::Draft);
        assert_eq!(TransactionRef::from_id("55"), TransactionRef::Persisted("55".into()));
    }
}
