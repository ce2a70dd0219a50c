//! Property-based tests for split arithmetic and report totals
//!
//! Shares of a split, redistributed shares and signed report totals have to
//! hold their invariants for every amount and participant count, not just the
//! handful of cases the unit tests pick.

use proptest::prelude::*;
use std::collections::BTreeMap;

use iou_engine::report::{Report, ReportType, add_to_expense_total, update_iou_owner_and_total};
use iou_engine::split::{calculate_amount, remaining_split_shares};
use iou_engine::transaction::{SplitShare, Transaction};
use iou_engine::utils::currency_decimals;

// PROPERTY TEST STRATEGIES

/// Strategy to generate a currency, with and without minor units
fn currency_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["USD", "EUR", "GBP", "JPY", "CAD"])
}

/// Strategy to generate a positive amount in minor units
fn amount_strategy() -> impl Strategy<Value = i64> {
    1i64..=10_000_000
}

/// Strategy to generate split shares where some were typed in by hand. The
/// hand-entered amounts never exceed the total.
fn modified_shares_strategy() -> impl Strategy<Value = (i64, BTreeMap<String, SplitShare>)> {
    (amount_strategy(), 2usize..8).prop_flat_map(|(total, people)| {
        prop::collection::vec((prop::bool::ANY, 0u32..=100), people).prop_map(move |picks| {
            let mut budget = total;
            let mut shares = BTreeMap::new();
            for (index, (modified, percent)) in picks.into_iter().enumerate() {
                let amount = if modified { budget * i64::from(percent) / 100 } else { 0 };
                if modified {
                    budget -= amount;
                }
                shares.insert(
                    (index as i64 + 1).to_string(),
                    SplitShare {
                        amount,
                        is_modified: modified,
                    },
                );
            }
            (total, shares)
        })
    })
}

fn expense_report(total: i64, currency: &str) -> Report {
    Report {
        report_id: "expense".into(),
        report_type: ReportType::Expense,
        currency: Some(currency.into()),
        total: Some(total),
        ..Default::default()
    }
}

fn iou_report(total: i64) -> Report {
    Report {
        report_id: "iou".into(),
        report_type: ReportType::Iou,
        owner_account_id: Some(1),
        manager_id: Some(2),
        currency: Some("USD".into()),
        total: Some(total),
        ..Default::default()
    }
}

proptest! {
    /// Every share of a split adds back up to the total, whatever the rounding
    #[test]
    fn split_shares_sum_to_the_total(
        total in amount_strategy(),
        others in 1usize..20,
        currency in currency_strategy(),
    ) {
        let payer = calculate_amount(others, total, currency, true);
        let each = calculate_amount(others, total, currency, false);
        prop_assert_eq!(payer + each * others as i64, total);
    }

    /// The payer's share stays within a rounding step per person of the others.
    /// Without minor units the step is a whole unit, so small totals can leave
    /// the payer with a negative share.
    #[test]
    fn payer_share_stays_close(
        total in amount_strategy(),
        others in 1usize..20,
        currency in currency_strategy(),
    ) {
        let unit = 10i64.pow(2 - currency_decimals(currency));
        let payer = calculate_amount(others, total, currency, true);
        let each = calculate_amount(others, total, currency, false);
        prop_assert_eq!(each % unit, 0);
        prop_assert!((payer - each).abs() <= (others as i64 + 1) * unit);
    }

    /// Redistribution leaves hand-entered shares alone and fills the remainder exactly
    #[test]
    fn redistributed_shares_fill_the_remainder((total, shares) in modified_shares_strategy()) {
        let modified_total: i64 = shares.values().filter(|s| s.is_modified).map(|s| s.amount).sum();
        let unmodified = shares.values().filter(|s| !s.is_modified).count();
        let transaction = Transaction {
            transaction_id: "split".into(),
            amount: total,
            currency: "USD".into(),
            split_shares: shares.clone(),
            ..Default::default()
        };

        match remaining_split_shares(&transaction) {
            None => prop_assert!(shares.values().all(|s| !s.is_modified)),
            Some(remaining) => {
                prop_assert_eq!(remaining.len(), unmodified);
                if unmodified > 0 {
                    prop_assert_eq!(remaining.values().sum::<i64>() + modified_total, total);
                }
                for id in remaining.keys() {
                    prop_assert!(!shares[&id.to_string()].is_modified);
                }
            }
        }
    }

    /// Expense reports hold negative totals, so adding spend moves them down
    #[test]
    fn expense_totals_grow_negative(
        start in -1_000_000i64..=0,
        amount in amount_strategy(),
        reimbursable in prop::bool::ANY,
    ) {
        let updated = add_to_expense_total(&expense_report(start, "USD"), amount, "USD", reimbursable);
        prop_assert_eq!(updated.total(), start - amount);
        prop_assert!(updated.total() < 0);
        if reimbursable {
            prop_assert_eq!(updated.non_reimbursable_total(), 0);
        } else {
            prop_assert_eq!(updated.non_reimbursable_total(), -amount);
        }
    }

    /// IOU totals stay positive: the owner flips instead of the sign
    #[test]
    fn iou_totals_never_go_negative(
        start in 0i64..=1_000_000,
        amount in amount_strategy(),
        owner_acts in prop::bool::ANY,
    ) {
        let actor = if owner_acts { 1 } else { 2 };
        let before = iou_report(start);
        let updated = update_iou_owner_and_total(&before, actor, amount, "USD", false);
        prop_assert!(updated.total() >= 0);

        let signed_before = start;
        let signed_after = if updated.owner_account_id == Some(1) { updated.total() } else { -updated.total() };
        let expected = if owner_acts { signed_before + amount } else { signed_before - amount };
        prop_assert_eq!(signed_after, expected);
    }
}
