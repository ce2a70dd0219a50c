//! Editing an existing expense: field updates, hold/unhold and receipts
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::assembler::{actions_patch, error_map, push_recently_used};
use crate::builder;
use crate::context::EngineContext;
use crate::error::ErrorMessage;
use crate::network::{WriteCommand, WriteRequest};
use crate::onyx::{OnyxData, OnyxKey, OnyxUpdate, to_json};
use crate::report::{self, Report};
use crate::report_action::ReportAction;
use crate::request::{distance_amount, distance_merchant};
use crate::transaction::{Receipt, ReceiptState, Transaction, TransactionChanges, get_updated_transaction};
use crate::types::{PendingAction, TransactionRef};
use crate::violations;

/// Merchant shown while the server measures a new route.
const PENDING_MERCHANT: &str = "Pending...";

/// How much an edit moves the money report's total, in report-side sign.
///
/// Only amounts in the report's currency count. Moving into the report
/// currency adds the whole new amount and moving out of it removes the whole
/// old amount. When neither side is in the report currency the server
/// reconciles after conversion, so the delta is zero.
pub fn calculate_diff_amount(report: Option<&Report>, updated: &Transaction, current: &Transaction) -> i64 {
    let Some(report) = report else {
        return 0;
    };
    let is_expense = report.is_expense_report();
    let report_currency = report.currency();
    let updated_currency = updated.display_currency();
    let current_currency = current.display_currency();
    let updated_amount = updated.display_amount(is_expense);
    let current_amount = current.display_amount(is_expense);

    match (updated_currency == report_currency, current_currency == report_currency) {
        (true, false) => updated_amount,
        (false, true) => -current_amount,
        (true, true) => updated_amount - current_amount,
        (false, false) => {
            debug!(
                updated_currency,
                current_currency, report_currency, "edit between foreign currencies leaves the total alone"
            );
            0
        }
    }
}

/// Command name for an edit, the narrowest one covering every changed field.
pub fn update_command(changes: &TransactionChanges) -> WriteCommand {
    if changes.waypoints.is_some() {
        return WriteCommand::UpdateMoneyRequestDistance;
    }
    let fields = changes.changed_fields();
    match fields.as_slice() {
        ["amount"] | ["currency"] | ["amount", "currency"] => WriteCommand::UpdateMoneyRequestAmountAndCurrency,
        ["created"] => WriteCommand::UpdateMoneyRequestDate,
        ["merchant"] => WriteCommand::UpdateMoneyRequestMerchant,
        ["comment"] => WriteCommand::UpdateMoneyRequestDescription,
        ["category"] => WriteCommand::UpdateMoneyRequestCategory,
        ["tag"] => WriteCommand::UpdateMoneyRequestTag,
        ["billable"] => WriteCommand::UpdateMoneyRequestBillable,
        ["taxAmount"] => WriteCommand::UpdateMoneyRequestTaxAmount,
        ["taxCode"] | ["taxCode", "taxAmount"] => WriteCommand::UpdateMoneyRequestTaxRate,
        _ => WriteCommand::UpdateMoneyRequest,
    }
}

/// Wire fields describing a transaction as it reads after an edit.
fn transaction_details(transaction: &Transaction, is_expense: bool) -> Map<String, Value> {
    let waypoints = transaction
        .modified_waypoints
        .as_ref()
        .or(transaction.comment.waypoints.as_ref())
        .map(|waypoints| to_json(waypoints).to_string());
    let details = json!({
        "amount": transaction.display_amount(is_expense),
        "currency": transaction.display_currency(),
        "created": transaction.display_created(),
        "merchant": transaction.display_merchant(),
        "comment": transaction.description(),
        "category": transaction.category,
        "tag": transaction.tag,
        "billable": transaction.billable,
        "taxCode": transaction.tax_code,
        "taxAmount": transaction.tax_amount.map(i64::abs),
        "waypoints": waypoints,
    });
    match details {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Recomputes a distance expense for a new route. Without a measured
/// distance the amount is zeroed until the server answers.
fn with_updated_route(
    ctx: &EngineContext,
    transaction: &Transaction,
    mut updated: Transaction,
    changes: &TransactionChanges,
    money_report: Option<&Report>,
) -> Transaction {
    let policy = ctx.policy(money_report.and_then(|r| r.policy_id.as_deref()));
    let rate_id = transaction
        .comment
        .custom_unit
        .as_ref()
        .and_then(|unit| unit.custom_unit_rate_id.clone())
        .or_else(|| policy.as_ref().and_then(|p| p.default_mileage_rate_id().map(str::to_string)));
    let rate = rate_id.and_then(|id| policy.as_ref().and_then(|p| p.mileage_rate(&id).cloned()));

    let (amount, merchant) = match (changes.distance, rate) {
        (Some(distance), Some(rate)) => {
            if let Some(unit) = updated.comment.custom_unit.as_mut() {
                unit.quantity = Some(distance);
            }
            (distance_amount(distance, &rate), distance_merchant(distance, &rate))
        }
        _ => (0, PENDING_MERCHANT.to_string()),
    };
    let signed = if money_report.is_some_and(Report::is_expense_report) {
        -amount
    } else {
        amount
    };
    updated.amount = signed;
    updated.modified_amount = Some(signed);
    updated.modified_merchant = Some(merchant);
    updated
}

/// The IOU action a transaction thread hangs off, looked up in the thread's parent report.
pub fn parent_iou_action(ctx: &EngineContext, thread: &Report) -> anyhow::Result<Option<ReportAction>> {
    match (&thread.parent_report_id, &thread.parent_report_action_id) {
        (Some(report_id), Some(action_id)) => ctx.report_action(report_id, action_id),
        _ => Ok(None),
    }
}

/// Builds the edit of `transaction_id` seen from its thread
/// `transaction_thread_report_id`. `None` when either is missing.
pub fn get_update_money_request_params(
    ctx: &EngineContext,
    transaction_id: &str,
    transaction_thread_report_id: &str,
    changes: &TransactionChanges,
) -> anyhow::Result<Option<WriteRequest>> {
    // Load everything the edit touches
    let Some(transaction) = ctx.transaction(transaction_id)? else {
        warn!(%transaction_id, "edited transaction is missing");
        return Ok(None);
    };
    let Some(thread) = ctx.report(transaction_thread_report_id)? else {
        warn!(%transaction_thread_report_id, "transaction thread is missing");
        return Ok(None);
    };
    let parent_report_id = thread.parent_report_id.clone().unwrap_or_default();
    let money_report = ctx
        .report(&parent_report_id)?
        .filter(Report::is_money_request_report);
    let is_expense = money_report.as_ref().is_some_and(Report::is_expense_report);
    let policy_ctx = ctx.policy_context(money_report.as_ref().and_then(|r| r.policy_id.as_deref()))?;
    let current = ctx.current_account_id();
    // totals move on behalf of whoever made the request, not whoever edits it
    let request_actor = parent_iou_action(ctx, &thread)?
        .and_then(|action| action.actor_account_id)
        .unwrap_or(current);
    let error_key = ctx.clock.error_key();
    let is_scanning = transaction.has_receipt() && transaction.is_receipt_being_scanned();
    let has_pending_waypoints = changes.waypoints.is_some();

    let mut updated = get_updated_transaction(&transaction, changes, is_expense);
    if has_pending_waypoints {
        updated = with_updated_route(ctx, &transaction, updated, changes, money_report.as_ref());
    }

    let mut data = OnyxData::new();
    let transaction_key = OnyxKey::Transaction(transaction_id.to_string());
    let thread_key = OnyxKey::Report(thread.report_id.clone());
    let thread_actions_key = OnyxKey::ReportActions(thread.report_id.clone());

    // Wire params
    let mut params = transaction_details(&updated, is_expense);
    if !has_pending_waypoints {
        let changed = changes.changed_fields();
        params.retain(|field, _| changed.contains(&field.as_str()));
    }
    params.insert("reportID".into(), json!(parent_report_id));
    params.insert("transactionID".into(), json!(transaction_id));

    if has_pending_waypoints {
        // the route is measured on the draft copy, drop it once the server agrees
        data.success_data.push(OnyxUpdate::clear(OnyxKey::TransactionDraft(
            TransactionRef::Persisted(transaction_id.to_string()),
        )));
    } else {
        // The modified expense action; route edits get theirs from the server
        let action = builder::build_optimistic_modified_expense_action(
            &transaction,
            changes,
            is_expense,
            current,
            &ctx.clock,
        );
        params.insert("reportActionID".into(), json!(action.report_action_id));
        data.optimistic_data.push(OnyxUpdate::merge(
            thread_actions_key.clone(),
            actions_patch(vec![(action.report_action_id.clone(), to_json(&action))]),
        ));
        data.optimistic_data.push(OnyxUpdate::merge(
            thread_key.clone(),
            json!({
                "lastVisibleActionCreated": action.created,
                "lastReadTime": action.created,
            }),
        ));
        data.success_data.push(OnyxUpdate::merge(
            thread_actions_key.clone(),
            actions_patch(vec![(action.report_action_id.clone(), json!({"pendingAction": null}))]),
        ));
        let mut failed = to_json(&action);
        if let Value::Object(map) = &mut failed {
            map.insert("errors".into(), error_map(&error_key, ErrorMessage::GenericEditFailure));
        }
        data.failure_data.push(OnyxUpdate::merge(
            thread_actions_key,
            actions_patch(vec![(action.report_action_id.clone(), failed)]),
        ));
    }

    // Report total
    if let Some(money_report) = &money_report {
        let diff = calculate_diff_amount(Some(money_report), &updated, &transaction);
        let mut updated_report = if money_report.uses_negative_totals() {
            let mut report = money_report.clone();
            report.total = Some(money_report.total() - diff);
            if !transaction.is_reimbursable() {
                report.non_reimbursable_total = Some(money_report.non_reimbursable_total() - diff);
            }
            report
        } else {
            // the delta is already in the report's currency
            report::update_iou_owner_and_total(money_report, request_actor, diff, money_report.currency(), false)
        };
        updated_report.refresh_cached_total();
        let report_key = OnyxKey::Report(money_report.report_id.clone());
        data.optimistic_data
            .push(OnyxUpdate::merge(report_key.clone(), to_json(&updated_report)));
        if let Some(chat_id) = &money_report.chat_report_id {
            data.optimistic_data.push(OnyxUpdate::merge(
                OnyxKey::Report(chat_id.clone()),
                json!({
                    "hasOutstandingChildRequest": report::outstanding_child_request(&updated_report, current),
                }),
            ));
            if let Some(chat) = ctx.report(chat_id)? {
                data.failure_data
                    .push(OnyxUpdate::set(OnyxKey::Report(chat_id.clone()), to_json(&chat)));
            }
        }
        data.success_data
            .push(OnyxUpdate::merge(report_key.clone(), json!({"pendingAction": null})));
        data.failure_data
            .push(OnyxUpdate::set(report_key, to_json(money_report)));

        // a manual amount ends the scan, so the preview stops being a private whisper
        if is_scanning && changes.changes_amount_or_currency() {
            push_unwhisper(ctx, &mut data, money_report, thread.parent_report_action_id.as_deref())?;
        }
    }

    // Transaction and thread
    let mut optimistic = to_json(&updated);
    if let Value::Object(map) = &mut optimistic {
        map.insert("isLoading".into(), json!(has_pending_waypoints));
        map.insert("errorFields".into(), Value::Null);
    }
    data.optimistic_data
        .push(OnyxUpdate::merge(transaction_key.clone(), optimistic));
    data.optimistic_data
        .push(OnyxUpdate::merge(thread_key.clone(), json!({"lastActorAccountID": current})));

    let cleared: Map<String, Value> = changes
        .changed_fields()
        .into_iter()
        .map(|field| (field.to_string(), Value::Null))
        .collect();
    data.success_data.push(OnyxUpdate::merge(
        transaction_key.clone(),
        json!({"pendingFields": cleared, "isLoading": false, "errorFields": null}),
    ));
    let mut failed = to_json(&transaction);
    if let Value::Object(map) = &mut failed {
        let error_fields: Map<String, Value> = changes
            .changed_fields()
            .into_iter()
            .map(|field| (field.to_string(), error_map(&error_key, ErrorMessage::GenericEditFailure)))
            .collect();
        map.insert("errorFields".into(), Value::Object(error_fields));
    }
    data.failure_data.push(OnyxUpdate::set(transaction_key, failed));
    data.failure_data.push(OnyxUpdate::set(thread_key, to_json(&thread)));

    if changes.category.is_some() || changes.tag.is_some() {
        let used = Transaction {
            category: changes.category.clone(),
            tag: changes.tag.clone(),
            ..Default::default()
        };
        push_recently_used(&mut data, &policy_ctx, &used);

        if let Some(policy) = policy_ctx.policy.as_ref() {
            if violations::should_compute(Some(policy), ctx.config.violations_enabled) {
                let existing = ctx.violations(transaction_id)?;
                data.optimistic_data.push(violations::get_violations_onyx_data(
                    &updated,
                    &existing,
                    policy,
                    &policy_ctx.categories,
                    &policy_ctx.tag_lists,
                ));
                data.failure_data.push(OnyxUpdate::set(
                    OnyxKey::TransactionViolations(transaction_id.to_string()),
                    to_json(&existing),
                ));
            }
        }
    }

    debug!(%transaction_id, fields = ?changes.changed_fields(), "built expense edit");
    Ok(Some(WriteRequest::new(update_command(changes), Value::Object(params), data)))
}

/// Makes the IOU action and the report preview of a scanned expense visible to everyone.
fn push_unwhisper(
    ctx: &EngineContext,
    data: &mut OnyxData,
    money_report: &Report,
    iou_action_id: Option<&str>,
) -> anyhow::Result<()> {
    let mut targets: Vec<(String, Option<ReportAction>)> = Vec::new();
    if let Some(action_id) = iou_action_id {
        targets.push((
            money_report.report_id.clone(),
            ctx.report_action(&money_report.report_id, action_id)?,
        ));
    }
    if let (Some(chat_id), Some(preview_id)) = (&money_report.chat_report_id, &money_report.parent_report_action_id) {
        targets.push((chat_id.clone(), ctx.report_action(chat_id, preview_id)?));
    }
    for (report_id, action) in targets {
        let Some(action) = action else {
            continue;
        };
        let key = OnyxKey::ReportActions(report_id);
        data.optimistic_data.push(OnyxUpdate::merge(
            key.clone(),
            actions_patch(vec![(action.report_action_id.clone(), json!({"whisperedToAccountIDs": []}))]),
        ));
        data.failure_data.push(OnyxUpdate::merge(
            key,
            actions_patch(vec![(
                action.report_action_id.clone(),
                json!({"whisperedToAccountIDs": action.whispered_to_account_ids}),
            )]),
        ));
    }
    Ok(())
}

/// HOLD action plus the reason as a comment on the transaction thread `report_id`.
pub fn put_on_hold(
    ctx: &EngineContext,
    transaction_id: &str,
    comment: &str,
    report_id: &str,
) -> anyhow::Result<Option<WriteRequest>> {
    if ctx.transaction(transaction_id)?.is_none() {
        warn!(%transaction_id, "cannot hold a missing transaction");
        return Ok(None);
    }
    let actor = ctx.current_account_id();
    let error_key = ctx.clock.error_key();
    // the comment has to sort after the HOLD action
    let hold_action = builder::build_optimistic_hold_action(actor, &ctx.clock);
    let comment_action = builder::build_optimistic_add_comment_action(comment, actor, &ctx.clock);
    let actions_key = OnyxKey::ReportActions(report_id.to_string());
    let transaction_key = OnyxKey::Transaction(transaction_id.to_string());

    let mut data = OnyxData::new();
    data.optimistic_data.push(OnyxUpdate::merge(
        actions_key.clone(),
        actions_patch(vec![
            (hold_action.report_action_id.clone(), to_json(&hold_action)),
            (comment_action.report_action_id.clone(), to_json(&comment_action)),
        ]),
    ));
    data.optimistic_data.push(OnyxUpdate::merge(
        transaction_key.clone(),
        json!({
            "pendingAction": PendingAction::Update,
            "comment": {"hold": hold_action.report_action_id},
        }),
    ));

    data.success_data.push(OnyxUpdate::merge(
        actions_key.clone(),
        actions_patch(vec![
            (hold_action.report_action_id.clone(), json!({"pendingAction": null})),
            (comment_action.report_action_id.clone(), json!({"pendingAction": null})),
        ]),
    ));
    data.success_data
        .push(OnyxUpdate::merge(transaction_key.clone(), json!({"pendingAction": null})));

    let failed = json!({"errors": error_map(&error_key, ErrorMessage::GenericHoldFailure)});
    data.failure_data.push(OnyxUpdate::merge(
        actions_key,
        actions_patch(vec![
            (hold_action.report_action_id.clone(), failed.clone()),
            (comment_action.report_action_id.clone(), failed),
        ]),
    ));
    data.failure_data.push(OnyxUpdate::merge(
        transaction_key,
        json!({
            "pendingAction": null,
            "comment": {"hold": null},
            "errors": error_map(&error_key, ErrorMessage::GenericHoldFailure),
        }),
    ));

    let params = json!({
        "transactionID": transaction_id,
        "comment": comment,
        "reportActionID": hold_action.report_action_id,
        "commentReportActionID": comment_action.report_action_id,
    });
    Ok(Some(WriteRequest::new(WriteCommand::HoldRequest, params, data)))
}

pub fn unhold_request(
    ctx: &EngineContext,
    transaction_id: &str,
    report_id: &str,
) -> anyhow::Result<Option<WriteRequest>> {
    let Some(transaction) = ctx.transaction(transaction_id)? else {
        warn!(%transaction_id, "cannot unhold a missing transaction");
        return Ok(None);
    };
    let actor = ctx.current_account_id();
    let error_key = ctx.clock.error_key();
    let unhold_action = builder::build_optimistic_unhold_action(actor, &ctx.clock);
    let actions_key = OnyxKey::ReportActions(report_id.to_string());
    let transaction_key = OnyxKey::Transaction(transaction_id.to_string());

    let mut data = OnyxData::new();
    data.optimistic_data.push(OnyxUpdate::merge(
        actions_key.clone(),
        actions_patch(vec![(unhold_action.report_action_id.clone(), to_json(&unhold_action))]),
    ));
    data.optimistic_data.push(OnyxUpdate::merge(
        transaction_key.clone(),
        json!({"pendingAction": PendingAction::Update, "comment": {"hold": null}}),
    ));

    data.success_data.push(OnyxUpdate::merge(
        actions_key.clone(),
        actions_patch(vec![(unhold_action.report_action_id.clone(), json!({"pendingAction": null}))]),
    ));
    data.success_data.push(OnyxUpdate::merge(
        transaction_key.clone(),
        json!({"pendingAction": null, "comment": {"hold": null}}),
    ));

    data.failure_data.push(OnyxUpdate::merge(
        actions_key,
        actions_patch(vec![(
            unhold_action.report_action_id.clone(),
            json!({"errors": error_map(&error_key, ErrorMessage::GenericUnholdFailure)}),
        )]),
    ));
    data.failure_data.push(OnyxUpdate::merge(
        transaction_key,
        json!({
            "pendingAction": null,
            "comment": {"hold": transaction.comment.hold},
            "errors": error_map(&error_key, ErrorMessage::GenericUnholdFailure),
        }),
    ));

    let params = json!({
        "transactionID": transaction_id,
        "reportActionID": unhold_action.report_action_id,
    });
    Ok(Some(WriteRequest::new(WriteCommand::UnholdRequest, params, data)))
}

fn restored_with_error(transaction: &Transaction, error_key: &str, message: ErrorMessage) -> Value {
    let mut value = to_json(transaction);
    if let Value::Object(map) = &mut value {
        map.insert("errors".into(), error_map(error_key, message));
    }
    value
}

/// Swaps the receipt for a new file; the new one starts unscanned.
pub fn replace_receipt(
    ctx: &EngineContext,
    transaction_id: &str,
    source: &str,
    filename: &str,
) -> anyhow::Result<Option<WriteRequest>> {
    let Some(transaction) = ctx.transaction(transaction_id)? else {
        warn!(%transaction_id, "cannot replace the receipt of a missing transaction");
        return Ok(None);
    };
    let key = OnyxKey::Transaction(transaction_id.to_string());
    let receipt = Receipt {
        source: Some(source.to_string()),
        state: Some(ReceiptState::Open),
        filename: Some(filename.to_string()),
    };

    let mut data = OnyxData::new();
    data.optimistic_data.push(OnyxUpdate::merge(
        key.clone(),
        json!({"receipt": receipt, "filename": filename}),
    ));
    data.failure_data.push(OnyxUpdate::set(
        key,
        restored_with_error(&transaction, &ctx.clock.error_key(), ErrorMessage::ReceiptFailure),
    ));

    let params = json!({"transactionID": transaction_id, "receipt": source});
    Ok(Some(WriteRequest::new(WriteCommand::ReplaceReceipt, params, data)))
}

pub fn detach_receipt(ctx: &EngineContext, transaction_id: &str) -> anyhow::Result<Option<WriteRequest>> {
    let Some(transaction) = ctx.transaction(transaction_id)? else {
        warn!(%transaction_id, "cannot detach the receipt of a missing transaction");
        return Ok(None);
    };
    let key = OnyxKey::Transaction(transaction_id.to_string());
    let detached = Transaction {
        receipt: None,
        filename: None,
        ..transaction.clone()
    };

    let mut data = OnyxData::new();
    data.optimistic_data
        .push(OnyxUpdate::set(key.clone(), to_json(&detached)));
    data.failure_data.push(OnyxUpdate::set(
        key,
        restored_with_error(&transaction, &ctx.clock.error_key(), ErrorMessage::ReceiptDeleteFailure),
    ));

    let params = json!({"transactionID": transaction_id});
    Ok(Some(WriteRequest::new(WriteCommand::DetachReceipt, params, data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportType;

    fn report(kind: ReportType, currency: &str) -> Report {
        Report {
            report_id: "r".into(),
            report_type: kind,
            currency: Some(currency.into()),
            ..Default::default()
        }
    }

    fn transaction(amount: i64, currency: &str) -> Transaction {
        Transaction {
            amount,
            currency: currency.into(),
            ..Default::default()
        }
    }

    #[test]
    fn moving_into_the_report_currency_adds_the_whole_amount() {
        let iou = report(ReportType::Iou, "USD");
        let before = transaction(1000, "EUR");
        let after = transaction(1200, "USD");
        assert_eq!(calculate_diff_amount(Some(&iou), &after, &before), 1200);
        assert_eq!(calculate_diff_amount(Some(&iou), &before, &after), -1200);
    }

    #[test]
    fn same_currency_edits_move_by_the_difference() {
        let expense = report(ReportType::Expense, "USD");
        let before = transaction(-1000, "USD");
        let after = transaction(-1500, "USD");
        assert_eq!(calculate_diff_amount(Some(&expense), &after, &before), 500);
    }

    #[test]
    fn foreign_currency_edits_leave_the_total() {
        let iou = report(ReportType::Iou, "USD");
        assert_eq!(
            calculate_diff_amount(Some(&iou), &transaction(10, "EUR"), &transaction(20, "GBP")),
            0
        );
        assert_eq!(calculate_diff_amount(None, &transaction(10, "USD"), &transaction(20, "USD")), 0);
    }

    #[test]
    fn narrowest_command_is_picked() {
        let amount = TransactionChanges {
            amount: Some(1),
            ..Default::default()
        };
        assert_eq!(update_command(&amount), WriteCommand::UpdateMoneyRequestAmountAndCurrency);
        let mixed = TransactionChanges {
            amount: Some(1),
            merchant: Some("Cafe".into()),
            ..Default::default()
        };
        assert_eq!(update_command(&mixed), WriteCommand::UpdateMoneyRequest);
        let rate = TransactionChanges {
            tax_code: Some("id_TAX".into()),
            tax_amount: Some(5),
            ..Default::default()
        };
        assert_eq!(update_command(&rate), WriteCommand::UpdateMoneyRequestTaxRate);
    }
}
