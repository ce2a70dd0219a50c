//! Report lifecycle after creation: approve, unapprove, submit, pay, cancel.
//!
//! Every transition reads the money report fresh from the store and returns a
//! [`WriteRequest`], or `None` when the report is gone. Permission checks live
//! in [`can_approve_iou`] and [`can_iou_be_paid`] and are enforced by the
//! service before any patch is built.
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::assembler::{actions_patch, error_map};
use crate::builder;
use crate::context::EngineContext;
use crate::error::ErrorMessage;
use crate::network::{WriteCommand, WriteRequest};
use crate::next_step::build_next_step;
use crate::onyx::{OnyxData, OnyxKey, OnyxUpdate, to_json};
use crate::policy::{Policy, ReimbursementChoice};
use crate::report::{InvoiceReceiver, Report};
use crate::report_action::{IouActionType, ReportAction};
use crate::types::{AccountId, PaymentMethodType, PendingAction, StateNum, StatusNum};

/// Key used in the last payment method map for reports outside any workspace.
const PERSONAL_PAYMENT_KEY: &str = "-1";

/// Whether `current` pays `report` out of pocket.
fn is_payer(report: &Report, policy: Option<&Policy>, current: AccountId) -> bool {
    if report.is_expense_report() {
        return match policy {
            Some(policy) => policy.is_admin() && policy.reimburses(),
            None => report.manager_id == Some(current),
        };
    }
    report.manager_id == Some(current)
}

/// Small reports the workspace reimburses without anyone pressing pay.
fn can_be_auto_reimbursed(report: &Report, policy: Option<&Policy>) -> bool {
    let Some(policy) = policy else {
        return false;
    };
    report.is_expense_report()
        && policy.reimbursement_choice == Some(ReimbursementChoice::Yes)
        && policy
            .auto_reimbursement_limit
            .is_some_and(|limit| report.reimbursable_spend() <= limit)
}

pub fn can_approve_iou(
    iou_report: &Report,
    chat_report: Option<&Report>,
    policy: Option<&Policy>,
    current: AccountId,
) -> bool {
    let Some(chat_report) = chat_report else {
        return false;
    };
    if !chat_report.is_policy_expense_chat() || !policy.is_some_and(Policy::is_paid_group_policy) {
        return false;
    }
    if policy.is_some_and(|p| p.is_instant_submit_enabled() && p.is_submit_and_close()) {
        return false;
    }
    iou_report.manager_id == Some(current)
        && !iou_report.is_open_expense_report()
        && !iou_report.is_approved()
        && !iou_report.is_settled()
        && !iou_report.is_archived()
}

pub fn can_iou_be_paid(
    iou_report: &Report,
    chat_report: Option<&Report>,
    policy: Option<&Policy>,
    receiver_policy: Option<&Policy>,
    current: AccountId,
) -> bool {
    if policy.is_some_and(|p| p.reimbursement_choice == Some(ReimbursementChoice::No)) {
        return false;
    }
    if iou_report.is_invoice_report() {
        if iou_report.is_settled() {
            return false;
        }
        return match chat_report.and_then(|chat| chat.invoice_receiver.as_ref()) {
            Some(InvoiceReceiver::Individual { account_id }) => *account_id == current,
            Some(InvoiceReceiver::Policy { .. }) => receiver_policy.is_some_and(Policy::is_admin),
            None => false,
        };
    }
    let chat_archived = chat_report.is_some_and(Report::is_archived);
    let open_in_workspace = chat_report.is_some_and(Report::is_policy_expense_chat) && iou_report.is_open_expense_report();

    is_payer(iou_report, policy, current)
        && !open_in_workspace
        && !iou_report.is_settled()
        && !iou_report.is_waiting_on_bank_account.unwrap_or(false)
        && iou_report.reimbursable_spend() != 0
        && !chat_archived
        && !can_be_auto_reimbursed(iou_report, policy)
        && !can_approve_iou(iou_report, chat_report, policy, current)
}

/// Whether another report previewed in `chat_report` still waits on the current user.
fn has_iou_to_approve_or_pay(ctx: &EngineContext, chat_report: &Report, excluded_report_id: &str) -> anyhow::Result<bool> {
    let current = ctx.current_account_id();
    for action in ctx.report_actions(&chat_report.report_id)?.into_values() {
        let Some(report_id) = action.linked_report_id() else {
            continue;
        };
        if report_id == excluded_report_id {
            continue;
        }
        let Some(report) = ctx.report(&report_id)? else {
            continue;
        };
        let policy = ctx.policy(report.policy_id.as_deref());
        let receiver_policy = receiver_policy(ctx, chat_report);
        if can_iou_be_paid(&report, Some(chat_report), policy.as_ref(), receiver_policy.as_ref(), current)
            || can_approve_iou(&report, Some(chat_report), policy.as_ref(), current)
        {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(crate) fn receiver_policy(ctx: &EngineContext, chat_report: &Report) -> Option<Policy> {
    match &chat_report.invoice_receiver {
        Some(InvoiceReceiver::Policy { policy_id }) => ctx.policy(Some(policy_id)),
        _ => None,
    }
}

/// Report JSON for an optimistic merge, with the last message taken from `action`.
fn report_with_last_message(report: &Report, action: &ReportAction) -> Value {
    let mut updated = report.clone();
    updated.last_message_text = Some(action.text().to_string());
    updated.last_message_html = Some(action.html().to_string());
    to_json(&updated)
}

fn insert(value: &mut Value, field: &str, entry: Value) {
    if let Value::Object(map) = value {
        map.insert(field.to_string(), entry);
    }
}

/// SET back the next step as it was, or clear it when there was none.
fn restore_next_step(ctx: &EngineContext, report_id: &str) -> anyhow::Result<OnyxUpdate> {
    let key = OnyxKey::NextStep(report_id.to_string());
    Ok(match ctx.next_step(report_id)? {
        Some(step) => OnyxUpdate::set(key, to_json(&step)),
        None => OnyxUpdate::clear(key),
    })
}

/// Pushes the action ADD with its success and failure counterparts.
fn push_report_action(
    data: &mut OnyxData,
    report_id: &str,
    action: &ReportAction,
    error_key: &str,
    message: ErrorMessage,
) {
    let key = OnyxKey::ReportActions(report_id.to_string());
    data.optimistic_data.push(OnyxUpdate::merge(
        key.clone(),
        actions_patch(vec![(action.report_action_id.clone(), to_json(action))]),
    ));
    data.success_data.push(OnyxUpdate::merge(
        key.clone(),
        actions_patch(vec![(action.report_action_id.clone(), json!({"pendingAction": null}))]),
    ));
    data.failure_data.push(OnyxUpdate::merge(
        key,
        actions_patch(vec![(
            action.report_action_id.clone(),
            json!({"errors": error_map(error_key, message)}),
        )]),
    ));
}

fn load_money_report(ctx: &EngineContext, report_id: &str) -> anyhow::Result<Option<Report>> {
    let report = ctx.report(report_id)?.filter(|r| r.is_money_request_report() || r.is_invoice_report());
    if report.is_none() {
        warn!(%report_id, "money report is missing");
    }
    Ok(report)
}

/// Approves the expense report. With held expenses and `full == false` only
/// the unheld total is approved; `full` approves everything and lifts the holds.
pub fn approve_money_request(ctx: &EngineContext, report_id: &str, full: bool) -> anyhow::Result<Option<WriteRequest>> {
    let Some(report) = load_money_report(ctx, report_id)? else {
        return Ok(None);
    };
    let policy = ctx.policy(report.policy_id.as_deref());
    let chat = match &report.chat_report_id {
        Some(id) => ctx.report(id)?,
        None => None,
    };
    let current = ctx.current_account_id();
    let error_key = ctx.clock.error_key();
    let held = ctx.has_held_expenses(report_id)?;

    let mut total = report.total();
    if held && !full {
        if let Some(unheld) = report.unheld_total.filter(|t| *t != 0) {
            total = unheld;
        }
    }
    let action = builder::build_optimistic_approved_action(total, report.currency(), report_id, current, &ctx.clock);
    let mut approved = report.clone();
    approved.state_num = Some(StateNum::Approved);
    approved.status_num = Some(StatusNum::Approved);
    let next_step = build_next_step(&approved, policy.as_ref(), StatusNum::Approved);

    let mut data = OnyxData::new();
    let report_key = OnyxKey::Report(report_id.to_string());

    // Report, then its new action
    let mut optimistic = report_with_last_message(&approved, &action);
    insert(
        &mut optimistic,
        "pendingFields",
        json!({"partial": if full { Value::Null } else { json!(PendingAction::Update) }}),
    );
    data.optimistic_data.push(OnyxUpdate::merge(report_key.clone(), optimistic));
    push_report_action(&mut data, report_id, &action, &error_key, ErrorMessage::ApproveFailure);
    data.optimistic_data.push(OnyxUpdate::set(
        OnyxKey::NextStep(report_id.to_string()),
        to_json(&next_step),
    ));
    if let Some(chat) = &chat {
        let excluded = if full { report_id } else { "" };
        data.optimistic_data.push(OnyxUpdate::merge(
            OnyxKey::Report(chat.report_id.clone()),
            json!({"hasOutstandingChildRequest": has_iou_to_approve_or_pay(ctx, chat, excluded)?}),
        ));
        data.failure_data
            .push(OnyxUpdate::set(OnyxKey::Report(chat.report_id.clone()), to_json(chat)));
    }

    data.success_data
        .push(OnyxUpdate::merge(report_key.clone(), json!({"pendingFields": {"partial": null}})));
    data.failure_data.push(OnyxUpdate::set(report_key, to_json(&report)));
    data.failure_data.push(restore_next_step(ctx, report_id)?);

    // Approving everything lifts every hold
    if full && held {
        for transaction in ctx.transactions_for_report(report_id)?.iter().filter(|t| t.is_on_hold()) {
            let key = OnyxKey::Transaction(transaction.transaction_id.clone());
            data.optimistic_data
                .push(OnyxUpdate::merge(key.clone(), json!({"comment": {"hold": null}})));
            data.failure_data.push(OnyxUpdate::merge(
                key,
                json!({"comment": {"hold": transaction.comment.hold}}),
            ));
        }
    }

    debug!(%report_id, total, full, "approving report");
    let params = json!({
        "reportID": report_id,
        "approvedReportActionID": action.report_action_id,
        "full": full,
    });
    Ok(Some(WriteRequest::new(WriteCommand::ApproveMoneyRequest, params, data)))
}

/// Takes an approved expense report back to SUBMITTED.
pub fn unapprove_expense_report(ctx: &EngineContext, report_id: &str) -> anyhow::Result<Option<WriteRequest>> {
    let Some(report) = load_money_report(ctx, report_id)? else {
        return Ok(None);
    };
    let policy = ctx.policy(report.policy_id.as_deref());
    let error_key = ctx.clock.error_key();
    let action = builder::build_optimistic_unapproved_action(
        report.total(),
        report.currency(),
        report_id,
        ctx.current_account_id(),
        &ctx.clock,
    );
    let mut submitted = report.clone();
    submitted.state_num = Some(StateNum::Submitted);
    submitted.status_num = Some(StatusNum::Submitted);
    let next_step = build_next_step(&submitted, policy.as_ref(), StatusNum::Submitted);

    let mut data = OnyxData::new();
    let report_key = OnyxKey::Report(report_id.to_string());
    let mut optimistic = report_with_last_message(&submitted, &action);
    insert(&mut optimistic, "pendingFields", json!({"partial": PendingAction::Update}));
    data.optimistic_data.push(OnyxUpdate::merge(report_key.clone(), optimistic));
    push_report_action(&mut data, report_id, &action, &error_key, ErrorMessage::UnapproveFailure);
    data.optimistic_data.push(OnyxUpdate::set(
        OnyxKey::NextStep(report_id.to_string()),
        to_json(&next_step),
    ));

    data.success_data
        .push(OnyxUpdate::merge(report_key.clone(), json!({"pendingFields": {"partial": null}})));
    data.failure_data.push(OnyxUpdate::set(report_key, to_json(&report)));
    data.failure_data.push(restore_next_step(ctx, report_id)?);

    let params = json!({"reportID": report_id, "reportActionID": action.report_action_id});
    Ok(Some(WriteRequest::new(WriteCommand::UnapproveExpenseReport, params, data)))
}

/// Submits an open expense report. Submit-and-close workspaces close it
/// straight away and leave no SUBMITTED action.
pub fn submit_report(ctx: &EngineContext, report_id: &str) -> anyhow::Result<Option<WriteRequest>> {
    let Some(report) = load_money_report(ctx, report_id)? else {
        return Ok(None);
    };
    let policy = ctx.policy(report.policy_id.as_deref());
    let parent = match &report.parent_report_id {
        Some(id) => ctx.report(id)?,
        None => None,
    };
    let current = ctx.current_account_id();
    let error_key = ctx.clock.error_key();
    let submit_and_close = policy.as_ref().is_some_and(Policy::is_submit_and_close);
    let action = builder::build_optimistic_submitted_action(report.total(), report.currency(), report_id, current, &ctx.clock);

    let mut submitted = report.clone();
    let predicted = if submit_and_close {
        submitted.state_num = Some(StateNum::Approved);
        submitted.status_num = Some(StatusNum::Closed);
        StatusNum::Closed
    } else {
        submitted.state_num = Some(StateNum::Submitted);
        submitted.status_num = Some(StatusNum::Submitted);
        StatusNum::Submitted
    };
    let next_step = build_next_step(&submitted, policy.as_ref(), predicted);

    let mut data = OnyxData::new();
    let report_key = OnyxKey::Report(report_id.to_string());
    if submit_and_close {
        data.optimistic_data
            .push(OnyxUpdate::merge(report_key.clone(), to_json(&submitted)));
    } else {
        push_report_action(&mut data, report_id, &action, &error_key, ErrorMessage::SubmitFailure);
        data.optimistic_data.push(OnyxUpdate::merge(
            report_key.clone(),
            report_with_last_message(&submitted, &action),
        ));
    }
    data.optimistic_data.push(OnyxUpdate::set(
        OnyxKey::NextStep(report_id.to_string()),
        to_json(&next_step),
    ));
    if let Some(parent) = &parent {
        // a manager who force-submits is the next one to act
        data.optimistic_data.push(OnyxUpdate::merge(
            OnyxKey::Report(parent.report_id.clone()),
            json!({
                "hasOutstandingChildRequest": report.manager_id == Some(current),
                "iouReportID": null,
            }),
        ));
        data.failure_data
            .push(OnyxUpdate::set(OnyxKey::Report(parent.report_id.clone()), to_json(parent)));
    }

    let mut reopened = report.clone();
    reopened.state_num = Some(StateNum::Open);
    reopened.status_num = Some(StatusNum::Open);
    data.failure_data.push(OnyxUpdate::set(report_key, to_json(&reopened)));
    data.failure_data.push(restore_next_step(ctx, report_id)?);

    let manager = policy
        .as_ref()
        .and_then(Policy::submit_to_account_id)
        .or(report.manager_id);
    let params = json!({
        "reportID": report_id,
        "managerAccountID": manager,
        "reportActionID": action.report_action_id,
    });
    Ok(Some(WriteRequest::new(WriteCommand::SubmitReport, params, data)))
}

/// Undoes a payment. Where the report lands depends on how the workspace approves.
pub fn cancel_payment(ctx: &EngineContext, report_id: &str) -> anyhow::Result<Option<WriteRequest>> {
    let Some(report) = load_money_report(ctx, report_id)? else {
        return Ok(None);
    };
    let chat = match &report.chat_report_id {
        Some(id) => ctx.report(id)?,
        None => None,
    };
    let policy = ctx.policy(chat.as_ref().and_then(|c| c.policy_id.as_deref()).or(report.policy_id.as_deref()));
    let error_key = ctx.clock.error_key();
    let action = builder::build_optimistic_cancel_payment_action(
        -report.total(),
        report.currency(),
        report_id,
        ctx.current_account_id(),
        &ctx.clock,
    );

    let is_free = policy.as_ref().is_some_and(Policy::is_free_group_policy);
    let optional_approval = policy.as_ref().is_some_and(Policy::is_submit_and_close);
    let (state, status) = match (is_free, optional_approval) {
        (true, _) => (StateNum::Submitted, StatusNum::Submitted),
        (false, true) => (StateNum::Submitted, StatusNum::Closed),
        (false, false) => (StateNum::Approved, StatusNum::Approved),
    };
    let mut cancelled = report.clone();
    cancelled.state_num = Some(state);
    cancelled.status_num = Some(status);

    let mut data = OnyxData::new();
    let report_key = OnyxKey::Report(report_id.to_string());
    push_report_action(&mut data, report_id, &action, &error_key, ErrorMessage::CancelPaymentFailure);
    data.optimistic_data.push(OnyxUpdate::merge(
        report_key.clone(),
        report_with_last_message(&cancelled, &action),
    ));
    if !is_free {
        data.optimistic_data.push(OnyxUpdate::set(
            OnyxKey::NextStep(report_id.to_string()),
            to_json(&build_next_step(&cancelled, policy.as_ref(), status)),
        ));
    }

    let mut reimbursed = report.clone();
    reimbursed.status_num = Some(StatusNum::Reimbursed);
    data.failure_data.push(OnyxUpdate::set(report_key, to_json(&reimbursed)));
    if let Some(chat) = &chat {
        data.failure_data.push(OnyxUpdate::merge(
            OnyxKey::Report(chat.report_id.clone()),
            json!({"hasOutstandingChildRequest": true, "iouReportID": report_id}),
        ));
    }
    if !is_free {
        data.failure_data.push(OnyxUpdate::set(
            OnyxKey::NextStep(report_id.to_string()),
            to_json(&build_next_step(&report, policy.as_ref(), StatusNum::Reimbursed)),
        ));
    }

    let params = json!({
        "iouReportID": report_id,
        "chatReportID": report.chat_report_id,
        "managerAccountID": report.manager_id,
        "reportActionID": action.report_action_id,
    });
    Ok(Some(WriteRequest::new(WriteCommand::CancelPayment, params, data)))
}

/// Patches shared by every payment flow.
pub struct PaymentInformation {
    pub iou_report: Report,
    pub chat_report: Report,
    pub pay_action: ReportAction,
    /// Amount paid, always positive.
    pub amount: i64,
    pub onyx_data: OnyxData,
}

/// Builds the patches marking `iou_report_id` as paid by `payment_type`.
pub fn get_pay_money_request_information(
    ctx: &EngineContext,
    chat_report_id: &str,
    iou_report_id: &str,
    payment_type: PaymentMethodType,
    full: bool,
) -> anyhow::Result<Option<PaymentInformation>> {
    let Some(iou_report) = load_money_report(ctx, iou_report_id)? else {
        return Ok(None);
    };
    let Some(chat_report) = ctx.report(chat_report_id)? else {
        warn!(%chat_report_id, "chat for payment is missing");
        return Ok(None);
    };
    let policy = ctx.policy(iou_report.policy_id.as_deref());
    let current = ctx.current_account_id();
    let error_key = ctx.clock.error_key();

    let mut total = iou_report.total() - iou_report.non_reimbursable_total();
    if !full && ctx.has_held_expenses(iou_report_id)? {
        if let Some(unheld) = iou_report.unheld_total.filter(|t| *t != 0) {
            total = unheld;
        }
    }
    let amount = total.abs();
    let pay_action = builder::build_optimistic_iou_action(
        builder::IouActionParams {
            kind: IouActionType::Pay,
            amount,
            currency: iou_report.currency().to_string(),
            comment: String::new(),
            participants: iou_report.owner_account_id.into_iter().collect(),
            transaction_id: None,
            iou_report_id: Some(iou_report_id.to_string()),
            payment_type: Some(payment_type),
            actor: current,
        },
        &ctx.clock,
    );

    let mut data = OnyxData::new();
    let chat_key = OnyxKey::Report(chat_report_id.to_string());
    let report_key = OnyxKey::Report(iou_report_id.to_string());

    // Chat
    let mut chat_patch = to_json(&chat_report);
    insert(&mut chat_patch, "lastReadTime", json!(pay_action.created));
    insert(&mut chat_patch, "lastVisibleActionCreated", json!(pay_action.created));
    insert(&mut chat_patch, "hasOutstandingChildRequest", json!(false));
    insert(&mut chat_patch, "iouReportID", Value::Null);
    insert(&mut chat_patch, "lastMessageText", json!(pay_action.text()));
    insert(&mut chat_patch, "lastMessageHtml", json!(pay_action.html()));
    data.optimistic_data.push(OnyxUpdate::merge(chat_key.clone(), chat_patch));

    // Pay action and the report itself
    push_report_action(&mut data, iou_report_id, &pay_action, &error_key, ErrorMessage::PaymentFailure);
    let mut paid = iou_report.clone();
    paid.status_num = Some(StatusNum::Reimbursed);
    paid.has_outstanding_child_request = Some(false);
    let mut report_patch = report_with_last_message(&paid, &pay_action);
    insert(
        &mut report_patch,
        "pendingFields",
        json!({
            "preview": PendingAction::Update,
            "reimbursed": PendingAction::Update,
            "partial": if full { Value::Null } else { json!(PendingAction::Update) },
        }),
    );
    data.optimistic_data.push(OnyxUpdate::merge(report_key.clone(), report_patch));
    data.success_data.push(OnyxUpdate::merge(
        report_key.clone(),
        json!({"pendingFields": {"preview": null, "reimbursed": null, "partial": null}}),
    ));

    let method_key = iou_report.policy_id.clone().unwrap_or_else(|| PERSONAL_PAYMENT_KEY.to_string());
    data.optimistic_data.push(OnyxUpdate::merge(
        OnyxKey::LastPaymentMethod,
        json!({method_key: payment_type.as_str()}),
    ));

    if !iou_report.is_invoice_report() {
        let next_step = build_next_step(&paid, policy.as_ref(), StatusNum::Reimbursed);
        data.optimistic_data.push(OnyxUpdate::set(
            OnyxKey::NextStep(iou_report_id.to_string()),
            to_json(&next_step),
        ));
        data.failure_data.push(restore_next_step(ctx, iou_report_id)?);
    }
    data.failure_data.push(OnyxUpdate::set(report_key, to_json(&iou_report)));
    data.failure_data.push(OnyxUpdate::set(chat_key, to_json(&chat_report)));

    // The payer may not see the preview when it was whispered to the requester
    if let Some(preview) = ctx.report_preview_action(chat_report_id, iou_report_id)? {
        let updated = builder::update_report_preview(&paid, &preview, true, "");
        let key = OnyxKey::ReportActions(chat_report_id.to_string());
        data.optimistic_data.push(OnyxUpdate::merge(
            key.clone(),
            actions_patch(vec![(updated.report_action_id.clone(), to_json(&updated))]),
        ));
        data.success_data.push(OnyxUpdate::merge(
            key.clone(),
            actions_patch(vec![(updated.report_action_id.clone(), json!({"pendingAction": null}))]),
        ));
        data.failure_data.push(OnyxUpdate::merge(
            key,
            actions_patch(vec![(preview.report_action_id.clone(), to_json(&preview))]),
        ));
    }

    Ok(Some(PaymentInformation {
        iou_report,
        chat_report,
        pay_action,
        amount,
        onyx_data: data,
    }))
}

/// Wallet payments go through their own command.
pub fn pay_command(payment_type: PaymentMethodType) -> WriteCommand {
    match payment_type {
        PaymentMethodType::Expensify => WriteCommand::PayMoneyRequestWithWallet,
        _ => WriteCommand::PayMoneyRequest,
    }
}

pub fn pay_money_request(
    ctx: &EngineContext,
    chat_report_id: &str,
    iou_report_id: &str,
    payment_type: PaymentMethodType,
    full: bool,
) -> anyhow::Result<Option<WriteRequest>> {
    let Some(info) = get_pay_money_request_information(ctx, chat_report_id, iou_report_id, payment_type, full)? else {
        return Ok(None);
    };
    let params = json!({
        "iouReportID": iou_report_id,
        "chatReportID": chat_report_id,
        "reportActionID": info.pay_action.report_action_id,
        "paymentMethodType": payment_type.as_str(),
        "full": full,
        "amount": info.amount,
    });
    Ok(Some(WriteRequest::new(pay_command(payment_type), params, info.onyx_data)))
}

pub fn pay_invoice(
    ctx: &EngineContext,
    chat_report_id: &str,
    invoice_report_id: &str,
    payment_type: PaymentMethodType,
) -> anyhow::Result<Option<WriteRequest>> {
    let Some(info) = get_pay_money_request_information(ctx, chat_report_id, invoice_report_id, payment_type, true)? else {
        return Ok(None);
    };
    let params = json!({
        "reportID": invoice_report_id,
        "reportActionID": info.pay_action.report_action_id,
        "paymentMethodType": payment_type.as_str(),
    });
    Ok(Some(WriteRequest::new(WriteCommand::PayInvoice, params, info.onyx_data)))
}
