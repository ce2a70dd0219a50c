//! Orchestrators for the create flows: requesting money, tracking an expense,
//! sending an invoice and moving a tracked expense onto a report. Each one
//! resolves the entities it touches, then hands them to the assembler.
//!
//! The draft transaction the user composes in lives here too.
use std::collections::BTreeMap;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::assembler::{self, AssemblyEnv, MoneyRequestParts, Resolved, actions_patch, error_map};
use crate::builder::{self, ChatReportBuilder, IouActionParams, TransactionParams};
use crate::context::EngineContext;
use crate::delete::{self, WhisperResolution};
use crate::error::ErrorMessage;
use crate::next_step::build_next_step;
use crate::onyx::{OnyxData, OnyxKey, OnyxUpdate, to_json};
use crate::policy::{DistanceUnit, MileageRate, Policy, PolicyContext};
use crate::report::{self, ChatType, InvoiceReceiver, Report};
use crate::report_action::{IouActionType, ReportAction};
use crate::transaction::{Comment, CustomUnit, Receipt, ReceiptState, Transaction, Waypoint};
use crate::types::{
    AccountId, DRAFT_TRANSACTION_ID, IouRequestType, PARTIAL_TRANSACTION_MERCHANT, Participant, PendingAction,
    QuickAction, QuickActionName, TransactionRef, UNREPORTED_REPORT_ID,
};
use crate::utils::{format_amount, optimistic_account_id};

/// What the user entered for one expense. `amount` is always positive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestDetails {
    pub amount: i64,
    pub currency: String,
    pub created: String,
    pub merchant: String,
    pub comment: String,
    pub receipt: Option<Receipt>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub tax_code: Option<String>,
    pub tax_amount: Option<i64>,
    pub billable: Option<bool>,
}

impl RequestDetails {
    pub fn new(amount: i64, currency: &str) -> Self {
        Self {
            amount,
            currency: currency.to_string(),
            ..Default::default()
        }
    }

    fn scan_receipt(&self) -> (Option<Receipt>, Option<String>) {
        match &self.receipt {
            Some(receipt) if receipt.source.is_some() => {
                let receipt = Receipt {
                    state: Some(receipt.state.unwrap_or(ReceiptState::ScanReady)),
                    ..receipt.clone()
                };
                let filename = receipt.filename.clone();
                (Some(receipt), filename)
            }
            _ => (None, None),
        }
    }

    /// Transaction inputs, signed for the report the expense lands on.
    fn transaction_params(&self, report_id: &str, is_expense: bool) -> TransactionParams {
        let sign = if is_expense { -1 } else { 1 };
        let (receipt, filename) = self.scan_receipt();
        TransactionParams {
            amount: sign * self.amount,
            currency: self.currency.clone(),
            report_id: report_id.to_string(),
            comment: self.comment.clone(),
            created: self.created.clone(),
            merchant: self.merchant.clone(),
            receipt,
            filename,
            category: self.category.clone(),
            tag: self.tag.clone(),
            tax_code: self.tax_code.clone(),
            tax_amount: self.tax_amount.map(|tax| sign * tax),
            billable: self.billable,
            ..Default::default()
        }
    }
}

/// A tracked expense on the self DM being moved onto a report.
#[derive(Debug, Clone)]
pub struct LinkedTrackedExpense {
    pub transaction: Transaction,
    /// The TRACK IOU action on the self DM. Its thread is reused.
    pub action: ReportAction,
}

#[derive(Debug, Clone)]
pub struct MoneyRequestInput {
    pub participant: Participant,
    pub details: RequestDetails,
    /// Chat to file the request in. Found or created from the participants when absent.
    pub chat_report_id: Option<String>,
    pub money_request_report_id: Option<String>,
    pub draft: TransactionRef,
    pub linked_tracked_expense: Option<LinkedTrackedExpense>,
    /// Set on the one-on-one requests that make up a split.
    pub split_transaction_id: Option<String>,
    /// Chat built earlier in the same flow and not stored yet.
    pub pending_chat: Option<Report>,
}

impl MoneyRequestInput {
    pub fn new(participant: Participant, details: RequestDetails) -> Self {
        Self {
            participant,
            details,
            chat_report_id: None,
            money_request_report_id: None,
            draft: TransactionRef::Draft,
            linked_tracked_expense: None,
            split_transaction_id: None,
            pending_chat: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MoneyRequestInformation {
    pub payer_account_id: AccountId,
    pub payer_email: String,
    pub chat_report: Report,
    pub iou_report: Report,
    pub transaction: Transaction,
    pub iou_action: ReportAction,
    pub created_chat_report_action_id: Option<String>,
    pub created_iou_report_action_id: Option<String>,
    pub report_preview_action: ReportAction,
    pub transaction_thread_report_id: String,
    pub created_report_action_id_for_thread: Option<String>,
    pub is_new_chat_report: bool,
    pub onyx_data: OnyxData,
}

impl MoneyRequestInformation {
    pub fn params(&self) -> Value {
        let transaction = &self.transaction;
        json!({
            "amount": transaction.display_amount(self.iou_report.is_expense_report()),
            "currency": transaction.currency,
            "comment": transaction.description(),
            "created": transaction.created,
            "merchant": transaction.merchant,
            "iouReportID": self.iou_report.report_id,
            "chatReportID": self.chat_report.report_id,
            "transactionID": transaction.transaction_id,
            "reportActionID": self.iou_action.report_action_id,
            "createdChatReportActionID": self.created_chat_report_action_id,
            "createdIOUReportActionID": self.created_iou_report_action_id,
            "reportPreviewReportActionID": self.report_preview_action.report_action_id,
            "transactionThreadReportID": self.transaction_thread_report_id,
            "createdReportActionIDForThread": self.created_report_action_id_for_thread,
            "payerAccountID": self.payer_account_id,
            "payerEmail": self.payer_email,
            "category": transaction.category,
            "tag": transaction.tag,
            "taxCode": transaction.tax_code,
            "taxAmount": transaction.tax_amount.map(i64::abs),
            "billable": transaction.billable,
            "receiptState": transaction.receipt.as_ref().and_then(|r| r.state),
        })
    }
}

/// Account id of a participant, falling back to a placeholder derived from
/// their login when the client has never seen them.
pub fn resolve_account_id(ctx: &EngineContext, participant: &Participant) -> Option<AccountId> {
    participant
        .account_id
        .or_else(|| {
            participant
                .login
                .as_deref()
                .and_then(|login| ctx.cache.account_id_for_login(login))
        })
        .or_else(|| {
            participant
                .login
                .as_deref()
                .filter(|login| !login.trim().is_empty())
                .map(optimistic_account_id)
        })
}

fn request_type_of(draft: Option<&Transaction>, details: &RequestDetails) -> IouRequestType {
    match draft.and_then(|d| d.iou_request_type) {
        Some(kind) => kind,
        None if details.receipt.as_ref().is_some_and(|r| r.source.is_some()) => IouRequestType::Scan,
        None => IouRequestType::Manual,
    }
}

fn quick_action_name(kind: IouActionType, request_type: IouRequestType) -> QuickActionName {
    match (kind, request_type) {
        (IouActionType::Create, IouRequestType::Manual) => QuickActionName::RequestManual,
        (IouActionType::Create, IouRequestType::Scan) => QuickActionName::RequestScan,
        (IouActionType::Create, IouRequestType::Distance) => QuickActionName::RequestDistance,
        (IouActionType::Split, IouRequestType::Manual) => QuickActionName::SplitManual,
        (IouActionType::Split, IouRequestType::Scan) => QuickActionName::SplitScan,
        (IouActionType::Split, IouRequestType::Distance) => QuickActionName::SplitDistance,
        (IouActionType::Track, IouRequestType::Manual) => QuickActionName::TrackManual,
        (IouActionType::Track, IouRequestType::Scan) => QuickActionName::TrackScan,
        (IouActionType::Track, IouRequestType::Distance) => QuickActionName::TrackDistance,
        (IouActionType::Pay, _) => QuickActionName::SendMoney,
    }
}

/// The quick action a create flow leaves behind.
pub(crate) struct QuickActionTarget {
    pub name: QuickActionName,
    pub chat_report_id: String,
    pub target_account_id: Option<AccountId>,
}

pub(crate) fn assembly_env(
    ctx: &EngineContext,
    policy: PolicyContext,
    money_report: Option<&Report>,
    transaction_id: &str,
    quick_action: Option<QuickActionTarget>,
) -> anyhow::Result<AssemblyEnv> {
    let previous_quick_action = ctx.quick_action()?;
    let quick_action = quick_action.map(|target| QuickAction {
        action: target.name,
        chat_report_id: target.chat_report_id,
        target_account_id: target.target_account_id,
        is_first_quick_action: previous_quick_action.is_none(),
    });
    let next_step = money_report.map(|report| build_next_step(report, policy.policy.as_ref(), report.status()));
    let previous_next_step = match money_report {
        Some(report) => ctx.next_step(&report.report_id)?,
        None => None,
    };
    Ok(AssemblyEnv {
        error_key: ctx.clock.error_key(),
        db_time: ctx.clock.db_time(),
        violations_enabled: ctx.config.violations_enabled,
        quick_action,
        previous_quick_action,
        next_step,
        previous_next_step,
        existing_violations: ctx.violations(transaction_id)?,
        policy,
    })
}

/// Distance amount in minor units, `round(distance * rate)`.
pub fn distance_amount(quantity: f64, rate: &MileageRate) -> i64 {
    (quantity * rate.rate).round() as i64
}

pub fn distance_merchant(quantity: f64, rate: &MileageRate) -> String {
    let unit = match rate.unit {
        DistanceUnit::Mi => "mi",
        DistanceUnit::Km => "km",
    };
    format!(
        "{quantity:.2} {unit} @ {}/{unit}",
        format_amount(rate.rate.round() as i64, &rate.currency)
    )
}

/// Fills in the amount and merchant of a distance request from the measured
/// route on the draft when the caller left them empty.
fn with_distance(details: &RequestDetails, draft: Option<&Transaction>, policy: Option<&Policy>) -> RequestDetails {
    let mut details = details.clone();
    let Some(unit) = draft.and_then(|d| d.comment.custom_unit.as_ref()) else {
        return details;
    };
    let rate = unit
        .custom_unit_rate_id
        .as_deref()
        .and_then(|id| policy.and_then(|p| p.mileage_rate(id)));
    if let (Some(quantity), Some(rate)) = (unit.quantity, rate) {
        if details.amount == 0 {
            details.amount = distance_amount(quantity, rate);
            details.currency = rate.currency.clone();
        }
        if details.merchant.is_empty() {
            details.merchant = distance_merchant(quantity, rate);
        }
    }
    details
}

fn merge_distance_draft(transaction: &mut Transaction, draft: &Transaction) {
    transaction.comment.waypoints = draft.comment.waypoints.clone();
    transaction.comment.custom_unit = draft.comment.custom_unit.clone();
    if transaction.has_partial_merchant() && !draft.has_partial_merchant() {
        transaction.merchant = draft.merchant.clone();
    }
    transaction
        .pending_fields
        .insert("waypoints".into(), PendingAction::Add);
}

/// Adds a new REPORTPREVIEW to the chat or refreshes the one already linking
/// to `money_report`.
fn attach_report_preview(
    ctx: &EngineContext,
    chat: &mut Resolved<Report>,
    money_report: &mut Resolved<Report>,
    transaction: &Transaction,
    comment: &str,
    actor: AccountId,
) -> anyhow::Result<Resolved<ReportAction>> {
    let existing = if money_report.is_new() {
        None
    } else {
        ctx.report_preview_action(&chat.value.report_id, &money_report.value.report_id)?
    };
    let preview = match existing {
        Some(preview) => Resolved {
            value: builder::update_report_preview(&money_report.value, &preview, false, comment),
            snapshot: Some(preview),
        },
        None => {
            let preview = builder::build_optimistic_report_preview(
                &chat.value,
                &money_report.value,
                comment,
                Some(transaction),
                actor,
                &ctx.clock,
            );
            money_report.value.parent_report_action_id = Some(preview.report_action_id.clone());
            Resolved::created(preview)
        }
    };
    chat.value.iou_report_id = Some(money_report.value.report_id.clone());
    chat.value.last_visible_action_created = Some(preview.value.created.clone());
    chat.value.last_message_text = Some(preview.value.text().to_string());
    chat.value.has_outstanding_child_request = Some(report::outstanding_child_request(&money_report.value, actor));
    Ok(preview)
}

/// Resolves (or creates) every entity of a new money request and builds its
/// three patch lists. `None` when the chat or payer cannot be determined.
pub fn get_money_request_information(
    ctx: &EngineContext,
    input: &MoneyRequestInput,
) -> anyhow::Result<Option<MoneyRequestInformation>> {
    let payee = ctx.current_account_id();
    let participant = &input.participant;
    let is_policy_expense_chat = participant.is_policy_expense_chat;

    // Resolve the chat report
    let explicit_chat = match input.chat_report_id.as_deref().or(participant.report_id.as_deref()) {
        Some(id) => ctx.report(id)?,
        None => None,
    };
    let (mut chat_report, payer) = if is_policy_expense_chat {
        let Some(chat) = explicit_chat else {
            warn!(report_id = ?participant.report_id, "workspace chat for the request is missing");
            return Ok(None);
        };
        let payer = ctx
            .policy(chat.policy_id.as_deref())
            .and_then(|p| p.submit_to_account_id())
            .unwrap_or(payee);
        (Resolved::existing(chat), payer)
    } else {
        let Some(payer) = resolve_account_id(ctx, participant) else {
            warn!("request participant has neither an account id nor a login");
            return Ok(None);
        };
        let chat = match explicit_chat {
            Some(chat) => Some(chat),
            None => ctx.find_chat_by_participants(&[payer, payee])?,
        };
        let chat = match chat {
            Some(chat) => Resolved::existing(chat),
            None => match &input.pending_chat {
                Some(pending) => Resolved::created(pending.clone()),
                None => {
                    debug!(payer, "no chat with the payer yet, creating one");
                    Resolved::created(ChatReportBuilder::new(&[payer, payee]).build())
                }
            },
        };
        (chat, payer)
    };

    let policy_ctx = ctx.policy_context(chat_report.value.policy_id.as_deref())?;
    let policy = policy_ctx.policy.clone();
    let draft = ctx.transaction_draft(&input.draft)?;
    let request_type = request_type_of(draft.as_ref(), &input.details);
    let details = if request_type == IouRequestType::Distance {
        with_distance(&input.details, draft.as_ref(), policy.as_ref())
    } else {
        input.details.clone()
    };
    if details.amount < 0 {
        warn!(amount = details.amount, "refusing a negative request amount");
        return Ok(None);
    }

    // Reuse the open money request report or start a new one
    let existing_report = match input
        .money_request_report_id
        .as_deref()
        .or(chat_report.value.iou_report_id.as_deref())
    {
        Some(id) => ctx.report(id)?,
        None => None,
    };
    let reusable = existing_report.filter(|existing| {
        !report::should_create_new_money_request_report(Some(existing), &chat_report.value, policy.as_ref())
    });
    let mut money_report = match reusable {
        Some(existing) => {
            let updated = if existing.is_expense_report() {
                report::add_to_expense_total(&existing, details.amount, &details.currency, true)
            } else {
                report::update_iou_owner_and_total(&existing, payee, details.amount, &details.currency, false)
            };
            Resolved {
                value: updated,
                snapshot: Some(existing),
            }
        }
        None if is_policy_expense_chat => Resolved::created(builder::build_optimistic_expense_report(
            &chat_report.value.report_id,
            policy.as_ref(),
            chat_report.value.policy_id.as_deref().unwrap_or_default(),
            payee,
            details.amount,
            &details.currency,
            true,
        )),
        None => Resolved::created(builder::build_optimistic_iou_report(
            payee,
            payer,
            details.amount,
            &chat_report.value.report_id,
            &details.currency,
        )),
    };
    let is_expense = money_report.value.is_expense_report();

    // Build the transaction
    let transaction_id = match &input.linked_tracked_expense {
        Some(linked) => linked.transaction.transaction_id.clone(),
        None => input.draft.promote().id().to_string(),
    };
    let mut params = details.transaction_params(&money_report.value.report_id, is_expense);
    params.transaction_id = Some(transaction_id.clone());
    params.iou_request_type = Some(request_type);
    if let Some(split_id) = &input.split_transaction_id {
        params.original_transaction_id = Some(split_id.clone());
        params.source = Some("split".to_string());
    }
    let mut transaction = builder::build_optimistic_transaction(params, &ctx.clock);
    if let Some(draft) = draft.as_ref().filter(|_| request_type == IouRequestType::Distance) {
        merge_distance_draft(&mut transaction, draft);
    }
    let transaction = Resolved {
        value: transaction,
        snapshot: input.linked_tracked_expense.as_ref().map(|l| l.transaction.clone()),
    };

    // Action chain and transaction thread
    let existing_thread = match input
        .linked_tracked_expense
        .as_ref()
        .and_then(|l| l.action.child_report_id.as_deref())
    {
        Some(id) => ctx.report(id)?,
        None => None,
    };
    let entities = builder::build_optimistic_money_request_entities(
        &money_report.value,
        IouActionParams {
            kind: IouActionType::Create,
            amount: details.amount,
            currency: details.currency.clone(),
            comment: details.comment.clone(),
            participants: vec![payer, payee],
            transaction_id: Some(transaction_id.clone()),
            iou_report_id: Some(money_report.value.report_id.clone()),
            payment_type: None,
            actor: payee,
        },
        existing_thread.as_ref(),
        &ctx.clock,
    );
    let thread = match existing_thread {
        Some(snapshot) => Resolved {
            value: entities.thread.report.clone(),
            snapshot: Some(snapshot),
        },
        None => Resolved::created(entities.thread.report.clone()),
    };
    let report_preview = attach_report_preview(
        ctx,
        &mut chat_report,
        &mut money_report,
        &transaction.value,
        &details.comment,
        payee,
    )?;

    let personal_details = if !is_policy_expense_chat && ctx.personal_details(payer).is_none() {
        vec![builder::build_optimistic_personal_detail(participant, payer)]
    } else {
        Vec::new()
    };

    let quick_action = input.split_transaction_id.is_none().then(|| QuickActionTarget {
        name: quick_action_name(IouActionType::Create, request_type),
        chat_report_id: chat_report.value.report_id.clone(),
        target_account_id: (!is_policy_expense_chat).then_some(payer),
    });
    let env = assembly_env(ctx, policy_ctx, Some(&money_report.value), &transaction_id, quick_action)?;

    let is_new_chat_report = chat_report.is_new();
    let created_chat_report_action_id =
        is_new_chat_report.then(|| entities.chat_created_action.report_action_id.clone());
    let created_iou_report_action_id = money_report
        .is_new()
        .then(|| entities.report_created_action.report_action_id.clone());
    let created_report_action_id_for_thread = entities
        .thread
        .created_action
        .as_ref()
        .map(|a| a.report_action_id.clone());

    let parts = MoneyRequestParts {
        chat_report,
        money_report: Some(money_report),
        transaction,
        chat_created_action: Some(entities.chat_created_action),
        report_created_action: Some(entities.report_created_action),
        iou_action: entities.iou_action,
        thread,
        thread_created_action: entities.thread.created_action,
        report_preview: Some(report_preview),
        whisper: None,
        personal_details,
    };
    let onyx_data = assembler::build_onyx_data_for_money_request(&parts, &env);

    let Some(iou_report) = parts.money_report.map(|r| r.value) else {
        return Ok(None);
    };
    let Some(report_preview_action) = parts.report_preview.map(|p| p.value) else {
        return Ok(None);
    };
    info!(
        chat_report_id = %parts.chat_report.value.report_id,
        iou_report_id = %iou_report.report_id,
        transaction_id = %parts.transaction.value.transaction_id,
        "built money request"
    );
    Ok(Some(MoneyRequestInformation {
        payer_account_id: payer,
        payer_email: participant.login.clone().unwrap_or_default(),
        chat_report: parts.chat_report.value,
        iou_report,
        transaction: parts.transaction.value,
        iou_action: parts.iou_action,
        created_chat_report_action_id,
        created_iou_report_action_id,
        report_preview_action,
        transaction_thread_report_id: parts.thread.value.report_id,
        created_report_action_id_for_thread,
        is_new_chat_report,
        onyx_data,
    }))
}

#[derive(Debug, Clone)]
pub struct TrackExpenseInput {
    /// The self DM, or a workspace chat to track onto its open report.
    pub chat_report_id: String,
    pub details: RequestDetails,
    pub money_request_report_id: Option<String>,
    pub draft: TransactionRef,
}

#[derive(Debug, Clone)]
pub struct TrackExpenseInformation {
    pub chat_report: Report,
    pub money_report: Option<Report>,
    pub transaction: Transaction,
    pub iou_action: ReportAction,
    pub created_iou_report_action_id: Option<String>,
    pub report_preview_action: Option<ReportAction>,
    pub transaction_thread_report_id: String,
    pub created_report_action_id_for_thread: Option<String>,
    pub actionable_whisper_report_action_id: Option<String>,
    pub onyx_data: OnyxData,
}

impl TrackExpenseInformation {
    pub fn params(&self) -> Value {
        let transaction = &self.transaction;
        json!({
            "amount": transaction.display_amount(self.money_report.is_some()),
            "currency": transaction.currency,
            "comment": transaction.description(),
            "created": transaction.created,
            "merchant": transaction.merchant,
            "chatReportID": self.chat_report.report_id,
            "transactionID": transaction.transaction_id,
            "reportActionID": self.iou_action.report_action_id,
            "transactionThreadReportID": self.transaction_thread_report_id,
            "createdReportActionIDForThread": self.created_report_action_id_for_thread,
            "moneyRequestReportID": self.money_report.as_ref().map(|r| r.report_id.clone()),
            "moneyRequestCreatedReportActionID": self.created_iou_report_action_id,
            "moneyRequestPreviewReportActionID": self.report_preview_action.as_ref().map(|a| a.report_action_id.clone()),
            "actionableWhisperReportActionID": self.actionable_whisper_report_action_id,
            "category": transaction.category,
            "tag": transaction.tag,
            "billable": transaction.billable,
            "receiptState": transaction.receipt.as_ref().and_then(|r| r.state),
        })
    }
}

/// Tracks a non-reimbursable expense. On the self DM the IOU action lives in
/// the chat itself and no money report exists; on a workspace chat it lands
/// on the open expense report.
pub fn get_track_expense_information(
    ctx: &EngineContext,
    input: &TrackExpenseInput,
) -> anyhow::Result<Option<TrackExpenseInformation>> {
    let actor = ctx.current_account_id();
    let Some(chat) = ctx.report(&input.chat_report_id)? else {
        warn!(chat_report_id = %input.chat_report_id, "chat for the tracked expense is missing");
        return Ok(None);
    };
    let is_policy_expense_chat = chat.is_policy_expense_chat();
    let mut chat_report = Resolved::existing(chat);
    let policy_ctx = ctx.policy_context(chat_report.value.policy_id.as_deref())?;
    let policy = policy_ctx.policy.clone();
    let draft = ctx.transaction_draft(&input.draft)?;
    let request_type = request_type_of(draft.as_ref(), &input.details);
    let details = if request_type == IouRequestType::Distance {
        with_distance(&input.details, draft.as_ref(), policy.as_ref())
    } else {
        input.details.clone()
    };

    let mut money_report = if is_policy_expense_chat {
        let existing = match input
            .money_request_report_id
            .as_deref()
            .or(chat_report.value.iou_report_id.as_deref())
        {
            Some(id) => ctx.report(id)?,
            None => None,
        };
        let reusable = existing.filter(|existing| {
            !report::should_create_new_money_request_report(Some(existing), &chat_report.value, policy.as_ref())
        });
        Some(match reusable {
            Some(existing) => Resolved {
                value: report::add_to_expense_total(&existing, details.amount, &details.currency, false),
                snapshot: Some(existing),
            },
            None => Resolved::created(builder::build_optimistic_expense_report(
                &chat_report.value.report_id,
                policy.as_ref(),
                chat_report.value.policy_id.as_deref().unwrap_or_default(),
                actor,
                details.amount,
                &details.currency,
                false,
            )),
        })
    } else {
        None
    };
    let is_expense = money_report.is_some();
    let report_id = money_report
        .as_ref()
        .map_or_else(|| UNREPORTED_REPORT_ID.to_string(), |r| r.value.report_id.clone());

    let transaction_id = input.draft.promote().id().to_string();
    let mut params = details.transaction_params(&report_id, is_expense);
    params.transaction_id = Some(transaction_id.clone());
    params.iou_request_type = Some(request_type);
    params.reimbursable = Some(false);
    let mut transaction = builder::build_optimistic_transaction(params, &ctx.clock);
    if let Some(draft) = draft.as_ref().filter(|_| request_type == IouRequestType::Distance) {
        merge_distance_draft(&mut transaction, draft);
    }

    let entities = builder::build_optimistic_money_request_entities(
        money_report.as_ref().map_or(&chat_report.value, |r| &r.value),
        IouActionParams {
            kind: IouActionType::Track,
            amount: details.amount,
            currency: details.currency.clone(),
            comment: details.comment.clone(),
            participants: vec![actor],
            transaction_id: Some(transaction_id.clone()),
            iou_report_id: money_report.as_ref().map(|r| r.value.report_id.clone()),
            payment_type: None,
            actor,
        },
        None,
        &ctx.clock,
    );
    let report_preview = match money_report.as_mut() {
        Some(report) => Some(attach_report_preview(
            ctx,
            &mut chat_report,
            report,
            &transaction,
            &details.comment,
            actor,
        )?),
        None => None,
    };
    let whisper = (!is_policy_expense_chat)
        .then(|| builder::build_optimistic_actionable_track_expense_whisper(&transaction_id, actor, &ctx.clock));

    let quick_action = QuickActionTarget {
        name: quick_action_name(IouActionType::Track, request_type),
        chat_report_id: chat_report.value.report_id.clone(),
        target_account_id: None,
    };
    let env = assembly_env(
        ctx,
        policy_ctx,
        money_report.as_ref().map(|r| &r.value),
        &transaction_id,
        Some(quick_action),
    )?;

    let created_iou_report_action_id = money_report
        .as_ref()
        .filter(|r| r.is_new())
        .map(|_| entities.report_created_action.report_action_id.clone());
    let created_report_action_id_for_thread = entities
        .thread
        .created_action
        .as_ref()
        .map(|a| a.report_action_id.clone());
    let actionable_whisper_report_action_id = whisper.as_ref().map(|w| w.report_action_id.clone());

    let parts = MoneyRequestParts {
        chat_report,
        money_report,
        transaction: Resolved::created(transaction),
        chat_created_action: None,
        report_created_action: Some(entities.report_created_action),
        iou_action: entities.iou_action,
        thread: Resolved::created(entities.thread.report),
        thread_created_action: entities.thread.created_action,
        report_preview,
        whisper,
        personal_details: Vec::new(),
    };
    let onyx_data = assembler::build_onyx_data_for_track_expense(&parts, &env);
    info!(
        chat_report_id = %parts.chat_report.value.report_id,
        transaction_id = %transaction_id,
        "built tracked expense"
    );

    Ok(Some(TrackExpenseInformation {
        chat_report: parts.chat_report.value,
        money_report: parts.money_report.map(|r| r.value),
        transaction: parts.transaction.value,
        iou_action: parts.iou_action,
        created_iou_report_action_id,
        report_preview_action: parts.report_preview.map(|p| p.value),
        transaction_thread_report_id: parts.thread.value.report_id,
        created_report_action_id_for_thread,
        actionable_whisper_report_action_id,
        onyx_data,
    }))
}

#[derive(Debug, Clone)]
pub struct SendInvoiceInput {
    pub sender_policy_id: String,
    pub receiver: Participant,
    pub details: RequestDetails,
    /// Existing invoice room, looked up by sender workspace and receiver when absent.
    pub chat_report_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendInvoiceInformation {
    pub sender_workspace_id: String,
    pub receiver_account_id: AccountId,
    pub invoice_room: Report,
    pub invoice_report: Report,
    pub transaction: Transaction,
    pub iou_action: ReportAction,
    pub created_chat_report_action_id: Option<String>,
    pub created_iou_report_action_id: String,
    pub report_preview_action: ReportAction,
    pub transaction_thread_report_id: String,
    pub created_report_action_id_for_thread: Option<String>,
    pub is_new_chat_report: bool,
    pub onyx_data: OnyxData,
}

impl SendInvoiceInformation {
    pub fn params(&self) -> Value {
        let transaction = &self.transaction;
        json!({
            "senderWorkspaceID": self.sender_workspace_id,
            "accountID": self.receiver_account_id,
            "amount": transaction.display_amount(true),
            "currency": transaction.currency,
            "comment": transaction.description(),
            "merchant": transaction.merchant,
            "date": transaction.created,
            "invoiceRoomReportID": self.invoice_room.report_id,
            "createdChatReportActionID": self.created_chat_report_action_id,
            "invoiceReportID": self.invoice_report.report_id,
            "reportPreviewReportActionID": self.report_preview_action.report_action_id,
            "transactionID": transaction.transaction_id,
            "transactionThreadReportID": self.transaction_thread_report_id,
            "createdIOUReportActionID": self.created_iou_report_action_id,
            "createdReportActionIDForThread": self.created_report_action_id_for_thread,
            "reportActionID": self.iou_action.report_action_id,
        })
    }
}

/// Invoices always open a new invoice report inside the sender workspace's
/// invoice room with the receiver.
pub fn get_send_invoice_information(
    ctx: &EngineContext,
    input: &SendInvoiceInput,
) -> anyhow::Result<Option<SendInvoiceInformation>> {
    let sender = ctx.current_account_id();
    let Some(receiver) = resolve_account_id(ctx, &input.receiver) else {
        warn!("invoice receiver has neither an account id nor a login");
        return Ok(None);
    };
    let details = &input.details;
    let policy_ctx = ctx.policy_context(Some(&input.sender_policy_id))?;

    let existing_room = match &input.chat_report_id {
        Some(id) => ctx.report(id)?,
        None => ctx.find_invoice_chat(&input.sender_policy_id, receiver)?,
    };
    let mut chat_report = match existing_room {
        Some(room) => Resolved::existing(room),
        None => {
            let name = policy_ctx
                .policy
                .as_ref()
                .map_or("Invoices", |p| p.name.as_str());
            Resolved::created(
                ChatReportBuilder::new(&[sender, receiver])
                    .set_chat_type(ChatType::Invoice)
                    .set_policy_id(&input.sender_policy_id)
                    .set_invoice_receiver(InvoiceReceiver::Individual { account_id: receiver })
                    .set_report_name(name)
                    .build(),
            )
        }
    };

    let mut invoice_report = Resolved::created(builder::build_optimistic_invoice_report(
        &chat_report.value.report_id,
        &input.sender_policy_id,
        sender,
        receiver,
        details.amount,
        &details.currency,
    ));

    let transaction_id = TransactionRef::Draft.promote().id().to_string();
    let mut params = details.transaction_params(&invoice_report.value.report_id, true);
    params.transaction_id = Some(transaction_id.clone());
    let transaction = builder::build_optimistic_transaction(params, &ctx.clock);

    let entities = builder::build_optimistic_money_request_entities(
        &invoice_report.value,
        IouActionParams {
            kind: IouActionType::Create,
            amount: details.amount,
            currency: details.currency.clone(),
            comment: details.comment.clone(),
            participants: vec![receiver, sender],
            transaction_id: Some(transaction_id.clone()),
            iou_report_id: Some(invoice_report.value.report_id.clone()),
            payment_type: None,
            actor: sender,
        },
        None,
        &ctx.clock,
    );
    let report_preview = attach_report_preview(
        ctx,
        &mut chat_report,
        &mut invoice_report,
        &transaction,
        &details.comment,
        sender,
    )?;
    let personal_details = if ctx.personal_details(receiver).is_none() {
        vec![builder::build_optimistic_personal_detail(&input.receiver, receiver)]
    } else {
        Vec::new()
    };
    let env = assembly_env(ctx, policy_ctx, Some(&invoice_report.value), &transaction_id, None)?;

    let is_new_chat_report = chat_report.is_new();
    let created_chat_report_action_id =
        is_new_chat_report.then(|| entities.chat_created_action.report_action_id.clone());
    let created_iou_report_action_id = entities.report_created_action.report_action_id.clone();
    let created_report_action_id_for_thread = entities
        .thread
        .created_action
        .as_ref()
        .map(|a| a.report_action_id.clone());

    let parts = MoneyRequestParts {
        chat_report,
        money_report: Some(invoice_report),
        transaction: Resolved::created(transaction),
        chat_created_action: Some(entities.chat_created_action),
        report_created_action: Some(entities.report_created_action),
        iou_action: entities.iou_action,
        thread: Resolved::created(entities.thread.report),
        thread_created_action: entities.thread.created_action,
        report_preview: Some(report_preview),
        whisper: None,
        personal_details,
    };
    let onyx_data = assembler::build_onyx_data_for_invoice(&parts, &env);

    let Some(invoice_report) = parts.money_report.map(|r| r.value) else {
        return Ok(None);
    };
    let Some(report_preview_action) = parts.report_preview.map(|p| p.value) else {
        return Ok(None);
    };
    Ok(Some(SendInvoiceInformation {
        sender_workspace_id: input.sender_policy_id.clone(),
        receiver_account_id: receiver,
        invoice_room: parts.chat_report.value,
        invoice_report,
        transaction: parts.transaction.value,
        iou_action: parts.iou_action,
        created_chat_report_action_id,
        created_iou_report_action_id,
        report_preview_action,
        transaction_thread_report_id: parts.thread.value.report_id,
        created_report_action_id_for_thread,
        is_new_chat_report,
        onyx_data,
    }))
}

/// Where a tracked expense goes when it leaves the self DM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedExpenseDestination {
    /// Request the money from a person.
    Request,
    /// Submit it to a workspace.
    Categorize,
    /// Submit it to a workspace and invite an accountant to the chat.
    Share { accountant_email: String },
}

impl TrackedExpenseDestination {
    fn whisper_resolution(&self) -> WhisperResolution {
        match self {
            TrackedExpenseDestination::Request => WhisperResolution::Request,
            TrackedExpenseDestination::Categorize => WhisperResolution::Categorize,
            TrackedExpenseDestination::Share { .. } => WhisperResolution::Share,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvertTrackedExpenseInput {
    pub destination: TrackedExpenseDestination,
    pub participant: Participant,
    pub details: RequestDetails,
    pub self_dm_report_id: String,
    pub transaction_id: String,
    /// The TRACK IOU action on the self DM.
    pub tracked_action_id: String,
}

#[derive(Debug, Clone)]
pub struct ConvertTrackedExpenseInformation {
    pub destination: TrackedExpenseDestination,
    pub request: MoneyRequestInformation,
    pub moved_action: ReportAction,
    pub actionable_whisper_report_action_id: Option<String>,
    pub onyx_data: OnyxData,
}

impl ConvertTrackedExpenseInformation {
    pub fn params(&self) -> Value {
        let mut params = self.request.params();
        if let Value::Object(map) = &mut params {
            map.insert(
                "modifiedExpenseReportActionID".into(),
                json!(self.moved_action.report_action_id),
            );
            map.insert(
                "actionableWhisperReportActionID".into(),
                json!(self.actionable_whisper_report_action_id),
            );
            map.insert("moneyRequestReportID".into(), json!(self.request.iou_report.report_id));
            match &self.destination {
                TrackedExpenseDestination::Request => {}
                TrackedExpenseDestination::Categorize => {
                    map.insert("policyID".into(), json!(self.request.iou_report.policy_id));
                }
                TrackedExpenseDestination::Share { accountant_email } => {
                    map.insert("policyID".into(), json!(self.request.iou_report.policy_id));
                    map.insert("accountantEmail".into(), json!(accountant_email));
                }
            }
        }
        params
    }
}

/// Moves a tracked expense off the self DM: the removal patches come first,
/// then a "moved" note on the expense's thread, then the creation patches at
/// the destination. The transaction and its thread are kept and reused.
pub fn get_convert_tracked_expense_information(
    ctx: &EngineContext,
    input: &ConvertTrackedExpenseInput,
) -> anyhow::Result<Option<ConvertTrackedExpenseInformation>> {
    let Some(transaction) = ctx.transaction(&input.transaction_id)? else {
        warn!(transaction_id = %input.transaction_id, "tracked expense is missing");
        return Ok(None);
    };
    let Some(action) = ctx.report_action(&input.self_dm_report_id, &input.tracked_action_id)? else {
        warn!(action_id = %input.tracked_action_id, "tracked expense action is missing");
        return Ok(None);
    };
    let Some(deletion) = delete::get_delete_track_expense_information(
        ctx,
        &input.self_dm_report_id,
        &input.transaction_id,
        &action,
        true,
        input.destination.whisper_resolution(),
    )?
    else {
        return Ok(None);
    };

    let mut request_input = MoneyRequestInput::new(input.participant.clone(), input.details.clone());
    request_input.draft = TransactionRef::Persisted(transaction.transaction_id.clone());
    request_input.linked_tracked_expense = Some(LinkedTrackedExpense {
        transaction,
        action: action.clone(),
    });
    let Some(request) = get_money_request_information(ctx, &request_input)? else {
        return Ok(None);
    };

    let actor = ctx.current_account_id();
    let moved_action =
        builder::build_optimistic_moved_tracked_expense_action(&request.iou_report.report_id, actor, &ctx.clock);
    let mut onyx_data = deletion.onyx_data;
    let thread_actions = OnyxKey::ReportActions(request.transaction_thread_report_id.clone());
    let moved_id = moved_action.report_action_id.clone();
    onyx_data.optimistic_data.push(OnyxUpdate::merge(
        thread_actions.clone(),
        actions_patch(vec![(moved_id.clone(), to_json(&moved_action))]),
    ));
    onyx_data.success_data.push(OnyxUpdate::merge(
        thread_actions.clone(),
        actions_patch(vec![(moved_id.clone(), json!({"pendingAction": null}))]),
    ));
    onyx_data.failure_data.push(OnyxUpdate::merge(
        thread_actions,
        actions_patch(vec![(
            moved_id,
            json!({"errors": error_map(&ctx.clock.error_key(), ErrorMessage::GenericEditFailure)}),
        )]),
    ));
    onyx_data.extend(request.onyx_data.clone());

    Ok(Some(ConvertTrackedExpenseInformation {
        destination: input.destination.clone(),
        request,
        moved_action,
        actionable_whisper_report_action_id: deletion.actionable_whisper_report_action_id,
        onyx_data,
    }))
}

/// Starts (or resumes) composing a request in the draft transaction.
///
/// A draft of the same request type is kept and only re-pointed at
/// `report_id`; anything else is replaced by a blank draft.
pub fn init_money_request(
    ctx: &EngineContext,
    report_id: &str,
    policy: Option<&Policy>,
    is_from_global_create: bool,
    request_type: IouRequestType,
) -> anyhow::Result<OnyxUpdate> {
    let key = OnyxKey::TransactionDraft(TransactionRef::Draft);
    let account_id = ctx.current_account_id();
    let created = ctx.clock.now().to_date_string();
    let currency = policy
        .and_then(|p| p.output_currency.clone())
        .or_else(|| ctx.personal_details(account_id).and_then(|d| d.local_currency_code))
        .unwrap_or_else(|| ctx.config.default_currency.clone());

    let existing = ctx.transaction_draft(&TransactionRef::Draft)?;
    if existing.is_some_and(|draft| draft.iou_request_type == Some(request_type)) {
        debug!(report_id, "resuming the draft");
        return Ok(OnyxUpdate::merge(
            key,
            json!({
                "reportID": report_id,
                "isFromGlobalCreate": is_from_global_create,
                "created": created,
                "currency": currency,
                "transactionID": DRAFT_TRANSACTION_ID,
            }),
        ));
    }

    let mut comment = Comment::default();
    if request_type == IouRequestType::Distance {
        comment.waypoints = Some(BTreeMap::from([
            ("waypoint0".to_string(), Waypoint::default()),
            ("waypoint1".to_string(), Waypoint::default()),
        ]));
        let rate_id = policy
            .filter(|_| !is_from_global_create)
            .and_then(Policy::default_mileage_rate_id)
            .map(str::to_string);
        comment.custom_unit = Some(CustomUnit {
            custom_unit_rate_id: rate_id,
            quantity: None,
            name: Some("Distance".to_string()),
        });
    }
    let draft = Transaction {
        transaction_id: DRAFT_TRANSACTION_ID.to_string(),
        report_id: report_id.to_string(),
        amount: 0,
        currency,
        created,
        merchant: PARTIAL_TRANSACTION_MERCHANT.to_string(),
        comment,
        iou_request_type: Some(request_type),
        is_from_global_create: Some(is_from_global_create),
        split_payer_account_ids: vec![account_id],
        ..Default::default()
    };
    Ok(OnyxUpdate::set(key, to_json(&draft)))
}

/// One field the user sets on the draft while composing.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftField {
    AmountAndCurrency { amount: i64, currency: String },
    Created(String),
    Description(String),
    Merchant(String),
    Category(String),
    Tag(String),
    Billable(bool),
    Participants(Vec<Participant>),
    Receipt { source: String, filename: String },
    TaxCode(String),
    TaxAmount(i64),
    SplitPayer(AccountId),
    Waypoints(BTreeMap<String, Waypoint>),
    Distance(f64),
}

impl DraftField {
    fn patch(&self) -> Value {
        match self {
            DraftField::AmountAndCurrency { amount, currency } => json!({"amount": amount, "currency": currency}),
            DraftField::Created(created) => json!({"created": created}),
            DraftField::Description(text) => json!({"comment": {"comment": text.trim()}}),
            DraftField::Merchant(merchant) => json!({"merchant": merchant.trim()}),
            DraftField::Category(category) => json!({"category": category}),
            DraftField::Tag(tag) => json!({"tag": tag}),
            DraftField::Billable(billable) => json!({"billable": billable}),
            DraftField::Participants(participants) => json!({"participants": to_json(participants)}),
            DraftField::Receipt { source, filename } => json!({
                "receipt": {"source": source, "state": ReceiptState::Open},
                "filename": filename,
            }),
            DraftField::TaxCode(code) => json!({"taxCode": code}),
            DraftField::TaxAmount(amount) => json!({"taxAmount": amount}),
            DraftField::SplitPayer(account_id) => json!({"splitPayerAccountIDs": [account_id]}),
            DraftField::Waypoints(waypoints) => json!({"comment": {"waypoints": to_json(waypoints)}}),
            DraftField::Distance(quantity) => json!({"comment": {"customUnit": {"quantity": quantity}}}),
        }
    }
}

pub fn set_draft_field(reference: &TransactionRef, field: &DraftField) -> OnyxUpdate {
    OnyxUpdate::merge(OnyxKey::TransactionDraft(reference.clone()), field.patch())
}

pub fn clear_money_request(reference: &TransactionRef) -> OnyxUpdate {
    OnyxUpdate::clear(OnyxKey::TransactionDraft(reference.clone()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::store::{KeyValueStore, MemoryStore};

    fn context() -> EngineContext {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store
            .set(&OnyxKey::Session, Some(json!({"accountID": 7, "email": "me@example.com"})))
            .unwrap();
        EngineContext::new(store, EngineConfig::default()).unwrap()
    }

    #[test]
    fn distance_amount_rounds_to_minor_units() {
        let rate = MileageRate {
            rate: 67.0,
            currency: "USD".into(),
            unit: DistanceUnit::Mi,
            name: "Default".into(),
        };
        assert_eq!(distance_amount(12.5, &rate), 838);
        assert_eq!(distance_merchant(12.5, &rate), "12.50 mi @ $0.67/mi");
    }

    #[test]
    fn same_type_draft_is_merged_not_replaced() {
        let ctx = context();
        let first = init_money_request(&ctx, "r1", None, false, IouRequestType::Manual).unwrap();
        assert!(first.is_set());
        ctx.store.apply(&[first]).unwrap();
        ctx.store
            .apply(&[set_draft_field(&TransactionRef::Draft, &DraftField::Merchant(" Cafe ".into()))])
            .unwrap();

        let second = init_money_request(&ctx, "r2", None, true, IouRequestType::Manual).unwrap();
        assert!(!second.is_set());
        ctx.store.apply(&[second]).unwrap();
        let draft = ctx.transaction_draft(&TransactionRef::Draft).unwrap().unwrap();
        assert_eq!(draft.merchant, "Cafe");
        assert_eq!(draft.report_id, "r2");
        assert_eq!(draft.split_payer_account_ids, vec![7]);

        let distance = init_money_request(&ctx, "r2", None, false, IouRequestType::Distance).unwrap();
        assert!(distance.is_set());
    }

    #[test]
    fn unknown_logins_get_stable_placeholder_ids() {
        let ctx = context();
        let participant = Participant {
            login: Some("new@example.com".into()),
            ..Default::default()
        };
        let id = resolve_account_id(&ctx, &participant);
        assert_eq!(id, Some(optimistic_account_id("new@example.com")));
        assert_eq!(resolve_account_id(&ctx, &Participant::default()), None);
    }
}
