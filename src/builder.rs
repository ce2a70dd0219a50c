//! Builders for optimistic reports, transactions and report actions
use std::collections::BTreeMap;

use serde_json::json;

use crate::policy::Policy;
use crate::report::{ChatType, InvoiceReceiver, NotificationPreference, Report, ReportParticipant, ReportType};
use crate::report_action::{ActionName, IouActionType, IouMessage, ModifiedExpenseMessage, ReportAction};
use crate::transaction::{Comment, Receipt, Transaction, TransactionChanges};
use crate::types::{
    AccountId, IouRequestType, OptimisticClock, Participant, PaymentMethodType, PendingAction, PersonalDetails,
    StateNum, StatusNum, PARTIAL_TRANSACTION_MERCHANT,
};
use crate::utils::{format_amount, generate_id};

// used for constructing optimistic chats, rooms and threads
#[derive(Default)]
pub struct ChatReportBuilder {
    pub participants: Vec<AccountId>,
    pub report_name: Option<String>,
    pub chat_type: Option<ChatType>,
    pub policy_id: Option<String>,
    pub owner_account_id: Option<AccountId>,
    pub parent: Option<(String, String)>,
    pub is_own_policy_expense_chat: bool,
    pub invoice_receiver: Option<InvoiceReceiver>,
    pub notification_preference: NotificationPreference,
    pub report_id: Option<String>,
}

impl ChatReportBuilder {
    pub fn new(participants: &[AccountId]) -> Self {
        let mut participants = participants.to_vec();
        participants.sort_unstable();
        participants.dedup();
        Self {
            participants,
            ..Self::default()
        }
    }

    pub fn set_report_name(mut self, name: &str) -> Self {
        self.report_name = Some(name.to_string());
        self
    }

    pub fn set_chat_type(mut self, chat_type: ChatType) -> Self {
        self.chat_type = Some(chat_type);
        self
    }

    pub fn set_policy_id(mut self, policy_id: &str) -> Self {
        self.policy_id = Some(policy_id.to_string());
        self
    }

    pub fn set_owner(mut self, account_id: AccountId) -> Self {
        self.owner_account_id = Some(account_id);
        self
    }

    /// Makes the chat a thread of `parent_report_action_id` in `parent_report_id`.
    pub fn set_parent(mut self, parent_report_id: &str, parent_report_action_id: &str) -> Self {
        self.parent = Some((parent_report_id.to_string(), parent_report_action_id.to_string()));
        self
    }

    pub fn set_own_policy_expense_chat(mut self, own: bool) -> Self {
        self.is_own_policy_expense_chat = own;
        self
    }

    pub fn set_invoice_receiver(mut self, receiver: InvoiceReceiver) -> Self {
        self.invoice_receiver = Some(receiver);
        self
    }

    pub fn set_notification_preference(mut self, preference: NotificationPreference) -> Self {
        self.notification_preference = preference;
        self
    }

    /// Reuses a known id instead of generating one.
    pub fn set_report_id(mut self, report_id: &str) -> Self {
        self.report_id = Some(report_id.to_string());
        self
    }

    pub fn build(self) -> Report {
        let participants: BTreeMap<String, ReportParticipant> = self
            .participants
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    ReportParticipant {
                        notification_preference: self.notification_preference,
                    },
                )
            })
            .collect();
        let (parent_report_id, parent_report_action_id) = self.parent.unzip();
        Report {
            report_id: self.report_id.unwrap_or_else(generate_id),
            report_type: ReportType::Chat,
            chat_type: self.chat_type,
            report_name: self.report_name,
            policy_id: self.policy_id,
            parent_report_id,
            parent_report_action_id,
            owner_account_id: self.owner_account_id,
            participants,
            state_num: Some(StateNum::Open),
            status_num: Some(StatusNum::Open),
            is_optimistic_report: Some(true),
            is_own_policy_expense_chat: self.is_own_policy_expense_chat.then_some(true),
            invoice_receiver: self.invoice_receiver,
            ..Default::default()
        }
    }
}

/// IOU report between two people. `payee` is owed `total` by `payer`.
pub fn build_optimistic_iou_report(
    payee: AccountId,
    payer: AccountId,
    total: i64,
    chat_report_id: &str,
    currency: &str,
) -> Report {
    let mut report = Report {
        report_id: generate_id(),
        report_type: ReportType::Iou,
        report_name: Some(format!("IOU {}", format_amount(total, currency))),
        chat_report_id: Some(chat_report_id.to_string()),
        parent_report_id: Some(chat_report_id.to_string()),
        owner_account_id: Some(payee),
        manager_id: Some(payer),
        currency: Some(currency.to_string()),
        total: Some(total),
        state_num: Some(StateNum::Submitted),
        status_num: Some(StatusNum::Submitted),
        participants: crate::report::participants_map(&[payee, payer]),
        is_optimistic_report: Some(true),
        ..Default::default()
    };
    report.refresh_cached_total();
    report
}

/// Expense report on a workspace chat. Totals are stored negative.
pub fn build_optimistic_expense_report(
    chat_report_id: &str,
    policy: Option<&Policy>,
    policy_id: &str,
    payee: AccountId,
    total: i64,
    currency: &str,
    reimbursable: bool,
) -> Report {
    let instant_submit = policy.is_some_and(Policy::is_instant_submit_enabled);
    let (state, status) = if instant_submit {
        (StateNum::Submitted, StatusNum::Submitted)
    } else {
        (StateNum::Open, StatusNum::Open)
    };
    let policy_name = policy.map(|p| p.name.as_str()).unwrap_or("Workspace");
    let mut report = Report {
        report_id: generate_id(),
        report_type: ReportType::Expense,
        report_name: Some(format!("{policy_name} owes {}", format_amount(total, currency))),
        chat_report_id: Some(chat_report_id.to_string()),
        parent_report_id: Some(chat_report_id.to_string()),
        policy_id: Some(policy_id.to_string()),
        owner_account_id: Some(payee),
        manager_id: policy.and_then(Policy::submit_to_account_id),
        currency: Some(currency.to_string()),
        total: Some(-total),
        non_reimbursable_total: Some(if reimbursable { 0 } else { -total }),
        state_num: Some(state),
        status_num: Some(status),
        participants: crate::report::participants_map(&[payee]),
        is_optimistic_report: Some(true),
        ..Default::default()
    };
    report.refresh_cached_total();
    report
}

/// Invoice report sent from the current user's workspace to `receiver`.
pub fn build_optimistic_invoice_report(
    chat_report_id: &str,
    policy_id: &str,
    sender: AccountId,
    receiver: AccountId,
    total: i64,
    currency: &str,
) -> Report {
    let mut report = Report {
        report_id: generate_id(),
        report_type: ReportType::Invoice,
        report_name: Some(format!("Invoice {}", format_amount(total, currency))),
        chat_report_id: Some(chat_report_id.to_string()),
        parent_report_id: Some(chat_report_id.to_string()),
        policy_id: Some(policy_id.to_string()),
        owner_account_id: Some(sender),
        manager_id: Some(receiver),
        currency: Some(currency.to_string()),
        total: Some(-total),
        non_reimbursable_total: Some(0),
        state_num: Some(StateNum::Submitted),
        status_num: Some(StatusNum::Open),
        participants: crate::report::participants_map(&[sender, receiver]),
        is_optimistic_report: Some(true),
        ..Default::default()
    };
    report.refresh_cached_total();
    report
}

/// Inputs of a new optimistic transaction. `amount` is already signed for the
/// report it lands on.
#[derive(Debug, Clone, Default)]
pub struct TransactionParams {
    pub transaction_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub report_id: String,
    pub comment: String,
    pub created: String,
    pub merchant: String,
    pub receipt: Option<Receipt>,
    pub filename: Option<String>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub tax_code: Option<String>,
    pub tax_amount: Option<i64>,
    pub billable: Option<bool>,
    pub reimbursable: Option<bool>,
    pub iou_request_type: Option<IouRequestType>,
    pub original_transaction_id: Option<String>,
    pub source: Option<String>,
    pub pending_fields: BTreeMap<String, PendingAction>,
}

pub fn build_optimistic_transaction(params: TransactionParams, clock: &OptimisticClock) -> Transaction {
    let comment = Comment {
        comment: (!params.comment.is_empty()).then(|| params.comment.clone()),
        original_transaction_id: params.original_transaction_id,
        kind: params.source,
        ..Default::default()
    };
    let merchant = if params.merchant.is_empty() {
        PARTIAL_TRANSACTION_MERCHANT.to_string()
    } else {
        params.merchant
    };
    let created = if params.created.is_empty() {
        clock.now().to_date_string()
    } else {
        params.created
    };
    Transaction {
        transaction_id: params.transaction_id.unwrap_or_else(generate_id),
        report_id: params.report_id,
        amount: params.amount,
        currency: params.currency,
        created,
        merchant,
        comment,
        category: params.category,
        tag: params.tag,
        tax_code: params.tax_code,
        tax_amount: params.tax_amount,
        billable: params.billable,
        reimbursable: params.reimbursable,
        receipt: params.receipt,
        filename: params.filename,
        iou_request_type: params.iou_request_type,
        pending_action: Some(PendingAction::Add),
        pending_fields: params.pending_fields,
        ..Default::default()
    }
}

pub fn build_optimistic_created_action(creator: AccountId, clock: &OptimisticClock) -> ReportAction {
    ReportAction::new(ActionName::Created, creator, clock.db_time()).with_text("created this report")
}

#[derive(Debug, Clone)]
pub struct IouActionParams {
    pub kind: IouActionType,
    pub amount: i64,
    pub currency: String,
    pub comment: String,
    pub participants: Vec<AccountId>,
    pub transaction_id: Option<String>,
    pub iou_report_id: Option<String>,
    pub payment_type: Option<PaymentMethodType>,
    pub actor: AccountId,
}

pub fn iou_action_text(kind: IouActionType, amount: i64, currency: &str, payment_type: Option<PaymentMethodType>) -> String {
    let formatted = format_amount(amount.abs(), currency);
    match (kind, payment_type) {
        (IouActionType::Create, _) => format!("requested {formatted}"),
        (IouActionType::Split, _) => format!("split {formatted}"),
        (IouActionType::Track, _) => format!("tracked {formatted}"),
        (IouActionType::Pay, Some(PaymentMethodType::Elsewhere)) => format!("paid {formatted} elsewhere"),
        (IouActionType::Pay, Some(PaymentMethodType::Vbba)) => format!("paid {formatted} with a bank account"),
        (IouActionType::Pay, _) => format!("paid {formatted} with Expensify"),
    }
}

pub fn build_optimistic_iou_action(params: IouActionParams, clock: &OptimisticClock) -> ReportAction {
    let message = IouMessage {
        amount: params.amount.abs(),
        currency: params.currency.clone(),
        comment: params.comment,
        kind: params.kind,
        iou_transaction_id: params.transaction_id,
        iou_report_id: params.iou_report_id,
        participant_account_ids: params.participants,
        payment_type: params.payment_type,
    };
    ReportAction::new(ActionName::Iou, params.actor, clock.db_time())
        .with_text(iou_action_text(params.kind, params.amount, &params.currency, params.payment_type))
        .with_original_message(&message)
}

/// One-line summary shown by a REPORTPREVIEW action.
pub fn report_preview_text(report: &Report) -> String {
    let total = if report.uses_negative_totals() { -report.total() } else { report.total() };
    let amount = format_amount(total, report.currency());
    match report.report_type {
        ReportType::Expense => format!("{} owes {amount}", report.report_name.as_deref().unwrap_or("Workspace")),
        ReportType::Invoice => format!("Invoice for {amount}"),
        _ => format!("owes {amount}"),
    }
}

pub fn build_optimistic_report_preview(
    chat_report: &Report,
    money_report: &Report,
    comment: &str,
    transaction: Option<&Transaction>,
    actor: AccountId,
    clock: &OptimisticClock,
) -> ReportAction {
    let mut action = ReportAction::new(ActionName::ReportPreview, actor, clock.db_time())
        .with_text(report_preview_text(money_report))
        .with_original_message(&json!({"linkedReportID": money_report.report_id}));
    action.child_report_id = Some(money_report.report_id.clone());
    action.child_money_request_count = Some(1);
    action.child_last_money_request_comment = (!comment.is_empty()).then(|| comment.to_string());
    if transaction.is_some_and(Transaction::is_receipt_being_scanned) {
        action.whispered_to_account_ids = vec![actor];
    }
    tracing::trace!(chat = %chat_report.report_id, action = %action.report_action_id, "built report preview");
    action
}

/// Refreshes an existing preview after a request was added to (or paid on) its report.
pub fn update_report_preview(
    money_report: &Report,
    preview: &ReportAction,
    is_payment: bool,
    comment: &str,
) -> ReportAction {
    let mut updated = preview.clone().with_text(report_preview_text(money_report));
    if !is_payment {
        updated.child_money_request_count = Some(preview.child_money_request_count.unwrap_or(0) + 1);
        if !comment.is_empty() {
            updated.child_last_money_request_comment = Some(comment.to_string());
        }
    }
    updated.pending_action = Some(PendingAction::Update);
    updated.errors.clear();
    updated
}

/// A transaction thread and the CREATED action that opens it. The action is
/// absent when an existing thread is reused.
#[derive(Debug, Clone)]
pub struct TransactionThread {
    pub report: Report,
    pub created_action: Option<ReportAction>,
}

pub fn build_transaction_thread(
    iou_action: &ReportAction,
    money_report: &Report,
    actor: AccountId,
    clock: &OptimisticClock,
) -> TransactionThread {
    let mut participants = vec![actor];
    participants.extend(money_report.owner_account_id);
    let mut report = ChatReportBuilder::new(&participants)
        .set_report_name(iou_action.text())
        .set_parent(&money_report.report_id, &iou_action.report_action_id)
        .set_owner(actor)
        .set_notification_preference(NotificationPreference::Hidden)
        .build();
    report.policy_id = money_report.policy_id.clone();
    TransactionThread {
        report,
        created_action: Some(build_optimistic_created_action(actor, clock)),
    }
}

/// Ordered action chain of a new money request.
#[derive(Debug, Clone)]
pub struct MoneyRequestEntities {
    pub chat_created_action: ReportAction,
    pub report_created_action: ReportAction,
    pub iou_action: ReportAction,
    pub thread: TransactionThread,
}

/// Builds the chat CREATED, report CREATED, IOU action and transaction thread
/// in that order. The clock guarantees each `created` sorts after the previous
/// one, so the report's CREATED action always precedes its first IOU action.
pub fn build_optimistic_money_request_entities(
    money_report: &Report,
    params: IouActionParams,
    existing_thread: Option<&Report>,
    clock: &OptimisticClock,
) -> MoneyRequestEntities {
    let actor = params.actor;
    let chat_created_action = build_optimistic_created_action(actor, clock);
    let report_created_action = build_optimistic_created_action(actor, clock);
    let mut iou_action = build_optimistic_iou_action(params, clock);

    let thread = match existing_thread {
        Some(existing) => {
            let mut report = existing.clone();
            report.parent_report_id = Some(money_report.report_id.clone());
            report.parent_report_action_id = Some(iou_action.report_action_id.clone());
            TransactionThread {
                report,
                created_action: None,
            }
        }
        None => build_transaction_thread(&iou_action, money_report, actor, clock),
    };
    iou_action.child_report_id = Some(thread.report.report_id.clone());

    MoneyRequestEntities {
        chat_created_action,
        report_created_action,
        iou_action,
        thread,
    }
}

/// MODIFIEDEXPENSE action describing an edit, with before/after values.
pub fn build_optimistic_modified_expense_action(
    transaction: &Transaction,
    changes: &TransactionChanges,
    is_from_expense_report: bool,
    actor: AccountId,
    clock: &OptimisticClock,
) -> ReportAction {
    let mut message = ModifiedExpenseMessage::default();
    let mut summary = Vec::new();

    if changes.amount.is_some() || changes.currency.is_some() {
        let old_amount = transaction.display_amount(is_from_expense_report);
        let old_currency = transaction.display_currency().to_string();
        let amount = changes.amount.unwrap_or(old_amount);
        let currency = changes.currency.clone().unwrap_or_else(|| old_currency.clone());
        summary.push(format!(
            "amount to {} (previously {})",
            format_amount(amount, &currency),
            format_amount(old_amount, &old_currency)
        ));
        message.old_amount = Some(old_amount);
        message.amount = Some(amount);
        message.old_currency = Some(old_currency);
        message.currency = Some(currency);
    }
    if let Some(merchant) = &changes.merchant {
        summary.push(format!("merchant to \"{merchant}\""));
        message.old_merchant = Some(transaction.display_merchant().to_string());
        message.merchant = Some(merchant.clone());
    }
    if let Some(created) = &changes.created {
        summary.push(format!("date to {created}"));
        message.old_created = Some(transaction.display_created().to_string());
        message.created = Some(created.clone());
    }
    if let Some(comment) = &changes.comment {
        summary.push("description".to_string());
        message.old_comment = Some(transaction.description().to_string());
        message.new_comment = Some(comment.clone());
    }
    if let Some(category) = &changes.category {
        summary.push(format!("category to \"{category}\""));
        message.old_category = transaction.category.clone();
        message.category = Some(category.clone());
    }
    if let Some(tag) = &changes.tag {
        summary.push(format!("tag to \"{tag}\""));
        message.old_tag = transaction.tag.clone();
        message.tag = Some(tag.clone());
    }
    if let Some(billable) = changes.billable {
        summary.push(if billable { "expense to billable" } else { "expense to non-billable" }.to_string());
        message.old_billable = transaction.billable;
        message.billable = Some(billable);
    }
    if let Some(tax_amount) = changes.tax_amount {
        summary.push("tax amount".to_string());
        message.old_tax_amount = transaction.tax_amount.map(i64::abs);
        message.tax_amount = Some(tax_amount);
    }
    if changes.waypoints.is_some() {
        summary.push("distance".to_string());
    }

    ReportAction::new(ActionName::ModifiedExpense, actor, clock.db_time())
        .with_text(format!("changed the {}", summary.join(", ")))
        .with_original_message(&message)
}

/// MODIFIEDEXPENSE action left on a tracked expense's thread when it moves to a report.
pub fn build_optimistic_moved_tracked_expense_action(
    moved_to_report_id: &str,
    actor: AccountId,
    clock: &OptimisticClock,
) -> ReportAction {
    let message = ModifiedExpenseMessage {
        moved_to_report_id: Some(moved_to_report_id.to_string()),
        ..Default::default()
    };
    ReportAction::new(ActionName::ModifiedExpense, actor, clock.db_time())
        .with_text("moved this expense")
        .with_original_message(&message)
}

fn report_amount_action(
    name: ActionName,
    verb: &str,
    amount: i64,
    currency: &str,
    report_id: &str,
    actor: AccountId,
    clock: &OptimisticClock,
) -> ReportAction {
    ReportAction::new(name, actor, clock.db_time())
        .with_text(format!("{verb} {}", format_amount(amount.abs(), currency)))
        .with_original_message(&json!({
            "amount": amount,
            "currency": currency,
            "expenseReportID": report_id,
        }))
}

pub fn build_optimistic_approved_action(amount: i64, currency: &str, report_id: &str, actor: AccountId, clock: &OptimisticClock) -> ReportAction {
    report_amount_action(ActionName::Approved, "approved", amount, currency, report_id, actor, clock)
}

pub fn build_optimistic_unapproved_action(amount: i64, currency: &str, report_id: &str, actor: AccountId, clock: &OptimisticClock) -> ReportAction {
    report_amount_action(ActionName::Unapproved, "unapproved", amount, currency, report_id, actor, clock)
}

pub fn build_optimistic_submitted_action(amount: i64, currency: &str, report_id: &str, actor: AccountId, clock: &OptimisticClock) -> ReportAction {
    report_amount_action(ActionName::Submitted, "submitted", amount, currency, report_id, actor, clock)
}

pub fn build_optimistic_cancel_payment_action(amount: i64, currency: &str, report_id: &str, actor: AccountId, clock: &OptimisticClock) -> ReportAction {
    let mut action = report_amount_action(ActionName::CancelledPayment, "cancelled the", amount, currency, report_id, actor, clock);
    if let Some(serde_json::Value::Object(message)) = action.original_message.as_mut() {
        message.insert("cancellationReason".into(), json!("CANCELLED_BY_USER"));
    }
    action
}

pub fn build_optimistic_hold_action(actor: AccountId, clock: &OptimisticClock) -> ReportAction {
    ReportAction::new(ActionName::Hold, actor, clock.db_time()).with_text("held this expense")
}

pub fn build_optimistic_unhold_action(actor: AccountId, clock: &OptimisticClock) -> ReportAction {
    ReportAction::new(ActionName::Unhold, actor, clock.db_time()).with_text("unheld this expense")
}

pub fn build_optimistic_add_comment_action(text: &str, actor: AccountId, clock: &OptimisticClock) -> ReportAction {
    ReportAction::new(ActionName::AddComment, actor, clock.db_time()).with_text(text)
}

/// Whisper on the self DM asking what to do with a freshly tracked expense.
pub fn build_optimistic_actionable_track_expense_whisper(
    transaction_id: &str,
    actor: AccountId,
    clock: &OptimisticClock,
) -> ReportAction {
    let mut action = ReportAction::new(ActionName::ActionableTrackExpenseWhisper, actor, clock.db_time())
        .with_text("What would you like to do with this expense?")
        .with_original_message(&json!({"transactionID": transaction_id}));
    action.whispered_to_account_ids = vec![actor];
    action
}

/// Placeholder details for a participant the client has never seen.
pub fn build_optimistic_personal_detail(participant: &Participant, account_id: AccountId) -> PersonalDetails {
    let login = participant.login.clone();
    PersonalDetails {
        account_id,
        display_name: participant.display_name.clone().filter(|n| !n.is_empty()).or_else(|| login.clone()),
        login,
        local_currency_code: None,
        is_optimistic_personal_detail: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iou_params(actor: AccountId) -> IouActionParams {
        IouActionParams {
            kind: IouActionType::Create,
            amount: 1234,
            currency: "USD".into(),
            comment: "lunch".into(),
            participants: vec![actor, 2],
            transaction_id: Some("t".into()),
            iou_report_id: Some("r".into()),
            payment_type: None,
            actor,
        }
    }

    #[test]
    fn created_actions_sort_before_iou_action() {
        let clock = OptimisticClock::new();
        let report = build_optimistic_iou_report(1, 2, 1234, "c", "USD");
        let entities = build_optimistic_money_request_entities(&report, iou_params(1), None, &clock);

        assert!(entities.chat_created_action.created < entities.report_created_action.created);
        assert!(entities.report_created_action.created < entities.iou_action.created);
        let thread_created = entities.thread.created_action.as_ref().unwrap();
        assert!(entities.iou_action.created < thread_created.created);
        assert_eq!(entities.iou_action.child_report_id.as_deref(), Some(entities.thread.report.report_id.as_str()));
        assert_eq!(
            entities.thread.report.parent_report_action_id.as_deref(),
            Some(entities.iou_action.report_action_id.as_str())
        );
        assert_eq!(entities.iou_action.text(), "requested $12.34");
    }

    #[test]
    fn reused_thread_keeps_its_id() {
        let clock = OptimisticClock::new();
        let report = build_optimistic_iou_report(1, 2, 1234, "c", "USD");
        let existing = ChatReportBuilder::new(&[1]).set_report_id("thread").build();
        let entities = build_optimistic_money_request_entities(&report, iou_params(1), Some(&existing), &clock);
        assert_eq!(entities.thread.report.report_id, "thread");
        assert!(entities.thread.created_action.is_none());
    }

    #[test]
    fn expense_reports_start_negative() {
        let report = build_optimistic_expense_report("c", None, "P", 1, 500, "USD", true);
        assert_eq!(report.total, Some(-500));
        assert_eq!(report.cached_total.as_deref(), Some("$5.00"));
        assert_eq!(report.state(), StateNum::Open);
    }

    #[test]
    fn transactions_default_merchant_and_date() {
        let clock = OptimisticClock::new();
        let transaction = build_optimistic_transaction(
            TransactionParams {
                amount: 100,
                currency: "USD".into(),
                report_id: "r".into(),
                ..Default::default()
            },
            &clock,
        );
        assert_eq!(transaction.merchant, PARTIAL_TRANSACTION_MERCHANT);
        assert_eq!(transaction.created.len(), 10);
        assert_eq!(transaction.pending_action, Some(PendingAction::Add));
    }
}
