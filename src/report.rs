//! Reports: chats, money request (IOU) reports, expense and invoice reports
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::policy::Policy;
use crate::types::{AccountId, PendingAction, StateNum, StatusNum};

pub type ErrorMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    #[default]
    Chat,
    Iou,
    Expense,
    Invoice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatType {
    #[serde(rename = "policyExpenseChat")]
    PolicyExpenseChat,
    #[serde(rename = "group")]
    Group,
    #[serde(rename = "invoice")]
    Invoice,
    #[serde(rename = "selfDM")]
    SelfDm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPreference {
    #[default]
    Always,
    Daily,
    Hidden,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportParticipant {
    #[serde(default)]
    pub notification_preference: NotificationPreference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InvoiceReceiver {
    Individual {
        #[serde(rename = "accountID")]
        account_id: AccountId,
    },
    Policy {
        #[serde(rename = "policyID")]
        policy_id: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    #[serde(rename = "reportID")]
    pub report_id: String,
    #[serde(rename = "type", default)]
    pub report_type: ReportType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<ChatType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_name: Option<String>,
    #[serde(rename = "chatReportID", skip_serializing_if = "Option::is_none")]
    pub chat_report_id: Option<String>,
    #[serde(rename = "iouReportID", skip_serializing_if = "Option::is_none")]
    pub iou_report_id: Option<String>,
    #[serde(rename = "policyID", skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(rename = "parentReportID", skip_serializing_if = "Option::is_none")]
    pub parent_report_id: Option<String>,
    #[serde(rename = "parentReportActionID", skip_serializing_if = "Option::is_none")]
    pub parent_report_action_id: Option<String>,
    #[serde(rename = "ownerAccountID", skip_serializing_if = "Option::is_none")]
    pub owner_account_id: Option<AccountId>,
    #[serde(rename = "managerID", skip_serializing_if = "Option::is_none")]
    pub manager_id: Option<AccountId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub non_reimbursable_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unheld_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_total: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_num: Option<StateNum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_num: Option<StatusNum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_visible_action_created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_read_time: Option<String>,
    #[serde(rename = "lastActorAccountID", skip_serializing_if = "Option::is_none")]
    pub last_actor_account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub participants: BTreeMap<String, ReportParticipant>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pending_fields: BTreeMap<String, PendingAction>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub error_fields: BTreeMap<String, ErrorMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_action: Option<PendingAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_optimistic_report: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_outstanding_child_request: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_waiting_on_bank_account: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_own_policy_expense_chat: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_archived: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_receiver: Option<InvoiceReceiver>,
}

impl Report {
    pub fn is_chat_report(&self) -> bool {
        self.report_type == ReportType::Chat
    }
    pub fn is_iou_report(&self) -> bool {
        self.report_type == ReportType::Iou
    }
    pub fn is_expense_report(&self) -> bool {
        self.report_type == ReportType::Expense
    }
    pub fn is_invoice_report(&self) -> bool {
        self.report_type == ReportType::Invoice
    }
    pub fn is_money_request_report(&self) -> bool {
        self.is_iou_report() || self.is_expense_report()
    }
    /// Expense and invoice reports keep their totals negative.
    pub fn uses_negative_totals(&self) -> bool {
        self.is_expense_report() || self.is_invoice_report()
    }
    pub fn is_policy_expense_chat(&self) -> bool {
        self.chat_type == Some(ChatType::PolicyExpenseChat)
    }
    pub fn is_self_dm(&self) -> bool {
        self.chat_type == Some(ChatType::SelfDm)
    }
    pub fn is_invoice_room(&self) -> bool {
        self.chat_type == Some(ChatType::Invoice)
    }
    pub fn is_group_chat(&self) -> bool {
        self.chat_type == Some(ChatType::Group)
    }
    /// A chat hanging off a single report action, e.g. a transaction thread.
    pub fn is_thread(&self) -> bool {
        self.parent_report_id.is_some() && self.parent_report_action_id.is_some()
    }
    pub fn is_archived(&self) -> bool {
        self.is_archived.unwrap_or(false)
    }
    pub fn state(&self) -> StateNum {
        self.state_num.unwrap_or(StateNum::Open)
    }
    pub fn status(&self) -> StatusNum {
        self.status_num.unwrap_or(StatusNum::Open)
    }
    pub fn is_open_expense_report(&self) -> bool {
        self.is_expense_report() && self.state() == StateNum::Open
    }
    pub fn is_processing(&self) -> bool {
        self.state() == StateNum::Submitted && self.status() == StatusNum::Submitted
    }
    pub fn is_approved(&self) -> bool {
        self.state() == StateNum::Approved && self.status() == StatusNum::Approved
    }
    pub fn is_settled(&self) -> bool {
        self.status() == StatusNum::Reimbursed
    }
    pub fn is_closed(&self) -> bool {
        self.status() == StatusNum::Closed
    }
    pub fn total(&self) -> i64 {
        self.total.unwrap_or(0)
    }
    pub fn non_reimbursable_total(&self) -> i64 {
        self.non_reimbursable_total.unwrap_or(0)
    }
    pub fn currency(&self) -> &str {
        self.currency.as_deref().unwrap_or_default()
    }
    pub fn participant_account_ids(&self) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = self
            .participants
            .keys()
            .filter_map(|id| id.parse().ok())
            .collect();
        ids.sort_unstable();
        ids
    }
    pub fn has_participant(&self, account_id: AccountId) -> bool {
        self.participants.contains_key(&account_id.to_string())
    }
    pub fn is_created_optimistically(&self) -> bool {
        self.pending_fields.get("createChat") == Some(&PendingAction::Add)
    }

    /// Spend the payer still owes: total minus non-reimbursable spend, always positive.
    pub fn reimbursable_spend(&self) -> i64 {
        (self.total() - self.non_reimbursable_total()).abs()
    }

    /// Recomputes the display total after any change to `total`.
    pub fn refresh_cached_total(&mut self) {
        let display = if self.uses_negative_totals() { -self.total() } else { self.total() };
        self.cached_total = Some(crate::utils::format_amount(display, self.currency()));
    }
}

pub fn participants_map(account_ids: &[AccountId]) -> BTreeMap<String, ReportParticipant> {
    account_ids
        .iter()
        .map(|id| (id.to_string(), ReportParticipant::default()))
        .collect()
}

/// Decides whether a new money request report is needed for `chat` instead of
/// adding to `existing`. A report is reusable while it belongs to that chat and
/// is still open to new expenses.
pub fn should_create_new_money_request_report(
    existing: Option<&Report>,
    chat: &Report,
    policy: Option<&Policy>,
) -> bool {
    let Some(report) = existing else {
        return true;
    };
    if chat.is_waiting_on_bank_account.unwrap_or(false) {
        return true;
    }
    if report.chat_report_id.as_deref() != Some(chat.report_id.as_str()) || report.is_archived() {
        return true;
    }
    !can_add_transactions(report, policy)
}

/// Whether expenses may still be added to or removed from a money request report.
pub fn can_add_transactions(report: &Report, policy: Option<&Policy>) -> bool {
    if !report.is_money_request_report() || report.is_settled() || report.is_closed() {
        return false;
    }
    if report.is_approved() || report.state() == StateNum::Approved {
        return false;
    }
    if report.is_expense_report() && report.is_processing() {
        // only instant-submit workspaces keep accepting expenses after submission
        return policy.is_some_and(|p| p.is_instant_submit_enabled());
    }
    true
}

/// Adds (or removes, when deleting) `amount` from an IOU report, flipping
/// owner and manager when the balance changes direction. A currency other than
/// the report's leaves the report untouched.
pub fn update_iou_owner_and_total(
    report: &Report,
    actor_account_id: AccountId,
    amount: i64,
    currency: &str,
    is_deleting: bool,
) -> Report {
    if currency != report.currency() {
        return report.clone();
    }
    let mut updated = report.clone();
    let signed = if Some(actor_account_id) == report.owner_account_id {
        if is_deleting { -amount } else { amount }
    } else if is_deleting {
        amount
    } else {
        -amount
    };
    let mut total = report.total() + signed;
    if total < 0 {
        std::mem::swap(&mut updated.owner_account_id, &mut updated.manager_id);
        total = -total;
    }
    updated.total = Some(total);
    updated.refresh_cached_total();
    updated
}

/// Adds `amount` to an expense or invoice report. Both keep negative totals, so
/// the stored total decreases. Non-reimbursable spend is tracked separately.
pub fn add_to_expense_total(report: &Report, amount: i64, currency: &str, reimbursable: bool) -> Report {
    let mut updated = report.clone();
    if currency != report.currency() {
        return updated;
    }
    updated.total = Some(report.total() - amount);
    if !reimbursable {
        updated.non_reimbursable_total = Some(report.non_reimbursable_total() - amount);
    }
    updated.refresh_cached_total();
    updated
}

/// Whether the current user has something to act on in a money request report.
pub fn outstanding_child_request(report: &Report, current_account_id: AccountId) -> bool {
    !report.is_settled()
        && !report.is_closed()
        && report.manager_id == Some(current_account_id)
        && report.reimbursable_spend() != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iou(owner: AccountId, manager: AccountId, total: i64) -> Report {
        Report {
            report_id: "10".into(),
            report_type: ReportType::Iou,
            chat_report_id: Some("1".into()),
            owner_account_id: Some(owner),
            manager_id: Some(manager),
            currency: Some("USD".into()),
            total: Some(total),
            ..Default::default()
        }
    }

    #[test]
    fn owner_request_increases_total() {
        let updated = update_iou_owner_and_total(&iou(1, 2, 500), 1, 300, "USD", false);
        assert_eq!(updated.total, Some(800));
        assert_eq!(updated.owner_account_id, Some(1));
    }

    #[test]
    fn manager_request_past_zero_flips_direction() {
        let updated = update_iou_owner_and_total(&iou(1, 2, 500), 2, 800, "USD", false);
        assert_eq!(updated.total, Some(300));
        assert_eq!(updated.owner_account_id, Some(2));
        assert_eq!(updated.manager_id, Some(1));
    }

    #[test]
    fn foreign_currency_is_ignored() {
        let updated = update_iou_owner_and_total(&iou(1, 2, 500), 1, 300, "EUR", false);
        assert_eq!(updated.total, Some(500));
    }

    #[test]
    fn expense_totals_move_negative() {
        let report = Report {
            report_type: ReportType::Expense,
            currency: Some("USD".into()),
            total: Some(-100),
            ..Default::default()
        };
        let updated = add_to_expense_total(&report, 250, "USD", false);
        assert_eq!(updated.total, Some(-350));
        assert_eq!(updated.non_reimbursable_total, Some(-250));
        assert_eq!(add_to_expense_total(&report, 250, "EUR", true).total, Some(-100));
    }

    #[test]
    fn settled_reports_are_not_reused() {
        let chat = Report { report_id: "1".into(), ..Default::default() };
        let mut report = iou(1, 2, 500);
        assert!(!should_create_new_money_request_report(Some(&report), &chat, None));
        report.status_num = Some(StatusNum::Reimbursed);
        assert!(should_create_new_money_request_report(Some(&report), &chat, None));
        assert!(should_create_new_money_request_report(None, &chat, None));
    }

    #[test]
    fn report_json_uses_store_field_names() {
        let json = serde_json::to_value(iou(1, 2, 5)).unwrap();
        assert_eq!(json["reportID"], "10");
        assert_eq!(json["type"], "iou");
        assert_eq!(json["ownerAccountID"], 1);
        assert!(json.get("pendingFields").is_none());
    }
}
