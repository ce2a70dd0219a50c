//! Transactions (single expense records) and the draft the user composes
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::report::ErrorMap;
use crate::types::{AccountId, IouRequestType, Participant, PendingAction, PARTIAL_TRANSACTION_MERCHANT};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Waypoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_for_list: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomUnit {
    #[serde(rename = "customUnitRateID", skip_serializing_if = "Option::is_none")]
    pub custom_unit_rate_id: Option<String>,
    /// Distance travelled, in the rate's unit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    #[serde(rename = "accountID")]
    pub account_id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitShare {
    pub amount: i64,
    #[serde(default)]
    pub is_modified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waypoints: Option<BTreeMap<String, Waypoint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_unit: Option<CustomUnit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub splits: Option<Vec<Split>>,
    /// Id of the HOLD report action while the expense is on hold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold: Option<String>,
    #[serde(rename = "originalTransactionID", skip_serializing_if = "Option::is_none")]
    pub original_transaction_id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReceiptState {
    Open,
    ScanReady,
    Scanning,
    ScanComplete,
    ScanFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ReceiptState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(rename = "transactionID")]
    pub transaction_id: String,
    #[serde(rename = "reportID", default)]
    pub report_id: String,
    /// Signed per report convention: negative on expense and invoice reports.
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub merchant: String,
    #[serde(default)]
    pub comment: Comment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reimbursable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Receipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iou_request_type: Option<IouRequestType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_action: Option<PendingAction>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pending_fields: BTreeMap<String, PendingAction>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: ErrorMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub error_fields: BTreeMap<String, ErrorMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_merchant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_waypoints: Option<BTreeMap<String, Waypoint>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub split_shares: BTreeMap<String, SplitShare>,
    #[serde(rename = "splitPayerAccountIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub split_payer_account_ids: Vec<AccountId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_from_global_create: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_loading: Option<bool>,
}

impl Transaction {
    /// Amount as the user sees it. Expense-report transactions are stored
    /// negative, so their sign is flipped back.
    pub fn display_amount(&self, is_from_expense_report: bool) -> i64 {
        let amount = self.modified_amount.unwrap_or(self.amount);
        if is_from_expense_report { -amount } else { amount.abs() }
    }
    pub fn display_currency(&self) -> &str {
        self.modified_currency
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.currency)
    }
    pub fn display_merchant(&self) -> &str {
        self.modified_merchant
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.merchant)
    }
    pub fn display_created(&self) -> &str {
        self.modified_created
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.created)
    }
    pub fn description(&self) -> &str {
        self.comment.comment.as_deref().unwrap_or_default()
    }
    pub fn is_distance_request(&self) -> bool {
        self.iou_request_type == Some(IouRequestType::Distance)
            || self.comment.custom_unit.as_ref().and_then(|u| u.name.as_deref()) == Some("Distance")
    }
    pub fn is_scan_request(&self) -> bool {
        self.iou_request_type == Some(IouRequestType::Scan) || self.has_receipt()
    }
    pub fn has_receipt(&self) -> bool {
        self.receipt.as_ref().is_some_and(|r| r.source.is_some())
    }
    pub fn is_receipt_being_scanned(&self) -> bool {
        matches!(
            self.receipt.as_ref().and_then(|r| r.state),
            Some(ReceiptState::ScanReady | ReceiptState::Scanning)
        )
    }
    pub fn is_on_hold(&self) -> bool {
        self.comment.hold.is_some()
    }
    pub fn is_reimbursable(&self) -> bool {
        self.reimbursable.unwrap_or(true)
    }
    pub fn has_partial_merchant(&self) -> bool {
        self.merchant.is_empty() || self.merchant == PARTIAL_TRANSACTION_MERCHANT
    }
    /// `{field: null}` for every pending field, clearing them on merge.
    pub fn cleared_pending_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        self.pending_fields
            .keys()
            .map(|field| (field.clone(), serde_json::Value::Null))
            .collect()
    }
}

/// Field edits requested on an existing transaction. `None` = unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionChanges {
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub created: Option<String>,
    pub merchant: Option<String>,
    pub comment: Option<String>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub billable: Option<bool>,
    pub tax_code: Option<String>,
    pub tax_amount: Option<i64>,
    pub waypoints: Option<BTreeMap<String, Waypoint>>,
    /// Measured length of the new route, in the mileage rate's unit.
    /// Only read together with `waypoints`.
    pub distance: Option<f64>,
}

impl TransactionChanges {
    /// Store field names of the changed fields, in a fixed order.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.amount.is_some() {
            fields.push("amount");
        }
        if self.currency.is_some() {
            fields.push("currency");
        }
        if self.created.is_some() {
            fields.push("created");
        }
        if self.merchant.is_some() {
            fields.push("merchant");
        }
        if self.comment.is_some() {
            fields.push("comment");
        }
        if self.category.is_some() {
            fields.push("category");
        }
        if self.tag.is_some() {
            fields.push("tag");
        }
        if self.billable.is_some() {
            fields.push("billable");
        }
        if self.tax_code.is_some() {
            fields.push("taxCode");
        }
        if self.tax_amount.is_some() {
            fields.push("taxAmount");
        }
        if self.waypoints.is_some() {
            fields.push("waypoints");
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.changed_fields().is_empty()
    }

    pub fn changes_amount_or_currency(&self) -> bool {
        self.amount.is_some() || self.currency.is_some()
    }
}

/// Applies `changes` as `modified*` overrides and marks each changed field pending.
///
/// Any edit to amount, currency, date, merchant or route stops SmartScan, so a
/// receipt mid-scan is reset to OPEN.
pub fn get_updated_transaction(
    transaction: &Transaction,
    changes: &TransactionChanges,
    is_from_expense_report: bool,
) -> Transaction {
    let mut updated = transaction.clone();
    let mut stops_smartscan = false;

    if let Some(comment) = &changes.comment {
        updated.comment.comment = Some(comment.clone());
    }
    if let Some(created) = &changes.created {
        updated.modified_created = Some(created.clone());
        stops_smartscan = true;
    }
    if let Some(amount) = changes.amount {
        updated.modified_amount = Some(if is_from_expense_report { -amount } else { amount });
        stops_smartscan = true;
    }
    if let Some(currency) = &changes.currency {
        updated.modified_currency = Some(currency.clone());
        stops_smartscan = true;
    }
    if let Some(merchant) = &changes.merchant {
        updated.modified_merchant = Some(merchant.clone());
        stops_smartscan = true;
    }
    if let Some(waypoints) = &changes.waypoints {
        updated.modified_waypoints = Some(waypoints.clone());
        updated.is_loading = Some(true);
        stops_smartscan = true;
    }
    if let Some(billable) = changes.billable {
        updated.billable = Some(billable);
    }
    if let Some(category) = &changes.category {
        updated.category = Some(category.clone());
    }
    if let Some(tag) = &changes.tag {
        updated.tag = Some(tag.clone());
    }
    if let Some(tax_amount) = changes.tax_amount {
        updated.tax_amount = Some(if is_from_expense_report { -tax_amount } else { tax_amount });
    }
    if let Some(tax_code) = &changes.tax_code {
        updated.tax_code = Some(tax_code.clone());
    }

    if stops_smartscan {
        if let Some(receipt) = updated.receipt.as_mut().filter(|r| r.state != Some(ReceiptState::Open)) {
            receipt.state = Some(ReceiptState::Open);
        }
    }

    updated.pending_fields = changes
        .changed_fields()
        .into_iter()
        .map(|field| (field.to_string(), PendingAction::Update))
        .collect();
    updated
}
