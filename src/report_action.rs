//! Append-only report actions and their kind-specific payloads
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::report::ErrorMap;
use crate::types::{AccountId, PaymentMethodType, PendingAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionName {
    #[serde(rename = "CREATED")]
    Created,
    #[serde(rename = "IOU")]
    Iou,
    #[serde(rename = "REPORTPREVIEW")]
    ReportPreview,
    #[serde(rename = "MODIFIEDEXPENSE")]
    ModifiedExpense,
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "UNAPPROVED")]
    Unapproved,
    #[serde(rename = "SUBMITTED")]
    Submitted,
    #[serde(rename = "HOLD")]
    Hold,
    #[serde(rename = "UNHOLD")]
    Unhold,
    #[serde(rename = "REIMBURSEMENTDEQUEUED")]
    CancelledPayment,
    #[serde(rename = "ADDCOMMENT")]
    AddComment,
    #[serde(rename = "ACTIONABLETRACKEXPENSEWHISPER")]
    ActionableTrackExpenseWhisper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IouActionType {
    Create,
    Pay,
    Split,
    Track,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_edited: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_deleted_parent_action: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<String>,
}

impl Message {
    pub fn comment(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            kind: "COMMENT".to_string(),
            html: text.clone(),
            text,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.html.is_empty() && self.text.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportAction {
    #[serde(rename = "reportActionID")]
    pub report_action_id: String,
    pub action_name: ActionName,
    #[serde(rename = "actorAccountID", skip_serializing_if = "Option::is_none")]
    pub actor_account_id: Option<AccountId>,
    pub created: String,
    #[serde(default)]
    pub message: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_message: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_action: Option<PendingAction>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: ErrorMap,
    #[serde(rename = "childReportID", skip_serializing_if = "Option::is_none")]
    pub child_report_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_money_request_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_visible_action_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_last_money_request_comment: Option<String>,
    #[serde(rename = "whisperedToAccountIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub whispered_to_account_ids: Vec<AccountId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_optimistic_action: Option<bool>,
}

impl ReportAction {
    pub fn new(name: ActionName, actor: AccountId, created: String) -> Self {
        Self {
            report_action_id: crate::utils::generate_id(),
            action_name: name,
            actor_account_id: Some(actor),
            created,
            message: Vec::new(),
            original_message: None,
            pending_action: Some(PendingAction::Add),
            errors: ErrorMap::new(),
            child_report_id: None,
            child_money_request_count: None,
            child_visible_action_count: None,
            child_last_money_request_comment: None,
            whispered_to_account_ids: Vec::new(),
            is_optimistic_action: Some(true),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.message = vec![Message::comment(text)];
        self
    }

    pub fn with_original_message<T: Serialize>(mut self, payload: &T) -> Self {
        self.original_message = Some(crate::onyx::to_json(payload));
        self
    }

    pub fn text(&self) -> &str {
        self.message.first().map(|m| m.text.as_str()).unwrap_or_default()
    }

    pub fn html(&self) -> &str {
        self.message.first().map(|m| m.html.as_str()).unwrap_or_default()
    }

    /// Deleted actions keep their slot with an empty message.
    pub fn is_deleted(&self) -> bool {
        self.message.first().is_none_or(|m| m.deleted.is_some() || m.is_empty())
    }

    pub fn is_visible(&self) -> bool {
        self.pending_action != Some(PendingAction::Delete)
            && self.action_name != ActionName::Created
            && !self.is_deleted()
    }

    pub fn iou_message(&self) -> Option<IouMessage> {
        if self.action_name != ActionName::Iou {
            return None;
        }
        self.original_message
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn linked_report_id(&self) -> Option<String> {
        if self.action_name != ActionName::ReportPreview {
            return None;
        }
        self.original_message
            .as_ref()
            .and_then(|m| m.get("linkedReportID"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Transaction id of an actionable track-expense whisper.
    pub fn whisper_transaction_id(&self) -> Option<String> {
        if self.action_name != ActionName::ActionableTrackExpenseWhisper {
            return None;
        }
        self.original_message
            .as_ref()
            .and_then(|m| m.get("transactionID"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IouMessage {
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub comment: String,
    #[serde(rename = "type")]
    pub kind: IouActionType,
    #[serde(rename = "IOUTransactionID", skip_serializing_if = "Option::is_none")]
    pub iou_transaction_id: Option<String>,
    #[serde(rename = "IOUReportID", skip_serializing_if = "Option::is_none")]
    pub iou_report_id: Option<String>,
    #[serde(rename = "participantAccountIDs", default)]
    pub participant_account_ids: Vec<AccountId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_type: Option<PaymentMethodType>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedExpenseMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_merchant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_billable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_tax_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_amount: Option<i64>,
    #[serde(rename = "movedToReportID", skip_serializing_if = "Option::is_none")]
    pub moved_to_report_id: Option<String>,
}

/// Key of a single action inside a `reportActions_` collection member.
pub fn action_entry(action: &ReportAction) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(action.report_action_id.clone(), crate::onyx::to_json(action));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_message_uses_store_names() {
        let message = IouMessage {
            amount: 100,
            currency: "USD".into(),
            comment: String::new(),
            kind: IouActionType::Create,
            iou_transaction_id: Some("t".into()),
            iou_report_id: Some("r".into()),
            participant_account_ids: vec![1, 2],
            payment_type: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["IOUTransactionID"], "t");
        assert_eq!(json["type"], "create");

        let action = ReportAction::new(ActionName::Iou, 1, "2024-01-01 00:00:00.000".into())
            .with_text("owes $1.00")
            .with_original_message(&message);
        assert_eq!(action.iou_message(), Some(message));
        assert!(action.is_visible());
    }
}
