//! Deleting a money request from its report, or a tracked expense from the self DM
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::assembler::{actions_patch, error_map};
use crate::builder::report_preview_text;
use crate::context::EngineContext;
use crate::error::ErrorMessage;
use crate::onyx::{OnyxData, OnyxKey, OnyxUpdate, to_json};
use crate::report::{self, Report};
use crate::report_action::ReportAction;
use crate::transaction::Transaction;
use crate::types::PendingAction;

/// How the actionable whisper of a tracked expense was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhisperResolution {
    Nothing,
    Request,
    Categorize,
    Share,
}

#[derive(Debug, Clone)]
pub struct DeleteInformation {
    pub transaction_id: String,
    pub report_action_id: String,
    pub chat_report_id: String,
    pub iou_report_id: Option<String>,
    pub should_delete_transaction_thread: bool,
    pub should_delete_iou_report: bool,
    pub actionable_whisper_report_action_id: Option<String>,
    pub onyx_data: OnyxData,
}

impl DeleteInformation {
    pub fn params(&self) -> Value {
        json!({
            "transactionID": self.transaction_id,
            "reportActionID": self.report_action_id,
        })
    }

    /// Report to show once the delete is applied, when the one on screen goes away.
    pub fn navigation_target(&self, is_single_transaction_view: bool) -> Option<String> {
        match &self.iou_report_id {
            Some(_) if self.should_delete_iou_report => Some(self.chat_report_id.clone()),
            Some(iou_report_id) if is_single_transaction_view && self.should_delete_transaction_thread => {
                Some(iou_report_id.clone())
            }
            None if is_single_transaction_view && self.should_delete_transaction_thread => {
                Some(self.chat_report_id.clone())
            }
            _ => None,
        }
    }
}

/// Merge value blanking a deleted IOU action. The slot stays with an
/// "[Deleted expense]" marker while its thread still has comments.
fn deleted_action_patch(action: &ReportAction, keep_deleted_marker: bool) -> Value {
    let pending = if keep_deleted_marker {
        PendingAction::Update
    } else {
        PendingAction::Delete
    };
    json!({
        "pendingAction": pending,
        "previousMessage": to_json(&action.message),
        "message": [{
            "type": "COMMENT",
            "html": "",
            "text": "",
            "isEdited": true,
            "isDeletedParentAction": keep_deleted_marker,
        }],
        "originalMessage": {"IOUTransactionID": null},
        "errors": null,
    })
}

/// Puts an action back as it was and attaches the delete error.
fn restored_action(action: &ReportAction, error_key: &str) -> Value {
    let mut value = to_json(action);
    if let Value::Object(map) = &mut value {
        map.insert("pendingAction".into(), Value::Null);
        map.insert("previousMessage".into(), Value::Null);
        map.insert(
            "errors".into(),
            error_map(error_key, ErrorMessage::GenericDeleteFailure),
        );
    }
    value
}

/// Actions still shown once `excluded` are gone. A deleted IOU action whose
/// thread survives keeps showing as a marker and counts as visible.
fn remaining_visible<'a>(actions: &'a BTreeMap<String, ReportAction>, excluded: &str) -> Vec<&'a ReportAction> {
    let mut remaining: Vec<&ReportAction> = actions
        .values()
        .filter(|action| action.report_action_id != excluded)
        .filter(|action| {
            action.is_visible()
                || (action.pending_action != Some(PendingAction::Delete)
                    && action
                        .message
                        .first()
                        .is_some_and(|m| m.is_deleted_parent_action == Some(true)))
        })
        .collect();
    remaining.sort_by(|a, b| a.created.cmp(&b.created));
    remaining
}

fn last_message_patch(remaining: &[&ReportAction]) -> Value {
    let last = remaining.last();
    json!({
        "lastMessageText": last.map(|a| a.text()).unwrap_or_default(),
        "lastMessageHtml": last.map(|a| a.html()).unwrap_or_default(),
        "lastVisibleActionCreated": last.map(|a| a.created.clone()),
    })
}

fn clear_or_restore<T: Serialize>(key: OnyxKey, snapshot: Option<&T>) -> OnyxUpdate {
    match snapshot {
        Some(value) => OnyxUpdate::set(key, to_json(value)),
        None => OnyxUpdate::clear(key),
    }
}

/// Removes the report-side totals of `transaction` from its money report.
fn remove_from_totals(report: &Report, transaction: Option<&Transaction>, actor: i64) -> Report {
    let Some(transaction) = transaction else {
        return report.clone();
    };
    let currency = transaction.display_currency();
    if report.is_expense_report() || report.is_invoice_report() {
        if currency != report.currency() {
            return report.clone();
        }
        let amount = transaction.display_amount(true);
        let mut updated = report.clone();
        updated.total = Some(report.total() + amount);
        if !transaction.is_reimbursable() {
            updated.non_reimbursable_total = Some(report.non_reimbursable_total() + amount);
        }
        updated.refresh_cached_total();
        updated
    } else {
        report::update_iou_owner_and_total(report, actor, transaction.display_amount(false), currency, true)
    }
}

/// Patches removing one money request. The money report goes too when
/// nothing visible is left on it and the transaction thread is going as well.
pub fn get_delete_money_request_information(
    ctx: &EngineContext,
    transaction_id: &str,
    action: &ReportAction,
) -> anyhow::Result<Option<DeleteInformation>> {
    // Load everything the delete touches
    let Some(iou_report_id) = action.iou_message().and_then(|m| m.iou_report_id) else {
        warn!(action_id = %action.report_action_id, "action is not a money request");
        return Ok(None);
    };
    let Some(iou_report) = ctx.report(&iou_report_id)? else {
        warn!(%iou_report_id, "money request report is missing");
        return Ok(None);
    };
    let chat_report_id = iou_report.chat_report_id.clone().unwrap_or_default();
    let chat_report = ctx.report(&chat_report_id)?;
    let preview = ctx.report_preview_action(&chat_report_id, &iou_report_id)?;
    let transaction = ctx.transaction(transaction_id)?;
    let violations = ctx.violations(transaction_id)?;
    let thread_id = action.child_report_id.clone();
    let thread = match &thread_id {
        Some(id) => ctx.report(id)?,
        None => None,
    };
    let thread_actions = match &thread_id {
        Some(id) => ctx.report_actions(id)?,
        None => BTreeMap::new(),
    };
    let current = ctx.current_account_id();
    let error_key = ctx.clock.error_key();

    // Decide what goes away
    let should_delete_thread = thread_id.is_some() && action.child_visible_action_count.unwrap_or(0) == 0;
    let keep_deleted_marker = thread_id.is_some() && !should_delete_thread;
    let iou_actions = ctx.report_actions(&iou_report_id)?;
    let remaining = remaining_visible(&iou_actions, &action.report_action_id);
    let should_delete_iou_report = remaining.is_empty() && (thread_id.is_none() || should_delete_thread);
    debug!(
        should_delete_thread,
        should_delete_iou_report, "deleting money request {transaction_id}"
    );

    // New totals and preview
    let actor = action.actor_account_id.unwrap_or(current);
    let mut updated_report = remove_from_totals(&iou_report, transaction.as_ref(), actor);
    let last = remaining.last();
    updated_report.last_message_text = Some(last.map(|a| a.text().to_string()).unwrap_or_default());
    updated_report.last_visible_action_created = last.map(|a| a.created.clone());

    let updated_preview = preview.as_ref().map(|preview| {
        let mut updated = preview.clone();
        updated.pending_action = Some(if should_delete_iou_report {
            PendingAction::Delete
        } else {
            PendingAction::Update
        });
        if let Some(message) = updated.message.first_mut() {
            message.text = report_preview_text(&updated_report);
            message.html = message.text.clone();
            message.deleted = should_delete_iou_report.then(|| ctx.clock.db_time());
        }
        if let Some(count) = preview.child_money_request_count.filter(|count| *count > 0) {
            updated.child_money_request_count = Some(count - 1);
        }
        updated
    });

    let mut data = OnyxData::new();
    let transaction_key = OnyxKey::Transaction(transaction_id.to_string());
    let violations_key = OnyxKey::TransactionViolations(transaction_id.to_string());
    let iou_actions_key = OnyxKey::ReportActions(iou_report_id.clone());
    let iou_report_key = OnyxKey::Report(iou_report_id.clone());
    let chat_actions_key = OnyxKey::ReportActions(chat_report_id.clone());
    let chat_key = OnyxKey::Report(chat_report_id.clone());

    // optimistic
    data.optimistic_data.push(OnyxUpdate::clear(transaction_key.clone()));
    if ctx.config.violations_enabled {
        data.optimistic_data.push(OnyxUpdate::clear(violations_key.clone()));
    }
    if let Some(thread_id) = thread_id.as_ref().filter(|_| should_delete_thread) {
        data.optimistic_data
            .push(OnyxUpdate::clear(OnyxKey::Report(thread_id.clone())));
        data.optimistic_data
            .push(OnyxUpdate::clear(OnyxKey::ReportActions(thread_id.clone())));
    }
    data.optimistic_data.push(OnyxUpdate::merge(
        iou_actions_key.clone(),
        actions_patch(vec![(
            action.report_action_id.clone(),
            deleted_action_patch(action, keep_deleted_marker),
        )]),
    ));
    data.optimistic_data
        .push(OnyxUpdate::merge(iou_report_key.clone(), to_json(&updated_report)));
    if let Some(updated) = &updated_preview {
        data.optimistic_data.push(OnyxUpdate::merge(
            chat_actions_key.clone(),
            actions_patch(vec![(updated.report_action_id.clone(), to_json(updated))]),
        ));
    }
    let outstanding = !should_delete_iou_report
        && updated_preview
            .as_ref()
            .is_none_or(|p| p.child_money_request_count != Some(0))
        && report::outstanding_child_request(&updated_report, current);
    let chat_patch = if should_delete_iou_report {
        let chat_actions = ctx.report_actions(&chat_report_id)?;
        let preview_id = preview.as_ref().map(|p| p.report_action_id.as_str()).unwrap_or_default();
        let mut patch = last_message_patch(&remaining_visible(&chat_actions, preview_id));
        if let Value::Object(map) = &mut patch {
            map.insert("hasOutstandingChildRequest".into(), Value::Bool(false));
            map.insert("iouReportID".into(), Value::Null);
        }
        patch
    } else {
        json!({"hasOutstandingChildRequest": outstanding})
    };
    data.optimistic_data
        .push(OnyxUpdate::merge(chat_key.clone(), chat_patch));

    // success
    data.success_data.push(OnyxUpdate::merge(
        iou_actions_key.clone(),
        actions_patch(vec![(
            action.report_action_id.clone(),
            if should_delete_iou_report {
                Value::Null
            } else {
                json!({"pendingAction": null})
            },
        )]),
    ));
    if let Some(preview) = &preview {
        data.success_data.push(OnyxUpdate::merge(
            chat_actions_key.clone(),
            actions_patch(vec![(
                preview.report_action_id.clone(),
                json!({"pendingAction": null, "errors": null}),
            )]),
        ));
    }
    if should_delete_iou_report {
        data.success_data.push(OnyxUpdate::clear(iou_report_key.clone()));
    }

    // failure
    data.failure_data
        .push(clear_or_restore(transaction_key, transaction.as_ref()));
    if ctx.config.violations_enabled {
        data.failure_data.push(if violations.is_empty() {
            OnyxUpdate::clear(violations_key)
        } else {
            OnyxUpdate::set(violations_key, to_json(&violations))
        });
    }
    if let Some(thread_id) = thread_id.as_ref().filter(|_| should_delete_thread) {
        data.failure_data
            .push(clear_or_restore(OnyxKey::Report(thread_id.clone()), thread.as_ref()));
        data.failure_data.push(clear_or_restore(
            OnyxKey::ReportActions(thread_id.clone()),
            (!thread_actions.is_empty()).then_some(&thread_actions),
        ));
    }
    data.failure_data.push(OnyxUpdate::merge(
        iou_actions_key,
        actions_patch(vec![(
            action.report_action_id.clone(),
            restored_action(action, &error_key),
        )]),
    ));
    data.failure_data
        .push(OnyxUpdate::set(iou_report_key, to_json(&iou_report)));
    if let Some(preview) = &preview {
        data.failure_data.push(OnyxUpdate::merge(
            chat_actions_key,
            actions_patch(vec![(
                preview.report_action_id.clone(),
                restored_action(preview, &error_key),
            )]),
        ));
    }
    if let Some(chat) = &chat_report {
        data.failure_data.push(OnyxUpdate::set(chat_key, to_json(chat)));
    }

    Ok(Some(DeleteInformation {
        transaction_id: transaction_id.to_string(),
        report_action_id: action.report_action_id.clone(),
        chat_report_id,
        iou_report_id: Some(iou_report_id),
        should_delete_transaction_thread: should_delete_thread,
        should_delete_iou_report,
        actionable_whisper_report_action_id: None,
        onyx_data: data,
    }))
}

/// Patches removing a tracked expense from the self DM. With
/// `preserve_transaction` the transaction and its thread are left in place
/// so the expense can be moved onto a report.
pub fn get_delete_track_expense_information(
    ctx: &EngineContext,
    chat_report_id: &str,
    transaction_id: &str,
    action: &ReportAction,
    preserve_transaction: bool,
    resolution: WhisperResolution,
) -> anyhow::Result<Option<DeleteInformation>> {
    let Some(chat_report) = ctx.report(chat_report_id)? else {
        warn!(%chat_report_id, "chat of the tracked expense is missing");
        return Ok(None);
    };
    let transaction = ctx.transaction(transaction_id)?;
    let violations = ctx.violations(transaction_id)?;
    let whisper = ctx.track_expense_whisper(chat_report_id, transaction_id)?;
    let thread_id = action.child_report_id.clone();
    let thread = match &thread_id {
        Some(id) => ctx.report(id)?,
        None => None,
    };
    let thread_actions = match &thread_id {
        Some(id) => ctx.report_actions(id)?,
        None => BTreeMap::new(),
    };
    let error_key = ctx.clock.error_key();

    let should_delete_thread =
        !preserve_transaction && thread_id.is_some() && action.child_visible_action_count.unwrap_or(0) == 0;
    let keep_deleted_marker = !preserve_transaction && thread_id.is_some() && !should_delete_thread;

    let chat_actions = ctx.report_actions(chat_report_id)?;
    let remaining = remaining_visible(&chat_actions, &action.report_action_id);

    let mut data = OnyxData::new();
    let transaction_key = OnyxKey::Transaction(transaction_id.to_string());
    let violations_key = OnyxKey::TransactionViolations(transaction_id.to_string());
    let chat_actions_key = OnyxKey::ReportActions(chat_report_id.to_string());
    let chat_key = OnyxKey::Report(chat_report_id.to_string());

    // optimistic
    if !preserve_transaction {
        data.optimistic_data.push(OnyxUpdate::clear(transaction_key.clone()));
    }
    if ctx.config.violations_enabled {
        data.optimistic_data.push(OnyxUpdate::clear(violations_key.clone()));
    }
    if let Some(thread_id) = thread_id.as_ref().filter(|_| should_delete_thread) {
        data.optimistic_data
            .push(OnyxUpdate::clear(OnyxKey::Report(thread_id.clone())));
        data.optimistic_data
            .push(OnyxUpdate::clear(OnyxKey::ReportActions(thread_id.clone())));
    }
    let mut entries = vec![(
        action.report_action_id.clone(),
        deleted_action_patch(action, keep_deleted_marker),
    )];
    if let Some(whisper) = &whisper {
        entries.push((
            whisper.report_action_id.clone(),
            json!({"originalMessage": {"resolution": resolution}}),
        ));
    }
    data.optimistic_data
        .push(OnyxUpdate::merge(chat_actions_key.clone(), actions_patch(entries)));
    data.optimistic_data
        .push(OnyxUpdate::merge(chat_key.clone(), last_message_patch(&remaining)));

    // success
    data.success_data.push(OnyxUpdate::merge(
        chat_actions_key.clone(),
        actions_patch(vec![(
            action.report_action_id.clone(),
            json!({"pendingAction": null, "errors": null}),
        )]),
    ));

    // failure
    if !preserve_transaction {
        data.failure_data
            .push(clear_or_restore(transaction_key, transaction.as_ref()));
    }
    if ctx.config.violations_enabled {
        data.failure_data.push(if violations.is_empty() {
            OnyxUpdate::clear(violations_key)
        } else {
            OnyxUpdate::set(violations_key, to_json(&violations))
        });
    }
    if let Some(thread_id) = thread_id.as_ref().filter(|_| should_delete_thread) {
        data.failure_data
            .push(clear_or_restore(OnyxKey::Report(thread_id.clone()), thread.as_ref()));
        data.failure_data.push(clear_or_restore(
            OnyxKey::ReportActions(thread_id.clone()),
            (!thread_actions.is_empty()).then_some(&thread_actions),
        ));
    }
    let mut restored = vec![(
        action.report_action_id.clone(),
        restored_action(action, &error_key),
    )];
    if let Some(whisper) = &whisper {
        let previous = whisper
            .original_message
            .as_ref()
            .and_then(|m| m.get("resolution"))
            .cloned()
            .unwrap_or(Value::Null);
        restored.push((
            whisper.report_action_id.clone(),
            json!({"originalMessage": {"resolution": previous}}),
        ));
    }
    data.failure_data
        .push(OnyxUpdate::merge(chat_actions_key, actions_patch(restored)));
    data.failure_data
        .push(OnyxUpdate::set(chat_key, to_json(&chat_report)));

    Ok(Some(DeleteInformation {
        transaction_id: transaction_id.to_string(),
        report_action_id: action.report_action_id.clone(),
        chat_report_id: chat_report_id.to_string(),
        iou_report_id: None,
        should_delete_transaction_thread: should_delete_thread,
        should_delete_iou_report: false,
        actionable_whisper_report_action_id: whisper.map(|w| w.report_action_id),
        onyx_data: data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report_action::{ActionName, Message};

    fn action(id: &str, created: &str) -> ReportAction {
        let mut action = ReportAction::new(ActionName::AddComment, 1, created.into()).with_text("hi");
        action.report_action_id = id.into();
        action.pending_action = None;
        action
    }

    #[test]
    fn deleted_markers_still_count_as_visible() {
        let mut actions = BTreeMap::new();
        actions.insert("a".to_string(), action("a", "2024-01-01 00:00:00.000"));
        let mut marker = action("b", "2024-01-02 00:00:00.000");
        marker.message = vec![Message {
            kind: "COMMENT".into(),
            is_deleted_parent_action: Some(true),
            ..Default::default()
        }];
        actions.insert("b".to_string(), marker);

        assert_eq!(remaining_visible(&actions, "a").len(), 1);
        let mut created = action("c", "2024-01-01 00:00:00.000");
        created.action_name = ActionName::Created;
        let only_created = BTreeMap::from([("c".to_string(), created)]);
        assert!(remaining_visible(&only_created, "x").is_empty());
    }

    #[test]
    fn failed_delete_clears_the_pending_marker() {
        let restored = restored_action(&action("a", "2024-01-01 00:00:00.000"), "123");
        assert_eq!(restored["pendingAction"], Value::Null);
        assert_eq!(restored["errors"]["123"], ErrorMessage::GenericDeleteFailure.text());
        assert_eq!(restored["message"][0]["text"], "hi");
    }
}
