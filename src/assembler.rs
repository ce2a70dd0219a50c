//! Optimistic/success/failure patch lists for creating money requests,
//! invoices and tracked expenses.
//!
//! Failure lists roll every entity that existed before the flow back to its
//! snapshot with a SET. Entities created optimistically keep their `Add`
//! markers and gain an error, so the user can see and dismiss them.
use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use crate::error::ErrorMessage;
use crate::next_step::NextStep;
use crate::onyx::{OnyxData, OnyxKey, OnyxUpdate, revert_patch, to_json};
use crate::policy::PolicyContext;
use crate::report::Report;
use crate::report_action::ReportAction;
use crate::transaction::Transaction;
use crate::types::{PendingAction, PersonalDetails, QuickAction, TransactionRef};
use crate::violations::{self, Violation};

/// An entity as the flow leaves it, plus its stored value from before the
/// flow when it already existed.
#[derive(Debug, Clone)]
pub struct Resolved<T> {
    pub value: T,
    pub snapshot: Option<T>,
}

impl<T: Clone> Resolved<T> {
    pub fn created(value: T) -> Self {
        Self { value, snapshot: None }
    }

    pub fn existing(snapshot: T) -> Self {
        Self {
            value: snapshot.clone(),
            snapshot: Some(snapshot),
        }
    }

    pub fn is_new(&self) -> bool {
        self.snapshot.is_none()
    }
}

/// Every entity a create flow touches.
#[derive(Debug, Clone)]
pub struct MoneyRequestParts {
    pub chat_report: Resolved<Report>,
    /// Absent for expenses tracked on the self DM.
    pub money_report: Option<Resolved<Report>>,
    pub transaction: Resolved<Transaction>,
    pub chat_created_action: Option<ReportAction>,
    pub report_created_action: Option<ReportAction>,
    pub iou_action: ReportAction,
    pub thread: Resolved<Report>,
    pub thread_created_action: Option<ReportAction>,
    pub report_preview: Option<Resolved<ReportAction>>,
    pub whisper: Option<ReportAction>,
    pub personal_details: Vec<PersonalDetails>,
}

/// Store-derived inputs that are not entities of the flow itself.
#[derive(Debug, Clone, Default)]
pub struct AssemblyEnv {
    pub policy: PolicyContext,
    pub error_key: String,
    pub db_time: String,
    pub violations_enabled: bool,
    /// New quick action; `None` leaves it untouched.
    pub quick_action: Option<QuickAction>,
    pub previous_quick_action: Option<QuickAction>,
    pub next_step: Option<NextStep>,
    pub previous_next_step: Option<NextStep>,
    pub existing_violations: Vec<Violation>,
}

pub fn error_map(error_key: &str, message: ErrorMessage) -> Value {
    json!({ error_key: message.text() })
}

/// Merge value clearing the optimistic markers of a report.
pub fn confirmed_report() -> Value {
    json!({
        "pendingFields": null,
        "errorFields": null,
        "isOptimisticReport": false,
    })
}

fn create_chat_error(error_key: &str, message: ErrorMessage) -> Value {
    json!({"errorFields": {"createChat": error_map(error_key, message)}})
}

fn confirmed_action() -> Value {
    json!({"pendingAction": null, "errors": null})
}

/// `{action_id: value, ...}` for a `reportActions_` member.
pub fn actions_patch(entries: Vec<(String, Value)>) -> Value {
    Value::Object(entries.into_iter().collect::<Map<String, Value>>())
}

fn failed_action(error_key: &str, message: ErrorMessage) -> Value {
    json!({"errors": error_map(error_key, message)})
}

/// Rolls an entity back: SET for pre-existing ones, an error otherwise.
fn report_failure(report: &Resolved<Report>, error_key: &str, message: ErrorMessage) -> OnyxUpdate {
    let key = OnyxKey::Report(report.value.report_id.clone());
    match &report.snapshot {
        Some(snapshot) => OnyxUpdate::set(key, to_json(snapshot)),
        None => OnyxUpdate::merge(key, create_chat_error(error_key, message)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavour {
    Request,
    Invoice,
    Track,
}

impl Flavour {
    fn error(self) -> ErrorMessage {
        match self {
            Flavour::Request => ErrorMessage::GenericCreateFailure,
            Flavour::Invoice => ErrorMessage::GenericCreateInvoiceFailure,
            Flavour::Track => ErrorMessage::GenericTrackExpenseFailure,
        }
    }
}

pub fn build_onyx_data_for_money_request(parts: &MoneyRequestParts, env: &AssemblyEnv) -> OnyxData {
    assemble(parts, env, Flavour::Request)
}

pub fn build_onyx_data_for_invoice(parts: &MoneyRequestParts, env: &AssemblyEnv) -> OnyxData {
    assemble(parts, env, Flavour::Invoice)
}

pub fn build_onyx_data_for_track_expense(parts: &MoneyRequestParts, env: &AssemblyEnv) -> OnyxData {
    assemble(parts, env, Flavour::Track)
}

fn assemble(parts: &MoneyRequestParts, env: &AssemblyEnv, flavour: Flavour) -> OnyxData {
    let mut data = OnyxData::new();
    let error_key = env.error_key.as_str();
    let message = flavour.error();
    let transaction = &parts.transaction.value;
    let iou_in_chat = parts.money_report.is_none();

    // chat report
    let chat = &parts.chat_report;
    let mut chat_value = chat.value.clone();
    chat_value.last_read_time = Some(env.db_time.clone());
    chat_value.iou_report_id = parts.money_report.as_ref().map(|r| r.value.report_id.clone());
    if iou_in_chat {
        chat_value.last_message_text = Some(parts.iou_action.text().to_string());
        chat_value.last_message_html = Some(parts.iou_action.html().to_string());
        chat_value.last_visible_action_created = Some(parts.iou_action.created.clone());
    }
    if chat.is_new() {
        chat_value.pending_fields.insert("createChat".into(), PendingAction::Add);
    }
    data.optimistic_data.push(OnyxUpdate::set_or_merge(
        chat.is_new(),
        OnyxKey::Report(chat_value.report_id.clone()),
        to_json(&chat_value),
    ));

    // money request report
    if let Some(report) = &parts.money_report {
        let mut value = report.value.clone();
        value.last_message_text = Some(parts.iou_action.text().to_string());
        value.last_message_html = Some(parts.iou_action.html().to_string());
        value.last_visible_action_created = Some(parts.iou_action.created.clone());
        value.pending_fields = if report.is_new() {
            BTreeMap::from([("createChat".to_string(), PendingAction::Add)])
        } else {
            BTreeMap::from([("preview".to_string(), PendingAction::Update)])
        };
        data.optimistic_data.push(OnyxUpdate::set_or_merge(
            report.is_new(),
            OnyxKey::Report(value.report_id.clone()),
            to_json(&value),
        ));
    }

    // transaction
    let transaction_key = OnyxKey::Transaction(transaction.transaction_id.clone());
    data.optimistic_data
        .push(OnyxUpdate::set(transaction_key.clone(), to_json(transaction)));

    // chat report actions
    let mut chat_actions = Vec::new();
    if let Some(created) = parts.chat_created_action.as_ref().filter(|_| chat.is_new()) {
        chat_actions.push((created.report_action_id.clone(), to_json(created)));
    }
    if let Some(preview) = &parts.report_preview {
        chat_actions.push((preview.value.report_action_id.clone(), to_json(&preview.value)));
    }
    if iou_in_chat {
        chat_actions.push((parts.iou_action.report_action_id.clone(), to_json(&parts.iou_action)));
    }
    if let Some(whisper) = &parts.whisper {
        chat_actions.push((whisper.report_action_id.clone(), to_json(whisper)));
    }
    let chat_actions_key = OnyxKey::ReportActions(chat.value.report_id.clone());
    data.optimistic_data.push(OnyxUpdate::set_or_merge(
        chat.is_new(),
        chat_actions_key.clone(),
        actions_patch(chat_actions),
    ));

    // money request report actions
    if let Some(report) = &parts.money_report {
        let mut entries = Vec::new();
        if let Some(created) = parts.report_created_action.as_ref().filter(|_| report.is_new()) {
            entries.push((created.report_action_id.clone(), to_json(created)));
        }
        entries.push((parts.iou_action.report_action_id.clone(), to_json(&parts.iou_action)));
        data.optimistic_data.push(OnyxUpdate::set_or_merge(
            report.is_new(),
            OnyxKey::ReportActions(report.value.report_id.clone()),
            actions_patch(entries),
        ));
    }

    // transaction thread
    let thread_key = OnyxKey::Report(parts.thread.value.report_id.clone());
    let mut thread_value = parts.thread.value.clone();
    if parts.thread.is_new() {
        thread_value.pending_fields.insert("createChat".into(), PendingAction::Add);
    }
    data.optimistic_data.push(OnyxUpdate::set_or_merge(
        parts.thread.is_new(),
        thread_key.clone(),
        to_json(&thread_value),
    ));

    // the draft used while composing is no longer needed
    data.optimistic_data
        .push(OnyxUpdate::clear(OnyxKey::TransactionDraft(TransactionRef::Draft)));

    let thread_actions_key = OnyxKey::ReportActions(parts.thread.value.report_id.clone());
    if let Some(created) = &parts.thread_created_action {
        data.optimistic_data.push(OnyxUpdate::set_or_merge(
            parts.thread.is_new(),
            thread_actions_key.clone(),
            actions_patch(vec![(created.report_action_id.clone(), to_json(created))]),
        ));
    }

    if let Some(quick_action) = &env.quick_action {
        data.optimistic_data
            .push(OnyxUpdate::set(OnyxKey::QuickAction, to_json(quick_action)));
        data.failure_data.push(match &env.previous_quick_action {
            Some(previous) => OnyxUpdate::set(OnyxKey::QuickAction, to_json(previous)),
            None => OnyxUpdate::clear(OnyxKey::QuickAction),
        });
    }

    push_recently_used(&mut data, &env.policy, transaction);

    if !parts.personal_details.is_empty() {
        let mut optimistic = Map::new();
        let mut cleared = Map::new();
        for details in &parts.personal_details {
            optimistic.insert(details.account_id.to_string(), to_json(details));
            cleared.insert(details.account_id.to_string(), Value::Null);
        }
        data.optimistic_data
            .push(OnyxUpdate::merge(OnyxKey::PersonalDetailsList, Value::Object(optimistic)));
        // the server sends the real entries, placeholders would duplicate them
        data.success_data
            .push(OnyxUpdate::merge(OnyxKey::PersonalDetailsList, Value::Object(cleared.clone())));
        data.failure_data
            .push(OnyxUpdate::merge(OnyxKey::PersonalDetailsList, Value::Object(cleared)));
    }

    if let (Some(report), Some(next_step)) = (&parts.money_report, &env.next_step) {
        let key = OnyxKey::NextStep(report.value.report_id.clone());
        data.optimistic_data.push(OnyxUpdate::set(key.clone(), to_json(next_step)));
        data.failure_data.push(match &env.previous_next_step {
            Some(previous) => OnyxUpdate::set(key, to_json(previous)),
            None => OnyxUpdate::clear(key),
        });
    }

    // success
    if chat.is_new() {
        data.success_data.push(OnyxUpdate::merge(
            OnyxKey::Report(chat.value.report_id.clone()),
            confirmed_report(),
        ));
    }
    if let Some(report) = &parts.money_report {
        data.success_data.push(OnyxUpdate::merge(
            OnyxKey::Report(report.value.report_id.clone()),
            confirmed_report(),
        ));
    }
    data.success_data
        .push(OnyxUpdate::merge(thread_key.clone(), confirmed_report()));
    data.success_data.push(OnyxUpdate::merge(
        transaction_key.clone(),
        json!({
            "pendingAction": null,
            "pendingFields": Value::Object(transaction.cleared_pending_fields()),
        }),
    ));

    let mut chat_confirmed = Vec::new();
    if let Some(created) = parts.chat_created_action.as_ref().filter(|_| chat.is_new()) {
        chat_confirmed.push((created.report_action_id.clone(), confirmed_action()));
    }
    if let Some(preview) = &parts.report_preview {
        chat_confirmed.push((preview.value.report_action_id.clone(), confirmed_action()));
    }
    if iou_in_chat {
        chat_confirmed.push((parts.iou_action.report_action_id.clone(), confirmed_action()));
    }
    if let Some(whisper) = &parts.whisper {
        chat_confirmed.push((whisper.report_action_id.clone(), confirmed_action()));
    }
    data.success_data
        .push(OnyxUpdate::merge(chat_actions_key.clone(), actions_patch(chat_confirmed)));

    if let Some(report) = &parts.money_report {
        let mut entries = Vec::new();
        if let Some(created) = parts.report_created_action.as_ref().filter(|_| report.is_new()) {
            entries.push((created.report_action_id.clone(), confirmed_action()));
        }
        entries.push((parts.iou_action.report_action_id.clone(), confirmed_action()));
        data.success_data.push(OnyxUpdate::merge(
            OnyxKey::ReportActions(report.value.report_id.clone()),
            actions_patch(entries),
        ));
    }
    if let Some(created) = &parts.thread_created_action {
        data.success_data.push(OnyxUpdate::merge(
            thread_actions_key.clone(),
            actions_patch(vec![(created.report_action_id.clone(), confirmed_action())]),
        ));
    }

    // failure
    data.failure_data.push(report_failure(chat, error_key, message));
    if let Some(report) = &parts.money_report {
        data.failure_data.push(report_failure(report, error_key, message));
    }
    data.failure_data
        .push(report_failure(&parts.thread, error_key, message));

    let transaction_message = if transaction.is_scan_request() && transaction.has_receipt() {
        ErrorMessage::ReceiptFailure
    } else {
        message
    };
    data.failure_data.push(match &parts.transaction.snapshot {
        Some(snapshot) => OnyxUpdate::set(transaction_key, to_json(snapshot)),
        None => OnyxUpdate::merge(
            transaction_key,
            json!({"errors": error_map(error_key, transaction_message)}),
        ),
    });

    let mut chat_failed = Vec::new();
    if let Some(created) = parts.chat_created_action.as_ref().filter(|_| chat.is_new()) {
        chat_failed.push((created.report_action_id.clone(), failed_action(error_key, message)));
    }
    if let Some(preview) = &parts.report_preview {
        let patch = match &preview.snapshot {
            Some(snapshot) => revert_patch(&to_json(&preview.value), &to_json(snapshot)),
            None => failed_action(error_key, message),
        };
        chat_failed.push((preview.value.report_action_id.clone(), patch));
    }
    if iou_in_chat {
        chat_failed.push((
            parts.iou_action.report_action_id.clone(),
            failed_action(error_key, transaction_message),
        ));
    }
    if let Some(whisper) = &parts.whisper {
        chat_failed.push((whisper.report_action_id.clone(), failed_action(error_key, message)));
    }
    data.failure_data
        .push(OnyxUpdate::merge(chat_actions_key, actions_patch(chat_failed)));

    if let Some(report) = &parts.money_report {
        let mut entries = Vec::new();
        if let Some(created) = parts.report_created_action.as_ref().filter(|_| report.is_new()) {
            entries.push((created.report_action_id.clone(), failed_action(error_key, transaction_message)));
        }
        entries.push((parts.iou_action.report_action_id.clone(), failed_action(error_key, message)));
        data.failure_data.push(OnyxUpdate::merge(
            OnyxKey::ReportActions(report.value.report_id.clone()),
            actions_patch(entries),
        ));
    }
    if let Some(created) = &parts.thread_created_action {
        data.failure_data.push(OnyxUpdate::merge(
            thread_actions_key,
            actions_patch(vec![(created.report_action_id.clone(), failed_action(error_key, message))]),
        ));
    }

    // violations are only computed on paid workspaces
    if let Some(policy) = env.policy.policy.as_ref() {
        if violations::should_compute(Some(policy), env.violations_enabled) {
            data.optimistic_data.push(violations::get_violations_onyx_data(
                transaction,
                &env.existing_violations,
                policy,
                &env.policy.categories,
                &env.policy.tag_lists,
            ));
            data.failure_data.push(OnyxUpdate::set(
                OnyxKey::TransactionViolations(transaction.transaction_id.clone()),
                to_json(&env.existing_violations),
            ));
        }
    }

    data
}

/// Recently used categories (SET) and tags (MERGE) for the transaction's
/// policy, with their rollbacks.
pub fn push_recently_used(data: &mut OnyxData, policy: &PolicyContext, transaction: &Transaction) {
    let Some(policy_id) = policy.policy_id() else {
        return;
    };
    let category = transaction.category.as_deref().unwrap_or_default();
    let categories = policy.recently_used_categories_with(category);
    if !categories.is_empty() {
        let key = OnyxKey::PolicyRecentlyUsedCategories(policy_id.to_string());
        data.optimistic_data.push(OnyxUpdate::set(key.clone(), to_json(&categories)));
        data.failure_data.push(if policy.recently_used_categories.is_empty() {
            OnyxUpdate::clear(key)
        } else {
            OnyxUpdate::set(key, to_json(&policy.recently_used_categories))
        });
    }

    let tags = policy.recently_used_tags_with(transaction.tag.as_deref().unwrap_or_default());
    if !tags.is_empty() {
        let key = OnyxKey::PolicyRecentlyUsedTags(policy_id.to_string());
        let rollback: Map<String, Value> = tags
            .keys()
            .map(|list| {
                let previous = policy
                    .recently_used_tags
                    .get(list)
                    .map(to_json)
                    .unwrap_or(Value::Null);
                (list.clone(), previous)
            })
            .collect();
        data.optimistic_data.push(OnyxUpdate::merge(key.clone(), to_json(&tags)));
        data.failure_data.push(OnyxUpdate::merge(key, Value::Object(rollback)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{self, IouActionParams};
    use crate::report_action::IouActionType;
    use crate::types::OptimisticClock;

    fn parts(new_chat: bool) -> MoneyRequestParts {
        let clock = OptimisticClock::new();
        let chat = builder::ChatReportBuilder::new(&[1, 2]).build();
        let report = builder::build_optimistic_iou_report(1, 2, 500, &chat.report_id, "USD");
        let entities = builder::build_optimistic_money_request_entities(
            &report,
            IouActionParams {
                kind: IouActionType::Create,
                amount: 500,
                currency: "USD".into(),
                comment: String::new(),
                participants: vec![1, 2],
                transaction_id: Some("t".into()),
                iou_report_id: Some(report.report_id.clone()),
                payment_type: None,
                actor: 1,
            },
            None,
            &clock,
        );
        let transaction = builder::build_optimistic_transaction(
            builder::TransactionParams {
                transaction_id: Some("t".into()),
                amount: 500,
                currency: "USD".into(),
                report_id: report.report_id.clone(),
                ..Default::default()
            },
            &clock,
        );
        let preview = builder::build_optimistic_report_preview(&chat, &report, "", Some(&transaction), 1, &clock);
        MoneyRequestParts {
            chat_report: if new_chat { Resolved::created(chat) } else { Resolved::existing(chat) },
            money_report: Some(Resolved::created(report)),
            transaction: Resolved::created(transaction),
            chat_created_action: Some(entities.chat_created_action),
            report_created_action: Some(entities.report_created_action),
            iou_action: entities.iou_action,
            thread_created_action: entities.thread.created_action,
            thread: Resolved::created(entities.thread.report),
            report_preview: Some(Resolved::created(preview)),
            whisper: None,
            personal_details: Vec::new(),
        }
    }

    #[test]
    fn new_chats_are_set_and_existing_chats_merged() {
        let env = AssemblyEnv {
            error_key: "1".into(),
            ..Default::default()
        };
        let data = build_onyx_data_for_money_request(&parts(true), &env);
        assert!(data.optimistic_data[0].is_set());
        assert!(data.untracked_keys().is_empty());

        let data = build_onyx_data_for_money_request(&parts(false), &env);
        assert!(!data.optimistic_data[0].is_set());
        // pre-existing chat is restored by value
        assert!(data.failure_data[0].is_set());
    }
}
