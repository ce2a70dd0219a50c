//! Split computation and the patches of a bill split between several people.
//!
//! A split writes one SPLIT IOU action and a split transaction to the chat it
//! was started from, plus an ordinary one-on-one money request per
//! participant. The one-on-one requests carry the split transaction's id as
//! their `originalTransactionID`.
use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::assembler::{Resolved, actions_patch, error_map};
use crate::builder::{self, ChatReportBuilder, IouActionParams, TransactionParams};
use crate::context::EngineContext;
use crate::error::ErrorMessage;
use crate::onyx::{OnyxData, OnyxKey, OnyxUpdate, to_json};
use crate::report::{ChatType, Report};
use crate::report_action::{IouActionType, ReportAction};
use crate::request::{self, MoneyRequestInput, RequestDetails};
use crate::transaction::{Split, SplitShare, Transaction};
use crate::types::{AccountId, IouRequestType, Participant, QuickAction, QuickActionName, TransactionRef};
use crate::utils::{currency_decimals, generate_id};

/// Report id the split transaction itself is filed under.
pub const SPLIT_REPORT_ID: &str = "-2";

// Math.round semantics: halves round towards positive infinity
fn round_div(numerator: i64, denominator: i64) -> i64 {
    (2 * numerator + denominator).div_euclid(2 * denominator)
}

/// Share of `total` for one of `participant_count + 1` people.
///
/// Everyone but the payer gets the rounded per-person amount in the
/// currency's smallest unit. The payer gets whatever is left, so the shares
/// always add up to exactly `total`.
pub fn calculate_amount(participant_count: usize, total: i64, currency: &str, is_payer: bool) -> i64 {
    let people = participant_count as i64 + 1;
    // amounts are held in cents even for currencies without minor units
    let unit = 10_i64.pow(2 - currency_decimals(currency).min(2));
    let per_person = round_div(round_div(total, unit), people) * unit;
    if is_payer {
        total - per_person * (people - 1)
    } else {
        per_person
    }
}

fn sorted_account_ids(shares: &BTreeMap<String, SplitShare>) -> Vec<AccountId> {
    let mut ids: Vec<AccountId> = shares.keys().filter_map(|id| id.parse().ok()).collect();
    ids.sort_unstable();
    ids
}

/// `splitShares` patch spreading `amount` evenly over `account_ids`. Shares of
/// people no longer in the list are nulled so a merge drops them.
pub fn split_shares_patch(
    existing: &BTreeMap<String, SplitShare>,
    current_account_id: AccountId,
    amount: i64,
    currency: &str,
    account_ids: &[AccountId],
) -> Value {
    let participant_count = if account_ids.contains(&current_account_id) {
        account_ids.len().saturating_sub(1)
    } else {
        account_ids.len()
    };
    let mut everyone = vec![current_account_id];
    everyone.extend_from_slice(account_ids);
    everyone.extend(sorted_account_ids(existing));
    everyone.dedup();

    let mut shares = Map::new();
    for account_id in everyone {
        let key = account_id.to_string();
        if shares.contains_key(&key) {
            continue;
        }
        if account_id != current_account_id && !account_ids.contains(&account_id) {
            shares.insert(key, Value::Null);
            continue;
        }
        let share = SplitShare {
            amount: calculate_amount(
                participant_count,
                amount,
                currency,
                account_id == current_account_id,
            ),
            is_modified: false,
        };
        shares.insert(key, to_json(&share));
    }
    Value::Object(shares)
}

pub fn set_split_shares(
    reference: &TransactionRef,
    transaction: &Transaction,
    current_account_id: AccountId,
    amount: i64,
    currency: &str,
    account_ids: &[AccountId],
) -> OnyxUpdate {
    let shares = split_shares_patch(&transaction.split_shares, current_account_id, amount, currency, account_ids);
    OnyxUpdate::merge(
        OnyxKey::TransactionDraft(reference.clone()),
        json!({ "splitShares": shares }),
    )
}

/// Spreads a new amount (or currency) over the people already in the split.
pub fn reset_split_shares(
    reference: &TransactionRef,
    transaction: &Transaction,
    current_account_id: AccountId,
    amount: Option<i64>,
    currency: Option<&str>,
) -> OnyxUpdate {
    let account_ids = sorted_account_ids(&transaction.split_shares);
    set_split_shares(
        reference,
        transaction,
        current_account_id,
        amount.unwrap_or(transaction.amount),
        currency.unwrap_or(&transaction.currency),
        &account_ids,
    )
}

/// A share the user typed in by hand. It is left alone by later redistribution.
pub fn set_individual_share(reference: &TransactionRef, account_id: AccountId, amount: i64) -> OnyxUpdate {
    let share = SplitShare {
        amount,
        is_modified: true,
    };
    OnyxUpdate::merge(
        OnyxKey::TransactionDraft(reference.clone()),
        json!({ "splitShares": { account_id.to_string(): share } }),
    )
}

/// New amounts for the shares nobody edited by hand, or `None` when nothing
/// was edited or the edited shares already exceed the total. The first
/// unmodified share absorbs the rounding remainder.
pub fn remaining_split_shares(transaction: &Transaction) -> Option<BTreeMap<AccountId, i64>> {
    let shares = &transaction.split_shares;
    let modified_total: i64 = shares.values().filter(|s| s.is_modified).map(|s| s.amount).sum();
    if !shares.values().any(|s| s.is_modified) {
        return None;
    }
    let remaining_total = transaction.amount - modified_total;
    if remaining_total < 0 {
        debug!(remaining_total, "hand-entered shares exceed the total");
        return None;
    }
    let unmodified: Vec<AccountId> = sorted_account_ids(shares)
        .into_iter()
        .filter(|id| shares.get(&id.to_string()).is_some_and(|s| !s.is_modified))
        .collect();
    let count = unmodified.len().saturating_sub(1);
    Some(
        unmodified
            .iter()
            .enumerate()
            .map(|(index, id)| {
                (
                    *id,
                    calculate_amount(count, remaining_total, &transaction.currency, index == 0),
                )
            })
            .collect(),
    )
}

pub fn adjust_remaining_split_shares(reference: &TransactionRef, transaction: &Transaction) -> Option<OnyxUpdate> {
    let remaining = remaining_split_shares(transaction)?;
    let shares: Map<String, Value> = remaining
        .into_iter()
        .map(|(id, amount)| (id.to_string(), json!({ "amount": amount })))
        .collect();
    Some(OnyxUpdate::merge(
        OnyxKey::TransactionDraft(reference.clone()),
        json!({ "splitShares": shares }),
    ))
}

#[derive(Debug, Clone)]
pub struct SplitBillInput {
    pub participants: Vec<Participant>,
    pub details: RequestDetails,
    /// Group DM or workspace chat the split was started from.
    pub split_chat_report_id: Option<String>,
    /// Per-account overrides keyed by account id.
    pub split_shares: BTreeMap<String, SplitShare>,
    pub request_type: IouRequestType,
    pub split_payer_account_ids: Vec<AccountId>,
}

/// One person's part of a split, as sent to the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitEntry {
    pub email: String,
    #[serde(rename = "accountID")]
    pub account_id: AccountId,
    pub amount: i64,
    pub tax_amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_optimistic_account: Option<bool>,
    #[serde(rename = "iouReportID", skip_serializing_if = "Option::is_none")]
    pub iou_report_id: Option<String>,
    #[serde(rename = "chatReportID", skip_serializing_if = "Option::is_none")]
    pub chat_report_id: Option<String>,
    #[serde(rename = "transactionID", skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(rename = "reportActionID", skip_serializing_if = "Option::is_none")]
    pub report_action_id: Option<String>,
    #[serde(rename = "createdChatReportActionID", skip_serializing_if = "Option::is_none")]
    pub created_chat_report_action_id: Option<String>,
    #[serde(rename = "createdIOUReportActionID", skip_serializing_if = "Option::is_none")]
    pub created_iou_report_action_id: Option<String>,
    #[serde(rename = "reportPreviewReportActionID", skip_serializing_if = "Option::is_none")]
    pub report_preview_report_action_id: Option<String>,
    #[serde(rename = "transactionThreadReportID", skip_serializing_if = "Option::is_none")]
    pub transaction_thread_report_id: Option<String>,
    #[serde(rename = "createdReportActionIDForThread", skip_serializing_if = "Option::is_none")]
    pub created_report_action_id_for_thread: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SplitInformation {
    pub split_chat_report: Report,
    pub is_new_split_chat: bool,
    pub split_transaction: Transaction,
    pub split_action: ReportAction,
    pub created_report_action_id: Option<String>,
    pub splits: Vec<SplitEntry>,
    pub split_payer_account_ids: Vec<AccountId>,
    pub onyx_data: OnyxData,
}

impl SplitInformation {
    pub fn params(&self) -> Value {
        let transaction = &self.split_transaction;
        json!({
            "reportID": self.split_chat_report.report_id,
            "amount": transaction.amount,
            "splits": to_json(&self.splits).to_string(),
            "currency": transaction.currency,
            "comment": transaction.description(),
            "category": transaction.category,
            "merchant": transaction.merchant,
            "created": transaction.created,
            "tag": transaction.tag,
            "billable": transaction.billable,
            "transactionID": transaction.transaction_id,
            "reportActionID": self.split_action.report_action_id,
            "createdReportActionID": self.created_report_action_id,
            "policyID": self.split_chat_report.policy_id,
            "chatType": self.split_chat_report.chat_type,
            "splitPayerAccountIDs": self.split_payer_account_ids,
            "taxCode": transaction.tax_code,
            "taxAmount": transaction.tax_amount,
        })
    }

    /// Total of every share, the payer's included.
    pub fn shares_total(&self) -> i64 {
        self.splits.iter().map(|s| s.amount).sum()
    }
}

fn split_quick_action(request_type: IouRequestType) -> QuickActionName {
    match request_type {
        IouRequestType::Distance => QuickActionName::SplitDistance,
        IouRequestType::Scan => QuickActionName::SplitScan,
        IouRequestType::Manual => QuickActionName::SplitManual,
    }
}

/// The chat the split lands in: the one given, an existing chat with exactly
/// these people, or a new one (a group chat for more than one participant).
fn resolve_split_chat(
    ctx: &EngineContext,
    input: &SplitBillInput,
    account_ids: &[AccountId],
    current: AccountId,
) -> anyhow::Result<Resolved<Report>> {
    let explicit_id = input
        .split_chat_report_id
        .as_deref()
        .or_else(|| input.participants.first().and_then(|p| p.report_id.as_deref()));
    if let Some(chat) = explicit_id.map(|id| ctx.report(id)).transpose()?.flatten() {
        return Ok(Resolved::existing(chat));
    }
    let mut everyone = account_ids.to_vec();
    everyone.push(current);
    if let Some(chat) = ctx.find_chat_by_participants(&everyone)? {
        return Ok(Resolved::existing(chat));
    }
    let builder = ChatReportBuilder::new(&everyone);
    let chat = if input.participants.len() > 1 {
        builder.set_chat_type(ChatType::Group).build()
    } else {
        builder.build()
    };
    debug!(report_id = %chat.report_id, "creating the split chat");
    Ok(Resolved::created(chat))
}

/// Builds the split chat entries and one money request per participant.
pub fn create_splits_and_onyx_data(
    ctx: &EngineContext,
    input: &SplitBillInput,
) -> anyhow::Result<Option<SplitInformation>> {
    let current = ctx.current_account_id();
    let current_email = ctx.current_email().to_lowercase();
    let details = &input.details;
    if details.amount <= 0 {
        warn!(amount = details.amount, "refusing to split a non-positive amount");
        return Ok(None);
    }
    if input.participants.is_empty() {
        warn!("split has no participants");
        return Ok(None);
    }

    let account_ids: Vec<AccountId> = input
        .participants
        .iter()
        .filter_map(|p| request::resolve_account_id(ctx, p))
        .collect();
    let mut split_chat = resolve_split_chat(ctx, input, &account_ids, current)?;
    let is_own_policy_expense_chat = split_chat.value.is_own_policy_expense_chat.unwrap_or(false);

    // Split transaction and action on the split chat
    let split_transaction = builder::build_optimistic_transaction(
        TransactionParams {
            amount: details.amount,
            currency: details.currency.clone(),
            report_id: SPLIT_REPORT_ID.to_string(),
            comment: details.comment.clone(),
            created: details.created.clone(),
            merchant: details.merchant.clone(),
            category: details.category.clone(),
            tag: details.tag.clone(),
            tax_code: details.tax_code.clone(),
            tax_amount: details.tax_amount,
            billable: details.billable,
            iou_request_type: Some(input.request_type),
            ..Default::default()
        },
        &ctx.clock,
    );
    let split_created_action = builder::build_optimistic_created_action(current, &ctx.clock);
    let split_action = builder::build_optimistic_iou_action(
        IouActionParams {
            kind: IouActionType::Split,
            amount: details.amount,
            currency: details.currency.clone(),
            comment: details.comment.clone(),
            participants: account_ids.clone(),
            transaction_id: Some(split_transaction.transaction_id.clone()),
            iou_report_id: None,
            payment_type: None,
            actor: current,
        },
        &ctx.clock,
    );
    {
        let chat = &mut split_chat.value;
        chat.last_read_time = Some(ctx.clock.db_time());
        chat.last_message_text = Some(split_action.text().to_string());
        chat.last_message_html = Some(split_action.html().to_string());
        chat.last_actor_account_id = Some(current);
        chat.last_visible_action_created = Some(split_action.created.clone());
    }

    // One money request per participant
    let participant_count = input.participants.len();
    let tax_amount = details.tax_amount.unwrap_or(0);
    let mut splits = vec![SplitEntry {
        email: current_email.clone(),
        account_id: current,
        amount: input
            .split_shares
            .get(&current.to_string())
            .map(|s| s.amount)
            .unwrap_or_else(|| calculate_amount(participant_count, details.amount, &details.currency, true)),
        tax_amount: calculate_amount(participant_count, tax_amount, &details.currency, true),
        ..Default::default()
    }];
    // one participant and no chat given: the split chat is the one-on-one chat
    let split_chat_is_one_on_one =
        (participant_count == 1 && input.split_chat_report_id.is_none()) || is_own_policy_expense_chat;
    let mut children = OnyxData::new();
    let mut redundant_participants = Map::new();

    for participant in &input.participants {
        let is_policy_expense_chat = participant.is_policy_expense_chat || is_own_policy_expense_chat;
        let account_id = if is_policy_expense_chat {
            None
        } else {
            request::resolve_account_id(ctx, participant)
        };
        let split_amount = account_id
            .and_then(|id| input.split_shares.get(&id.to_string()))
            .map(|s| s.amount)
            .unwrap_or_else(|| calculate_amount(participant_count, details.amount, &details.currency, false));
        let split_tax = calculate_amount(participant_count, tax_amount, &details.currency, false);
        // a share of 0 leaves the person out of the split
        if split_amount == 0 {
            continue;
        }
        let email = if is_policy_expense_chat {
            String::new()
        } else {
            participant.login.clone().unwrap_or_default().to_lowercase()
        };
        if !email.is_empty() && email == current_email {
            continue;
        }

        let mut child_details = details.clone();
        child_details.amount = split_amount;
        child_details.tax_amount = details.tax_amount.map(|_| split_tax);
        let mut child_participant = participant.clone();
        child_participant.is_policy_expense_chat = is_policy_expense_chat;
        let mut child = MoneyRequestInput::new(child_participant, child_details);
        child.draft = TransactionRef::Persisted(generate_id());
        child.split_transaction_id = Some(split_transaction.transaction_id.clone());
        if split_chat_is_one_on_one {
            child.chat_report_id = Some(split_chat.value.report_id.clone());
            if split_chat.is_new() {
                child.pending_chat = Some(split_chat.value.clone());
            }
        }
        let Some(information) = request::get_money_request_information(ctx, &child)? else {
            warn!(?account_id, "skipping a split participant whose request could not be built");
            continue;
        };

        let is_optimistic_account = account_id.is_some_and(|id| ctx.personal_details(id).is_none());
        if is_optimistic_account && split_chat.is_new() {
            if let Some(id) = account_id {
                redundant_participants.insert(id.to_string(), Value::Null);
            }
        }
        splits.push(SplitEntry {
            email,
            account_id: account_id.unwrap_or_default(),
            amount: split_amount,
            tax_amount: split_tax,
            is_optimistic_account: Some(is_optimistic_account),
            iou_report_id: Some(information.iou_report.report_id.clone()),
            chat_report_id: Some(information.chat_report.report_id.clone()),
            transaction_id: Some(information.transaction.transaction_id.clone()),
            report_action_id: Some(information.iou_action.report_action_id.clone()),
            created_chat_report_action_id: information.created_chat_report_action_id.clone(),
            created_iou_report_action_id: information.created_iou_report_action_id.clone(),
            report_preview_report_action_id: Some(information.report_preview_action.report_action_id.clone()),
            transaction_thread_report_id: Some(information.transaction_thread_report_id.clone()),
            created_report_action_id_for_thread: information.created_report_action_id_for_thread.clone(),
        });
        children.extend(information.onyx_data);
    }

    // A new chat reused as the one-on-one chat was already written by its request
    let chat_written_by_child = split_chat.is_new() && split_chat_is_one_on_one;
    let error_key = ctx.clock.error_key();
    let chat_key = OnyxKey::Report(split_chat.value.report_id.clone());
    let chat_actions_key = OnyxKey::ReportActions(split_chat.value.report_id.clone());
    let transaction_key = OnyxKey::Transaction(split_transaction.transaction_id.clone());
    let mut data = children;

    // optimistic
    let mut chat_value = split_chat.value.clone();
    if split_chat.is_new() && !chat_written_by_child {
        chat_value.pending_fields.insert("createChat".into(), crate::types::PendingAction::Add);
    }
    let writes_fresh_chat = split_chat.is_new() && !chat_written_by_child;
    data.optimistic_data
        .push(OnyxUpdate::set_or_merge(writes_fresh_chat, chat_key.clone(), to_json(&chat_value)));
    let previous_quick_action = ctx.quick_action()?;
    let quick_action = QuickAction {
        action: split_quick_action(input.request_type),
        chat_report_id: split_chat.value.report_id.clone(),
        target_account_id: None,
        is_first_quick_action: previous_quick_action.is_none(),
    };
    data.optimistic_data
        .push(OnyxUpdate::set(OnyxKey::QuickAction, to_json(&quick_action)));
    let mut entries = Vec::new();
    if writes_fresh_chat {
        entries.push((split_created_action.report_action_id.clone(), to_json(&split_created_action)));
    }
    entries.push((split_action.report_action_id.clone(), to_json(&split_action)));
    data.optimistic_data.push(OnyxUpdate::set_or_merge(
        writes_fresh_chat,
        chat_actions_key.clone(),
        actions_patch(entries),
    ));
    let mut split_transaction = split_transaction;
    split_transaction.comment.splits = Some(
        splits
            .iter()
            .map(|s| Split {
                account_id: s.account_id,
                amount: s.amount,
            })
            .collect(),
    );
    data.optimistic_data
        .push(OnyxUpdate::set(transaction_key.clone(), to_json(&split_transaction)));
    data.optimistic_data
        .push(OnyxUpdate::clear(OnyxKey::TransactionDraft(TransactionRef::Draft)));

    // success
    let mut confirmed = Vec::new();
    if writes_fresh_chat {
        confirmed.push((
            split_created_action.report_action_id.clone(),
            json!({"pendingAction": null}),
        ));
    }
    confirmed.push((split_action.report_action_id.clone(), json!({"pendingAction": null})));
    data.success_data
        .push(OnyxUpdate::merge(chat_actions_key.clone(), actions_patch(confirmed)));
    data.success_data
        .push(OnyxUpdate::merge(transaction_key.clone(), json!({"pendingAction": null})));
    if split_chat.is_new() {
        data.success_data.push(OnyxUpdate::merge(
            chat_key.clone(),
            json!({
                "pendingFields": {"createChat": null},
                "participants": Value::Object(redundant_participants),
            }),
        ));
    }

    // failure
    let create_error = error_map(&error_key, ErrorMessage::GenericCreateFailure);
    data.failure_data.push(OnyxUpdate::merge(
        transaction_key,
        json!({"errors": create_error.clone()}),
    ));
    data.failure_data.push(match &split_chat.snapshot {
        Some(snapshot) => OnyxUpdate::set(chat_key, to_json(snapshot)),
        None => OnyxUpdate::merge(
            chat_key,
            json!({"errorFields": {"createChat": error_map(&error_key, ErrorMessage::GenericCreateFailure)}}),
        ),
    });
    data.failure_data.push(OnyxUpdate::merge(
        chat_actions_key,
        actions_patch(vec![(split_action.report_action_id.clone(), json!({"errors": create_error}))]),
    ));
    data.failure_data.push(match previous_quick_action {
        Some(previous) => OnyxUpdate::set(OnyxKey::QuickAction, to_json(&previous)),
        None => OnyxUpdate::clear(OnyxKey::QuickAction),
    });

    let created_report_action_id = split_chat
        .is_new()
        .then(|| split_created_action.report_action_id.clone());
    let split_payer_account_ids = if input.split_payer_account_ids.is_empty() {
        vec![current]
    } else {
        input.split_payer_account_ids.clone()
    };
    info!(
        chat_report_id = %split_chat.value.report_id,
        transaction_id = %split_transaction.transaction_id,
        shares = splits.len(),
        "built split"
    );
    Ok(Some(SplitInformation {
        is_new_split_chat: split_chat.is_new(),
        split_chat_report: split_chat.value,
        split_transaction,
        split_action,
        created_report_action_id,
        splits,
        split_payer_account_ids,
        onyx_data: data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payer_absorbs_the_remainder() {
        assert_eq!(calculate_amount(2, 100, "USD", false), 33);
        assert_eq!(calculate_amount(2, 100, "USD", true), 34);
        assert_eq!(calculate_amount(0, 100, "USD", true), 100);
        // 2.50 over two people rounds up for the other person
        assert_eq!(calculate_amount(1, 5, "USD", false), 3);
        assert_eq!(calculate_amount(1, 5, "USD", true), 2);
    }

    #[test]
    fn whole_units_for_currencies_without_cents() {
        // 1000 yen over three people: 333 yen each, the payer takes 334
        assert_eq!(calculate_amount(2, 100_000, "JPY", false), 33_300);
        assert_eq!(calculate_amount(2, 100_000, "JPY", true), 33_400);
    }

    #[test]
    fn removed_people_are_nulled_from_shares() {
        let existing = BTreeMap::from([
            ("7".to_string(), SplitShare::default()),
            ("9".to_string(), SplitShare::default()),
        ]);
        let patch = split_shares_patch(&existing, 7, 100, "USD", &[8]);
        assert_eq!(patch["9"], Value::Null);
        assert_eq!(patch["7"]["amount"], 50);
        assert_eq!(patch["8"]["amount"], 50);
    }

    #[test]
    fn hand_entered_shares_are_kept() {
        let transaction = Transaction {
            amount: 100,
            currency: "USD".into(),
            split_shares: BTreeMap::from([
                ("1".to_string(), SplitShare { amount: 10, is_modified: false }),
                ("2".to_string(), SplitShare { amount: 60, is_modified: true }),
                ("3".to_string(), SplitShare { amount: 10, is_modified: false }),
            ]),
            ..Default::default()
        };
        let remaining = remaining_split_shares(&transaction).unwrap();
        assert_eq!(remaining.get(&1), Some(&20));
        assert_eq!(remaining.get(&3), Some(&20));
        assert!(!remaining.contains_key(&2));

        let mut over = transaction.clone();
        over.split_shares.get_mut("2").unwrap().amount = 150;
        assert!(remaining_split_shares(&over).is_none());
    }
}
