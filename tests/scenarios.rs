#![allow(unused_imports)]

use anyhow::Context;
use serde_json::{Value, json};
use sled::open;
use std::sync::Arc;

use iou_engine::config::EngineConfig;
use iou_engine::error::IouError;
use iou_engine::network::{Navigation, Outcome, QueuedNetwork, RecordingNavigator, WriteCommand};
use iou_engine::onyx::OnyxKey;
use iou_engine::report::Report;
use iou_engine::report_action::{ActionName, ReportAction};
use iou_engine::request::{MoneyRequestInput, RequestDetails};
use iou_engine::split::SplitBillInput;
use iou_engine::store::{KeyValueStore, MemoryStore, SledStore, StoreExt};
use iou_engine::transaction::{Transaction, TransactionChanges};
use iou_engine::types::{IouRequestType, Participant, PaymentMethodType, PendingAction, StateNum, StatusNum, TransactionRef};
use iou_engine::{EngineContext, IouService};

use tempfile::tempdir; // Use for test db cleanup.

const ALICE: i64 = 1;
const BOB: i64 = 2;
const CAROL: i64 = 3;

struct Harness {
    service: IouService,
    network: Arc<QueuedNetwork>,
    navigator: Arc<RecordingNavigator>,
    store: Arc<dyn KeyValueStore>,
}

impl Harness {
    fn ctx(&self) -> &EngineContext {
        self.service.context()
    }

    fn report(&self, report_id: &str) -> anyhow::Result<Option<Report>> {
        self.ctx().report(report_id)
    }

    fn actions(&self, report_id: &str) -> anyhow::Result<Vec<ReportAction>> {
        Ok(self.ctx().report_actions(report_id)?.into_values().collect())
    }
}

/// Signs Alice in and wires the service to a queued network. The session has
/// to be stored before the context is built so the cache picks it up.
fn harness(store: Arc<dyn KeyValueStore>) -> anyhow::Result<Harness> {
    store.set(
        &OnyxKey::Session,
        Some(json!({"accountID": ALICE, "email": "alice@example.com"})),
    )?;
    store.set(
        &OnyxKey::PersonalDetailsList,
        Some(json!({
            "1": {"accountID": ALICE, "login": "alice@example.com", "displayName": "Alice"},
            "2": {"accountID": BOB, "login": "bob@example.com", "displayName": "Bob"},
            "3": {"accountID": CAROL, "login": "carol@example.com", "displayName": "Carol"},
        })),
    )?;

    let ctx = Arc::new(EngineContext::new(store.clone(), EngineConfig::default())?);
    let network = Arc::new(QueuedNetwork::new(store.clone()));
    let navigator = Arc::new(RecordingNavigator::default());
    let service = IouService::new(ctx, network.clone(), navigator.clone());
    Ok(Harness {
        service,
        network,
        navigator,
        store,
    })
}

fn memory_harness() -> anyhow::Result<Harness> {
    harness(Arc::new(MemoryStore::new()))
}

fn details(amount: i64, currency: &str) -> RequestDetails {
    RequestDetails {
        created: "2024-05-01".to_string(),
        merchant: "Coffee".to_string(),
        comment: "beans".to_string(),
        ..RequestDetails::new(amount, currency)
    }
}

fn request_from_bob(h: &Harness, amount: i64, currency: &str) -> anyhow::Result<iou_engine::request::MoneyRequestInformation> {
    let input = MoneyRequestInput::new(Participant::person(BOB, "bob@example.com"), details(amount, currency));
    h.service
        .request_money(input)?
        .context("request was not built")
}

/// A new 1:1 request creates the chat, the IOU report, both CREATED actions
/// and the transaction thread, and clears the draft.
fn request_money_in_a_new_chat(h: &Harness) -> anyhow::Result<()> {
    let info = request_from_bob(h, 1000, "USD")?;
    let chat_id = info.chat_report.report_id.clone();
    let iou_id = info.iou_report.report_id.clone();

    assert!(info.is_new_chat_report);
    let chat_update = info
        .onyx_data
        .optimistic_value(&OnyxKey::Report(chat_id.clone()))
        .context("chat was not written")?;
    assert!(chat_update.is_set());

    let iou_report = h.report(&iou_id)?.context("iou report missing")?;
    assert_eq!(iou_report.total(), 1000);
    assert_eq!(iou_report.owner_account_id, Some(ALICE));
    assert_eq!(iou_report.manager_id, Some(BOB));

    let iou_actions = h.actions(&iou_id)?;
    assert_eq!(iou_actions.len(), 2);
    assert_eq!(iou_actions.iter().filter(|a| a.action_name == ActionName::Created).count(), 1);
    assert_eq!(iou_actions.iter().filter(|a| a.action_name == ActionName::Iou).count(), 1);

    let thread_id = info.transaction_thread_report_id.clone();
    assert!(h.report(&thread_id)?.is_some());
    let thread_actions = h.actions(&thread_id)?;
    assert_eq!(thread_actions.len(), 1);
    assert_eq!(thread_actions[0].action_name, ActionName::Created);

    // the temporary draft is gone
    assert!(h.store.get(&OnyxKey::TransactionDraft(TransactionRef::Draft))?.is_none());

    assert_eq!(h.network.pending_commands(), vec![WriteCommand::RequestMoney]);
    assert_eq!(
        h.navigator.events(),
        vec![Navigation::DismissModal {
            report_id: Some(chat_id)
        }]
    );
    Ok(())
}

#[test]
fn request_money_creates_a_chat_in_memory() -> anyhow::Result<()> {
    let h = memory_harness()?;
    request_money_in_a_new_chat(&h)
}

#[test]
fn request_money_creates_a_chat_in_sled() -> anyhow::Result<()> {
    // Sled locks its files, so every test gets its own database in a temp dir.
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("test_request_money.db"))?);
    db.clear()?;

    let h = harness(Arc::new(SledStore::new(db)))?;
    request_money_in_a_new_chat(&h)?;

    // success patches go through the same store
    h.network.respond_all(Outcome::Success)?;
    let transactions: Vec<Transaction> = h.store.collection_as(iou_engine::onyx::Collection::Transaction)?;
    assert_eq!(transactions.len(), 1);
    assert!(transactions[0].pending_action.is_none());
    Ok(())
}

#[test]
fn success_leaves_no_pending_markers() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let info = request_from_bob(&h, 1000, "USD")?;
    h.network.respond_all(Outcome::Success)?;

    let transaction = h
        .ctx()
        .transaction(&info.transaction.transaction_id)?
        .context("transaction missing")?;
    assert!(transaction.pending_action.is_none());
    assert!(transaction.pending_fields.is_empty());

    for report_id in [&info.chat_report.report_id, &info.iou_report.report_id] {
        let report = h.report(report_id)?.context("report missing")?;
        assert!(report.pending_fields.is_empty());
        assert!(report.error_fields.is_empty());
        for action in h.actions(report_id)? {
            assert!(action.pending_action.is_none(), "{} still pending", action.report_action_id);
        }
    }
    Ok(())
}

#[test]
fn failed_creation_keeps_add_markers_and_gains_errors() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let info = request_from_bob(&h, 1000, "USD")?;
    h.network.respond_all(Outcome::Failure)?;

    let transaction = h
        .ctx()
        .transaction(&info.transaction.transaction_id)?
        .context("transaction missing")?;
    assert_eq!(transaction.pending_action, Some(PendingAction::Add));
    assert!(!transaction.errors.is_empty());

    let chat = h.report(&info.chat_report.report_id)?.context("chat missing")?;
    assert!(chat.error_fields.contains_key("createChat"));
    Ok(())
}

#[test]
fn second_request_merges_into_the_open_report() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let first = request_from_bob(&h, 1000, "USD")?;
    h.network.respond_all(Outcome::Success)?;
    let iou_id = first.iou_report.report_id.clone();

    let report_before = h.report(&iou_id)?.context("iou report missing")?;
    let chat_before = h.report(&first.chat_report.report_id)?.context("chat missing")?;

    let second = request_from_bob(&h, 500, "USD")?;
    assert_eq!(second.iou_report.report_id, iou_id);
    assert!(!second.is_new_chat_report);

    // existing report is merged, not replaced
    let update = second
        .onyx_data
        .optimistic_value(&OnyxKey::Report(iou_id.clone()))
        .context("report was not written")?;
    assert!(!update.is_set());
    assert_eq!(h.report(&iou_id)?.context("iou report missing")?.total(), 1500);

    // only the new IOU action is appended
    let actions = h.actions(&iou_id)?;
    assert_eq!(actions.iter().filter(|a| a.action_name == ActionName::Created).count(), 1);
    assert_eq!(actions.iter().filter(|a| a.action_name == ActionName::Iou).count(), 2);

    // a rejected write puts the pre-existing reports back as they were
    h.network.respond(Outcome::Failure)?;
    assert_eq!(h.report(&iou_id)?, Some(report_before));
    assert_eq!(h.report(&first.chat_report.report_id)?, Some(chat_before));
    Ok(())
}

#[test]
fn deleting_the_last_request_removes_the_report() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let info = request_from_bob(&h, 1000, "USD")?;
    h.network.respond_all(Outcome::Success)?;
    let iou_id = info.iou_report.report_id.clone();
    let action_id = info.iou_action.report_action_id.clone();

    let deleted = h
        .service
        .delete_money_request(&info.transaction.transaction_id, &action_id, false)?
        .context("delete was not built")?;
    assert!(deleted.should_delete_iou_report);
    assert!(deleted.should_delete_transaction_thread);
    assert!(h.ctx().transaction(&info.transaction.transaction_id)?.is_none());

    h.network.respond_all(Outcome::Success)?;
    assert!(h.report(&iou_id)?.is_none());
    assert!(!h.ctx().report_actions(&iou_id)?.contains_key(&action_id));

    let chat = h.report(&info.chat_report.report_id)?.context("chat missing")?;
    assert_eq!(chat.iou_report_id, None);
    assert_eq!(
        h.navigator.events().last(),
        Some(&Navigation::GoToReport(info.chat_report.report_id.clone()))
    );
    Ok(())
}

#[test]
fn split_three_ways_gives_the_payer_the_remainder() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let input = SplitBillInput {
        participants: vec![
            Participant::person(BOB, "bob@example.com"),
            Participant::person(CAROL, "carol@example.com"),
        ],
        details: details(100, "USD"),
        split_chat_report_id: None,
        split_shares: Default::default(),
        request_type: IouRequestType::Manual,
        split_payer_account_ids: vec![ALICE],
    };
    let info = h.service.split_bill(input)?.context("split was not built")?;

    assert_eq!(info.splits.len(), 3);
    assert_eq!(info.shares_total(), 100);
    for split in &info.splits {
        let expected = if split.account_id == ALICE { 34 } else { 33 };
        assert_eq!(split.amount, expected, "share of {}", split.account_id);
    }
    assert_eq!(h.network.pending_commands(), vec![WriteCommand::SplitBill]);
    Ok(())
}

#[test]
fn moving_into_the_report_currency_adds_the_full_amount() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let first = request_from_bob(&h, 1000, "USD")?;
    let foreign = request_from_bob(&h, 500, "EUR")?;
    h.network.respond_all(Outcome::Success)?;

    // the EUR expense does not count towards the USD total yet
    let iou_id = first.iou_report.report_id.clone();
    let before = h.report(&iou_id)?.context("iou report missing")?;
    assert_eq!(before.total(), 1000);

    let changes = TransactionChanges {
        currency: Some("USD".to_string()),
        ..Default::default()
    };
    h.service.edit_money_request(
        &foreign.transaction.transaction_id,
        &foreign.transaction_thread_report_id,
        &changes,
    )?;
    assert_eq!(h.report(&iou_id)?.context("iou report missing")?.total(), 1500);
    assert_eq!(
        h.network.pending_commands(),
        vec![WriteCommand::UpdateMoneyRequestAmountAndCurrency]
    );

    // the failure puts the report back
    h.network.respond(Outcome::Failure)?;
    assert_eq!(h.report(&iou_id)?, Some(before));
    let transaction = h
        .ctx()
        .transaction(&foreign.transaction.transaction_id)?
        .context("transaction missing")?;
    assert_eq!(transaction.currency, "EUR");
    assert!(transaction.error_fields.contains_key("currency"));
    Ok(())
}

#[test]
fn hold_then_unhold() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let info = request_from_bob(&h, 1000, "USD")?;
    h.network.respond_all(Outcome::Success)?;
    let transaction_id = info.transaction.transaction_id.clone();
    let thread_id = info.transaction_thread_report_id.clone();

    h.service.put_on_hold(&transaction_id, "waiting on a receipt", &thread_id)?;
    let held = h.ctx().transaction(&transaction_id)?.context("transaction missing")?;
    assert!(held.is_on_hold());

    // a second hold is refused
    let err = h
        .service
        .put_on_hold(&transaction_id, "again", &thread_id)
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<IouError>(), Some(IouError::NotPermitted { .. })));

    h.network.respond_all(Outcome::Success)?;
    h.service.unhold_request(&transaction_id, &thread_id)?;
    let released = h.ctx().transaction(&transaction_id)?.context("transaction missing")?;
    assert!(!released.is_on_hold());
    Ok(())
}

#[test]
fn approval_needs_a_workspace_report() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let info = request_from_bob(&h, 1000, "USD")?;
    h.network.respond_all(Outcome::Success)?;

    // a 1:1 IOU report is paid, never approved
    let err = h
        .service
        .approve_money_request(&info.iou_report.report_id, true)
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<IouError>(), Some(IouError::NotPermitted { .. })));
    assert!(h.network.is_empty());
    Ok(())
}

#[test]
fn missing_report_is_reported() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let err = h.service.submit_report("404").unwrap_err();
    assert!(matches!(err.downcast_ref::<IouError>(), Some(IouError::ReportNotFound(id)) if id == "404"));
    Ok(())
}

#[test]
fn configured_store_path_persists_writes() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let path = temp_dir.path().join("test_configured_store.db");
    let config = EngineConfig::from_lookup(|name| match name {
        "IOU_STORE_PATH" => Some(path.display().to_string()),
        _ => None,
    })?;

    let ctx = EngineContext::from_config(config)?;
    ctx.store.set(
        &OnyxKey::Session,
        Some(json!({"accountID": ALICE, "email": "alice@example.com"})),
    )?;
    // the cache picks up the session through its subscription
    assert_eq!(ctx.current_account_id(), ALICE);
    assert!(ctx.store.get(&OnyxKey::Session)?.is_some());
    Ok(())
}

/// Tracking on the self DM keeps the IOU action in the chat and leaves the
/// expense unreported
#[test]
fn tracked_expense_stays_on_the_self_dm() -> anyhow::Result<()> {
    let h = memory_harness()?;
    h.store.set(
        &OnyxKey::Report("50".into()),
        Some(json!({"reportID": "50", "type": "chat", "chatType": "selfDM", "ownerAccountID": ALICE})),
    )?;

    let info = h
        .service
        .track_expense(iou_engine::request::TrackExpenseInput {
            chat_report_id: "50".into(),
            details: details(700, "USD"),
            money_request_report_id: None,
            draft: TransactionRef::Draft,
        })?
        .context("tracked expense was not built")?;

    assert!(info.money_report.is_none());
    assert!(info.actionable_whisper_report_action_id.is_some());
    let transaction = h
        .ctx()
        .transaction(&info.transaction.transaction_id)?
        .context("transaction missing")?;
    assert_eq!(transaction.report_id, "0");
    assert!(h.actions("50")?.iter().any(|a| a.action_name == ActionName::Iou));

    assert_eq!(h.network.pending_commands(), vec![WriteCommand::TrackExpense]);
    assert_eq!(
        h.navigator.events(),
        vec![Navigation::DismissModal {
            report_id: Some("50".into())
        }]
    );
    Ok(())
}

/// A report the server never accepted disappears when its error is dismissed
#[test]
fn dismissing_a_failed_creation_removes_the_report() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let info = request_from_bob(&h, 1000, "USD")?;
    h.network.respond_all(Outcome::Failure)?;

    let key = OnyxKey::Report(info.iou_report.report_id.clone());
    assert!(h.store.get(&key)?.is_some());
    h.service.dismiss_error(&key)?;
    assert!(h.store.get(&key)?.is_none());

    let err = h.service.dismiss_error(&OnyxKey::Session).unwrap_err();
    assert!(matches!(err.downcast_ref::<IouError>(), Some(IouError::NotImplemented(_))));
    Ok(())
}

/// Only the manager of an IOU report pays it
#[test]
fn the_payee_cannot_pay_their_own_request() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let info = request_from_bob(&h, 1000, "USD")?;
    h.network.respond_all(Outcome::Success)?;

    let err = h
        .service
        .pay_money_request(
            iou_engine::types::PaymentMethodType::Elsewhere,
            &info.chat_report.report_id,
            &info.iou_report.report_id,
            true,
        )
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<IouError>(), Some(IouError::NotPermitted { action: "pay", .. })));
    assert!(h.network.is_empty());
    Ok(())
}

/// Invoices open a room with the receiver and carry a negative total
#[test]
fn sending_an_invoice_opens_an_invoice_room() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let info = h
        .service
        .send_invoice(iou_engine::request::SendInvoiceInput {
            sender_policy_id: "p1".into(),
            receiver: Participant::person(BOB, "bob@example.com"),
            details: details(900, "USD"),
            chat_report_id: None,
        })?
        .context("invoice was not built")?;

    assert!(info.is_new_chat_report);
    assert_eq!(info.receiver_account_id, BOB);
    let room = h.report(&info.invoice_room.report_id)?.context("invoice room missing")?;
    assert!(room.is_invoice_room());
    let invoice = h.report(&info.invoice_report.report_id)?.context("invoice missing")?;
    assert!(invoice.is_invoice_report());
    assert_eq!(invoice.total(), -900);
    assert_eq!(invoice.chat_report_id.as_deref(), Some(room.report_id.as_str()));

    assert_eq!(h.network.pending_commands(), vec![WriteCommand::SendInvoice]);
    assert_eq!(
        h.navigator.events(),
        vec![Navigation::DismissModal {
            report_id: Some(room.report_id.clone())
        }]
    );
    Ok(())
}

/// Moving a tracked expense into a request keeps the transaction and points
/// it at the new report
#[test]
fn tracked_expense_converts_into_a_request() -> anyhow::Result<()> {
    let h = memory_harness()?;
    h.store.set(
        &OnyxKey::Report("50".into()),
        Some(json!({"reportID": "50", "type": "chat", "chatType": "selfDM", "ownerAccountID": ALICE})),
    )?;
    let tracked = h
        .service
        .track_expense(iou_engine::request::TrackExpenseInput {
            chat_report_id: "50".into(),
            details: details(700, "USD"),
            money_request_report_id: None,
            draft: TransactionRef::Draft,
        })?
        .context("tracked expense was not built")?;
    h.network.respond_all(Outcome::Success)?;

    let transaction_id = tracked.transaction.transaction_id.clone();
    let moved = h
        .service
        .convert_tracked_expense_to_request(iou_engine::request::ConvertTrackedExpenseInput {
            destination: iou_engine::request::TrackedExpenseDestination::Request,
            participant: Participant::person(BOB, "bob@example.com"),
            details: details(700, "USD"),
            self_dm_report_id: "50".into(),
            transaction_id: transaction_id.clone(),
            tracked_action_id: tracked.iou_action.report_action_id.clone(),
        })?
        .context("conversion was not built")?;

    assert_eq!(moved.request.transaction.transaction_id, transaction_id);
    let transaction = h.ctx().transaction(&transaction_id)?.context("transaction missing")?;
    assert_eq!(transaction.report_id, moved.request.iou_report.report_id);
    assert_eq!(h.report(&moved.request.iou_report.report_id)?.context("iou report missing")?.total(), 700);
    assert!(
        h.actions(&moved.request.transaction_thread_report_id)?
            .iter()
            .any(|a| a.action_name == ActionName::ModifiedExpense)
    );
    assert_eq!(h.network.pending_commands(), vec![WriteCommand::ConvertTrackedExpenseToRequest]);
    Ok(())
}

/// Edits move the total on behalf of the requester, whoever is signed in,
/// and only the requester may edit through the service
#[test]
fn edits_count_for_the_requester() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let info = request_from_bob(&h, 1000, "USD")?;
    h.network.respond_all(Outcome::Success)?;
    let iou_id = info.iou_report.report_id.clone();

    // Bob signs in on the same device
    h.store.set(
        &OnyxKey::Session,
        Some(json!({"accountID": BOB, "email": "bob@example.com"})),
    )?;
    assert_eq!(h.ctx().current_account_id(), BOB);

    let changes = TransactionChanges {
        amount: Some(1500),
        currency: Some("USD".to_string()),
        ..Default::default()
    };
    let err = h
        .service
        .edit_money_request(&info.transaction.transaction_id, &info.transaction_thread_report_id, &changes)
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<IouError>(), Some(IouError::NotPermitted { action: "edit", .. })));
    assert!(h.network.is_empty());

    let request = iou_engine::edit::get_update_money_request_params(
        h.ctx(),
        &info.transaction.transaction_id,
        &info.transaction_thread_report_id,
        &changes,
    )?
    .context("edit was not built")?;
    h.store.apply(&request.onyx_data.optimistic_data)?;

    let report = h.report(&iou_id)?.context("iou report missing")?;
    assert_eq!(report.total(), 1500);
    assert_eq!(report.owner_account_id, Some(ALICE));
    assert_eq!(report.manager_id, Some(BOB));
    Ok(())
}

// LIFECYCLE ROUND TRIPS

/// Switches the signed in account, the cache follows the session key
fn sign_in(h: &Harness, account_id: i64, email: &str) -> anyhow::Result<()> {
    h.store.set(
        &OnyxKey::Session,
        Some(json!({"accountID": account_id, "email": email})),
    )?;
    Ok(())
}

/// A team workspace where Alice files an open expense report that Bob approves
fn workspace_harness() -> anyhow::Result<Harness> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    store.set(
        &OnyxKey::Policy("p1".into()),
        Some(json!({
            "id": "p1",
            "name": "Team",
            "type": "team",
            "role": "user",
            "ownerAccountID": BOB,
            "approvalMode": "BASIC",
            "submitsTo": BOB,
            "reimbursementChoice": "reimburseManual",
        })),
    )?;
    store.set(
        &OnyxKey::Report("70".into()),
        Some(json!({
            "reportID": "70",
            "type": "chat",
            "chatType": "policyExpenseChat",
            "policyID": "p1",
            "ownerAccountID": ALICE,
            "iouReportID": "71",
            "hasOutstandingChildRequest": false,
        })),
    )?;
    store.set(
        &OnyxKey::Report("71".into()),
        Some(json!({
            "reportID": "71",
            "type": "expense",
            "policyID": "p1",
            "chatReportID": "70",
            "parentReportID": "70",
            "ownerAccountID": ALICE,
            "managerID": BOB,
            "currency": "USD",
            "total": -1000,
            "nonReimbursableTotal": 0,
            "stateNum": 0,
            "statusNum": 0,
        })),
    )?;
    harness(store)
}

#[test]
fn failed_submit_reopens_the_report() -> anyhow::Result<()> {
    let h = workspace_harness()?;
    let report_before = h.report("71")?.context("expense report missing")?;
    let chat_before = h.report("70")?.context("chat missing")?;

    h.service.submit_report("71")?;
    let submitted = h.report("71")?.context("expense report missing")?;
    assert_eq!(submitted.state_num, Some(StateNum::Submitted));
    assert_eq!(submitted.status_num, Some(StatusNum::Submitted));
    assert!(h.ctx().next_step("71")?.is_some());
    assert!(h.actions("71")?.iter().any(|a| a.action_name == ActionName::Submitted));
    let chat = h.report("70")?.context("chat missing")?;
    assert_eq!(chat.iou_report_id, None);
    assert_eq!(chat.has_outstanding_child_request, Some(false));
    assert_eq!(h.network.pending_commands(), vec![WriteCommand::SubmitReport]);

    h.network.respond(Outcome::Failure)?;
    assert_eq!(h.report("71")?, Some(report_before));
    assert_eq!(h.report("70")?, Some(chat_before));
    assert!(h.ctx().next_step("71")?.is_none());
    Ok(())
}

#[test]
fn submit_approve_and_unapprove() -> anyhow::Result<()> {
    let h = workspace_harness()?;
    h.service.submit_report("71")?;
    h.network.respond_all(Outcome::Success)?;
    assert!(h.actions("71")?.iter().all(|a| a.pending_action.is_none()));

    // only the manager approves
    let err = h.service.approve_money_request("71", true).unwrap_err();
    assert!(matches!(err.downcast_ref::<IouError>(), Some(IouError::NotPermitted { action: "approve", .. })));
    sign_in(&h, BOB, "bob@example.com")?;

    // a rejected approval puts the submitted report back
    let submitted = h.report("71")?.context("expense report missing")?;
    let step_before = h.ctx().next_step("71")?;
    h.service.approve_money_request("71", true)?;
    assert!(h.report("71")?.context("expense report missing")?.is_approved());
    h.network.respond(Outcome::Failure)?;
    assert_eq!(h.report("71")?, Some(submitted));
    assert_eq!(h.ctx().next_step("71")?, step_before);

    h.service.approve_money_request("71", true)?;
    h.network.respond(Outcome::Success)?;
    let approved = h.report("71")?.context("expense report missing")?;
    assert!(approved.is_approved());
    assert!(approved.pending_fields.is_empty());
    assert_ne!(h.ctx().next_step("71")?, step_before);
    assert_eq!(
        h.report("70")?.context("chat missing")?.has_outstanding_child_request,
        Some(false)
    );

    h.service.unapprove_expense_report("71")?;
    assert_eq!(h.network.pending_commands(), vec![WriteCommand::UnapproveExpenseReport]);
    h.network.respond(Outcome::Success)?;
    let unapproved = h.report("71")?.context("expense report missing")?;
    assert_eq!(unapproved.state_num, Some(StateNum::Submitted));
    assert_eq!(unapproved.status_num, Some(StatusNum::Submitted));
    assert!(unapproved.pending_fields.is_empty());
    assert!(h.actions("71")?.iter().any(|a| a.action_name == ActionName::Unapproved));
    Ok(())
}

#[test]
fn failed_payment_restores_the_report_and_chat() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let info = request_from_bob(&h, 1000, "USD")?;
    h.network.respond_all(Outcome::Success)?;
    let iou_id = info.iou_report.report_id.clone();
    let chat_id = info.chat_report.report_id.clone();

    sign_in(&h, BOB, "bob@example.com")?;
    let report_before = h.report(&iou_id)?.context("iou report missing")?;
    let chat_before = h.report(&chat_id)?.context("chat missing")?;
    let step_before = h.ctx().next_step(&iou_id)?;

    h.service
        .pay_money_request(PaymentMethodType::Elsewhere, &chat_id, &iou_id, true)?;
    let paid = h.report(&iou_id)?.context("iou report missing")?;
    assert!(paid.is_settled());
    assert!(paid.pending_fields.contains_key("reimbursed"));
    let chat = h.report(&chat_id)?.context("chat missing")?;
    assert_eq!(chat.has_outstanding_child_request, Some(false));
    assert_eq!(chat.iou_report_id, None);
    assert_eq!(h.network.pending_commands(), vec![WriteCommand::PayMoneyRequest]);
    assert_eq!(
        h.navigator.events().last(),
        Some(&Navigation::DismissModal {
            report_id: Some(chat_id.clone())
        })
    );

    h.network.respond(Outcome::Failure)?;
    assert_eq!(h.report(&iou_id)?, Some(report_before));
    assert_eq!(h.report(&chat_id)?, Some(chat_before));
    assert_eq!(h.ctx().next_step(&iou_id)?, step_before);
    Ok(())
}

#[test]
fn pay_then_cancel_the_payment() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let info = request_from_bob(&h, 1000, "USD")?;
    h.network.respond_all(Outcome::Success)?;
    let iou_id = info.iou_report.report_id.clone();
    let chat_id = info.chat_report.report_id.clone();

    sign_in(&h, BOB, "bob@example.com")?;
    h.service
        .pay_money_request(PaymentMethodType::Elsewhere, &chat_id, &iou_id, true)?;
    h.network.respond(Outcome::Success)?;

    let paid = h.report(&iou_id)?.context("iou report missing")?;
    assert!(paid.is_settled());
    assert!(paid.pending_fields.is_empty());
    assert!(h.ctx().next_step(&iou_id)?.is_some());
    assert_eq!(
        h.store.get(&OnyxKey::LastPaymentMethod)?,
        Some(json!({"-1": "Elsewhere"}))
    );

    // paying twice is refused
    let err = h
        .service
        .pay_money_request(PaymentMethodType::Elsewhere, &chat_id, &iou_id, true)
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<IouError>(), Some(IouError::NotPermitted { .. })));

    // a failed cancellation leaves the report paid with the request outstanding
    h.service.cancel_payment(&iou_id)?;
    let cancelled = h.report(&iou_id)?.context("iou report missing")?;
    assert_eq!(cancelled.state_num, Some(StateNum::Approved));
    assert_eq!(cancelled.status_num, Some(StatusNum::Approved));
    assert!(h.actions(&iou_id)?.iter().any(|a| a.action_name == ActionName::CancelledPayment));

    h.network.respond(Outcome::Failure)?;
    assert!(h.report(&iou_id)?.context("iou report missing")?.is_settled());
    let chat = h.report(&chat_id)?.context("chat missing")?;
    assert_eq!(chat.has_outstanding_child_request, Some(true));
    assert_eq!(chat.iou_report_id.as_deref(), Some(iou_id.as_str()));
    Ok(())
}

#[test]
fn the_receiver_pays_an_invoice() -> anyhow::Result<()> {
    let h = memory_harness()?;
    let info = h
        .service
        .send_invoice(iou_engine::request::SendInvoiceInput {
            sender_policy_id: "p1".into(),
            receiver: Participant::person(BOB, "bob@example.com"),
            details: details(900, "USD"),
            chat_report_id: None,
        })?
        .context("invoice was not built")?;
    h.network.respond_all(Outcome::Success)?;
    let room_id = info.invoice_room.report_id.clone();
    let invoice_id = info.invoice_report.report_id.clone();

    // the sender is not the one who pays
    let err = h
        .service
        .pay_invoice(PaymentMethodType::Elsewhere, &room_id, &invoice_id)
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<IouError>(), Some(IouError::NotPermitted { action: "pay invoice", .. })));

    sign_in(&h, BOB, "bob@example.com")?;
    h.service
        .pay_invoice(PaymentMethodType::Elsewhere, &room_id, &invoice_id)?;
    assert_eq!(h.network.pending_commands(), vec![WriteCommand::PayInvoice]);
    h.network.respond(Outcome::Success)?;

    let invoice = h.report(&invoice_id)?.context("invoice missing")?;
    assert!(invoice.is_settled());
    assert!(invoice.pending_fields.is_empty());
    assert_eq!(
        h.report(&room_id)?.context("invoice room missing")?.has_outstanding_child_request,
        Some(false)
    );
    Ok(())
}
