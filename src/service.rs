//! Service layer API for the money request workflow.
//!
//! Every entry point checks its guards, applies the optimistic patches to the
//! store, hands the write to the network and performs at most one navigation.
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::context::EngineContext;
use crate::delete::{self, DeleteInformation, WhisperResolution};
use crate::edit;
use crate::error::IouError;
use crate::network::{Navigation, Navigator, Network, WriteCommand, WriteRequest};
use crate::onyx::{OnyxKey, OnyxUpdate};
use crate::report::Report;
use crate::request::{
    self, ConvertTrackedExpenseInformation, ConvertTrackedExpenseInput, DraftField, MoneyRequestInformation,
    MoneyRequestInput, SendInvoiceInformation, SendInvoiceInput, TrackExpenseInformation, TrackExpenseInput,
    TrackedExpenseDestination,
};
use crate::settlement;
use crate::split::{self, SplitBillInput, SplitInformation};
use crate::transaction::{Transaction, TransactionChanges};
use crate::types::{AccountId, IouRequestType, PaymentMethodType, PendingAction, TransactionRef};

pub struct IouService {
    ctx: Arc<EngineContext>,
    network: Arc<dyn Network>,
    navigator: Arc<dyn Navigator>,
}

impl IouService {
    pub fn new(ctx: Arc<EngineContext>, network: Arc<dyn Network>, navigator: Arc<dyn Navigator>) -> Self {
        Self { ctx, network, navigator }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Apply the optimistic patches, then queue the write
    fn dispatch(&self, request: WriteRequest) -> anyhow::Result<()> {
        self.ctx.store.apply(&request.onyx_data.optimistic_data)?;
        info!(command = %request.command, "dispatching write");
        self.network.write(request)
    }

    fn load_report(&self, report_id: &str) -> anyhow::Result<Report> {
        self.ctx
            .report(report_id)?
            .ok_or_else(|| IouError::ReportNotFound(report_id.to_string()).into())
    }

    fn load_transaction(&self, transaction_id: &str) -> anyhow::Result<Transaction> {
        self.ctx
            .transaction(transaction_id)?
            .ok_or_else(|| IouError::TransactionNotFound(transaction_id.to_string()).into())
    }

    /// The requester edits their own expense. Workspace admins may edit
    /// expenses on expense reports as well.
    fn can_edit_money_request(&self, thread: &Report) -> anyhow::Result<bool> {
        let current = self.ctx.current_account_id();
        let Some(action) = edit::parent_iou_action(&self.ctx, thread)? else {
            return Ok(true);
        };
        if action.actor_account_id.is_none_or(|actor| actor == current) {
            return Ok(true);
        }
        let parent = match thread.parent_report_id.as_deref() {
            Some(id) => self.ctx.report(id)?,
            None => None,
        };
        Ok(parent.is_some_and(|report| {
            report.is_expense_report() && self.ctx.policy(report.policy_id.as_deref()).is_some_and(|p| p.is_admin())
        }))
    }

    fn check_amount(amount: i64) -> anyhow::Result<()> {
        if amount < 0 {
            return Err(IouError::InvalidAmount(amount).into());
        }
        Ok(())
    }

    /// Request money from a person or submit an expense to a workspace
    pub fn request_money(&self, input: MoneyRequestInput) -> anyhow::Result<Option<MoneyRequestInformation>> {
        Self::check_amount(input.details.amount)?;
        if request::resolve_account_id(&self.ctx, &input.participant).is_none() && input.participant.report_id.is_none() {
            return Err(IouError::MissingParticipants.into());
        }

        let Some(info) = request::get_money_request_information(&self.ctx, &input)? else {
            warn!("money request could not be built");
            return Ok(None);
        };
        self.dispatch(WriteRequest::new(WriteCommand::RequestMoney, info.params(), info.onyx_data.clone()))?;
        self.navigator.navigate(Navigation::DismissModal {
            report_id: Some(info.chat_report.report_id.clone()),
        });
        Ok(Some(info))
    }

    /// Track an expense on the self DM or a workspace chat
    pub fn track_expense(&self, input: TrackExpenseInput) -> anyhow::Result<Option<TrackExpenseInformation>> {
        Self::check_amount(input.details.amount)?;
        let Some(info) = request::get_track_expense_information(&self.ctx, &input)? else {
            return Ok(None);
        };
        self.dispatch(WriteRequest::new(WriteCommand::TrackExpense, info.params(), info.onyx_data.clone()))?;
        self.navigator.navigate(Navigation::DismissModal {
            report_id: Some(info.chat_report.report_id.clone()),
        });
        Ok(Some(info))
    }

    pub fn split_bill(&self, input: SplitBillInput) -> anyhow::Result<Option<SplitInformation>> {
        Self::check_amount(input.details.amount)?;
        if input.participants.is_empty() {
            return Err(IouError::MissingParticipants.into());
        }
        let Some(info) = split::create_splits_and_onyx_data(&self.ctx, &input)? else {
            return Ok(None);
        };
        self.dispatch(WriteRequest::new(WriteCommand::SplitBill, info.params(), info.onyx_data.clone()))?;
        self.navigator.navigate(Navigation::DismissModal {
            report_id: Some(info.split_chat_report.report_id.clone()),
        });
        Ok(Some(info))
    }

    pub fn send_invoice(&self, input: SendInvoiceInput) -> anyhow::Result<Option<SendInvoiceInformation>> {
        Self::check_amount(input.details.amount)?;
        let Some(info) = request::get_send_invoice_information(&self.ctx, &input)? else {
            return Ok(None);
        };
        self.dispatch(WriteRequest::new(WriteCommand::SendInvoice, info.params(), info.onyx_data.clone()))?;
        self.navigator.navigate(Navigation::DismissModal {
            report_id: Some(info.invoice_room.report_id.clone()),
        });
        Ok(Some(info))
    }

    /// Move a tracked expense off the self DM to a person or a workspace
    pub fn move_tracked_expense(
        &self,
        input: ConvertTrackedExpenseInput,
    ) -> anyhow::Result<Option<ConvertTrackedExpenseInformation>> {
        Self::check_amount(input.details.amount)?;
        // Verify it's still a tracked expense on the self DM
        let self_dm = self.load_report(&input.self_dm_report_id)?;
        if !self_dm.is_self_dm() {
            return Err(IouError::NotPermitted {
                action: "move tracked expense",
                reason: "the expense is not on the self DM",
            }
            .into());
        }

        let Some(info) = request::get_convert_tracked_expense_information(&self.ctx, &input)? else {
            return Ok(None);
        };
        let command = match info.destination {
            TrackedExpenseDestination::Request => WriteCommand::ConvertTrackedExpenseToRequest,
            TrackedExpenseDestination::Categorize => WriteCommand::CategorizeTrackedExpense,
            TrackedExpenseDestination::Share { .. } => WriteCommand::ShareTrackedExpense,
        };
        self.dispatch(WriteRequest::new(command, info.params(), info.onyx_data.clone()))?;
        self.navigator.navigate(Navigation::DismissModal {
            report_id: Some(info.request.chat_report.report_id.clone()),
        });
        Ok(Some(info))
    }

    pub fn convert_tracked_expense_to_request(
        &self,
        input: ConvertTrackedExpenseInput,
    ) -> anyhow::Result<Option<ConvertTrackedExpenseInformation>> {
        self.move_tracked_expense(ConvertTrackedExpenseInput {
            destination: TrackedExpenseDestination::Request,
            ..input
        })
    }

    pub fn categorize_tracked_expense(
        &self,
        input: ConvertTrackedExpenseInput,
    ) -> anyhow::Result<Option<ConvertTrackedExpenseInformation>> {
        self.move_tracked_expense(ConvertTrackedExpenseInput {
            destination: TrackedExpenseDestination::Categorize,
            ..input
        })
    }

    pub fn share_tracked_expense(
        &self,
        input: ConvertTrackedExpenseInput,
        accountant_email: &str,
    ) -> anyhow::Result<Option<ConvertTrackedExpenseInformation>> {
        self.move_tracked_expense(ConvertTrackedExpenseInput {
            destination: TrackedExpenseDestination::Share {
                accountant_email: accountant_email.to_string(),
            },
            ..input
        })
    }

    /// Delete an expense from its money report. Returns the delete details so
    /// callers can tell whether the report went away with it.
    pub fn delete_money_request(
        &self,
        transaction_id: &str,
        report_action_id: &str,
        is_single_transaction_view: bool,
    ) -> anyhow::Result<Option<DeleteInformation>> {
        let transaction = self.load_transaction(transaction_id)?;
        let action = self
            .ctx
            .report_action(&transaction.report_id, report_action_id)?
            .ok_or_else(|| IouError::ActionNotFound(report_action_id.to_string()))?;

        let Some(info) = delete::get_delete_money_request_information(&self.ctx, transaction_id, &action)? else {
            return Ok(None);
        };
        self.dispatch(WriteRequest::new(WriteCommand::DeleteMoneyRequest, info.params(), info.onyx_data.clone()))?;
        if let Some(target) = info.navigation_target(is_single_transaction_view) {
            self.navigator.navigate(Navigation::GoToReport(target));
        }
        Ok(Some(info))
    }

    /// Delete an expense tracked on the self DM. Anywhere else this is a plain delete.
    pub fn delete_track_expense(
        &self,
        chat_report_id: &str,
        transaction_id: &str,
        report_action_id: &str,
        is_single_transaction_view: bool,
    ) -> anyhow::Result<Option<DeleteInformation>> {
        let chat = self.load_report(chat_report_id)?;
        if !chat.is_self_dm() {
            return self.delete_money_request(transaction_id, report_action_id, is_single_transaction_view);
        }
        let action = self
            .ctx
            .report_action(chat_report_id, report_action_id)?
            .ok_or_else(|| IouError::ActionNotFound(report_action_id.to_string()))?;

        let Some(info) = delete::get_delete_track_expense_information(
            &self.ctx,
            chat_report_id,
            transaction_id,
            &action,
            false,
            WhisperResolution::Nothing,
        )?
        else {
            return Ok(None);
        };
        self.dispatch(WriteRequest::new(WriteCommand::DeleteTrackedExpense, info.params(), info.onyx_data.clone()))?;
        if let Some(target) = info.navigation_target(is_single_transaction_view) {
            self.navigator.navigate(Navigation::GoToReport(target));
        }
        Ok(Some(info))
    }

    /// Edit one or more fields of an expense from its thread
    pub fn edit_money_request(
        &self,
        transaction_id: &str,
        transaction_thread_report_id: &str,
        changes: &TransactionChanges,
    ) -> anyhow::Result<()> {
        if changes.is_empty() {
            return Err(IouError::NothingToUpdate.into());
        }
        if let Some(amount) = changes.amount {
            Self::check_amount(amount)?;
        }
        self.load_transaction(transaction_id)?;

        // Verify the current user may edit it
        let thread = self.load_report(transaction_thread_report_id)?;
        if !self.can_edit_money_request(&thread)? {
            return Err(IouError::NotPermitted {
                action: "edit",
                reason: "only the requester or a workspace admin edits an expense",
            }
            .into());
        }

        match edit::get_update_money_request_params(&self.ctx, transaction_id, transaction_thread_report_id, changes)? {
            Some(request) => self.dispatch(request),
            None => Ok(()),
        }
    }

    pub fn put_on_hold(&self, transaction_id: &str, comment: &str, report_id: &str) -> anyhow::Result<()> {
        let transaction = self.load_transaction(transaction_id)?;
        if transaction.is_on_hold() {
            return Err(IouError::NotPermitted {
                action: "hold",
                reason: "the expense is already on hold",
            }
            .into());
        }
        match edit::put_on_hold(&self.ctx, transaction_id, comment, report_id)? {
            Some(request) => self.dispatch(request),
            None => Ok(()),
        }
    }

    pub fn unhold_request(&self, transaction_id: &str, report_id: &str) -> anyhow::Result<()> {
        let transaction = self.load_transaction(transaction_id)?;
        if !transaction.is_on_hold() {
            return Err(IouError::NotPermitted {
                action: "unhold",
                reason: "the expense is not on hold",
            }
            .into());
        }
        match edit::unhold_request(&self.ctx, transaction_id, report_id)? {
            Some(request) => self.dispatch(request),
            None => Ok(()),
        }
    }

    pub fn replace_receipt(&self, transaction_id: &str, source: &str, filename: &str) -> anyhow::Result<()> {
        match edit::replace_receipt(&self.ctx, transaction_id, source, filename)? {
            Some(request) => self.dispatch(request),
            None => Err(IouError::TransactionNotFound(transaction_id.to_string()).into()),
        }
    }

    pub fn detach_receipt(&self, transaction_id: &str) -> anyhow::Result<()> {
        match edit::detach_receipt(&self.ctx, transaction_id)? {
            Some(request) => self.dispatch(request),
            None => Err(IouError::TransactionNotFound(transaction_id.to_string()).into()),
        }
    }

    /// Approve a submitted expense report
    pub fn approve_money_request(&self, report_id: &str, full: bool) -> anyhow::Result<()> {
        // Load from DB
        let report = self.load_report(report_id)?;
        let chat = match &report.chat_report_id {
            Some(id) => self.ctx.report(id)?,
            None => None,
        };
        let policy = self.ctx.policy(report.policy_id.as_deref());

        // Verify the current user may approve it
        if !settlement::can_approve_iou(&report, chat.as_ref(), policy.as_ref(), self.ctx.current_account_id()) {
            return Err(IouError::NotPermitted {
                action: "approve",
                reason: "the report cannot be approved by the current user",
            }
            .into());
        }

        match settlement::approve_money_request(&self.ctx, report_id, full)? {
            Some(request) => self.dispatch(request),
            None => Ok(()),
        }
    }

    pub fn unapprove_expense_report(&self, report_id: &str) -> anyhow::Result<()> {
        let report = self.load_report(report_id)?;
        let policy = self.ctx.policy(report.policy_id.as_deref());
        let current = self.ctx.current_account_id();
        let may_unapprove = report.manager_id == Some(current) || policy.as_ref().is_some_and(|p| p.is_admin());
        if !report.is_expense_report() || !report.is_approved() || !may_unapprove {
            return Err(IouError::NotPermitted {
                action: "unapprove",
                reason: "only an approved expense report can be unapproved by its approver",
            }
            .into());
        }
        match settlement::unapprove_expense_report(&self.ctx, report_id)? {
            Some(request) => self.dispatch(request),
            None => Ok(()),
        }
    }

    pub fn submit_report(&self, report_id: &str) -> anyhow::Result<()> {
        let report = self.load_report(report_id)?;
        if !report.is_open_expense_report() {
            return Err(IouError::NotPermitted {
                action: "submit",
                reason: "only an open expense report can be submitted",
            }
            .into());
        }
        match settlement::submit_report(&self.ctx, report_id)? {
            Some(request) => self.dispatch(request),
            None => Ok(()),
        }
    }

    /// Pay a money report. The modal closes back to the chat.
    pub fn pay_money_request(
        &self,
        payment_type: PaymentMethodType,
        chat_report_id: &str,
        iou_report_id: &str,
        full: bool,
    ) -> anyhow::Result<()> {
        // Load from DB
        let report = self.load_report(iou_report_id)?;
        let chat = self.load_report(chat_report_id)?;
        let policy = self.ctx.policy(report.policy_id.as_deref());
        let receiver_policy = settlement::receiver_policy(&self.ctx, &chat);

        // Verify the current user pays it
        if !settlement::can_iou_be_paid(
            &report,
            Some(&chat),
            policy.as_ref(),
            receiver_policy.as_ref(),
            self.ctx.current_account_id(),
        ) {
            return Err(IouError::NotPermitted {
                action: "pay",
                reason: "the report cannot be paid by the current user",
            }
            .into());
        }

        let Some(request) = settlement::pay_money_request(&self.ctx, chat_report_id, iou_report_id, payment_type, full)?
        else {
            return Ok(());
        };
        self.dispatch(request)?;
        self.navigator.navigate(Navigation::DismissModal {
            report_id: Some(chat_report_id.to_string()),
        });
        Ok(())
    }

    pub fn pay_invoice(
        &self,
        payment_type: PaymentMethodType,
        chat_report_id: &str,
        invoice_report_id: &str,
    ) -> anyhow::Result<()> {
        let report = self.load_report(invoice_report_id)?;
        let chat = self.load_report(chat_report_id)?;
        let receiver_policy = settlement::receiver_policy(&self.ctx, &chat);
        if !report.is_invoice_report()
            || !settlement::can_iou_be_paid(
                &report,
                Some(&chat),
                None,
                receiver_policy.as_ref(),
                self.ctx.current_account_id(),
            )
        {
            return Err(IouError::NotPermitted {
                action: "pay invoice",
                reason: "the invoice cannot be paid by the current user",
            }
            .into());
        }
        match settlement::pay_invoice(&self.ctx, chat_report_id, invoice_report_id, payment_type)? {
            Some(request) => self.dispatch(request),
            None => Ok(()),
        }
    }

    pub fn cancel_payment(&self, report_id: &str) -> anyhow::Result<()> {
        let report = self.load_report(report_id)?;
        if !report.is_settled() {
            return Err(IouError::NotPermitted {
                action: "cancel payment",
                reason: "the report has not been paid",
            }
            .into());
        }
        match settlement::cancel_payment(&self.ctx, report_id)? {
            Some(request) => self.dispatch(request),
            None => Ok(()),
        }
    }

    /// Clear the error left by a failed write on a report or transaction.
    /// Entities that never made it to the server are removed.
    pub fn dismiss_error(&self, key: &OnyxKey) -> anyhow::Result<()> {
        if !matches!(key, OnyxKey::Report(_) | OnyxKey::Transaction(_)) {
            return Err(IouError::NotImplemented("dismissing errors outside reports and transactions").into());
        }
        let Some(value) = self.ctx.store.get(key)? else {
            return Ok(());
        };
        let update = if is_failed_add(&value) {
            OnyxUpdate::clear(key.clone())
        } else {
            OnyxUpdate::merge(key.clone(), json!({"errors": null, "errorFields": null}))
        };
        self.ctx.store.apply(&[update])
    }

    pub fn dismiss_action_error(&self, report_id: &str, report_action_id: &str) -> anyhow::Result<()> {
        let action = self
            .ctx
            .report_action(report_id, report_action_id)?
            .ok_or_else(|| IouError::ActionNotFound(report_action_id.to_string()))?;
        let patch = if action.pending_action == Some(PendingAction::Add) && !action.errors.is_empty() {
            Value::Null
        } else {
            json!({"errors": null})
        };
        self.ctx.store.apply(&[OnyxUpdate::merge(
            OnyxKey::ReportActions(report_id.to_string()),
            json!({report_action_id: patch}),
        )])
    }

    /// Start composing a request in the draft transaction
    pub fn init_money_request(
        &self,
        report_id: &str,
        is_from_global_create: bool,
        request_type: IouRequestType,
    ) -> anyhow::Result<()> {
        let policy = match self.ctx.report(report_id)? {
            Some(report) => self.ctx.policy(report.policy_id.as_deref()),
            None => None,
        };
        let update = request::init_money_request(&self.ctx, report_id, policy.as_ref(), is_from_global_create, request_type)?;
        self.ctx.store.apply(&[update])
    }

    pub fn set_draft_field(&self, reference: &TransactionRef, field: &DraftField) -> anyhow::Result<()> {
        self.ctx.store.apply(&[request::set_draft_field(reference, field)])
    }

    pub fn clear_money_request(&self, reference: &TransactionRef) -> anyhow::Result<()> {
        self.ctx.store.apply(&[request::clear_money_request(reference)])
    }

    /// Spread `amount` evenly over the draft's participants
    pub fn set_split_shares(
        &self,
        reference: &TransactionRef,
        amount: i64,
        currency: &str,
        account_ids: &[AccountId],
    ) -> anyhow::Result<()> {
        let draft = self.ctx.transaction_draft(reference)?.unwrap_or_default();
        let update = split::set_split_shares(reference, &draft, self.ctx.current_account_id(), amount, currency, account_ids);
        self.ctx.store.apply(&[update])
    }

    /// Re-spread the split after the draft's amount or currency changed
    pub fn reset_split_shares(
        &self,
        reference: &TransactionRef,
        amount: Option<i64>,
        currency: Option<&str>,
    ) -> anyhow::Result<()> {
        let Some(draft) = self.ctx.transaction_draft(reference)? else {
            return Ok(());
        };
        let update = split::reset_split_shares(reference, &draft, self.ctx.current_account_id(), amount, currency);
        self.ctx.store.apply(&[update])
    }

    /// Pin one person's share, then spread the rest over everyone else
    pub fn set_individual_share(
        &self,
        reference: &TransactionRef,
        account_id: AccountId,
        amount: i64,
    ) -> anyhow::Result<()> {
        self.ctx
            .store
            .apply(&[split::set_individual_share(reference, account_id, amount)])?;
        let Some(draft) = self.ctx.transaction_draft(reference)? else {
            return Ok(());
        };
        if let Some(update) = split::adjust_remaining_split_shares(reference, &draft) {
            self.ctx.store.apply(&[update])?;
        }
        Ok(())
    }
}

fn is_failed_add(value: &Value) -> bool {
    let pending_add = value.get("pendingAction") == Some(&json!(PendingAction::Add))
        || value
            .get("pendingFields")
            .and_then(|fields| fields.get("createChat"))
            == Some(&json!(PendingAction::Add));
    let has_errors = ["errors", "errorFields"]
        .iter()
        .any(|field| value.get(*field).is_some_and(|e| e.as_object().is_some_and(|m| !m.is_empty())));
    pending_add && has_errors
}
