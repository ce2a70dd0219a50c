//! Network and navigation collaborators.
//!
//! A [`WriteRequest`] carries the wire parameters of one command together with
//! its success and failure patches. The network side owns applying those
//! patches once the server answers.
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::onyx::OnyxData;
use crate::store::KeyValueStore;
use crate::utils::idempotency_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteCommand {
    RequestMoney,
    TrackExpense,
    CategorizeTrackedExpense,
    ShareTrackedExpense,
    ConvertTrackedExpenseToRequest,
    SplitBill,
    SendInvoice,
    ApproveMoneyRequest,
    UnapproveExpenseReport,
    SubmitReport,
    PayMoneyRequest,
    PayMoneyRequestWithWallet,
    PayInvoice,
    CancelPayment,
    DeleteMoneyRequest,
    DeleteTrackedExpense,
    UpdateMoneyRequest,
    UpdateMoneyRequestAmountAndCurrency,
    UpdateMoneyRequestDate,
    UpdateMoneyRequestMerchant,
    UpdateMoneyRequestDescription,
    UpdateMoneyRequestCategory,
    UpdateMoneyRequestTag,
    UpdateMoneyRequestBillable,
    UpdateMoneyRequestDistance,
    UpdateMoneyRequestTaxAmount,
    UpdateMoneyRequestTaxRate,
    HoldRequest,
    UnholdRequest,
    ReplaceReceipt,
    DetachReceipt,
}

impl WriteCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestMoney => "RequestMoney",
            Self::TrackExpense => "TrackExpense",
            Self::CategorizeTrackedExpense => "CategorizeTrackedExpense",
            Self::ShareTrackedExpense => "ShareTrackedExpense",
            Self::ConvertTrackedExpenseToRequest => "ConvertTrackedExpenseToRequest",
            Self::SplitBill => "SplitBill",
            Self::SendInvoice => "SendInvoice",
            Self::ApproveMoneyRequest => "ApproveMoneyRequest",
            Self::UnapproveExpenseReport => "UnapproveExpenseReport",
            Self::SubmitReport => "SubmitReport",
            Self::PayMoneyRequest => "PayMoneyRequest",
            Self::PayMoneyRequestWithWallet => "PayMoneyRequestWithWallet",
            Self::PayInvoice => "PayInvoice",
            Self::CancelPayment => "CancelPayment",
            Self::DeleteMoneyRequest => "DeleteMoneyRequest",
            Self::DeleteTrackedExpense => "DeleteTrackedExpense",
            Self::UpdateMoneyRequest => "UpdateMoneyRequest",
            Self::UpdateMoneyRequestAmountAndCurrency => "UpdateMoneyRequestAmountAndCurrency",
            Self::UpdateMoneyRequestDate => "UpdateMoneyRequestDate",
            Self::UpdateMoneyRequestMerchant => "UpdateMoneyRequestMerchant",
            Self::UpdateMoneyRequestDescription => "UpdateMoneyRequestDescription",
            Self::UpdateMoneyRequestCategory => "UpdateMoneyRequestCategory",
            Self::UpdateMoneyRequestTag => "UpdateMoneyRequestTag",
            Self::UpdateMoneyRequestBillable => "UpdateMoneyRequestBillable",
            Self::UpdateMoneyRequestDistance => "UpdateMoneyRequestDistance",
            Self::UpdateMoneyRequestTaxAmount => "UpdateMoneyRequestTaxAmount",
            Self::UpdateMoneyRequestTaxRate => "UpdateMoneyRequestTaxRate",
            Self::HoldRequest => "HoldRequest",
            Self::UnholdRequest => "UnHoldRequest",
            Self::ReplaceReceipt => "ReplaceReceipt",
            Self::DetachReceipt => "DetachReceipt",
        }
    }
}

impl std::fmt::Display for WriteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub command: WriteCommand,
    pub params: Value,
    pub onyx_data: OnyxData,
    /// Same for every retry of the same write, see [`idempotency_key`].
    pub idempotency_key: String,
}

impl WriteRequest {
    pub fn new(command: WriteCommand, params: Value, onyx_data: OnyxData) -> Self {
        let idempotency_key = idempotency_key(command.as_str(), &params);
        Self {
            command,
            params,
            onyx_data,
            idempotency_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

pub trait Network: Send + Sync {
    /// Sends a write. Returns as soon as the request is accepted.
    fn write(&self, request: WriteRequest) -> anyhow::Result<()>;
}

/// In-process network: writes wait in a queue until [`QueuedNetwork::respond`]
/// plays the server's answer back into the store.
pub struct QueuedNetwork {
    store: Arc<dyn KeyValueStore>,
    queue: Mutex<VecDeque<WriteRequest>>,
}

impl QueuedNetwork {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Commands still waiting for an answer, oldest first.
    pub fn pending_commands(&self) -> Vec<WriteCommand> {
        self.queue.lock().iter().map(|r| r.command).collect()
    }

    /// Answers the oldest write and applies its success or failure patches.
    pub fn respond(&self, outcome: Outcome) -> anyhow::Result<Option<WriteRequest>> {
        let Some(request) = self.queue.lock().pop_front() else {
            return Ok(None);
        };
        let updates = match outcome {
            Outcome::Success => &request.onyx_data.success_data,
            Outcome::Failure => &request.onyx_data.failure_data,
        };
        self.store.apply(updates)?;
        info!(command = %request.command, ?outcome, "write answered");
        Ok(Some(request))
    }

    /// Answers every queued write with the same outcome.
    pub fn respond_all(&self, outcome: Outcome) -> anyhow::Result<usize> {
        let mut answered = 0;
        while self.respond(outcome)?.is_some() {
            answered += 1;
        }
        Ok(answered)
    }
}

impl Network for QueuedNetwork {
    fn write(&self, request: WriteRequest) -> anyhow::Result<()> {
        let mut queue = self.queue.lock();
        if queue.iter().any(|queued| queued.idempotency_key == request.idempotency_key) {
            debug!(command = %request.command, "dropping a duplicate write");
            return Ok(());
        }
        debug!(command = %request.command, "queued write");
        queue.push_back(request);
        Ok(())
    }
}

/// Where the user ends up after an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    /// Close the money request flow and show the given report, if any.
    DismissModal { report_id: Option<String> },
    GoToReport(String),
}

pub trait Navigator: Send + Sync {
    fn navigate(&self, target: Navigation);
}

pub struct NoopNavigator;

impl Navigator for NoopNavigator {
    fn navigate(&self, _target: Navigation) {}
}

/// Keeps every navigation, for tests and headless callers.
#[derive(Default)]
pub struct RecordingNavigator {
    events: Mutex<Vec<Navigation>>,
}

impl RecordingNavigator {
    pub fn events(&self) -> Vec<Navigation> {
        self.events.lock().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, target: Navigation) {
        self.events.lock().push(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onyx::{OnyxKey, OnyxUpdate};
    use crate::store::{MemoryStore, StoreExt};
    use serde_json::json;

    fn request(report_id: &str) -> WriteRequest {
        let key = OnyxKey::Report(report_id.to_string());
        let mut data = OnyxData::new();
        data.optimistic_data
            .push(OnyxUpdate::merge(key.clone(), json!({"pendingAction": "add"})));
        data.success_data
            .push(OnyxUpdate::merge(key.clone(), json!({"pendingAction": null})));
        data.failure_data
            .push(OnyxUpdate::merge(key, json!({"errors": {"1": "failed"}})));
        WriteRequest::new(WriteCommand::SubmitReport, json!({"reportID": report_id}), data)
    }

    #[test]
    fn duplicate_writes_are_dropped() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let network = QueuedNetwork::new(store);
        network.write(request("1")).unwrap();
        network.write(request("1")).unwrap();
        network.write(request("2")).unwrap();
        assert_eq!(network.len(), 2);
    }

    #[test]
    fn responses_apply_the_matching_patches() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let network = QueuedNetwork::new(store.clone());
        let first = request("1");
        store.apply(&first.onyx_data.optimistic_data).unwrap();
        network.write(first).unwrap();
        network.write(request("2")).unwrap();

        network.respond(Outcome::Success).unwrap();
        network.respond(Outcome::Failure).unwrap();
        assert!(network.is_empty());

        let confirmed: Value = store.get_as(&OnyxKey::Report("1".into())).unwrap().unwrap();
        assert!(confirmed.get("pendingAction").is_none());
        let failed: Value = store.get_as(&OnyxKey::Report("2".into())).unwrap().unwrap();
        assert_eq!(failed["errors"]["1"], "failed");
    }
}
