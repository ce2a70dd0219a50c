//! Identifiers, lifecycle markers and time primitives shared by every entity
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::utils;

pub type AccountId = i64;

/// Reserved storage id of the single in-composition transaction draft.
pub const DRAFT_TRANSACTION_ID: &str = "1";

/// Report id used by transactions that are tracked outside of any report.
pub const UNREPORTED_REPORT_ID: &str = "0";

/// Merchant placeholder used until the user picks one.
pub const PARTIAL_TRANSACTION_MERCHANT: &str = "(none)";

/// Identity of a transaction in the store. A draft is the scratch entity the
/// user edits while composing; it only becomes addressable by a real id once
/// promoted at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransactionRef {
    Draft,
    Persisted(String),
}

impl TransactionRef {
    pub fn id(&self) -> &str {
        match self {
            TransactionRef::Draft => DRAFT_TRANSACTION_ID,
            TransactionRef::Persisted(id) => id,
        }
    }

    pub fn is_draft(&self) -> bool {
        matches!(self, TransactionRef::Draft)
    }

    /// Draft -> persisted transition. Persisted refs are returned unchanged.
    pub fn promote(&self) -> TransactionRef {
        match self {
            TransactionRef::Draft => TransactionRef::Persisted(utils::generate_id()),
            persisted => persisted.clone(),
        }
    }

    pub fn from_id(id: &str) -> Self {
        if id == DRAFT_TRANSACTION_ID {
            TransactionRef::Draft
        } else {
            TransactionRef::Persisted(id.to_string())
        }
    }
}

/// Optimistic lifecycle marker carried by entities and by individual fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingAction {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StateNum {
    Open = 0,
    Submitted = 1,
    Approved = 2,
    Billing = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StatusNum {
    Open = 0,
    Submitted = 1,
    Closed = 2,
    Approved = 3,
    Reimbursed = 4,
}

impl From<StateNum> for u8 {
    fn from(value: StateNum) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for StateNum {
    type Error = String;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StateNum::Open),
            1 => Ok(StateNum::Submitted),
            2 => Ok(StateNum::Approved),
            3 => Ok(StateNum::Billing),
            other => Err(format!("unknown stateNum {other}")),
        }
    }
}

impl From<StatusNum> for u8 {
    fn from(value: StatusNum) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for StatusNum {
    type Error = String;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StatusNum::Open),
            1 => Ok(StatusNum::Submitted),
            2 => Ok(StatusNum::Closed),
            3 => Ok(StatusNum::Approved),
            4 => Ok(StatusNum::Reimbursed),
            other => Err(format!("unknown statusNum {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IouRequestType {
    #[default]
    Manual,
    Scan,
    Distance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethodType {
    #[serde(rename = "Expensify")]
    Expensify,
    #[serde(rename = "Elsewhere")]
    Elsewhere,
    #[serde(rename = "ACH")]
    Vbba,
}

impl PaymentMethodType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expensify => "Expensify",
            Self::Elsewhere => "Elsewhere",
            Self::Vbba => "ACH",
        }
    }
}

/// A person or workspace selected for a request. Never stored on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(rename = "accountID", skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(rename = "policyID", skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(rename = "reportID", skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_policy_expense_chat: bool,
    #[serde(default)]
    pub is_invoice_room: bool,
    #[serde(default)]
    pub is_sender: bool,
    #[serde(default)]
    pub selected: bool,
}

impl Participant {
    pub fn person(account_id: AccountId, login: &str) -> Self {
        Self {
            account_id: Some(account_id),
            login: Some(login.to_string()),
            selected: true,
            ..Default::default()
        }
    }

    pub fn workspace_chat(policy_id: &str, report_id: &str) -> Self {
        Self {
            policy_id: Some(policy_id.to_string()),
            report_id: Some(report_id.to_string()),
            is_policy_expense_chat: true,
            selected: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(rename = "accountID", default)]
    pub account_id: AccountId,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalDetails {
    #[serde(rename = "accountID")]
    pub account_id: AccountId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_currency_code: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_optimistic_personal_detail: bool,
}

/// Last create flow the user ran, offered as a one-tap shortcut.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickAction {
    pub action: QuickActionName,
    #[serde(rename = "chatReportID")]
    pub chat_report_id: String,
    #[serde(rename = "targetAccountID", skip_serializing_if = "Option::is_none")]
    pub target_account_id: Option<AccountId>,
    #[serde(default)]
    pub is_first_quick_action: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuickActionName {
    RequestManual,
    RequestScan,
    RequestDistance,
    SplitManual,
    SplitScan,
    SplitDistance,
    TrackManual,
    TrackScan,
    TrackDistance,
    SendMoney,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(TimeStamp)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// `2024-05-01 10:20:30.123`, the sortable format used for `created` fields.
    pub fn to_db_string(&self) -> String {
        self.0.format(utils::DB_TIME_FORMAT).to_string()
    }
    /// `2024-05-01`, the format used for a transaction's `created` date.
    pub fn to_date_string(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Monotonic source for optimistic `created` timestamps and error keys.
///
/// Two calls never return the same value and later calls always sort after
/// earlier ones, even when the wall clock stalls or steps backwards. Builders
/// rely on this to order a report's CREATED action before its first IOU action.
#[derive(Debug, Default)]
pub struct OptimisticClock {
    last_millis: AtomicI64,
    last_micros: AtomicI64,
}

impl OptimisticClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock whose first tick is no earlier than `millis`. Used to replay fixtures.
    pub fn starting_at(millis: i64) -> Self {
        Self {
            last_millis: AtomicI64::new(millis - 1),
            last_micros: AtomicI64::new(millis * 1000 - 1),
        }
    }

    fn tick(counter: &AtomicI64, now: i64) -> i64 {
        let previous = match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        }) {
            Ok(prev) | Err(prev) => prev,
        };
        now.max(previous + 1)
    }

    pub fn now(&self) -> TimeStamp<Utc> {
        let millis = Self::tick(&self.last_millis, Utc::now().timestamp_millis());
        TimeStamp::from_millis(millis).unwrap_or_default()
    }

    pub fn db_time(&self) -> String {
        self.now().to_db_string()
    }

    /// Microsecond key for `errors`/`errorFields` maps. Strictly increasing.
    pub fn error_key(&self) -> String {
        Self::tick(&self.last_micros, Utc::now().timestamp_micros()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn clock_is_strictly_monotonic() {
        let clock = OptimisticClock::starting_at(Utc::now().timestamp_millis() + 60_000);
        let first = clock.db_time();
        let second = clock.db_time();
        let third = clock.db_time();
        assert!(first < second && second < third);

        let a: i64 = clock.error_key().parse().unwrap();
        let b: i64 = clock.error_key().parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn draft_promotion_yields_persisted_id() {
        let promoted = TransactionRef::Draft.promote();
        assert!(!promoted.is_draft());
        assert_ne!(promoted.id(), DRAFT_TRANSACTION_ID);
        assert_eq!(promoted.promote(), promoted);
    }

    #[test]
    fn status_numbers_serialize_as_integers() {
        let json = serde_json::to_value(StatusNum::Reimbursed).unwrap();
        assert_eq!(json, serde_json::json!(4));
        let state: StateNum = serde_json::from_value(serde_json::json!(2)).unwrap();
        assert_eq!(state, StateNum::Approved);
    }
}
