//! Engine context handed to every orchestrator.
//!
//! Session, personal details and policies are held in a [`Cache`] that keeps
//! itself current through store subscriptions. Reports, actions and
//! transactions are always read straight from the store at call time.
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::next_step::NextStep;
use crate::onyx::{Collection, KeyPattern, OnyxKey};
use crate::policy::{Policy, PolicyCategories, PolicyContext, PolicyTagLists};
use crate::report::{InvoiceReceiver, Report};
use crate::report_action::{ActionName, ReportAction};
use crate::store::{KeyValueStore, MemoryStore, SledStore, StoreExt, SubscriptionId};
use crate::transaction::Transaction;
use crate::types::{AccountId, OptimisticClock, PersonalDetails, QuickAction, Session, TransactionRef};
use crate::violations::Violation;

#[derive(Default)]
pub struct Cache {
    session: RwLock<Session>,
    personal_details: RwLock<BTreeMap<AccountId, PersonalDetails>>,
    policies: RwLock<BTreeMap<String, Policy>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl Cache {
    /// Loads the current values and subscribes for every later change.
    pub fn init(store: &Arc<dyn KeyValueStore>) -> anyhow::Result<Arc<Self>> {
        let cache = Arc::new(Cache::default());

        cache.load_session(store.get(&OnyxKey::Session)?.as_ref());
        cache.load_personal_details(store.get(&OnyxKey::PersonalDetailsList)?.as_ref());
        for (key, value) in store.get_collection(Collection::Policy)? {
            cache.load_policy(&key, Some(&value));
        }

        let mut ids = Vec::with_capacity(3);
        let weak = Arc::downgrade(&cache);
        ids.push(store.subscribe(
            KeyPattern::Key(OnyxKey::Session),
            Arc::new(move |_, value| with_cache(&weak, |c| c.load_session(value))),
        ));
        let weak = Arc::downgrade(&cache);
        ids.push(store.subscribe(
            KeyPattern::Key(OnyxKey::PersonalDetailsList),
            Arc::new(move |_, value| with_cache(&weak, |c| c.load_personal_details(value))),
        ));
        let weak = Arc::downgrade(&cache);
        ids.push(store.subscribe(
            KeyPattern::Collection(Collection::Policy),
            Arc::new(move |key, value| with_cache(&weak, |c| c.load_policy(key, value))),
        ));
        *cache.subscriptions.lock() = ids;

        debug!("engine cache initialised");
        Ok(cache)
    }

    pub fn shutdown(&self, store: &dyn KeyValueStore) {
        for id in self.subscriptions.lock().drain(..) {
            store.unsubscribe(id);
        }
    }

    fn load_session(&self, value: Option<&Value>) {
        let session = value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        *self.session.write() = session;
    }

    fn load_personal_details(&self, value: Option<&Value>) {
        let mut details = BTreeMap::new();
        if let Some(Value::Object(entries)) = value {
            for (account_id, entry) in entries {
                match serde_json::from_value::<PersonalDetails>(entry.clone()) {
                    Ok(parsed) => {
                        details.insert(parsed.account_id, parsed);
                    }
                    Err(err) => warn!(%account_id, error = %err, "skipping malformed personal details"),
                }
            }
        }
        *self.personal_details.write() = details;
    }

    fn load_policy(&self, key: &OnyxKey, value: Option<&Value>) {
        let OnyxKey::Policy(policy_id) = key else {
            return;
        };
        let parsed = value.and_then(|v| match serde_json::from_value::<Policy>(v.clone()) {
            Ok(policy) => Some(policy),
            Err(err) => {
                warn!(%policy_id, error = %err, "skipping malformed policy");
                None
            }
        });
        let mut policies = self.policies.write();
        match parsed {
            Some(policy) => policies.insert(policy_id.clone(), policy),
            None => policies.remove(policy_id),
        };
    }

    pub fn session(&self) -> Session {
        self.session.read().clone()
    }

    pub fn personal_details(&self, account_id: AccountId) -> Option<PersonalDetails> {
        self.personal_details.read().get(&account_id).cloned()
    }

    pub fn account_id_for_login(&self, login: &str) -> Option<AccountId> {
        self.personal_details
            .read()
            .values()
            .find(|d| d.login.as_deref() == Some(login))
            .map(|d| d.account_id)
    }

    pub fn policy(&self, policy_id: &str) -> Option<Policy> {
        self.policies.read().get(policy_id).cloned()
    }
}

fn with_cache(weak: &Weak<Cache>, apply: impl FnOnce(&Cache)) {
    if let Some(cache) = weak.upgrade() {
        apply(&cache);
    }
}

pub struct EngineContext {
    pub store: Arc<dyn KeyValueStore>,
    pub cache: Arc<Cache>,
    pub clock: Arc<OptimisticClock>,
    pub config: EngineConfig,
}

impl EngineContext {
    pub fn new(store: Arc<dyn KeyValueStore>, config: EngineConfig) -> anyhow::Result<Self> {
        let cache = Cache::init(&store)?;
        Ok(Self {
            store,
            cache,
            clock: Arc::new(OptimisticClock::new()),
            config,
        })
    }

    /// Opens the sled store at `config.store_path`, or an in-memory store when unset.
    pub fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn KeyValueStore> = match &config.store_path {
            Some(path) => Arc::new(SledStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        Self::new(store, config)
    }

    pub fn with_clock(mut self, clock: OptimisticClock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn current_account_id(&self) -> AccountId {
        self.cache.session().account_id
    }

    pub fn current_email(&self) -> String {
        self.cache.session().email
    }

    pub fn report(&self, report_id: &str) -> anyhow::Result<Option<Report>> {
        if report_id.is_empty() {
            return Ok(None);
        }
        self.store.get_as(&OnyxKey::Report(report_id.to_string()))
    }

    pub fn report_actions(&self, report_id: &str) -> anyhow::Result<BTreeMap<String, ReportAction>> {
        Ok(self
            .store
            .get_as(&OnyxKey::ReportActions(report_id.to_string()))?
            .unwrap_or_default())
    }

    pub fn report_action(&self, report_id: &str, action_id: &str) -> anyhow::Result<Option<ReportAction>> {
        Ok(self.report_actions(report_id)?.remove(action_id))
    }

    pub fn transaction(&self, transaction_id: &str) -> anyhow::Result<Option<Transaction>> {
        self.store.get_as(&OnyxKey::Transaction(transaction_id.to_string()))
    }

    pub fn transaction_draft(&self, reference: &TransactionRef) -> anyhow::Result<Option<Transaction>> {
        self.store.get_as(&OnyxKey::TransactionDraft(reference.clone()))
    }

    pub fn transactions_for_report(&self, report_id: &str) -> anyhow::Result<Vec<Transaction>> {
        Ok(self
            .store
            .collection_as::<Transaction>(Collection::Transaction)?
            .into_iter()
            .filter(|t| t.report_id == report_id)
            .collect())
    }

    pub fn violations(&self, transaction_id: &str) -> anyhow::Result<Vec<Violation>> {
        Ok(self
            .store
            .get_as(&OnyxKey::TransactionViolations(transaction_id.to_string()))?
            .unwrap_or_default())
    }

    pub fn next_step(&self, report_id: &str) -> anyhow::Result<Option<NextStep>> {
        self.store.get_as(&OnyxKey::NextStep(report_id.to_string()))
    }

    pub fn quick_action(&self) -> anyhow::Result<Option<QuickAction>> {
        self.store.get_as(&OnyxKey::QuickAction)
    }

    pub fn last_payment_methods(&self) -> anyhow::Result<Option<Value>> {
        self.store.get(&OnyxKey::LastPaymentMethod)
    }

    pub fn policy(&self, policy_id: Option<&str>) -> Option<Policy> {
        policy_id.and_then(|id| self.cache.policy(id))
    }

    pub fn personal_details(&self, account_id: AccountId) -> Option<PersonalDetails> {
        self.cache.personal_details(account_id)
    }

    pub fn policy_context(&self, policy_id: Option<&str>) -> anyhow::Result<PolicyContext> {
        let Some(id) = policy_id.filter(|id| !id.is_empty()) else {
            return Ok(PolicyContext::default());
        };
        let id = id.to_string();
        Ok(PolicyContext {
            policy: self.cache.policy(&id),
            categories: self
                .store
                .get_as::<PolicyCategories>(&OnyxKey::PolicyCategories(id.clone()))?
                .unwrap_or_default(),
            tag_lists: self
                .store
                .get_as::<PolicyTagLists>(&OnyxKey::PolicyTags(id.clone()))?
                .unwrap_or_default(),
            recently_used_categories: self
                .store
                .get_as(&OnyxKey::PolicyRecentlyUsedCategories(id.clone()))?
                .unwrap_or_default(),
            recently_used_tags: self
                .store
                .get_as(&OnyxKey::PolicyRecentlyUsedTags(id))?
                .unwrap_or_default(),
        })
    }

    /// The 1:1 or group chat whose participants are exactly `account_ids`.
    pub fn find_chat_by_participants(&self, account_ids: &[AccountId]) -> anyhow::Result<Option<Report>> {
        let mut wanted = account_ids.to_vec();
        wanted.sort_unstable();
        wanted.dedup();
        Ok(self
            .store
            .collection_as::<Report>(Collection::Report)?
            .into_iter()
            .find(|report| {
                report.is_chat_report()
                    && (report.chat_type.is_none() || report.is_group_chat())
                    && !report.is_thread()
                    && !report.is_archived()
                    && report.participant_account_ids() == wanted
            }))
    }

    pub fn find_invoice_chat(&self, sender_policy_id: &str, receiver: AccountId) -> anyhow::Result<Option<Report>> {
        Ok(self
            .store
            .collection_as::<Report>(Collection::Report)?
            .into_iter()
            .find(|report| {
                report.is_invoice_room()
                    && !report.is_archived()
                    && report.policy_id.as_deref() == Some(sender_policy_id)
                    && report.invoice_receiver == Some(InvoiceReceiver::Individual { account_id: receiver })
            }))
    }

    /// The REPORTPREVIEW action in `chat_report_id` linking to `iou_report_id`.
    pub fn report_preview_action(&self, chat_report_id: &str, iou_report_id: &str) -> anyhow::Result<Option<ReportAction>> {
        Ok(self
            .report_actions(chat_report_id)?
            .into_values()
            .find(|action| action.linked_report_id().as_deref() == Some(iou_report_id)))
    }

    pub fn track_expense_whisper(&self, chat_report_id: &str, transaction_id: &str) -> anyhow::Result<Option<ReportAction>> {
        Ok(self.report_actions(chat_report_id)?.into_values().find(|action| {
            action.action_name == ActionName::ActionableTrackExpenseWhisper
                && action.whisper_transaction_id().as_deref() == Some(transaction_id)
        }))
    }

    pub fn has_held_expenses(&self, iou_report_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .transactions_for_report(iou_report_id)?
            .iter()
            .any(Transaction::is_on_hold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cache_follows_store_changes() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let ctx = EngineContext::new(store.clone(), EngineConfig::default()).unwrap();
        assert_eq!(ctx.current_account_id(), 0);

        store
            .set(&OnyxKey::Session, Some(json!({"accountID": 7, "email": "a@b.c"})))
            .unwrap();
        store
            .merge(&OnyxKey::PersonalDetailsList, json!({"7": {"accountID": 7, "login": "a@b.c"}}))
            .unwrap();
        store
            .set(&OnyxKey::Policy("P1".into()), Some(json!({"id": "P1", "type": "team"})))
            .unwrap();

        assert_eq!(ctx.current_account_id(), 7);
        assert_eq!(ctx.cache.account_id_for_login("a@b.c"), Some(7));
        assert!(ctx.policy(Some("P1")).is_some());

        store.set(&OnyxKey::Policy("P1".into()), None).unwrap();
        assert!(ctx.policy(Some("P1")).is_none());

        ctx.cache.shutdown(store.as_ref());
        store
            .set(&OnyxKey::Session, Some(json!({"accountID": 8, "email": "x@y.z"})))
            .unwrap();
        assert_eq!(ctx.current_account_id(), 7);
    }
}
