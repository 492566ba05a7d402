use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Barrier, Notify};
use tokio::task::JoinHandle;

use crate::search::domain::{
    AccountId, ActionType, Coordinates, CreditBalance, CreditTransaction, HistoryId,
    SearchHistoryRecord, SearchRequest, SearchResult, SearchType, TransactionId,
};
use crate::search::orchestrator::{OrchestratorConfig, SearchError, SearchOrchestrator};
use crate::search::provider::{PropertyDataProvider, ProviderError, ProviderLookup};
use crate::search::recorder::FixedClock;
use crate::search::store::{HistoryStore, LedgerStore, LedgerTotals, MemoryStore, StoreError};

pub(super) const MAIN_STREET: &str = "123 Main St, Minneapolis, MN 55401";

pub(super) fn account() -> AccountId {
    AccountId("acct-1001".to_string())
}

pub(super) fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 15, 14, 0, 5).unwrap()
}

pub(super) fn request(search_type: SearchType) -> SearchRequest {
    SearchRequest::new(MAIN_STREET, search_type, 44.9778, -93.2650)
}

pub(super) fn request_for(address: &str, search_type: SearchType) -> SearchRequest {
    SearchRequest::new(address, search_type, 44.9778, -93.2650)
}

pub(super) fn property_data() -> Value {
    json!({
        "beds": 3,
        "baths": 2,
        "square_feet": 1640,
        "year_built": 1924,
        "estimated_value": 412000,
    })
}

/// Two lookups meet at the barrier; the leader answers at once, the follower waits
/// until released.
struct Pairing {
    barrier: Barrier,
    follower: Notify,
}

/// Provider returning one canned answer and counting calls.
pub(super) struct ScriptedProvider {
    response: Mutex<Result<ProviderLookup, ProviderError>>,
    calls: AtomicUsize,
    pairing: Option<Pairing>,
}

impl ScriptedProvider {
    pub(super) fn found() -> Self {
        Self::with(Ok(ProviderLookup::found(property_data())))
    }

    pub(super) fn not_found(reason: &str) -> Self {
        Self::with(Ok(ProviderLookup::not_found(reason)))
    }

    pub(super) fn unavailable() -> Self {
        Self::with(Err(ProviderError::Status {
            status: 503,
            detail: "upstream maintenance".to_string(),
        }))
    }

    pub(super) fn with(response: Result<ProviderLookup, ProviderError>) -> Self {
        Self {
            response: Mutex::new(response),
            calls: AtomicUsize::new(0),
            pairing: None,
        }
    }

    /// Holds lookups until two are in flight, then lets only one of them answer.
    pub(super) fn paired(mut self) -> Self {
        self.pairing = Some(Pairing {
            barrier: Barrier::new(2),
            follower: Notify::new(),
        });
        self
    }

    pub(super) fn release_follower(&self) {
        if let Some(pairing) = &self.pairing {
            pairing.follower.notify_one();
        }
    }

    pub(super) fn respond_with(&self, response: Result<ProviderLookup, ProviderError>) {
        *self.response.lock().expect("provider mutex poisoned") = response;
    }

    pub(super) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PropertyDataProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn lookup(
        &self,
        _address: &str,
        _coordinates: Coordinates,
    ) -> Result<ProviderLookup, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(pairing) = &self.pairing {
            if !pairing.barrier.wait().await.is_leader() {
                pairing.follower.notified().await;
            }
        }
        self.response
            .lock()
            .expect("provider mutex poisoned")
            .clone()
    }
}

struct DebitGate {
    reached: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

/// Handles for a debit parked by [`FaultyStore::hold_next_debit`].
pub(super) struct HeldDebit {
    pub(super) reached: oneshot::Receiver<()>,
    pub(super) release: oneshot::Sender<()>,
}

/// Memory store with switches for the failure windows the orchestrator must handle.
#[derive(Default)]
pub(super) struct FaultyStore {
    pub(super) inner: MemoryStore,
    fail_history_insert: AtomicBool,
    fail_history_delete: AtomicBool,
    fail_history_update: AtomicBool,
    fail_history_reads: AtomicBool,
    drain_before_debit: AtomicBool,
    debit_gate: Mutex<Option<DebitGate>>,
}

impl FaultyStore {
    pub(super) fn fail_history_reads(&self) {
        self.fail_history_reads.store(true, Ordering::SeqCst);
    }

    /// Parks the next debit before it touches the balance until `release` fires.
    pub(super) fn hold_next_debit(&self) -> HeldDebit {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.debit_gate.lock().expect("gate mutex poisoned") = Some(DebitGate {
            reached: reached_tx,
            release: release_rx,
        });
        HeldDebit {
            reached: reached_rx,
            release: release_tx,
        }
    }

    pub(super) fn fail_history_insert(&self) {
        self.fail_history_insert.store(true, Ordering::SeqCst);
    }

    pub(super) fn fail_history_delete(&self) {
        self.fail_history_delete.store(true, Ordering::SeqCst);
    }

    pub(super) fn fail_history_update(&self) {
        self.fail_history_update.store(true, Ordering::SeqCst);
    }

    /// Spend the whole balance from "another request" right before the next debit.
    pub(super) fn drain_before_debit(&self) {
        self.drain_before_debit.store(true, Ordering::SeqCst);
    }

    async fn drain(&self, account_id: &AccountId) -> Result<(), StoreError> {
        let available = self
            .inner
            .fetch_balance(account_id)
            .await?
            .map(|balance| balance.available_credits)
            .unwrap_or_default();
        if available == 0 {
            return Ok(());
        }
        let competing = CreditTransaction {
            id: TransactionId::generate(),
            account_id: account_id.clone(),
            action_type: ActionType::SmartSearch,
            credits_consumed: u32::try_from(available).expect("test balance fits u32"),
            credits_added: 0,
            description: "competing request".to_string(),
            reference_id: None,
            transaction_hash: uuid::Uuid::new_v4().to_string(),
            created_at: start(),
        };
        self.inner.apply_debit(competing).await.map(|_| ())
    }

    fn offline() -> StoreError {
        StoreError::Unavailable("database offline".to_string())
    }
}

#[async_trait]
impl LedgerStore for FaultyStore {
    async fn provision_account(&self, balance: CreditBalance) -> Result<CreditBalance, StoreError> {
        self.inner.provision_account(balance).await
    }

    async fn fetch_balance(
        &self,
        account_id: &AccountId,
    ) -> Result<Option<CreditBalance>, StoreError> {
        self.inner.fetch_balance(account_id).await
    }

    async fn apply_debit(&self, entry: CreditTransaction) -> Result<CreditBalance, StoreError> {
        let gate = self.debit_gate.lock().expect("gate mutex poisoned").take();
        if let Some(gate) = gate {
            let _ = gate.reached.send(());
            let _ = gate.release.await;
        }
        if self.drain_before_debit.swap(false, Ordering::SeqCst) {
            self.drain(&entry.account_id).await?;
        }
        self.inner.apply_debit(entry).await
    }

    async fn apply_credit(&self, entry: CreditTransaction) -> Result<CreditBalance, StoreError> {
        self.inner.apply_credit(entry).await
    }

    async fn apply_refund(
        &self,
        entry: CreditTransaction,
        refundable: u64,
    ) -> Result<CreditBalance, StoreError> {
        self.inner.apply_refund(entry, refundable).await
    }

    async fn fetch_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        self.inner.fetch_transaction(id).await
    }

    async fn find_charge(
        &self,
        reference_id: &str,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        self.inner.find_charge(reference_id).await
    }

    async fn list_transactions(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, StoreError> {
        self.inner.list_transactions(account_id, limit).await
    }

    async fn ledger_totals(&self, account_id: &AccountId) -> Result<LedgerTotals, StoreError> {
        self.inner.ledger_totals(account_id).await
    }
}

#[async_trait]
impl HistoryStore for FaultyStore {
    async fn insert_history(
        &self,
        record: SearchHistoryRecord,
    ) -> Result<SearchHistoryRecord, StoreError> {
        if self.fail_history_insert.load(Ordering::SeqCst) {
            return Err(Self::offline());
        }
        self.inner.insert_history(record).await
    }

    async fn find_history_by_hash(
        &self,
        transaction_hash: &str,
    ) -> Result<Option<SearchHistoryRecord>, StoreError> {
        if self.fail_history_reads.load(Ordering::SeqCst) {
            return Err(Self::offline());
        }
        self.inner.find_history_by_hash(transaction_hash).await
    }

    async fn fetch_history(
        &self,
        id: &HistoryId,
    ) -> Result<Option<SearchHistoryRecord>, StoreError> {
        if self.fail_history_reads.load(Ordering::SeqCst) {
            return Err(Self::offline());
        }
        self.inner.fetch_history(id).await
    }

    async fn update_history(
        &self,
        record: SearchHistoryRecord,
        expected: SearchType,
    ) -> Result<(), StoreError> {
        // Only the restore direction (smart -> basic) is made to fail.
        if expected == SearchType::Smart && self.fail_history_update.load(Ordering::SeqCst) {
            return Err(Self::offline());
        }
        self.inner.update_history(record, expected).await
    }

    async fn delete_history(&self, id: &HistoryId) -> Result<(), StoreError> {
        if self.fail_history_delete.load(Ordering::SeqCst) {
            return Err(Self::offline());
        }
        self.inner.delete_history(id).await
    }

    async fn list_history(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<SearchHistoryRecord>, StoreError> {
        if self.fail_history_reads.load(Ordering::SeqCst) {
            return Err(Self::offline());
        }
        self.inner.list_history(account_id, limit).await
    }
}

pub(super) struct Harness {
    pub(super) store: Arc<FaultyStore>,
    pub(super) provider: Arc<ScriptedProvider>,
    pub(super) clock: Arc<FixedClock>,
    pub(super) orchestrator: Arc<SearchOrchestrator<FaultyStore, ScriptedProvider>>,
}

impl Harness {
    pub(super) async fn balance(&self) -> u64 {
        self.orchestrator
            .ledger()
            .get_balance(&account())
            .await
            .expect("balance readable")
            .available_credits
    }

    pub(super) async fn history(&self) -> Vec<SearchHistoryRecord> {
        self.store
            .list_history(&account(), 100)
            .await
            .expect("history readable")
    }

    pub(super) async fn transactions(&self) -> Vec<CreditTransaction> {
        self.store
            .list_transactions(&account(), 100)
            .await
            .expect("transactions readable")
    }

    pub(super) async fn debits(&self) -> Vec<CreditTransaction> {
        self.transactions()
            .await
            .into_iter()
            .filter(|entry| entry.credits_consumed > 0)
            .collect()
    }

    /// Smart search for [`MAIN_STREET`] on its own task.
    pub(super) fn spawn_smart(&self) -> JoinHandle<Result<SearchResult, SearchError>> {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .perform_search(Some(&account()), request(SearchType::Smart))
                .await
        })
    }
}

/// Yields until one of the two tasks has finished; returns `(finished, pending)`.
pub(super) async fn first_finished<T>(
    a: JoinHandle<T>,
    b: JoinHandle<T>,
) -> (JoinHandle<T>, JoinHandle<T>) {
    loop {
        if a.is_finished() {
            return (a, b);
        }
        if b.is_finished() {
            return (b, a);
        }
        tokio::task::yield_now().await;
    }
}

/// Orchestrator over a fresh store whose account holds `credits`.
pub(super) async fn harness(credits: u32, provider: ScriptedProvider) -> Harness {
    let store = Arc::new(FaultyStore::default());
    let provider = Arc::new(provider);
    let clock = Arc::new(FixedClock::new(start()));
    let orchestrator = Arc::new(SearchOrchestrator::new(
        store.clone(),
        provider.clone(),
        OrchestratorConfig {
            provider_timeout: Duration::from_secs(2),
            duplicate_window: Duration::from_secs(60),
            clock: clock.clone(),
        },
    ));
    orchestrator
        .ledger()
        .open_account(&account(), credits)
        .await
        .expect("account provisioned");

    Harness {
        store,
        provider,
        clock,
        orchestrator,
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
