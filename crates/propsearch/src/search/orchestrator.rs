//! End-to-end protocol for one search request.
//!
//! A run either commits nothing or leaves a history record plus, for smart searches, the
//! matching debit. History is written before the debit so the only failure window left
//! ("record exists, charge failed") can be repaired by removing or restoring the record.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::domain::{
    AccountId, CreditBalance, CreditTransaction, HistoryId, SearchHistoryRecord, SearchRequest,
    SearchResult, SearchType,
};
use super::executor::{ExecutorResult, SearchExecutor};
use super::ledger::{CreditLedger, LedgerError, LedgerReceipt};
use super::provider::PropertyDataProvider;
use super::recorder::{Clock, RecordOutcome, RecorderError, SystemClock, TransactionRecorder};
use super::store::SearchStore;

/// Caller-visible failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("no authenticated account for this request")]
    Unauthenticated,
    #[error("invalid search request: {0}")]
    InvalidRequest(String),
    #[error("insufficient credits: {available} available, {required} required")]
    InsufficientCredits { available: u64, required: u32 },
    #[error("property data provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("search failed: {0}")]
    SearchFailed(String),
    #[error("search history could not be written: {0}")]
    HistoryWriteFailed(String),
    #[error("search history unavailable: {0}")]
    HistoryUnavailable(String),
    #[error("credit ledger unavailable: {0}")]
    LedgerUnavailable(String),
    #[error("search {0} not found")]
    HistoryNotFound(HistoryId),
    #[error("search {0} is already a smart search")]
    AlreadyUpgraded(HistoryId),
    #[error("an identical search {0} is still being charged")]
    SearchInProgress(HistoryId),
    #[error("ledger and search history for {account_id} need reconciliation ({history_id}): {detail}")]
    ReconciliationNeeded {
        account_id: AccountId,
        history_id: HistoryId,
        detail: String,
    },
}

impl SearchError {
    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            SearchError::Unauthenticated => "unauthenticated",
            SearchError::InvalidRequest(_) => "invalid_request",
            SearchError::InsufficientCredits { .. } => "insufficient_credits",
            SearchError::ProviderUnavailable(_) => "provider_unavailable",
            SearchError::SearchFailed(_) => "search_failed",
            SearchError::HistoryWriteFailed(_) => "history_write_failed",
            SearchError::HistoryUnavailable(_) => "history_unavailable",
            SearchError::LedgerUnavailable(_) => "ledger_unavailable",
            SearchError::HistoryNotFound(_) => "history_not_found",
            SearchError::AlreadyUpgraded(_) => "already_upgraded",
            SearchError::SearchInProgress(_) => "search_in_progress",
            SearchError::ReconciliationNeeded { .. } => "reconciliation_needed",
        }
    }

    /// Whether the same request may simply be sent again. Retryable failures commit nothing.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SearchError::ProviderUnavailable(_)
                | SearchError::HistoryWriteFailed(_)
                | SearchError::HistoryUnavailable(_)
                | SearchError::LedgerUnavailable(_)
                | SearchError::SearchInProgress(_)
        )
    }
}

/// Tunables for the orchestrator.
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub provider_timeout: Duration,
    pub duplicate_window: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(10),
            duplicate_window: Duration::from_secs(60),
            clock: Arc::new(SystemClock),
        }
    }
}

/// How to undo a history write when the debit that should follow it fails.
enum Compensation {
    Discard,
    Restore(SearchHistoryRecord),
}

/// Sequences ledger, executor, and recorder for each request.
pub struct SearchOrchestrator<S: ?Sized, P: ?Sized> {
    ledger: CreditLedger<S>,
    recorder: TransactionRecorder<S>,
    executor: SearchExecutor<P>,
}

impl<S, P> SearchOrchestrator<S, P>
where
    S: SearchStore + ?Sized + 'static,
    P: PropertyDataProvider + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, provider: Arc<P>, config: OrchestratorConfig) -> Self {
        let OrchestratorConfig {
            provider_timeout,
            duplicate_window,
            clock,
        } = config;

        Self {
            ledger: CreditLedger::new(store.clone(), clock.clone()),
            recorder: TransactionRecorder::new(store, clock, duplicate_window),
            executor: SearchExecutor::new(provider, provider_timeout),
        }
    }

    pub fn ledger(&self) -> &CreditLedger<S> {
        &self.ledger
    }

    pub fn recorder(&self) -> &TransactionRecorder<S> {
        &self.recorder
    }

    /// Run one search request to a consistent end state.
    pub async fn perform_search(
        &self,
        caller: Option<&AccountId>,
        request: SearchRequest,
    ) -> Result<SearchResult, SearchError> {
        let (account_id, balance) = self.resolve_account(caller).await?;
        validate(&request)?;

        let fingerprint = self.recorder.fingerprint(&account_id, &request);
        if let Some(existing) = self
            .recorder
            .find_duplicate(&fingerprint)
            .await
            .map_err(|err| SearchError::HistoryUnavailable(err.to_string()))?
        {
            let result = self.replay(&account_id, existing).await?;
            info!(account = %account_id, history_id = %result.history_id, "duplicate search submission replayed");
            return Ok(result);
        }

        match request.search_type {
            SearchType::Basic => {}
            SearchType::Smart => self.ensure_funds(&account_id, &balance)?,
        }

        let coordinates = request.coordinates();
        let outcome = self
            .executor
            .execute(request.search_type, &request.address, coordinates)
            .await;
        let payload = self.accept_outcome(&account_id, request.search_type, outcome)?;

        let record = match self
            .recorder
            .record_history(&account_id, &request, payload)
            .await
        {
            Ok(RecordOutcome::Created(record)) => record,
            Ok(RecordOutcome::Duplicate(existing)) => {
                let result = self.replay(&account_id, existing).await?;
                info!(account = %account_id, history_id = %result.history_id, "concurrent duplicate search replayed");
                return Ok(result);
            }
            Err(err) => {
                warn!(account = %account_id, search_type = %request.search_type, error = %err, "search aborted before charge");
                return Err(SearchError::HistoryWriteFailed(err.to_string()));
            }
        };

        match record.search_type {
            SearchType::Basic => {
                info!(account = %account_id, search_type = "basic", history_id = %record.id, "search recorded");
                Ok(completed(record, None))
            }
            SearchType::Smart => {
                let receipt = self
                    .charge(&account_id, &record, Compensation::Discard)
                    .await?;
                info!(
                    account = %account_id,
                    search_type = "smart",
                    history_id = %record.id,
                    remaining = receipt.balance.available_credits,
                    "search recorded and charged"
                );
                Ok(completed(record, Some(receipt.balance.available_credits)))
            }
        }
    }

    /// Re-run a recorded basic search as a smart search, upgrading the record in place.
    pub async fn upgrade_search(
        &self,
        caller: Option<&AccountId>,
        history_id: &HistoryId,
    ) -> Result<SearchResult, SearchError> {
        let (account_id, balance) = self.resolve_account(caller).await?;

        let record = self
            .recorder
            .fetch(history_id)
            .await
            .map_err(|err| SearchError::HistoryUnavailable(err.to_string()))?
            .filter(|record| record.account_id == account_id)
            .ok_or_else(|| SearchError::HistoryNotFound(history_id.clone()))?;

        match record.search_type {
            SearchType::Smart => return Err(SearchError::AlreadyUpgraded(record.id)),
            SearchType::Basic => {}
        }

        self.ensure_funds(&account_id, &balance)?;

        let outcome = self.executor.smart(&record.address, record.coordinates).await;
        let payload = self.accept_outcome(&account_id, SearchType::Smart, outcome)?;

        let upgraded = self
            .recorder
            .upgrade_history(&record, payload)
            .await
            .map_err(|err| match err {
                RecorderError::NotFound(id) => SearchError::HistoryNotFound(id),
                RecorderError::Conflict(id) => SearchError::AlreadyUpgraded(id),
                other => SearchError::HistoryWriteFailed(other.to_string()),
            })?;

        let receipt = self
            .charge(&account_id, &upgraded, Compensation::Restore(record))
            .await?;
        info!(
            account = %account_id,
            history_id = %upgraded.id,
            remaining = receipt.balance.available_credits,
            "search upgraded to smart and charged"
        );
        Ok(completed(upgraded, Some(receipt.balance.available_credits)))
    }

    pub async fn balance(&self, caller: Option<&AccountId>) -> Result<CreditBalance, SearchError> {
        let (_, balance) = self.resolve_account(caller).await?;
        Ok(balance)
    }

    pub async fn history(
        &self,
        caller: Option<&AccountId>,
        limit: usize,
    ) -> Result<Vec<SearchHistoryRecord>, SearchError> {
        let (account_id, _) = self.resolve_account(caller).await?;
        self.recorder
            .history(&account_id, limit)
            .await
            .map_err(|err| SearchError::HistoryUnavailable(err.to_string()))
    }

    pub async fn transactions(
        &self,
        caller: Option<&AccountId>,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, SearchError> {
        let (account_id, _) = self.resolve_account(caller).await?;
        self.ledger
            .transactions(&account_id, limit)
            .await
            .map_err(|err| SearchError::LedgerUnavailable(err.to_string()))
    }

    async fn resolve_account(
        &self,
        caller: Option<&AccountId>,
    ) -> Result<(AccountId, CreditBalance), SearchError> {
        let account_id = caller
            .filter(|id| !id.0.trim().is_empty())
            .ok_or(SearchError::Unauthenticated)?;

        match self.ledger.get_balance(account_id).await {
            Ok(balance) => Ok((account_id.clone(), balance)),
            Err(LedgerError::AccountNotFound(_)) => {
                warn!(account = %account_id, "search requested for unknown account");
                Err(SearchError::Unauthenticated)
            }
            Err(err) => Err(SearchError::LedgerUnavailable(err.to_string())),
        }
    }

    /// Answers a duplicate from the stored record once that record is settled. A smart
    /// record is settled only when the debit that pays for it has committed; until then
    /// its run may still be compensated away.
    async fn replay(
        &self,
        account_id: &AccountId,
        existing: SearchHistoryRecord,
    ) -> Result<SearchResult, SearchError> {
        match existing.search_type {
            SearchType::Basic => Ok(replayed(existing)),
            SearchType::Smart => {
                let charge = self
                    .ledger
                    .charge_for(&existing.id)
                    .await
                    .map_err(|err| SearchError::LedgerUnavailable(err.to_string()))?;
                match charge {
                    Some(_) => Ok(replayed(existing)),
                    None => {
                        info!(account = %account_id, history_id = %existing.id, "duplicate of a search still being charged");
                        Err(SearchError::SearchInProgress(existing.id))
                    }
                }
            }
        }
    }

    /// Optimistic pre-check; the debit itself is the real guard.
    fn ensure_funds(
        &self,
        account_id: &AccountId,
        balance: &CreditBalance,
    ) -> Result<(), SearchError> {
        let required = SearchType::Smart.cost();
        if balance.available_credits < u64::from(required) {
            warn!(account = %account_id, available = balance.available_credits, "smart search refused before lookup");
            return Err(SearchError::InsufficientCredits {
                available: balance.available_credits,
                required,
            });
        }
        Ok(())
    }

    fn accept_outcome(
        &self,
        account_id: &AccountId,
        search_type: SearchType,
        outcome: ExecutorResult,
    ) -> Result<serde_json::Value, SearchError> {
        match outcome {
            ExecutorResult::ProviderSuccess { payload } => Ok(payload),
            ExecutorResult::ProviderReportedFailure { reason } => {
                info!(account = %account_id, search_type = %search_type, reason = %reason, "provider found nothing");
                Err(SearchError::SearchFailed(reason))
            }
            ExecutorResult::ProviderUnavailable { reason } => {
                warn!(account = %account_id, search_type = %search_type, reason = %reason, "provider unavailable");
                Err(SearchError::ProviderUnavailable(reason))
            }
        }
    }

    async fn charge(
        &self,
        account_id: &AccountId,
        record: &SearchHistoryRecord,
        compensation: Compensation,
    ) -> Result<LedgerReceipt, SearchError> {
        let description = format!("Smart search: {}", record.address);
        let failure = match self
            .ledger
            .reserve_and_consume(
                account_id,
                SearchType::Smart.cost(),
                Some(&record.id),
                &description,
            )
            .await
        {
            Ok(receipt) => return Ok(receipt),
            Err(LedgerError::InsufficientCredits {
                available,
                required,
                ..
            }) => SearchError::InsufficientCredits {
                available,
                required,
            },
            Err(err) => SearchError::LedgerUnavailable(err.to_string()),
        };

        warn!(account = %account_id, history_id = %record.id, error = %failure, "charge failed after history write; compensating");

        let undone = match compensation {
            Compensation::Discard => self.recorder.discard_history(&record.id).await,
            Compensation::Restore(previous) => self.recorder.restore_history(previous).await,
        };

        match undone {
            Ok(()) => Err(failure),
            Err(err) => {
                error!(
                    account = %account_id,
                    history_id = %record.id,
                    charge_error = %failure,
                    compensation_error = %err,
                    "search history left without matching charge"
                );
                Err(SearchError::ReconciliationNeeded {
                    account_id: account_id.clone(),
                    history_id: record.id.clone(),
                    detail: format!("{failure}; compensation failed: {err}"),
                })
            }
        }
    }
}

fn validate(request: &SearchRequest) -> Result<(), SearchError> {
    if request.address.trim().is_empty() {
        return Err(SearchError::InvalidRequest(
            "address must not be empty".to_string(),
        ));
    }
    if !request.coordinates().is_valid() {
        return Err(SearchError::InvalidRequest(format!(
            "coordinates ({}, {}) are out of range",
            request.latitude, request.longitude
        )));
    }
    Ok(())
}

fn completed(record: SearchHistoryRecord, remaining_credits: Option<u64>) -> SearchResult {
    SearchResult {
        success: true,
        search_type: record.search_type,
        credits_used: record.credits_used,
        history_id: record.id,
        data: record.result_payload,
        replayed: false,
        remaining_credits,
    }
}

fn replayed(record: SearchHistoryRecord) -> SearchResult {
    SearchResult {
        success: true,
        search_type: record.search_type,
        credits_used: 0,
        history_id: record.id,
        data: record.result_payload,
        replayed: true,
        remaining_credits: None,
    }
}
