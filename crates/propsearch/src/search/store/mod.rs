//! Persistence contract for the credit ledger and search history.
//!
//! Every balance mutation is a single conditional write at the store level: the guard
//! and the decrement commit together with the ledger entry, or nothing commits.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use super::domain::{
    AccountId, CreditBalance, CreditTransaction, HistoryId, SearchHistoryRecord, SearchType,
    TransactionId,
};

/// Error enumeration for store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    Conflict,
    #[error("insufficient credits: {available} available")]
    InsufficientCredits { available: u64 },
    #[error("refund exceeds remaining refundable credits ({remaining})")]
    RefundLimitExceeded { remaining: u64 },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

/// Sums recomputed from the transaction log for audits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerTotals {
    pub consumed: u64,
    pub added: u64,
    pub entries: u64,
}

/// Balance and ledger-entry storage.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Creates the balance row. Fails with `Conflict` when the account already exists.
    async fn provision_account(&self, balance: CreditBalance) -> Result<CreditBalance, StoreError>;

    async fn fetch_balance(&self, account_id: &AccountId)
        -> Result<Option<CreditBalance>, StoreError>;

    /// Decrements `available_credits` by `entry.credits_consumed` only if the balance
    /// covers it, appending `entry` in the same commit.
    async fn apply_debit(&self, entry: CreditTransaction) -> Result<CreditBalance, StoreError>;

    /// Increments the balance by `entry.credits_added`, appending `entry` in the same commit.
    async fn apply_credit(&self, entry: CreditTransaction) -> Result<CreditBalance, StoreError>;

    /// Like [`LedgerStore::apply_credit`], but also guards that refunds referencing
    /// `entry.reference_id` never exceed `refundable` in total.
    async fn apply_refund(
        &self,
        entry: CreditTransaction,
        refundable: u64,
    ) -> Result<CreditBalance, StoreError>;

    async fn fetch_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Option<CreditTransaction>, StoreError>;

    /// The smart search consumption whose `reference_id` is `reference_id`, if committed.
    async fn find_charge(&self, reference_id: &str)
        -> Result<Option<CreditTransaction>, StoreError>;

    /// Newest first.
    async fn list_transactions(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, StoreError>;

    async fn ledger_totals(&self, account_id: &AccountId) -> Result<LedgerTotals, StoreError>;
}

/// Search history storage.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Fails with `Conflict` when a record with the same transaction hash exists.
    async fn insert_history(
        &self,
        record: SearchHistoryRecord,
    ) -> Result<SearchHistoryRecord, StoreError>;

    async fn find_history_by_hash(
        &self,
        transaction_hash: &str,
    ) -> Result<Option<SearchHistoryRecord>, StoreError>;

    async fn fetch_history(&self, id: &HistoryId)
        -> Result<Option<SearchHistoryRecord>, StoreError>;

    /// Replaces the record only while its stored tier still equals `expected`;
    /// otherwise fails with `Conflict`. The transaction hash stays unique.
    async fn update_history(
        &self,
        record: SearchHistoryRecord,
        expected: SearchType,
    ) -> Result<(), StoreError>;

    async fn delete_history(&self, id: &HistoryId) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_history(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<SearchHistoryRecord>, StoreError>;
}

/// Single seam used by the orchestrator: one store backing both ledger and history.
pub trait SearchStore: LedgerStore + HistoryStore {}

impl<T: LedgerStore + HistoryStore> SearchStore for T {}
