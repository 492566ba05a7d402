use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{HistoryStore, LedgerStore, LedgerTotals, StoreError};
use crate::search::domain::{
    AccountId, ActionType, CreditBalance, CreditTransaction, HistoryId, SearchHistoryRecord,
    SearchType, TransactionId,
};

#[derive(Debug, Default)]
struct MemoryState {
    balances: HashMap<AccountId, CreditBalance>,
    transactions: Vec<CreditTransaction>,
    history: Vec<SearchHistoryRecord>,
}

impl MemoryState {
    fn balance_mut(&mut self, account_id: &AccountId) -> Result<&mut CreditBalance, StoreError> {
        self.balances.get_mut(account_id).ok_or(StoreError::NotFound)
    }

    fn history_position(&self, id: &HistoryId) -> Option<usize> {
        self.history.iter().position(|record| &record.id == id)
    }

    fn refunded(&self, reference_id: &str) -> u64 {
        self.transactions
            .iter()
            .filter(|entry| entry.action_type == ActionType::Refund)
            .filter(|entry| entry.reference_id.as_deref() == Some(reference_id))
            .map(|entry| u64::from(entry.credits_added))
            .sum()
    }

    fn credit(&mut self, entry: CreditTransaction) -> Result<CreditBalance, StoreError> {
        let amount = u64::from(entry.credits_added);
        let balance = self.balance_mut(&entry.account_id)?;
        balance.available_credits += amount;
        balance.total_earned += amount;
        balance.last_updated = entry.created_at;
        let snapshot = balance.clone();
        self.transactions.push(entry);
        Ok(snapshot)
    }
}

/// Process-local store. Each conditional write runs under a single lock acquisition,
/// which gives the same all-or-nothing behavior as the SQL store's transactions.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn provision_account(&self, balance: CreditBalance) -> Result<CreditBalance, StoreError> {
        let mut state = self.lock()?;
        if state.balances.contains_key(&balance.account_id) {
            return Err(StoreError::Conflict);
        }
        state
            .balances
            .insert(balance.account_id.clone(), balance.clone());
        Ok(balance)
    }

    async fn fetch_balance(
        &self,
        account_id: &AccountId,
    ) -> Result<Option<CreditBalance>, StoreError> {
        Ok(self.lock()?.balances.get(account_id).cloned())
    }

    async fn apply_debit(&self, entry: CreditTransaction) -> Result<CreditBalance, StoreError> {
        let mut state = self.lock()?;
        let amount = u64::from(entry.credits_consumed);
        let balance = state.balance_mut(&entry.account_id)?;
        if balance.available_credits < amount {
            return Err(StoreError::InsufficientCredits {
                available: balance.available_credits,
            });
        }
        balance.available_credits -= amount;
        balance.total_spent += amount;
        balance.last_updated = entry.created_at;
        let snapshot = balance.clone();
        state.transactions.push(entry);
        Ok(snapshot)
    }

    async fn apply_credit(&self, entry: CreditTransaction) -> Result<CreditBalance, StoreError> {
        self.lock()?.credit(entry)
    }

    async fn apply_refund(
        &self,
        entry: CreditTransaction,
        refundable: u64,
    ) -> Result<CreditBalance, StoreError> {
        let mut state = self.lock()?;
        let reference = entry.reference_id.clone().unwrap_or_default();
        let remaining = refundable.saturating_sub(state.refunded(&reference));
        if u64::from(entry.credits_added) > remaining {
            return Err(StoreError::RefundLimitExceeded { remaining });
        }
        state.credit(entry)
    }

    async fn fetch_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .transactions
            .iter()
            .find(|entry| &entry.id == id)
            .cloned())
    }

    async fn find_charge(
        &self,
        reference_id: &str,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .transactions
            .iter()
            .filter(|entry| entry.action_type == ActionType::SmartSearch)
            .find(|entry| entry.reference_id.as_deref() == Some(reference_id))
            .cloned())
    }

    async fn list_transactions(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|entry| &entry.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ledger_totals(&self, account_id: &AccountId) -> Result<LedgerTotals, StoreError> {
        let state = self.lock()?;
        Ok(state
            .transactions
            .iter()
            .filter(|entry| &entry.account_id == account_id)
            .fold(LedgerTotals::default(), |mut totals, entry| {
                totals.consumed += u64::from(entry.credits_consumed);
                totals.added += u64::from(entry.credits_added);
                totals.entries += 1;
                totals
            }))
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn insert_history(
        &self,
        record: SearchHistoryRecord,
    ) -> Result<SearchHistoryRecord, StoreError> {
        let mut state = self.lock()?;
        let duplicate = state.history.iter().any(|existing| {
            existing.id == record.id || existing.transaction_hash == record.transaction_hash
        });
        if duplicate {
            return Err(StoreError::Conflict);
        }
        state.history.push(record.clone());
        Ok(record)
    }

    async fn find_history_by_hash(
        &self,
        transaction_hash: &str,
    ) -> Result<Option<SearchHistoryRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .history
            .iter()
            .find(|record| record.transaction_hash == transaction_hash)
            .cloned())
    }

    async fn fetch_history(
        &self,
        id: &HistoryId,
    ) -> Result<Option<SearchHistoryRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state.history_position(id).map(|index| state.history[index].clone()))
    }

    async fn update_history(
        &self,
        record: SearchHistoryRecord,
        expected: SearchType,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let index = state.history_position(&record.id).ok_or(StoreError::NotFound)?;
        if state.history[index].search_type != expected {
            return Err(StoreError::Conflict);
        }
        let hash_taken = state.history.iter().any(|existing| {
            existing.id != record.id && existing.transaction_hash == record.transaction_hash
        });
        if hash_taken {
            return Err(StoreError::Conflict);
        }
        state.history[index] = record;
        Ok(())
    }

    async fn delete_history(&self, id: &HistoryId) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let index = state.history_position(id).ok_or(StoreError::NotFound)?;
        state.history.remove(index);
        Ok(())
    }

    async fn list_history(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<SearchHistoryRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .history
            .iter()
            .rev()
            .filter(|record| &record.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use crate::search::domain::Coordinates;

    fn account() -> AccountId {
        AccountId("acct-memory".to_string())
    }

    fn balance(available: u64) -> CreditBalance {
        CreditBalance {
            account_id: account(),
            available_credits: available,
            total_earned: available,
            total_spent: 0,
            last_updated: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn entry(action_type: ActionType, consumed: u32, added: u32) -> CreditTransaction {
        CreditTransaction {
            id: TransactionId::generate(),
            account_id: account(),
            action_type,
            credits_consumed: consumed,
            credits_added: added,
            description: "test".to_string(),
            reference_id: None,
            transaction_hash: uuid::Uuid::new_v4().to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 5, 0).unwrap(),
        }
    }

    fn history(hash: &str) -> SearchHistoryRecord {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 5, 0).unwrap();
        SearchHistoryRecord {
            id: HistoryId::generate(),
            account_id: account(),
            address: "123 Main St".to_string(),
            coordinates: Coordinates {
                latitude: 44.97,
                longitude: -93.26,
            },
            search_type: SearchType::Basic,
            credits_used: 0,
            result_payload: json!({}),
            transaction_hash: hash.to_string(),
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn debit_guard_rejects_overdraft_without_appending() {
        let store = MemoryStore::new();
        store.provision_account(balance(1)).await.expect("provisioned");

        store
            .apply_debit(entry(ActionType::SmartSearch, 1, 0))
            .await
            .expect("first debit fits");
        let err = store
            .apply_debit(entry(ActionType::SmartSearch, 1, 0))
            .await
            .expect_err("second debit overdraws");

        assert_eq!(err, StoreError::InsufficientCredits { available: 0 });
        let totals = store.ledger_totals(&account()).await.expect("totals");
        assert_eq!(totals.consumed, 1);
        assert_eq!(totals.entries, 1);
    }

    #[tokio::test]
    async fn provisioning_twice_conflicts() {
        let store = MemoryStore::new();
        store.provision_account(balance(0)).await.expect("provisioned");
        assert_eq!(
            store.provision_account(balance(3)).await,
            Err(StoreError::Conflict)
        );
    }

    #[tokio::test]
    async fn history_hash_is_unique() {
        let store = MemoryStore::new();
        store.insert_history(history("hash-a")).await.expect("inserted");
        assert_eq!(
            store.insert_history(history("hash-a")).await,
            Err(StoreError::Conflict)
        );
    }

    #[tokio::test]
    async fn update_history_requires_expected_tier() {
        let store = MemoryStore::new();
        let record = store.insert_history(history("hash-b")).await.expect("inserted");

        let mut upgraded = record.clone();
        upgraded.search_type = SearchType::Smart;
        upgraded.credits_used = 1;
        store
            .update_history(upgraded.clone(), SearchType::Basic)
            .await
            .expect("basic record upgrades");

        assert_eq!(
            store.update_history(upgraded, SearchType::Basic).await,
            Err(StoreError::Conflict)
        );
    }

    #[tokio::test]
    async fn update_history_keeps_hashes_unique() {
        let store = MemoryStore::new();
        store.insert_history(history("hash-c")).await.expect("inserted");
        let other = store.insert_history(history("hash-d")).await.expect("inserted");

        let mut clashing = other.clone();
        clashing.transaction_hash = "hash-c".to_string();
        assert_eq!(
            store.update_history(clashing, SearchType::Basic).await,
            Err(StoreError::Conflict)
        );

        let mut renamed = other;
        renamed.transaction_hash = "hash-e".to_string();
        store
            .update_history(renamed, SearchType::Basic)
            .await
            .expect("fresh hash accepted");
        assert!(store
            .find_history_by_hash("hash-e")
            .await
            .expect("lookup")
            .is_some());
    }

    #[tokio::test]
    async fn charges_are_matched_by_reference_and_action() {
        let store = MemoryStore::new();
        store.provision_account(balance(2)).await.expect("provisioned");

        let mut charge = entry(ActionType::SmartSearch, 1, 0);
        charge.reference_id = Some("srch-9".to_string());
        store.apply_debit(charge.clone()).await.expect("debit");
        let mut refund = entry(ActionType::Refund, 0, 1);
        refund.reference_id = Some("srch-10".to_string());
        store.apply_refund(refund, 1).await.expect("refund");

        assert_eq!(store.find_charge("srch-9").await, Ok(Some(charge)));
        assert_eq!(store.find_charge("srch-10").await, Ok(None));
    }

    #[tokio::test]
    async fn refunds_are_capped_by_reference() {
        let store = MemoryStore::new();
        store.provision_account(balance(2)).await.expect("provisioned");

        let mut refund = entry(ActionType::Refund, 0, 1);
        refund.reference_id = Some("ctx-original".to_string());
        store
            .apply_refund(refund.clone(), 1)
            .await
            .expect("first refund fits");

        refund.id = TransactionId::generate();
        assert_eq!(
            store.apply_refund(refund, 1).await,
            Err(StoreError::RefundLimitExceeded { remaining: 0 })
        );
    }
}
