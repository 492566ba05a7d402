use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::domain::{
    normalize_address, AccountId, ActionType, CreditTransaction, HistoryId, SearchHistoryRecord,
    SearchRequest, SearchType, TransactionId,
};
use super::store::{HistoryStore, StoreError};

/// Time source for `created_at` stamps and fingerprint buckets.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to an instant until moved explicitly.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Result of a history write.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Created(SearchHistoryRecord),
    /// A record with the same fingerprint already exists; nothing new was written.
    Duplicate(SearchHistoryRecord),
}

/// Error raised by the recorder.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("search history write failed: {0}")]
    HistoryWriteFailed(StoreError),
    #[error("search history {0} not found")]
    NotFound(HistoryId),
    #[error("search history {0} was modified concurrently")]
    Conflict(HistoryId),
    #[error("search history unavailable: {0}")]
    Store(StoreError),
}

/// Fields of a ledger entry before it is stamped.
#[derive(Debug, Clone)]
pub struct TransactionDraft {
    pub account_id: AccountId,
    pub action_type: ActionType,
    pub credits_consumed: u32,
    pub credits_added: u32,
    pub description: String,
    pub reference_id: Option<String>,
}

/// Stamps a ledger entry with its id, timestamp, and content hash. The ledger appends the
/// returned row inside the same atomic write that changes the balance.
pub fn record_transaction(draft: TransactionDraft, at: DateTime<Utc>) -> CreditTransaction {
    let id = TransactionId::generate();

    let mut hasher = Sha256::new();
    hasher.update(id.0.as_bytes());
    hasher.update(b"|");
    hasher.update(draft.account_id.0.as_bytes());
    hasher.update(b"|");
    hasher.update(draft.action_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(draft.credits_consumed.to_le_bytes());
    hasher.update(draft.credits_added.to_le_bytes());
    hasher.update(b"|");
    hasher.update(draft.reference_id.as_deref().unwrap_or_default().as_bytes());
    hasher.update(b"|");
    hasher.update(at.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());

    CreditTransaction {
        id,
        account_id: draft.account_id,
        action_type: draft.action_type,
        credits_consumed: draft.credits_consumed,
        credits_added: draft.credits_added,
        description: draft.description,
        reference_id: draft.reference_id,
        transaction_hash: hex::encode(hasher.finalize()),
        created_at: at,
    }
}

/// Content-derived fingerprint of a search submission within one time bucket.
pub fn search_fingerprint(
    account_id: &AccountId,
    address: &str,
    search_type: SearchType,
    at: DateTime<Utc>,
    window: Duration,
) -> String {
    let window_secs = window.as_secs().max(1) as i64;
    let bucket = at.timestamp().div_euclid(window_secs);

    let mut hasher = Sha256::new();
    hasher.update(account_id.0.as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_address(address).as_bytes());
    hasher.update(b"|");
    hasher.update(search_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Hash carried by an upgraded record. It never equals a submission fingerprint, so
/// later requests for either tier of the address are not answered from the upgrade.
fn upgraded_fingerprint(record: &SearchHistoryRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"upgrade|");
    hasher.update(record.transaction_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(record.id.0.as_bytes());
    hex::encode(hasher.finalize())
}

/// Writes the immutable audit trail of searches.
pub struct TransactionRecorder<S: ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl<S> TransactionRecorder<S>
where
    S: HistoryStore + ?Sized,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            store,
            clock,
            window,
        }
    }

    pub fn fingerprint(&self, account_id: &AccountId, request: &SearchRequest) -> String {
        search_fingerprint(
            account_id,
            &request.address,
            request.search_type,
            self.clock.now(),
            self.window,
        )
    }

    pub async fn find_duplicate(
        &self,
        fingerprint: &str,
    ) -> Result<Option<SearchHistoryRecord>, RecorderError> {
        self.store
            .find_history_by_hash(fingerprint)
            .await
            .map_err(RecorderError::Store)
    }

    /// Persist the outcome of a determinate search.
    pub async fn record_history(
        &self,
        account_id: &AccountId,
        request: &SearchRequest,
        result_payload: Value,
    ) -> Result<RecordOutcome, RecorderError> {
        let now = self.clock.now();
        let transaction_hash = search_fingerprint(
            account_id,
            &request.address,
            request.search_type,
            now,
            self.window,
        );

        let record = SearchHistoryRecord {
            id: HistoryId::generate(),
            account_id: account_id.clone(),
            address: request.address.trim().to_string(),
            coordinates: request.coordinates(),
            search_type: request.search_type,
            credits_used: request.search_type.cost(),
            result_payload,
            transaction_hash,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_history(record.clone()).await {
            Ok(stored) => Ok(RecordOutcome::Created(stored)),
            Err(StoreError::Conflict) => {
                match self
                    .store
                    .find_history_by_hash(&record.transaction_hash)
                    .await
                {
                    Ok(Some(existing)) => Ok(RecordOutcome::Duplicate(existing)),
                    Ok(None) => Err(RecorderError::HistoryWriteFailed(StoreError::Conflict)),
                    Err(err) => Err(RecorderError::HistoryWriteFailed(err)),
                }
            }
            Err(err) => Err(RecorderError::HistoryWriteFailed(err)),
        }
    }

    pub async fn fetch(
        &self,
        id: &HistoryId,
    ) -> Result<Option<SearchHistoryRecord>, RecorderError> {
        self.store.fetch_history(id).await.map_err(RecorderError::Store)
    }

    /// Rewrites a basic record as smart with the provider payload. The record gives up
    /// its submission fingerprint; [`TransactionRecorder::restore_history`] puts it back.
    pub async fn upgrade_history(
        &self,
        record: &SearchHistoryRecord,
        result_payload: Value,
    ) -> Result<SearchHistoryRecord, RecorderError> {
        let upgraded = SearchHistoryRecord {
            search_type: SearchType::Smart,
            credits_used: SearchType::Smart.cost(),
            result_payload,
            transaction_hash: upgraded_fingerprint(record),
            updated_at: self.clock.now(),
            ..record.clone()
        };

        self.store
            .update_history(upgraded.clone(), SearchType::Basic)
            .await
            .map_err(|err| match err {
                StoreError::NotFound => RecorderError::NotFound(record.id.clone()),
                StoreError::Conflict => RecorderError::Conflict(record.id.clone()),
                other => RecorderError::HistoryWriteFailed(other),
            })?;
        Ok(upgraded)
    }

    /// Puts back the record as it was before an upgrade whose charge failed.
    pub async fn restore_history(
        &self,
        previous: SearchHistoryRecord,
    ) -> Result<(), RecorderError> {
        let id = previous.id.clone();
        self.store
            .update_history(previous, SearchType::Smart)
            .await
            .map_err(|err| match err {
                StoreError::NotFound => RecorderError::NotFound(id),
                StoreError::Conflict => RecorderError::Conflict(id),
                other => RecorderError::Store(other),
            })
    }

    /// Removes a record whose charge failed.
    pub async fn discard_history(&self, id: &HistoryId) -> Result<(), RecorderError> {
        self.store.delete_history(id).await.map_err(|err| match err {
            StoreError::NotFound => RecorderError::NotFound(id.clone()),
            other => RecorderError::Store(other),
        })
    }

    pub async fn history(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<SearchHistoryRecord>, RecorderError> {
        self.store
            .list_history(account_id, limit)
            .await
            .map_err(RecorderError::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::store::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap() + chrono::Duration::seconds(secs as i64)
    }

    fn account() -> AccountId {
        AccountId("acct-42".to_string())
    }

    #[test]
    fn fingerprint_ignores_address_spelling() {
        let window = Duration::from_secs(60);
        let a = search_fingerprint(
            &account(),
            "123 Main St, Minneapolis, MN 55401",
            SearchType::Smart,
            at(5),
            window,
        );
        let b = search_fingerprint(
            &account(),
            "  123 MAIN ST,  Minneapolis, MN 55401",
            SearchType::Smart,
            at(40),
            window,
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_separates_tiers_accounts_and_buckets() {
        let window = Duration::from_secs(60);
        let base = search_fingerprint(&account(), "1 Elm", SearchType::Smart, at(0), window);

        assert_ne!(
            base,
            search_fingerprint(&account(), "1 Elm", SearchType::Basic, at(0), window)
        );
        assert_ne!(
            base,
            search_fingerprint(
                &AccountId("acct-43".to_string()),
                "1 Elm",
                SearchType::Smart,
                at(0),
                window
            )
        );
        assert_ne!(
            base,
            search_fingerprint(&account(), "1 Elm", SearchType::Smart, at(61), window)
        );
    }

    #[test]
    fn transaction_hashes_are_unique_per_entry() {
        let draft = TransactionDraft {
            account_id: account(),
            action_type: ActionType::SmartSearch,
            credits_consumed: 1,
            credits_added: 0,
            description: "Smart search".to_string(),
            reference_id: Some("srch-1".to_string()),
        };
        let first = record_transaction(draft.clone(), at(0));
        let second = record_transaction(draft, at(0));

        assert_ne!(first.id, second.id);
        assert_ne!(first.transaction_hash, second.transaction_hash);
        assert_eq!(first.created_at, at(0));
        assert_eq!(first.reference_id.as_deref(), Some("srch-1"));
    }

    #[tokio::test]
    async fn upgrade_releases_and_restore_reclaims_the_fingerprint() {
        let recorder = TransactionRecorder::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FixedClock::new(at(0))),
            Duration::from_secs(60),
        );
        let request = SearchRequest::new("1 Elm St", SearchType::Basic, 44.9, -93.2);
        let basic = match recorder
            .record_history(&account(), &request, json!({ "tier": "basic" }))
            .await
            .expect("recorded")
        {
            RecordOutcome::Created(record) => record,
            other => panic!("expected a new record, got {other:?}"),
        };
        let fingerprint = recorder.fingerprint(&account(), &request);
        assert_eq!(basic.transaction_hash, fingerprint);

        let upgraded = recorder
            .upgrade_history(&basic, json!({ "tier": "smart" }))
            .await
            .expect("upgraded");
        assert_ne!(upgraded.transaction_hash, fingerprint);
        assert!(recorder
            .find_duplicate(&fingerprint)
            .await
            .expect("lookup")
            .is_none());

        recorder
            .restore_history(basic.clone())
            .await
            .expect("restored");
        assert_eq!(
            recorder.find_duplicate(&fingerprint).await.expect("lookup"),
            Some(basic)
        );
    }

    #[test]
    fn fixed_clock_advances_on_request() {
        let clock = FixedClock::new(at(0));
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now(), at(90));
    }
}
