//! Credit-metered property search: ledger, executor, recorder, and the orchestration
//! protocol that sequences them.

pub mod domain;
pub mod executor;
pub mod ledger;
pub mod orchestrator;
pub mod provider;
pub mod recorder;
pub mod router;
pub mod store;

#[cfg(test)]
mod tests;

pub use domain::{
    normalize_address, AccountId, ActionType, Coordinates, CreditBalance, CreditTransaction,
    HistoryId, SearchHistoryRecord, SearchRequest, SearchResult, SearchType, TransactionId,
    SMART_SEARCH_COST,
};
pub use executor::{ExecutorResult, SearchExecutor};
pub use ledger::{CreditLedger, LedgerAudit, LedgerError, LedgerReceipt};
pub use orchestrator::{OrchestratorConfig, SearchError, SearchOrchestrator};
pub use provider::{HttpPropertyProvider, PropertyDataProvider, ProviderError, ProviderLookup};
pub use recorder::{
    Clock, FixedClock, RecordOutcome, RecorderError, SystemClock, TransactionRecorder,
};
pub use router::{search_router, ACCOUNT_HEADER};
pub use store::{
    HistoryStore, LedgerStore, LedgerTotals, MemoryStore, SearchStore, SqliteStore, StoreError,
};
