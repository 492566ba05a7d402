use std::sync::Arc;

use serde::Serialize;

use super::domain::{
    AccountId, ActionType, CreditBalance, CreditTransaction, HistoryId, TransactionId,
};
use super::recorder::{record_transaction, Clock, TransactionDraft};
use super::store::{LedgerStore, LedgerTotals, StoreError};

/// Error raised by the credit ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("account {0} not found")]
    AccountNotFound(AccountId),
    #[error("account {0} already exists")]
    AccountExists(AccountId),
    #[error("insufficient credits for {account_id}: {available} available, {required} required")]
    InsufficientCredits {
        account_id: AccountId,
        available: u64,
        required: u32,
    },
    #[error("credit amounts must be positive")]
    InvalidAmount,
    #[error("{0} entries cannot be posted as a plain credit")]
    InvalidAction(ActionType),
    #[error("referenced transaction {0} not found")]
    ReferenceNotFound(TransactionId),
    #[error("transaction {0} is not a smart search consumption")]
    ReferenceNotRefundable(TransactionId),
    #[error("refund of {requested} exceeds the {remaining} refundable credits")]
    RefundExceedsConsumption { requested: u32, remaining: u64 },
    #[error("ledger store unavailable: {0}")]
    Store(StoreError),
}

/// Committed ledger entry together with the balance it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerReceipt {
    pub transaction: CreditTransaction,
    pub balance: CreditBalance,
}

/// Balance cross-checked against the transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerAudit {
    pub balance: CreditBalance,
    pub logged_consumed: u64,
    pub logged_added: u64,
    pub entries: u64,
    /// `available_credits == total_earned - total_spent`
    pub balance_consistent: bool,
    /// Logged sums match `total_spent` and `total_earned`.
    pub log_consistent: bool,
}

impl LedgerAudit {
    pub fn is_clean(&self) -> bool {
        self.balance_consistent && self.log_consistent
    }
}

/// Sole mutator of account balances.
pub struct CreditLedger<S: ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> CreditLedger<S>
where
    S: LedgerStore + ?Sized,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Provision the balance row for a new account, optionally seeding it with a purchase.
    pub async fn open_account(
        &self,
        account_id: &AccountId,
        initial_credits: u32,
    ) -> Result<CreditBalance, LedgerError> {
        let empty = CreditBalance {
            account_id: account_id.clone(),
            available_credits: 0,
            total_earned: 0,
            total_spent: 0,
            last_updated: self.clock.now(),
        };

        let balance = self
            .store
            .provision_account(empty)
            .await
            .map_err(|err| match err {
                StoreError::Conflict => LedgerError::AccountExists(account_id.clone()),
                other => LedgerError::Store(other),
            })?;

        if initial_credits == 0 {
            return Ok(balance);
        }

        let receipt = self
            .credit(
                account_id,
                initial_credits,
                ActionType::Purchase,
                "Initial credit grant",
            )
            .await?;
        Ok(receipt.balance)
    }

    pub async fn get_balance(&self, account_id: &AccountId) -> Result<CreditBalance, LedgerError> {
        self.store
            .fetch_balance(account_id)
            .await
            .map_err(LedgerError::Store)?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))
    }

    /// Debit `amount` credits in one conditional write; the guard is evaluated by the
    /// store at commit time, never from a balance read here.
    pub async fn reserve_and_consume(
        &self,
        account_id: &AccountId,
        amount: u32,
        reference: Option<&HistoryId>,
        description: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let transaction = record_transaction(
            TransactionDraft {
                account_id: account_id.clone(),
                action_type: ActionType::SmartSearch,
                credits_consumed: amount,
                credits_added: 0,
                description: description.to_string(),
                reference_id: reference.map(|id| id.0.clone()),
            },
            self.clock.now(),
        );

        let balance = self
            .store
            .apply_debit(transaction.clone())
            .await
            .map_err(|err| match err {
                StoreError::InsufficientCredits { available } => LedgerError::InsufficientCredits {
                    account_id: account_id.clone(),
                    available,
                    required: amount,
                },
                StoreError::NotFound => LedgerError::AccountNotFound(account_id.clone()),
                other => LedgerError::Store(other),
            })?;

        Ok(LedgerReceipt {
            transaction,
            balance,
        })
    }

    /// Add credits from a purchase or subscription renewal.
    pub async fn credit(
        &self,
        account_id: &AccountId,
        amount: u32,
        action_type: ActionType,
        description: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        match action_type {
            ActionType::Purchase | ActionType::SubscriptionRenewal => {}
            ActionType::SmartSearch | ActionType::Refund => {
                return Err(LedgerError::InvalidAction(action_type))
            }
        }

        let transaction = record_transaction(
            TransactionDraft {
                account_id: account_id.clone(),
                action_type,
                credits_consumed: 0,
                credits_added: amount,
                description: description.to_string(),
                reference_id: None,
            },
            self.clock.now(),
        );

        let balance = self
            .store
            .apply_credit(transaction.clone())
            .await
            .map_err(|err| self.map_credit_error(account_id, err))?;

        Ok(LedgerReceipt {
            transaction,
            balance,
        })
    }

    /// Compensating credit tied to an earlier smart search consumption.
    pub async fn refund(
        &self,
        account_id: &AccountId,
        amount: u32,
        reference_id: &TransactionId,
    ) -> Result<LedgerReceipt, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let original = self
            .store
            .fetch_transaction(reference_id)
            .await
            .map_err(LedgerError::Store)?
            .filter(|entry| &entry.account_id == account_id)
            .ok_or_else(|| LedgerError::ReferenceNotFound(reference_id.clone()))?;

        if original.action_type != ActionType::SmartSearch {
            return Err(LedgerError::ReferenceNotRefundable(reference_id.clone()));
        }

        let transaction = record_transaction(
            TransactionDraft {
                account_id: account_id.clone(),
                action_type: ActionType::Refund,
                credits_consumed: 0,
                credits_added: amount,
                description: format!("Refund of {}", original.id),
                reference_id: Some(original.id.0.clone()),
            },
            self.clock.now(),
        );

        let balance = self
            .store
            .apply_refund(transaction.clone(), u64::from(original.credits_consumed))
            .await
            .map_err(|err| match err {
                StoreError::RefundLimitExceeded { remaining } => {
                    LedgerError::RefundExceedsConsumption {
                        requested: amount,
                        remaining,
                    }
                }
                other => self.map_credit_error(account_id, other),
            })?;

        Ok(LedgerReceipt {
            transaction,
            balance,
        })
    }

    /// Committed smart search consumption that paid for `history_id`.
    pub async fn charge_for(
        &self,
        history_id: &HistoryId,
    ) -> Result<Option<CreditTransaction>, LedgerError> {
        self.store
            .find_charge(&history_id.0)
            .await
            .map_err(LedgerError::Store)
    }

    /// Newest entries first.
    pub async fn transactions(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        self.store
            .list_transactions(account_id, limit)
            .await
            .map_err(LedgerError::Store)
    }

    pub async fn audit(&self, account_id: &AccountId) -> Result<LedgerAudit, LedgerError> {
        let balance = self.get_balance(account_id).await?;
        let LedgerTotals {
            consumed,
            added,
            entries,
        } = self
            .store
            .ledger_totals(account_id)
            .await
            .map_err(LedgerError::Store)?;

        Ok(LedgerAudit {
            balance_consistent: balance.is_consistent(),
            log_consistent: consumed == balance.total_spent && added == balance.total_earned,
            logged_consumed: consumed,
            logged_added: added,
            entries,
            balance,
        })
    }

    fn map_credit_error(&self, account_id: &AccountId, err: StoreError) -> LedgerError {
        match err {
            StoreError::NotFound => LedgerError::AccountNotFound(account_id.clone()),
            other => LedgerError::Store(other),
        }
    }
}
