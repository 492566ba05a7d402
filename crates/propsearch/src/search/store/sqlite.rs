//! SQLite-backed store.
//!
//! Balance rows are only ever changed by single conditional `UPDATE` statements, so two
//! processes sharing the database file cannot both spend the last credit.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{HistoryStore, LedgerStore, LedgerTotals, StoreError};
use crate::search::domain::{
    AccountId, ActionType, Coordinates, CreditBalance, CreditTransaction, HistoryId,
    SearchHistoryRecord, SearchType, TransactionId,
};

/// Store backed by an `sqlx` SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if missing) the database at `url` and applies the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url).map_err(unavailable)?;
        Self::connect_with(options).await
    }

    /// Opens (creating if missing) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::connect_with(SqliteConnectOptions::new().filename(path)).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        // Writers queue on the database lock instead of failing fast.
        let options = options
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(unavailable)?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Single-connection in-memory database, mostly for tests and demos.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(unavailable)?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Initialize the schema
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS credit_balances (
                account_id TEXT PRIMARY KEY,
                available_credits INTEGER NOT NULL CHECK (available_credits >= 0),
                total_earned INTEGER NOT NULL DEFAULT 0,
                total_spent INTEGER NOT NULL DEFAULT 0,
                last_updated TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS credit_transactions (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES credit_balances(account_id),
                action_type TEXT NOT NULL,
                credits_consumed INTEGER NOT NULL,
                credits_added INTEGER NOT NULL,
                description TEXT NOT NULL,
                reference_id TEXT,
                transaction_hash TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_credit_transactions_account
            ON credit_transactions(account_id, created_at)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_credit_transactions_reference
            ON credit_transactions(reference_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS search_history (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                address TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                search_type TEXT NOT NULL,
                credits_used INTEGER NOT NULL,
                result_payload TEXT NOT NULL,
                transaction_hash TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_search_history_account
            ON search_history(account_id, created_at)
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
        }

        Ok(())
    }
}

fn unavailable<E: std::fmt::Display>(err: E) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn write_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
        _ => unavailable(err),
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("timestamp '{raw}': {err}")))
}

fn to_count(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} is negative")))
}

fn to_amount(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range")))
}

fn to_sql(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{value} exceeds i64")))
}

fn balance_from_row(row: &SqliteRow) -> Result<CreditBalance, StoreError> {
    let last_updated: String = row.try_get("last_updated").map_err(unavailable)?;
    Ok(CreditBalance {
        account_id: AccountId(row.try_get("account_id").map_err(unavailable)?),
        available_credits: to_count(
            row.try_get("available_credits").map_err(unavailable)?,
            "available_credits",
        )?,
        total_earned: to_count(
            row.try_get("total_earned").map_err(unavailable)?,
            "total_earned",
        )?,
        total_spent: to_count(
            row.try_get("total_spent").map_err(unavailable)?,
            "total_spent",
        )?,
        last_updated: parse_timestamp(&last_updated)?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> Result<CreditTransaction, StoreError> {
    let action_type: String = row.try_get("action_type").map_err(unavailable)?;
    let created_at: String = row.try_get("created_at").map_err(unavailable)?;
    Ok(CreditTransaction {
        id: TransactionId(row.try_get("id").map_err(unavailable)?),
        account_id: AccountId(row.try_get("account_id").map_err(unavailable)?),
        action_type: ActionType::from_str(&action_type)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?,
        credits_consumed: to_amount(
            row.try_get("credits_consumed").map_err(unavailable)?,
            "credits_consumed",
        )?,
        credits_added: to_amount(
            row.try_get("credits_added").map_err(unavailable)?,
            "credits_added",
        )?,
        description: row.try_get("description").map_err(unavailable)?,
        reference_id: row.try_get("reference_id").map_err(unavailable)?,
        transaction_hash: row.try_get("transaction_hash").map_err(unavailable)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<SearchHistoryRecord, StoreError> {
    let search_type: String = row.try_get("search_type").map_err(unavailable)?;
    let payload: String = row.try_get("result_payload").map_err(unavailable)?;
    let created_at: String = row.try_get("created_at").map_err(unavailable)?;
    let updated_at: String = row.try_get("updated_at").map_err(unavailable)?;
    Ok(SearchHistoryRecord {
        id: HistoryId(row.try_get("id").map_err(unavailable)?),
        account_id: AccountId(row.try_get("account_id").map_err(unavailable)?),
        address: row.try_get("address").map_err(unavailable)?,
        coordinates: Coordinates {
            latitude: row.try_get("latitude").map_err(unavailable)?,
            longitude: row.try_get("longitude").map_err(unavailable)?,
        },
        search_type: SearchType::from_str(&search_type)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?,
        credits_used: to_amount(
            row.try_get("credits_used").map_err(unavailable)?,
            "credits_used",
        )?,
        result_payload: serde_json::from_str(&payload)
            .map_err(|err| StoreError::Corrupt(format!("result_payload: {err}")))?,
        transaction_hash: row.try_get("transaction_hash").map_err(unavailable)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

async fn insert_transaction(
    conn: &mut SqliteConnection,
    entry: &CreditTransaction,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO credit_transactions (
            id, account_id, action_type, credits_consumed, credits_added,
            description, reference_id, transaction_hash, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.id.0)
    .bind(&entry.account_id.0)
    .bind(entry.action_type.as_str())
    .bind(i64::from(entry.credits_consumed))
    .bind(i64::from(entry.credits_added))
    .bind(&entry.description)
    .bind(entry.reference_id.as_deref())
    .bind(&entry.transaction_hash)
    .bind(timestamp(&entry.created_at))
    .execute(&mut *conn)
    .await
    .map_err(write_error)?;
    Ok(())
}

async fn select_balance(
    conn: &mut SqliteConnection,
    account_id: &AccountId,
) -> Result<Option<CreditBalance>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT account_id, available_credits, total_earned, total_spent, last_updated
        FROM credit_balances
        WHERE account_id = ?
        "#,
    )
    .bind(&account_id.0)
    .fetch_optional(&mut *conn)
    .await
    .map_err(unavailable)?;

    row.as_ref().map(balance_from_row).transpose()
}

async fn credit_balance(
    conn: &mut SqliteConnection,
    entry: &CreditTransaction,
) -> Result<CreditBalance, StoreError> {
    let updated = sqlx::query(
        r#"
        UPDATE credit_balances
        SET available_credits = available_credits + ?,
            total_earned = total_earned + ?,
            last_updated = ?
        WHERE account_id = ?
        "#,
    )
    .bind(i64::from(entry.credits_added))
    .bind(i64::from(entry.credits_added))
    .bind(timestamp(&entry.created_at))
    .bind(&entry.account_id.0)
    .execute(&mut *conn)
    .await
    .map_err(unavailable)?;

    if updated.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }

    insert_transaction(conn, entry).await?;
    select_balance(conn, &entry.account_id)
        .await?
        .ok_or(StoreError::NotFound)
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn provision_account(&self, balance: CreditBalance) -> Result<CreditBalance, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO credit_balances (
                account_id, available_credits, total_earned, total_spent, last_updated
            )
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&balance.account_id.0)
        .bind(to_sql(balance.available_credits)?)
        .bind(to_sql(balance.total_earned)?)
        .bind(to_sql(balance.total_spent)?)
        .bind(timestamp(&balance.last_updated))
        .execute(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(balance)
    }

    async fn fetch_balance(
        &self,
        account_id: &AccountId,
    ) -> Result<Option<CreditBalance>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(unavailable)?;
        select_balance(&mut conn, account_id).await
    }

    async fn apply_debit(&self, entry: CreditTransaction) -> Result<CreditBalance, StoreError> {
        let amount = i64::from(entry.credits_consumed);
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let updated = sqlx::query(
            r#"
            UPDATE credit_balances
            SET available_credits = available_credits - ?,
                total_spent = total_spent + ?,
                last_updated = ?
            WHERE account_id = ? AND available_credits >= ?
            "#,
        )
        .bind(amount)
        .bind(amount)
        .bind(timestamp(&entry.created_at))
        .bind(&entry.account_id.0)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        if updated.rows_affected() == 0 {
            let current = select_balance(&mut tx, &entry.account_id).await?;
            tx.rollback().await.map_err(unavailable)?;
            return Err(match current {
                Some(balance) => StoreError::InsufficientCredits {
                    available: balance.available_credits,
                },
                None => StoreError::NotFound,
            });
        }

        insert_transaction(&mut tx, &entry).await?;
        let balance = select_balance(&mut tx, &entry.account_id)
            .await?
            .ok_or(StoreError::NotFound)?;
        tx.commit().await.map_err(unavailable)?;
        Ok(balance)
    }

    async fn apply_credit(&self, entry: CreditTransaction) -> Result<CreditBalance, StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let balance = credit_balance(&mut tx, &entry).await?;
        tx.commit().await.map_err(unavailable)?;
        Ok(balance)
    }

    async fn apply_refund(
        &self,
        entry: CreditTransaction,
        refundable: u64,
    ) -> Result<CreditBalance, StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let refunded: i64 = sqlx::query(
            r#"
            SELECT COALESCE(SUM(credits_added), 0) AS refunded
            FROM credit_transactions
            WHERE action_type = 'refund' AND reference_id = ?
            "#,
        )
        .bind(entry.reference_id.as_deref())
        .fetch_one(&mut *tx)
        .await
        .map_err(unavailable)?
        .try_get("refunded")
        .map_err(unavailable)?;

        let remaining = refundable.saturating_sub(to_count(refunded, "refunded")?);
        if u64::from(entry.credits_added) > remaining {
            tx.rollback().await.map_err(unavailable)?;
            return Err(StoreError::RefundLimitExceeded { remaining });
        }

        let balance = credit_balance(&mut tx, &entry).await?;
        tx.commit().await.map_err(unavailable)?;
        Ok(balance)
    }

    async fn fetch_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        let row = sqlx::query("SELECT * FROM credit_transactions WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn find_charge(
        &self,
        reference_id: &str,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM credit_transactions
            WHERE action_type = 'smart_search' AND reference_id = ?
            LIMIT 1
            "#,
        )
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn list_transactions(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT * FROM credit_transactions
            WHERE account_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(&account_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn ledger_totals(&self, account_id: &AccountId) -> Result<LedgerTotals, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(credits_consumed), 0) AS consumed,
                   COALESCE(SUM(credits_added), 0) AS added,
                   COUNT(*) AS entries
            FROM credit_transactions
            WHERE account_id = ?
            "#,
        )
        .bind(&account_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(LedgerTotals {
            consumed: to_count(row.try_get("consumed").map_err(unavailable)?, "consumed")?,
            added: to_count(row.try_get("added").map_err(unavailable)?, "added")?,
            entries: to_count(row.try_get("entries").map_err(unavailable)?, "entries")?,
        })
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn insert_history(
        &self,
        record: SearchHistoryRecord,
    ) -> Result<SearchHistoryRecord, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO search_history (
                id, account_id, address, latitude, longitude, search_type,
                credits_used, result_payload, transaction_hash, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id.0)
        .bind(&record.account_id.0)
        .bind(&record.address)
        .bind(record.coordinates.latitude)
        .bind(record.coordinates.longitude)
        .bind(record.search_type.as_str())
        .bind(i64::from(record.credits_used))
        .bind(record.result_payload.to_string())
        .bind(&record.transaction_hash)
        .bind(timestamp(&record.created_at))
        .bind(timestamp(&record.updated_at))
        .execute(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(record)
    }

    async fn find_history_by_hash(
        &self,
        transaction_hash: &str,
    ) -> Result<Option<SearchHistoryRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM search_history WHERE transaction_hash = ?")
            .bind(transaction_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.as_ref().map(history_from_row).transpose()
    }

    async fn fetch_history(
        &self,
        id: &HistoryId,
    ) -> Result<Option<SearchHistoryRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM search_history WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.as_ref().map(history_from_row).transpose()
    }

    async fn update_history(
        &self,
        record: SearchHistoryRecord,
        expected: SearchType,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE search_history
            SET search_type = ?, credits_used = ?, result_payload = ?,
                transaction_hash = ?, updated_at = ?
            WHERE id = ? AND search_type = ?
            "#,
        )
        .bind(record.search_type.as_str())
        .bind(i64::from(record.credits_used))
        .bind(record.result_payload.to_string())
        .bind(&record.transaction_hash)
        .bind(timestamp(&record.updated_at))
        .bind(&record.id.0)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(write_error)?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }

        match self.fetch_history(&record.id).await? {
            Some(_) => Err(StoreError::Conflict),
            None => Err(StoreError::NotFound),
        }
    }

    async fn delete_history(&self, id: &HistoryId) -> Result<(), StoreError> {
        let deleted = sqlx::query("DELETE FROM search_history WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_history(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<SearchHistoryRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT * FROM search_history
            WHERE account_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(&account_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter().map(history_from_row).collect()
    }
}
