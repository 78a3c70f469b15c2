//! DuckDB store implementation

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::{params, Connection, Params, Row};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::locks::{account_row, HeldLocks, RowLocks};
use crate::domain::{
    Account, AccountId, IdempotencyKey, KeyStatus, LedgerError, LedgerPolicy, PointBatch, Result,
    Transaction, TransactionStatus,
};
use crate::ports::{
    AccountStore, AtomicExecutor, IdempotencyStore, PointBatchStore, PolicySource,
    TransactionStore, UnitOfWork,
};
use crate::services::{MigrationResult, MigrationService};

/// Maximum number of retries when the database file is locked
const MAX_RETRIES: u32 = 5;

/// Initial retry delay in milliseconds (doubles each retry: 50, 100, 200, 400ms)
const INITIAL_RETRY_DELAY_MS: u64 = 50;

/// Timestamps cross the driver boundary as text in this format
const TS_WRITE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const TS_READ_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Check if an error message indicates a file locking issue that should be retried
fn is_retryable_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    lower.contains("being used by another process")
        || lower.contains("cannot access the file")
        || lower.contains("resource temporarily unavailable")
        || lower.contains("database is locked")
        || lower.contains("file is already open")
        || lower.contains("could not set lock on file")
}

impl From<duckdb::Error> for LedgerError {
    fn from(err: duckdb::Error) -> Self {
        let msg = err.to_string();
        if msg.to_lowercase().contains("duplicate key") {
            LedgerError::KeyConflict(msg)
        } else {
            LedgerError::Datastore(msg)
        }
    }
}

/// DuckDB-backed ledger store
///
/// Committed reads and self-contained writes go through the shared
/// connection. Every unit of work gets its own cloned connection so its SQL
/// transaction is isolated from concurrent units.
pub struct DuckDbStore {
    conn: Mutex<Connection>,
    locks: RowLocks,
    db_path: Option<PathBuf>,
}

impl DuckDbStore {
    /// Open (or create) the database file at `db_path`
    ///
    /// Retries with exponential backoff when another process holds the file.
    pub fn open(db_path: &Path) -> Result<Self> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match Self::try_open_connection(db_path) {
                Ok(conn) => {
                    return Ok(Self {
                        conn: Mutex::new(conn),
                        locks: RowLocks::new(),
                        db_path: Some(db_path.to_path_buf()),
                    });
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    if is_retryable_error(&err_msg) && attempt < MAX_RETRIES - 1 {
                        let delay =
                            Duration::from_millis(INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt));
                        warn!(
                            attempt = attempt + 1,
                            max = MAX_RETRIES,
                            delay_ms = delay.as_millis() as u64,
                            "database busy, retrying: {}",
                            err_msg
                        );
                        thread::sleep(delay);
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }

        Err(last_error.map(LedgerError::from).unwrap_or_else(|| {
            LedgerError::datastore(format!("failed to open database after {} retries", MAX_RETRIES))
        }))
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory_with_flags(config)?),
            locks: RowLocks::new(),
            db_path: None,
        })
    }

    fn try_open_connection(db_path: &Path) -> duckdb::Result<Connection> {
        // JSON is statically linked through the "json" feature, so autoloading stays off
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        Connection::open_with_flags(db_path, config)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Run pending migrations and report what was applied
    pub fn run_migrations(&self) -> Result<MigrationResult> {
        let conn = self.conn.lock();
        MigrationService::new(&conn).run_pending()
    }

    pub fn ensure_schema(&self) -> Result<()> {
        self.run_migrations()?;
        Ok(())
    }

    pub fn pending_migrations(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        MigrationService::new(&conn).get_pending()
    }

    pub fn get_db_size(&self) -> Result<u64> {
        match &self.db_path {
            Some(path) => Ok(std::fs::metadata(path)?.len()),
            None => Ok(0),
        }
    }

    // === Settings ===

    pub fn get_settings(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        query_all(
            &conn,
            "SELECT setting_key, setting_value FROM sys_settings ORDER BY setting_key",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sys_settings (setting_key, setting_value, updated_at)
             VALUES (?, ?, CAST(? AS TIMESTAMP))",
            params![key, value, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM sys_settings WHERE setting_key = ?", [key])?;
        Ok(deleted > 0)
    }

    // === Doctor checks ===

    /// Accounts whose stored balance is negative
    pub fn check_negative_balances(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        query_all(
            &conn,
            "SELECT account_id, balance FROM accounts WHERE balance < 0 ORDER BY account_id",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
    }

    /// Batches with `remaining` outside `[0, original]`
    pub fn check_batch_bounds(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        query_all(
            &conn,
            "SELECT batch_id FROM point_batches
             WHERE remaining_amount < 0 OR remaining_amount > original_amount
             ORDER BY batch_id",
            [],
            |row| Ok(row.get(0)?),
        )
    }

    /// Accounts whose balance differs from the net of their completed
    /// transactions: (account, balance, ledger net)
    pub fn check_ledger_reconciliation(&self) -> Result<Vec<(String, i64, i64)>> {
        let conn = self.conn.lock();
        query_all(
            &conn,
            "SELECT a.account_id, a.balance,
                    CAST(COALESCE((SELECT SUM(t.amount) FROM ledger_transactions t
                                   WHERE t.to_account = a.account_id AND t.status = 'completed'), 0)
                       - COALESCE((SELECT SUM(t.amount) FROM ledger_transactions t
                                   WHERE t.from_account = a.account_id AND t.status = 'completed'), 0)
                         AS BIGINT) AS ledger_net
             FROM accounts a
             ORDER BY a.account_id",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map(|rows| rows.into_iter().filter(|(_, balance, net)| balance != net).collect())
    }

    /// Batches whose owning account does not exist
    pub fn check_orphaned_batches(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        query_all(
            &conn,
            "SELECT b.batch_id FROM point_batches b
             LEFT JOIN accounts a ON b.account_id = a.account_id
             WHERE a.account_id IS NULL",
            [],
            |row| Ok(row.get(0)?),
        )
    }

    /// Keys still `processing` after their expiry
    pub fn check_stale_processing_keys(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        query_all(
            &conn,
            "SELECT idempotency_key FROM idempotency_keys
             WHERE status = 'processing' AND expires_at <= CAST(? AS TIMESTAMP)
             ORDER BY idempotency_key",
            params![ts(now)],
            |row| Ok(row.get(0)?),
        )
    }

    /// Transactions left in `pending`, which a completed unit never commits
    pub fn check_pending_transactions(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        query_all(
            &conn,
            "SELECT transaction_id FROM ledger_transactions WHERE status = 'pending'",
            [],
            |row| Ok(row.get(0)?),
        )
    }

    // === Status ===

    /// (total accounts, active accounts, summed balance)
    pub fn account_totals(&self) -> Result<(i64, i64, i64)> {
        let conn = self.conn.lock();
        let totals = conn.query_row(
            "SELECT COUNT(*),
                    COUNT(*) FILTER (WHERE is_active),
                    CAST(COALESCE(SUM(balance), 0) AS BIGINT)
             FROM accounts",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(totals)
    }

    pub fn transaction_counts_by_type(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        query_all(
            &conn,
            "SELECT tx_type, COUNT(*) FROM ledger_transactions
             WHERE status = 'completed'
             GROUP BY tx_type ORDER BY tx_type",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
    }

    /// (batches with points left, outstanding points) among unexpired batches
    pub fn outstanding_batch_points(&self, now: DateTime<Utc>) -> Result<(i64, i64)> {
        let conn = self.conn.lock();
        let totals = conn.query_row(
            "SELECT COUNT(*), CAST(COALESCE(SUM(remaining_amount), 0) AS BIGINT)
             FROM point_batches
             WHERE remaining_amount > 0 AND expires_at > CAST(? AS TIMESTAMP)",
            params![ts(now)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(totals)
    }

    pub fn key_counts_by_status(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        query_all(
            &conn,
            "SELECT status, COUNT(*) FROM idempotency_keys GROUP BY status ORDER BY status",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
    }
}

/// Unit of work over a cloned DuckDB connection
///
/// The SQL transaction is opened on the first statement, which the ledger
/// issues only after the unit has taken its row locks. Dropping an
/// uncommitted unit rolls it back.
pub struct DuckDbUnit {
    id: Uuid,
    conn: Connection,
    locks: HeldLocks,
    in_transaction: bool,
    /// A statement failed; DuckDB will refuse to commit
    aborted: bool,
}

impl DuckDbUnit {
    fn conn(&mut self) -> Result<&Connection> {
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN TRANSACTION")?;
            self.in_transaction = true;
            debug!(unit = %self.id, locks = self.locks.len(), "sql transaction opened");
        }
        Ok(&self.conn)
    }

    /// Run statements inside the unit's transaction, remembering failures
    fn track<T>(&mut self, run: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let result = run(self.conn()?);
        if result.is_err() {
            self.aborted = true;
        }
        result
    }

    fn execute(&mut self, sql: &str, params: impl Params) -> Result<usize> {
        self.track(|conn| Ok(conn.execute(sql, params)?))
    }

    fn query_all<T>(
        &mut self,
        sql: &str,
        params: impl Params,
        map: impl Fn(&Row) -> Result<T>,
    ) -> Result<Vec<T>> {
        self.track(|conn| query_all(conn, sql, params, map))
    }

    fn query_opt<T>(
        &mut self,
        sql: &str,
        params: impl Params,
        map: impl Fn(&Row) -> Result<T>,
    ) -> Result<Option<T>> {
        self.track(|conn| query_opt(conn, sql, params, map))
    }
}

impl UnitOfWork for DuckDbUnit {
    fn id(&self) -> Uuid {
        self.id
    }

    fn cancel_token(&self) -> &CancellationToken {
        self.locks.cancel_token()
    }

    fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn commit(mut self) -> Result<()> {
        if self.in_transaction {
            self.conn.execute_batch("COMMIT")?;
            self.in_transaction = false;
        }
        self.locks.release_all();
        Ok(())
    }

    fn rollback(mut self) -> Result<()> {
        if self.in_transaction {
            self.in_transaction = false;
            self.conn.execute_batch("ROLLBACK")?;
        }
        self.locks.release_all();
        Ok(())
    }
}

impl Drop for DuckDbUnit {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(unit = %self.id, "rollback on drop failed: {}", e);
            }
        }
    }
}

impl AtomicExecutor for DuckDbStore {
    type Unit = DuckDbUnit;

    fn begin(&self, cancel: &CancellationToken, lock_timeout: Duration) -> Result<DuckDbUnit> {
        let conn = self.conn.lock().try_clone()?;
        Ok(DuckDbUnit {
            id: Uuid::new_v4(),
            conn,
            locks: HeldLocks::new(cancel.clone(), lock_timeout),
            in_transaction: false,
            aborted: false,
        })
    }
}

// === Accounts ===

const ACCOUNT_COLUMNS: &str = "account_id, name, balance, is_active,
    CAST(created_at AS VARCHAR), CAST(updated_at AS VARCHAR)";

fn row_to_account(row: &Row) -> Result<Account> {
    let id: String = row.get(0)?;
    Ok(Account {
        id: id.parse()?,
        name: row.get(1)?,
        balance: row.get(2)?,
        is_active: row.get(3)?,
        created_at: parse_ts(&row.get::<_, String>(4)?)?,
        updated_at: parse_ts(&row.get::<_, String>(5)?)?,
    })
}

impl AccountStore<DuckDbUnit> for DuckDbStore {
    fn insert_account(&self, account: &Account) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO accounts (account_id, name, balance, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP))",
            params![
                account.id.to_string(),
                account.name,
                account.balance,
                account.is_active,
                ts(account.created_at),
                ts(account.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        query_opt(
            &conn,
            &format!("SELECT {} FROM accounts WHERE account_id = ?", ACCOUNT_COLUMNS),
            params![id.to_string()],
            row_to_account,
        )
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn.lock();
        query_all(
            &conn,
            &format!("SELECT {} FROM accounts ORDER BY created_at, account_id", ACCOUNT_COLUMNS),
            [],
            row_to_account,
        )
    }

    fn lock_account(&self, unit: &mut DuckDbUnit, id: &AccountId) -> Result<()> {
        unit.locks.acquire(&self.locks, &account_row(id))
    }

    fn get_locked(&self, unit: &mut DuckDbUnit, id: &AccountId) -> Result<Option<Account>> {
        unit.locks.require(&account_row(id))?;
        unit.query_opt(
            &format!("SELECT {} FROM accounts WHERE account_id = ?", ACCOUNT_COLUMNS),
            params![id.to_string()],
            row_to_account,
        )
    }

    fn write_balance(
        &self,
        unit: &mut DuckDbUnit,
        id: &AccountId,
        balance: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        unit.locks.require(&account_row(id))?;
        let changed = unit.execute(
            "UPDATE accounts SET balance = ?, updated_at = CAST(? AS TIMESTAMP)
             WHERE account_id = ?",
            params![balance, ts(at), id.to_string()],
        )?;
        expect_one(changed, || format!("account {}", id))
    }

    fn write_active(
        &self,
        unit: &mut DuckDbUnit,
        id: &AccountId,
        active: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        unit.locks.require(&account_row(id))?;
        let changed = unit.execute(
            "UPDATE accounts SET is_active = ?, updated_at = CAST(? AS TIMESTAMP)
             WHERE account_id = ?",
            params![active, ts(at), id.to_string()],
        )?;
        expect_one(changed, || format!("account {}", id))
    }
}

// === Transactions ===

const TRANSACTION_COLUMNS: &str = "transaction_id, from_account, to_account, amount, tx_type,
    status, idempotency_key, CAST(metadata AS VARCHAR),
    CAST(created_at AS VARCHAR), CAST(completed_at AS VARCHAR)";

fn row_to_transaction(row: &Row) -> Result<Transaction> {
    let id: String = row.get(0)?;
    let from: Option<String> = row.get(1)?;
    let to: Option<String> = row.get(2)?;
    let tx_type: String = row.get(4)?;
    let status: String = row.get(5)?;
    let metadata: Option<String> = row.get(7)?;
    let completed_at: Option<String> = row.get(9)?;

    Ok(Transaction {
        id: parse_uuid(&id)?,
        from_account: from.map(|s| s.parse()).transpose()?,
        to_account: to.map(|s| s.parse()).transpose()?,
        amount: row.get(3)?,
        tx_type: tx_type.parse()?,
        status: status.parse()?,
        idempotency_key: row.get(6)?,
        metadata: match metadata {
            Some(m) => serde_json::from_str(&m)?,
            None => serde_json::Value::Null,
        },
        created_at: parse_ts(&row.get::<_, String>(8)?)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
    })
}

impl TransactionStore<DuckDbUnit> for DuckDbStore {
    fn insert_transaction(&self, unit: &mut DuckDbUnit, tx: &Transaction) -> Result<()> {
        unit.execute(
            "INSERT INTO ledger_transactions (transaction_id, from_account, to_account, amount,
                 tx_type, status, idempotency_key, metadata, created_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP))",
            params![
                tx.id.to_string(),
                tx.from_account.map(|a| a.to_string()),
                tx.to_account.map(|a| a.to_string()),
                tx.amount,
                tx.tx_type.as_str(),
                tx.status.as_str(),
                tx.idempotency_key,
                tx.metadata.to_string(),
                ts(tx.created_at),
                tx.completed_at.map(ts),
            ],
        )?;
        Ok(())
    }

    fn mark_completed(&self, unit: &mut DuckDbUnit, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let changed = unit.execute(
            "UPDATE ledger_transactions SET status = ?, completed_at = CAST(? AS TIMESTAMP)
             WHERE transaction_id = ? AND status = ?",
            params![
                TransactionStatus::Completed.as_str(),
                ts(at),
                id.to_string(),
                TransactionStatus::Pending.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::datastore(format!(
                "transaction {} is missing or not pending",
                id
            )));
        }
        Ok(())
    }

    fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        let conn = self.conn.lock();
        query_opt(
            &conn,
            &format!(
                "SELECT {} FROM ledger_transactions WHERE transaction_id = ?",
                TRANSACTION_COLUMNS
            ),
            params![id.to_string()],
            row_to_transaction,
        )
    }

    fn list_for_account(&self, account: &AccountId, limit: usize) -> Result<Vec<Transaction>> {
        let conn = self.conn.lock();
        let id = account.to_string();
        query_all(
            &conn,
            &format!(
                "SELECT {} FROM ledger_transactions
                 WHERE from_account = ? OR to_account = ?
                 ORDER BY created_at DESC, transaction_id DESC
                 LIMIT ?",
                TRANSACTION_COLUMNS
            ),
            params![id, id, sql_limit(limit)],
            row_to_transaction,
        )
    }
}

// === Point batches ===

const BATCH_COLUMNS: &str = "batch_id, account_id, original_amount, remaining_amount, source,
    source_ref, CAST(expires_at AS VARCHAR), CAST(created_at AS VARCHAR)";

fn row_to_batch(row: &Row) -> Result<PointBatch> {
    let id: String = row.get(0)?;
    let account: String = row.get(1)?;
    let source: String = row.get(4)?;
    let source_ref: Option<String> = row.get(5)?;

    Ok(PointBatch {
        id: parse_uuid(&id)?,
        account_id: account.parse()?,
        original_amount: row.get(2)?,
        remaining_amount: row.get(3)?,
        source: source.parse()?,
        source_ref: source_ref.as_deref().map(parse_uuid).transpose()?,
        expires_at: parse_ts(&row.get::<_, String>(6)?)?,
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
    })
}

impl PointBatchStore<DuckDbUnit> for DuckDbStore {
    fn insert_batch(&self, unit: &mut DuckDbUnit, batch: &PointBatch) -> Result<()> {
        unit.execute(
            "INSERT INTO point_batches (batch_id, account_id, original_amount, remaining_amount,
                 source, source_ref, expires_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP))",
            params![
                batch.id.to_string(),
                batch.account_id.to_string(),
                batch.original_amount,
                batch.remaining_amount,
                batch.source.as_str(),
                batch.source_ref.map(|r| r.to_string()),
                ts(batch.expires_at),
                ts(batch.created_at),
            ],
        )?;
        Ok(())
    }

    fn consumable_batches(
        &self,
        unit: &mut DuckDbUnit,
        account: &AccountId,
        now: DateTime<Utc>,
    ) -> Result<Vec<PointBatch>> {
        unit.query_all(
            &format!(
                "SELECT {} FROM point_batches
                 WHERE account_id = ? AND remaining_amount > 0
                   AND expires_at > CAST(? AS TIMESTAMP)
                 ORDER BY created_at, batch_id",
                BATCH_COLUMNS
            ),
            params![account.to_string(), ts(now)],
            row_to_batch,
        )
    }

    fn set_remaining(&self, unit: &mut DuckDbUnit, batch_id: Uuid, remaining: i64) -> Result<()> {
        let changed = unit.execute(
            "UPDATE point_batches SET remaining_amount = ?
             WHERE batch_id = ? AND remaining_amount >= ? AND ? >= 0",
            params![remaining, batch_id.to_string(), remaining, remaining],
        )?;
        if changed == 0 {
            return Err(LedgerError::datastore(format!(
                "batch {} is missing or its remaining amount would increase",
                batch_id
            )));
        }
        Ok(())
    }

    fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PointBatch>> {
        let conn = self.conn.lock();
        query_all(
            &conn,
            &format!(
                "SELECT {} FROM point_batches
                 WHERE expires_at < CAST(? AS TIMESTAMP) AND remaining_amount > 0
                 ORDER BY expires_at, batch_id
                 LIMIT ?",
                BATCH_COLUMNS
            ),
            params![ts(now), sql_limit(limit)],
            row_to_batch,
        )
    }

    fn expire_batches(
        &self,
        unit: &mut DuckDbUnit,
        ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Vec<PointBatch>> {
        let now = ts(now);
        let mut affected = Vec::new();
        for id in ids {
            let batch = unit.query_opt(
                &format!(
                    "SELECT {} FROM point_batches
                     WHERE batch_id = ? AND expires_at < CAST(? AS TIMESTAMP)
                       AND remaining_amount > 0",
                    BATCH_COLUMNS
                ),
                params![id.to_string(), now],
                row_to_batch,
            )?;
            if let Some(batch) = batch {
                unit.execute(
                    "UPDATE point_batches SET remaining_amount = 0 WHERE batch_id = ?",
                    params![id.to_string()],
                )?;
                affected.push(batch);
            }
        }
        Ok(affected)
    }

    fn batches_expiring_between(
        &self,
        account: &AccountId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PointBatch>> {
        let conn = self.conn.lock();
        query_all(
            &conn,
            &format!(
                "SELECT {} FROM point_batches
                 WHERE account_id = ? AND remaining_amount > 0
                   AND expires_at >= CAST(? AS TIMESTAMP)
                   AND expires_at < CAST(? AS TIMESTAMP)
                 ORDER BY expires_at, batch_id",
                BATCH_COLUMNS
            ),
            params![account.to_string(), ts(from), ts(until)],
            row_to_batch,
        )
    }
}

// === Idempotency keys ===

const KEY_COLUMNS: &str = "idempotency_key, account_id, transaction_id, status, request_hash,
    CAST(expires_at AS VARCHAR), CAST(created_at AS VARCHAR), CAST(updated_at AS VARCHAR), version";

fn row_to_key(row: &Row) -> Result<IdempotencyKey> {
    let account: String = row.get(1)?;
    let transaction_id: Option<String> = row.get(2)?;
    let status: String = row.get(3)?;

    Ok(IdempotencyKey {
        key: row.get(0)?,
        account_id: account.parse()?,
        transaction_id: transaction_id.as_deref().map(parse_uuid).transpose()?,
        status: status.parse()?,
        request_hash: row.get(4)?,
        expires_at: parse_ts(&row.get::<_, String>(5)?)?,
        created_at: parse_ts(&row.get::<_, String>(6)?)?,
        updated_at: parse_ts(&row.get::<_, String>(7)?)?,
        version: row.get(8)?,
    })
}

impl IdempotencyStore<DuckDbUnit> for DuckDbStore {
    fn get_key(&self, key: &str) -> Result<Option<IdempotencyKey>> {
        let conn = self.conn.lock();
        query_opt(
            &conn,
            &format!("SELECT {} FROM idempotency_keys WHERE idempotency_key = ?", KEY_COLUMNS),
            params![key],
            row_to_key,
        )
    }

    fn insert_key(&self, record: &IdempotencyKey) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO idempotency_keys (idempotency_key, account_id, transaction_id, status,
                 request_hash, expires_at, created_at, updated_at, version)
             VALUES (?, ?, ?, ?, ?, CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP),
                     CAST(? AS TIMESTAMP), ?)",
            params![
                record.key,
                record.account_id.to_string(),
                record.transaction_id.map(|t| t.to_string()),
                record.status.as_str(),
                record.request_hash,
                ts(record.expires_at),
                ts(record.created_at),
                ts(record.updated_at),
                record.version,
            ],
        )?;
        Ok(())
    }

    fn reclaim_key(&self, current: &IdempotencyKey, replacement: &IdempotencyKey) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE idempotency_keys
             SET account_id = ?, transaction_id = NULL, status = ?, request_hash = ?,
                 expires_at = CAST(? AS TIMESTAMP), created_at = CAST(? AS TIMESTAMP),
                 updated_at = CAST(? AS TIMESTAMP), version = version + 1
             WHERE idempotency_key = ? AND version = ?",
            params![
                replacement.account_id.to_string(),
                replacement.status.as_str(),
                replacement.request_hash,
                ts(replacement.expires_at),
                ts(replacement.created_at),
                ts(replacement.updated_at),
                current.key,
                current.version,
            ],
        )?;
        Ok(changed == 1)
    }

    fn complete_key(
        &self,
        unit: &mut DuckDbUnit,
        key: &str,
        transaction_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let changed = unit.execute(
            "UPDATE idempotency_keys
             SET status = ?, transaction_id = ?, updated_at = CAST(? AS TIMESTAMP),
                 version = version + 1
             WHERE idempotency_key = ?",
            params![
                KeyStatus::Completed.as_str(),
                transaction_id.to_string(),
                ts(at),
                key,
            ],
        )?;
        expect_one(changed, || format!("idempotency key {}", key))
    }

    fn fail_key(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE idempotency_keys
             SET status = ?, updated_at = CAST(? AS TIMESTAMP), version = version + 1
             WHERE idempotency_key = ? AND status <> ?",
            params![
                KeyStatus::Failed.as_str(),
                ts(at),
                key,
                KeyStatus::Completed.as_str(),
            ],
        )?;
        Ok(())
    }

    fn purge_expired_keys(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM idempotency_keys
             WHERE expires_at <= CAST(? AS TIMESTAMP) AND status = ?",
            params![ts(now), KeyStatus::Failed.as_str()],
        )?;
        Ok(deleted)
    }
}

/// Policy source layering `sys_settings` rows over a base policy
pub struct SettingsPolicy {
    base: LedgerPolicy,
    store: Arc<DuckDbStore>,
}

impl SettingsPolicy {
    pub fn new(base: LedgerPolicy, store: Arc<DuckDbStore>) -> Self {
        Self { base, store }
    }
}

impl PolicySource for SettingsPolicy {
    fn resolve(&self) -> Result<LedgerPolicy> {
        let mut policy = self.base.clone();
        for (key, value) in self.store.get_settings()? {
            policy.apply_override(&key, &value)?;
        }
        Ok(policy)
    }
}

// Helper functions

/// `LIMIT` argument; anything past `i64::MAX` means no limit
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn query_all<T>(
    conn: &Connection,
    sql: &str,
    params: impl Params,
    map: impl Fn(&Row) -> Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(map(row)?);
    }
    Ok(out)
}

fn query_opt<T>(
    conn: &Connection,
    sql: &str,
    params: impl Params,
    map: impl Fn(&Row) -> Result<T>,
) -> Result<Option<T>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(map(row)?)),
        None => Ok(None),
    }
}

fn expect_one(changed: usize, what: impl FnOnce() -> String) -> Result<()> {
    if changed == 0 {
        Err(LedgerError::not_found(what()))
    } else {
        Ok(())
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.format(TS_WRITE_FORMAT).to_string()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TS_READ_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| LedgerError::datastore(format!("invalid timestamp {:?}: {}", s, e)))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| LedgerError::datastore(format!("invalid id {:?}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn store() -> DuckDbStore {
        let store = DuckDbStore::open_in_memory().unwrap();
        store.ensure_schema().unwrap();
        store
    }

    #[test]
    fn test_timestamp_round_trip_keeps_microseconds() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap()
            + ChronoDuration::microseconds(123_456);
        assert_eq!(parse_ts(&ts(at)).unwrap(), at);
        // DuckDB prints whole seconds without a fraction
        assert!(parse_ts("2024-03-01 12:30:05").is_ok());
    }

    #[test]
    fn test_retryable_error_detection() {
        assert!(is_retryable_error("IO Error: Could not set lock on file"));
        assert!(is_retryable_error("database is locked"));
        assert!(!is_retryable_error("Constraint Error: duplicate key"));
    }

    #[test]
    fn test_duplicate_insert_maps_to_key_conflict() {
        let store = store();
        let account = Account::new(AccountId::new(), "Alice");
        store.insert_account(&account).unwrap();
        let err = store.insert_account(&account).unwrap_err();
        assert!(matches!(err, LedgerError::KeyConflict(_)), "got {:?}", err);
    }

    #[test]
    fn test_dropped_unit_rolls_back() {
        let store = store();
        let account = Account::new(AccountId::new(), "Alice");
        store.insert_account(&account).unwrap();

        {
            let mut unit = store
                .begin(&CancellationToken::new(), Duration::from_millis(200))
                .unwrap();
            store.lock_account(&mut unit, &account.id).unwrap();
            store.write_balance(&mut unit, &account.id, 50, Utc::now()).unwrap();
        }

        assert_eq!(store.get_account(&account.id).unwrap().unwrap().balance, 0);
    }

    #[test]
    fn test_failed_statement_marks_unit_aborted() {
        let store = store();
        let mut unit = store
            .begin(&CancellationToken::new(), Duration::from_millis(200))
            .unwrap();
        let now = Utc::now();
        let mut batch = PointBatch::issue(
            AccountId::new(),
            5,
            crate::domain::BatchSource::Bonus,
            None,
            now + ChronoDuration::days(1),
            now,
        );
        store.insert_batch(&mut unit, &batch).unwrap();
        assert!(!unit.is_aborted());

        // Violates the original_amount CHECK
        batch.id = Uuid::new_v4();
        batch.original_amount = 0;
        batch.remaining_amount = 0;
        assert!(store.insert_batch(&mut unit, &batch).is_err());
        assert!(unit.is_aborted());
        unit.rollback().unwrap();
    }

    #[test]
    fn test_settings_policy_overrides_base() {
        let store = Arc::new(store());
        store.set_setting("batch_ttl_days.bonus", "7").unwrap();
        store.set_setting("bonus_enabled", "false").unwrap();

        let policy = SettingsPolicy::new(LedgerPolicy::default(), Arc::clone(&store))
            .resolve()
            .unwrap();
        assert_eq!(policy.batch_ttl_days.bonus, 7);
        assert!(!policy.bonus_enabled);

        store.set_setting("lock_timeout_ms", "soon").unwrap();
        let err = SettingsPolicy::new(LedgerPolicy::default(), store).resolve().unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
    }

    #[test]
    fn test_sql_limit_saturates() {
        assert_eq!(sql_limit(25), 25);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }
}
