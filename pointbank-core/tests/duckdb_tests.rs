//! Integration tests against a DuckDB file
//!
//! Run with: cargo test --test duckdb_tests

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use pointbank_core::domain::{BatchSource, LedgerError, PointBatch, TransactionType};
use pointbank_core::ports::{AtomicExecutor, PointBatchStore, UnitOfWork};
use pointbank_core::{AccountId, BonusOutcome, CancellationToken, PointbankContext};

fn open(dir: &TempDir) -> PointbankContext {
    PointbankContext::new(dir.path()).unwrap()
}

/// Create an account funded through an admin grant
fn funded(ctx: &PointbankContext, name: &str, balance: i64) -> AccountId {
    let account = ctx.ledger.create_account(None, name).unwrap();
    if balance > 0 {
        ctx.ledger
            .grant_points(
                AccountId::new(),
                account.id,
                balance,
                &format!("seed:{}", account.id),
                "opening balance",
                &CancellationToken::new(),
            )
            .unwrap();
    }
    account.id
}

#[test]
fn test_ledger_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let (a, b, tx_id) = {
        let ctx = open(&dir);
        let a = funded(&ctx, "Alice", 1000);
        let b = funded(&ctx, "Bob", 0);
        let outcome = ctx.ledger.transfer(a, b, 300, "k1", "lunch", &cancel).unwrap();
        assert_eq!(outcome.from.balance, 700);
        assert_eq!(outcome.to.balance, 300);
        (a, b, outcome.transaction.id)
    };

    let ctx = open(&dir);
    assert_eq!(ctx.ledger.get_balance(&a).unwrap(), 700);
    assert_eq!(ctx.ledger.get_balance(&b).unwrap(), 300);

    let replay = ctx.ledger.transfer(a, b, 300, "k1", "lunch", &cancel).unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.transaction.id, tx_id);
    assert_eq!(ctx.ledger.get_balance(&a).unwrap(), 700);

    let tx = ctx.ledger.get_transaction(tx_id).unwrap();
    assert_eq!(tx.tx_type, TransactionType::Transfer);
    assert_eq!(tx.metadata["description"], "lunch");
    assert!(tx.completed_at.is_some());
}

#[test]
fn test_failed_operation_leaves_no_rows() {
    let dir = TempDir::new().unwrap();
    let ctx = open(&dir);
    let cancel = CancellationToken::new();
    let a = funded(&ctx, "Alice", 100);
    let b = funded(&ctx, "Bob", 0);

    let err = ctx.ledger.transfer(a, b, 500, "k1", "", &cancel).unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
    assert_eq!(ctx.ledger.account_history(&b, 10).unwrap().len(), 0);
    assert_eq!(ctx.ledger.get_balance(&a).unwrap(), 100);

    // Failed keys can be retried with the same request
    let err = ctx.ledger.transfer(a, b, 500, "k1", "", &cancel).unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
}

#[test]
fn test_exchange_and_fifo_consumption() {
    let dir = TempDir::new().unwrap();
    let ctx = open(&dir);
    let cancel = CancellationToken::new();
    let admin = AccountId::new();
    let a = funded(&ctx, "Alice", 0);
    ctx.ledger.grant_points(admin, a, 5, "g1", "", &cancel).unwrap();
    ctx.ledger.grant_points(admin, a, 10, "g2", "", &cancel).unwrap();

    let outcome = ctx.ledger.consume_for_exchange(a, 7, "order-1", &cancel).unwrap();
    assert_eq!(outcome.account.balance, 8);
    let report = outcome.consumption.unwrap();
    assert_eq!(report.consumed, 7);
    assert_eq!(report.touched.len(), 2);
    assert_eq!(report.touched[0].1, 5);
    assert_eq!(report.touched[1].1, 2);

    let replay = ctx.ledger.consume_for_exchange(a, 7, "order-1", &cancel).unwrap();
    assert!(replay.replayed);
    assert_eq!(ctx.ledger.get_balance(&a).unwrap(), 8);

    let expiring = ctx.ledger.get_expiring_points(&a, Some(Duration::days(400))).unwrap();
    let amounts: Vec<i64> = expiring.iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![8]);
}

#[test]
fn test_settings_override_policy() {
    let dir = TempDir::new().unwrap();
    let ctx = open(&dir);
    let cancel = CancellationToken::new();
    let a = funded(&ctx, "Alice", 0);

    ctx.store.set_setting("bonus_enabled", "false").unwrap();
    let outcome = ctx.ledger.grant_bonus(a, 10, "daily", &cancel).unwrap();
    assert!(matches!(outcome, BonusOutcome::NoOp));

    ctx.store.delete_setting("bonus_enabled").unwrap();
    ctx.store.set_setting("max_bonus_amount", "20").unwrap();
    let err = ctx.ledger.grant_bonus(a, 25, "daily", &cancel).unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
    let outcome = ctx.ledger.grant_bonus(a, 20, "daily", &cancel).unwrap();
    assert!(matches!(outcome, BonusOutcome::Granted { .. }));

    ctx.store.set_setting("lock_timeout_ms", "soon").unwrap();
    let err = ctx.ledger.grant_bonus(a, 5, "daily", &cancel).unwrap_err();
    assert!(matches!(err, LedgerError::Config(_)));
}

#[test]
fn test_sweep_with_deduction() {
    let dir = TempDir::new().unwrap();
    let ctx = open(&dir);
    let cancel = CancellationToken::new();
    let a = funded(&ctx, "Alice", 80);
    let now = Utc::now();

    {
        let mut unit = ctx.store.begin(&cancel, StdDuration::from_secs(1)).unwrap();
        let expired = PointBatch::issue(
            a,
            50,
            BatchSource::Bonus,
            None,
            now - Duration::hours(1),
            now - Duration::days(30),
        );
        ctx.store.insert_batch(&mut unit, &expired).unwrap();
        unit.commit().unwrap();
    }

    ctx.store.set_setting("deduct_on_expiry", "true").unwrap();
    let report = ctx.ledger.sweep_expired_batches(now, 100, &cancel).unwrap();
    assert_eq!(report.batches_expired, 1);
    assert_eq!(report.points_expired, 50);
    assert_eq!(report.points_deducted, 50);
    assert_eq!(ctx.ledger.get_balance(&a).unwrap(), 30);

    let history = ctx.ledger.account_history(&a, 5).unwrap();
    assert_eq!(history[0].tx_type, TransactionType::PointsExpiry);
}

#[test]
fn test_doctor_and_status() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    {
        let ctx = open(&dir);
        let a = funded(&ctx, "Alice", 500);
        let b = funded(&ctx, "Bob", 0);
        ctx.ledger.transfer(a, b, 120, "t1", "", &cancel).unwrap();
        ctx.ledger.set_account_active(b, false, &cancel).unwrap();

        let doctor = ctx.doctor_service.run_checks().unwrap();
        assert!(doctor.is_healthy(), "{:?}", doctor.checks);
        assert_eq!(doctor.checks["ledger_reconciliation"].status, "pass");

        let status = ctx.status_service.get_status().unwrap();
        assert_eq!(status.total_accounts, 2);
        assert_eq!(status.active_accounts, 1);
        assert_eq!(status.total_points, 500);
        assert_eq!(status.total_transactions, 2);
        assert_eq!(status.transactions_by_type["transfer"], 1);
        assert_eq!(status.outstanding_batch_points, 500);
        assert_eq!(status.keys_by_status["completed"], 2);
    }

    // Tamper with a balance behind the ledger's back
    {
        let conn = duckdb::Connection::open(dir.path().join("pointbank.duckdb")).unwrap();
        conn.execute_batch("UPDATE accounts SET balance = balance + 5").unwrap();
    }

    let ctx = open(&dir);
    let doctor = ctx.doctor_service.run_checks().unwrap();
    assert!(!doctor.is_healthy());
    assert_eq!(doctor.checks["ledger_reconciliation"].status, "error");
    assert_eq!(
        doctor.checks["ledger_reconciliation"].details.as_ref().map(Vec::len),
        Some(2)
    );
}

#[test]
fn test_lock_timeout_from_settings() {
    let dir = TempDir::new().unwrap();
    let ctx = open(&dir);
    let cancel = CancellationToken::new();
    let a = funded(&ctx, "Alice", 100);
    let b = funded(&ctx, "Bob", 0);
    ctx.store.set_setting("lock_timeout_ms", "50").unwrap();

    // Hold Alice's row lock from a separate unit
    let mut holder = ctx.store.begin(&cancel, StdDuration::from_secs(1)).unwrap();
    pointbank_core::ports::AccountStore::lock_account(ctx.store.as_ref(), &mut holder, &a).unwrap();

    let err = ctx.ledger.transfer(a, b, 10, "k1", "", &cancel).unwrap_err();
    assert!(matches!(err, LedgerError::LockTimeout(_)));
    assert!(err.is_retryable());
    holder.rollback().unwrap();

    let outcome = ctx.ledger.transfer(a, b, 10, "k1", "", &cancel).unwrap();
    assert_eq!(outcome.from.balance, 90);
}

#[test]
fn test_completed_key_outlives_its_lifetime() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let (a, b, tx_id) = {
        let ctx = open(&dir);
        let a = funded(&ctx, "Alice", 1000);
        let b = funded(&ctx, "Bob", 0);
        let outcome = ctx.ledger.transfer(a, b, 300, "k1", "", &cancel).unwrap();
        (a, b, outcome.transaction.id)
    };

    // Age every key past its expiry
    {
        let conn = duckdb::Connection::open(dir.path().join("pointbank.duckdb")).unwrap();
        conn.execute_batch("UPDATE idempotency_keys SET expires_at = TIMESTAMP '2000-01-01 00:00:00'")
            .unwrap();
    }

    let ctx = open(&dir);
    let replay = ctx.ledger.transfer(a, b, 300, "k1", "", &cancel).unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.transaction.id, tx_id);
    assert_eq!(ctx.ledger.get_balance(&a).unwrap(), 700);
    assert_eq!(ctx.ledger.get_balance(&b).unwrap(), 300);

    assert_eq!(ctx.ledger.purge_expired_keys(Utc::now()).unwrap(), 0);
    let replay = ctx.ledger.transfer(a, b, 300, "k1", "", &cancel).unwrap();
    assert_eq!(replay.transaction.id, tx_id);
}

#[test]
fn test_out_of_range_setting_is_rejected_without_claiming_key() {
    let dir = TempDir::new().unwrap();
    let ctx = open(&dir);
    let cancel = CancellationToken::new();
    let a = funded(&ctx, "Alice", 0);

    ctx.store
        .set_setting("batch_ttl_days.admin_grant", "100000000")
        .unwrap();
    let err = ctx
        .ledger
        .grant_points(AccountId::new(), a, 10, "g1", "", &cancel)
        .unwrap_err();
    assert!(matches!(err, LedgerError::Config(_)));
    assert!(ctx.store.key_counts_by_status().unwrap().is_empty());

    ctx.store.delete_setting("batch_ttl_days.admin_grant").unwrap();
    let outcome = ctx
        .ledger
        .grant_points(AccountId::new(), a, 10, "g1", "", &cancel)
        .unwrap();
    assert!(!outcome.replayed);
    assert_eq!(outcome.account.balance, 10);
}

#[test]
fn test_batch_statement_failure_fails_whole_operation() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let admin = AccountId::new();

    let a = {
        let ctx = open(&dir);
        funded(&ctx, "Alice", 100)
    };

    // Swap in a batch table that refuses admin grants
    let db = dir.path().join("pointbank.duckdb");
    {
        let conn = duckdb::Connection::open(&db).unwrap();
        conn.execute_batch(
            "ALTER TABLE point_batches RENAME TO point_batches_kept;
             CREATE TABLE point_batches (
                 batch_id VARCHAR PRIMARY KEY,
                 account_id VARCHAR NOT NULL,
                 original_amount BIGINT NOT NULL,
                 remaining_amount BIGINT NOT NULL,
                 source VARCHAR NOT NULL CHECK (source <> 'admin_grant'),
                 source_ref VARCHAR,
                 expires_at TIMESTAMP NOT NULL,
                 created_at TIMESTAMP NOT NULL
             );",
        )
        .unwrap();
    }

    {
        let ctx = open(&dir);
        let err = ctx
            .ledger
            .grant_points(admin, a, 50, "g2", "", &cancel)
            .unwrap_err();
        assert!(matches!(err, LedgerError::CommitFailure(_)));
        assert!(err.is_retryable());
        assert_eq!(ctx.ledger.get_balance(&a).unwrap(), 100);
        assert_eq!(ctx.ledger.account_history(&a, 10).unwrap().len(), 1);
        assert_eq!(
            ctx.store.key_counts_by_status().unwrap(),
            vec![("completed".to_string(), 1), ("failed".to_string(), 1)]
        );
    }

    {
        let conn = duckdb::Connection::open(&db).unwrap();
        conn.execute_batch(
            "DROP TABLE point_batches;
             ALTER TABLE point_batches_kept RENAME TO point_batches;",
        )
        .unwrap();
    }

    let ctx = open(&dir);
    let outcome = ctx.ledger.grant_points(admin, a, 50, "g2", "", &cancel).unwrap();
    assert!(!outcome.replayed);
    assert_eq!(outcome.account.balance, 150);
    let batches = ctx.ledger.get_expiring_points(&a, Some(Duration::days(400))).unwrap();
    assert_eq!(batches.iter().map(|b| b.amount).sum::<i64>(), 150);
}

#[test]
fn test_missing_batches_do_not_block_spending() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let a = {
        let ctx = open(&dir);
        funded(&ctx, "Alice", 100)
    };
    {
        let conn = duckdb::Connection::open(dir.path().join("pointbank.duckdb")).unwrap();
        conn.execute_batch("DELETE FROM point_batches").unwrap();
    }

    let ctx = open(&dir);
    let outcome = ctx.ledger.consume_for_exchange(a, 40, "order-1", &cancel).unwrap();
    assert_eq!(outcome.account.balance, 60);
    let consumption = outcome.consumption.unwrap();
    assert_eq!(consumption.consumed, 0);
    assert_eq!(consumption.shortfall, 40);
}
