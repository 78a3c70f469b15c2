//! Concurrent ledger access against a DuckDB file
//!
//! Same workloads as the in-memory stress tests, but through the DuckDB
//! store: every unit runs on its own cloned connection and opens its SQL
//! transaction only after taking its row locks.
//!
//! Run with: cargo test --test duckdb_concurrent_test -- --nocapture

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use pointbank_core::adapters::DuckDbStore;
use pointbank_core::domain::{AccountId, LedgerError, LedgerPolicy};
use pointbank_core::services::LedgerService;
use pointbank_core::PointbankContext;

const THREAD_COUNT: usize = 8;

/// Fewer than the in-memory runs; every commit hits the file
const ITERATIONS_PER_THREAD: usize = 20;

const ACCOUNT_COUNT: usize = 4;
const OPENING_BALANCE: i64 = 1_000;

struct Harness {
    _dir: TempDir,
    ctx: PointbankContext,
    ledger: Arc<LedgerService<DuckDbStore>>,
    accounts: Vec<AccountId>,
}

fn setup() -> Harness {
    let dir = TempDir::new().unwrap();
    let ctx = PointbankContext::new(dir.path()).unwrap();
    let ledger = Arc::new(LedgerService::with_store(
        Arc::clone(&ctx.store),
        Arc::new(LedgerPolicy::default()),
    ));
    let cancel = CancellationToken::new();
    let admin = AccountId::new();

    let accounts = (0..ACCOUNT_COUNT)
        .map(|i| {
            let id = ledger.create_account(None, &format!("Account {}", i)).unwrap().id;
            ledger
                .grant_points(admin, id, OPENING_BALANCE, &format!("seed-{}", i), "", &cancel)
                .unwrap();
            id
        })
        .collect();

    Harness {
        _dir: dir,
        ctx,
        ledger,
        accounts,
    }
}

impl Harness {
    fn total_balance(&self) -> i64 {
        self.accounts
            .iter()
            .map(|id| self.ledger.get_balance(id).unwrap())
            .sum()
    }
}

#[test]
fn test_opposing_transfers_on_duckdb() {
    let harness = setup();
    let accounts = Arc::new(harness.accounts.clone());
    let barrier = Arc::new(Barrier::new(THREAD_COUNT));
    let success_count = Arc::new(AtomicUsize::new(0));
    let insufficient_count = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = vec![];

    for thread_id in 0..THREAD_COUNT {
        let ledger = Arc::clone(&harness.ledger);
        let accounts = Arc::clone(&accounts);
        let barrier = Arc::clone(&barrier);
        let success_count = Arc::clone(&success_count);
        let insufficient_count = Arc::clone(&insufficient_count);

        handles.push(thread::spawn(move || {
            let cancel = CancellationToken::new();
            barrier.wait();

            for i in 0..ITERATIONS_PER_THREAD {
                let a = accounts[(thread_id + i) % ACCOUNT_COUNT];
                let b = accounts[(thread_id + i + 1) % ACCOUNT_COUNT];
                let (from, to) = if thread_id % 2 == 0 { (a, b) } else { (b, a) };
                let amount = 1 + ((thread_id * 31 + i * 17) % 120) as i64;
                let key = format!("t{}-i{}", thread_id, i);

                match ledger.transfer(from, to, amount, &key, "", &cancel) {
                    Ok(_) => {
                        success_count.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(LedgerError::InsufficientBalance { .. }) => {
                        insufficient_count.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => panic!("thread {} iteration {}: {}", thread_id, i, e),
                }
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
    let elapsed = start.elapsed();

    println!(
        "{} transfers committed, {} refused for balance, in {:?}",
        success_count.load(Ordering::SeqCst),
        insufficient_count.load(Ordering::SeqCst),
        elapsed
    );

    assert_eq!(
        success_count.load(Ordering::SeqCst) + insufficient_count.load(Ordering::SeqCst),
        THREAD_COUNT * ITERATIONS_PER_THREAD
    );
    assert_eq!(harness.total_balance(), OPENING_BALANCE * ACCOUNT_COUNT as i64);
    for id in &harness.accounts {
        assert!(harness.ledger.get_balance(id).unwrap() >= 0);
    }

    // Balances, log and batches still reconcile
    let doctor = harness.ctx.doctor_service.run_checks().unwrap();
    assert!(doctor.is_healthy(), "{:?}", doctor.checks);
    assert!(elapsed < Duration::from_secs(60), "transfers took {:?}", elapsed);
}

#[test]
fn test_same_key_executes_once_on_duckdb() {
    let harness = setup();
    let (from, to) = (harness.accounts[0], harness.accounts[1]);
    let barrier = Arc::new(Barrier::new(THREAD_COUNT));
    let executed = Arc::new(AtomicUsize::new(0));
    let replayed = Arc::new(AtomicUsize::new(0));
    let in_progress = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|_| {
            let ledger = Arc::clone(&harness.ledger);
            let barrier = Arc::clone(&barrier);
            let executed = Arc::clone(&executed);
            let replayed = Arc::clone(&replayed);
            let in_progress = Arc::clone(&in_progress);

            thread::spawn(move || {
                let cancel = CancellationToken::new();
                barrier.wait();
                match ledger.transfer(from, to, 250, "shared-key", "", &cancel) {
                    Ok(outcome) if outcome.replayed => {
                        replayed.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(_) => {
                        executed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(LedgerError::DuplicateInProgress(_)) => {
                        in_progress.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => panic!("unexpected error: {}", e),
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(executed.load(Ordering::SeqCst), 1);
    assert_eq!(
        replayed.load(Ordering::SeqCst) + in_progress.load(Ordering::SeqCst),
        THREAD_COUNT - 1
    );
    assert_eq!(harness.ledger.get_balance(&from).unwrap(), OPENING_BALANCE - 250);
    assert_eq!(harness.ledger.get_balance(&to).unwrap(), OPENING_BALANCE + 250);
    assert_eq!(harness.total_balance(), OPENING_BALANCE * ACCOUNT_COUNT as i64);

    // A later retry replays the one committed transfer
    let retry = harness
        .ledger
        .transfer(from, to, 250, "shared-key", "", &CancellationToken::new())
        .unwrap();
    assert!(retry.replayed);
}

#[test]
fn test_racing_debits_never_overdraw_on_duckdb() {
    let harness = setup();
    let target = harness.accounts[0];
    let barrier = Arc::new(Barrier::new(THREAD_COUNT));
    let charged = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|thread_id| {
            let ledger = Arc::clone(&harness.ledger);
            let barrier = Arc::clone(&barrier);
            let charged = Arc::clone(&charged);

            thread::spawn(move || {
                let cancel = CancellationToken::new();
                barrier.wait();
                match ledger.consume_for_exchange(target, 300, &format!("order-{}", thread_id), &cancel) {
                    Ok(_) => {
                        charged.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(LedgerError::InsufficientBalance { .. }) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(charged.load(Ordering::SeqCst), 3);
    assert_eq!(harness.ledger.get_balance(&target).unwrap(), OPENING_BALANCE - 900);
}
