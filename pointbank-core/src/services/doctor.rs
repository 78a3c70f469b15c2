//! Doctor service - books consistency checks

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::adapters::DuckDbStore;
use crate::domain::Result;

/// Doctor service for health checks
pub struct DoctorService {
    store: Arc<DuckDbStore>,
}

impl DoctorService {
    pub fn new(store: Arc<DuckDbStore>) -> Self {
        Self { store }
    }

    /// Run all health checks
    pub fn run_checks(&self) -> Result<DoctorResult> {
        let mut checks = BTreeMap::new();
        let now = Utc::now();

        let negative = self.store.check_negative_balances()?;
        checks.insert(
            "negative_balances".to_string(),
            CheckResult::from_findings(
                "error",
                "No account has a negative balance".to_string(),
                format!("{} account(s) have a negative balance", negative.len()),
                negative
                    .iter()
                    .map(|(id, balance)| json!({"account_id": id, "balance": balance}))
                    .collect(),
            ),
        );

        let out_of_bounds = self.store.check_batch_bounds()?;
        checks.insert(
            "batch_bounds".to_string(),
            CheckResult::from_findings(
                "error",
                "All batches have 0 <= remaining <= original".to_string(),
                format!("{} batch(es) have an out-of-range remaining amount", out_of_bounds.len()),
                out_of_bounds.iter().map(|id| json!({"batch_id": id})).collect(),
            ),
        );

        let drift = self.store.check_ledger_reconciliation()?;
        checks.insert(
            "ledger_reconciliation".to_string(),
            CheckResult::from_findings(
                "error",
                "Every balance matches its completed transactions".to_string(),
                format!("{} account(s) disagree with the transaction log", drift.len()),
                drift
                    .iter()
                    .map(|(id, balance, net)| {
                        json!({"account_id": id, "balance": balance, "ledger_net": net})
                    })
                    .collect(),
            ),
        );

        let orphans = self.store.check_orphaned_batches()?;
        checks.insert(
            "orphaned_batches".to_string(),
            CheckResult::from_findings(
                "warning",
                "No batch references a missing account".to_string(),
                format!("{} batch(es) reference missing accounts", orphans.len()),
                orphans.iter().map(|id| json!({"batch_id": id})).collect(),
            ),
        );

        let stale = self.store.check_stale_processing_keys(now)?;
        checks.insert(
            "stale_processing_keys".to_string(),
            CheckResult::from_findings(
                "warning",
                "No expired idempotency key is stuck in processing".to_string(),
                format!("{} expired key(s) are still processing", stale.len()),
                stale.iter().map(|key| json!({"key": key})).collect(),
            ),
        );

        let pending = self.store.check_pending_transactions()?;
        checks.insert(
            "pending_transactions".to_string(),
            CheckResult::from_findings(
                "error",
                "No transaction was committed in pending state".to_string(),
                format!("{} transaction(s) are stuck in pending", pending.len()),
                pending.iter().map(|id| json!({"transaction_id": id})).collect(),
            ),
        );

        let unapplied = self.store.pending_migrations()?;
        checks.insert(
            "schema".to_string(),
            CheckResult::from_findings(
                "error",
                "Schema is up to date".to_string(),
                format!("{} migration(s) have not been applied", unapplied.len()),
                unapplied.iter().map(|name| json!({"migration": name})).collect(),
            ),
        );

        let passed = checks.values().filter(|c| c.status == "pass").count() as i64;
        let warnings = checks.values().filter(|c| c.status == "warning").count() as i64;
        let errors = checks.values().filter(|c| c.status == "error").count() as i64;

        Ok(DoctorResult {
            checks,
            summary: DoctorSummary {
                passed,
                warnings,
                errors,
            },
        })
    }
}

#[derive(Debug, Serialize)]
pub struct DoctorResult {
    pub checks: BTreeMap<String, CheckResult>,
    pub summary: DoctorSummary,
}

impl DoctorResult {
    pub fn is_healthy(&self) -> bool {
        self.summary.errors == 0
    }
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<serde_json::Value>>,
}

impl CheckResult {
    /// "pass" when there are no findings, `severity` otherwise
    fn from_findings(
        severity: &str,
        pass_message: String,
        fail_message: String,
        findings: Vec<serde_json::Value>,
    ) -> Self {
        if findings.is_empty() {
            Self {
                status: "pass".to_string(),
                message: pass_message,
                details: None,
            }
        } else {
            Self {
                status: severity.to_string(),
                message: fail_message,
                details: Some(findings),
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DoctorSummary {
    pub passed: i64,
    pub warnings: i64,
    pub errors: i64,
}
