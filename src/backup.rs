//! Balance backups
//!
//! Point-in-time copies of every principal's live balances, kept in the
//! ledger database so an operator can undo a bad merge, a faulty oracle run
//! or a manual edit.
//!
//! - `create` snapshots the whole population in one transaction
//! - `restore` writes backed-up balances back onto the records that still
//!   exist, restarting accrual at the restore time. A fresh `pre_restore`
//!   backup is taken first, so a restore can itself be undone.
//! - `cleanup` drops backups older than the retention window
//!
//! Merges take a `pre_merge` backup automatically.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::accrual::{compute_balances, find_defects};
use crate::error::{EngineError, Result};
use crate::locks::IdentityLocks;
use crate::principal::{Principal, Timestamp};
use crate::store::LedgerStore;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Manual,
    PreMerge,
    PreRestore,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::PreMerge => "pre_merge",
            BackupKind::PreRestore => "pre_restore",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(BackupKind::Manual),
            "pre_merge" => Ok(BackupKind::PreMerge),
            "pre_restore" => Ok(BackupKind::PreRestore),
            other => Err(EngineError::Internal(format!("unknown backup kind '{}'", other))),
        }
    }
}

/// Backup header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub backup_id: String,
    pub created_at: Timestamp,
    pub kind: BackupKind,
    pub label: Option<String>,
    pub principal_count: usize,
}

/// One principal's balances as evaluated at backup time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub identity: String,
    pub spendable_balance: f64,
    pub cumulative_balance: f64,
    pub total_spent: f64,
    /// Informational; the live rate always comes from the oracle
    pub total_rate_per_hour: f64,
    pub is_verified: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub dry_run: bool,
    /// Records written (or that would be written on a dry run)
    pub restored: usize,
    /// Backed-up identities with no record any more
    pub missing: Vec<String>,
    /// Backed-up values that would break a balance invariant
    pub rejected: Vec<String>,
    pub restored_spendable: f64,
    /// Backup of the state the restore replaced
    pub safety_backup_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub cutoff: Timestamp,
    pub dry_run: bool,
    pub backups_deleted: usize,
    pub records_deleted: usize,
}

pub struct BackupManager {
    store: Arc<dyn LedgerStore>,
    locks: Arc<IdentityLocks>,
    balance_cap: f64,
}

impl BackupManager {
    pub fn new(store: Arc<dyn LedgerStore>, locks: Arc<IdentityLocks>, balance_cap: f64) -> Self {
        Self {
            store,
            locks,
            balance_cap,
        }
    }

    /// Snapshot live balances of every principal at `now`.
    pub fn create(&self, kind: BackupKind, label: Option<String>, now: Timestamp) -> Result<BackupInfo> {
        let records: Vec<BackupRecord> = self
            .store
            .list()?
            .iter()
            .map(|p| self.record_of(p, now))
            .collect();

        let info = BackupInfo {
            backup_id: Uuid::new_v4().to_string(),
            created_at: now,
            kind,
            label,
            principal_count: records.len(),
        };
        self.store.insert_backup(&info, &records)?;

        info!(
            backup_id = %info.backup_id,
            kind = %info.kind,
            principals = info.principal_count,
            "Balance backup created"
        );
        Ok(info)
    }

    fn record_of(&self, p: &Principal, now: Timestamp) -> BackupRecord {
        let live = compute_balances(p, now, self.balance_cap);
        BackupRecord {
            identity: p.identity.clone(),
            spendable_balance: live.spendable,
            cumulative_balance: live.cumulative,
            total_spent: p.total_spent,
            total_rate_per_hour: p.total_rate_per_hour,
            is_verified: p.is_verified,
        }
    }

    /// Newest first.
    pub fn list(&self) -> Result<Vec<BackupInfo>> {
        self.store.list_backups()
    }

    pub fn records(&self, backup_id: &str) -> Result<Vec<BackupRecord>> {
        self.require(backup_id)?;
        self.store.backup_records(backup_id)
    }

    fn require(&self, backup_id: &str) -> Result<BackupInfo> {
        self.store
            .get_backup(backup_id)?
            .ok_or_else(|| EngineError::NotFound(format!("backup {}", backup_id)))
    }

    /// Write backed-up balances back. `only` limits the restore to those
    /// identities; empty means everyone in the backup.
    pub async fn restore(
        &self,
        backup_id: &str,
        only: &[String],
        dry_run: bool,
        now: Timestamp,
    ) -> Result<RestoreReport> {
        let info = self.require(backup_id)?;
        let records: Vec<BackupRecord> = self
            .store
            .backup_records(backup_id)?
            .into_iter()
            .filter(|r| only.is_empty() || only.contains(&r.identity))
            .collect();

        let mut report = RestoreReport {
            backup_id: info.backup_id.clone(),
            dry_run,
            ..Default::default()
        };

        if !dry_run {
            let safety = self.create(
                BackupKind::PreRestore,
                Some(format!("before restoring {}", info.backup_id)),
                now,
            )?;
            report.safety_backup_id = Some(safety.backup_id);
        }

        let identities: Vec<String> = records.iter().map(|r| r.identity.clone()).collect();
        let _guards = self.locks.lock_many(&identities).await;

        let mut writes = Vec::with_capacity(records.len());
        for record in &records {
            let Some(current) = self.store.get(&record.identity)? else {
                report.missing.push(record.identity.clone());
                continue;
            };

            let restored = restored_from(&current, record, now);
            if let Some(defect) = find_defects(&restored, self.balance_cap).first() {
                warn!(identity = %record.identity, %defect, "Backed-up balances rejected");
                report.rejected.push(record.identity.clone());
                continue;
            }
            report.restored_spendable += restored.spendable_balance;
            writes.push(restored);
        }

        report.restored = writes.len();
        if !dry_run && !writes.is_empty() {
            self.store.update_many(&writes)?;
        }

        info!(
            backup_id = %report.backup_id,
            dry_run,
            restored = report.restored,
            missing = report.missing.len(),
            rejected = report.rejected.len(),
            "Balance backup restore finished"
        );
        Ok(report)
    }

    /// Delete backups older than `keep_days`.
    pub fn cleanup(&self, keep_days: u32, dry_run: bool, now: Timestamp) -> Result<CleanupReport> {
        let cutoff = now.saturating_sub(i64::from(keep_days) * MILLIS_PER_DAY);
        let mut report = CleanupReport {
            cutoff,
            dry_run,
            ..Default::default()
        };

        if dry_run {
            let stale: Vec<BackupInfo> = self
                .store
                .list_backups()?
                .into_iter()
                .filter(|b| b.created_at < cutoff)
                .collect();
            report.backups_deleted = stale.len();
            report.records_deleted = stale.iter().map(|b| b.principal_count).sum();
            return Ok(report);
        }

        let (backups, records) = self.store.delete_backups_before(cutoff)?;
        report.backups_deleted = backups;
        report.records_deleted = records;
        info!(cutoff, backups, records, "Old balance backups removed");
        Ok(report)
    }
}

/// `current` with the backed-up balances and accrual restarted at `now`.
fn restored_from(current: &Principal, record: &BackupRecord, now: Timestamp) -> Principal {
    let mut next = current.clone();
    next.spendable_balance = record.spendable_balance;
    next.cumulative_balance = record.cumulative_balance;
    next.total_spent = record.total_spent;
    next.last_verified_at = now.max(current.last_verified_at);
    next.checkpointed_at = now;
    next
}
