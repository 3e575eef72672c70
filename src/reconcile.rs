//! Identity reconciler
//!
//! The same wallet can end up with more than one principal record when its
//! address reaches the engine in different representations (stake address
//! vs payment address, different casing, stray separators). Records are
//! matched on a canonical suffix of the identity and merged only on explicit
//! operator confirmation.
//!
//! Merge rules:
//! - The operator passes the exact duplicate set they reviewed. If the
//!   current candidate set differs, nothing happens.
//! - Balances are evaluated live at the merge time; the target keeps the
//!   component-wise maximum. Records for one wallet describe the same gold,
//!   so adding them would double count.
//! - Assets and rate come from the oracle for the target identity, never from
//!   the duplicates.
//! - The target update and the duplicate deletions land in one transaction.
//! - A `pre_merge` balance backup of the whole population is taken first;
//!   if it cannot be written, the merge does not run.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::accrual::compute_balances;
use crate::backup::{BackupKind, BackupManager};
use crate::error::Result;
use crate::locks::IdentityLocks;
use crate::principal::{Principal, Timestamp};
use crate::store::LedgerStore;
use crate::verification::{apply_attestation, GateTransition, OwnershipOracle};

const SUFFIX_LEN: usize = 8;

/// Lowercased ASCII alphanumerics of `identity`, last 8 characters.
pub fn canonical_suffix(identity: &str) -> String {
    let normalized: Vec<char> = identity
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let start = normalized.len().saturating_sub(SUFFIX_LEN);
    normalized[start..].iter().collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateMember {
    pub identity: String,
    pub is_verified: bool,
    pub cumulative_balance: f64,
    pub display_name: Option<String>,
}

/// Records sharing a canonical suffix
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub suffix: String,
    pub members: Vec<DuplicateMember>,
}

impl DuplicateGroup {
    pub fn identities(&self) -> Vec<String> {
        self.members.iter().map(|m| m.identity.clone()).collect()
    }
}

/// One asset id held by several records
#[derive(Debug, Clone, Serialize)]
pub struct AssetOverlap {
    pub asset_id: String,
    pub identities: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DuplicateReport {
    pub groups: Vec<DuplicateGroup>,
    pub asset_overlaps: Vec<AssetOverlap>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum MergeNoOp {
    TargetNotFound { target: String },
    NoDuplicates { target: String },
    ConfirmationMismatch {
        expected: Vec<String>,
        confirmed: Vec<String>,
    },
}

impl fmt::Display for MergeNoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetNotFound { target } => write!(f, "no principal named {}", target),
            Self::NoDuplicates { target } => write!(f, "{} has no duplicate records", target),
            Self::ConfirmationMismatch { expected, confirmed } => write!(
                f,
                "confirmed set [{}] does not match current duplicates [{}]; review again",
                confirmed.join(", "),
                expected.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub principal: Principal,
    pub absorbed: Vec<String>,
    pub transition: GateTransition,
    pub oracle_available: bool,
    /// Backup taken just before the merge
    pub backup_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged(MergeSummary),
    NoOp(MergeNoOp),
}

pub struct IdentityReconciler {
    store: Arc<dyn LedgerStore>,
    oracle: Arc<dyn OwnershipOracle>,
    locks: Arc<IdentityLocks>,
    backups: BackupManager,
    balance_cap: f64,
}

impl IdentityReconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        oracle: Arc<dyn OwnershipOracle>,
        locks: Arc<IdentityLocks>,
        balance_cap: f64,
    ) -> Self {
        Self {
            backups: BackupManager::new(Arc::clone(&store), Arc::clone(&locks), balance_cap),
            store,
            oracle,
            locks,
            balance_cap,
        }
    }

    /// Suffix groups with more than one member, plus asset overlaps.
    pub fn find_duplicates(&self) -> Result<DuplicateReport> {
        let principals = self.store.list()?;

        let mut by_suffix: BTreeMap<String, Vec<&Principal>> = BTreeMap::new();
        let mut by_asset: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for p in &principals {
            let suffix = canonical_suffix(&p.identity);
            if !suffix.is_empty() {
                by_suffix.entry(suffix).or_default().push(p);
            }
            for asset in &p.owned_assets {
                by_asset
                    .entry(asset.asset_id.as_str())
                    .or_default()
                    .insert(p.identity.as_str());
            }
        }

        let groups = by_suffix
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(suffix, members)| DuplicateGroup {
                suffix,
                members: members
                    .into_iter()
                    .map(|p| DuplicateMember {
                        identity: p.identity.clone(),
                        is_verified: p.is_verified,
                        cumulative_balance: p.cumulative_balance,
                        display_name: p.display_name.clone(),
                    })
                    .collect(),
            })
            .collect();

        let asset_overlaps = by_asset
            .into_iter()
            .filter(|(_, holders)| holders.len() > 1)
            .map(|(asset_id, holders)| AssetOverlap {
                asset_id: asset_id.to_string(),
                identities: holders.into_iter().map(str::to_string).collect(),
            })
            .collect();

        Ok(DuplicateReport {
            groups,
            asset_overlaps,
        })
    }

    fn duplicates_of(&self, target: &str) -> Result<Vec<Principal>> {
        let suffix = canonical_suffix(target);
        if suffix.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|p| p.identity != target && canonical_suffix(&p.identity) == suffix)
            .collect())
    }

    /// Merge the reviewed duplicates of `target` into it.
    pub async fn merge(&self, target: &str, confirmed: &[String], now: Timestamp) -> Result<MergeOutcome> {
        let confirmed: Vec<String> = confirmed
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if let Some(reason) = self.precheck(target, &confirmed)? {
            info!(identity = %target, %reason, "Merge not applied");
            return Ok(MergeOutcome::NoOp(reason));
        }

        let attestation = match self.oracle.verify_ownership(target).await {
            Ok(att) => Some(att),
            Err(e) => {
                warn!(identity = %target, error = %e, "Ownership oracle unavailable during merge");
                None
            }
        };

        let mut group = confirmed.clone();
        group.push(target.to_string());
        let _guards = self.locks.lock_many(&group).await;

        // Candidates may have moved while waiting for the locks
        if let Some(reason) = self.precheck(target, &confirmed)? {
            info!(identity = %target, %reason, "Merge not applied");
            return Ok(MergeOutcome::NoOp(reason));
        }
        let Some(current) = self.store.get(target)? else {
            return Ok(MergeOutcome::NoOp(MergeNoOp::TargetNotFound {
                target: target.to_string(),
            }));
        };
        let duplicates = self.duplicates_of(target)?;
        let backup = self
            .backups
            .create(BackupKind::PreMerge, Some(format!("merge into {}", target)), now)?;

        let consolidated = self.consolidate(&current, &duplicates, now);
        let (merged, transition) =
            apply_attestation(&consolidated, attestation.as_ref(), now, self.balance_cap);
        let stored = self.store.merge(&merged, &duplicates)?;

        info!(
            identity = %stored.identity,
            absorbed = ?confirmed,
            spendable = stored.spendable_balance,
            cumulative = stored.cumulative_balance,
            rate_per_hour = stored.total_rate_per_hour,
            backup_id = %backup.backup_id,
            "Duplicate principals merged"
        );

        Ok(MergeOutcome::Merged(MergeSummary {
            principal: stored,
            absorbed: confirmed,
            transition,
            oracle_available: attestation.is_some(),
            backup_id: backup.backup_id,
        }))
    }

    fn precheck(&self, target: &str, confirmed: &[String]) -> Result<Option<MergeNoOp>> {
        if self.store.get(target)?.is_none() {
            return Ok(Some(MergeNoOp::TargetNotFound {
                target: target.to_string(),
            }));
        }

        let expected: Vec<String> = self
            .duplicates_of(target)?
            .into_iter()
            .map(|p| p.identity)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if expected.is_empty() {
            return Ok(Some(MergeNoOp::NoDuplicates {
                target: target.to_string(),
            }));
        }
        if expected != confirmed {
            return Ok(Some(MergeNoOp::ConfirmationMismatch {
                expected,
                confirmed: confirmed.to_vec(),
            }));
        }
        Ok(None)
    }

    /// Target record carrying the group's live balances, evaluated at `now`.
    ///
    /// Accrual restarts at `now` so the oracle step cannot credit the
    /// already-evaluated interval a second time.
    fn consolidate(&self, target: &Principal, duplicates: &[Principal], now: Timestamp) -> Principal {
        let mut merged = target.clone();
        let mut spendable = 0.0_f64;
        let mut cumulative = 0.0_f64;

        for p in std::iter::once(target).chain(duplicates.iter()) {
            let live = compute_balances(p, now, self.balance_cap);
            spendable = spendable.max(live.spendable);
            cumulative = cumulative.max(live.cumulative);
            merged.total_spent = merged.total_spent.max(p.total_spent);
            merged.created_at = merged.created_at.min(p.created_at);
            merged.is_verified |= p.is_verified;
        }

        for dup in duplicates {
            merged.alternate_addresses.insert(dup.identity.clone());
            merged
                .alternate_addresses
                .extend(dup.alternate_addresses.iter().cloned());
            if merged.display_name.is_none() {
                merged.display_name = dup.display_name.clone();
            }
        }

        merged.spendable_balance = spendable;
        merged.cumulative_balance = cumulative.max(spendable);
        merged.last_verified_at = now;
        merged.checkpointed_at = now;
        merged
    }
}
