//! Principal ledger
//!
//! The write path for individual principals. Every operation here takes the
//! identity's lock, reads the current record, derives the next one with the
//! pure functions in `accrual` / `verification`, and writes it back through
//! the store's compare-and-swap.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::accrual::{apply_spend, checkpointed, compute_balances, find_defects, Balances, InvariantDefect};
use crate::error::{EngineError, Result};
use crate::locks::IdentityLocks;
use crate::principal::{Principal, Timestamp};
use crate::store::LedgerStore;
use crate::verification::{apply_attestation, GateTransition, OwnershipOracle, ORACLE_FAILURE_ALERT_THRESHOLD};

/// Words rejected anywhere in a display name
const BLOCKED_WORDS: &[&str] = &["fuck", "shit", "damn", "hell", "ass", "bitch", "crap", "piss"];

const DISPLAY_NAME_MIN: usize = 2;
const DISPLAY_NAME_MAX: usize = 30;

/// Result of `Ledger::refresh_verification`
#[derive(Debug, Clone, Serialize)]
pub struct VerificationOutcome {
    pub principal: Principal,
    pub transition: GateTransition,
    /// False when the oracle could not be reached and the principal was
    /// treated as unverified
    pub oracle_available: bool,
    /// The record did not exist before this call
    pub created: bool,
}

/// Counts from one pass of `Ledger::refresh_all`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub total: usize,
    pub confirmed: usize,
    pub reconfirmed: usize,
    pub revoked: usize,
    pub still_unverified: usize,
    /// Empty-asset attestations dropped; records kept as they were
    pub assets_rejected: usize,
    /// Refreshes that ran with the oracle unreachable
    pub oracle_unavailable: usize,
    /// Records at or past the consecutive oracle failure alert threshold
    pub alerting: usize,
    /// Refreshes that returned an error; the record was not written
    pub failed: usize,
}

impl RefreshSummary {
    fn count(&mut self, outcome: &VerificationOutcome) {
        match outcome.transition {
            GateTransition::Confirmed => self.confirmed += 1,
            GateTransition::Reconfirmed => self.reconfirmed += 1,
            GateTransition::Revoked => self.revoked += 1,
            GateTransition::StillUnverified => self.still_unverified += 1,
            GateTransition::AssetsRejected => self.assets_rejected += 1,
        }
        if !outcome.oracle_available {
            self.oracle_unavailable += 1;
        }
        if outcome.principal.consecutive_oracle_failures >= ORACLE_FAILURE_ALERT_THRESHOLD {
            self.alerting += 1;
        }
    }
}

/// Persisted log entry for one batch refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRun {
    pub run_id: String,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub summary: RefreshSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckpointOutcome {
    Checkpointed { principal: Principal },
    /// Previous checkpoint is younger than the debounce window
    Skipped { last_checkpoint_at: Timestamp },
    /// Stored balances break an invariant; left untouched for repair
    Defective { defects: Vec<InvariantDefect> },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckpointSummary {
    pub checkpointed: usize,
    pub skipped: usize,
    pub defective: usize,
    pub failed: usize,
}

/// One record that needs offline repair
#[derive(Debug, Clone, Serialize)]
pub struct DefectReport {
    pub identity: String,
    pub stored_spendable: f64,
    pub stored_cumulative: f64,
    pub defects: Vec<InvariantDefect>,
    /// What reads currently serve for this record
    pub clamped: Balances,
}

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    oracle: Arc<dyn OwnershipOracle>,
    locks: Arc<IdentityLocks>,
    balance_cap: f64,
    checkpoint_debounce_ms: i64,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        oracle: Arc<dyn OwnershipOracle>,
        locks: Arc<IdentityLocks>,
        balance_cap: f64,
        checkpoint_debounce: Duration,
    ) -> Self {
        Self {
            store,
            oracle,
            locks,
            balance_cap,
            checkpoint_debounce_ms: checkpoint_debounce.as_millis() as i64,
        }
    }

    pub fn balance_cap(&self) -> f64 {
        self.balance_cap
    }

    /// Look up a principal by identity, falling back to addresses absorbed by a merge.
    pub fn resolve(&self, identity: &str) -> Result<Option<Principal>> {
        match self.store.get(identity)? {
            Some(p) => Ok(Some(p)),
            None => self.store.find_by_alternate(identity),
        }
    }

    fn require(&self, identity: &str) -> Result<Principal> {
        self.resolve(identity)?
            .ok_or_else(|| EngineError::NotFound(identity.to_string()))
    }

    /// The principal for `identity`, created fully initialized if never seen.
    ///
    /// Returns the record and whether it was created by this call.
    pub fn observe(&self, identity: &str, now: Timestamp) -> Result<(Principal, bool)> {
        if let Some(existing) = self.resolve(identity)? {
            return Ok((existing, false));
        }

        match self.store.insert(&Principal::new(identity, now)) {
            Ok(created) => {
                info!(identity = %identity, "New principal observed");
                Ok((created, true))
            }
            // Lost a creation race; the winner's record is the one to use
            Err(EngineError::AlreadyExists(_)) => Ok((self.require(identity)?, false)),
            Err(e) => Err(e),
        }
    }

    /// Ask the oracle about `identity` and run the result through the gate.
    pub async fn refresh_verification(&self, identity: &str, now: Timestamp) -> Result<VerificationOutcome> {
        let canonical = self
            .resolve(identity)?
            .map(|p| p.identity)
            .unwrap_or_else(|| identity.to_string());

        let attestation = match self.oracle.verify_ownership(&canonical).await {
            Ok(att) => Some(att),
            Err(e) => {
                warn!(identity = %canonical, error = %e, "Ownership oracle unavailable, treating as unverified");
                None
            }
        };

        let _guard = self.locks.lock(&canonical).await;
        let (current, created) = self.observe(&canonical, now)?;
        let (next, transition) = apply_attestation(&current, attestation.as_ref(), now, self.balance_cap);
        let stored = self.store.update(&next)?;

        match transition {
            GateTransition::Confirmed => info!(
                identity = %stored.identity,
                rate_per_hour = stored.total_rate_per_hour,
                accrual_from = stored.last_verified_at,
                "Ownership confirmed"
            ),
            GateTransition::Revoked => info!(
                identity = %stored.identity,
                spendable = stored.spendable_balance,
                "Ownership no longer verified, accrual stopped"
            ),
            GateTransition::AssetsRejected => warn!(
                identity = %stored.identity,
                kept_assets = stored.owned_assets.len(),
                "Oracle reported no assets for a record that has some, attestation dropped"
            ),
            _ => debug!(identity = %stored.identity, ?transition, "Verification refreshed"),
        }

        if stored.consecutive_oracle_failures >= ORACLE_FAILURE_ALERT_THRESHOLD {
            error!(
                identity = %stored.identity,
                consecutive_failures = stored.consecutive_oracle_failures,
                "ALERT: ownership oracle keeps failing for this principal"
            );
        }

        Ok(VerificationOutcome {
            principal: stored,
            transition,
            oracle_available: attestation.is_some(),
            created,
        })
    }

    /// Refresh every stored principal against the oracle and log the run.
    ///
    /// Per-record failures are counted, not fatal. Operator-invoked; nothing
    /// schedules it.
    pub async fn refresh_all(&self, now: Timestamp) -> Result<VerificationRun> {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut summary = RefreshSummary::default();

        for principal in self.store.list()? {
            summary.total += 1;
            match self.refresh_verification(&principal.identity, now).await {
                Ok(outcome) => summary.count(&outcome),
                Err(e) => {
                    warn!(run_id = %run_id, identity = %principal.identity, error = %e, "Verification refresh failed");
                    summary.failed += 1;
                }
            }
        }

        let run = VerificationRun {
            run_id,
            started_at: now,
            finished_at: now.saturating_add(started.elapsed().as_millis() as i64),
            summary,
        };

        info!(
            run_id = %run.run_id,
            total = run.summary.total,
            confirmed = run.summary.confirmed,
            revoked = run.summary.revoked,
            assets_rejected = run.summary.assets_rejected,
            oracle_unavailable = run.summary.oracle_unavailable,
            failed = run.summary.failed,
            "Verification refresh run complete"
        );
        if let Err(e) = self.store.record_verification_run(&run) {
            warn!(run_id = %run.run_id, error = %e, "Could not log verification run");
        }
        Ok(run)
    }

    /// Logged batch refreshes, most recent first.
    pub fn verification_runs(&self, limit: usize) -> Result<Vec<VerificationRun>> {
        self.store.verification_runs(limit)
    }

    /// Persist live balances for one principal.
    pub async fn checkpoint(&self, identity: &str, now: Timestamp, force: bool) -> Result<CheckpointOutcome> {
        let current = self.require(identity)?;
        let _guard = self.locks.lock(&current.identity).await;
        let current = self.require(&current.identity)?;

        let defects = find_defects(&current, self.balance_cap);
        if !defects.is_empty() {
            for defect in &defects {
                warn!(identity = %current.identity, %defect, "Invariant defect, checkpoint refused");
            }
            return Ok(CheckpointOutcome::Defective { defects });
        }

        if !force && now.saturating_sub(current.checkpointed_at) < self.checkpoint_debounce_ms {
            debug!(identity = %current.identity, "Checkpoint debounced");
            return Ok(CheckpointOutcome::Skipped {
                last_checkpoint_at: current.checkpointed_at,
            });
        }

        let stored = self.store.update(&checkpointed(&current, now, self.balance_cap))?;
        debug!(
            identity = %stored.identity,
            spendable = stored.spendable_balance,
            cumulative = stored.cumulative_balance,
            "Checkpointed"
        );
        Ok(CheckpointOutcome::Checkpointed { principal: stored })
    }

    /// Checkpoint every principal. Per-record failures are counted, not fatal.
    pub async fn checkpoint_all(&self, now: Timestamp, force: bool) -> Result<CheckpointSummary> {
        let mut summary = CheckpointSummary::default();

        for principal in self.store.list()? {
            match self.checkpoint(&principal.identity, now, force).await {
                Ok(CheckpointOutcome::Checkpointed { .. }) => summary.checkpointed += 1,
                Ok(CheckpointOutcome::Skipped { .. }) => summary.skipped += 1,
                Ok(CheckpointOutcome::Defective { .. }) => summary.defective += 1,
                Err(e) => {
                    warn!(identity = %principal.identity, error = %e, "Checkpoint failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            checkpointed = summary.checkpointed,
            skipped = summary.skipped,
            defective = summary.defective,
            failed = summary.failed,
            "Checkpoint sweep complete"
        );
        Ok(summary)
    }

    /// Deduct `amount` from the live spendable balance.
    pub async fn spend(&self, identity: &str, amount: f64, now: Timestamp) -> Result<Principal> {
        let current = self.require(identity)?;
        let _guard = self.locks.lock(&current.identity).await;
        let current = self.require(&current.identity)?;

        let defects = find_defects(&current, self.balance_cap);
        if let Some(first) = defects.first() {
            warn!(identity = %current.identity, defect = %first, "Spend refused on defective record");
            return Err(EngineError::InvariantViolation {
                identity: current.identity.clone(),
                detail: first.to_string(),
            });
        }

        let next = apply_spend(&current, amount, now, self.balance_cap)?;
        let stored = self.store.update(&next)?;
        info!(
            identity = %stored.identity,
            amount,
            spendable = stored.spendable_balance,
            "Gold spent"
        );
        Ok(stored)
    }

    pub async fn set_display_name(&self, identity: &str, name: &str) -> Result<Principal> {
        let name = validate_display_name(name)?;

        let current = self.require(identity)?;
        let _guard = self.locks.lock(&current.identity).await;
        let mut next = self.require(&current.identity)?;

        if self.store.display_name_taken(&name, &next.identity)? {
            return Err(EngineError::DisplayNameTaken(name));
        }

        next.display_name = Some(name);
        let stored = self.store.update(&next)?;
        info!(identity = %stored.identity, display_name = ?stored.display_name, "Display name set");
        Ok(stored)
    }

    /// Every stored record that breaks a balance invariant.
    pub fn audit(&self, now: Timestamp) -> Result<Vec<DefectReport>> {
        let mut reports = Vec::new();
        for principal in self.store.list()? {
            let defects = find_defects(&principal, self.balance_cap);
            if defects.is_empty() {
                continue;
            }
            for defect in &defects {
                warn!(identity = %principal.identity, %defect, "Invariant defect");
            }
            reports.push(DefectReport {
                clamped: compute_balances(&principal, now, self.balance_cap),
                identity: principal.identity,
                stored_spendable: principal.spendable_balance,
                stored_cumulative: principal.cumulative_balance,
                defects,
            });
        }
        Ok(reports)
    }
}

/// Trim and check a display name. Returns the trimmed name.
pub fn validate_display_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    let len = name.chars().count();

    if len < DISPLAY_NAME_MIN || len > DISPLAY_NAME_MAX {
        return Err(EngineError::InvalidDisplayName(format!(
            "must be {}-{} characters",
            DISPLAY_NAME_MIN, DISPLAY_NAME_MAX
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ') {
        return Err(EngineError::InvalidDisplayName(
            "only letters, numbers and spaces are allowed".to_string(),
        ));
    }

    let lowered = name.to_ascii_lowercase();
    if lowered
        .split_whitespace()
        .any(|word| BLOCKED_WORDS.contains(&word))
    {
        return Err(EngineError::InvalidDisplayName(
            "contains a blocked word".to_string(),
        ));
    }

    Ok(name.to_string())
}
