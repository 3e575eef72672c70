//! Leaderboard cache
//!
//! A ranked top-N materialized view over cumulative gold, rebuilt on a fixed
//! schedule. Each pass is a full recompute against one captured timestamp,
//! followed by a diffed write:
//!
//! 1. Load every principal and evaluate it at the captured `now`
//! 2. Sort by cumulative gold descending, identity ascending on ties
//! 3. Keep the first N
//! 4. Per rank: insert when missing; rewrite when the identity changed, the
//!    value drifted by at least the significance threshold, the display name
//!    changed, or the rate crossed zero; otherwise skip
//! 5. Evict cached ranks past the new window
//!
//! All writes of a pass land in one transaction. A failed pass leaves the
//! previous cache untouched and is retried at the next tick only. Passes are
//! single-flight: a trigger that arrives mid-pass is suppressed.
//!
//! The cache may lag the principal store by up to one rebuild interval.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::accrual::{compute_balances, find_defects};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::principal::{now_millis, Principal, Timestamp};
use crate::store::LedgerStore;

// ============================================================================
// Types
// ============================================================================

/// One cached rank. Derived data, never a source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub identity: String,
    pub display_name: Option<String>,
    /// Cumulative gold at capture time
    pub value: f64,
    /// Effective hourly rate at capture time (0 while unverified)
    pub rate_at_capture: f64,
    pub last_cached_at: Timestamp,
}

/// Writes produced by one rebuild pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaderboardWrites {
    pub inserts: Vec<LeaderboardEntry>,
    pub updates: Vec<LeaderboardEntry>,
    /// Ranks to delete
    pub evictions: Vec<u32>,
}

impl LeaderboardWrites {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.evictions.is_empty()
    }

    pub fn write_count(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.evictions.len()
    }
}

/// A principal evaluated at the pass timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct RankedPrincipal {
    pub identity: String,
    pub display_name: Option<String>,
    pub cumulative: f64,
    pub rate: f64,
}

/// Total order used for ranking: more gold first, then identity ascending.
pub fn rank_order(a_value: f64, a_identity: &str, b_value: f64, b_identity: &str) -> Ordering {
    b_value
        .total_cmp(&a_value)
        .then_with(|| a_identity.cmp(b_identity))
}

/// Evaluate and sort every principal at `now`.
pub fn rank_principals(principals: &[Principal], now: Timestamp, balance_cap: f64) -> Vec<RankedPrincipal> {
    let mut ranked: Vec<RankedPrincipal> = principals
        .iter()
        .map(|p| {
            let balances = compute_balances(p, now, balance_cap);
            RankedPrincipal {
                identity: p.identity.clone(),
                display_name: p.display_name.clone(),
                cumulative: balances.cumulative,
                rate: if p.is_verified { p.total_rate_per_hour } else { 0.0 },
            }
        })
        .collect();

    ranked.sort_by(|a, b| rank_order(a.cumulative, &a.identity, b.cumulative, &b.identity));
    ranked
}

/// Diff the new ranking against the cached entries.
///
/// Returns the writes and the number of ranks left untouched.
pub fn plan_writes(
    existing: &[LeaderboardEntry],
    ranked: &[RankedPrincipal],
    top_n: usize,
    significant_change: f64,
    now: Timestamp,
) -> (LeaderboardWrites, usize) {
    let window = &ranked[..ranked.len().min(top_n)];
    let cached: HashMap<u32, &LeaderboardEntry> = existing.iter().map(|e| (e.rank, e)).collect();

    let mut writes = LeaderboardWrites::default();
    let mut unchanged = 0;

    for (idx, candidate) in window.iter().enumerate() {
        let rank = idx as u32 + 1;
        let entry = LeaderboardEntry {
            rank,
            identity: candidate.identity.clone(),
            display_name: candidate.display_name.clone(),
            value: candidate.cumulative,
            rate_at_capture: candidate.rate,
            last_cached_at: now,
        };

        match cached.get(&rank) {
            None => writes.inserts.push(entry),
            Some(current) if needs_rewrite(current, candidate, significant_change) => {
                writes.updates.push(entry)
            }
            Some(_) => unchanged += 1,
        }
    }

    let mut evictions: Vec<u32> = existing
        .iter()
        .filter(|e| e.rank as usize > window.len())
        .map(|e| e.rank)
        .collect();
    evictions.sort_unstable();
    writes.evictions = evictions;

    (writes, unchanged)
}

/// A gate flip or a rename shows in the feed at the next pass; balance drift
/// below the threshold does not.
fn needs_rewrite(current: &LeaderboardEntry, candidate: &RankedPrincipal, significant_change: f64) -> bool {
    current.identity != candidate.identity
        || (current.value - candidate.cumulative).abs() >= significant_change
        || current.display_name != candidate.display_name
        || (current.rate_at_capture > 0.0) != (candidate.rate > 0.0)
}

// ============================================================================
// Cache
// ============================================================================

/// Result of one completed pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildReport {
    pub pass_id: String,
    pub captured_at: Timestamp,
    pub principals: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub evicted: usize,
    /// Cache version after the pass
    pub version: u64,
    pub duration_ms: u64,
    /// Principals whose stored balances break an invariant
    pub defective: usize,
}

/// Observable cache state
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatus {
    pub version: u64,
    pub last_rebuilt_at: Option<Timestamp>,
    pub last_report: Option<RebuildReport>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub rebuilding: bool,
}

/// Leaderboard parameters taken from the engine config
#[derive(Debug, Clone)]
pub struct LeaderboardConfig {
    pub top_n: usize,
    pub significant_change: f64,
    pub balance_cap: f64,
}

impl From<&EngineConfig> for LeaderboardConfig {
    fn from(engine: &EngineConfig) -> Self {
        Self {
            top_n: engine.top_n,
            significant_change: engine.significant_change_threshold,
            balance_cap: engine.balance_cap,
        }
    }
}

pub struct LeaderboardCache {
    store: Arc<dyn LedgerStore>,
    config: LeaderboardConfig,
    rebuild_lock: Mutex<()>,
    /// Set only while `rebuild_lock` is held; readers never touch the lock
    rebuilding: AtomicBool,
    status: RwLock<CacheStatus>,
}

/// Clears the rebuilding flag when a pass ends, including by panic.
struct RebuildingFlag<'a>(&'a AtomicBool);

impl<'a> RebuildingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, AtomicOrdering::SeqCst);
        Self(flag)
    }
}

impl Drop for RebuildingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, AtomicOrdering::SeqCst);
    }
}

impl LeaderboardCache {
    /// The reported version starts at whatever the store already holds, so a
    /// restarted daemon agrees with the feed before its first pass.
    pub fn new(store: Arc<dyn LedgerStore>, config: LeaderboardConfig) -> Self {
        let version = match store.leaderboard_version() {
            Ok(version) => version,
            Err(e) => {
                warn!(error = %e, "Could not read stored leaderboard version, reporting 0");
                0
            }
        };

        Self {
            store,
            config,
            rebuild_lock: Mutex::new(()),
            rebuilding: AtomicBool::new(false),
            status: RwLock::new(CacheStatus {
                version,
                ..Default::default()
            }),
        }
    }

    pub fn config(&self) -> &LeaderboardConfig {
        &self.config
    }

    pub fn status(&self) -> CacheStatus {
        let mut status = match self.status.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        status.rebuilding = self.rebuilding.load(AtomicOrdering::SeqCst);
        status
    }

    /// Run one full pass evaluated at `now`.
    ///
    /// Returns `RebuildInProgress` without touching anything if another pass
    /// holds the lock.
    pub fn rebuild(&self, now: Timestamp) -> Result<RebuildReport> {
        let _guard = match self.rebuild_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!("Leaderboard rebuild already running, trigger suppressed");
                return Err(EngineError::RebuildInProgress);
            }
            // A panicked pass never committed anything
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let _flag = RebuildingFlag::raise(&self.rebuilding);

        let pass_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        match self.run_pass(&pass_id, now, started) {
            Ok(report) => {
                info!(
                    pass_id = %report.pass_id,
                    principals = report.principals,
                    inserted = report.inserted,
                    updated = report.updated,
                    unchanged = report.unchanged,
                    evicted = report.evicted,
                    version = report.version,
                    duration_ms = report.duration_ms,
                    "Leaderboard rebuilt"
                );
                self.record_success(&report);
                Ok(report)
            }
            Err(e) => {
                let failures = self.record_failure(&e);
                error!(
                    pass_id = %pass_id,
                    error = %e,
                    consecutive_failures = failures,
                    "ALERT: leaderboard rebuild failed, previous cache kept until next interval"
                );
                Err(e)
            }
        }
    }

    fn run_pass(&self, pass_id: &str, now: Timestamp, started: Instant) -> Result<RebuildReport> {
        let principals = self.store.list()?;

        let defective = principals
            .iter()
            .filter(|p| !find_defects(p, self.config.balance_cap).is_empty())
            .count();
        if defective > 0 {
            warn!(
                pass_id = %pass_id,
                defective,
                "Principals with invariant defects ranked on clamped balances"
            );
        }

        let ranked = rank_principals(&principals, now, self.config.balance_cap);
        let existing = self.store.leaderboard(None)?;
        let (writes, unchanged) = plan_writes(
            &existing,
            &ranked,
            self.config.top_n,
            self.config.significant_change,
            now,
        );

        let version = if writes.is_empty() {
            self.store.leaderboard_version()?
        } else {
            self.store.apply_leaderboard(&writes)?
        };

        Ok(RebuildReport {
            pass_id: pass_id.to_string(),
            captured_at: now,
            principals: principals.len(),
            inserted: writes.inserts.len(),
            updated: writes.updates.len(),
            unchanged,
            evicted: writes.evictions.len(),
            version,
            duration_ms: started.elapsed().as_millis() as u64,
            defective,
        })
    }

    fn record_success(&self, report: &RebuildReport) {
        if let Ok(mut status) = self.status.write() {
            status.version = report.version;
            status.last_rebuilt_at = Some(report.captured_at);
            status.last_report = Some(report.clone());
            status.last_error = None;
            status.consecutive_failures = 0;
        }
    }

    fn record_failure(&self, err: &EngineError) -> u32 {
        match self.status.write() {
            Ok(mut status) => {
                status.last_error = Some(err.to_string());
                status.consecutive_failures += 1;
                status.consecutive_failures
            }
            Err(_) => 0,
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Drive `cache.rebuild` every `period` until `shutdown` fires.
///
/// The first tick fires immediately. A pass always runs to completion; the
/// shutdown signal is only observed between passes. Failed passes are not
/// retried before the next tick.
pub fn spawn_rebuild_task(
    cache: Arc<LeaderboardCache>,
    period: Duration,
    mut shutdown: mpsc::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = period.as_secs(), "Leaderboard scheduler started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let pass_cache = Arc::clone(&cache);
                    let now = now_millis();
                    match tokio::task::spawn_blocking(move || pass_cache.rebuild(now)).await {
                        Ok(Ok(_)) | Ok(Err(EngineError::RebuildInProgress)) => {}
                        // Already reported by `rebuild`
                        Ok(Err(_)) => {}
                        Err(e) => error!(error = %e, "ALERT: leaderboard rebuild task panicked"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Leaderboard scheduler shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(identity: &str, cumulative: f64) -> RankedPrincipal {
        RankedPrincipal {
            identity: identity.to_string(),
            display_name: None,
            cumulative,
            rate: 1.0,
        }
    }

    fn cached(rank: u32, identity: &str, value: f64) -> LeaderboardEntry {
        LeaderboardEntry {
            rank,
            identity: identity.to_string(),
            display_name: None,
            value,
            rate_at_capture: 1.0,
            last_cached_at: 0,
        }
    }

    #[test]
    fn test_rank_order_breaks_ties_by_identity() {
        let mut list = vec![ranked("c", 10.0), ranked("a", 10.0), ranked("b", 20.0)];
        list.sort_by(|x, y| rank_order(x.cumulative, &x.identity, y.cumulative, &y.identity));
        let ids: Vec<&str> = list.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_first_pass_inserts_window_only() {
        let new = vec![ranked("a", 500.0), ranked("b", 400.0), ranked("c", 300.0), ranked("d", 200.0)];
        let (writes, unchanged) = plan_writes(&[], &new, 3, 100.0, 42);

        assert_eq!(writes.inserts.len(), 3);
        assert!(writes.updates.is_empty());
        assert!(writes.evictions.is_empty());
        assert_eq!(unchanged, 0);
        assert_eq!(writes.inserts[2].identity, "c");
        assert_eq!(writes.inserts[2].rank, 3);
        assert_eq!(writes.inserts[2].last_cached_at, 42);
    }

    #[test]
    fn test_small_drift_at_same_rank_writes_nothing() {
        let existing = vec![cached(1, "a", 500.0), cached(2, "b", 400.0)];
        let new = vec![ranked("a", 599.0), ranked("b", 400.5)];
        let (writes, unchanged) = plan_writes(&existing, &new, 3, 100.0, 0);

        assert!(writes.is_empty());
        assert_eq!(unchanged, 2);
    }

    #[test]
    fn test_threshold_drift_rewrites_entry() {
        let existing = vec![cached(1, "a", 500.0)];
        let new = vec![ranked("a", 600.0)];
        let (writes, _) = plan_writes(&existing, &new, 3, 100.0, 0);

        assert_eq!(writes.updates.len(), 1);
        assert_eq!(writes.updates[0].value, 600.0);
    }

    #[test]
    fn test_identity_change_rewrites_entry_even_without_drift() {
        let existing = vec![cached(1, "a", 500.0), cached(2, "b", 499.0)];
        let new = vec![ranked("b", 500.0), ranked("a", 499.5)];
        let (writes, _) = plan_writes(&existing, &new, 3, 100.0, 0);

        assert_eq!(writes.updates.len(), 2);
        assert_eq!(writes.write_count(), 2);
    }

    #[test]
    fn test_revocation_and_rename_at_stable_rank_rewrite_entry() {
        let existing = vec![cached(1, "a", 500.0), cached(2, "b", 400.0), cached(3, "c", 300.0)];
        let mut revoked = ranked("a", 500.0);
        revoked.rate = 0.0;
        let mut renamed = ranked("b", 400.0);
        renamed.display_name = Some("Acme".to_string());
        let mut slower = ranked("c", 300.0);
        slower.rate = 0.5;

        let (writes, unchanged) = plan_writes(&existing, &[revoked, renamed, slower], 3, 100.0, 9);

        let rewritten: Vec<u32> = writes.updates.iter().map(|e| e.rank).collect();
        assert_eq!(rewritten, vec![1, 2]);
        assert_eq!(writes.updates[0].rate_at_capture, 0.0);
        assert_eq!(writes.updates[1].display_name.as_deref(), Some("Acme"));
        // Nonzero to nonzero rate changes wait for value drift
        assert_eq!(unchanged, 1);
    }

    #[test]
    fn test_shrunk_population_evicts_trailing_ranks() {
        let existing = vec![cached(1, "a", 500.0), cached(2, "b", 400.0), cached(3, "c", 300.0)];
        let new = vec![ranked("a", 500.0)];
        let (writes, _) = plan_writes(&existing, &new, 3, 100.0, 0);

        assert_eq!(writes.evictions, vec![2, 3]);
    }

    #[test]
    fn test_smaller_top_n_evicts_beyond_window() {
        let existing = vec![cached(1, "a", 500.0), cached(2, "b", 400.0), cached(3, "c", 300.0)];
        let new = vec![ranked("a", 500.0), ranked("b", 400.0), ranked("c", 300.0)];
        let (writes, unchanged) = plan_writes(&existing, &new, 2, 100.0, 0);

        assert_eq!(writes.evictions, vec![3]);
        assert_eq!(unchanged, 2);
    }

    // ------------------------------------------------------------------
    // Store-backed passes
    // ------------------------------------------------------------------

    use crate::backup::{BackupInfo, BackupRecord};
    use crate::ledger::VerificationRun;
    use crate::principal::OwnedAsset;
    use crate::store::SqliteStore;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    /// Delegates to SQLite but can be told to fail every read.
    struct FlakyStore {
        inner: SqliteStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                failing: AtomicBool::new(false),
            }
        }

        fn check(&self) -> Result<()> {
            if self.failing.load(AtomicOrdering::SeqCst) {
                return Err(EngineError::Internal("store offline".to_string()));
            }
            Ok(())
        }
    }

    impl LedgerStore for FlakyStore {
        fn get(&self, identity: &str) -> Result<Option<Principal>> {
            self.check()?;
            self.inner.get(identity)
        }
        fn list(&self) -> Result<Vec<Principal>> {
            self.check()?;
            self.inner.list()
        }
        fn find_by_alternate(&self, address: &str) -> Result<Option<Principal>> {
            self.inner.find_by_alternate(address)
        }
        fn insert(&self, principal: &Principal) -> Result<Principal> {
            self.inner.insert(principal)
        }
        fn update(&self, principal: &Principal) -> Result<Principal> {
            self.inner.update(principal)
        }
        fn merge(&self, target: &Principal, removed: &[Principal]) -> Result<Principal> {
            self.inner.merge(target, removed)
        }
        fn display_name_taken(&self, name: &str, except_identity: &str) -> Result<bool> {
            self.inner.display_name_taken(name, except_identity)
        }
        fn leaderboard(&self, limit: Option<usize>) -> Result<Vec<LeaderboardEntry>> {
            self.inner.leaderboard(limit)
        }
        fn leaderboard_entry(&self, identity: &str) -> Result<Option<LeaderboardEntry>> {
            self.inner.leaderboard_entry(identity)
        }
        fn leaderboard_version(&self) -> Result<u64> {
            self.inner.leaderboard_version()
        }
        fn apply_leaderboard(&self, writes: &LeaderboardWrites) -> Result<u64> {
            self.inner.apply_leaderboard(writes)
        }
        fn update_many(&self, principals: &[Principal]) -> Result<Vec<Principal>> {
            self.inner.update_many(principals)
        }
        fn insert_backup(&self, info: &BackupInfo, records: &[BackupRecord]) -> Result<()> {
            self.inner.insert_backup(info, records)
        }
        fn list_backups(&self) -> Result<Vec<BackupInfo>> {
            self.inner.list_backups()
        }
        fn get_backup(&self, backup_id: &str) -> Result<Option<BackupInfo>> {
            self.inner.get_backup(backup_id)
        }
        fn backup_records(&self, backup_id: &str) -> Result<Vec<BackupRecord>> {
            self.inner.backup_records(backup_id)
        }
        fn delete_backups_before(&self, cutoff: Timestamp) -> Result<(usize, usize)> {
            self.inner.delete_backups_before(cutoff)
        }
        fn record_verification_run(&self, run: &VerificationRun) -> Result<()> {
            self.inner.record_verification_run(run)
        }
        fn verification_runs(&self, limit: usize) -> Result<Vec<VerificationRun>> {
            self.inner.verification_runs(limit)
        }
    }

    /// Unverified principal frozen at `cumulative`
    fn frozen(store: &dyn LedgerStore, identity: &str, cumulative: f64) -> Principal {
        let mut p = Principal::new(identity, 0);
        p.cumulative_balance = cumulative;
        store.insert(&p).unwrap()
    }

    fn cache_over(store: Arc<dyn LedgerStore>, top_n: usize) -> LeaderboardCache {
        LeaderboardCache::new(
            store,
            LeaderboardConfig {
                top_n,
                significant_change: 100.0,
                balance_cap: 50_000.0,
            },
        )
    }

    fn board(store: &dyn LedgerStore) -> Vec<(u32, String, f64)> {
        store
            .leaderboard(None)
            .unwrap()
            .into_iter()
            .map(|e| (e.rank, e.identity, e.value))
            .collect()
    }

    #[test]
    fn test_top_three_then_full_resort_replaces_rank_three() {
        let store: Arc<dyn LedgerStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        frozen(store.as_ref(), "a", 500.0);
        frozen(store.as_ref(), "b", 400.0);
        let c = frozen(store.as_ref(), "c", 300.0);
        frozen(store.as_ref(), "d", 200.0);

        let cache = cache_over(Arc::clone(&store), 3);
        let first = cache.rebuild(1_000).unwrap();
        assert_eq!(first.inserted, 3);
        assert_eq!(
            board(store.as_ref()),
            vec![
                (1, "a".to_string(), 500.0),
                (2, "b".to_string(), 400.0),
                (3, "c".to_string(), 300.0)
            ]
        );

        // c collapses (a repaired record), e appears above it
        let mut repaired = c.clone();
        repaired.cumulative_balance = 50.0;
        store.update(&repaired).unwrap();
        frozen(store.as_ref(), "e", 350.0);

        let second = cache.rebuild(2_000).unwrap();
        assert_eq!(second.updated, 1);
        assert_eq!(second.unchanged, 2);
        assert_eq!(board(store.as_ref())[2], (3, "e".to_string(), 350.0));
        assert!(store.leaderboard_entry("c").unwrap().is_none());
    }

    #[test]
    fn test_quiet_pass_writes_nothing_and_keeps_version() {
        let store: Arc<dyn LedgerStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut p = Principal::new("stake1slow", 0);
        p.set_assets(vec![OwnedAsset::new("mek-1", 1.0)]);
        p.is_verified = true;
        store.insert(&p).unwrap();

        let cache = cache_over(Arc::clone(&store), 10);
        let first = cache.rebuild(0).unwrap();
        assert_eq!(first.version, 1);

        // Ten hours at 1/h is below the threshold
        let second = cache.rebuild(10 * 3_600_000).unwrap();
        assert_eq!(second.inserted + second.updated + second.evicted, 0);
        assert_eq!(second.version, 1);
        assert_eq!(store.leaderboard(None).unwrap()[0].value, 0.0);
    }

    #[test]
    fn test_failed_pass_keeps_previous_cache() {
        let flaky = Arc::new(FlakyStore::new());
        frozen(&flaky.inner, "a", 500.0);
        frozen(&flaky.inner, "b", 400.0);

        let store: Arc<dyn LedgerStore> = flaky.clone();
        let cache = cache_over(Arc::clone(&store), 3);
        cache.rebuild(0).unwrap();
        let before = store.leaderboard(None).unwrap();

        flaky.failing.store(true, AtomicOrdering::SeqCst);
        assert!(cache.rebuild(1).is_err());
        assert!(cache.rebuild(2).is_err());

        let status = cache.status();
        assert_eq!(status.consecutive_failures, 2);
        assert!(status.last_error.is_some());
        assert_eq!(status.version, 1);
        assert_eq!(store.leaderboard(None).unwrap(), before);

        flaky.failing.store(false, AtomicOrdering::SeqCst);
        cache.rebuild(3).unwrap();
        assert_eq!(cache.status().consecutive_failures, 0);
    }

    #[test]
    fn test_concurrent_trigger_is_suppressed() {
        let store: Arc<dyn LedgerStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache = cache_over(store, 3);

        let held = cache.rebuild_lock.lock().unwrap();
        assert!(matches!(cache.rebuild(0), Err(EngineError::RebuildInProgress)));
        drop(held);

        assert!(cache.rebuild(0).is_ok());
        assert!(!cache.status().rebuilding);
    }

    #[test]
    fn test_status_polling_never_suppresses_rebuild() {
        let store: Arc<dyn LedgerStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        frozen(store.as_ref(), "a", 500.0);
        let cache = Arc::new(cache_over(Arc::clone(&store), 3));
        let stop = Arc::new(AtomicBool::new(false));

        let poller = {
            let cache = Arc::clone(&cache);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(AtomicOrdering::SeqCst) {
                    let _ = cache.status();
                }
            })
        };

        let suppressed = (0..2_000)
            .filter(|i| matches!(cache.rebuild(*i), Err(EngineError::RebuildInProgress)))
            .count();
        stop.store(true, AtomicOrdering::SeqCst);
        poller.join().unwrap();

        assert_eq!(suppressed, 0);
        assert!(!cache.status().rebuilding);
    }

    #[test]
    fn test_status_version_survives_restart() {
        let store: Arc<dyn LedgerStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        frozen(store.as_ref(), "a", 500.0);
        frozen(store.as_ref(), "b", 400.0);
        cache_over(Arc::clone(&store), 3).rebuild(0).unwrap();
        frozen(store.as_ref(), "c", 300.0);
        cache_over(Arc::clone(&store), 3).rebuild(1).unwrap();

        let restarted = cache_over(Arc::clone(&store), 3);
        let status = restarted.status();
        assert_eq!(status.version, 2);
        assert_eq!(status.version, store.leaderboard_version().unwrap());
        assert!(status.last_rebuilt_at.is_none());
    }

    #[test]
    fn test_rebuild_is_deterministic_for_same_input() {
        let principals: Vec<Principal> = ["d", "b", "c", "a"]
            .iter()
            .map(|id| {
                let mut p = Principal::new(*id, 0);
                p.cumulative_balance = 100.0;
                p
            })
            .collect();

        let one = rank_principals(&principals, 5, 50_000.0);
        let mut reversed = principals.clone();
        reversed.reverse();
        let two = rank_principals(&reversed, 5, 50_000.0);
        assert_eq!(one, two);
        assert_eq!(one[0].identity, "a");
    }

    #[tokio::test]
    async fn test_scheduler_runs_first_pass_and_stops_on_shutdown() {
        let store: Arc<dyn LedgerStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        frozen(store.as_ref(), "a", 500.0);
        let cache = Arc::new(cache_over(Arc::clone(&store), 3));

        let (tx, rx) = mpsc::channel(1);
        let handle = spawn_rebuild_task(Arc::clone(&cache), Duration::from_secs(3600), rx);

        for _ in 0..50 {
            if cache.status().last_rebuilt_at.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(store.leaderboard(None).unwrap().len(), 1);

        tx.send(()).await.unwrap();
        handle.await.unwrap();
    }
}
