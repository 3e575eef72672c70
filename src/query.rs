//! Rank/query façade
//!
//! Two read paths with different freshness guarantees:
//!
//! - `top_n` serves the leaderboard cache as-is. Cheap, at most one rebuild
//!   interval stale.
//! - `rank_and_balance` recomputes one principal live and ranks it against
//!   every other principal evaluated at the same instant. Never cached.

use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::accrual::{compute_balances, find_defects};
use crate::error::{EngineError, Result};
use crate::leaderboard::rank_order;
use crate::principal::{display_label, whole_units, OwnedAsset, Principal, Timestamp};
use crate::store::LedgerStore;

/// One row of the public top-N feed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardRow {
    pub rank: u32,
    pub identity: String,
    pub display_name: String,
    pub cumulative_gold: u64,
    pub rate_per_hour: f64,
    pub cached_at: Timestamp,
}

/// Per-principal detail feed, computed live
#[derive(Debug, Clone, Serialize)]
pub struct PrincipalDetail {
    pub identity: String,
    pub display_name: String,
    pub rank: u32,
    pub total_principals: usize,
    pub spendable_gold: u64,
    pub cumulative_gold: u64,
    pub total_spent: u64,
    /// Effective rate; zero while unverified
    pub rate_per_hour: f64,
    pub is_verified: bool,
    pub last_verified_at: Timestamp,
    /// Oracle outages and dropped attestations since the last accepted one
    pub consecutive_oracle_failures: u32,
    pub assets: Vec<OwnedAsset>,
    pub computed_at: Timestamp,
}

pub struct RankQuery {
    store: Arc<dyn LedgerStore>,
    balance_cap: f64,
}

impl RankQuery {
    pub fn new(store: Arc<dyn LedgerStore>, balance_cap: f64) -> Self {
        Self { store, balance_cap }
    }

    /// First `n` cached entries.
    pub fn top_n(&self, n: usize) -> Result<Vec<LeaderboardRow>> {
        Ok(self
            .store
            .leaderboard(Some(n))?
            .into_iter()
            .map(|e| LeaderboardRow {
                rank: e.rank,
                display_name: display_label(&e.identity, e.display_name.as_deref()),
                identity: e.identity,
                cumulative_gold: whole_units(e.value),
                rate_per_hour: e.rate_at_capture,
                cached_at: e.last_cached_at,
            })
            .collect())
    }

    /// Live balances and rank for `identity`. Merged-away addresses resolve
    /// to the record that absorbed them.
    pub fn rank_and_balance(&self, identity: &str, now: Timestamp) -> Result<PrincipalDetail> {
        let principals = self.store.list()?;

        let subject = match principals.iter().find(|p| p.identity == identity) {
            Some(p) => p.clone(),
            None => self
                .store
                .find_by_alternate(identity)?
                .ok_or_else(|| EngineError::NotFound(identity.to_string()))?,
        };

        for defect in find_defects(&subject, self.balance_cap) {
            warn!(identity = %subject.identity, %defect, "Serving clamped balances for defective record");
        }

        let own = compute_balances(&subject, now, self.balance_cap);
        let ahead = principals
            .iter()
            .filter(|p| p.identity != subject.identity)
            .filter(|p| {
                let other = compute_balances(p, now, self.balance_cap);
                rank_order(other.cumulative, &p.identity, own.cumulative, &subject.identity).is_lt()
            })
            .count();

        Ok(PrincipalDetail {
            display_name: subject.display_label(),
            rank: ahead as u32 + 1,
            total_principals: principals.len(),
            spendable_gold: whole_units(own.spendable),
            cumulative_gold: whole_units(own.cumulative),
            total_spent: whole_units(subject.total_spent),
            rate_per_hour: effective_rate(&subject),
            is_verified: subject.is_verified,
            last_verified_at: subject.last_verified_at,
            consecutive_oracle_failures: subject.consecutive_oracle_failures,
            assets: subject.owned_assets,
            computed_at: now,
            identity: subject.identity,
        })
    }
}

fn effective_rate(p: &Principal) -> f64 {
    if p.is_verified {
        p.total_rate_per_hour
    } else {
        0.0
    }
}
