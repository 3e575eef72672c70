//! Accrual calculator
//!
//! Pure balance computation for one principal at a point in time, plus the
//! record transformations built on it (checkpoint and spend). Nothing in
//! here touches storage; the ledger persists whatever these return.
//!
//! Balances stay fractional. Truncation to whole gold units happens only at
//! the read boundary (`principal::whole_units`).

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::principal::{Principal, Timestamp, MILLIS_PER_HOUR};

/// Balances of one principal evaluated at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Balances {
    pub spendable: f64,
    pub cumulative: f64,
    /// Gold credited since `last_verified_at`, after the cap
    pub credited: f64,
}

/// A stored record that breaks a balance invariant
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvariantDefect {
    NegativeSpendable { spendable: f64 },
    NegativeCumulative { cumulative: f64 },
    SpendableAboveCumulative { spendable: f64, cumulative: f64 },
    SpendableAboveCap { spendable: f64, cap: f64 },
}

impl std::fmt::Display for InvariantDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NegativeSpendable { spendable } => {
                write!(f, "spendable balance is negative ({:.2})", spendable)
            }
            Self::NegativeCumulative { cumulative } => {
                write!(f, "cumulative balance is negative ({:.2})", cumulative)
            }
            Self::SpendableAboveCumulative { spendable, cumulative } => write!(
                f,
                "spendable {:.2} exceeds cumulative {:.2}",
                spendable, cumulative
            ),
            Self::SpendableAboveCap { spendable, cap } => {
                write!(f, "spendable {:.2} exceeds cap {:.2}", spendable, cap)
            }
        }
    }
}

/// List every invariant the stored record violates.
pub fn find_defects(principal: &Principal, balance_cap: f64) -> Vec<InvariantDefect> {
    let spendable = principal.spendable_balance;
    let cumulative = principal.cumulative_balance;
    let mut defects = Vec::new();

    if spendable < 0.0 {
        defects.push(InvariantDefect::NegativeSpendable { spendable });
    }
    if cumulative < 0.0 {
        defects.push(InvariantDefect::NegativeCumulative { cumulative });
    }
    if spendable > cumulative {
        defects.push(InvariantDefect::SpendableAboveCumulative {
            spendable,
            cumulative,
        });
    }
    if spendable > balance_cap {
        defects.push(InvariantDefect::SpendableAboveCap {
            spendable,
            cap: balance_cap,
        });
    }
    defects
}

/// Compute a principal's balances at `now`.
///
/// Unverified principals get no time-based growth. Verified principals earn
/// `total_rate_per_hour` for every hour since `last_verified_at`; spendable
/// stops at `balance_cap` and anything beyond it is forfeited, so cumulative
/// only grows by what was actually credited.
///
/// Malformed stored state is clamped for this computation only: negative
/// balances count as zero, spendable is held to the cap and cumulative is
/// raised to at least spendable. The credited delta is never negative.
pub fn compute_balances(principal: &Principal, now: Timestamp, balance_cap: f64) -> Balances {
    let base_spendable = principal.spendable_balance.max(0.0).min(balance_cap);
    let base_cumulative = principal.cumulative_balance.max(base_spendable);

    if !principal.is_verified || principal.total_rate_per_hour <= 0.0 {
        return Balances {
            spendable: base_spendable,
            cumulative: base_cumulative,
            credited: 0.0,
        };
    }

    let elapsed_ms = now.saturating_sub(principal.last_verified_at).max(0) as f64;
    let earned = principal.total_rate_per_hour * (elapsed_ms / MILLIS_PER_HOUR);
    let spendable = (base_spendable + earned).min(balance_cap);
    let credited = (spendable - base_spendable).max(0.0);

    Balances {
        spendable,
        cumulative: base_cumulative + credited,
        credited,
    }
}

/// The record as it would be persisted by a checkpoint at `now`.
///
/// Verified principals have `last_verified_at` advanced to `now` so the next
/// computation starts from the persisted balances. Unverified principals
/// keep theirs; the gate resets it on re-confirmation anyway.
pub fn checkpointed(principal: &Principal, now: Timestamp, balance_cap: f64) -> Principal {
    let balances = compute_balances(principal, now, balance_cap);
    let mut next = principal.clone();
    next.spendable_balance = balances.spendable;
    next.cumulative_balance = balances.cumulative;
    if principal.is_verified {
        next.last_verified_at = now.max(principal.last_verified_at);
    }
    next.checkpointed_at = now;
    next
}

/// The record after spending `amount` at `now`.
///
/// Live accrual up to `now` is folded in first, so gold earned since the last
/// checkpoint is spendable. Cumulative is unaffected by the spend.
pub fn apply_spend(
    principal: &Principal,
    amount: f64,
    now: Timestamp,
    balance_cap: f64,
) -> Result<Principal> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(EngineError::InvalidAmount(amount));
    }

    let mut next = checkpointed(principal, now, balance_cap);
    if next.spendable_balance < amount {
        return Err(EngineError::InsufficientBalance {
            identity: principal.identity.clone(),
            available: next.spendable_balance,
            requested: amount,
        });
    }

    next.spendable_balance -= amount;
    next.total_spent += amount;
    Ok(next)
}
