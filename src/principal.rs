//! Principal record - one per wallet identity
//!
//! Records are created fully initialized on first observation. There are no
//! optional numeric fields: a principal that has never been verified simply
//! has zero balances, no assets and `is_verified = false`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

pub const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// A productive asset contributing to a principal's hourly rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedAsset {
    pub asset_id: String,
    pub rate_per_hour: f64,
}

impl OwnedAsset {
    pub fn new(asset_id: impl Into<String>, rate_per_hour: f64) -> Self {
        Self {
            asset_id: asset_id.into(),
            rate_per_hour,
        }
    }
}

/// One player account keyed by its wallet identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable external key (the wallet identity)
    pub identity: String,
    /// Addresses absorbed from merged duplicate records
    pub alternate_addresses: BTreeSet<String>,
    /// Assets as last attested by the ownership oracle
    pub owned_assets: Vec<OwnedAsset>,
    /// Sum of `owned_assets` rates; kept in step by `set_assets`
    pub total_rate_per_hour: f64,
    /// Gold available to spend, capped
    pub spendable_balance: f64,
    /// All-time earned gold, never capped, never decreases
    pub cumulative_balance: f64,
    /// All-time gold spent
    pub total_spent: f64,
    /// Accrual start point; advanced by checkpoints and confirmations
    pub last_verified_at: Timestamp,
    pub is_verified: bool,
    pub display_name: Option<String>,
    pub created_at: Timestamp,
    /// Time of the last persisted balance checkpoint
    pub checkpointed_at: Timestamp,
    /// Oracle outages and implausible attestations since the last accepted one
    #[serde(default)]
    pub consecutive_oracle_failures: u32,
    /// Compare-and-swap version, bumped by the store on every write
    pub version: u64,
}

impl Principal {
    /// Fresh, unverified record for an identity observed for the first time.
    pub fn new(identity: impl Into<String>, now: Timestamp) -> Self {
        Self {
            identity: identity.into(),
            alternate_addresses: BTreeSet::new(),
            owned_assets: Vec::new(),
            total_rate_per_hour: 0.0,
            spendable_balance: 0.0,
            cumulative_balance: 0.0,
            total_spent: 0.0,
            last_verified_at: now,
            is_verified: false,
            display_name: None,
            created_at: now,
            checkpointed_at: now,
            consecutive_oracle_failures: 0,
            version: 0,
        }
    }

    /// Replace the asset list and re-derive the total rate.
    pub fn set_assets(&mut self, assets: Vec<OwnedAsset>) {
        self.total_rate_per_hour = assets.iter().map(|a| a.rate_per_hour.max(0.0)).sum();
        self.owned_assets = assets;
    }

    /// Display name, or a shortened identity when none is set.
    pub fn display_label(&self) -> String {
        display_label(&self.identity, self.display_name.as_deref())
    }
}

/// `stake1u8...a3f9c2` style label used by the feeds.
pub fn display_label(identity: &str, display_name: Option<&str>) -> String {
    if let Some(name) = display_name {
        return name.to_string();
    }
    let chars: Vec<char> = identity.chars().collect();
    if chars.len() <= 14 {
        return identity.to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 6..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Truncate a fractional balance to whole gold units for display.
pub fn whole_units(balance: f64) -> u64 {
    if balance.is_finite() && balance > 0.0 {
        balance.trunc() as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_principal_is_unverified_and_empty() {
        let p = Principal::new("stake1abc", 1_000);
        assert!(!p.is_verified);
        assert_eq!(p.spendable_balance, 0.0);
        assert_eq!(p.cumulative_balance, 0.0);
        assert_eq!(p.last_verified_at, 1_000);
        assert_eq!(p.consecutive_oracle_failures, 0);
        assert_eq!(p.version, 0);
    }

    #[test]
    fn test_set_assets_rederives_rate() {
        let mut p = Principal::new("stake1abc", 0);
        p.set_assets(vec![OwnedAsset::new("mek-1", 10.5), OwnedAsset::new("mek-2", 3.5)]);
        assert_eq!(p.total_rate_per_hour, 14.0);

        p.set_assets(vec![OwnedAsset::new("mek-3", 2.0)]);
        assert_eq!(p.total_rate_per_hour, 2.0);
        assert_eq!(p.owned_assets.len(), 1);
    }

    #[test]
    fn test_display_label_shortens_long_identity() {
        let label = display_label("stake1u8abcdefghijklmnopqrstuvwxyz", None);
        assert_eq!(label, "stake1u8...uvwxyz");
        assert_eq!(display_label("short", None), "short");
        assert_eq!(display_label("stake1u8abcdefghijklmnop", Some("Acme")), "Acme");
    }

    #[test]
    fn test_whole_units_truncates() {
        assert_eq!(whole_units(123.999), 123);
        assert_eq!(whole_units(-4.0), 0);
        assert_eq!(whole_units(f64::NAN), 0);
    }
}
