//! Verification gate
//!
//! Ownership is attested by an external oracle (the blockchain indexer).
//! This module holds the oracle seam and the rule that turns an attestation
//! into a record update:
//!
//! - A verified principal is checkpointed to the observation time before
//!   anything changes, so a rate change or a revocation neither creates nor
//!   destroys accrual that already happened.
//! - On false -> true, accrual restarts from the confirmation time. It is
//!   never moved earlier than the record's current `last_verified_at`, which
//!   for an unverified record is the last time the gate was observed closed.
//!   Gold for an unverified window is forfeited.
//! - An unreachable oracle counts as "not verified". Assets are left alone.
//! - A verified attestation listing no assets for a record that has some is
//!   an indexer glitch, not a sale of everything. It is dropped and the record
//!   keeps its assets and gate state.
//!
//! Outages and dropped attestations both count toward the record's
//! consecutive failure counter; any accepted attestation resets it.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use reqwest::Url;
use std::time::Duration;
use tracing::debug;

use crate::accrual::checkpointed;
use crate::principal::{OwnedAsset, Principal, Timestamp};

// ============================================================================
// Oracle
// ============================================================================

/// Consecutive failures at which a record is reported for operator attention
pub const ORACLE_FAILURE_ALERT_THRESHOLD: u32 = 3;

/// Oracle answer for one identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnershipAttestation {
    pub is_verified: bool,
    /// When the oracle confirmed ownership (ms since epoch)
    pub confirmed_at: Timestamp,
    pub assets: Vec<OwnedAsset>,
}

impl OwnershipAttestation {
    pub fn verified(confirmed_at: Timestamp, assets: Vec<OwnedAsset>) -> Self {
        Self {
            is_verified: true,
            confirmed_at,
            assets,
        }
    }

    pub fn unverified() -> Self {
        Self {
            is_verified: false,
            confirmed_at: 0,
            assets: Vec::new(),
        }
    }
}

/// Error types for oracle calls
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// Oracle could not be reached
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    /// Oracle answered with a failure status
    #[error("Oracle rejected request: {0}")]
    Rejected(String),

    /// Oracle answer could not be decoded
    #[error("Oracle response parse error: {0}")]
    Parse(String),

    /// Configured base URL cannot carry a path
    #[error("Invalid oracle URL: {0}")]
    InvalidUrl(String),
}

/// Source of truth for asset ownership and the verification flag.
#[async_trait]
pub trait OwnershipOracle: Send + Sync {
    async fn verify_ownership(&self, identity: &str) -> Result<OwnershipAttestation, OracleError>;
}

/// Oracle reached over HTTP: `GET {base_url}/ownership/{identity}`
pub struct HttpOracle {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpOracle {
    pub fn new(base_url: impl AsRef<str>, timeout: Duration) -> Result<Self, OracleError> {
        let base_url = Url::parse(base_url.as_ref()).map_err(|e| OracleError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(OracleError::InvalidUrl(base_url.to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        Ok(Self { base_url, client })
    }

    /// Identity is pushed as a single percent-encoded path segment.
    pub fn ownership_url(&self, identity: &str) -> Result<Url, OracleError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| OracleError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("ownership")
            .push(identity);
        Ok(url)
    }
}

#[async_trait]
impl OwnershipOracle for HttpOracle {
    async fn verify_ownership(&self, identity: &str) -> Result<OwnershipAttestation, OracleError> {
        let url = self.ownership_url(identity)?;
        debug!(url = %url, "Querying ownership oracle");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OracleError::Rejected(format!("HTTP {}", response.status())));
        }

        response
            .json::<OwnershipAttestation>()
            .await
            .map_err(|e| OracleError::Parse(e.to_string()))
    }
}

/// In-process oracle backed by a map. Unknown identities are unverified.
#[derive(Default)]
pub struct StaticOracle {
    attestations: DashMap<String, OwnershipAttestation>,
    unavailable: AtomicBool,
}

impl StaticOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, identity: impl Into<String>, attestation: OwnershipAttestation) {
        self.attestations.insert(identity.into(), attestation);
    }

    pub fn remove(&self, identity: &str) {
        self.attestations.remove(identity);
    }

    /// Simulate an outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }
}

#[async_trait]
impl OwnershipOracle for StaticOracle {
    async fn verify_ownership(&self, identity: &str) -> Result<OwnershipAttestation, OracleError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("static oracle offline".to_string()));
        }
        Ok(self
            .attestations
            .get(identity)
            .map(|a| a.value().clone())
            .unwrap_or_else(OwnershipAttestation::unverified))
    }
}

// ============================================================================
// Gate
// ============================================================================

/// What an attestation did to the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateTransition {
    /// false -> true
    Confirmed,
    /// true -> true, balances checkpointed and assets refreshed
    Reconfirmed,
    /// true -> false, accrual stops at the observation time
    Revoked,
    /// false -> false
    StillUnverified,
    /// Verified with no assets while the record has some; nothing applied
    AssetsRejected,
}

/// Whether an attestation would strip every asset from a record that has some.
pub fn is_implausible(principal: &Principal, attestation: &OwnershipAttestation) -> bool {
    attestation.is_verified && attestation.assets.is_empty() && !principal.owned_assets.is_empty()
}

/// Apply an oracle result to a record. `None` means the oracle was unreachable.
pub fn apply_attestation(
    principal: &Principal,
    attestation: Option<&OwnershipAttestation>,
    now: Timestamp,
    balance_cap: f64,
) -> (Principal, GateTransition) {
    if let Some(att) = attestation.filter(|att| is_implausible(principal, att)) {
        debug!(identity = %principal.identity, confirmed_at = att.confirmed_at, "Dropping empty asset attestation");
        let mut kept = principal.clone();
        kept.consecutive_oracle_failures = kept.consecutive_oracle_failures.saturating_add(1);
        return (kept, GateTransition::AssetsRejected);
    }

    let was_verified = principal.is_verified;
    let mut next = if was_verified {
        checkpointed(principal, now, balance_cap)
    } else {
        principal.clone()
    };

    let is_verified = match attestation {
        Some(att) => {
            next.set_assets(att.assets.clone());
            next.consecutive_oracle_failures = 0;
            att.is_verified
        }
        None => {
            next.consecutive_oracle_failures = next.consecutive_oracle_failures.saturating_add(1);
            false
        }
    };

    let transition = match (was_verified, is_verified) {
        (false, true) => {
            let confirmed_at = attestation.map(|a| a.confirmed_at).unwrap_or(now);
            next.last_verified_at = confirmed_at.max(principal.last_verified_at);
            GateTransition::Confirmed
        }
        (true, true) => GateTransition::Reconfirmed,
        (true, false) => GateTransition::Revoked,
        (false, false) => {
            // Latest moment the gate was seen closed; a later confirmation cannot predate it
            next.last_verified_at = now.max(principal.last_verified_at);
            GateTransition::StillUnverified
        }
    };
    next.is_verified = is_verified;

    (next, transition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accrual::compute_balances;

    const HOUR: i64 = 3_600_000;
    const CAP: f64 = 50_000.0;

    fn mek(rate: f64) -> Vec<OwnedAsset> {
        vec![OwnedAsset::new("mek-1", rate)]
    }

    #[test]
    fn test_confirmation_starts_accrual_at_confirmation_time() {
        let p = Principal::new("stake1x", 0);
        let att = OwnershipAttestation::verified(5 * HOUR, mek(10.0));
        let (next, transition) = apply_attestation(&p, Some(&att), 6 * HOUR, CAP);

        assert_eq!(transition, GateTransition::Confirmed);
        assert!(next.is_verified);
        assert_eq!(next.last_verified_at, 5 * HOUR);
        assert_eq!(next.total_rate_per_hour, 10.0);

        // Nothing for the unverified hours 0..5
        let b = compute_balances(&next, 6 * HOUR, CAP);
        assert!((b.spendable - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_confirmation_is_never_backdated() {
        let mut p = Principal::new("stake1x", 0);
        p.last_verified_at = 8 * HOUR;
        let att = OwnershipAttestation::verified(2 * HOUR, mek(10.0));
        let (next, _) = apply_attestation(&p, Some(&att), 9 * HOUR, CAP);
        assert_eq!(next.last_verified_at, 8 * HOUR);
    }

    #[test]
    fn test_unverified_observation_moves_confirmation_floor() {
        let p = Principal::new("stake1x", 0);
        let (seen, transition) =
            apply_attestation(&p, Some(&OwnershipAttestation::unverified()), 4 * HOUR, CAP);
        assert_eq!(transition, GateTransition::StillUnverified);
        assert_eq!(seen.last_verified_at, 4 * HOUR);

        let att = OwnershipAttestation::verified(HOUR, mek(10.0));
        let (confirmed, _) = apply_attestation(&seen, Some(&att), 5 * HOUR, CAP);
        assert_eq!(confirmed.last_verified_at, 4 * HOUR);
    }

    #[test]
    fn test_revocation_keeps_earned_gold() {
        let mut p = Principal::new("stake1x", 0);
        p.set_assets(mek(10.0));
        p.is_verified = true;

        let (next, transition) =
            apply_attestation(&p, Some(&OwnershipAttestation::unverified()), 3 * HOUR, CAP);
        assert_eq!(transition, GateTransition::Revoked);
        assert!(!next.is_verified);
        assert!((next.spendable_balance - 30.0).abs() < 1e-9);
        assert!((next.cumulative_balance - 30.0).abs() < 1e-9);
        assert_eq!(next.last_verified_at, 3 * HOUR);

        // Unverified window earns nothing
        let b = compute_balances(&next, 50 * HOUR, CAP);
        assert!((b.spendable - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_oracle_outage_counts_as_unverified_and_keeps_assets() {
        let mut p = Principal::new("stake1x", 0);
        p.set_assets(mek(10.0));
        p.is_verified = true;

        let (next, transition) = apply_attestation(&p, None, HOUR, CAP);
        assert_eq!(transition, GateTransition::Revoked);
        assert!(!next.is_verified);
        assert_eq!(next.owned_assets, mek(10.0));
        assert!((next.spendable_balance - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_reconfirmation_applies_new_rate_forward_only() {
        let mut p = Principal::new("stake1x", 0);
        p.set_assets(mek(10.0));
        p.is_verified = true;

        let att = OwnershipAttestation::verified(0, mek(100.0));
        let (next, transition) = apply_attestation(&p, Some(&att), 2 * HOUR, CAP);
        assert_eq!(transition, GateTransition::Reconfirmed);
        assert_eq!(next.last_verified_at, 2 * HOUR);

        let b = compute_balances(&next, 3 * HOUR, CAP);
        assert!((b.spendable - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_asset_attestation_keeps_record() {
        let mut p = Principal::new("stake1x", 0);
        p.set_assets(mek(10.0));
        p.is_verified = true;

        let glitch = OwnershipAttestation::verified(2 * HOUR, Vec::new());
        let (next, transition) = apply_attestation(&p, Some(&glitch), 2 * HOUR, CAP);
        assert_eq!(transition, GateTransition::AssetsRejected);
        assert!(next.is_verified);
        assert_eq!(next.owned_assets, mek(10.0));
        assert_eq!(next.total_rate_per_hour, 10.0);
        assert_eq!(next.last_verified_at, 0);
        assert_eq!(next.consecutive_oracle_failures, 1);

        // Accrual is undisturbed
        let b = compute_balances(&next, 3 * HOUR, CAP);
        assert!((b.spendable - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_assets_on_empty_record_are_accepted() {
        let p = Principal::new("stake1x", 0);
        let att = OwnershipAttestation::verified(HOUR, Vec::new());
        let (next, transition) = apply_attestation(&p, Some(&att), HOUR, CAP);
        assert_eq!(transition, GateTransition::Confirmed);
        assert_eq!(next.total_rate_per_hour, 0.0);
        assert_eq!(next.consecutive_oracle_failures, 0);
    }

    #[test]
    fn test_failure_counter_counts_outages_and_resets_on_success() {
        let mut p = Principal::new("stake1x", 0);
        p.set_assets(mek(10.0));
        p.is_verified = true;

        let (p, _) = apply_attestation(&p, None, HOUR, CAP);
        let (p, _) = apply_attestation(&p, Some(&OwnershipAttestation::verified(0, Vec::new())), 2 * HOUR, CAP);
        let (p, _) = apply_attestation(&p, None, 3 * HOUR, CAP);
        assert_eq!(p.consecutive_oracle_failures, ORACLE_FAILURE_ALERT_THRESHOLD);
        assert_eq!(p.owned_assets, mek(10.0));

        let (p, transition) =
            apply_attestation(&p, Some(&OwnershipAttestation::verified(4 * HOUR, mek(5.0))), 4 * HOUR, CAP);
        assert_eq!(transition, GateTransition::Confirmed);
        assert_eq!(p.consecutive_oracle_failures, 0);
        assert_eq!(p.total_rate_per_hour, 5.0);
    }

    #[test]
    fn test_ownership_url_encodes_identity_as_one_segment() {
        let oracle = HttpOracle::new("http://oracle.local/api/", Duration::from_secs(1)).unwrap();
        let url = oracle.ownership_url("stake1/../admin?x=1#frag").unwrap();

        assert!(url.as_str().starts_with("http://oracle.local/api/ownership/"));
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
        let segments: Vec<&str> = url.path_segments().unwrap().collect();
        assert_eq!(segments.len(), 3);
        assert!(segments[2].starts_with("stake1%2F..%2Fadmin%3F"));

        let bare = HttpOracle::new("http://oracle.local", Duration::from_secs(1)).unwrap();
        assert_eq!(
            bare.ownership_url("stake1abc").unwrap().as_str(),
            "http://oracle.local/ownership/stake1abc"
        );
    }

    #[test]
    fn test_http_oracle_rejects_unusable_base() {
        assert!(matches!(
            HttpOracle::new("mailto:ops@example.com", Duration::from_secs(1)),
            Err(OracleError::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpOracle::new("not a url", Duration::from_secs(1)),
            Err(OracleError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_static_oracle() {
        let oracle = StaticOracle::new();
        oracle.set("stake1a", OwnershipAttestation::verified(10, mek(5.0)));

        let att = oracle.verify_ownership("stake1a").await.unwrap();
        assert!(att.is_verified);

        let unknown = oracle.verify_ownership("stake1zzz").await.unwrap();
        assert!(!unknown.is_verified);

        oracle.set_available(false);
        assert!(matches!(
            oracle.verify_ownership("stake1a").await,
            Err(OracleError::Unavailable(_))
        ));
    }
}
