//! gold-accrual: passive gold accrual engine for an idle game economy
//!
//! Each principal (a wallet identity) owns productive assets that earn gold
//! continuously while ownership is verified by an external oracle. The engine
//! provides:
//! - Live balance computation with a spendable cap (`accrual`)
//! - The verification gate and oracle clients (`verification`)
//! - Per-principal writes: checkpoint, spend, verification refresh (`ledger`)
//! - A periodically rebuilt top-N leaderboard cache (`leaderboard`)
//! - Duplicate detection and operator-confirmed merges (`reconcile`)
//! - Operator balance backups with restore and cleanup (`backup`)
//! - Cached and live read paths (`query`, `api`)

pub mod accrual;
pub mod api;
pub mod backup;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod leaderboard;
pub mod ledger;
pub mod locks;
pub mod principal;
pub mod query;
pub mod reconcile;
pub mod store;
pub mod verification;

pub use config::Config;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use principal::{OwnedAsset, Principal, Timestamp};
pub use store::{LedgerStore, SqliteStore};
pub use verification::{HttpOracle, OwnershipAttestation, OwnershipOracle, StaticOracle};
