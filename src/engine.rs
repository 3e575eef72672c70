//! Engine assembly
//!
//! Wires the store, the oracle and the shared identity locks into the
//! components. Everything is `Arc`-shared so the HTTP layer, the scheduler
//! and CLI commands can hold the same instances.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::backup::BackupManager;
use crate::config::{Config, EngineConfig};
use crate::error::{EngineError, Result};
use crate::leaderboard::{LeaderboardCache, LeaderboardConfig};
use crate::ledger::Ledger;
use crate::locks::IdentityLocks;
use crate::query::RankQuery;
use crate::reconcile::IdentityReconciler;
use crate::store::{LedgerStore, SqliteStore};
use crate::verification::{HttpOracle, OwnershipOracle, StaticOracle};

#[derive(Clone)]
pub struct Engine {
    pub config: EngineConfig,
    pub store: Arc<dyn LedgerStore>,
    pub ledger: Arc<Ledger>,
    pub cache: Arc<LeaderboardCache>,
    pub query: Arc<RankQuery>,
    pub reconciler: Arc<IdentityReconciler>,
    pub backups: Arc<BackupManager>,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Arc<dyn LedgerStore>, oracle: Arc<dyn OwnershipOracle>) -> Self {
        let locks = Arc::new(IdentityLocks::new());
        let cap = config.balance_cap;

        let ledger = Ledger::new(
            Arc::clone(&store),
            Arc::clone(&oracle),
            Arc::clone(&locks),
            cap,
            Duration::from_secs(config.checkpoint_debounce_secs),
        );
        let cache = LeaderboardCache::new(Arc::clone(&store), LeaderboardConfig::from(&config));
        let query = RankQuery::new(Arc::clone(&store), cap);
        let reconciler = IdentityReconciler::new(Arc::clone(&store), oracle, Arc::clone(&locks), cap);
        let backups = BackupManager::new(Arc::clone(&store), locks, cap);

        Self {
            config,
            store,
            ledger: Arc::new(ledger),
            cache: Arc::new(cache),
            query: Arc::new(query),
            reconciler: Arc::new(reconciler),
            backups: Arc::new(backups),
        }
    }

    /// Open the on-disk store and build the oracle named in `config`.
    ///
    /// Without an oracle URL every refresh sees an empty in-process oracle,
    /// which reads as "not verified".
    pub fn from_config(config: &Config) -> Result<Self> {
        let store: Arc<dyn LedgerStore> = Arc::new(SqliteStore::open(&config.storage.data_dir)?);

        let oracle: Arc<dyn OwnershipOracle> = match &config.oracle.url {
            Some(url) => {
                info!(url = %url, "Using HTTP ownership oracle");
                let oracle = HttpOracle::new(url, Duration::from_secs(config.oracle.timeout_secs))
                    .map_err(|e| EngineError::Config(e.to_string()))?;
                Arc::new(oracle)
            }
            None => {
                info!("No oracle configured, all principals read as unverified");
                Arc::new(StaticOracle::new())
            }
        };

        Ok(Self::new(config.engine.clone(), store, oracle))
    }
}
