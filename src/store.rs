//! Principal store
//!
//! SQLite is the single source of truth for principals. The leaderboard
//! cache lives in the same database as a read-optimized copy.
//!
//! ## Tables
//!
//! - `principals` - one row per identity; JSON columns for alternate
//!   addresses and assets; `version` for compare-and-swap
//! - `leaderboard_cache` - ranked entries, `rank` is the key
//! - `leaderboard_meta` - cache version counter
//! - `balance_backups`, `balance_backup_records` - operator balance snapshots
//! - `verification_runs` - one row per batch verification refresh
//! - `schema_version` - single row, bumped by migrations

use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::backup::{BackupInfo, BackupRecord};
use crate::error::{EngineError, Result};
use crate::leaderboard::{LeaderboardEntry, LeaderboardWrites};
use crate::ledger::VerificationRun;
use crate::principal::{Principal, Timestamp};

/// Storage operations used by the engine.
///
/// Every method is atomic. `update` and `merge` are compare-and-swap on the
/// record `version`; the stored version is bumped on every successful write.
pub trait LedgerStore: Send + Sync {
    fn get(&self, identity: &str) -> Result<Option<Principal>>;

    fn list(&self) -> Result<Vec<Principal>>;

    /// The record that absorbed `address` in an earlier merge, if any.
    fn find_by_alternate(&self, address: &str) -> Result<Option<Principal>>;

    /// Insert a new record. Fails with `AlreadyExists` if the identity is taken.
    fn insert(&self, principal: &Principal) -> Result<Principal>;

    /// Write `principal` if the stored version still equals `principal.version`.
    fn update(&self, principal: &Principal) -> Result<Principal>;

    /// Compare-and-swap write of several records, all or nothing.
    fn update_many(&self, principals: &[Principal]) -> Result<Vec<Principal>>;

    /// Write the merged target and delete `removed`, all or nothing.
    fn merge(&self, target: &Principal, removed: &[Principal]) -> Result<Principal>;

    /// Whether another identity already uses `name` (case-insensitive).
    fn display_name_taken(&self, name: &str, except_identity: &str) -> Result<bool>;

    /// Cached entries ordered by rank.
    fn leaderboard(&self, limit: Option<usize>) -> Result<Vec<LeaderboardEntry>>;

    fn leaderboard_entry(&self, identity: &str) -> Result<Option<LeaderboardEntry>>;

    fn leaderboard_version(&self) -> Result<u64>;

    /// Apply one rebuild's writes in a single transaction and bump the cache version.
    fn apply_leaderboard(&self, writes: &LeaderboardWrites) -> Result<u64>;

    /// Store a backup header and its records in one transaction.
    fn insert_backup(&self, info: &BackupInfo, records: &[BackupRecord]) -> Result<()>;

    /// Backup headers, newest first.
    fn list_backups(&self) -> Result<Vec<BackupInfo>>;

    fn get_backup(&self, backup_id: &str) -> Result<Option<BackupInfo>>;

    fn backup_records(&self, backup_id: &str) -> Result<Vec<BackupRecord>>;

    /// Delete backups created before `cutoff`. Returns (backups, records) removed.
    fn delete_backups_before(&self, cutoff: Timestamp) -> Result<(usize, usize)>;

    fn record_verification_run(&self, run: &VerificationRun) -> Result<()>;

    /// Most recent runs first.
    fn verification_runs(&self, limit: usize) -> Result<Vec<VerificationRun>>;
}

/// Current schema version
pub const SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS principals (
    identity TEXT PRIMARY KEY,
    alternate_addresses TEXT NOT NULL DEFAULT '[]',
    owned_assets TEXT NOT NULL DEFAULT '[]',
    total_rate_per_hour REAL NOT NULL DEFAULT 0,
    spendable_balance REAL NOT NULL DEFAULT 0,
    cumulative_balance REAL NOT NULL DEFAULT 0,
    total_spent REAL NOT NULL DEFAULT 0,
    last_verified_at INTEGER NOT NULL,
    is_verified INTEGER NOT NULL DEFAULT 0,
    display_name TEXT,
    created_at INTEGER NOT NULL,
    checkpointed_at INTEGER NOT NULL,
    consecutive_oracle_failures INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_principals_display_name
    ON principals (lower(display_name));

CREATE TABLE IF NOT EXISTS leaderboard_cache (
    rank INTEGER PRIMARY KEY,
    identity TEXT NOT NULL,
    display_name TEXT,
    value REAL NOT NULL,
    rate_at_capture REAL NOT NULL,
    last_cached_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_leaderboard_identity ON leaderboard_cache (identity);

CREATE TABLE IF NOT EXISTS leaderboard_meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

/// Tables added in schema v2; safe to run on any version
const SCHEMA_V2: &str = "
CREATE TABLE IF NOT EXISTS balance_backups (
    backup_id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    kind TEXT NOT NULL,
    label TEXT,
    principal_count INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_balance_backups_created ON balance_backups (created_at);

CREATE TABLE IF NOT EXISTS balance_backup_records (
    backup_id TEXT NOT NULL,
    identity TEXT NOT NULL,
    spendable_balance REAL NOT NULL,
    cumulative_balance REAL NOT NULL,
    total_spent REAL NOT NULL,
    total_rate_per_hour REAL NOT NULL,
    is_verified INTEGER NOT NULL,
    PRIMARY KEY (backup_id, identity)
);

CREATE TABLE IF NOT EXISTS verification_runs (
    run_id TEXT PRIMARY KEY,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    summary TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_verification_runs_started ON verification_runs (started_at);
";

const PRINCIPAL_COLUMNS: &str = "identity, alternate_addresses, owned_assets, total_rate_per_hour, \
     spendable_balance, cumulative_balance, total_spent, last_verified_at, is_verified, \
     display_name, created_at, checkpointed_at, consecutive_oracle_failures, version";

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create `ledger.db` under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("ledger.db");
        info!(path = %db_path.display(), "Opening ledger database");

        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory ledger database");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")?;
    let recorded: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;
    let has_principals: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'principals')",
        [],
        |row| row.get(0),
    )?;

    // Databases from before version tracking are v1
    let current = match (recorded, has_principals) {
        (Some(version), _) => version,
        (None, true) => 1,
        (None, false) => 0,
    };

    if current == 0 {
        info!("Creating ledger schema v{}", SCHEMA_VERSION);
        conn.execute_batch(SCHEMA)?;
    } else if current < SCHEMA_VERSION {
        info!("Migrating ledger schema from v{} to v{}", current, SCHEMA_VERSION);
        if current < 2 {
            conn.execute_batch(
                "ALTER TABLE principals ADD COLUMN consecutive_oracle_failures INTEGER NOT NULL DEFAULT 0",
            )?;
        }
    }
    conn.execute_batch(SCHEMA_V2)?;

    if current != SCHEMA_VERSION {
        conn.execute("DELETE FROM schema_version", [])?;
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])?;
    }
    Ok(())
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_principal(row: &Row) -> rusqlite::Result<Principal> {
    let failures: i64 = row.get(12)?;
    let version: i64 = row.get(13)?;
    Ok(Principal {
        identity: row.get(0)?,
        alternate_addresses: json_column(row, 1)?,
        owned_assets: json_column(row, 2)?,
        total_rate_per_hour: row.get(3)?,
        spendable_balance: row.get(4)?,
        cumulative_balance: row.get(5)?,
        total_spent: row.get(6)?,
        last_verified_at: row.get(7)?,
        is_verified: row.get(8)?,
        display_name: row.get(9)?,
        created_at: row.get(10)?,
        checkpointed_at: row.get(11)?,
        consecutive_oracle_failures: failures.clamp(0, i64::from(u32::MAX)) as u32,
        version: version.max(0) as u64,
    })
}

fn row_to_entry(row: &Row) -> rusqlite::Result<LeaderboardEntry> {
    let rank: i64 = row.get(0)?;
    Ok(LeaderboardEntry {
        rank: rank.max(0) as u32,
        identity: row.get(1)?,
        display_name: row.get(2)?,
        value: row.get(3)?,
        rate_at_capture: row.get(4)?,
        last_cached_at: row.get(5)?,
    })
}

fn select_principal(conn: &Connection, identity: &str) -> Result<Option<Principal>> {
    let sql = format!("SELECT {} FROM principals WHERE identity = ?1", PRINCIPAL_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.query_row([identity], row_to_principal).optional()?)
}

/// CAS write of every mutable column. Returns the record with its new version.
fn cas_update(conn: &Connection, p: &Principal) -> Result<Principal> {
    let changed = conn.execute(
        "UPDATE principals SET
            alternate_addresses = ?2, owned_assets = ?3, total_rate_per_hour = ?4,
            spendable_balance = ?5, cumulative_balance = ?6, total_spent = ?7,
            last_verified_at = ?8, is_verified = ?9, display_name = ?10,
            created_at = ?11, checkpointed_at = ?12, consecutive_oracle_failures = ?13,
            version = version + 1
         WHERE identity = ?1 AND version = ?14",
        params![
            p.identity,
            serde_json::to_string(&p.alternate_addresses)?,
            serde_json::to_string(&p.owned_assets)?,
            p.total_rate_per_hour,
            p.spendable_balance,
            p.cumulative_balance,
            p.total_spent,
            p.last_verified_at,
            p.is_verified,
            p.display_name,
            p.created_at,
            p.checkpointed_at,
            p.consecutive_oracle_failures,
            p.version as i64,
        ],
    )?;

    if changed == 0 {
        return match select_principal(conn, &p.identity)? {
            None => Err(EngineError::NotFound(p.identity.clone())),
            Some(current) => Err(EngineError::VersionConflict {
                identity: p.identity.clone(),
                expected: p.version,
                actual: current.version,
            }),
        };
    }

    let mut stored = p.clone();
    stored.version = p.version + 1;
    Ok(stored)
}

impl LedgerStore for SqliteStore {
    fn get(&self, identity: &str) -> Result<Option<Principal>> {
        self.with_conn(|conn| select_principal(conn, identity))
    }

    fn list(&self) -> Result<Vec<Principal>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM principals ORDER BY identity", PRINCIPAL_COLUMNS);
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map([], row_to_principal)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn find_by_alternate(&self, address: &str) -> Result<Option<Principal>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM principals
                 WHERE EXISTS (SELECT 1 FROM json_each(principals.alternate_addresses) WHERE value = ?1)
                 ORDER BY identity LIMIT 1",
                PRINCIPAL_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            Ok(stmt.query_row([address], row_to_principal).optional()?)
        })
    }

    fn insert(&self, p: &Principal) -> Result<Principal> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO principals (
                    identity, alternate_addresses, owned_assets, total_rate_per_hour,
                    spendable_balance, cumulative_balance, total_spent, last_verified_at,
                    is_verified, display_name, created_at, checkpointed_at,
                    consecutive_oracle_failures, version
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1)
                 ON CONFLICT(identity) DO NOTHING",
                params![
                    p.identity,
                    serde_json::to_string(&p.alternate_addresses)?,
                    serde_json::to_string(&p.owned_assets)?,
                    p.total_rate_per_hour,
                    p.spendable_balance,
                    p.cumulative_balance,
                    p.total_spent,
                    p.last_verified_at,
                    p.is_verified,
                    p.display_name,
                    p.created_at,
                    p.checkpointed_at,
                    p.consecutive_oracle_failures,
                ],
            )?;

            if inserted == 0 {
                return Err(EngineError::AlreadyExists(p.identity.clone()));
            }
            debug!(identity = %p.identity, "Inserted principal");

            let mut stored = p.clone();
            stored.version = 1;
            Ok(stored)
        })
    }

    fn update(&self, p: &Principal) -> Result<Principal> {
        self.with_conn(|conn| cas_update(conn, p))
    }

    fn update_many(&self, principals: &[Principal]) -> Result<Vec<Principal>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let stored = principals
                .iter()
                .map(|p| cas_update(&tx, p))
                .collect::<Result<Vec<_>>>()?;
            tx.commit()?;
            Ok(stored)
        })
    }

    fn merge(&self, target: &Principal, removed: &[Principal]) -> Result<Principal> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let stored = cas_update(&tx, target)?;

            for dup in removed {
                let deleted = tx.execute(
                    "DELETE FROM principals WHERE identity = ?1 AND version = ?2",
                    params![dup.identity, dup.version as i64],
                )?;
                if deleted == 0 {
                    // Dropping `tx` rolls back the target update as well
                    return Err(match select_principal(&tx, &dup.identity)? {
                        None => EngineError::NotFound(dup.identity.clone()),
                        Some(current) => EngineError::VersionConflict {
                            identity: dup.identity.clone(),
                            expected: dup.version,
                            actual: current.version,
                        },
                    });
                }
            }

            tx.commit()?;
            Ok(stored)
        })
    }

    fn display_name_taken(&self, name: &str, except_identity: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM principals
                 WHERE lower(display_name) = lower(?1) AND identity != ?2",
                params![name, except_identity],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    fn leaderboard(&self, limit: Option<usize>) -> Result<Vec<LeaderboardEntry>> {
        self.with_conn(|conn| {
            let limit = limit.map(|n| n as i64).unwrap_or(-1);
            let mut stmt = conn.prepare_cached(
                "SELECT rank, identity, display_name, value, rate_at_capture, last_cached_at
                 FROM leaderboard_cache ORDER BY rank ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], row_to_entry)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn leaderboard_entry(&self, identity: &str) -> Result<Option<LeaderboardEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT rank, identity, display_name, value, rate_at_capture, last_cached_at
                 FROM leaderboard_cache WHERE identity = ?1 ORDER BY rank ASC LIMIT 1",
            )?;
            Ok(stmt.query_row([identity], row_to_entry).optional()?)
        })
    }

    fn leaderboard_version(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let version: Option<i64> = conn
                .query_row(
                    "SELECT value FROM leaderboard_meta WHERE key = 'version'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(version.unwrap_or(0).max(0) as u64)
        })
    }

    fn apply_leaderboard(&self, writes: &LeaderboardWrites) -> Result<u64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            for rank in &writes.evictions {
                tx.execute("DELETE FROM leaderboard_cache WHERE rank = ?1", [*rank as i64])?;
            }
            for e in &writes.inserts {
                tx.execute(
                    "INSERT INTO leaderboard_cache
                        (rank, identity, display_name, value, rate_at_capture, last_cached_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        e.rank as i64,
                        e.identity,
                        e.display_name,
                        e.value,
                        e.rate_at_capture,
                        e.last_cached_at
                    ],
                )?;
            }
            for e in &writes.updates {
                let changed = tx.execute(
                    "UPDATE leaderboard_cache
                     SET identity = ?2, display_name = ?3, value = ?4,
                         rate_at_capture = ?5, last_cached_at = ?6
                     WHERE rank = ?1",
                    params![
                        e.rank as i64,
                        e.identity,
                        e.display_name,
                        e.value,
                        e.rate_at_capture,
                        e.last_cached_at
                    ],
                )?;
                if changed == 0 {
                    return Err(EngineError::Internal(format!(
                        "leaderboard rank {} vanished during rebuild",
                        e.rank
                    )));
                }
            }

            tx.execute(
                "INSERT INTO leaderboard_meta (key, value) VALUES ('version', 1)
                 ON CONFLICT(key) DO UPDATE SET value = value + 1",
                [],
            )?;
            let version: i64 = tx.query_row(
                "SELECT value FROM leaderboard_meta WHERE key = 'version'",
                [],
                |row| row.get(0),
            )?;

            tx.commit()?;
            Ok(version.max(0) as u64)
        })
    }

    fn insert_backup(&self, info: &BackupInfo, records: &[BackupRecord]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO balance_backups (backup_id, created_at, kind, label, principal_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    info.backup_id,
                    info.created_at,
                    info.kind.as_str(),
                    info.label,
                    info.principal_count as i64
                ],
            )?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO balance_backup_records
                        (backup_id, identity, spendable_balance, cumulative_balance,
                         total_spent, total_rate_per_hour, is_verified)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for r in records {
                    stmt.execute(params![
                        info.backup_id,
                        r.identity,
                        r.spendable_balance,
                        r.cumulative_balance,
                        r.total_spent,
                        r.total_rate_per_hour,
                        r.is_verified
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT backup_id, created_at, kind, label, principal_count
                 FROM balance_backups ORDER BY created_at DESC, backup_id ASC",
            )?;
            let rows = stmt.query_map([], row_to_backup)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn get_backup(&self, backup_id: &str) -> Result<Option<BackupInfo>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT backup_id, created_at, kind, label, principal_count
                 FROM balance_backups WHERE backup_id = ?1",
            )?;
            Ok(stmt.query_row([backup_id], row_to_backup).optional()?)
        })
    }

    fn backup_records(&self, backup_id: &str) -> Result<Vec<BackupRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT identity, spendable_balance, cumulative_balance, total_spent,
                        total_rate_per_hour, is_verified
                 FROM balance_backup_records WHERE backup_id = ?1 ORDER BY identity",
            )?;
            let rows = stmt.query_map([backup_id], |row| {
                Ok(BackupRecord {
                    identity: row.get(0)?,
                    spendable_balance: row.get(1)?,
                    cumulative_balance: row.get(2)?,
                    total_spent: row.get(3)?,
                    total_rate_per_hour: row.get(4)?,
                    is_verified: row.get(5)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn delete_backups_before(&self, cutoff: Timestamp) -> Result<(usize, usize)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let records = tx.execute(
                "DELETE FROM balance_backup_records WHERE backup_id IN
                    (SELECT backup_id FROM balance_backups WHERE created_at < ?1)",
                [cutoff],
            )?;
            let backups = tx.execute("DELETE FROM balance_backups WHERE created_at < ?1", [cutoff])?;
            tx.commit()?;
            Ok((backups, records))
        })
    }

    fn record_verification_run(&self, run: &VerificationRun) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO verification_runs (run_id, started_at, finished_at, summary)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    run.run_id,
                    run.started_at,
                    run.finished_at,
                    serde_json::to_string(&run.summary)?
                ],
            )?;
            Ok(())
        })
    }

    fn verification_runs(&self, limit: usize) -> Result<Vec<VerificationRun>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT run_id, started_at, finished_at, summary
                 FROM verification_runs ORDER BY started_at DESC, run_id ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], |row| {
                Ok(VerificationRun {
                    run_id: row.get(0)?,
                    started_at: row.get(1)?,
                    finished_at: row.get(2)?,
                    summary: json_column(row, 3)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

fn row_to_backup(row: &Row) -> rusqlite::Result<BackupInfo> {
    let kind: String = row.get(2)?;
    let count: i64 = row.get(4)?;
    Ok(BackupInfo {
        backup_id: row.get(0)?,
        created_at: row.get(1)?,
        kind: kind
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
        label: row.get(3)?,
        principal_count: count.max(0) as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::OwnedAsset;

    fn principal(identity: &str) -> Principal {
        let mut p = Principal::new(identity, 1_000);
        p.set_assets(vec![OwnedAsset::new("mek-1", 12.0)]);
        p.spendable_balance = 10.0;
        p.cumulative_balance = 25.0;
        p.alternate_addresses.insert("addr1alt".to_string());
        p
    }

    fn entry(rank: u32, identity: &str, value: f64) -> LeaderboardEntry {
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
    fn test_insert_and_get_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let stored = store.insert(&principal("stake1a")).unwrap();
        assert_eq!(stored.version, 1);

        let loaded = store.get("stake1a").unwrap().unwrap();
        assert_eq!(loaded, stored);
        assert!(store.get("stake1missing").unwrap().is_none());
    }

    #[test]
    fn test_insert_twice_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&principal("stake1a")).unwrap();
        assert!(matches!(
            store.insert(&principal("stake1a")),
            Err(EngineError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_update_is_compare_and_swap() {
        let store = SqliteStore::open_in_memory().unwrap();
        let v1 = store.insert(&principal("stake1a")).unwrap();

        let mut first = v1.clone();
        first.spendable_balance = 20.0;
        let v2 = store.update(&first).unwrap();
        assert_eq!(v2.version, 2);

        // A writer still holding version 1 loses
        let mut stale = v1.clone();
        stale.spendable_balance = 99.0;
        match store.update(&stale) {
            Err(EngineError::VersionConflict { expected, actual, .. }) => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected version conflict, got {:?}", other),
        }
        assert_eq!(store.get("stake1a").unwrap().unwrap().spendable_balance, 20.0);
    }

    #[test]
    fn test_merge_rolls_back_on_stale_duplicate() {
        let store = SqliteStore::open_in_memory().unwrap();
        let target = store.insert(&principal("stake1a")).unwrap();
        let dup = store.insert(&principal("addr1a")).unwrap();

        let mut stale_dup = dup.clone();
        stale_dup.version = 7;
        let mut merged = target.clone();
        merged.alternate_addresses.insert("addr1a".to_string());

        assert!(store.merge(&merged, &[stale_dup]).is_err());
        // Neither half applied
        assert_eq!(store.get("stake1a").unwrap().unwrap().version, 1);
        assert!(store.get("addr1a").unwrap().is_some());

        store.merge(&merged, &[dup]).unwrap();
        assert!(store.get("addr1a").unwrap().is_none());
        assert_eq!(
            store.find_by_alternate("addr1a").unwrap().unwrap().identity,
            "stake1a"
        );
        assert!(store.find_by_alternate("addr1zzz").unwrap().is_none());
        let after = store.get("stake1a").unwrap().unwrap();
        assert!(after.alternate_addresses.contains("addr1a"));
        assert_eq!(after.version, 2);
    }

    #[test]
    fn test_update_many_is_all_or_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.insert(&principal("stake1a")).unwrap();
        let b = store.insert(&principal("stake1b")).unwrap();

        let mut a_next = a.clone();
        a_next.spendable_balance = 1.0;
        let mut stale_b = b.clone();
        stale_b.version = 9;
        assert!(matches!(
            store.update_many(&[a_next.clone(), stale_b]),
            Err(EngineError::VersionConflict { .. })
        ));
        assert_eq!(store.get("stake1a").unwrap().unwrap().version, 1);

        let stored = store.update_many(&[a_next, b]).unwrap();
        assert_eq!(stored.iter().map(|p| p.version).collect::<Vec<_>>(), vec![2, 2]);
    }

    #[test]
    fn test_oracle_failure_counter_persists() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut p = store.insert(&principal("stake1a")).unwrap();
        p.consecutive_oracle_failures = 4;
        store.update(&p).unwrap();
        assert_eq!(store.get("stake1a").unwrap().unwrap().consecutive_oracle_failures, 4);
    }

    #[test]
    fn test_pre_versioning_database_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let conn = Connection::open(dir.path().join("ledger.db")).unwrap();
            conn.execute_batch(
                "CREATE TABLE principals (
                    identity TEXT PRIMARY KEY,
                    alternate_addresses TEXT NOT NULL DEFAULT '[]',
                    owned_assets TEXT NOT NULL DEFAULT '[]',
                    total_rate_per_hour REAL NOT NULL DEFAULT 0,
                    spendable_balance REAL NOT NULL DEFAULT 0,
                    cumulative_balance REAL NOT NULL DEFAULT 0,
                    total_spent REAL NOT NULL DEFAULT 0,
                    last_verified_at INTEGER NOT NULL,
                    is_verified INTEGER NOT NULL DEFAULT 0,
                    display_name TEXT,
                    created_at INTEGER NOT NULL,
                    checkpointed_at INTEGER NOT NULL,
                    version INTEGER NOT NULL DEFAULT 1
                 );
                 INSERT INTO principals (identity, last_verified_at, created_at, checkpointed_at, spendable_balance, cumulative_balance)
                 VALUES ('stake1old', 0, 0, 0, 7.0, 9.0);",
            )
            .unwrap();
        }

        let store = SqliteStore::open(dir.path()).unwrap();
        let old = store.get("stake1old").unwrap().unwrap();
        assert_eq!(old.consecutive_oracle_failures, 0);
        assert_eq!(old.cumulative_balance, 9.0);
        assert!(store.list_backups().unwrap().is_empty());
        drop(store);

        // Reopening an up-to-date database is a no-op
        let again = SqliteStore::open(dir.path()).unwrap();
        assert_eq!(again.list().unwrap().len(), 1);
    }

    #[test]
    fn test_display_name_taken_is_case_insensitive() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut p = principal("stake1a");
        p.display_name = Some("Gold Corp".to_string());
        store.insert(&p).unwrap();

        assert!(store.display_name_taken("gold corp", "stake1b").unwrap());
        assert!(!store.display_name_taken("gold corp", "stake1a").unwrap());
        assert!(!store.display_name_taken("Other", "stake1b").unwrap());
    }

    #[test]
    fn test_apply_leaderboard_writes() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.leaderboard_version().unwrap(), 0);

        let v1 = store
            .apply_leaderboard(&LeaderboardWrites {
                inserts: vec![entry(1, "a", 500.0), entry(2, "b", 400.0), entry(3, "c", 300.0)],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(v1, 1);

        let v2 = store
            .apply_leaderboard(&LeaderboardWrites {
                updates: vec![entry(2, "d", 450.0)],
                evictions: vec![3],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(v2, 2);

        let board = store.leaderboard(None).unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board[1].identity, "d");
        assert_eq!(store.leaderboard(Some(1)).unwrap().len(), 1);
        assert_eq!(store.leaderboard_entry("d").unwrap().unwrap().rank, 2);
        assert!(store.leaderboard_entry("c").unwrap().is_none());
    }
}
