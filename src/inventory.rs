//! Single-use inventory of pre-provisioned activation codes (SQLite).
//!
//! Entries are created `available` and move to `used` exactly once through
//! [`InventoryStore::claim`], which is one conditional `UPDATE`.  Nothing is
//! ever deleted; used rows stay for audit.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension as _, Row, TransactionBehavior};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EsimError, OptionExt as _, Result, ResultExt as _};
use crate::lpa::{self, ActivationDescriptor};
use crate::util;

pub const INVENTORY_SCHEMA_VERSION: i64 = 1;

/// Length of generated entry ids (hex characters).
const ID_LEN: usize = 8;
const MAX_ID_ATTEMPTS: usize = 16;

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=FULL;

    CREATE TABLE IF NOT EXISTS meta(
      k TEXT PRIMARY KEY,
      v TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS esim_entries(
      id TEXT PRIMARY KEY,
      server_address TEXT NOT NULL,
      activation_code TEXT,
      description TEXT NOT NULL DEFAULT '',
      added_at TEXT NOT NULL,
      status TEXT NOT NULL DEFAULT 'available'
        CHECK (status IN ('available', 'used')),
      used_at TEXT,
      used_by TEXT,
      lpa_string TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_entries_status ON esim_entries(status);
    CREATE INDEX IF NOT EXISTS idx_entries_added_at ON esim_entries(added_at);
"#;

const SELECT_COLUMNS: &str = "id, server_address, activation_code, description, added_at, \
                              status, used_at, used_by, lpa_string";

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Available,
    Used,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Used => "used",
        }
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = EsimError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(Self::Available),
            "used" => Ok(Self::Used),
            other => Err(EsimError::Storage(format!("unknown entry status '{other}'"))),
        }
    }
}

/// Who took an entry and when.  Present exactly when the entry is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimRecord {
    pub used_at_utc: String,
    pub used_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryEntry {
    pub id: String,
    pub descriptor: ActivationDescriptor,
    pub description: String,
    pub added_at_utc: String,
    pub claim: Option<ClaimRecord>,
}

impl InventoryEntry {
    pub fn status(&self) -> EntryStatus {
        if self.claim.is_some() {
            EntryStatus::Used
        } else {
            EntryStatus::Available
        }
    }

    pub fn used_at_utc(&self) -> Option<&str> {
        self.claim.as_ref().map(|c| c.used_at_utc.as_str())
    }

    pub fn used_by(&self) -> Option<&str> {
        self.claim.as_ref().map(|c| c.used_by.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InventoryStats {
    pub total: u64,
    pub available: u64,
    pub used: u64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Persisted inventory.  Cheap to share behind an `Arc`; every method takes
/// `&self` and runs as one transaction.
pub struct InventoryStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for InventoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryStore").finish_non_exhaustive()
    }
}

impl InventoryStore {
    /// Open the store at `db_path`, creating the file and schema if needed.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EsimError::Storage(format!("create db parent dir {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| EsimError::Storage(format!("open db {}: {e}", db_path.display())))?;
        Self::init(conn)
    }

    /// Private, non-persistent store (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().ctx_storage("open in-memory db")?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        // Another process may hold the write lock briefly during a claim.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .ctx_storage("set busy timeout")?;
        conn.execute_batch(SCHEMA).ctx_storage("create tables")?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .ctx_storage("begin tx")?;
        let stored: Option<String> = tx
            .query_row("SELECT v FROM meta WHERE k='schema_version'", [], |row| row.get(0))
            .optional()?;
        match stored {
            None => {
                tx.execute(
                    "INSERT INTO meta(k,v) VALUES ('schema_version', ?1)",
                    params![INVENTORY_SCHEMA_VERSION.to_string()],
                )?;
                tx.execute(
                    "INSERT INTO meta(k,v) VALUES ('created_at_utc', ?1)",
                    params![util::now_utc_rfc3339()],
                )?;
            }
            Some(v) => {
                let version: i64 = v.parse().ctx_storage("parse schema_version")?;
                if version != INVENTORY_SCHEMA_VERSION {
                    return Err(EsimError::Storage(format!(
                        "unsupported schema_version {version} (expected {INVENTORY_SCHEMA_VERSION})"
                    )));
                }
            }
        }
        tx.commit().ctx_storage("commit tx")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EsimError::Storage("inventory connection lock poisoned".into()))
    }

    /// Store a descriptor as a new `available` entry and return its id.
    pub fn add(&self, descriptor: &ActivationDescriptor, description: &str) -> Result<String> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .ctx_storage("begin tx")?;

        let added_at = util::now_utc_sortable();
        let mut inserted = None;
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = new_entry_id();
            let rows = tx
                .execute(
                    r#"
                    INSERT OR IGNORE INTO esim_entries(
                      id, server_address, activation_code, description, added_at, status, lpa_string
                    ) VALUES (?1,?2,?3,?4,?5,'available',?6)
                    "#,
                    params![
                        candidate,
                        descriptor.server_address(),
                        descriptor.activation_code(),
                        description,
                        added_at,
                        descriptor.raw(),
                    ],
                )
                .ctx_storage("insert entry")?;
            if rows == 1 {
                inserted = Some(candidate);
                break;
            }
        }
        let id = inserted
            .required_storage(&format!("no free entry id after {MAX_ID_ATTEMPTS} attempts"))?;

        tx.commit().ctx_storage("commit tx")?;
        info!(id = %id, server = descriptor.server_address(), "inventory entry added");
        Ok(id)
    }

    /// Parse and validate `raw` before anything is written.
    pub fn add_from_raw(&self, raw: &str, description: &str) -> Result<String> {
        let descriptor = lpa::parse(raw)?;
        lpa::validate_server_address(descriptor.server_address())?;
        self.add(&descriptor, description)
    }

    /// Validate individual fields, then store.
    pub fn add_server(
        &self,
        server_address: &str,
        activation_code: Option<&str>,
        description: &str,
    ) -> Result<String> {
        let descriptor = ActivationDescriptor::validated(server_address, activation_code)?;
        self.add(&descriptor, description)
    }

    /// Newest first.
    pub fn list_available(&self) -> Result<Vec<InventoryEntry>> {
        self.query_entries(&format!(
            "SELECT {SELECT_COLUMNS} FROM esim_entries \
             WHERE status = 'available' ORDER BY added_at DESC, rowid DESC"
        ))
    }

    /// Most recently claimed first.
    pub fn list_used(&self) -> Result<Vec<InventoryEntry>> {
        self.query_entries(&format!(
            "SELECT {SELECT_COLUMNS} FROM esim_entries \
             WHERE status = 'used' ORDER BY used_at DESC, rowid DESC"
        ))
    }

    /// Every entry in insertion order.
    pub fn list_all(&self) -> Result<Vec<InventoryEntry>> {
        self.query_entries(&format!(
            "SELECT {SELECT_COLUMNS} FROM esim_entries ORDER BY rowid ASC"
        ))
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<InventoryEntry>> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM esim_entries WHERE id = ?1"),
                params![id],
                read_row,
            )
            .optional()
            .ctx_storage("select entry")?;
        entry.transpose()
    }

    /// Mark `id` used by `claimant`.
    ///
    /// Returns `true` only for the caller whose update flipped the row.
    /// A missing or already-used entry yields `Ok(false)`; `Err` is reserved
    /// for storage failures.
    pub fn claim(&self, id: &str, claimant: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .ctx_storage("begin tx")?;
        let rows = tx
            .execute(
                "UPDATE esim_entries SET status = 'used', used_at = ?1, used_by = ?2 \
                 WHERE id = ?3 AND status = 'available'",
                params![util::now_utc_sortable(), claimant, id],
            )
            .ctx_storage("claim entry")?;
        tx.commit().ctx_storage("commit tx")?;

        if rows == 1 {
            info!(id, claimant, "inventory entry claimed");
            Ok(true)
        } else {
            warn!(id, claimant, "claim lost: entry missing or already used");
            Ok(false)
        }
    }

    pub fn stats(&self) -> Result<InventoryStats> {
        let conn = self.lock()?;
        let (available, used): (i64, i64) = conn
            .query_row(
                "SELECT \
                   COALESCE(SUM(status = 'available'), 0), \
                   COALESCE(SUM(status = 'used'), 0) \
                 FROM esim_entries",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ctx_storage("count entries")?;
        let available = available.max(0) as u64;
        let used = used.max(0) as u64;
        Ok(InventoryStats {
            total: available + used,
            available,
            used,
        })
    }

    fn query_entries(&self, sql: &str) -> Result<Vec<InventoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).ctx_storage("prepare select entries")?;
        let mut rows = stmt.query([]).ctx_storage("query entries")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().ctx_storage("next row")? {
            out.push(read_row(row)??);
        }
        Ok(out)
    }
}

fn new_entry_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(ID_LEN);
    id
}

/// Row decoding; the outer `Result` is rusqlite's, the inner one flags rows
/// that break the entry invariants.
fn read_row(row: &Row<'_>) -> rusqlite::Result<Result<InventoryEntry>> {
    let id: String = row.get(0)?;
    let server_address: String = row.get(1)?;
    let activation_code: Option<String> = row.get(2)?;
    let description: String = row.get(3)?;
    let added_at_utc: String = row.get(4)?;
    let status: String = row.get(5)?;
    let used_at: Option<String> = row.get(6)?;
    let used_by: Option<String> = row.get(7)?;
    let lpa_string: String = row.get(8)?;

    Ok(decode_entry(
        id,
        server_address,
        activation_code,
        description,
        added_at_utc,
        &status,
        used_at,
        used_by,
        &lpa_string,
    ))
}

#[allow(clippy::too_many_arguments)]
fn decode_entry(
    id: String,
    server_address: String,
    activation_code: Option<String>,
    description: String,
    added_at_utc: String,
    status: &str,
    used_at: Option<String>,
    used_by: Option<String>,
    lpa_string: &str,
) -> Result<InventoryEntry> {
    let status: EntryStatus = status.parse()?;
    let claim = match (status, used_at, used_by) {
        (EntryStatus::Available, None, None) => None,
        (EntryStatus::Used, Some(used_at_utc), Some(used_by)) => Some(ClaimRecord {
            used_at_utc,
            used_by,
        }),
        _ => {
            return Err(EsimError::Storage(format!(
                "entry {id}: used_at/used_by inconsistent with status '{}'",
                status.as_str()
            )))
        }
    };

    let descriptor = ActivationDescriptor::new(&server_address, activation_code.as_deref());
    if descriptor.raw() != lpa_string {
        return Err(EsimError::Storage(format!(
            "entry {id}: stored LPA string does not match its fields"
        )));
    }

    Ok(InventoryEntry {
        id,
        descriptor,
        description,
        added_at_utc,
        claim,
    })
}

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

/// Export every entry (available and used) to a JSON file.
pub fn export_inventory_json(store: &InventoryStore, out_path: &Path) -> Result<usize> {
    let entries = store.list_all()?;
    let export = serde_json::json!({
        "format": "esimkit-inventory-backup-v1",
        "exported_at_utc": util::now_utc_rfc3339(),
        "schema_version": INVENTORY_SCHEMA_VERSION,
        "stats": store.stats()?,
        "entries": entries,
    });
    let json = serde_json::to_vec_pretty(&export).ctx_storage("serialize inventory export")?;
    std::fs::write(out_path, json)
        .map_err(|e| EsimError::Storage(format!("write export {}: {e}", out_path.display())))?;
    info!(path = %out_path.display(), entries = entries.len(), "inventory exported");
    Ok(entries.len())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
