//! Local SQLite mirror for Kasir Core.
//!
//! Uses rusqlite with WAL mode. Holds the terminal settings and the last
//! authoritative order list and shift balance, so a restarted terminal can
//! draw the order screen before its first fetch returns. The mirror is
//! written only from revalidation results, never from optimistic values.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{PosError, PosResult};
use crate::models::Order;
use crate::shifts::ShiftBalance;

/// Database handle shared by the engine.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Open an in-memory database with the full schema.
    pub fn in_memory() -> PosResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&conn)?;
        Ok(DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> PosResult<T>) -> PosResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| PosError::Storage(e.to_string()))?;
        f(&conn)
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Open the mirror at `{data_dir}/kasir.db` and bring its schema up to date.
///
/// The file only mirrors server state, so a database that cannot be opened
/// is discarded and recreated once.
pub fn init(data_dir: &Path) -> PosResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| PosError::Storage(format!("Failed to create data dir: {e}")))?;
    let db_path = data_dir.join("kasir.db");
    info!(path = %db_path.display(), "Opening local mirror");

    let conn = open_and_configure(&db_path).or_else(|first_err| {
        warn!(path = %db_path.display(), "Local mirror unreadable ({first_err}), recreating");
        discard(&db_path);
        open_and_configure(&db_path)
    })?;
    run_migrations(&conn)?;
    info!(schema = CURRENT_SCHEMA_VERSION, "Local mirror ready");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Remove the database file with its WAL and shared-memory companions.
fn discard(db_path: &Path) {
    for path in [
        db_path.to_path_buf(),
        db_path.with_extension("db-wal"),
        db_path.with_extension("db-shm"),
    ] {
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), "Failed to remove mirror file: {e}");
            }
        }
    }
}

fn open_and_configure(path: &Path) -> PosResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings.
fn migrate_v1(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    Ok(())
}

/// Migration v2: authoritative order/shift mirror.
fn migrate_v2(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS order_mirror (
            id TEXT PRIMARY KEY,
            business_date TEXT NOT NULL,
            payload TEXT NOT NULL,
            mirrored_at TEXT DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_order_mirror_date ON order_mirror(business_date);

        CREATE TABLE IF NOT EXISTS shift_mirror (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            payload TEXT NOT NULL,
            mirrored_at TEXT DEFAULT (datetime('now'))
        );
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> PosResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Mirror
// ---------------------------------------------------------------------------

/// Replace the mirrored order list with the latest authoritative one.
pub fn save_orders(conn: &Connection, orders: &[Order]) -> PosResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM order_mirror", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO order_mirror (id, business_date, payload) VALUES (?1, ?2, ?3)",
        )?;
        for order in orders {
            let payload = serde_json::to_string(order)?;
            stmt.execute(params![order.id, order.business_date.to_string(), payload])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn load_orders(conn: &Connection) -> PosResult<Vec<Order>> {
    let mut stmt = conn.prepare("SELECT id, payload FROM order_mirror ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut orders = Vec::new();
    for row in rows {
        let (id, payload) = row?;
        match serde_json::from_str::<Order>(&payload) {
            Ok(order) => orders.push(order),
            Err(e) => warn!(order_id = %id, "skipping malformed mirrored order: {e}"),
        }
    }
    orders.sort_by_key(|o| o.created_at);
    Ok(orders)
}

pub fn save_shift_balance(conn: &Connection, balance: &ShiftBalance) -> PosResult<()> {
    let payload = serde_json::to_string(balance)?;
    conn.execute(
        "INSERT INTO shift_mirror (id, payload, mirrored_at) VALUES (1, ?1, datetime('now'))
         ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, mirrored_at = excluded.mirrored_at",
        params![payload],
    )?;
    Ok(())
}

pub fn load_shift_balance(conn: &Connection) -> PosResult<Option<ShiftBalance>> {
    let payload: Option<String> = conn
        .query_row("SELECT payload FROM shift_mirror WHERE id = 1", [], |row| row.get(0))
        .optional()?;
    match payload {
        Some(p) => Ok(Some(serde_json::from_str(&p)?)),
        None => Ok(None),
    }
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
