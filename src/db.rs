//! SQLite database layer for Club POS.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, timestamp
//! helpers, and the shared connection state used by every domain module.
//! Background workers open their own [`DbState`] on the same file so that a
//! slow sweep never holds the request connection.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{PosError, Result};

/// Shared state holding one database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection, recovering from a poisoned mutex.
    ///
    /// A panic while holding the lock cannot leave a half-applied write
    /// behind because every mutation runs inside an explicit transaction
    /// that SQLite rolls back when the statement sequence is abandoned.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        match self.conn.lock() {
            Ok(guard) => Ok(guard),
            Err(poisoned) => {
                warn!("database mutex poisoned; recovering connection");
                let guard = poisoned.into_inner();
                let _ = guard.execute_batch("ROLLBACK");
                Ok(guard)
            }
        }
    }
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Open the database at `{data_dir}/club-pos.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| PosError::Internal(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("club-pos.db");
    info!("Opening database at {}", db_path.display());

    let conn = open_and_configure(&db_path)?;
    run_migrations(&conn)?;

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a second connection to an already initialised database file.
///
/// Used by background workers.
pub fn open_worker(state: &DbState) -> Result<DbState> {
    let conn = open_and_configure(&state.db_path)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: state.db_path.clone(),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Read the applied schema version.
pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
pub(crate) fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current = schema_version(conn);
    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }
    if current < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

/// Migration v1: staff, tables, tabs, catalogue, orders, audit log.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL CHECK (role IN ('ADMIN', 'MESERO', 'CAJERO')),
            name TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            failed_login_attempts INTEGER NOT NULL DEFAULT 0,
            last_failed_login_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS dining_tables (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            short_code TEXT NOT NULL UNIQUE,
            zone TEXT,
            qr_url TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            table_id TEXT REFERENCES dining_tables(id) ON DELETE SET NULL,
            table_label TEXT NOT NULL,
            opened_by_user_id TEXT REFERENCES users(id) ON DELETE SET NULL,
            client_name TEXT,
            initial_balance_cents INTEGER NOT NULL DEFAULT 0,
            current_balance_cents INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'OPEN' CHECK (status IN ('OPEN', 'CLOSED')),
            closed_by TEXT CHECK (closed_by IS NULL OR closed_by IN ('USER', 'SWEEP')),
            created_at TEXT NOT NULL,
            closed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            price_cents INTEGER NOT NULL CHECK (price_cents >= 0),
            category TEXT,
            emoji TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            product_id TEXT NOT NULL REFERENCES products(id),
            user_id TEXT REFERENCES users(id) ON DELETE SET NULL,
            quantity INTEGER NOT NULL CHECK (quantity >= 1),
            price_cents INTEGER NOT NULL,
            state TEXT NOT NULL DEFAULT 'PENDING' CHECK (state IN ('PENDING', 'SERVED', 'REJECTED')),
            created_at TEXT NOT NULL,
            served_at TEXT,
            rejected_at TEXT
        );

        CREATE TABLE IF NOT EXISTS logs (
            id TEXT PRIMARY KEY,
            user_id TEXT REFERENCES users(id) ON DELETE SET NULL,
            table_id TEXT REFERENCES dining_tables(id) ON DELETE SET NULL,
            action TEXT NOT NULL,
            details TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_accounts_table_status ON accounts(table_id, status);
        CREATE INDEX IF NOT EXISTS idx_accounts_status_created ON accounts(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_orders_account ON orders(account_id);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_orders_state ON orders(state);
        CREATE INDEX IF NOT EXISTS idx_logs_created_at ON logs(created_at);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        e
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: events, ticket entries and online purchases.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            date TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            cover_image TEXT,
            cover_price_cents INTEGER NOT NULL CHECK (cover_price_cents >= 0),
            paypal_price_cents INTEGER CHECK (paypal_price_cents IS NULL OR paypal_price_cents > 0),
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ticket_purchases (
            paypal_order_id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL REFERENCES events(id),
            quantity INTEGER NOT NULL CHECK (quantity >= 1),
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'CREATED' CHECK (status IN ('CREATED', 'COMPLETED', 'FAILED')),
            client_name TEXT,
            client_email TEXT,
            client_phone TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS entries (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL REFERENCES events(id),
            client_name TEXT NOT NULL,
            client_email TEXT NOT NULL,
            client_phone TEXT,
            number_of_entries INTEGER NOT NULL DEFAULT 1 CHECK (number_of_entries >= 1),
            total_price_cents INTEGER NOT NULL,
            channel TEXT NOT NULL CHECK (channel IN ('DOOR', 'ONLINE')),
            purchase_id TEXT REFERENCES ticket_purchases(paypal_order_id),
            qr_token TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'ACTIVE' CHECK (status IN ('ACTIVE', 'USED', 'CANCELLED')),
            email_sent INTEGER NOT NULL DEFAULT 0,
            whatsapp_sent INTEGER NOT NULL DEFAULT 0,
            sold_by_user_id TEXT REFERENCES users(id) ON DELETE SET NULL,
            used_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_entries_event ON entries(event_id, status);
        CREATE INDEX IF NOT EXISTS idx_entries_purchase ON entries(purchase_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        e
    })?;

    info!("Applied migration v2 (events and entries)");
    Ok(())
}

/// Migration v3: push subscriptions.
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS push_subscriptions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            endpoint TEXT NOT NULL UNIQUE,
            platform TEXT NOT NULL CHECK (platform IN ('web', 'android')),
            p256dh TEXT,
            auth TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_push_subscriptions_user ON push_subscriptions(user_id);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        e
    })?;

    info!("Applied migration v3 (push subscriptions)");
    Ok(())
}

/// Migration v4: remember a successful capture apart from ticket issue.
fn migrate_v4(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        ALTER TABLE ticket_purchases ADD COLUMN captured_at TEXT;

        INSERT INTO schema_version (version) VALUES (4);
        ",
    )
    .map_err(|e| {
        error!("Migration v4 failed: {e}");
        e
    })?;

    info!("Applied migration v4 (purchase capture marker)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Format a timestamp for storage. Millisecond precision with a `Z` suffix
/// keeps lexical order identical to chronological order.
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time formatted for storage.
pub fn now_ts() -> String {
    ts(Utc::now())
}

/// Parse a stored timestamp.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Run `f` inside a `BEGIN IMMEDIATE` transaction.
///
/// IMMEDIATE takes the write lock up front, so a second connection doing
/// the same read-check-write sequence waits (busy_timeout) instead of
/// interleaving with this one.
pub fn in_immediate_tx<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    match f(conn) {
        Ok(value) => {
            if let Err(e) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// True when `err` is a UNIQUE constraint violation.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        }
        _ => false,
    }
}

/// Fresh random identifier for a new row.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Open a migrated in-memory database.
#[cfg(test)]
pub(crate) fn open_in_memory() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .expect("pragma setup");
    run_migrations(&conn).expect("run_migrations should succeed in test");
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let db = open_in_memory();
        let conn = db.lock().unwrap();
        let names = table_names(&conn);
        for expected in [
            "accounts",
            "dining_tables",
            "entries",
            "events",
            "logs",
            "orders",
            "products",
            "push_subscriptions",
            "schema_version",
            "ticket_purchases",
            "users",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(schema_version(&conn), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = open_in_memory();
        let conn = db.lock().unwrap();
        run_migrations(&conn).expect("second run");
        let versions: i32 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_check_constraints_reject_bad_status() {
        let db = open_in_memory();
        let conn = db.lock().unwrap();
        conn.execute(
            "INSERT INTO dining_tables (id, name, short_code, qr_url, created_at)
             VALUES ('t1', 'Mesa 1', 'A3K7', 'http://x/t/A3K7', '2026-01-01T00:00:00.000Z')",
            [],
        )
        .unwrap();
        let bad = conn.execute(
            "INSERT INTO accounts (id, table_id, table_label, status, created_at)
             VALUES ('a1', 't1', 'Mesa 1', 'PAUSED', '2026-01-01T00:00:00.000Z')",
            [],
        );
        assert!(bad.is_err(), "invalid account status should be rejected");
    }

    #[test]
    fn test_unique_violation_detection() {
        let db = open_in_memory();
        let conn = db.lock().unwrap();
        let insert = "INSERT INTO dining_tables (id, name, short_code, qr_url, created_at)
                      VALUES (?1, 'Mesa', 'A3K7', 'u', '2026-01-01T00:00:00.000Z')";
        conn.execute(insert, ["t1"]).unwrap();
        let err = conn.execute(insert, ["t2"]).unwrap_err();
        assert!(is_unique_violation(&err));

        let not_unique = conn
            .execute(
                "INSERT INTO products (id, name, price_cents, created_at, updated_at)
                 VALUES ('p1', 'Beer', -1, 'x', 'x')",
                [],
            )
            .unwrap_err();
        assert!(!is_unique_violation(&not_unique));
    }

    #[test]
    fn test_immediate_tx_rolls_back_on_error() {
        let db = open_in_memory();
        let conn = db.lock().unwrap();
        let result: Result<()> = in_immediate_tx(&conn, |conn| {
            conn.execute(
                "INSERT INTO products (id, name, price_cents, created_at, updated_at)
                 VALUES ('p1', 'Beer', 100, 'x', 'x')",
                [],
            )?;
            Err(PosError::validation("abort"))
        });
        assert!(result.is_err());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let early = ts(DateTime::parse_from_rfc3339("2026-01-01T09:00:00Z").unwrap().with_timezone(&Utc));
        let late = ts(DateTime::parse_from_rfc3339("2026-01-01T10:00:00.5Z").unwrap().with_timezone(&Utc));
        assert!(early < late);
        assert_eq!(early, "2026-01-01T09:00:00.000Z");
        assert_eq!(parse_ts(&late).map(ts), Some(late.clone()));
    }

    #[test]
    fn test_worker_connection_shares_file() {
        let dir = tempfile::tempdir().unwrap();
        let main = init(dir.path()).expect("init");
        let worker = open_worker(&main).expect("worker");
        main.lock()
            .unwrap()
            .execute(
                "INSERT INTO products (id, name, price_cents, created_at, updated_at)
                 VALUES ('p1', 'Beer', 100, 'x', 'x')",
                [],
            )
            .unwrap();
        let seen: i64 = worker
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))
            .unwrap();
        assert_eq!(seen, 1);
    }
}
