//! Append-only business log.
//!
//! Rows are written inside the same transaction as the mutation they
//! describe and are never updated or deleted.

use rusqlite::{params, Connection};
use serde::Deserialize;
use serde_json::Value;

use crate::auth::{self, Action, Principal};
use crate::db::{self, DbState};
use crate::error::Result;
use crate::models::{LogAction, LogEntry};

const DEFAULT_LIMIT: i64 = 200;
const MAX_LIMIT: i64 = 1000;

/// Append one log row on the caller's connection (normally inside a tx).
pub fn record(
    conn: &Connection,
    user_id: Option<&str>,
    table_id: Option<&str>,
    action: LogAction,
    details: Value,
) -> Result<()> {
    conn.execute(
        "INSERT INTO logs (id, user_id, table_id, action, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            db::new_id(),
            user_id,
            table_id,
            action,
            details.to_string(),
            db::now_ts()
        ],
    )?;
    Ok(())
}

/// Filters for [`list_logs`]. All bounds are inclusive RFC 3339 timestamps.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub action: Option<LogAction>,
    pub user_id: Option<String>,
    pub limit: Option<i64>,
}

/// Newest-first log listing for administrators.
pub fn list_logs(db: &DbState, principal: &Principal, query: &LogQuery) -> Result<Vec<LogEntry>> {
    auth::authorize(principal, Action::ViewLogs)?;

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT l.id, l.user_id, u.username, l.table_id, l.action, l.details, l.created_at
         FROM logs l LEFT JOIN users u ON u.id = l.user_id
         WHERE (?1 IS NULL OR l.created_at >= ?1)
           AND (?2 IS NULL OR l.created_at <= ?2)
           AND (?3 IS NULL OR l.action = ?3)
           AND (?4 IS NULL OR l.user_id = ?4)
         ORDER BY l.created_at DESC, l.rowid DESC
         LIMIT ?5",
    )?;
    let rows = stmt.query_map(
        params![query.from, query.to, query.action, query.user_id, limit],
        |row| {
            let details: String = row.get(5)?;
            Ok(LogEntry {
                id: row.get(0)?,
                user_id: row.get(1)?,
                username: row.get(2)?,
                table_id: row.get(3)?,
                action: row.get(4)?,
                details: serde_json::from_str(&details).unwrap_or(Value::Null),
                created_at: row.get(6)?,
            })
        },
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Count of log rows for one action. Used by tests and diagnostics.
pub fn count_action(conn: &Connection, action: LogAction) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM logs WHERE action = ?1",
        [action],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use serde_json::json;

    fn admin() -> Principal {
        Principal::staff("u-admin", "admin", Role::Admin)
    }

    #[test]
    fn records_and_filters_by_action() {
        let db = db::open_in_memory();
        {
            let conn = db.lock().unwrap();
            record(&conn, None, None, LogAction::AccountOpened, json!({"n": 1})).unwrap();
            record(&conn, None, None, LogAction::OrderCreated, json!({"n": 2})).unwrap();
            record(&conn, None, None, LogAction::OrderCreated, json!({"n": 3})).unwrap();
        }

        let all = list_logs(&db, &admin(), &LogQuery::default()).unwrap();
        assert_eq!(all.len(), 3);

        let orders = list_logs(
            &db,
            &admin(),
            &LogQuery {
                action: Some(LogAction::OrderCreated),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].details["n"], 3, "newest first");
    }

    #[test]
    fn non_admin_cannot_read_logs() {
        let db = db::open_in_memory();
        let waiter = Principal::staff("u-1", "ana", Role::Mesero);
        let err = list_logs(&db, &waiter, &LogQuery::default()).unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }
}
