//! Dining tables: short codes, QR URLs and admin CRUD.

use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::audit;
use crate::auth::{self, Action, Principal};
use crate::codes;
use crate::db::{self, DbState};
use crate::error::{Conflict, PosError, Result};
use crate::models::{DiningTable, LogAction};
use crate::money::from_cents;
use crate::qr;

/// Attempts before a short-code collision is reported.
pub const SHORT_CODE_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTable {
    pub name: String,
    #[serde(default)]
    pub zone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableUpdate {
    pub name: Option<String>,
    /// Empty string clears the zone.
    pub zone: Option<String>,
    #[serde(default)]
    pub regenerate_code: bool,
}

/// A table with its currently open account, if any.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOverview {
    #[serde(flatten)]
    pub table: DiningTable,
    pub open_account_id: Option<String>,
    pub open_balance: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableQr {
    pub table: DiningTable,
    pub qr_data_url: String,
}

pub fn qr_url(base_url: &str, short_code: &str) -> String {
    format!("{}/t/{short_code}", base_url.trim_end_matches('/'))
}

fn required_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(PosError::validation("Table name is required"));
    }
    Ok(name.to_string())
}

fn clean_zone(zone: Option<&str>) -> Option<String> {
    zone.map(str::trim).filter(|z| !z.is_empty()).map(str::to_string)
}

pub(crate) fn load(conn: &Connection, id: &str) -> Result<DiningTable> {
    conn.query_row(
        &format!("SELECT {} FROM dining_tables WHERE id = ?1", DiningTable::COLUMNS),
        [id],
        DiningTable::from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("Table", id))
}

/// Run `write(code)` with fresh codes until it stops hitting the UNIQUE
/// constraint, at most [`SHORT_CODE_ATTEMPTS`] times.
fn with_fresh_code<T>(
    next_code: &mut dyn FnMut() -> String,
    mut write: impl FnMut(&str) -> rusqlite::Result<T>,
) -> Result<T> {
    for attempt in 1..=SHORT_CODE_ATTEMPTS {
        let code = next_code();
        match write(&code) {
            Ok(value) => return Ok(value),
            Err(e) if db::is_unique_violation(&e) => {
                warn!(attempt, "short code collision, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(PosError::Collision(format!(
        "No free table short code after {SHORT_CODE_ATTEMPTS} attempts"
    )))
}

pub fn create_table(
    db: &DbState,
    principal: &Principal,
    base_url: &str,
    new: &NewTable,
) -> Result<DiningTable> {
    create_table_with(db, principal, base_url, new, &mut codes::short_code)
}

pub(crate) fn create_table_with(
    db: &DbState,
    principal: &Principal,
    base_url: &str,
    new: &NewTable,
    next_code: &mut dyn FnMut() -> String,
) -> Result<DiningTable> {
    auth::authorize(principal, Action::ManageTables)?;
    let name = required_name(&new.name)?;
    let zone = clean_zone(new.zone.as_deref());
    let id = db::new_id();

    let conn = db.lock()?;
    let table = db::in_immediate_tx(&conn, |conn| {
        let now = db::now_ts();
        with_fresh_code(next_code, |code| {
            conn.execute(
                "INSERT INTO dining_tables (id, name, short_code, zone, qr_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, name, code, zone, qr_url(base_url, code), now],
            )
        })?;
        let table = load(conn, &id)?;
        audit::record(
            conn,
            principal.user_id(),
            Some(&table.id),
            LogAction::TableCreated,
            json!({ "name": table.name, "shortCode": table.short_code }),
        )?;
        Ok(table)
    })?;
    info!(table_id = %table.id, short_code = %table.short_code, "Table created");
    Ok(table)
}

pub fn list_tables(db: &DbState, principal: &Principal) -> Result<Vec<TableOverview>> {
    auth::authorize(principal, Action::ViewTables)?;
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT t.id, t.name, t.short_code, t.zone, t.qr_url, t.created_at,
                a.id, a.current_balance_cents
         FROM dining_tables t
         LEFT JOIN accounts a ON a.table_id = t.id AND a.status = 'OPEN'
         ORDER BY t.name COLLATE NOCASE, t.id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(TableOverview {
            table: DiningTable::from_row(row)?,
            open_account_id: row.get(6)?,
            open_balance: row.get::<_, Option<i64>>(7)?.map(from_cents),
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_table_by_short_code(db: &DbState, principal: &Principal, short_code: &str) -> Result<DiningTable> {
    auth::authorize(principal, Action::ViewTables)?;
    let code = codes::normalize(short_code);
    let conn = db.lock()?;
    conn.query_row(
        &format!("SELECT {} FROM dining_tables WHERE short_code = ?1", DiningTable::COLUMNS),
        [&code],
        DiningTable::from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("Table", code))
}

pub fn update_table(
    db: &DbState,
    principal: &Principal,
    base_url: &str,
    id: &str,
    update: &TableUpdate,
) -> Result<DiningTable> {
    auth::authorize(principal, Action::ManageTables)?;
    let name = update.name.as_deref().map(required_name).transpose()?;

    let conn = db.lock()?;
    let table = db::in_immediate_tx(&conn, |conn| {
        let current = load(conn, id)?;
        let zone = match &update.zone {
            Some(z) => clean_zone(Some(z)),
            None => current.zone.clone(),
        };
        conn.execute(
            "UPDATE dining_tables SET name = COALESCE(?2, name), zone = ?3 WHERE id = ?1",
            params![id, name, zone],
        )?;
        if update.regenerate_code {
            with_fresh_code(&mut codes::short_code, |code| {
                conn.execute(
                    "UPDATE dining_tables SET short_code = ?2, qr_url = ?3 WHERE id = ?1",
                    params![id, code, qr_url(base_url, code)],
                )
            })?;
        }
        let table = load(conn, id)?;
        audit::record(
            conn,
            principal.user_id(),
            Some(id),
            LogAction::TableUpdated,
            json!({
                "name": table.name,
                "zone": table.zone,
                "shortCode": table.short_code,
                "previousShortCode": current.short_code,
            }),
        )?;
        Ok(table)
    })?;
    info!(table_id = %id, "Table updated");
    Ok(table)
}

/// Delete a table that has no open account. Past accounts keep their
/// `table_label` and lose the reference.
pub fn delete_table(db: &DbState, principal: &Principal, id: &str) -> Result<()> {
    auth::authorize(principal, Action::ManageTables)?;
    let conn = db.lock()?;
    db::in_immediate_tx(&conn, |conn| {
        let table = load(conn, id)?;
        let open: i64 = conn.query_row(
            "SELECT COUNT(*) FROM accounts WHERE table_id = ?1 AND status = 'OPEN'",
            [id],
            |row| row.get(0),
        )?;
        if open > 0 {
            return Err(Conflict::TableInUse.into());
        }
        audit::record(
            conn,
            principal.user_id(),
            None,
            LogAction::TableDeleted,
            json!({ "tableId": id, "name": table.name, "shortCode": table.short_code }),
        )?;
        conn.execute("DELETE FROM dining_tables WHERE id = ?1", [id])?;
        Ok(())
    })?;
    info!(table_id = %id, "Table deleted");
    Ok(())
}

/// QR sticker for a table, encoding its `qr_url`.
pub fn table_qr(db: &DbState, principal: &Principal, id: &str) -> Result<TableQr> {
    auth::authorize(principal, Action::ManageTables)?;
    let table = {
        let conn = db.lock()?;
        load(&conn, id)?
    };
    let qr_data_url = qr::data_url(&table.qr_url)?;
    Ok(TableQr { table, qr_data_url })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::testutil;

    const BASE: &str = "https://club.example/";

    fn new_table(name: &str) -> NewTable {
        NewTable {
            name: name.into(),
            zone: Some(" Terraza ".into()),
        }
    }

    #[test]
    fn create_builds_qr_url_from_short_code() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let table = create_table(&db, &admin, BASE, &new_table("Mesa 1")).unwrap();
        assert_eq!(table.short_code.len(), codes::SHORT_CODE_LEN);
        assert_eq!(table.qr_url, format!("https://club.example/t/{}", table.short_code));
        assert_eq!(table.zone.as_deref(), Some("Terraza"));
    }

    #[test]
    fn short_code_collision_retries_then_succeeds() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let mut first = || "A3K7".to_string();
        create_table_with(&db, &admin, BASE, &new_table("Mesa 1"), &mut first).unwrap();

        let mut queue = vec!["Q9Z2".to_string(), "A3K7".to_string(), "A3K7".to_string()];
        let mut next = move || queue.pop().unwrap();
        let second = create_table_with(&db, &admin, BASE, &new_table("Mesa 2"), &mut next).unwrap();
        assert_eq!(second.short_code, "Q9Z2");
    }

    #[test]
    fn short_code_collision_exhaustion_fails_loudly() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let mut same = || "A3K7".to_string();
        create_table_with(&db, &admin, BASE, &new_table("Mesa 1"), &mut same).unwrap();
        let err = create_table_with(&db, &admin, BASE, &new_table("Mesa 2"), &mut same).unwrap_err();
        assert_eq!(err.code(), "COLLISION");

        let count: i64 = db
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM dining_tables", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn update_can_regenerate_code_and_clear_zone() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let table = create_table(&db, &admin, BASE, &new_table("Mesa 1")).unwrap();
        let updated = update_table(
            &db,
            &admin,
            BASE,
            &table.id,
            &TableUpdate {
                name: Some("VIP".into()),
                zone: Some(String::new()),
                regenerate_code: true,
            },
        )
        .unwrap();
        assert_eq!(updated.name, "VIP");
        assert_eq!(updated.zone, None);
        assert!(updated.qr_url.ends_with(&updated.short_code));
    }

    #[test]
    fn delete_refuses_table_with_open_account() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let table = create_table(&db, &admin, BASE, &new_table("Mesa 1")).unwrap();
        testutil::open_account(&db, &admin, &table.id, 0);

        let err = delete_table(&db, &admin, &table.id).unwrap_err();
        assert_eq!(err.code(), "TABLE_IN_USE");

        let listed = list_tables(&db, &admin).unwrap();
        assert!(listed[0].open_account_id.is_some());
    }

    #[test]
    fn delete_keeps_closed_account_history() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let table = create_table(&db, &admin, BASE, &new_table("Mesa 1")).unwrap();
        let account = testutil::open_account(&db, &admin, &table.id, 0);
        crate::accounts::close_account(&db, &admin, &account.id).unwrap();

        delete_table(&db, &admin, &table.id).unwrap();
        let (table_id, label): (Option<String>, String) = db
            .lock()
            .unwrap()
            .query_row(
                "SELECT table_id, table_label FROM accounts WHERE id = ?1",
                [&account.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(table_id, None);
        assert_eq!(label, "Mesa 1");
    }

    #[test]
    fn table_qr_encodes_url() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let table = create_table(&db, &admin, BASE, &new_table("Mesa 1")).unwrap();
        let qr = table_qr(&db, &admin, &table.id).unwrap();
        assert!(qr.qr_data_url.starts_with("data:image/png;base64,"));

        let waiter = testutil::staff(&db, "ana", Role::Mesero);
        assert_eq!(table_qr(&db, &waiter, &table.id).unwrap_err().code(), "FORBIDDEN");
        assert_eq!(
            get_table_by_short_code(&db, &waiter, &table.short_code.to_lowercase())
                .unwrap()
                .id,
            table.id
        );
    }
}
