//! Ticketed events.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::audit;
use crate::auth::{self, Action, Principal};
use crate::db::{self, DbState};
use crate::error::{PosError, Result};
use crate::models::{Event, LogAction};
use crate::money::to_cents;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub name: String,
    /// RFC 3339 timestamp or `YYYY-MM-DD`.
    pub date: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cover_image: Option<String>,
    pub cover_price: Decimal,
    #[serde(default)]
    pub paypal_price: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventUpdate {
    pub name: Option<String>,
    pub date: Option<String>,
    pub description: Option<String>,
    pub cover_image: Option<String>,
    pub cover_price: Option<Decimal>,
    pub paypal_price: Option<Decimal>,
    /// Stop online sales.
    #[serde(default)]
    pub clear_paypal_price: bool,
}

fn parse_event_date(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if let Some(at) = db::parse_ts(raw) {
        return Ok(db::ts(at));
    }
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| PosError::validation(format!("Invalid event date: {raw}")))?;
    let midnight = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| PosError::validation(format!("Invalid event date: {raw}")))?;
    Ok(db::ts(DateTime::<Utc>::from_naive_utc_and_offset(midnight, Utc)))
}

fn cover_cents(price: Decimal) -> Result<i64> {
    let cents = to_cents(price)?;
    if cents < 0 {
        return Err(PosError::validation("Cover price cannot be negative"));
    }
    Ok(cents)
}

fn paypal_cents(price: Decimal) -> Result<i64> {
    let cents = to_cents(price)?;
    if cents <= 0 {
        return Err(PosError::validation("Online price must be greater than zero"));
    }
    Ok(cents)
}

pub(crate) fn load(conn: &Connection, id: &str) -> Result<Event> {
    conn.query_row(
        &format!("SELECT {} FROM events WHERE id = ?1", Event::COLUMNS),
        [id],
        Event::from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("Event", id))
}

pub fn create_event(db: &DbState, principal: &Principal, new: &NewEvent) -> Result<Event> {
    auth::authorize(principal, Action::ManageEvents)?;
    let name = new.name.trim();
    if name.is_empty() {
        return Err(PosError::validation("Event name is required"));
    }
    let date = parse_event_date(&new.date)?;
    let cover = cover_cents(new.cover_price)?;
    let paypal = new.paypal_price.map(paypal_cents).transpose()?;
    let id = db::new_id();

    let conn = db.lock()?;
    let event = db::in_immediate_tx(&conn, |conn| {
        conn.execute(
            "INSERT INTO events (id, name, date, description, cover_image, cover_price_cents,
                                 paypal_price_cents, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                id,
                name,
                date,
                new.description.trim(),
                new.cover_image,
                cover,
                paypal,
                db::now_ts()
            ],
        )?;
        audit::record(
            conn,
            principal.user_id(),
            None,
            LogAction::EventCreated,
            json!({ "eventId": id, "name": name, "date": date }),
        )?;
        load(conn, &id)
    })?;
    info!(event_id = %event.id, "Event created");
    Ok(event)
}

pub fn update_event(db: &DbState, principal: &Principal, id: &str, update: &EventUpdate) -> Result<Event> {
    auth::authorize(principal, Action::ManageEvents)?;
    let name = match update.name.as_deref().map(str::trim) {
        Some("") => return Err(PosError::validation("Event name is required")),
        other => other.map(str::to_string),
    };
    let date = update.date.as_deref().map(parse_event_date).transpose()?;
    let cover = update.cover_price.map(cover_cents).transpose()?;
    let paypal = update.paypal_price.map(paypal_cents).transpose()?;

    let conn = db.lock()?;
    let event = db::in_immediate_tx(&conn, |conn| {
        let current = load(conn, id)?;
        let paypal = if update.clear_paypal_price {
            None
        } else {
            paypal.or(current.paypal_price.map(to_cents).transpose()?)
        };
        conn.execute(
            "UPDATE events SET
                name = COALESCE(?2, name),
                date = COALESCE(?3, date),
                description = COALESCE(?4, description),
                cover_image = COALESCE(?5, cover_image),
                cover_price_cents = COALESCE(?6, cover_price_cents),
                paypal_price_cents = ?7
             WHERE id = ?1",
            params![id, name, date, update.description, update.cover_image, cover, paypal],
        )?;
        audit::record(
            conn,
            principal.user_id(),
            None,
            LogAction::EventUpdated,
            json!({ "eventId": id, "onlineSales": paypal.is_some() }),
        )?;
        load(conn, id)
    })?;
    info!(event_id = %id, "Event updated");
    Ok(event)
}

pub fn set_event_active(db: &DbState, principal: &Principal, id: &str, active: bool) -> Result<Event> {
    auth::authorize(principal, Action::ManageEvents)?;
    let conn = db.lock()?;
    let event = db::in_immediate_tx(&conn, |conn| {
        load(conn, id)?;
        conn.execute(
            "UPDATE events SET is_active = ?2 WHERE id = ?1",
            params![id, active],
        )?;
        audit::record(
            conn,
            principal.user_id(),
            None,
            LogAction::EventUpdated,
            json!({ "eventId": id, "isActive": active }),
        )?;
        load(conn, id)
    })?;
    info!(event_id = %id, active, "Event availability changed");
    Ok(event)
}

/// Events by date. Only staff can see inactive events.
pub fn list_events(db: &DbState, principal: &Principal, active_only: bool) -> Result<Vec<Event>> {
    auth::authorize(principal, Action::ViewCatalog)?;
    let active_only = active_only || principal.role().is_none();
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM events WHERE (?1 = 0 OR is_active = 1) ORDER BY date, name",
        Event::COLUMNS
    ))?;
    let rows = stmt.query_map([active_only], Event::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_event(db: &DbState, principal: &Principal, id: &str) -> Result<Event> {
    auth::authorize(principal, Action::ViewCatalog)?;
    let conn = db.lock()?;
    let event = load(&conn, id)?;
    if !event.is_active && principal.role().is_none() {
        return Err(PosError::not_found("Event", id));
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::testutil;

    fn party() -> NewEvent {
        NewEvent {
            name: "Noche Latina".into(),
            date: "2026-11-20".into(),
            description: "DJ set".into(),
            cover_image: None,
            cover_price: Decimal::from(150),
            paypal_price: Some(Decimal::from(10)),
        }
    }

    #[test]
    fn date_only_normalises_to_midnight_utc() {
        assert_eq!(parse_event_date("2026-11-20").unwrap(), "2026-11-20T00:00:00.000Z");
        assert_eq!(
            parse_event_date("2026-11-20T22:00:00-05:00").unwrap(),
            "2026-11-21T03:00:00.000Z"
        );
        assert!(parse_event_date("next friday").is_err());
    }

    #[test]
    fn create_update_and_clear_online_price() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let event = create_event(&db, &admin, &party()).unwrap();
        assert_eq!(event.paypal_price, Some(Decimal::from(10)));

        let renamed = update_event(
            &db,
            &admin,
            &event.id,
            &EventUpdate {
                name: Some("Noche Salsa".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(renamed.name, "Noche Salsa");
        assert_eq!(renamed.paypal_price, Some(Decimal::from(10)));

        let cleared = update_event(
            &db,
            &admin,
            &event.id,
            &EventUpdate {
                clear_paypal_price: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cleared.paypal_price, None);
    }

    #[test]
    fn zero_online_price_is_rejected() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let mut new = party();
        new.paypal_price = Some(Decimal::ZERO);
        assert_eq!(create_event(&db, &admin, &new).unwrap_err().code(), "VALIDATION");
    }

    #[test]
    fn inactive_events_hidden_from_public() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let event = create_event(&db, &admin, &party()).unwrap();
        set_event_active(&db, &admin, &event.id, false).unwrap();

        assert!(list_events(&db, &Principal::Anonymous, false).unwrap().is_empty());
        assert_eq!(list_events(&db, &admin, false).unwrap().len(), 1);
        assert_eq!(
            get_event(&db, &Principal::Anonymous, &event.id).unwrap_err().code(),
            "NOT_FOUND"
        );
        let cashier = testutil::staff(&db, "caja", Role::Cajero);
        assert_eq!(
            create_event(&db, &cashier, &party()).unwrap_err().code(),
            "FORBIDDEN"
        );
    }
}
