//! Event entries (tickets).
//!
//! Each row carries its own QR token and walks a one-way state machine:
//! ACTIVE -> USED at the door, or ACTIVE -> CANCELLED by staff. Both
//! transitions are compare-and-swap updates on `status = 'ACTIVE'`, so two
//! scanners reading the same QR at the same moment cannot both admit it.
//! Only an administrator can put a USED entry back to ACTIVE.

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
use crate::events;
use crate::models::{Entry, EntryStatus, Event, LogAction, SaleChannel};
use crate::money::{from_cents, line_total_cents, to_cents};
use crate::qr;

/// Attempts before a token collision is reported.
pub const TOKEN_ATTEMPTS: usize = 5;
pub const MAX_BULK_ENTRIES: i64 = 50;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Ticket holder details.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Buyer {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Buyer {
    pub fn validated(&self) -> Result<Buyer> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(PosError::validation("Client name is required"));
        }
        let email = self.email.trim().to_lowercase();
        let valid_email = email
            .split_once('@')
            .is_some_and(|(user, domain)| !user.is_empty() && domain.contains('.'));
        if !valid_email {
            return Err(PosError::validation(format!("Invalid email: {}", self.email)));
        }
        let phone = self
            .phone
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        Ok(Buyer {
            name: name.to_string(),
            email,
            phone,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoorSale {
    pub event_id: String,
    #[serde(flatten)]
    pub buyer: Buyer,
    /// People admitted by a single ticket.
    #[serde(default = "one")]
    pub number_of_entries: i64,
}

fn one() -> i64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkDoorSale {
    pub event_id: String,
    #[serde(flatten)]
    pub buyer: Buyer,
    pub count: i64,
}

/// Entry joined with its event, for the door screen.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryView {
    #[serde(flatten)]
    pub entry: Entry,
    pub event_name: String,
    pub event_date: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryStats {
    pub tickets: i64,
    pub people: i64,
    pub active: i64,
    pub used: i64,
    pub cancelled: i64,
    pub door_revenue: Decimal,
    pub online_revenue: Decimal,
}

/// Parameters for [`insert_entries`].
pub(crate) struct Issue<'a> {
    pub event: &'a Event,
    pub buyer: &'a Buyer,
    pub rows: i64,
    pub people_per_row: i64,
    pub unit_cents: i64,
    pub channel: SaleChannel,
    pub purchase_id: Option<&'a str>,
    pub sold_by: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub(crate) fn load(conn: &Connection, id: &str) -> Result<Entry> {
    conn.query_row(
        &format!("SELECT {} FROM entries WHERE id = ?1", Entry::COLUMNS),
        [id],
        Entry::from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("Entry", id))
}

fn load_by_token(conn: &Connection, token: &str) -> Result<Entry> {
    conn.query_row(
        &format!("SELECT {} FROM entries WHERE qr_token = ?1", Entry::COLUMNS),
        [token],
        Entry::from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("Entry", token))
}

pub(crate) fn for_purchase(conn: &Connection, purchase_id: &str) -> Result<Vec<Entry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM entries WHERE purchase_id = ?1 ORDER BY created_at, rowid",
        Entry::COLUMNS
    ))?;
    let rows = stmt.query_map([purchase_id], Entry::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn view(conn: &Connection, entry: Entry) -> Result<EntryView> {
    let event = events::load(conn, &entry.event_id)?;
    Ok(EntryView {
        entry,
        event_name: event.name,
        event_date: event.date,
    })
}

/// Read-only lookup by QR token. Does not change state.
pub fn find_entry_by_token(db: &DbState, principal: &Principal, token: &str) -> Result<EntryView> {
    auth::authorize(principal, Action::ValidateEntries)?;
    let token = codes::normalize(token);
    let conn = db.lock()?;
    let entry = load_by_token(&conn, &token)?;
    view(&conn, entry)
}

pub fn list_entries(
    db: &DbState,
    principal: &Principal,
    event_id: &str,
    status: Option<EntryStatus>,
) -> Result<Vec<Entry>> {
    auth::authorize(principal, Action::ViewEntries)?;
    let conn = db.lock()?;
    events::load(&conn, event_id)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM entries WHERE event_id = ?1 AND (?2 IS NULL OR status = ?2)
         ORDER BY created_at DESC, rowid DESC",
        Entry::COLUMNS
    ))?;
    let rows = stmt.query_map(params![event_id, status], Entry::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Door and revenue counters for one event. Cancelled tickets earn nothing.
pub fn event_entry_stats(db: &DbState, principal: &Principal, event_id: &str) -> Result<EntryStats> {
    auth::authorize(principal, Action::ViewEntries)?;
    let conn = db.lock()?;
    events::load(&conn, event_id)?;
    let mut stmt = conn.prepare(
        "SELECT status, channel, COUNT(*), SUM(number_of_entries), SUM(total_price_cents)
         FROM entries WHERE event_id = ?1 GROUP BY status, channel",
    )?;
    let mut rows = stmt.query([event_id])?;
    let mut stats = EntryStats::default();
    let (mut door_cents, mut online_cents) = (0i64, 0i64);
    while let Some(row) = rows.next()? {
        let status: EntryStatus = row.get(0)?;
        let channel: SaleChannel = row.get(1)?;
        let tickets: i64 = row.get(2)?;
        let people: i64 = row.get(3)?;
        let cents: i64 = row.get(4)?;
        stats.tickets += tickets;
        stats.people += people;
        match status {
            EntryStatus::Active => stats.active += people,
            EntryStatus::Used => stats.used += people,
            EntryStatus::Cancelled => {
                stats.cancelled += people;
                continue;
            }
        }
        match channel {
            SaleChannel::Door => door_cents += cents,
            SaleChannel::Online => online_cents += cents,
        }
    }
    stats.door_revenue = from_cents(door_cents);
    stats.online_revenue = from_cents(online_cents);
    Ok(stats)
}

// ---------------------------------------------------------------------------
// Issuing
// ---------------------------------------------------------------------------

/// Per-person price for `channel`, or a conflict if the event can't be sold
/// there.
pub(crate) fn unit_price_cents(event: &Event, channel: SaleChannel) -> Result<i64> {
    if !event.is_active {
        return Err(Conflict::EventInactive.into());
    }
    match channel {
        SaleChannel::Door => to_cents(event.cover_price),
        SaleChannel::Online => match event.paypal_price {
            Some(price) => to_cents(price),
            None => Err(Conflict::EventNotSellable { channel: "online" }.into()),
        },
    }
}

/// Insert `issue.rows` entries on the caller's transaction, each with a
/// fresh token.
pub(crate) fn insert_entries(
    conn: &Connection,
    issue: &Issue<'_>,
    next_token: &mut dyn FnMut() -> String,
) -> Result<Vec<Entry>> {
    let total_cents = line_total_cents(issue.unit_cents, issue.people_per_row)?;
    let now = db::now_ts();
    let mut created = Vec::with_capacity(issue.rows as usize);

    for _ in 0..issue.rows {
        let id = db::new_id();
        let mut inserted = false;
        for attempt in 1..=TOKEN_ATTEMPTS {
            let token = next_token();
            let result = conn.execute(
                "INSERT INTO entries (id, event_id, client_name, client_email, client_phone,
                                      number_of_entries, total_price_cents, channel, purchase_id,
                                      qr_token, status, sold_by_user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'ACTIVE', ?11, ?12)",
                params![
                    id,
                    issue.event.id,
                    issue.buyer.name,
                    issue.buyer.email,
                    issue.buyer.phone,
                    issue.people_per_row,
                    total_cents,
                    issue.channel,
                    issue.purchase_id,
                    token,
                    issue.sold_by,
                    now
                ],
            );
            match result {
                Ok(_) => {
                    inserted = true;
                    break;
                }
                Err(e) if db::is_unique_violation(&e) => {
                    warn!(attempt, "ticket token collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !inserted {
            return Err(PosError::Collision(format!(
                "No free ticket token after {TOKEN_ATTEMPTS} attempts"
            )));
        }
        created.push(load(conn, &id)?);
    }

    let action = match issue.channel {
        SaleChannel::Door => LogAction::EntryCreated,
        SaleChannel::Online => LogAction::EntryPurchased,
    };
    audit::record(
        conn,
        issue.sold_by,
        None,
        action,
        json!({
            "eventId": issue.event.id,
            "entryIds": created.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            "clientEmail": issue.buyer.email,
            "purchaseId": issue.purchase_id,
            "total": from_cents(total_cents * issue.rows),
        }),
    )?;
    Ok(created)
}

fn sell_at_door(
    db: &DbState,
    principal: &Principal,
    event_id: &str,
    buyer: &Buyer,
    rows: i64,
    people_per_row: i64,
    next_token: &mut dyn FnMut() -> String,
) -> Result<Vec<Entry>> {
    auth::authorize(principal, Action::SellEntries)?;
    let buyer = buyer.validated()?;

    let conn = db.lock()?;
    let entries = db::in_immediate_tx(&conn, |conn| {
        let event = events::load(conn, event_id)?;
        let unit_cents = unit_price_cents(&event, SaleChannel::Door)?;
        insert_entries(
            conn,
            &Issue {
                event: &event,
                buyer: &buyer,
                rows,
                people_per_row,
                unit_cents,
                channel: SaleChannel::Door,
                purchase_id: None,
                sold_by: principal.user_id(),
            },
            next_token,
        )
    })?;
    info!(event_id = %event_id, tickets = entries.len(), "Door entries sold");
    Ok(entries)
}

/// Sell one ticket admitting `number_of_entries` people.
pub fn create_entry(db: &DbState, principal: &Principal, sale: &DoorSale) -> Result<Entry> {
    if !(1..=MAX_BULK_ENTRIES).contains(&sale.number_of_entries) {
        return Err(PosError::validation(format!(
            "Number of entries must be between 1 and {MAX_BULK_ENTRIES}"
        )));
    }
    let mut entries = sell_at_door(
        db,
        principal,
        &sale.event_id,
        &sale.buyer,
        1,
        sale.number_of_entries,
        &mut codes::ticket_token,
    )?;
    entries
        .pop()
        .ok_or_else(|| PosError::Internal("entry insert returned nothing".into()))
}

/// Sell `count` single-person tickets, each with its own QR.
pub fn create_bulk_entries(db: &DbState, principal: &Principal, sale: &BulkDoorSale) -> Result<Vec<Entry>> {
    create_bulk_entries_with(db, principal, sale, &mut codes::ticket_token)
}

pub(crate) fn create_bulk_entries_with(
    db: &DbState,
    principal: &Principal,
    sale: &BulkDoorSale,
    next_token: &mut dyn FnMut() -> String,
) -> Result<Vec<Entry>> {
    if !(1..=MAX_BULK_ENTRIES).contains(&sale.count) {
        return Err(PosError::validation(format!(
            "Count must be between 1 and {MAX_BULK_ENTRIES}"
        )));
    }
    sell_at_door(db, principal, &sale.event_id, &sale.buyer, sale.count, 1, next_token)
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Why a CAS on an ACTIVE entry did not match.
fn not_active(entry: &Entry) -> PosError {
    match entry.status {
        EntryStatus::Used => Conflict::EntryAlreadyUsed {
            used_at: entry.used_at.clone().unwrap_or_default(),
        }
        .into(),
        EntryStatus::Cancelled => Conflict::EntryCancelled.into(),
        EntryStatus::Active => PosError::Internal(format!("entry {} changed concurrently", entry.id)),
    }
}

fn use_entry(conn: &Connection, principal: &Principal, id: &str) -> Result<Entry> {
    let changed = conn.execute(
        "UPDATE entries SET status = 'USED', used_at = ?2 WHERE id = ?1 AND status = 'ACTIVE'",
        params![id, db::now_ts()],
    )?;
    let entry = load(conn, id)?;
    if changed == 0 {
        return Err(not_active(&entry));
    }
    audit::record(
        conn,
        principal.user_id(),
        None,
        LogAction::EntryUsed,
        json!({ "entryId": id, "eventId": entry.event_id, "people": entry.number_of_entries }),
    )?;
    Ok(entry)
}

/// ACTIVE -> USED. A second scan gets `EntryAlreadyUsed`.
pub fn mark_entry_used(db: &DbState, principal: &Principal, id: &str) -> Result<Entry> {
    auth::authorize(principal, Action::ValidateEntries)?;
    let conn = db.lock()?;
    let entry = db::in_immediate_tx(&conn, |conn| use_entry(conn, principal, id))?;
    info!(entry_id = %id, "Entry admitted");
    Ok(entry)
}

/// Lookup and admit in one step, for door scanners.
pub fn admit_by_token(db: &DbState, principal: &Principal, token: &str) -> Result<EntryView> {
    auth::authorize(principal, Action::ValidateEntries)?;
    let token = codes::normalize(token);
    let conn = db.lock()?;
    let view = db::in_immediate_tx(&conn, |conn| {
        let entry = load_by_token(conn, &token)?;
        let entry = use_entry(conn, principal, &entry.id)?;
        view(conn, entry)
    })?;
    info!(entry_id = %view.entry.id, "Entry admitted by token");
    Ok(view)
}

/// ACTIVE -> CANCELLED.
pub fn cancel_entry(db: &DbState, principal: &Principal, id: &str) -> Result<Entry> {
    auth::authorize(principal, Action::CancelEntry)?;
    let conn = db.lock()?;
    let entry = db::in_immediate_tx(&conn, |conn| {
        let changed = conn.execute(
            "UPDATE entries SET status = 'CANCELLED' WHERE id = ?1 AND status = 'ACTIVE'",
            [id],
        )?;
        let entry = load(conn, id)?;
        if changed == 0 {
            return Err(not_active(&entry));
        }
        audit::record(
            conn,
            principal.user_id(),
            None,
            LogAction::EntryCancelled,
            json!({ "entryId": id, "eventId": entry.event_id }),
        )?;
        Ok(entry)
    })?;
    info!(entry_id = %id, "Entry cancelled");
    Ok(entry)
}

/// Administrative USED -> ACTIVE override for a mis-scan.
pub fn revert_entry_to_active(db: &DbState, principal: &Principal, id: &str) -> Result<Entry> {
    auth::authorize(principal, Action::RevertEntry)?;
    let conn = db.lock()?;
    let entry = db::in_immediate_tx(&conn, |conn| {
        let before = load(conn, id)?;
        let changed = conn.execute(
            "UPDATE entries SET status = 'ACTIVE', used_at = NULL WHERE id = ?1 AND status = 'USED'",
            [id],
        )?;
        if changed == 0 {
            return Err(match before.status {
                EntryStatus::Cancelled => Conflict::EntryCancelled,
                _ => Conflict::EntryNotUsed,
            }
            .into());
        }
        audit::record(
            conn,
            principal.user_id(),
            None,
            LogAction::EntryReverted,
            json!({ "entryId": id, "previousUsedAt": before.used_at }),
        )?;
        load(conn, id)
    })?;
    warn!(entry_id = %id, "Entry reverted to active by administrator");
    Ok(entry)
}

// ---------------------------------------------------------------------------
// Delivery helpers
// ---------------------------------------------------------------------------

pub fn mark_whatsapp_sent(db: &DbState, principal: &Principal, id: &str) -> Result<Entry> {
    auth::authorize(principal, Action::SellEntries)?;
    let conn = db.lock()?;
    load(&conn, id)?;
    conn.execute("UPDATE entries SET whatsapp_sent = 1 WHERE id = ?1", [id])?;
    load(&conn, id)
}

pub(crate) fn mark_email_sent(conn: &Connection, ids: &[String]) -> Result<()> {
    for id in ids {
        conn.execute("UPDATE entries SET email_sent = 1 WHERE id = ?1", [id])?;
    }
    Ok(())
}

/// `wa.me` link with the ticket code prefilled, for sending by hand.
pub fn whatsapp_link(db: &DbState, principal: &Principal, id: &str) -> Result<String> {
    auth::authorize(principal, Action::SellEntries)?;
    let view = {
        let conn = db.lock()?;
        let entry = load(&conn, id)?;
        view(&conn, entry)?
    };
    let phone: String = view
        .entry
        .client_phone
        .as_deref()
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    if phone.is_empty() {
        return Err(PosError::validation("Entry has no phone number"));
    }
    let text = format!(
        "Hola {}! Tu entrada para {}: {} ({} persona(s)).",
        view.entry.client_name, view.event_name, view.entry.qr_token, view.entry.number_of_entries
    );
    let url = reqwest::Url::parse_with_params(&format!("https://wa.me/{phone}"), &[("text", text)])
        .map_err(|e| PosError::Internal(format!("Invalid WhatsApp URL: {e}")))?;
    Ok(url.to_string())
}

/// QR image for an entry's token.
pub fn entry_qr(db: &DbState, principal: &Principal, id: &str) -> Result<String> {
    auth::authorize(principal, Action::ViewEntries)?;
    let token = {
        let conn = db.lock()?;
        load(&conn, id)?.qr_token
    };
    qr::data_url(&token)
}
