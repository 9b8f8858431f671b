//! Events, entries and online checkout.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{ok, Call};
use crate::checkout::{self, CompletePurchase, StartPurchase};
use crate::entries::{self, BulkDoorSale, DoorSale};
use crate::error::{PosError, Result};
use crate::events::{self, EventUpdate, NewEvent};
use crate::mailer;
use crate::models::{Entry, EntryStatus};

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EventFilter {
    active_only: bool,
}

pub fn list_events(call: Call<'_>) -> Result<Value> {
    let filter: EventFilter = call.args()?;
    ok(events::list_events(&call.state.db, &call.principal, filter.active_only)?)
}

pub fn get_event(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    ok(events::get_event(&call.state.db, &call.principal, &id)?)
}

pub fn create_event(call: Call<'_>) -> Result<Value> {
    let new: NewEvent = call.args()?;
    ok(events::create_event(&call.state.db, &call.principal, &new)?)
}

pub fn update_event(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    let update: EventUpdate = call.args()?;
    ok(events::update_event(&call.state.db, &call.principal, &id, &update)?)
}

pub fn set_event_active(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    let active = call
        .bool_arg("active")
        .ok_or_else(|| PosError::validation("Missing active"))?;
    ok(events::set_event_active(&call.state.db, &call.principal, &id, active)?)
}

/// Queue the ticket email for freshly sold entries.
fn email_tickets(call: &Call<'_>, event_id: &str, sold: &[Entry]) -> Result<()> {
    let event = events::get_event(&call.state.db, &call.principal, event_id)?;
    mailer::spawn_ticket_email(
        call.state.db.clone(),
        call.state.mailer.clone(),
        event,
        sold.to_vec(),
    );
    Ok(())
}

pub fn sell(call: Call<'_>) -> Result<Value> {
    let sale: DoorSale = call.args()?;
    let entry = entries::create_entry(&call.state.db, &call.principal, &sale)?;
    email_tickets(&call, &sale.event_id, std::slice::from_ref(&entry))?;
    ok(entry)
}

pub fn sell_bulk(call: Call<'_>) -> Result<Value> {
    let sale: BulkDoorSale = call.args()?;
    let sold = entries::create_bulk_entries(&call.state.db, &call.principal, &sale)?;
    email_tickets(&call, &sale.event_id, &sold)?;
    ok(sold)
}

pub fn lookup(call: Call<'_>) -> Result<Value> {
    let token = call.str_arg(&["token", "qrToken"])?;
    ok(entries::find_entry_by_token(&call.state.db, &call.principal, &token)?)
}

pub fn mark_used(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    ok(entries::mark_entry_used(&call.state.db, &call.principal, &id)?)
}

/// Door scan: look up and consume in one step.
pub fn admit(call: Call<'_>) -> Result<Value> {
    let token = call.str_arg(&["token", "qrToken"])?;
    ok(entries::admit_by_token(&call.state.db, &call.principal, &token)?)
}

pub fn cancel(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    ok(entries::cancel_entry(&call.state.db, &call.principal, &id)?)
}

pub fn revert(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    ok(entries::revert_entry_to_active(&call.state.db, &call.principal, &id)?)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryFilter {
    event_id: String,
    #[serde(default)]
    status: Option<EntryStatus>,
}

pub fn list_entries(call: Call<'_>) -> Result<Value> {
    let filter: EntryFilter = call.args()?;
    ok(entries::list_entries(
        &call.state.db,
        &call.principal,
        &filter.event_id,
        filter.status,
    )?)
}

pub fn stats(call: Call<'_>) -> Result<Value> {
    let event_id = call.str_arg(&["eventId", "id"])?;
    ok(entries::event_entry_stats(&call.state.db, &call.principal, &event_id)?)
}

pub fn qr(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    let data_url = entries::entry_qr(&call.state.db, &call.principal, &id)?;
    ok(json!({ "id": id, "qrDataUrl": data_url }))
}

pub fn whatsapp_link(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    let url = entries::whatsapp_link(&call.state.db, &call.principal, &id)?;
    ok(json!({ "id": id, "url": url }))
}

pub fn whatsapp_sent(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    ok(entries::mark_whatsapp_sent(&call.state.db, &call.principal, &id)?)
}

pub async fn resend_email(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    let entry = mailer::resend_ticket_email(
        &call.state.db,
        &call.principal,
        call.state.mailer.as_deref(),
        &id,
    )
    .await?;
    ok(entry)
}

pub async fn checkout_start(call: Call<'_>) -> Result<Value> {
    let request: StartPurchase = call.args()?;
    let purchase = checkout::start_purchase(
        &call.state.db,
        call.state.payments.as_deref(),
        &call.principal,
        &call.state.currency,
        &request,
    )
    .await?;
    ok(purchase)
}

/// Capture and issue tickets. Emails go out only the first time.
pub async fn checkout_complete(call: Call<'_>) -> Result<Value> {
    let request: CompletePurchase = call.args()?;
    let outcome = checkout::complete_purchase(
        &call.state.db,
        call.state.payments.as_deref(),
        &call.principal,
        &request,
    )
    .await?;
    if outcome.newly_issued {
        mailer::spawn_ticket_email(
            call.state.db.clone(),
            call.state.mailer.clone(),
            outcome.event.clone(),
            outcome.entries.clone(),
        );
    }
    ok(outcome)
}
