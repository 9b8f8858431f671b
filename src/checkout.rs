//! Online ticket purchase.
//!
//! `start_purchase` prices the order and pins quantity and amount in a
//! `ticket_purchases` row keyed by the provider order id. `complete_purchase`
//! captures that order and, only when the provider reports COMPLETED,
//! records the capture on its own, then issues the entries in the same
//! transaction that marks the purchase COMPLETED. Completing an already
//! COMPLETED purchase returns its entries without capturing again, and a
//! captured purchase whose entries failed to issue is retried without a
//! second capture.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::auth::{self, Action, Principal};
use crate::codes;
use crate::db::{self, DbState};
use crate::entries::{self, Buyer, Issue, MAX_BULK_ENTRIES};
use crate::error::{Conflict, PosError, Result};
use crate::events;
use crate::models::{Entry, Event, PurchaseStatus, SaleChannel, TicketPurchase};
use crate::money::{from_cents, line_total_cents, to_cents};
use crate::paypal::PaymentProvider;

pub const DEFAULT_CURRENCY: &str = "USD";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPurchase {
    pub event_id: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePurchase {
    pub paypal_order_id: String,
    #[serde(flatten)]
    pub buyer: Buyer,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseOutcome {
    pub purchase: TicketPurchase,
    pub entries: Vec<Entry>,
    /// False when the purchase had already been completed earlier.
    pub newly_issued: bool,
    #[serde(skip)]
    pub event: Event,
}

fn provider(provider: Option<&dyn PaymentProvider>) -> Result<&dyn PaymentProvider> {
    provider.ok_or_else(|| PosError::Payment("Online payments are not configured".into()))
}

fn load(conn: &Connection, paypal_order_id: &str) -> Result<TicketPurchase> {
    conn.query_row(
        &format!(
            "SELECT {} FROM ticket_purchases WHERE paypal_order_id = ?1",
            TicketPurchase::COLUMNS
        ),
        [paypal_order_id],
        TicketPurchase::from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("Purchase", paypal_order_id))
}

fn mark_captured(db: &DbState, paypal_order_id: &str) -> Result<()> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE ticket_purchases SET captured_at = ?2
         WHERE paypal_order_id = ?1 AND status = 'CREATED' AND captured_at IS NULL",
        params![paypal_order_id, db::now_ts()],
    )?;
    Ok(())
}

fn mark_failed(db: &DbState, paypal_order_id: &str) -> Result<()> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE ticket_purchases SET status = 'FAILED'
         WHERE paypal_order_id = ?1 AND status = 'CREATED'",
        [paypal_order_id],
    )?;
    Ok(())
}

/// Create the provider order for `quantity` tickets at the online price.
pub async fn start_purchase(
    db: &DbState,
    payments: Option<&dyn PaymentProvider>,
    principal: &Principal,
    currency: &str,
    request: &StartPurchase,
) -> Result<TicketPurchase> {
    auth::authorize(principal, Action::PurchaseEntries)?;
    let payments = provider(payments)?;
    if !(1..=MAX_BULK_ENTRIES).contains(&request.quantity) {
        return Err(PosError::validation(format!(
            "Quantity must be between 1 and {MAX_BULK_ENTRIES}"
        )));
    }

    let (event, amount_cents) = {
        let conn = db.lock()?;
        let event = events::load(&conn, &request.event_id)?;
        let unit = entries::unit_price_cents(&event, SaleChannel::Online)?;
        (event, line_total_cents(unit, request.quantity)?)
    };

    let description = format!("{} x {}", request.quantity, event.name);
    let order_id = payments
        .create_order(from_cents(amount_cents), currency, &description)
        .await?;

    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO ticket_purchases (paypal_order_id, event_id, quantity, amount_cents,
                                       currency, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'CREATED', ?6)",
        params![order_id, event.id, request.quantity, amount_cents, currency, db::now_ts()],
    )?;
    info!(paypal_order_id = %order_id, event_id = %event.id, quantity = request.quantity, "Purchase started");
    load(&conn, &order_id)
}

/// Capture an approved order and issue its entries.
///
/// A transport failure leaves the purchase CREATED so the buyer can retry.
/// A capture that comes back with any status other than COMPLETED, or with
/// an amount different from the pinned one, marks it FAILED. Once captured,
/// a failure while issuing leaves it CREATED with `captured_at` set and the
/// next call issues without touching the provider.
pub async fn complete_purchase(
    db: &DbState,
    payments: Option<&dyn PaymentProvider>,
    principal: &Principal,
    request: &CompletePurchase,
) -> Result<PurchaseOutcome> {
    auth::authorize(principal, Action::PurchaseEntries)?;
    let payments = provider(payments)?;
    let buyer = request.buyer.validated()?;
    let order_id = request.paypal_order_id.trim();

    let purchase = {
        let conn = db.lock()?;
        let purchase = load(&conn, order_id)?;
        match purchase.status {
            PurchaseStatus::Completed => {
                let event = events::load(&conn, &purchase.event_id)?;
                let entries = entries::for_purchase(&conn, order_id)?;
                return Ok(PurchaseOutcome {
                    purchase,
                    entries,
                    newly_issued: false,
                    event,
                });
            }
            PurchaseStatus::Failed => return Err(Conflict::PurchaseFailed.into()),
            PurchaseStatus::Created => purchase,
        }
    };

    if purchase.captured_at.is_some() {
        info!(paypal_order_id = %order_id, "Issuing entries for captured purchase");
    } else {
        let capture = payments.capture(order_id).await?;
        if !capture.is_completed() {
            warn!(paypal_order_id = %order_id, status = %capture.status, "Capture not completed");
            mark_failed(db, order_id)?;
            return Err(PosError::Payment(format!(
                "Payment not completed (status {})",
                capture.status
            )));
        }
        if capture.amount.is_some_and(|paid| paid != purchase.amount) {
            error!(
                paypal_order_id = %order_id,
                expected = %purchase.amount,
                paid = ?capture.amount,
                "Captured amount does not match purchase"
            );
            mark_failed(db, order_id)?;
            return Err(PosError::Payment("Captured amount does not match the order".into()));
        }
        // The provider will not capture twice; keep that fact even if
        // issuing below rolls back.
        mark_captured(db, order_id)?;
    }

    let amount_cents = to_cents(purchase.amount)?;
    let unit_cents = amount_cents / purchase.quantity;
    let conn = db.lock()?;
    let outcome = db::in_immediate_tx(&conn, |conn| {
        let changed = conn.execute(
            "UPDATE ticket_purchases
             SET status = 'COMPLETED', completed_at = ?2,
                 client_name = ?3, client_email = ?4, client_phone = ?5
             WHERE paypal_order_id = ?1 AND status = 'CREATED'",
            params![order_id, db::now_ts(), buyer.name, buyer.email, buyer.phone],
        )?;
        let event = events::load(conn, &purchase.event_id)?;
        if changed == 0 {
            // Completed by a concurrent request after our capture.
            let purchase = load(conn, order_id)?;
            if purchase.status != PurchaseStatus::Completed {
                return Err(Conflict::PurchaseFailed.into());
            }
            return Ok(PurchaseOutcome {
                purchase,
                entries: entries::for_purchase(conn, order_id)?,
                newly_issued: false,
                event,
            });
        }
        let issued = entries::insert_entries(
            conn,
            &Issue {
                event: &event,
                buyer: &buyer,
                rows: purchase.quantity,
                people_per_row: 1,
                unit_cents,
                channel: SaleChannel::Online,
                purchase_id: Some(order_id),
                sold_by: principal.user_id(),
            },
            &mut codes::ticket_token,
        )?;
        Ok(PurchaseOutcome {
            purchase: load(conn, order_id)?,
            entries: issued,
            newly_issued: true,
            event,
        })
    })?;

    if outcome.newly_issued {
        info!(
            paypal_order_id = %order_id,
            tickets = outcome.entries.len(),
            "Purchase completed"
        );
    }
    Ok(outcome)
}
