//! Order entry, serving and rejection.
//!
//! An order debits its account when created. Rejecting credits the price
//! back exactly once: the state flip is a compare-and-swap on
//! `state != 'REJECTED'` and the credit only runs when that CAS matched.
//! Un-rejecting is the mirror image.

use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::accounts;
use crate::audit;
use crate::auth::{self, Action, Principal};
use crate::db::{self, DbState};
use crate::error::{Conflict, PosError, Result};
use crate::models::{Account, LogAction, Order, OrderState};
use crate::money::{from_cents, line_total_cents};
use crate::products;

pub const MAX_QUANTITY: i64 = 99;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub account_id: String,
    pub product_id: String,
    pub quantity: i64,
}

/// Who to notify about a new order, resolved inside the transaction and
/// delivered after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotice {
    pub user_id: String,
    pub table_label: String,
    pub product_name: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderOutcome {
    pub order: Order,
    pub account_balance: Decimal,
    #[serde(skip)]
    pub notice: Option<PushNotice>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectOutcome {
    pub order: Order,
    pub account_balance: Decimal,
    /// False when the order was already rejected and nothing changed.
    pub credited: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderQuery {
    pub state: Option<OrderState>,
    pub account_id: Option<String>,
    /// Only orders on OPEN accounts.
    #[serde(default)]
    pub open_only: bool,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

const FROM_ORDERS: &str = "FROM orders o JOIN products p ON p.id = o.product_id";

pub(crate) fn load(conn: &Connection, id: &str) -> Result<Order> {
    conn.query_row(
        &format!("SELECT {} {FROM_ORDERS} WHERE o.id = ?1", Order::COLUMNS),
        [id],
        Order::from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("Order", id))
}

pub(crate) fn for_account(conn: &Connection, account_id: &str) -> Result<Vec<Order>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} {FROM_ORDERS} WHERE o.account_id = ?1 ORDER BY o.created_at DESC, o.rowid DESC",
        Order::COLUMNS
    ))?;
    let rows = stmt.query_map([account_id], Order::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Order queue, oldest first.
pub fn list_orders(db: &DbState, principal: &Principal, query: &OrderQuery) -> Result<Vec<Order>> {
    auth::authorize(principal, Action::ServeOrder)?;
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} {FROM_ORDERS} JOIN accounts a ON a.id = o.account_id
         WHERE (?1 IS NULL OR o.state = ?1)
           AND (?2 IS NULL OR o.account_id = ?2)
           AND (?3 = 0 OR a.status = 'OPEN')
         ORDER BY o.created_at, o.rowid",
        Order::COLUMNS
    ))?;
    let rows = stmt.query_map(
        params![query.state, query.account_id, query.open_only],
        Order::from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

fn open_account_of(conn: &Connection, order: &Order) -> Result<Account> {
    let account = accounts::load(conn, &order.account_id)?;
    if !account.is_open() {
        return Err(Conflict::AccountClosed.into());
    }
    Ok(account)
}

/// `delta_cents` is added to the balance of an OPEN account.
fn adjust_balance(conn: &Connection, account_id: &str, delta_cents: i64) -> Result<i64> {
    let changed = conn.execute(
        "UPDATE accounts SET current_balance_cents = current_balance_cents + ?2
         WHERE id = ?1 AND status = 'OPEN'",
        params![account_id, delta_cents],
    )?;
    if changed == 0 {
        return Err(Conflict::AccountClosed.into());
    }
    Ok(conn.query_row(
        "SELECT current_balance_cents FROM accounts WHERE id = ?1",
        [account_id],
        |row| row.get(0),
    )?)
}

/// Place an order and debit the account.
pub fn create_order(db: &DbState, principal: &Principal, new: &NewOrder) -> Result<OrderOutcome> {
    auth::authorize(principal, Action::CreateOrder)?;
    if !(1..=MAX_QUANTITY).contains(&new.quantity) {
        return Err(PosError::validation(format!(
            "Quantity must be between 1 and {MAX_QUANTITY}"
        )));
    }

    let conn = db.lock()?;
    let outcome = db::in_immediate_tx(&conn, |conn| {
        let account = accounts::load(conn, &new.account_id)?;
        auth::authorize_table(principal, Action::CreateOrder, account.table_id.as_deref())?;
        if !account.is_open() {
            return Err(Conflict::AccountClosed.into());
        }
        let product = products::load(conn, &new.product_id)?;
        if !product.is_active {
            return Err(Conflict::ProductInactive.into());
        }
        let unit_cents = crate::money::to_cents(product.price)?;
        let price_cents = line_total_cents(unit_cents, new.quantity)?;

        let id = db::new_id();
        conn.execute(
            "INSERT INTO orders (id, account_id, product_id, user_id, quantity, price_cents, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING', ?7)",
            params![
                id,
                account.id,
                product.id,
                principal.user_id(),
                new.quantity,
                price_cents,
                db::now_ts()
            ],
        )?;
        let balance = adjust_balance(conn, &account.id, -price_cents)?;
        audit::record(
            conn,
            principal.user_id(),
            account.table_id.as_deref(),
            LogAction::OrderCreated,
            json!({
                "orderId": id,
                "accountId": account.id,
                "product": product.name,
                "quantity": new.quantity,
                "price": from_cents(price_cents),
            }),
        )?;

        let notice = account
            .opened_by_user_id
            .filter(|opener| principal.user_id() != Some(opener.as_str()))
            .map(|user_id| PushNotice {
                user_id,
                table_label: account.table_label.clone(),
                product_name: product.name.clone(),
                quantity: new.quantity,
            });

        Ok(OrderOutcome {
            order: load(conn, &id)?,
            account_balance: from_cents(balance),
            notice,
        })
    })?;
    info!(
        order_id = %outcome.order.id,
        account_id = %new.account_id,
        price = %outcome.order.price,
        "Order created"
    );
    Ok(outcome)
}

/// Mark an order served (or back to pending). No balance effect.
pub fn set_order_served(db: &DbState, principal: &Principal, id: &str, served: bool) -> Result<Order> {
    auth::authorize(principal, Action::ServeOrder)?;
    let conn = db.lock()?;
    let order = db::in_immediate_tx(&conn, |conn| {
        let order = load(conn, id)?;
        let account = open_account_of(conn, &order)?;
        let (from, to, action) = if served {
            (OrderState::Pending, OrderState::Served, LogAction::OrderServed)
        } else {
            (OrderState::Served, OrderState::Pending, LogAction::OrderUnserved)
        };
        if order.state == to {
            return Ok(order);
        }
        if order.state == OrderState::Rejected {
            return Err(Conflict::OrderRejected.into());
        }
        let served_at = served.then(db::now_ts);
        conn.execute(
            "UPDATE orders SET state = ?3, served_at = ?4 WHERE id = ?1 AND state = ?2",
            params![id, from, to, served_at],
        )?;
        audit::record(
            conn,
            principal.user_id(),
            account.table_id.as_deref(),
            action,
            json!({ "orderId": id, "accountId": account.id }),
        )?;
        load(conn, id)
    })?;
    info!(order_id = %id, served, "Order serve state changed");
    Ok(order)
}

/// Reject an order and credit its price back. Idempotent.
pub fn reject_order(db: &DbState, principal: &Principal, id: &str) -> Result<RejectOutcome> {
    auth::authorize(principal, Action::RejectOrder)?;
    let conn = db.lock()?;
    let outcome = db::in_immediate_tx(&conn, |conn| {
        let order = load(conn, id)?;
        let account = open_account_of(conn, &order)?;
        let changed = conn.execute(
            "UPDATE orders SET state = 'REJECTED', rejected_at = ?2
             WHERE id = ?1 AND state != 'REJECTED'",
            params![id, db::now_ts()],
        )?;
        if changed == 0 {
            return Ok(RejectOutcome {
                order,
                account_balance: account.current_balance,
                credited: false,
            });
        }
        let price_cents: i64 =
            conn.query_row("SELECT price_cents FROM orders WHERE id = ?1", [id], |row| row.get(0))?;
        let balance = adjust_balance(conn, &account.id, price_cents)?;
        audit::record(
            conn,
            principal.user_id(),
            account.table_id.as_deref(),
            LogAction::OrderRejected,
            json!({
                "orderId": id,
                "accountId": account.id,
                "product": order.product_name,
                "credited": from_cents(price_cents),
            }),
        )?;
        Ok(RejectOutcome {
            order: load(conn, id)?,
            account_balance: from_cents(balance),
            credited: true,
        })
    })?;
    if outcome.credited {
        info!(order_id = %id, "Order rejected");
    }
    Ok(outcome)
}

/// Undo a rejection: the order goes back to PENDING and is debited again.
pub fn unreject_order(db: &DbState, principal: &Principal, id: &str) -> Result<OrderOutcome> {
    auth::authorize(principal, Action::RejectOrder)?;
    let conn = db.lock()?;
    let outcome = db::in_immediate_tx(&conn, |conn| {
        let order = load(conn, id)?;
        let account = open_account_of(conn, &order)?;
        let changed = conn.execute(
            "UPDATE orders SET state = 'PENDING', rejected_at = NULL, served_at = NULL
             WHERE id = ?1 AND state = 'REJECTED'",
            [id],
        )?;
        if changed == 0 {
            return Err(Conflict::OrderNotRejected.into());
        }
        let price_cents: i64 =
            conn.query_row("SELECT price_cents FROM orders WHERE id = ?1", [id], |row| row.get(0))?;
        let balance = adjust_balance(conn, &account.id, -price_cents)?;
        audit::record(
            conn,
            principal.user_id(),
            account.table_id.as_deref(),
            LogAction::OrderUnrejected,
            json!({ "orderId": id, "accountId": account.id, "debited": from_cents(price_cents) }),
        )?;
        Ok(OrderOutcome {
            order: load(conn, id)?,
            account_balance: from_cents(balance),
            notice: None,
        })
    })?;
    info!(order_id = %id, "Order unrejected");
    Ok(outcome)
}
