//! Accounts and orders.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ok, Call};
use crate::accounts::{self, NewAccount};
use crate::error::{PosError, Result};
use crate::orders::{self, NewOrder, OrderQuery};
use crate::push;

pub fn open(call: Call<'_>) -> Result<Value> {
    let new: NewAccount = call.args()?;
    ok(accounts::open_account(&call.state.db, &call.principal, &new)?)
}

/// Customer self-service: reuse the table's open account or start one.
pub fn open_for_table(call: Call<'_>) -> Result<Value> {
    let table_id = call.str_arg(&["tableId", "id"])?;
    ok(accounts::open_account_for_table(&call.state.db, &call.principal, &table_id)?)
}

pub fn get(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    ok(accounts::get_account(&call.state.db, &call.principal, &id)?)
}

pub fn list_open(call: Call<'_>) -> Result<Value> {
    ok(accounts::list_open_accounts(&call.state.db, &call.principal)?)
}

#[derive(Deserialize)]
struct BalanceTopUp {
    id: String,
    amount: Decimal,
}

pub fn add_balance(call: Call<'_>) -> Result<Value> {
    let top_up: BalanceTopUp = call.args()?;
    ok(accounts::add_balance(
        &call.state.db,
        &call.principal,
        &top_up.id,
        top_up.amount,
    )?)
}

pub fn close(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    ok(accounts::close_account(&call.state.db, &call.principal, &id)?)
}

pub fn sweep(call: Call<'_>) -> Result<Value> {
    let closed = accounts::sweep_now(&call.state.db, &call.principal, &call.state.stale_policy)?;
    ok(json!({ "closed": closed }))
}

/// Place an order, then notify the waiter who opened the account.
pub fn create_order(call: Call<'_>) -> Result<Value> {
    let new: NewOrder = call.args()?;
    let outcome = orders::create_order(&call.state.db, &call.principal, &new)?;
    if let Some(notice) = outcome.notice.clone() {
        push::spawn_notify(call.state.db.clone(), call.state.push.clone(), notice);
    }
    ok(outcome)
}

pub fn list_orders(call: Call<'_>) -> Result<Value> {
    let query: OrderQuery = call.args()?;
    ok(orders::list_orders(&call.state.db, &call.principal, &query)?)
}

pub fn set_served(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    let served = call
        .bool_arg("served")
        .ok_or_else(|| PosError::validation("Missing served"))?;
    ok(orders::set_order_served(&call.state.db, &call.principal, &id, served)?)
}

pub fn reject_order(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    ok(orders::reject_order(&call.state.db, &call.principal, &id)?)
}

pub fn unreject_order(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    ok(orders::unreject_order(&call.state.db, &call.principal, &id)?)
}
