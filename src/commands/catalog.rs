//! Tables and products.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{ok, Call};
use crate::error::{PosError, Result};
use crate::products::{self, NewProduct, ProductUpdate};
use crate::tables::{self, NewTable, TableUpdate};

pub fn list_tables(call: Call<'_>) -> Result<Value> {
    ok(tables::list_tables(&call.state.db, &call.principal)?)
}

pub fn create_table(call: Call<'_>) -> Result<Value> {
    let new: NewTable = call.args()?;
    ok(tables::create_table(
        &call.state.db,
        &call.principal,
        &call.state.base_url,
        &new,
    )?)
}

pub fn update_table(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    let update: TableUpdate = call.args()?;
    ok(tables::update_table(
        &call.state.db,
        &call.principal,
        &call.state.base_url,
        &id,
        &update,
    )?)
}

pub fn delete_table(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    tables::delete_table(&call.state.db, &call.principal, &id)?;
    ok(json!({ "deleted": id }))
}

pub fn table_by_code(call: Call<'_>) -> Result<Value> {
    let code = call.str_arg(&["shortCode", "code"])?;
    ok(tables::get_table_by_short_code(&call.state.db, &call.principal, &code)?)
}

pub fn table_qr(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    ok(tables::table_qr(&call.state.db, &call.principal, &id)?)
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ProductFilter {
    include_inactive: bool,
    category: Option<String>,
}

pub fn list_products(call: Call<'_>) -> Result<Value> {
    let filter: ProductFilter = call.args()?;
    ok(products::list_products(
        &call.state.db,
        &call.principal,
        filter.include_inactive,
        filter.category.as_deref(),
    )?)
}

pub fn list_categories(call: Call<'_>) -> Result<Value> {
    ok(products::list_categories(&call.state.db, &call.principal)?)
}

pub fn create_product(call: Call<'_>) -> Result<Value> {
    let new: NewProduct = call.args()?;
    ok(products::create_product(&call.state.db, &call.principal, &new)?)
}

pub fn update_product(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    let update: ProductUpdate = call.args()?;
    ok(products::update_product(&call.state.db, &call.principal, &id, &update)?)
}

pub fn set_product_active(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    let active = call
        .bool_arg("active")
        .ok_or_else(|| PosError::validation("Missing active"))?;
    ok(products::set_product_active(&call.state.db, &call.principal, &id, active)?)
}

pub fn delete_product(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    let outcome = products::delete_product(&call.state.db, &call.principal, &id)?;
    ok(json!({ "id": id, "outcome": outcome }))
}
