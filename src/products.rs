//! Product catalogue.

use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::audit;
use crate::auth::{self, Action, Principal};
use crate::db::{self, DbState};
use crate::error::{PosError, Result};
use crate::models::{LogAction, Product};
use crate::money::{from_cents, to_cents};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub name: String,
    pub price: Decimal,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub emoji: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUpdate {
    pub name: Option<String>,
    pub price: Option<Decimal>,
    /// Empty string clears.
    pub category: Option<String>,
    /// Empty string clears.
    pub emoji: Option<String>,
}

/// Outcome of [`delete_product`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Deletion {
    Deleted,
    /// Referenced by orders; deactivated instead.
    Deactivated,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    pub category: String,
    pub product_count: i64,
}

fn price_cents(price: Decimal) -> Result<i64> {
    let cents = to_cents(price)?;
    if cents < 0 {
        return Err(PosError::validation("Price cannot be negative"));
    }
    Ok(cents)
}

fn optional_text(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

pub(crate) fn load(conn: &Connection, id: &str) -> Result<Product> {
    conn.query_row(
        &format!("SELECT {} FROM products WHERE id = ?1", Product::COLUMNS),
        [id],
        Product::from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("Product", id))
}

pub fn create_product(db: &DbState, principal: &Principal, new: &NewProduct) -> Result<Product> {
    auth::authorize(principal, Action::ManageProducts)?;
    let name = new.name.trim();
    if name.is_empty() {
        return Err(PosError::validation("Product name is required"));
    }
    let cents = price_cents(new.price)?;
    let id = db::new_id();

    let conn = db.lock()?;
    let product = db::in_immediate_tx(&conn, |conn| {
        let now = db::now_ts();
        conn.execute(
            "INSERT INTO products (id, name, price_cents, category, emoji, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                id,
                name,
                cents,
                optional_text(new.category.as_deref()),
                optional_text(new.emoji.as_deref()),
                now
            ],
        )?;
        audit::record(
            conn,
            principal.user_id(),
            None,
            LogAction::ProductCreated,
            json!({ "productId": id, "name": name, "price": from_cents(cents) }),
        )?;
        load(conn, &id)
    })?;
    info!(product_id = %product.id, "Product created");
    Ok(product)
}

/// Update a product. Existing orders keep their price snapshot.
pub fn update_product(db: &DbState, principal: &Principal, id: &str, update: &ProductUpdate) -> Result<Product> {
    auth::authorize(principal, Action::ManageProducts)?;
    let name = match update.name.as_deref().map(str::trim) {
        Some("") => return Err(PosError::validation("Product name is required")),
        other => other.map(str::to_string),
    };
    let cents = update.price.map(price_cents).transpose()?;

    let conn = db.lock()?;
    let product = db::in_immediate_tx(&conn, |conn| {
        let current = load(conn, id)?;
        let category = match &update.category {
            Some(c) => optional_text(Some(c)),
            None => current.category.clone(),
        };
        let emoji = match &update.emoji {
            Some(e) => optional_text(Some(e)),
            None => current.emoji.clone(),
        };
        conn.execute(
            "UPDATE products SET
                name = COALESCE(?2, name),
                price_cents = COALESCE(?3, price_cents),
                category = ?4,
                emoji = ?5,
                updated_at = ?6
             WHERE id = ?1",
            params![id, name, cents, category, emoji, db::now_ts()],
        )?;
        audit::record(
            conn,
            principal.user_id(),
            None,
            LogAction::ProductUpdated,
            json!({
                "productId": id,
                "previousPrice": current.price,
                "price": cents.map(from_cents),
            }),
        )?;
        load(conn, id)
    })?;
    info!(product_id = %id, "Product updated");
    Ok(product)
}

pub fn set_product_active(db: &DbState, principal: &Principal, id: &str, active: bool) -> Result<Product> {
    auth::authorize(principal, Action::ManageProducts)?;
    let conn = db.lock()?;
    let product = db::in_immediate_tx(&conn, |conn| {
        load(conn, id)?;
        conn.execute(
            "UPDATE products SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, active, db::now_ts()],
        )?;
        audit::record(
            conn,
            principal.user_id(),
            None,
            LogAction::ProductUpdated,
            json!({ "productId": id, "isActive": active }),
        )?;
        load(conn, id)
    })?;
    info!(product_id = %id, active, "Product availability changed");
    Ok(product)
}

/// Hard-delete a product that was never ordered; otherwise deactivate it.
pub fn delete_product(db: &DbState, principal: &Principal, id: &str) -> Result<Deletion> {
    auth::authorize(principal, Action::ManageProducts)?;
    let conn = db.lock()?;
    let outcome = db::in_immediate_tx(&conn, |conn| {
        let product = load(conn, id)?;
        let ordered: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE product_id = ?1",
            [id],
            |row| row.get(0),
        )?;
        let outcome = if ordered > 0 {
            conn.execute(
                "UPDATE products SET is_active = 0, updated_at = ?2 WHERE id = ?1",
                params![id, db::now_ts()],
            )?;
            Deletion::Deactivated
        } else {
            conn.execute("DELETE FROM products WHERE id = ?1", [id])?;
            Deletion::Deleted
        };
        audit::record(
            conn,
            principal.user_id(),
            None,
            LogAction::ProductDeleted,
            json!({ "productId": id, "name": product.name, "outcome": outcome }),
        )?;
        Ok(outcome)
    })?;
    info!(product_id = %id, ?outcome, "Product removed");
    Ok(outcome)
}

/// Catalogue listing. Non-staff callers only ever see active products.
pub fn list_products(
    db: &DbState,
    principal: &Principal,
    include_inactive: bool,
    category: Option<&str>,
) -> Result<Vec<Product>> {
    auth::authorize(principal, Action::ViewCatalog)?;
    let include_inactive = include_inactive && principal.role().is_some();
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM products
         WHERE (?1 OR is_active = 1) AND (?2 IS NULL OR category = ?2)
         ORDER BY category IS NULL, category COLLATE NOCASE, name COLLATE NOCASE",
        Product::COLUMNS
    ))?;
    let rows = stmt.query_map(params![include_inactive, category], Product::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Categories of active products.
pub fn list_categories(db: &DbState, principal: &Principal) -> Result<Vec<CategorySummary>> {
    auth::authorize(principal, Action::ViewCatalog)?;
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT category, COUNT(*) FROM products
         WHERE is_active = 1 AND category IS NOT NULL
         GROUP BY category ORDER BY category COLLATE NOCASE",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CategorySummary {
            category: row.get(0)?,
            product_count: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::testutil;

    fn beer() -> NewProduct {
        NewProduct {
            name: "Cerveza".into(),
            price: Decimal::new(5000, 2),
            category: Some("Bebidas".into()),
            emoji: Some("🍺".into()),
        }
    }

    #[test]
    fn create_and_list_for_guests() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let product = create_product(&db, &admin, &beer()).unwrap();
        assert_eq!(product.price, Decimal::from(50));

        set_product_active(&db, &admin, &product.id, false).unwrap();
        let guest = Principal::TableGuest { table_id: "t".into() };
        assert!(list_products(&db, &guest, true, None).unwrap().is_empty());
        assert_eq!(list_products(&db, &admin, true, None).unwrap().len(), 1);
    }

    #[test]
    fn rejects_negative_and_sub_cent_prices() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let mut bad = beer();
        bad.price = Decimal::new(-100, 2);
        assert_eq!(create_product(&db, &admin, &bad).unwrap_err().code(), "VALIDATION");
        bad.price = Decimal::new(1, 3);
        assert_eq!(create_product(&db, &admin, &bad).unwrap_err().code(), "VALIDATION");
    }

    #[test]
    fn delete_is_soft_once_ordered() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let unused = create_product(&db, &admin, &beer()).unwrap();
        assert_eq!(delete_product(&db, &admin, &unused.id).unwrap(), Deletion::Deleted);

        let fixture = testutil::Fixture::new(500);
        let product = fixture.product("Vino", 5000);
        fixture.order(&product.id, 1);
        assert_eq!(
            delete_product(&fixture.db, &fixture.admin, &product.id).unwrap(),
            Deletion::Deactivated
        );
        let conn = fixture.db.lock().unwrap();
        assert!(!load(&conn, &product.id).unwrap().is_active);
    }

    #[test]
    fn update_changes_price_and_clears_emoji() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        let product = create_product(&db, &admin, &beer()).unwrap();
        let updated = update_product(
            &db,
            &admin,
            &product.id,
            &ProductUpdate {
                price: Some(Decimal::new(5500, 2)),
                emoji: Some(String::new()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(updated.price, Decimal::new(5500, 2));
        assert_eq!(updated.emoji, None);
        assert_eq!(updated.category.as_deref(), Some("Bebidas"));
    }

    #[test]
    fn categories_count_active_products() {
        let db = db::open_in_memory();
        let admin = testutil::staff(&db, "admin", Role::Admin);
        create_product(&db, &admin, &beer()).unwrap();
        let mut water = beer();
        water.name = "Agua".into();
        create_product(&db, &admin, &water).unwrap();
        let cats = list_categories(&db, &Principal::Anonymous).unwrap();
        assert_eq!(cats.len(), 1);
        assert_eq!(cats[0].product_count, 2);
    }
}
