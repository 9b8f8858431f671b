//! Shared fixtures for unit tests.

use rusqlite::params;
use rust_decimal::Decimal;

use crate::accounts::{self, NewAccount};
use crate::auth::{self, Principal};
use crate::db::{self, DbState};
use crate::models::{Account, DiningTable, Order, Product, Role};
use crate::money::from_cents;
use crate::orders::{self, NewOrder};
use crate::products::{self, NewProduct};
use crate::tables::{self, NewTable};

pub const BASE_URL: &str = "https://club.example";

/// Insert a staff user directly and return its principal.
pub fn staff(db: &DbState, username: &str, role: Role) -> Principal {
    let id = db::new_id();
    let hash = auth::hash_password("secret123").unwrap();
    db.lock()
        .unwrap()
        .execute(
            "INSERT INTO users (id, username, password_hash, role, name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?2, ?5)",
            params![id, username, hash, role, db::now_ts()],
        )
        .unwrap();
    Principal::staff(id, username, role)
}

pub fn table(db: &DbState, admin: &Principal, name: &str) -> DiningTable {
    tables::create_table(
        db,
        admin,
        BASE_URL,
        &NewTable {
            name: name.into(),
            zone: None,
        },
    )
    .unwrap()
}

pub fn product(db: &DbState, admin: &Principal, name: &str, price_cents: i64) -> Product {
    products::create_product(
        db,
        admin,
        &NewProduct {
            name: name.into(),
            price: from_cents(price_cents),
            category: Some("Bebidas".into()),
            emoji: None,
        },
    )
    .unwrap()
}

pub fn open_account(db: &DbState, principal: &Principal, table_id: &str, balance_cents: i64) -> Account {
    accounts::open_account(
        db,
        principal,
        &NewAccount {
            table_id: table_id.into(),
            initial_balance: from_cents(balance_cents),
            client_name: None,
        },
    )
    .unwrap()
}

/// In-memory database with one of each role and an open account on
/// "Mesa 1", opened by the waiter.
pub struct Fixture {
    pub db: DbState,
    pub admin: Principal,
    pub cashier: Principal,
    pub waiter: Principal,
    pub table: DiningTable,
    pub account: Account,
}

impl Fixture {
    pub fn new(initial_balance: i64) -> Self {
        let db = db::open_in_memory();
        let admin = staff(&db, "admin", Role::Admin);
        let cashier = staff(&db, "caja", Role::Cajero);
        let waiter = staff(&db, "ana", Role::Mesero);
        let table = table(&db, &admin, "Mesa 1");
        let account = open_account(&db, &waiter, &table.id, initial_balance * 100);
        assert_eq!(account.initial_balance, Decimal::from(initial_balance));
        Self {
            db,
            admin,
            cashier,
            waiter,
            table,
            account,
        }
    }

    pub fn product(&self, name: &str, price_cents: i64) -> Product {
        product(&self.db, &self.admin, name, price_cents)
    }

    pub fn order(&self, product_id: &str, quantity: i64) -> Order {
        orders::create_order(
            &self.db,
            &self.waiter,
            &NewOrder {
                account_id: self.account.id.clone(),
                product_id: product_id.into(),
                quantity,
            },
        )
        .unwrap()
        .order
    }
}

/// Active event priced at 150 at the door and, when given, online.
pub fn event(db: &DbState, admin: &Principal, paypal_price_cents: Option<i64>) -> crate::models::Event {
    crate::events::create_event(
        db,
        admin,
        &crate::events::NewEvent {
            name: "Noche Latina".into(),
            date: "2026-11-20".into(),
            description: String::new(),
            cover_image: None,
            cover_price: Decimal::from(150),
            paypal_price: paypal_price_cents.map(from_cents),
        },
    )
    .unwrap()
}
