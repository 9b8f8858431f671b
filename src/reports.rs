//! Sales reporting over a date range.
//!
//! Read-only. Rejected orders count towards `rejected_orders` and nothing
//! else. Days and hours are local to the configured UTC offset.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::auth::{self, Action, Principal};
use crate::db::{self, DbState};
use crate::error::{PosError, Result};
use crate::models::OrderState;
use crate::money::from_cents;

const UNASSIGNED: &str = "unassigned";
const UNCATEGORIZED: &str = "Sin categoría";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRange {
    /// `YYYY-MM-DD` (local day, inclusive) or RFC 3339.
    pub from: String,
    /// `YYYY-MM-DD` (local day, inclusive) or RFC 3339 (exclusive).
    pub to: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DayTotal {
    pub day: String,
    pub sales: Decimal,
    pub orders: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaiterTotal {
    pub user_id: Option<String>,
    pub name: String,
    /// Accounts with at least one sale.
    pub tables: i64,
    pub sales: Decimal,
    pub orders: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductTotal {
    pub product_id: String,
    pub name: String,
    pub quantity: i64,
    pub sales: Decimal,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryTotal {
    pub category: String,
    pub quantity: i64,
    pub sales: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesReport {
    pub from: String,
    pub to: String,
    pub total_sales: Decimal,
    pub total_orders: i64,
    pub items_sold: i64,
    pub rejected_orders: i64,
    pub accounts_opened: i64,
    pub accounts_closed: i64,
    pub average_per_table: Decimal,
    pub by_day: Vec<DayTotal>,
    pub by_waiter: Vec<WaiterTotal>,
    pub by_product: Vec<ProductTotal>,
    pub by_category: Vec<CategoryTotal>,
    /// Non-rejected orders per local hour, index 0..24.
    pub by_hour: Vec<i64>,
}

struct OrderRow {
    price_cents: i64,
    quantity: i64,
    state: OrderState,
    created_at: String,
    account_id: String,
    product_id: String,
    product_name: String,
    category: Option<String>,
    waiter_id: Option<String>,
    waiter_name: Option<String>,
}

#[derive(Default)]
struct Tally {
    cents: i64,
    orders: i64,
    quantity: i64,
    accounts: HashSet<String>,
}

impl Tally {
    fn add(&mut self, row: &OrderRow) {
        self.cents += row.price_cents;
        self.orders += 1;
        self.quantity += row.quantity;
        self.accounts.insert(row.account_id.clone());
    }
}

/// Resolve one bound. Dates are local midnights; `end` moves a date to the
/// following midnight so the day is included.
fn resolve_bound(raw: &str, offset: FixedOffset, end: bool) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Some(at) = db::parse_ts(raw) {
        return Ok(at);
    }
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| PosError::validation(format!("Invalid report date: {raw}")))?;
    let day = if end { day + Duration::days(1) } else { day };
    let midnight = day
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(offset).single())
        .ok_or_else(|| PosError::validation(format!("Invalid report date: {raw}")))?;
    Ok(midnight.with_timezone(&Utc))
}

pub fn sales_report(
    db: &DbState,
    principal: &Principal,
    range: &ReportRange,
    offset: FixedOffset,
) -> Result<SalesReport> {
    auth::authorize(principal, Action::ViewReports)?;
    let from = resolve_bound(&range.from, offset, false)?;
    let to = resolve_bound(&range.to, offset, true)?;
    if to <= from {
        return Err(PosError::validation("Report range is empty"));
    }
    let (from_ts, to_ts) = (db::ts(from), db::ts(to));

    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT o.price_cents, o.quantity, o.state, o.created_at, o.account_id,
                p.id, p.name, p.category, a.opened_by_user_id, u.name
         FROM orders o
         JOIN products p ON p.id = o.product_id
         JOIN accounts a ON a.id = o.account_id
         LEFT JOIN users u ON u.id = a.opened_by_user_id
         WHERE o.created_at >= ?1 AND o.created_at < ?2",
    )?;
    let rows = stmt
        .query_map([&from_ts, &to_ts], |row| {
            Ok(OrderRow {
                price_cents: row.get(0)?,
                quantity: row.get(1)?,
                state: row.get(2)?,
                created_at: row.get(3)?,
                account_id: row.get(4)?,
                product_id: row.get(5)?,
                product_name: row.get(6)?,
                category: row.get(7)?,
                waiter_id: row.get(8)?,
                waiter_name: row.get(9)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let count_in_range = |column: &str| -> Result<i64> {
        Ok(conn.query_row(
            &format!("SELECT COUNT(*) FROM accounts WHERE {column} >= ?1 AND {column} < ?2"),
            [&from_ts, &to_ts],
            |row| row.get(0),
        )?)
    };
    let accounts_opened = count_in_range("created_at")?;
    let accounts_closed = count_in_range("closed_at")?;
    drop(stmt);
    drop(conn);

    let mut total = Tally::default();
    let mut rejected_orders = 0;
    let mut by_day: BTreeMap<String, Tally> = BTreeMap::new();
    let mut by_waiter: HashMap<Option<String>, (String, Tally)> = HashMap::new();
    let mut by_product: HashMap<String, (String, Tally)> = HashMap::new();
    let mut by_category: HashMap<String, Tally> = HashMap::new();
    let mut by_hour = vec![0i64; 24];

    for row in &rows {
        if row.state == OrderState::Rejected {
            rejected_orders += 1;
            continue;
        }
        let local = db::parse_ts(&row.created_at)
            .ok_or_else(|| PosError::Internal(format!("Bad order timestamp: {}", row.created_at)))?
            .with_timezone(&offset);
        total.add(row);
        by_day
            .entry(local.format("%Y-%m-%d").to_string())
            .or_default()
            .add(row);
        by_waiter
            .entry(row.waiter_id.clone())
            .or_insert_with(|| {
                let name = match &row.waiter_id {
                    Some(_) => row.waiter_name.clone().unwrap_or_default(),
                    None => UNASSIGNED.to_string(),
                };
                (name, Tally::default())
            })
            .1
            .add(row);
        by_product
            .entry(row.product_id.clone())
            .or_insert_with(|| (row.product_name.clone(), Tally::default()))
            .1
            .add(row);
        by_category
            .entry(row.category.clone().unwrap_or_else(|| UNCATEGORIZED.to_string()))
            .or_default()
            .add(row);
        by_hour[local.hour() as usize] += 1;
    }

    let average_per_table = match total.accounts.len() {
        0 => Decimal::ZERO,
        n => (from_cents(total.cents) / Decimal::from(n)).round_dp(2),
    };

    let by_day = by_day
        .into_iter()
        .map(|(day, t)| DayTotal {
            day,
            sales: from_cents(t.cents),
            orders: t.orders,
        })
        .collect();

    let mut by_waiter: Vec<WaiterTotal> = by_waiter
        .into_iter()
        .map(|(user_id, (name, t))| WaiterTotal {
            user_id,
            name,
            tables: t.accounts.len() as i64,
            sales: from_cents(t.cents),
            orders: t.orders,
        })
        .collect();
    by_waiter.sort_by(|a, b| b.sales.cmp(&a.sales).then_with(|| a.name.cmp(&b.name)));

    let mut by_product: Vec<ProductTotal> = by_product
        .into_iter()
        .map(|(product_id, (name, t))| ProductTotal {
            product_id,
            name,
            quantity: t.quantity,
            sales: from_cents(t.cents),
        })
        .collect();
    by_product.sort_by(|a, b| b.sales.cmp(&a.sales).then_with(|| a.name.cmp(&b.name)));

    let mut by_category: Vec<CategoryTotal> = by_category
        .into_iter()
        .map(|(category, t)| CategoryTotal {
            category,
            quantity: t.quantity,
            sales: from_cents(t.cents),
        })
        .collect();
    by_category.sort_by(|a, b| b.sales.cmp(&a.sales).then_with(|| a.category.cmp(&b.category)));

    Ok(SalesReport {
        from: from_ts,
        to: to_ts,
        total_sales: from_cents(total.cents),
        total_orders: total.orders,
        items_sold: total.quantity,
        rejected_orders,
        accounts_opened,
        accounts_closed,
        average_per_table,
        by_day,
        by_waiter,
        by_product,
        by_category,
        by_hour,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts;
    use crate::orders::{self, NewOrder};
    use crate::products::{self, NewProduct};
    use crate::testutil::{self, Fixture};

    fn everything() -> ReportRange {
        ReportRange {
            from: "2000-01-01".into(),
            to: "2100-12-31".into(),
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn rejected_orders_are_excluded_from_sales() {
        let fx = Fixture::new(500);
        let beer = fx.product("Cerveza", 5000);
        let nachos = products::create_product(
            &fx.db,
            &fx.admin,
            &NewProduct {
                name: "Nachos".into(),
                price: Decimal::from(80),
                category: None,
                emoji: None,
            },
        )
        .unwrap();
        fx.order(&beer.id, 2);
        let rejected = fx.order(&beer.id, 1);
        fx.order(&nachos.id, 1);
        orders::reject_order(&fx.db, &fx.cashier, &rejected.id).unwrap();

        let report = sales_report(&fx.db, &fx.admin, &everything(), utc()).unwrap();
        assert_eq!(report.total_sales, Decimal::from(180));
        assert_eq!(report.total_orders, 2);
        assert_eq!(report.items_sold, 3);
        assert_eq!(report.rejected_orders, 1);
        assert_eq!(report.accounts_opened, 1);
        assert_eq!(report.accounts_closed, 0);
        assert_eq!(report.average_per_table, Decimal::from(180));
        assert_eq!(report.by_hour.iter().sum::<i64>(), 2);

        assert_eq!(report.by_product[0].name, "Cerveza");
        assert_eq!(report.by_product[0].quantity, 2);
        assert_eq!(report.by_product[0].sales, Decimal::from(100));
        let categories: Vec<_> = report.by_category.iter().map(|c| c.category.as_str()).collect();
        assert_eq!(categories, vec!["Bebidas", UNCATEGORIZED]);

        assert_eq!(report.by_waiter.len(), 1);
        assert_eq!(report.by_waiter[0].name, "ana");
        assert_eq!(report.by_waiter[0].tables, 1);
    }

    #[test]
    fn guest_opened_accounts_are_unassigned() {
        let fx = Fixture::new(500);
        let beer = fx.product("Cerveza", 5000);
        fx.order(&beer.id, 1);

        let patio = testutil::table(&fx.db, &fx.admin, "Patio");
        let guest = Principal::TableGuest {
            table_id: patio.id.clone(),
        };
        let account = accounts::open_account_for_table(&fx.db, &guest, &patio.id).unwrap();
        accounts::add_balance(&fx.db, &fx.cashier, &account.id, Decimal::from(200)).unwrap();
        orders::create_order(
            &fx.db,
            &guest,
            &NewOrder {
                account_id: account.id.clone(),
                product_id: beer.id.clone(),
                quantity: 3,
            },
        )
        .unwrap();
        accounts::close_account(&fx.db, &fx.cashier, &account.id).unwrap();

        let report = sales_report(&fx.db, &fx.admin, &everything(), utc()).unwrap();
        assert_eq!(report.accounts_opened, 2);
        assert_eq!(report.accounts_closed, 1);
        assert_eq!(report.average_per_table, Decimal::from(100));
        let unassigned = report
            .by_waiter
            .iter()
            .find(|w| w.user_id.is_none())
            .unwrap();
        assert_eq!(unassigned.name, UNASSIGNED);
        assert_eq!(unassigned.sales, Decimal::from(150));
        assert_eq!(report.by_waiter[0].user_id, None);
    }

    #[test]
    fn local_days_and_hours_follow_offset() {
        let fx = Fixture::new(500);
        let beer = fx.product("Cerveza", 5000);
        let order = fx.order(&beer.id, 1);
        fx.db
            .lock()
            .unwrap()
            .execute(
                "UPDATE orders SET created_at = '2026-03-01T03:30:00.000Z' WHERE id = ?1",
                [&order.id],
            )
            .unwrap();

        let minus_five = FixedOffset::west_opt(5 * 3600).unwrap();
        let range = ReportRange {
            from: "2026-02-28".into(),
            to: "2026-02-28".into(),
        };
        let report = sales_report(&fx.db, &fx.admin, &range, minus_five).unwrap();
        assert_eq!(report.from, "2026-02-28T05:00:00.000Z");
        assert_eq!(report.to, "2026-03-01T05:00:00.000Z");
        assert_eq!(
            report.by_day,
            vec![DayTotal {
                day: "2026-02-28".into(),
                sales: Decimal::from(50),
                orders: 1
            }]
        );
        assert_eq!(report.by_hour[22], 1);

        let report = sales_report(&fx.db, &fx.admin, &range, utc()).unwrap();
        assert_eq!(report.total_orders, 0);
    }

    #[test]
    fn bad_ranges_and_permissions() {
        let fx = Fixture::new(0);
        let backwards = ReportRange {
            from: "2026-03-02".into(),
            to: "2026-03-01".into(),
        };
        assert_eq!(
            sales_report(&fx.db, &fx.admin, &backwards, utc()).unwrap_err().code(),
            "VALIDATION"
        );
        assert_eq!(
            sales_report(&fx.db, &fx.cashier, &everything(), utc()).unwrap_err().code(),
            "FORBIDDEN"
        );
    }
}
