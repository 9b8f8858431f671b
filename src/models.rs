//! Row types and status enums shared by the domain modules.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::money::from_cents;

/// Enum stored as a TEXT column.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw.trim() {
                    $(t if t.eq_ignore_ascii_case($text) => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                Self::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
            }
        }
    };
}

text_enum!(
    /// Staff role.
    Role {
        Admin => "ADMIN",
        Mesero => "MESERO",
        Cajero => "CAJERO",
    }
);

text_enum!(AccountStatus {
    Open => "OPEN",
    Closed => "CLOSED",
});

text_enum!(
    /// Who closed an account: a staff member or the stale-account sweep.
    ClosedBy {
        User => "USER",
        Sweep => "SWEEP",
    }
);

text_enum!(
    /// Order lifecycle. Exactly one state applies at a time.
    OrderState {
        Pending => "PENDING",
        Served => "SERVED",
        Rejected => "REJECTED",
    }
);

text_enum!(
    /// Ticket state machine: ACTIVE -> USED | CANCELLED.
    EntryStatus {
        Active => "ACTIVE",
        Used => "USED",
        Cancelled => "CANCELLED",
    }
);

text_enum!(
    /// Where an entry was sold.
    SaleChannel {
        Door => "DOOR",
        Online => "ONLINE",
    }
);

text_enum!(
    /// Online purchase lifecycle, mirroring the provider order.
    PurchaseStatus {
        Created => "CREATED",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
);

text_enum!(Platform {
    Web => "web",
    Android => "android",
});

text_enum!(
    /// Business events recorded in the append-only log.
    LogAction {
        UserLogin => "USER_LOGIN",
        UserCreated => "USER_CREATED",
        UserUpdated => "USER_UPDATED",
        UserDeleted => "USER_DELETED",
        TableCreated => "TABLE_CREATED",
        TableUpdated => "TABLE_UPDATED",
        TableDeleted => "TABLE_DELETED",
        ProductCreated => "PRODUCT_CREATED",
        ProductUpdated => "PRODUCT_UPDATED",
        ProductDeleted => "PRODUCT_DELETED",
        AccountOpened => "ACCOUNT_OPENED",
        AccountClosed => "ACCOUNT_CLOSED",
        AccountAutoClosed => "ACCOUNT_AUTO_CLOSED",
        BalanceAdded => "BALANCE_ADDED",
        OrderCreated => "ORDER_CREATED",
        OrderServed => "ORDER_SERVED",
        OrderUnserved => "ORDER_UNSERVED",
        OrderRejected => "ORDER_REJECTED",
        OrderUnrejected => "ORDER_UNREJECTED",
        EventCreated => "EVENT_CREATED",
        EventUpdated => "EVENT_UPDATED",
        EntryCreated => "ENTRY_CREATED",
        EntryPurchased => "ENTRY_PURCHASED",
        EntryUsed => "ENTRY_USED",
        EntryCancelled => "ENTRY_CANCELLED",
        EntryReverted => "ENTRY_REVERTED",
    }
);

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: Role,
    pub name: String,
    pub is_active: bool,
    pub created_at: String,
}

impl User {
    pub const COLUMNS: &'static str = "id, username, role, name, is_active, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            role: row.get(2)?,
            name: row.get(3)?,
            is_active: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiningTable {
    pub id: String,
    pub name: String,
    pub short_code: String,
    pub zone: Option<String>,
    pub qr_url: String,
    pub created_at: String,
}

impl DiningTable {
    pub const COLUMNS: &'static str = "id, name, short_code, zone, qr_url, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            short_code: row.get(2)?,
            zone: row.get(3)?,
            qr_url: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub table_id: Option<String>,
    pub table_label: String,
    pub opened_by_user_id: Option<String>,
    pub client_name: Option<String>,
    pub initial_balance: Decimal,
    pub current_balance: Decimal,
    pub status: AccountStatus,
    pub closed_by: Option<ClosedBy>,
    pub created_at: String,
    pub closed_at: Option<String>,
}

impl Account {
    pub const COLUMNS: &'static str = "id, table_id, table_label, opened_by_user_id, client_name,
        initial_balance_cents, current_balance_cents, status, closed_by, created_at, closed_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            table_id: row.get(1)?,
            table_label: row.get(2)?,
            opened_by_user_id: row.get(3)?,
            client_name: row.get(4)?,
            initial_balance: from_cents(row.get(5)?),
            current_balance: from_cents(row.get(6)?),
            status: row.get(7)?,
            closed_by: row.get(8)?,
            created_at: row.get(9)?,
            closed_at: row.get(10)?,
        })
    }

    pub fn is_open(&self) -> bool {
        self.status == AccountStatus::Open
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: Decimal,
    pub category: Option<String>,
    pub emoji: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Product {
    pub const COLUMNS: &'static str =
        "id, name, price_cents, category, emoji, is_active, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            price: from_cents(row.get(2)?),
            category: row.get(3)?,
            emoji: row.get(4)?,
            is_active: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

/// Order row joined with its product name.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub product_id: String,
    pub product_name: String,
    pub user_id: Option<String>,
    pub quantity: i64,
    /// Snapshot of unit price x quantity at creation time.
    pub price: Decimal,
    pub state: OrderState,
    pub created_at: String,
    pub served_at: Option<String>,
    pub rejected_at: Option<String>,
}

impl Order {
    /// Columns for `FROM orders o JOIN products p ON p.id = o.product_id`.
    pub const COLUMNS: &'static str = "o.id, o.account_id, o.product_id, p.name, o.user_id,
        o.quantity, o.price_cents, o.state, o.created_at, o.served_at, o.rejected_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            product_id: row.get(2)?,
            product_name: row.get(3)?,
            user_id: row.get(4)?,
            quantity: row.get(5)?,
            price: from_cents(row.get(6)?),
            state: row.get(7)?,
            created_at: row.get(8)?,
            served_at: row.get(9)?,
            rejected_at: row.get(10)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub table_id: Option<String>,
    pub action: LogAction,
    pub details: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub name: String,
    pub date: String,
    pub description: String,
    pub cover_image: Option<String>,
    pub cover_price: Decimal,
    /// USD price for online sales; `None` means not sellable online.
    pub paypal_price: Option<Decimal>,
    pub is_active: bool,
    pub created_at: String,
}

impl Event {
    pub const COLUMNS: &'static str = "id, name, date, description, cover_image,
        cover_price_cents, paypal_price_cents, is_active, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            date: row.get(2)?,
            description: row.get(3)?,
            cover_image: row.get(4)?,
            cover_price: from_cents(row.get(5)?),
            paypal_price: row.get::<_, Option<i64>>(6)?.map(from_cents),
            is_active: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    pub event_id: String,
    pub client_name: String,
    pub client_email: String,
    pub client_phone: Option<String>,
    pub number_of_entries: i64,
    pub total_price: Decimal,
    pub channel: SaleChannel,
    pub purchase_id: Option<String>,
    pub qr_token: String,
    pub status: EntryStatus,
    pub email_sent: bool,
    pub whatsapp_sent: bool,
    pub sold_by_user_id: Option<String>,
    pub used_at: Option<String>,
    pub created_at: String,
}

impl Entry {
    pub const COLUMNS: &'static str = "id, event_id, client_name, client_email, client_phone,
        number_of_entries, total_price_cents, channel, purchase_id, qr_token, status,
        email_sent, whatsapp_sent, sold_by_user_id, used_at, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_id: row.get(1)?,
            client_name: row.get(2)?,
            client_email: row.get(3)?,
            client_phone: row.get(4)?,
            number_of_entries: row.get(5)?,
            total_price: from_cents(row.get(6)?),
            channel: row.get(7)?,
            purchase_id: row.get(8)?,
            qr_token: row.get(9)?,
            status: row.get(10)?,
            email_sent: row.get(11)?,
            whatsapp_sent: row.get(12)?,
            sold_by_user_id: row.get(13)?,
            used_at: row.get(14)?,
            created_at: row.get(15)?,
        })
    }
}

/// Online purchase pinned at provider-order creation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketPurchase {
    pub paypal_order_id: String,
    pub event_id: String,
    pub quantity: i64,
    pub amount: Decimal,
    pub currency: String,
    pub status: PurchaseStatus,
    pub client_name: Option<String>,
    pub client_email: Option<String>,
    pub client_phone: Option<String>,
    pub created_at: String,
    /// Set once the provider confirmed the capture, even if issuing the
    /// entries afterwards failed.
    pub captured_at: Option<String>,
    pub completed_at: Option<String>,
}

impl TicketPurchase {
    pub const COLUMNS: &'static str = "paypal_order_id, event_id, quantity, amount_cents, currency,
        status, client_name, client_email, client_phone, created_at, completed_at, captured_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            paypal_order_id: row.get(0)?,
            event_id: row.get(1)?,
            quantity: row.get(2)?,
            amount: from_cents(row.get(3)?),
            currency: row.get(4)?,
            status: row.get(5)?,
            client_name: row.get(6)?,
            client_email: row.get(7)?,
            client_phone: row.get(8)?,
            created_at: row.get(9)?,
            captured_at: row.get(11)?,
            completed_at: row.get(10)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscription {
    pub id: String,
    pub user_id: String,
    pub endpoint: String,
    pub platform: Platform,
    pub p256dh: Option<String>,
    pub auth: Option<String>,
    pub created_at: String,
}

impl PushSubscription {
    pub const COLUMNS: &'static str = "id, user_id, endpoint, platform, p256dh, auth, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            endpoint: row.get(2)?,
            platform: row.get(3)?,
            p256dh: row.get(4)?,
            auth: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}
