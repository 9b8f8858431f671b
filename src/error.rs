//! Error taxonomy for Club POS.
//!
//! Every domain operation returns [`Result`]. Variants map one-to-one onto
//! the failure classes staff have to react to differently: bad input,
//! state conflicts, missing permissions, unknown ids, external dependency
//! failures and identifier collisions. State conflicts carry a [`Conflict`]
//! so a door scanner can tell "already used" apart from "cancelled".

use thiserror::Error;

/// Result type alias using [`PosError`].
pub type Result<T> = std::result::Result<T, PosError>;

/// State conflicts: the action is well-formed but invalid for the entity's
/// current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Conflict {
    #[error("Table already has an open account ({account_id})")]
    TableHasOpenAccount { account_id: String },

    #[error("Table still has open accounts")]
    TableInUse,

    #[error("Account is closed")]
    AccountClosed,

    #[error("Account is already closed")]
    AccountAlreadyClosed,

    #[error("Product is inactive")]
    ProductInactive,

    #[error("Order was rejected")]
    OrderRejected,

    #[error("Order is not rejected")]
    OrderNotRejected,

    #[error("Event is not active")]
    EventInactive,

    #[error("Event has no {channel} price configured")]
    EventNotSellable { channel: &'static str },

    #[error("Entry already used at {used_at}")]
    EntryAlreadyUsed { used_at: String },

    #[error("Entry is cancelled")]
    EntryCancelled,

    #[error("Entry has not been used")]
    EntryNotUsed,

    #[error("Username already taken: {0}")]
    UsernameTaken(String),

    #[error("Cannot delete the last active administrator")]
    LastAdmin,

    #[error("Cannot delete your own user")]
    SelfDelete,

    #[error("Purchase already failed")]
    PurchaseFailed,
}

impl Conflict {
    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TableHasOpenAccount { .. } => "TABLE_HAS_OPEN_ACCOUNT",
            Self::TableInUse => "TABLE_IN_USE",
            Self::AccountClosed => "ACCOUNT_CLOSED",
            Self::AccountAlreadyClosed => "ACCOUNT_ALREADY_CLOSED",
            Self::ProductInactive => "PRODUCT_INACTIVE",
            Self::OrderRejected => "ORDER_REJECTED",
            Self::OrderNotRejected => "ORDER_NOT_REJECTED",
            Self::EventInactive => "EVENT_INACTIVE",
            Self::EventNotSellable { .. } => "EVENT_NOT_SELLABLE",
            Self::EntryAlreadyUsed { .. } => "ENTRY_ALREADY_USED",
            Self::EntryCancelled => "ENTRY_CANCELLED",
            Self::EntryNotUsed => "ENTRY_NOT_USED",
            Self::UsernameTaken(_) => "USERNAME_TAKEN",
            Self::LastAdmin => "LAST_ADMIN",
            Self::SelfDelete => "SELF_DELETE",
            Self::PurchaseFailed => "PURCHASE_FAILED",
        }
    }
}

/// Core error type for Club POS operations.
#[derive(Debug, Error)]
pub enum PosError {
    /// Bad input; nothing was mutated.
    #[error("{0}")]
    Validation(String),

    /// Action invalid for the entity's current state.
    #[error(transparent)]
    Conflict(#[from] Conflict),

    /// The caller's role lacks permission.
    #[error("Not authorized: {0}")]
    Forbidden(String),

    /// Missing, expired or invalid credentials.
    #[error("{0}")]
    Unauthenticated(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Payment provider failure; the purchase was aborted.
    #[error("Payment failed: {0}")]
    Payment(String),

    /// Email or push delivery failed on an explicit send request.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Bounded retries on a generated identifier were exhausted.
    #[error("Identifier collision: {0}")]
    Collision(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PosError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::Conflict(c) => c.code(),
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Payment(_) => "PAYMENT_FAILED",
            Self::Delivery(_) => "DELIVERY_FAILED",
            Self::Collision(_) => "COLLISION",
            Self::Database(_) => "DATABASE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status used by the bridge.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Unauthenticated(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::Payment(_) | Self::Delivery(_) => 502,
            Self::Collision(_) | Self::Database(_) | Self::Internal(_) => 500,
        }
    }

    /// Returns the conflict kind if this is a state-conflict error.
    pub fn conflict(&self) -> Option<&Conflict> {
        match self {
            Self::Conflict(c) => Some(c),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for PosError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(format!("Invalid payload: {e}"))
    }
}
