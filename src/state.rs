//! Shared state handed to every command.

use chrono::FixedOffset;
use std::sync::Arc;

use crate::accounts::StalePolicy;
use crate::auth::AuthState;
use crate::db::DbState;
use crate::mailer::EmailSender;
use crate::paypal::PaymentProvider;
use crate::push::PushTransport;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbState>,
    pub auth: Arc<AuthState>,
    pub stale_policy: StalePolicy,
    pub base_url: String,
    pub currency: String,
    pub payments: Option<Arc<dyn PaymentProvider>>,
    pub mailer: Option<Arc<dyn EmailSender>>,
    pub push: Option<Arc<dyn PushTransport>>,
}

impl AppState {
    /// State with every optional integration switched off.
    pub fn new(db: Arc<DbState>, auth: Arc<AuthState>, stale_policy: StalePolicy, base_url: impl Into<String>) -> Self {
        Self {
            db,
            auth,
            stale_policy,
            base_url: base_url.into(),
            currency: crate::checkout::DEFAULT_CURRENCY.to_string(),
            payments: None,
            mailer: None,
            push: None,
        }
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.stale_policy.utc_offset
    }

    pub fn with_payments(mut self, provider: Arc<dyn PaymentProvider>, currency: impl Into<String>) -> Self {
        self.payments = Some(provider);
        self.currency = currency.into();
        self
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn EmailSender>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn with_push(mut self, transport: Arc<dyn PushTransport>) -> Self {
        self.push = Some(transport);
        self
    }
}
