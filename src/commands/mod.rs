//! JSON command surface.
//!
//! Every command takes the caller's session token and a JSON payload and
//! returns `{"success": true, "data": ...}`. Payload parsing lives here;
//! business rules live in the domain modules.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::auth::Principal;
use crate::error::{PosError, Result};
use crate::state::AppState;

pub mod accounts;
pub mod auth;
pub mod catalog;
pub mod push;
pub mod reports;
pub mod tickets;

/// One resolved command invocation.
pub struct Call<'a> {
    pub state: &'a AppState,
    pub principal: Principal,
    pub token: Option<&'a str>,
    pub payload: Value,
}

impl Call<'_> {
    /// Deserialize the whole payload. A missing payload reads as `{}`.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = match &self.payload {
            Value::Null => json!({}),
            other => other.clone(),
        };
        Ok(serde_json::from_value(payload)?)
    }

    /// A string argument under the first matching key, or the payload itself
    /// when it is a bare string.
    pub fn str_arg(&self, keys: &[&str]) -> Result<String> {
        let found = match &self.payload {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => keys
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str)),
            _ => None,
        };
        found
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| PosError::validation(format!("Missing {}", keys[0])))
    }

    pub fn id(&self) -> Result<String> {
        self.str_arg(&["id"])
    }

    pub fn bool_arg(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }
}

pub fn ok(data: impl Serialize) -> Result<Value> {
    Ok(json!({ "success": true, "data": serde_json::to_value(data)? }))
}

/// A command that only touches the database and runs to completion.
type Handler = fn(Call<'_>) -> Result<Value>;

/// Run `handler` on the blocking pool. Every database call waits on the
/// shared connection lock and SQLite's busy timeout, which must not stall
/// the async workers.
async fn run_blocking(call: Call<'_>, handler: Handler) -> Result<Value> {
    let state = call.state.clone();
    let token = call.token.map(str::to_string);
    let principal = call.principal;
    let payload = call.payload;
    tokio::task::spawn_blocking(move || {
        handler(Call {
            state: &state,
            principal,
            token: token.as_deref(),
            payload,
        })
    })
    .await
    .map_err(|e| PosError::Internal(format!("command task failed: {e}")))?
}

/// Resolve the session and route `command` to its handler.
pub async fn dispatch(state: &AppState, token: Option<&str>, command: &str, payload: Value) -> Result<Value> {
    let principal = state.auth.session_principal(token)?;
    debug!(command, principal = ?principal.role(), "Dispatching command");
    let call = Call {
        state,
        principal,
        token,
        payload,
    };

    let handler: Handler = match command {
        "auth_login" => return auth::login(call).await,
        "entries_resend_email" => return tickets::resend_email(call).await,
        "checkout_start" => return tickets::checkout_start(call).await,
        "checkout_complete" => return tickets::checkout_complete(call).await,

        "auth_logout" => auth::logout,
        "auth_session" => auth::session,
        "auth_join_table" => auth::join_table,
        "users_list" => auth::list_users,
        "users_create" => auth::create_user,
        "users_update" => auth::update_user,
        "users_delete" => auth::delete_user,

        "tables_list" => catalog::list_tables,
        "tables_create" => catalog::create_table,
        "tables_update" => catalog::update_table,
        "tables_delete" => catalog::delete_table,
        "tables_by_code" => catalog::table_by_code,
        "tables_qr" => catalog::table_qr,
        "products_list" => catalog::list_products,
        "products_categories" => catalog::list_categories,
        "products_create" => catalog::create_product,
        "products_update" => catalog::update_product,
        "products_set_active" => catalog::set_product_active,
        "products_delete" => catalog::delete_product,

        "accounts_open" => accounts::open,
        "accounts_open_for_table" => accounts::open_for_table,
        "accounts_get" => accounts::get,
        "accounts_list_open" => accounts::list_open,
        "accounts_add_balance" => accounts::add_balance,
        "accounts_close" => accounts::close,
        "accounts_sweep" => accounts::sweep,
        "orders_create" => accounts::create_order,
        "orders_list" => accounts::list_orders,
        "orders_set_served" => accounts::set_served,
        "orders_reject" => accounts::reject_order,
        "orders_unreject" => accounts::unreject_order,

        "events_list" => tickets::list_events,
        "events_get" => tickets::get_event,
        "events_create" => tickets::create_event,
        "events_update" => tickets::update_event,
        "events_set_active" => tickets::set_event_active,
        "entries_sell" => tickets::sell,
        "entries_sell_bulk" => tickets::sell_bulk,
        "entries_lookup" => tickets::lookup,
        "entries_mark_used" => tickets::mark_used,
        "entries_admit" => tickets::admit,
        "entries_cancel" => tickets::cancel,
        "entries_revert" => tickets::revert,
        "entries_list" => tickets::list_entries,
        "entries_stats" => tickets::stats,
        "entries_qr" => tickets::qr,
        "entries_whatsapp_link" => tickets::whatsapp_link,
        "entries_whatsapp_sent" => tickets::whatsapp_sent,

        "push_subscribe" => push::subscribe,
        "push_unsubscribe" => push::unsubscribe,
        "push_list" => push::list,

        "reports_sales" => reports::sales,
        "logs_list" => reports::logs,

        other => return Err(PosError::not_found("Command", other)),
    };
    run_blocking(call, handler).await
}
