use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{ok, Call};
use crate::auth;
use crate::error::{PosError, Result};
use crate::users::{self, NewUser, UserUpdate};

#[derive(Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

/// Password check runs on the blocking pool; bcrypt is slow on purpose.
pub async fn login(call: Call<'_>) -> Result<Value> {
    let creds: Credentials = call.args()?;
    let db = call.state.db.clone();
    let sessions = call.state.auth.clone();
    let outcome = tokio::task::spawn_blocking(move || auth::login(&db, &sessions, &creds.username, &creds.password))
        .await
        .map_err(|e| PosError::Internal(format!("login task failed: {e}")))??;
    ok(outcome)
}

pub fn logout(call: Call<'_>) -> Result<Value> {
    let ended = call.token.is_some_and(|token| call.state.auth.logout(token));
    ok(json!({ "loggedOut": ended }))
}

pub fn session(call: Call<'_>) -> Result<Value> {
    let data = match &call.principal {
        auth::Principal::Staff {
            user_id,
            username,
            role,
        } => json!({ "kind": "staff", "userId": user_id, "username": username, "role": role }),
        auth::Principal::TableGuest { table_id } => json!({ "kind": "table", "tableId": table_id }),
        auth::Principal::Anonymous => json!({ "kind": "anonymous" }),
    };
    ok(data)
}

pub fn join_table(call: Call<'_>) -> Result<Value> {
    let code = call.str_arg(&["shortCode", "code"])?;
    ok(auth::join_table(&call.state.db, &call.state.auth, &code)?)
}

pub fn list_users(call: Call<'_>) -> Result<Value> {
    ok(users::list_users(&call.state.db, &call.principal)?)
}

pub fn create_user(call: Call<'_>) -> Result<Value> {
    let new: NewUser = call.args()?;
    ok(users::create_user(&call.state.db, &call.principal, &new)?)
}

pub fn update_user(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    let update: UserUpdate = call.args()?;
    let user = users::update_user(&call.state.db, &call.principal, &id, &update)?;
    if !user.is_active || update.password.is_some() || update.role.is_some() {
        let revoked = call.state.auth.revoke_user(&id);
        if revoked > 0 {
            info!(user_id = %id, revoked, "Sessions revoked after user change");
        }
    }
    ok(user)
}

pub fn delete_user(call: Call<'_>) -> Result<Value> {
    let id = call.id()?;
    users::delete_user(&call.state.db, &call.principal, &id)?;
    call.state.auth.revoke_user(&id);
    ok(json!({ "deleted": id }))
}
