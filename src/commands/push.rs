use serde::Deserialize;
use serde_json::{json, Value};

use super::{ok, Call};
use crate::error::Result;
use crate::models::Platform;
use crate::push::{self, NewSubscription};

pub fn subscribe(call: Call<'_>) -> Result<Value> {
    let new: NewSubscription = call.args()?;
    ok(push::subscribe(&call.state.db, &call.principal, &new)?)
}

#[derive(Deserialize)]
struct Unsubscribe {
    endpoint: String,
    platform: Platform,
}

pub fn unsubscribe(call: Call<'_>) -> Result<Value> {
    let request: Unsubscribe = call.args()?;
    let removed = push::unsubscribe(&call.state.db, &call.principal, &request.endpoint, request.platform)?;
    ok(json!({ "removed": removed }))
}

pub fn list(call: Call<'_>) -> Result<Value> {
    ok(push::list_subscriptions(&call.state.db, &call.principal)?)
}
