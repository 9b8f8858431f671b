//! HTTP bridge for the command surface.
//!
//! `POST /api/{command}` with an optional JSON body and an optional
//! `Authorization: Bearer <token>` header. Failures come back as
//! `{"success": false, "code": ..., "error": ...}` with a matching status.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::commands;
use crate::db;
use crate::error::PosError;
use crate::state::AppState;

pub const BUILD_GIT_SHA: &str = env!("BUILD_GIT_SHA");
pub const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");

impl IntoResponse for PosError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(code = self.code(), error = %self, "Command failed");
        }
        let message = match &self {
            PosError::Database(_) | PosError::Internal(_) => "Internal error".to_string(),
            other => other.to_string(),
        };
        let body = json!({ "success": false, "code": self.code(), "error": message });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/{command}", post(run_command))
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn run_command(
    State(state): State<AppState>,
    Path(command): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, PosError> {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body)?
    };
    match commands::dispatch(&state, bearer_token(&headers), &command, payload).await {
        Ok(value) => Ok(Json(value)),
        Err(e) => {
            if e.http_status() < 500 {
                warn!(%command, code = e.code(), "Command rejected");
            }
            Err(e)
        }
    }
}

async fn health(State(state): State<AppState>) -> Result<Json<Value>, PosError> {
    let schema = {
        let conn = state.db.lock()?;
        db::schema_version(&conn)
    };
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "gitSha": BUILD_GIT_SHA,
        "builtAt": BUILD_TIMESTAMP,
        "schemaVersion": schema,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::StalePolicy;
    use crate::auth::AuthState;
    use crate::models::Role;
    use crate::testutil;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Router, AppState) {
        let state = AppState::new(
            Arc::new(db::open_in_memory()),
            Arc::new(AuthState::default()),
            StalePolicy::default(),
            testutil::BASE_URL,
        );
        (router(state.clone()), state)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn health_reports_schema_version() {
        let (app, _) = app();
        let (status, body) = send(app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["schemaVersion"], db::CURRENT_SCHEMA_VERSION);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn login_then_call_with_bearer_token() {
        let (app, state) = app();
        testutil::staff(&state.db, "admin", Role::Admin);

        let (status, body) = send(
            app.clone(),
            post_json("/api/auth_login", None, json!({ "username": "admin", "password": "secret123" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["data"]["token"].as_str().unwrap().to_string();

        let (status, body) = send(app.clone(), post_json("/api/tables_list", Some(&token), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let empty = Request::post("/api/tables_list")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app, empty).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn errors_carry_code_and_status() {
        let (app, _) = app();
        let (status, body) = send(app.clone(), post_json("/api/tables_list", None, json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "UNAUTHENTICATED");

        let (status, body) = send(
            app.clone(),
            post_json("/api/auth_login", None, json!({ "username": "ghost", "password": "nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid username or password");

        let bad = Request::post("/api/auth_login").body(Body::from("{not json")).unwrap();
        let (status, body) = send(app, bad).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION");
    }
}
