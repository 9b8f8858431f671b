//! Push notifications to staff devices.
//!
//! Subscriptions are keyed by endpoint. Browsers register a Web Push
//! endpoint URL; the Android app registers its FCM token, stored as
//! `fcm:<token>`. A delivery answered with "gone" deletes the
//! subscription, so the list heals itself as devices uninstall.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::auth::{self, Action, Principal};
use crate::db::{self, DbState};
use crate::error::{PosError, Result};
use crate::models::{Platform, PushSubscription};
use crate::orders::PushNotice;

pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
const FCM_PREFIX: &str = "fcm:";
const FCM_API_URL_TEMPLATE: &str = "https://fcm.googleapis.com/v1/projects/{project_id}/messages:send";
/// Seconds a push service keeps an undelivered message.
const WEB_PUSH_TTL: &str = "300";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    /// Web Push endpoint URL, or the FCM token for android.
    pub endpoint: String,
    pub platform: Platform,
    #[serde(default)]
    pub keys: Option<SubscriptionKeys>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
}

impl PushPayload {
    pub fn for_notice(notice: &PushNotice) -> Self {
        Self {
            title: format!("Nuevo pedido en {}", notice.table_label),
            body: format!("{}x {}", notice.quantity, notice.product_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The push service no longer knows this subscription.
    Gone,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyReport {
    pub delivered: usize,
    pub removed: usize,
    pub failed: usize,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(&self, subscription: &PushSubscription, payload: &PushPayload) -> DeliveryOutcome;
}

// ---------------------------------------------------------------------------
// Subscription store
// ---------------------------------------------------------------------------

fn owner(principal: &Principal) -> Result<&str> {
    auth::authorize(principal, Action::ManageOwnPushSubscriptions)?;
    principal
        .user_id()
        .ok_or_else(|| PosError::Forbidden("push subscriptions belong to staff users".into()))
}

fn normalize_endpoint(raw: &str, platform: Platform) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(PosError::validation("Subscription endpoint is required"));
    }
    match platform {
        Platform::Android => {
            let token = raw.strip_prefix(FCM_PREFIX).unwrap_or(raw);
            Ok(format!("{FCM_PREFIX}{token}"))
        }
        Platform::Web => {
            let url = reqwest::Url::parse(raw)
                .map_err(|_| PosError::validation(format!("Invalid push endpoint: {raw}")))?;
            if url.scheme() != "https" {
                return Err(PosError::validation("Push endpoint must use https"));
            }
            Ok(url.to_string())
        }
    }
}

fn load_by_endpoint(conn: &Connection, endpoint: &str) -> Result<PushSubscription> {
    Ok(conn.query_row(
        &format!(
            "SELECT {} FROM push_subscriptions WHERE endpoint = ?1",
            PushSubscription::COLUMNS
        ),
        [endpoint],
        PushSubscription::from_row,
    )?)
}

fn for_user(conn: &Connection, user_id: &str) -> Result<Vec<PushSubscription>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM push_subscriptions WHERE user_id = ?1 ORDER BY created_at",
        PushSubscription::COLUMNS
    ))?;
    let rows = stmt.query_map([user_id], PushSubscription::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Register the caller's device. Re-registering an endpoint moves it to the
/// caller and refreshes its keys.
pub fn subscribe(db: &DbState, principal: &Principal, new: &NewSubscription) -> Result<PushSubscription> {
    let user_id = owner(principal)?;
    let endpoint = normalize_endpoint(&new.endpoint, new.platform)?;
    let p256dh = new.keys.as_ref().map(|k| k.p256dh.as_str());
    let auth_key = new.keys.as_ref().map(|k| k.auth.as_str());

    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO push_subscriptions (id, user_id, endpoint, platform, p256dh, auth, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(endpoint) DO UPDATE SET
             user_id = excluded.user_id,
             platform = excluded.platform,
             p256dh = excluded.p256dh,
             auth = excluded.auth",
        params![db::new_id(), user_id, endpoint, new.platform, p256dh, auth_key, db::now_ts()],
    )?;
    let subscription = load_by_endpoint(&conn, &endpoint)?;
    info!(user_id, platform = %new.platform, "Push subscription registered");
    Ok(subscription)
}

/// Remove one of the caller's subscriptions. Returns whether it existed.
pub fn unsubscribe(db: &DbState, principal: &Principal, endpoint: &str, platform: Platform) -> Result<bool> {
    let user_id = owner(principal)?;
    let endpoint = normalize_endpoint(endpoint, platform)?;
    let conn = db.lock()?;
    let removed = conn.execute(
        "DELETE FROM push_subscriptions WHERE endpoint = ?1 AND user_id = ?2",
        params![endpoint, user_id],
    )?;
    Ok(removed > 0)
}

pub fn list_subscriptions(db: &DbState, principal: &Principal) -> Result<Vec<PushSubscription>> {
    let user_id = owner(principal)?;
    let conn = db.lock()?;
    for_user(&conn, user_id)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Fan a new-order notice out to every device of the waiter who opened the
/// account. Never touches the order itself.
pub async fn notify_account_opener(
    db: &DbState,
    transport: Option<&dyn PushTransport>,
    notice: &PushNotice,
) -> Result<NotifyReport> {
    let Some(transport) = transport else {
        debug!("Push not configured; notice dropped");
        return Ok(NotifyReport::default());
    };
    let subscriptions = {
        let conn = db.lock()?;
        for_user(&conn, &notice.user_id)?
    };
    let payload = PushPayload::for_notice(notice);
    let mut report = NotifyReport::default();
    let mut gone = Vec::new();

    for subscription in &subscriptions {
        let outcome = tokio::time::timeout(DELIVERY_TIMEOUT, transport.deliver(subscription, &payload))
            .await
            .unwrap_or_else(|_| DeliveryOutcome::Failed("timed out".into()));
        match outcome {
            DeliveryOutcome::Delivered => report.delivered += 1,
            DeliveryOutcome::Gone => gone.push(subscription.id.clone()),
            DeliveryOutcome::Failed(reason) => {
                report.failed += 1;
                warn!(subscription_id = %subscription.id, %reason, "Push delivery failed");
            }
        }
    }

    if !gone.is_empty() {
        let conn = db.lock()?;
        for id in &gone {
            report.removed += conn.execute("DELETE FROM push_subscriptions WHERE id = ?1", [id])?;
        }
        info!(user_id = %notice.user_id, removed = report.removed, "Removed expired push subscriptions");
    }
    Ok(report)
}

/// Fire-and-forget variant used after an order commits.
pub fn spawn_notify(db: Arc<DbState>, transport: Option<Arc<dyn PushTransport>>, notice: PushNotice) {
    let Some(transport) = transport else {
        return;
    };
    tokio::spawn(async move {
        if let Err(e) = notify_account_opener(&db, Some(transport.as_ref()), &notice).await {
            warn!(user_id = %notice.user_id, error = %e, "Push notification failed");
        }
    });
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

pub struct FcmSettings {
    pub project_id: String,
    pub access_token: Zeroizing<String>,
}

pub struct VapidSettings {
    /// PKCS#8 PEM of the P-256 signing key.
    pub private_key_pem: Zeroizing<String>,
    /// Uncompressed public key, base64url, as handed to browsers.
    pub public_key: String,
    /// `mailto:` or `https:` contact for push services.
    pub subject: String,
}

#[derive(Serialize)]
struct VapidClaims<'a> {
    aud: String,
    exp: i64,
    sub: &'a str,
}

/// Delivers to FCM (android) and Web Push services (browsers).
pub struct HttpPushTransport {
    http: Client,
    fcm: Option<(String, Zeroizing<String>)>,
    vapid: Option<(EncodingKey, VapidSettings)>,
}

fn vapid_audience(endpoint: &str) -> Result<String> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|_| PosError::validation(format!("Invalid push endpoint: {endpoint}")))?;
    Ok(url.origin().ascii_serialization())
}

fn fcm_body(token: &str, payload: &PushPayload) -> serde_json::Value {
    json!({
        "message": {
            "token": token,
            "notification": { "title": payload.title, "body": payload.body },
            "android": { "priority": "high" },
        }
    })
}

fn classify(status: StatusCode, body: &str) -> DeliveryOutcome {
    if status.is_success() {
        return DeliveryOutcome::Delivered;
    }
    if status == StatusCode::GONE || status == StatusCode::NOT_FOUND || body.contains("UNREGISTERED") {
        return DeliveryOutcome::Gone;
    }
    DeliveryOutcome::Failed(format!("HTTP {}", status.as_u16()))
}

impl HttpPushTransport {
    pub fn new(fcm: Option<FcmSettings>, vapid: Option<VapidSettings>) -> Result<Self> {
        let http = Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| PosError::Internal(format!("Failed to create HTTP client: {e}")))?;
        let vapid = vapid
            .map(|settings| {
                EncodingKey::from_ec_pem(settings.private_key_pem.as_bytes())
                    .map(|key| (key, settings))
                    .map_err(|e| PosError::validation(format!("Invalid VAPID private key: {e}")))
            })
            .transpose()?;
        let fcm = fcm.map(|settings| {
            (
                FCM_API_URL_TEMPLATE.replace("{project_id}", &settings.project_id),
                settings.access_token,
            )
        });
        info!(fcm = fcm.is_some(), web_push = vapid.is_some(), "Push transport configured");
        Ok(Self { http, fcm, vapid })
    }

    async fn send_fcm(&self, token: &str, payload: &PushPayload) -> DeliveryOutcome {
        let Some((api_url, access_token)) = &self.fcm else {
            return DeliveryOutcome::Failed("FCM not configured".into());
        };
        let resp = self
            .http
            .post(api_url)
            .bearer_auth(access_token.as_str())
            .json(&fcm_body(token, payload))
            .send()
            .await;
        match resp {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                classify(status, &body)
            }
            Err(e) => DeliveryOutcome::Failed(e.to_string()),
        }
    }

    /// Payload-less Web Push: the service worker fetches the details itself.
    async fn send_web(&self, endpoint: &str) -> DeliveryOutcome {
        let Some((key, settings)) = &self.vapid else {
            return DeliveryOutcome::Failed("Web Push not configured".into());
        };
        let aud = match vapid_audience(endpoint) {
            Ok(aud) => aud,
            Err(e) => return DeliveryOutcome::Failed(e.to_string()),
        };
        let claims = VapidClaims {
            aud,
            exp: (Utc::now() + chrono::Duration::hours(12)).timestamp(),
            sub: &settings.subject,
        };
        let jwt = match encode(&Header::new(Algorithm::ES256), &claims, key) {
            Ok(jwt) => jwt,
            Err(e) => return DeliveryOutcome::Failed(format!("VAPID signing failed: {e}")),
        };
        let resp = self
            .http
            .post(endpoint)
            .header("TTL", WEB_PUSH_TTL)
            .header("Urgency", "high")
            .header("Authorization", format!("vapid t={jwt}, k={}", settings.public_key))
            .header("Content-Length", "0")
            .send()
            .await;
        match resp {
            Ok(resp) => classify(resp.status(), ""),
            Err(e) => DeliveryOutcome::Failed(e.to_string()),
        }
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn deliver(&self, subscription: &PushSubscription, payload: &PushPayload) -> DeliveryOutcome {
        match subscription.platform {
            Platform::Android => {
                let token = subscription
                    .endpoint
                    .strip_prefix(FCM_PREFIX)
                    .unwrap_or(&subscription.endpoint);
                self.send_fcm(token, payload).await
            }
            Platform::Web => self.send_web(&subscription.endpoint).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::testutil;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers from a fixed table keyed by endpoint; unknown endpoints are
    /// delivered.
    #[derive(Default)]
    struct ScriptedTransport {
        outcomes: HashMap<String, DeliveryOutcome>,
        attempts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PushTransport for ScriptedTransport {
        async fn deliver(&self, subscription: &PushSubscription, _payload: &PushPayload) -> DeliveryOutcome {
            self.attempts.lock().unwrap().push(subscription.endpoint.clone());
            self.outcomes
                .get(&subscription.endpoint)
                .cloned()
                .unwrap_or(DeliveryOutcome::Delivered)
        }
    }

    const PHONE: &str = "https://push.example.com/send/phone";
    const TABLET: &str = "https://push.example.com/send/tablet";

    fn web(endpoint: &str) -> NewSubscription {
        NewSubscription {
            endpoint: endpoint.into(),
            platform: Platform::Web,
            keys: Some(SubscriptionKeys {
                p256dh: "BNc...".into(),
                auth: "tBH...".into(),
            }),
        }
    }

    fn notice_for(principal: &Principal) -> PushNotice {
        PushNotice {
            user_id: principal.user_id().unwrap().to_string(),
            table_label: "Mesa 4".into(),
            product_name: "Mojito".into(),
            quantity: 2,
        }
    }

    #[tokio::test]
    async fn gone_subscription_is_removed_and_skipped_next_time() {
        let db = db::open_in_memory();
        let waiter = testutil::staff(&db, "ana", Role::Mesero);
        subscribe(&db, &waiter, &web(PHONE)).unwrap();
        subscribe(&db, &waiter, &web(TABLET)).unwrap();

        let transport = ScriptedTransport {
            outcomes: HashMap::from([(TABLET.to_string(), DeliveryOutcome::Gone)]),
            ..Default::default()
        };
        let notice = notice_for(&waiter);

        let first = notify_account_opener(&db, Some(&transport), &notice).await.unwrap();
        assert_eq!(first, NotifyReport { delivered: 1, removed: 1, failed: 0 });
        assert_eq!(list_subscriptions(&db, &waiter).unwrap().len(), 1);

        transport.attempts.lock().unwrap().clear();
        let second = notify_account_opener(&db, Some(&transport), &notice).await.unwrap();
        assert_eq!(second.delivered, 1);
        assert_eq!(*transport.attempts.lock().unwrap(), vec![PHONE.to_string()]);
    }

    #[tokio::test]
    async fn other_failures_keep_subscription() {
        let db = db::open_in_memory();
        let waiter = testutil::staff(&db, "ana", Role::Mesero);
        subscribe(&db, &waiter, &web(PHONE)).unwrap();
        let transport = ScriptedTransport {
            outcomes: HashMap::from([(PHONE.to_string(), DeliveryOutcome::Failed("HTTP 500".into()))]),
            ..Default::default()
        };
        let report = notify_account_opener(&db, Some(&transport), &notice_for(&waiter))
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(list_subscriptions(&db, &waiter).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unconfigured_push_is_a_no_op() {
        let db = db::open_in_memory();
        let waiter = testutil::staff(&db, "ana", Role::Mesero);
        let report = notify_account_opener(&db, None, &notice_for(&waiter)).await.unwrap();
        assert_eq!(report, NotifyReport::default());
    }

    #[test]
    fn resubscribing_moves_endpoint_to_new_owner() {
        let db = db::open_in_memory();
        let ana = testutil::staff(&db, "ana", Role::Mesero);
        let luis = testutil::staff(&db, "luis", Role::Mesero);
        subscribe(&db, &ana, &web(PHONE)).unwrap();
        let moved = subscribe(&db, &luis, &web(PHONE)).unwrap();
        assert_eq!(Some(moved.user_id.as_str()), luis.user_id());
        assert!(list_subscriptions(&db, &ana).unwrap().is_empty());

        assert!(!unsubscribe(&db, &ana, PHONE, Platform::Web).unwrap());
        assert!(unsubscribe(&db, &luis, PHONE, Platform::Web).unwrap());
    }

    #[test]
    fn android_tokens_are_namespaced() {
        let db = db::open_in_memory();
        let ana = testutil::staff(&db, "ana", Role::Mesero);
        let sub = subscribe(
            &db,
            &ana,
            &NewSubscription {
                endpoint: "dGVzdC10b2tlbg".into(),
                platform: Platform::Android,
                keys: None,
            },
        )
        .unwrap();
        assert_eq!(sub.endpoint, "fcm:dGVzdC10b2tlbg");
        assert_eq!(sub.p256dh, None);
    }

    #[test]
    fn endpoint_validation_and_scope() {
        let db = db::open_in_memory();
        let ana = testutil::staff(&db, "ana", Role::Mesero);
        assert_eq!(
            subscribe(&db, &ana, &web("http://push.example.com/x")).unwrap_err().code(),
            "VALIDATION"
        );
        let guest = Principal::TableGuest { table_id: "t1".into() };
        assert_eq!(subscribe(&db, &guest, &web(PHONE)).unwrap_err().code(), "FORBIDDEN");
    }

    #[test]
    fn transport_helpers() {
        assert_eq!(
            vapid_audience("https://fcm.googleapis.com/fcm/send/abc").unwrap(),
            "https://fcm.googleapis.com"
        );
        assert_eq!(classify(StatusCode::CREATED, ""), DeliveryOutcome::Delivered);
        assert_eq!(classify(StatusCode::GONE, ""), DeliveryOutcome::Gone);
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, r#"{"error":{"details":[{"errorCode":"UNREGISTERED"}]}}"#),
            DeliveryOutcome::Gone
        );
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, ""),
            DeliveryOutcome::Failed(_)
        ));

        let payload = PushPayload {
            title: "Nuevo pedido en Mesa 4".into(),
            body: "2x Mojito".into(),
        };
        let body = fcm_body("tok", &payload);
        assert_eq!(body["message"]["token"], "tok");
        assert_eq!(body["message"]["notification"]["body"], "2x Mojito");
    }
}
