//! Password authentication, sessions and permissions.
//!
//! Staff log in with username + bcrypt password. Failed attempts are
//! tracked on the user row so a lockout survives restarts. Customers at a
//! table get a guest session by typing the table's short code. Sessions are
//! kept in memory; every operation receives the resolved [`Principal`]
//! explicitly and checks it against [`PERMISSIONS`] once at entry.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit;
use crate::db::{self, DbState};
use crate::error::{PosError, Result};
use crate::models::{DiningTable, LogAction, Role, User};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const MAX_FAILED_ATTEMPTS: i64 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const MIN_PASSWORD_LEN: usize = 6;

#[cfg(not(test))]
const BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const BCRYPT_COST: u32 = 4;

const INVALID_CREDENTIALS: &str = "Invalid username or password";

// ---------------------------------------------------------------------------
// Principals and permissions
// ---------------------------------------------------------------------------

/// The caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Staff {
        user_id: String,
        username: String,
        role: Role,
    },
    /// Customer self-service, scoped to one table.
    TableGuest { table_id: String },
    Anonymous,
}

impl Principal {
    pub fn staff(user_id: impl Into<String>, username: impl Into<String>, role: Role) -> Self {
        Self::Staff {
            user_id: user_id.into(),
            username: username.into(),
            role,
        }
    }

    /// Staff user id, if any.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Staff { user_id, .. } => Some(user_id),
            _ => None,
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Staff { role, .. } => Some(*role),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Staff { role, .. } => role.as_str().to_string(),
            Self::TableGuest { .. } => "table guest".into(),
            Self::Anonymous => "anonymous".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    OpenAccount,
    ViewAccount,
    CreateOrder,
    ServeOrder,
    RejectOrder,
    AddBalance,
    CloseAccount,
    ViewTables,
    ManageTables,
    ManageProducts,
    ManageUsers,
    ManageEvents,
    ViewReports,
    ViewLogs,
    RunSweep,
    RevertEntry,
    ViewCatalog,
    SellEntries,
    ValidateEntries,
    CancelEntry,
    ViewEntries,
    ResendTicketEmail,
    PurchaseEntries,
    ManageOwnPushSubscriptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    Role(Role),
    /// A guest session, limited to its own table.
    OwnTable,
    Anyone,
}

const ADMIN: Grant = Grant::Role(Role::Admin);
const CAJERO: Grant = Grant::Role(Role::Cajero);
const MESERO: Grant = Grant::Role(Role::Mesero);
const STAFF: &[Grant] = &[ADMIN, CAJERO, MESERO];
const ADMIN_ONLY: &[Grant] = &[ADMIN];
const CASHIER_DESK: &[Grant] = &[ADMIN, CAJERO];

/// Who may perform each action.
const PERMISSIONS: &[(Action, &[Grant])] = &[
    (Action::OpenAccount, &[ADMIN, CAJERO, MESERO, Grant::OwnTable]),
    (Action::ViewAccount, &[ADMIN, CAJERO, MESERO, Grant::OwnTable]),
    (Action::CreateOrder, &[ADMIN, MESERO, Grant::OwnTable]),
    (Action::ServeOrder, STAFF),
    (Action::RejectOrder, CASHIER_DESK),
    (Action::AddBalance, STAFF),
    (Action::CloseAccount, STAFF),
    (Action::ViewTables, STAFF),
    (Action::ManageTables, ADMIN_ONLY),
    (Action::ManageProducts, ADMIN_ONLY),
    (Action::ManageUsers, ADMIN_ONLY),
    (Action::ManageEvents, ADMIN_ONLY),
    (Action::ViewReports, ADMIN_ONLY),
    (Action::ViewLogs, ADMIN_ONLY),
    (Action::RunSweep, ADMIN_ONLY),
    (Action::RevertEntry, ADMIN_ONLY),
    (Action::ViewCatalog, &[Grant::Anyone]),
    (Action::SellEntries, CASHIER_DESK),
    (Action::ValidateEntries, CASHIER_DESK),
    (Action::CancelEntry, CASHIER_DESK),
    (Action::ViewEntries, CASHIER_DESK),
    (Action::ResendTicketEmail, CASHIER_DESK),
    (Action::PurchaseEntries, &[Grant::Anyone]),
    (Action::ManageOwnPushSubscriptions, STAFF),
];

fn grants(action: Action) -> &'static [Grant] {
    PERMISSIONS
        .iter()
        .find(|(a, _)| *a == action)
        .map(|(_, g)| *g)
        .unwrap_or(&[])
}

fn permitted(principal: &Principal, action: Action) -> bool {
    grants(action).iter().any(|grant| match (grant, principal) {
        (Grant::Anyone, _) => true,
        (Grant::Role(r), Principal::Staff { role, .. }) => r == role,
        (Grant::OwnTable, Principal::TableGuest { .. }) => true,
        _ => false,
    })
}

fn deny(principal: &Principal, action: Action) -> PosError {
    match principal {
        Principal::Anonymous => PosError::Unauthenticated("Login required".into()),
        _ => PosError::Forbidden(format!("{} cannot perform {action:?}", principal.describe())),
    }
}

/// Check `principal` may perform `action`.
///
/// Guest grants are table-scoped; operations that touch a table must use
/// [`authorize_table`] instead.
pub fn authorize(principal: &Principal, action: Action) -> Result<()> {
    if permitted(principal, action) {
        Ok(())
    } else {
        Err(deny(principal, action))
    }
}

/// Like [`authorize`], additionally restricting guests to their own table.
pub fn authorize_table(principal: &Principal, action: Action, table_id: Option<&str>) -> Result<()> {
    authorize(principal, action)?;
    match principal {
        Principal::TableGuest { table_id: own } if table_id != Some(own.as_str()) => {
            Err(PosError::Forbidden("Guests may only access their own table".into()))
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub inactivity: Duration,
    pub max_duration: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            inactivity: Duration::minutes(120),
            max_duration: Duration::hours(14),
        }
    }
}

#[derive(Clone)]
struct Session {
    principal: Principal,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Session {
    fn is_expired(&self, now: DateTime<Utc>, limits: &SessionLimits) -> bool {
        now >= self.expires_at || now - self.last_activity > limits.inactivity
    }
}

/// In-memory session registry.
pub struct AuthState {
    sessions: Mutex<HashMap<String, Session>>,
    limits: SessionLimits,
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new(SessionLimits::default())
    }
}

impl AuthState {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            limits,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn issue(&self, principal: Principal, now: DateTime<Utc>) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let session = Session {
            principal,
            last_activity: now,
            expires_at: now + self.limits.max_duration,
        };
        self.sessions().insert(token.clone(), session);
        token
    }

    /// Resolve a bearer token. No token means [`Principal::Anonymous`].
    pub fn session_principal(&self, token: Option<&str>) -> Result<Principal> {
        self.session_principal_at(token, Utc::now())
    }

    pub(crate) fn session_principal_at(
        &self,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Principal> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Ok(Principal::Anonymous);
        };
        let mut sessions = self.sessions();
        let expired = match sessions.get_mut(token) {
            None => return Err(PosError::Unauthenticated("Session not found".into())),
            Some(s) if s.is_expired(now, &self.limits) => true,
            Some(s) => {
                s.last_activity = now;
                return Ok(s.principal.clone());
            }
        };
        if expired {
            sessions.remove(token);
        }
        Err(PosError::Unauthenticated("Session expired".into()))
    }

    pub fn logout(&self, token: &str) -> bool {
        let removed = self.sessions().remove(token).is_some();
        if removed {
            info!("session logged out");
        }
        removed
    }

    /// Drop every session belonging to `user_id` (user deleted/disabled).
    pub fn revoke_user(&self, user_id: &str) -> usize {
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, s| s.principal.user_id() != Some(user_id));
        before - sessions.len()
    }

    /// Drop expired sessions.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now, &self.limits));
        before - sessions.len()
    }
}

// ---------------------------------------------------------------------------
// Passwords and lockout
// ---------------------------------------------------------------------------

pub fn hash_password(password: &str) -> Result<String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(PosError::validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    bcrypt::hash(password, BCRYPT_COST)
        .map_err(|e| PosError::Internal(format!("Failed to hash password: {e}")))
}

struct Credentials {
    user: User,
    password_hash: String,
    failed_attempts: i64,
    last_failed_at: Option<String>,
}

/// Minutes of lockout left, if the user is currently locked out.
fn lockout_remaining(failed_attempts: i64, last_failed_at: Option<&str>, now: DateTime<Utc>) -> Option<i64> {
    if failed_attempts < MAX_FAILED_ATTEMPTS {
        return None;
    }
    let last = db::parse_ts(last_failed_at?)?;
    let elapsed = now - last;
    if elapsed < Duration::minutes(LOCKOUT_MINUTES) {
        Some((LOCKOUT_MINUTES - elapsed.num_minutes()).max(1))
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginOutcome {
    pub token: String,
    pub user: User,
}

/// Verify credentials and open a staff session.
pub fn login(db: &DbState, auth: &AuthState, username: &str, password: &str) -> Result<LoginOutcome> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err(PosError::validation("Username and password are required"));
    }
    let now = Utc::now();

    let creds = {
        let conn = db.lock()?;
        conn.query_row(
            &format!(
                "SELECT {}, password_hash, failed_login_attempts, last_failed_login_at
                 FROM users WHERE username = ?1",
                User::COLUMNS
            ),
            [username],
            |row| {
                Ok(Credentials {
                    user: User::from_row(row)?,
                    password_hash: row.get(6)?,
                    failed_attempts: row.get(7)?,
                    last_failed_at: row.get(8)?,
                })
            },
        )
        .optional()?
    };
    let Some(creds) = creds else {
        warn!("login for unknown username");
        return Err(PosError::Unauthenticated(INVALID_CREDENTIALS.into()));
    };
    if !creds.user.is_active {
        return Err(PosError::Unauthenticated(INVALID_CREDENTIALS.into()));
    }
    if let Some(minutes) = lockout_remaining(creds.failed_attempts, creds.last_failed_at.as_deref(), now) {
        return Err(PosError::Unauthenticated(format!(
            "Too many failed attempts. Try again in {minutes} minute(s)."
        )));
    }

    // bcrypt runs without the connection lock held.
    let ok = bcrypt::verify(password, &creds.password_hash).unwrap_or(false);

    let conn = db.lock()?;
    if !ok {
        let restart = creds.failed_attempts >= MAX_FAILED_ATTEMPTS;
        conn.execute(
            "UPDATE users
             SET failed_login_attempts = CASE WHEN ?2 THEN 1 ELSE failed_login_attempts + 1 END,
                 last_failed_login_at = ?3
             WHERE id = ?1",
            params![creds.user.id, restart, db::ts(now)],
        )?;
        warn!(user_id = %creds.user.id, "failed login attempt");
        return Err(PosError::Unauthenticated(INVALID_CREDENTIALS.into()));
    }

    db::in_immediate_tx(&conn, |conn| {
        conn.execute(
            "UPDATE users SET failed_login_attempts = 0, last_failed_login_at = NULL WHERE id = ?1",
            [&creds.user.id],
        )?;
        audit::record(
            conn,
            Some(&creds.user.id),
            None,
            LogAction::UserLogin,
            json!({ "username": creds.user.username }),
        )
    })?;
    drop(conn);

    let principal = Principal::staff(&creds.user.id, &creds.user.username, creds.user.role);
    let token = auth.issue(principal, now);
    info!(user_id = %creds.user.id, role = %creds.user.role, "login successful");
    Ok(LoginOutcome {
        token,
        user: creds.user,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestSession {
    pub token: String,
    pub table: DiningTable,
}

/// Open a customer session for the table with `short_code`.
pub fn join_table(db: &DbState, auth: &AuthState, short_code: &str) -> Result<GuestSession> {
    let code = short_code.trim().to_ascii_uppercase();
    if code.is_empty() {
        return Err(PosError::validation("Table code is required"));
    }
    let table = {
        let conn = db.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM dining_tables WHERE short_code = ?1", DiningTable::COLUMNS),
            [&code],
            DiningTable::from_row,
        )
        .optional()?
    }
    .ok_or_else(|| PosError::not_found("Table", &code))?;

    let token = auth.issue(
        Principal::TableGuest {
            table_id: table.id.clone(),
        },
        Utc::now(),
    );
    info!(table_id = %table.id, "guest joined table");
    Ok(GuestSession { token, table })
}
