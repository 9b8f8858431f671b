//! Staff user management.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::audit;
use crate::auth::{self, Action, Principal};
use crate::db::{self, DbState};
use crate::error::{Conflict, PosError, Result};
use crate::models::{LogAction, Role, User};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub role: Role,
    pub name: String,
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdate {
    pub name: Option<String>,
    pub role: Option<Role>,
    pub password: Option<String>,
    pub is_active: Option<bool>,
}

fn validate_username(raw: &str) -> Result<String> {
    let username = raw.trim().to_lowercase();
    if username.len() < 3 || username.len() > 32 {
        return Err(PosError::validation("Username must be 3 to 32 characters"));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err(PosError::validation(
            "Username may only contain letters, digits, '.', '_' and '-'",
        ));
    }
    Ok(username)
}

fn required_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(PosError::validation("Name is required"));
    }
    Ok(name.to_string())
}

fn load(conn: &Connection, id: &str) -> Result<User> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE id = ?1", User::COLUMNS),
        [id],
        User::from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("User", id))
}

fn other_active_admins(conn: &Connection, excluding: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = 'ADMIN' AND is_active = 1 AND id != ?1",
        [excluding],
        |row| row.get(0),
    )?)
}

fn insert(conn: &Connection, username: &str, hash: &str, role: Role, name: &str) -> Result<User> {
    let id = db::new_id();
    conn.execute(
        "INSERT INTO users (id, username, password_hash, role, name, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, username, hash, role, name, db::now_ts()],
    )
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            PosError::from(Conflict::UsernameTaken(username.to_string()))
        } else {
            e.into()
        }
    })?;
    load(conn, &id)
}

pub fn create_user(db: &DbState, principal: &Principal, new: &NewUser) -> Result<User> {
    auth::authorize(principal, Action::ManageUsers)?;
    let username = validate_username(&new.username)?;
    let name = required_name(&new.name)?;
    let hash = auth::hash_password(&new.password)?;

    let conn = db.lock()?;
    let user = db::in_immediate_tx(&conn, |conn| {
        let user = insert(conn, &username, &hash, new.role, &name)?;
        audit::record(
            conn,
            principal.user_id(),
            None,
            LogAction::UserCreated,
            json!({ "userId": user.id, "username": user.username, "role": user.role }),
        )?;
        Ok(user)
    })?;
    info!(user_id = %user.id, role = %user.role, "User created");
    Ok(user)
}

pub fn list_users(db: &DbState, principal: &Principal) -> Result<Vec<User>> {
    auth::authorize(principal, Action::ManageUsers)?;
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users ORDER BY username",
        User::COLUMNS
    ))?;
    let rows = stmt.query_map([], User::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn update_user(db: &DbState, principal: &Principal, id: &str, update: &UserUpdate) -> Result<User> {
    auth::authorize(principal, Action::ManageUsers)?;
    let name = update.name.as_deref().map(required_name).transpose()?;
    let hash = update.password.as_deref().map(auth::hash_password).transpose()?;

    let conn = db.lock()?;
    let user = db::in_immediate_tx(&conn, |conn| {
        let current = load(conn, id)?;
        let loses_admin = current.role == Role::Admin
            && current.is_active
            && (update.role.is_some_and(|r| r != Role::Admin) || update.is_active == Some(false));
        if loses_admin && other_active_admins(conn, id)? == 0 {
            return Err(Conflict::LastAdmin.into());
        }

        conn.execute(
            "UPDATE users SET
                name = COALESCE(?2, name),
                role = COALESCE(?3, role),
                password_hash = COALESCE(?4, password_hash),
                is_active = COALESCE(?5, is_active),
                failed_login_attempts = CASE WHEN ?4 IS NULL THEN failed_login_attempts ELSE 0 END
             WHERE id = ?1",
            params![id, name, update.role, hash, update.is_active],
        )?;
        audit::record(
            conn,
            principal.user_id(),
            None,
            LogAction::UserUpdated,
            json!({
                "userId": id,
                "role": update.role,
                "isActive": update.is_active,
                "passwordChanged": hash.is_some(),
            }),
        )?;
        load(conn, id)
    })?;
    info!(user_id = %id, "User updated");
    Ok(user)
}

/// Delete a user. History rows keep their data; references become NULL.
pub fn delete_user(db: &DbState, principal: &Principal, id: &str) -> Result<()> {
    auth::authorize(principal, Action::ManageUsers)?;
    if principal.user_id() == Some(id) {
        return Err(Conflict::SelfDelete.into());
    }

    let conn = db.lock()?;
    db::in_immediate_tx(&conn, |conn| {
        let user = load(conn, id)?;
        if user.role == Role::Admin && user.is_active && other_active_admins(conn, id)? == 0 {
            return Err(Conflict::LastAdmin.into());
        }
        audit::record(
            conn,
            principal.user_id(),
            None,
            LogAction::UserDeleted,
            json!({ "userId": id, "username": user.username }),
        )?;
        conn.execute("DELETE FROM users WHERE id = ?1", [id])?;
        Ok(())
    })?;
    info!(user_id = %id, "User deleted");
    Ok(())
}

/// Create the first administrator when the users table is empty.
///
/// Returns `None` if any user already exists.
pub fn seed_admin(db: &DbState, username: &str, password: &str) -> Result<Option<User>> {
    let username = validate_username(username)?;
    let conn = db.lock()?;
    let existing: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
    if existing > 0 {
        return Ok(None);
    }
    let hash = auth::hash_password(password)?;
    let user = db::in_immediate_tx(&conn, |conn| {
        let user = insert(conn, &username, &hash, Role::Admin, "Administrator")?;
        audit::record(
            conn,
            None,
            None,
            LogAction::UserCreated,
            json!({ "userId": user.id, "username": user.username, "seeded": true }),
        )?;
        Ok(user)
    })?;
    info!(username = %user.username, "Seeded initial administrator");
    Ok(Some(user))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(username: &str, role: Role) -> NewUser {
        NewUser {
            username: username.into(),
            password: "secret123".into(),
            role,
            name: username.into(),
        }
    }

    fn seeded() -> (DbState, Principal) {
        let db = db::open_in_memory();
        let admin = seed_admin(&db, "admin", "admin123").unwrap().unwrap();
        let principal = Principal::staff(admin.id, admin.username, Role::Admin);
        (db, principal)
    }

    #[test]
    fn seed_admin_only_runs_on_empty_table() {
        let (db, _) = seeded();
        assert!(seed_admin(&db, "other", "admin123").unwrap().is_none());
    }

    #[test]
    fn create_and_list_users() {
        let (db, admin) = seeded();
        let user = create_user(&db, &admin, &new_user("Ana", Role::Mesero)).unwrap();
        assert_eq!(user.username, "ana");
        assert!(user.is_active);

        let users = list_users(&db, &admin).unwrap();
        assert_eq!(users.len(), 2);
    }

    #[test]
    fn duplicate_username_is_a_conflict() {
        let (db, admin) = seeded();
        create_user(&db, &admin, &new_user("ana", Role::Mesero)).unwrap();
        let err = create_user(&db, &admin, &new_user("ANA", Role::Cajero)).unwrap_err();
        assert_eq!(err.code(), "USERNAME_TAKEN");
    }

    #[test]
    fn only_admins_manage_users() {
        let (db, _) = seeded();
        let cashier = Principal::staff("x", "caja", Role::Cajero);
        let err = create_user(&db, &cashier, &new_user("ana", Role::Mesero)).unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[test]
    fn last_admin_cannot_be_removed_or_demoted() {
        let (db, admin) = seeded();
        let admin_id = admin.user_id().unwrap().to_string();
        let demote = UserUpdate {
            role: Some(Role::Cajero),
            ..Default::default()
        };
        assert_eq!(
            update_user(&db, &admin, &admin_id, &demote).unwrap_err().code(),
            "LAST_ADMIN"
        );

        let second = create_user(&db, &admin, &new_user("boss", Role::Admin)).unwrap();
        let other = Principal::staff(&second.id, "boss", Role::Admin);
        assert_eq!(
            delete_user(&db, &other, &second.id).unwrap_err().code(),
            "SELF_DELETE"
        );
        delete_user(&db, &other, &admin_id).unwrap();
        assert_eq!(
            update_user(
                &db,
                &other,
                &second.id,
                &UserUpdate {
                    is_active: Some(false),
                    ..Default::default()
                }
            )
            .unwrap_err()
            .code(),
            "LAST_ADMIN"
        );
    }

    #[test]
    fn deleting_user_keeps_history_rows() {
        let (db, admin) = seeded();
        let waiter = create_user(&db, &admin, &new_user("ana", Role::Mesero)).unwrap();
        {
            let conn = db.lock().unwrap();
            audit::record(&conn, Some(&waiter.id), None, LogAction::UserLogin, json!({})).unwrap();
        }
        delete_user(&db, &admin, &waiter.id).unwrap();

        let conn = db.lock().unwrap();
        let orphaned: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM logs WHERE action = 'USER_LOGIN' AND user_id IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphaned, 1);
    }

    #[test]
    fn password_change_allows_login_with_new_password() {
        let (db, admin) = seeded();
        let auth_state = auth::AuthState::default();
        let waiter = create_user(&db, &admin, &new_user("ana", Role::Mesero)).unwrap();
        update_user(
            &db,
            &admin,
            &waiter.id,
            &UserUpdate {
                password: Some("newpass99".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(auth::login(&db, &auth_state, "ana", "secret123").is_err());
        assert!(auth::login(&db, &auth_state, "ana", "newpass99").is_ok());
    }
}
