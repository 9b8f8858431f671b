//! Table accounts ("tabs").
//!
//! An account is opened against a table, debited by orders, topped up by
//! staff and finally closed, either by a user or by the stale-account
//! sweep. Balance changes are single `UPDATE ... SET x = x ± ?` statements
//! inside `BEGIN IMMEDIATE` transactions, so concurrent orders on the same
//! tab never lose an update. Once CLOSED an account is read-only.

use chrono::{DateTime, Duration, FixedOffset, Offset, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::audit;
use crate::auth::{self, Action, Principal};
use crate::db::{self, DbState};
use crate::error::{Conflict, PosError, Result};
use crate::models::{Account, ClosedBy, LogAction, Order, OrderState};
use crate::money::{from_cents, to_cents};
use crate::orders;
use crate::tables;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    pub table_id: String,
    #[serde(default)]
    pub initial_balance: Decimal,
    #[serde(default)]
    pub client_name: Option<String>,
}

/// Account with its orders, newest first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetail {
    #[serde(flatten)]
    pub account: Account,
    /// Sum of non-rejected orders.
    pub consumed: Decimal,
    pub orders: Vec<Order>,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub(crate) fn load(conn: &Connection, id: &str) -> Result<Account> {
    conn.query_row(
        &format!("SELECT {} FROM accounts WHERE id = ?1", Account::COLUMNS),
        [id],
        Account::from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("Account", id))
}

fn open_for_table(conn: &Connection, table_id: &str) -> Result<Option<Account>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM accounts WHERE table_id = ?1 AND status = 'OPEN'
                 ORDER BY created_at LIMIT 1",
                Account::COLUMNS
            ),
            [table_id],
            Account::from_row,
        )
        .optional()?)
}

pub fn get_account(db: &DbState, principal: &Principal, id: &str) -> Result<AccountDetail> {
    auth::authorize(principal, Action::ViewAccount)?;
    let conn = db.lock()?;
    let account = load(&conn, id)?;
    auth::authorize_table(principal, Action::ViewAccount, account.table_id.as_deref())?;
    let orders = orders::for_account(&conn, id)?;
    let consumed = orders
        .iter()
        .filter(|o| o.state != OrderState::Rejected)
        .map(|o| o.price)
        .sum();
    Ok(AccountDetail {
        account,
        consumed,
        orders,
    })
}

/// Open accounts, oldest first. Guests only see their own table.
pub fn list_open_accounts(db: &DbState, principal: &Principal) -> Result<Vec<Account>> {
    auth::authorize(principal, Action::ViewAccount)?;
    let only_table = match principal {
        Principal::TableGuest { table_id } => Some(table_id.as_str()),
        _ => None,
    };
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM accounts WHERE status = 'OPEN' AND (?1 IS NULL OR table_id = ?1)
         ORDER BY created_at",
        Account::COLUMNS
    ))?;
    let rows = stmt.query_map([only_table], Account::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

fn insert_open(conn: &Connection, principal: &Principal, new: &NewAccount, cents: i64) -> Result<Account> {
    let table = tables::load(conn, &new.table_id)?;
    if let Some(existing) = open_for_table(conn, &table.id)? {
        return Err(Conflict::TableHasOpenAccount {
            account_id: existing.id,
        }
        .into());
    }
    let client_name = new
        .client_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let id = db::new_id();
    conn.execute(
        "INSERT INTO accounts (id, table_id, table_label, opened_by_user_id, client_name,
                               initial_balance_cents, current_balance_cents, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 'OPEN', ?7)",
        params![
            id,
            table.id,
            table.name,
            principal.user_id(),
            client_name,
            cents,
            db::now_ts()
        ],
    )?;
    audit::record(
        conn,
        principal.user_id(),
        Some(&table.id),
        LogAction::AccountOpened,
        json!({
            "accountId": id,
            "tableName": table.name,
            "initialBalance": from_cents(cents),
            "clientName": client_name,
        }),
    )?;
    load(conn, &id)
}

/// Open a tab on a table. Fails if the table already has an OPEN account.
pub fn open_account(db: &DbState, principal: &Principal, new: &NewAccount) -> Result<Account> {
    auth::authorize_table(principal, Action::OpenAccount, Some(&new.table_id))?;
    let cents = to_cents(new.initial_balance)?;
    if cents < 0 {
        return Err(PosError::validation("Initial balance cannot be negative"));
    }

    let conn = db.lock()?;
    let account = db::in_immediate_tx(&conn, |conn| insert_open(conn, principal, new, cents))?;
    info!(account_id = %account.id, table = %account.table_label, "Account opened");
    Ok(account)
}

/// The table's open account, opening an uncapped one (zero balance) if
/// there is none. Used by customer self-service.
pub fn open_account_for_table(db: &DbState, principal: &Principal, table_id: &str) -> Result<Account> {
    auth::authorize_table(principal, Action::OpenAccount, Some(table_id))?;
    let conn = db.lock()?;
    db::in_immediate_tx(&conn, |conn| {
        if let Some(existing) = open_for_table(conn, table_id)? {
            return Ok(existing);
        }
        let new = NewAccount {
            table_id: table_id.to_string(),
            initial_balance: Decimal::ZERO,
            client_name: None,
        };
        let account = insert_open(conn, principal, &new, 0)?;
        info!(account_id = %account.id, "Account opened for table");
        Ok(account)
    })
}

/// Top up an open account. Raises initial and current balance alike.
pub fn add_balance(db: &DbState, principal: &Principal, id: &str, amount: Decimal) -> Result<Account> {
    auth::authorize(principal, Action::AddBalance)?;
    let cents = to_cents(amount)?;
    if cents <= 0 {
        return Err(PosError::validation("Amount must be greater than zero"));
    }

    let conn = db.lock()?;
    let account = db::in_immediate_tx(&conn, |conn| {
        let changed = conn.execute(
            "UPDATE accounts
             SET initial_balance_cents = initial_balance_cents + ?2,
                 current_balance_cents = current_balance_cents + ?2
             WHERE id = ?1 AND status = 'OPEN'",
            params![id, cents],
        )?;
        if changed == 0 {
            load(conn, id)?;
            return Err(Conflict::AccountClosed.into());
        }
        let account = load(conn, id)?;
        audit::record(
            conn,
            principal.user_id(),
            account.table_id.as_deref(),
            LogAction::BalanceAdded,
            json!({
                "accountId": id,
                "amount": from_cents(cents),
                "newBalance": account.current_balance,
            }),
        )?;
        Ok(account)
    })?;
    info!(account_id = %id, amount = %from_cents(cents), "Balance added");
    Ok(account)
}

/// Close an account. Irreversible.
pub fn close_account(db: &DbState, principal: &Principal, id: &str) -> Result<Account> {
    auth::authorize(principal, Action::CloseAccount)?;
    let conn = db.lock()?;
    let account = db::in_immediate_tx(&conn, |conn| {
        let changed = conn.execute(
            "UPDATE accounts SET status = 'CLOSED', closed_by = ?2, closed_at = ?3
             WHERE id = ?1 AND status = 'OPEN'",
            params![id, ClosedBy::User, db::now_ts()],
        )?;
        if changed == 0 {
            load(conn, id)?;
            return Err(Conflict::AccountAlreadyClosed.into());
        }
        let account = load(conn, id)?;
        audit::record(
            conn,
            principal.user_id(),
            account.table_id.as_deref(),
            LogAction::AccountClosed,
            json!({
                "accountId": id,
                "tableName": account.table_label,
                "finalBalance": account.current_balance,
            }),
        )?;
        Ok(account)
    })?;
    info!(account_id = %id, "Account closed");
    Ok(account)
}

// ---------------------------------------------------------------------------
// Stale-account sweep
// ---------------------------------------------------------------------------

/// When an OPEN account counts as stale.
#[derive(Debug, Clone, Copy)]
pub struct StalePolicy {
    pub max_age: Duration,
    /// Local hour at which the business day ends; accounts opened before the
    /// most recent rollover are stale.
    pub rollover_hour: Option<u32>,
    pub utc_offset: FixedOffset,
}

impl Default for StalePolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::hours(12),
            rollover_hour: None,
            utc_offset: Utc.fix(),
        }
    }
}

impl StalePolicy {
    /// Most recent business-day rollover at or before `now`.
    fn last_rollover(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let hour = self.rollover_hour?;
        let local_now = now.with_timezone(&self.utc_offset);
        let naive = local_now.date_naive().and_hms_opt(hour, 0, 0)?;
        let today = self.utc_offset.from_local_datetime(&naive).single()?;
        let rollover = if today > local_now {
            today - Duration::days(1)
        } else {
            today
        };
        Some(rollover.with_timezone(&Utc))
    }

    /// Accounts created strictly before this instant are stale.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let by_age = now - self.max_age;
        match self.last_rollover(now) {
            Some(rollover) => by_age.max(rollover),
            None => by_age,
        }
    }
}

/// Close every stale OPEN account. Returns how many were closed.
///
/// Safe to run concurrently and repeatedly: each close is a compare-and-swap
/// on `status = 'OPEN'`, so an account is closed (and logged) exactly once.
pub fn close_stale_accounts(db: &DbState, policy: &StalePolicy, now: DateTime<Utc>) -> Result<usize> {
    let cutoff = db::ts(policy.cutoff(now));
    let closed_at = db::ts(now);
    let conn = db.lock()?;
    let closed = db::in_immediate_tx(&conn, |conn| {
        let stale: Vec<(String, Option<String>, String)> = {
            let mut stmt = conn.prepare(
                "SELECT id, table_id, created_at FROM accounts
                 WHERE status = 'OPEN' AND created_at < ?1",
            )?;
            let rows = stmt.query_map([&cutoff], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut closed = 0;
        for (id, table_id, created_at) in stale {
            let changed = conn.execute(
                "UPDATE accounts SET status = 'CLOSED', closed_by = ?2, closed_at = ?3
                 WHERE id = ?1 AND status = 'OPEN'",
                params![id, ClosedBy::Sweep, closed_at],
            )?;
            if changed == 1 {
                audit::record(
                    conn,
                    None,
                    table_id.as_deref(),
                    LogAction::AccountAutoClosed,
                    json!({ "accountId": id, "createdAt": created_at, "cutoff": cutoff }),
                )?;
                closed += 1;
            }
        }
        Ok(closed)
    })?;
    if closed > 0 {
        info!(closed, cutoff = %cutoff, "Closed stale accounts");
    }
    Ok(closed)
}

/// Admin-triggered sweep.
pub fn sweep_now(db: &DbState, principal: &Principal, policy: &StalePolicy) -> Result<usize> {
    auth::authorize(principal, Action::RunSweep)?;
    close_stale_accounts(db, policy, Utc::now())
}

/// Run the sweep every `every` until `cancel` fires. The first sweep runs
/// immediately.
pub fn start_stale_account_sweeper(
    db: Arc<DbState>,
    policy: StalePolicy,
    every: std::time::Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = every.as_secs(), "Stale account sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let db = Arc::clone(&db);
            let result =
                tokio::task::spawn_blocking(move || close_stale_accounts(&db, &policy, Utc::now())).await;
            match result {
                Ok(Ok(0)) => debug!("Sweep found no stale accounts"),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "Stale account sweep failed"),
                Err(e) => error!(error = %e, "Stale account sweep task panicked"),
            }
        }

        info!("Stale account sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountStatus, Role};
    use crate::testutil::{self, Fixture};

    fn backdate(db: &DbState, account_id: &str, at: DateTime<Utc>) {
        db.lock()
            .unwrap()
            .execute(
                "UPDATE accounts SET created_at = ?2 WHERE id = ?1",
                params![account_id, db::ts(at)],
            )
            .unwrap();
    }

    fn utc(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn second_open_on_same_table_conflicts() {
        let fx = Fixture::new(500);
        let err = open_account(
            &fx.db,
            &fx.waiter,
            &NewAccount {
                table_id: fx.table.id.clone(),
                initial_balance: Decimal::from(100),
                client_name: None,
            },
        )
        .unwrap_err();
        assert_eq!(
            err.conflict(),
            Some(&Conflict::TableHasOpenAccount {
                account_id: fx.account.id.clone()
            })
        );
        let count: i64 = fx
            .db
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn open_records_opener_and_label() {
        let fx = Fixture::new(500);
        assert_eq!(fx.account.opened_by_user_id.as_deref(), fx.waiter.user_id());
        assert_eq!(fx.account.table_label, fx.table.name);
        assert_eq!(fx.account.current_balance, Decimal::from(500));
        let conn = fx.db.lock().unwrap();
        assert_eq!(audit::count_action(&conn, LogAction::AccountOpened).unwrap(), 1);
    }

    #[test]
    fn guest_opens_own_table_only() {
        let fx = Fixture::new(0);
        let other = testutil::table(&fx.db, &fx.admin, "Mesa 2");
        let guest = Principal::TableGuest {
            table_id: other.id.clone(),
        };
        let account = open_account_for_table(&fx.db, &guest, &other.id).unwrap();
        assert_eq!(account.opened_by_user_id, None);
        assert_eq!(account.initial_balance, Decimal::ZERO);
        let again = open_account_for_table(&fx.db, &guest, &other.id).unwrap();
        assert_eq!(again.id, account.id);

        let err = open_account_for_table(&fx.db, &guest, &fx.table.id).unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
        let err = get_account(&fx.db, &guest, &fx.account.id).unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
        assert_eq!(list_open_accounts(&fx.db, &guest).unwrap().len(), 1);
    }

    #[test]
    fn top_up_raises_both_balances() {
        let fx = Fixture::new(500);
        let account = add_balance(&fx.db, &fx.waiter, &fx.account.id, Decimal::new(2550, 2)).unwrap();
        assert_eq!(account.initial_balance, Decimal::new(52550, 2));
        assert_eq!(account.current_balance, Decimal::new(52550, 2));

        assert_eq!(
            add_balance(&fx.db, &fx.waiter, &fx.account.id, Decimal::ZERO)
                .unwrap_err()
                .code(),
            "VALIDATION"
        );
    }

    #[test]
    fn closed_account_rejects_mutations() {
        let fx = Fixture::new(500);
        close_account(&fx.db, &fx.waiter, &fx.account.id).unwrap();

        let err = close_account(&fx.db, &fx.waiter, &fx.account.id).unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::AccountAlreadyClosed));
        let err = add_balance(&fx.db, &fx.waiter, &fx.account.id, Decimal::ONE).unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::AccountClosed));
        let err = close_account(&fx.db, &fx.waiter, "missing").unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        let detail = get_account(&fx.db, &fx.waiter, &fx.account.id).unwrap();
        assert_eq!(detail.account.status, AccountStatus::Closed);
        assert_eq!(detail.account.closed_by, Some(ClosedBy::User));
    }

    #[test]
    fn cutoff_uses_later_of_age_and_rollover() {
        let now = utc("2026-03-07T12:00:00Z");
        let policy = StalePolicy::default();
        assert_eq!(policy.cutoff(now), utc("2026-03-07T00:00:00Z"));

        // 06:00 local at UTC-5 is 11:00Z, later than the 12h age cutoff.
        let policy = StalePolicy {
            rollover_hour: Some(6),
            utc_offset: FixedOffset::west_opt(5 * 3600).unwrap(),
            ..StalePolicy::default()
        };
        assert_eq!(policy.cutoff(now), utc("2026-03-07T11:00:00Z"));

        // Before today's rollover, the previous day's applies.
        let early = utc("2026-03-07T10:00:00Z");
        assert_eq!(policy.last_rollover(early), Some(utc("2026-03-06T11:00:00Z")));
    }

    #[test]
    fn sweep_is_idempotent() {
        let fx = Fixture::new(500);
        let fresh_table = testutil::table(&fx.db, &fx.admin, "Mesa 2");
        let fresh = testutil::open_account(&fx.db, &fx.waiter, &fresh_table.id, 0);
        let now = Utc::now();
        backdate(&fx.db, &fx.account.id, now - Duration::hours(13));

        let policy = StalePolicy::default();
        assert_eq!(close_stale_accounts(&fx.db, &policy, now).unwrap(), 1);
        assert_eq!(close_stale_accounts(&fx.db, &policy, now).unwrap(), 0);

        let conn = fx.db.lock().unwrap();
        let stale = load(&conn, &fx.account.id).unwrap();
        assert_eq!(stale.status, AccountStatus::Closed);
        assert_eq!(stale.closed_by, Some(ClosedBy::Sweep));
        assert!(load(&conn, &fresh.id).unwrap().is_open());
        assert_eq!(audit::count_action(&conn, LogAction::AccountAutoClosed).unwrap(), 1);
    }

    #[test]
    fn concurrent_sweeps_close_each_account_once() {
        let dir = tempfile::tempdir().unwrap();
        let main = Arc::new(db::init(dir.path()).unwrap());
        let admin = testutil::staff(&main, "admin", Role::Admin);
        let now = Utc::now();
        for i in 0..5 {
            let table = testutil::table(&main, &admin, &format!("Mesa {i}"));
            let account = testutil::open_account(&main, &admin, &table.id, 0);
            backdate(&main, &account.id, now - Duration::hours(20));
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let worker = db::open_worker(&main).unwrap();
                std::thread::spawn(move || {
                    close_stale_accounts(&worker, &StalePolicy::default(), now).unwrap()
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 5);

        let conn = main.lock().unwrap();
        assert_eq!(audit::count_action(&conn, LogAction::AccountAutoClosed).unwrap(), 5);
    }

    #[test]
    fn sweep_command_is_admin_only() {
        let fx = Fixture::new(0);
        let policy = StalePolicy::default();
        assert_eq!(sweep_now(&fx.db, &fx.waiter, &policy).unwrap_err().code(), "FORBIDDEN");
        assert_eq!(sweep_now(&fx.db, &fx.admin, &policy).unwrap(), 0);
    }

    #[tokio::test]
    async fn sweeper_task_closes_and_stops() {
        let fx = Fixture::new(500);
        backdate(&fx.db, &fx.account.id, Utc::now() - Duration::hours(30));
        let db = Arc::new(fx.db);
        let cancel = CancellationToken::new();
        let handle = start_stale_account_sweeper(
            Arc::clone(&db),
            StalePolicy::default(),
            std::time::Duration::from_millis(20),
            cancel.clone(),
        );

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        cancel.cancel();
        handle.await.unwrap();

        let conn = db.lock().unwrap();
        assert!(!load(&conn, &fx.account.id).unwrap().is_open());
    }
}
