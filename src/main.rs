use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use club_pos::accounts;
use club_pos::auth::AuthState;
use club_pos::bridge;
use club_pos::config::Config;
use club_pos::db;
use club_pos::mailer::SmtpMailer;
use club_pos::paypal::PayPalClient;
use club_pos::push::HttpPushTransport;
use club_pos::state::AppState;
use club_pos::users;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let _log_guard = club_pos::init_tracing(config.log_dir.as_deref(), config.log_json)
        .context("failed to set up logging")?;
    info!("Starting Club POS v{}", env!("CARGO_PKG_VERSION"));

    let db = Arc::new(db::init(&config.data_dir).context("failed to open database")?);
    if let Some(password) = &config.admin_password {
        if let Some(admin) = users::seed_admin(&db, &config.admin_username, password)? {
            info!(username = %admin.username, "Seeded first administrator");
        }
    }

    let auth = Arc::new(AuthState::new(config.session_limits()));
    let mut state = AppState::new(db.clone(), auth.clone(), config.stale_policy(), config.base_url());

    match config.paypal_credentials() {
        Some((client_id, secret)) => {
            let client = PayPalClient::new(config.paypal_mode, client_id, secret)?;
            state = state.with_payments(Arc::new(client), config.paypal_currency.clone());
            info!(mode = ?config.paypal_mode, "PayPal checkout enabled");
        }
        None => warn!("PayPal not configured; online ticket sales disabled"),
    }

    match config.smtp_settings() {
        Some(settings) => {
            state = state.with_mailer(Arc::new(SmtpMailer::new(&settings)?));
            info!(host = %settings.host, "Ticket email enabled");
        }
        None => warn!("SMTP not configured; ticket emails disabled"),
    }

    let vapid = config.vapid_settings().context("failed to read VAPID key")?;
    let fcm = config.fcm_settings();
    if vapid.is_some() || fcm.is_some() {
        state = state.with_push(Arc::new(HttpPushTransport::new(fcm, vapid)?));
        info!("Push notifications enabled");
    }

    let shutdown = CancellationToken::new();
    let sweeper_db = Arc::new(db::open_worker(&db).context("failed to open sweeper connection")?);
    let sweeper = accounts::start_stale_account_sweeper(
        sweeper_db,
        config.stale_policy(),
        config.sweep_interval(),
        shutdown.clone(),
    );
    let session_janitor = {
        let auth = auth.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = auth.purge_expired();
                        if purged > 0 {
                            info!(purged, "Expired sessions purged");
                        }
                    }
                }
            }
        })
    };

    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    info!(addr = %config.addr, "HTTP bridge listening");

    axum::serve(listener, bridge::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = tokio::join!(sweeper, session_janitor);
    info!("Club POS stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
