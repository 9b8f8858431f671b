//! Club POS backend.
//!
//! Table tabs with prepaid balances, order entry, event ticketing with door
//! validation, online ticket checkout, sales reports and push notices for
//! waiters. Every operation is reachable through [`commands::dispatch`],
//! which [`bridge`] exposes over HTTP.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub mod accounts;
pub mod audit;
pub mod auth;
pub mod bridge;
pub mod checkout;
pub mod codes;
pub mod commands;
pub mod config;
pub mod db;
pub mod entries;
pub mod error;
pub mod events;
pub mod mailer;
pub mod models;
pub mod money;
pub mod orders;
pub mod paypal;
pub mod products;
pub mod push;
pub mod qr;
pub mod reports;
pub mod state;
pub mod tables;
pub mod users;

#[cfg(test)]
mod testutil;

pub use error::{PosError, Result};

/// Console logging, plus daily rolling files when `log_dir` is set.
///
/// Keep the returned guard alive until exit; dropping it flushes the file
/// writer.
pub fn init_tracing(log_dir: Option<&Path>, json: bool) -> std::io::Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,club_pos=debug"));

    let console_layer = if json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "club-pos");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}
