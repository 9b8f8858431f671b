//! Runtime configuration. Flags win over environment variables, which win
//! over defaults. Optional integrations stay `None` when their settings are
//! missing.

use chrono::{Duration, FixedOffset};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use zeroize::Zeroizing;

use crate::accounts::StalePolicy;
use crate::auth::SessionLimits;
use crate::mailer::SmtpSettings;
use crate::paypal::PayPalMode;
use crate::push::{FcmSettings, VapidSettings};

#[derive(Parser, Clone)]
#[command(name = "club-pos", version, about = "Club POS backend: tabs, orders and event ticketing")]
pub struct Config {
    /// Address the HTTP bridge listens on.
    #[arg(long, env = "CLUB_POS_ADDR", default_value = "127.0.0.1:8080")]
    pub addr: SocketAddr,

    /// Directory holding the SQLite database.
    #[arg(long, env = "CLUB_POS_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Write daily rolling log files here as well as to the console.
    #[arg(long, env = "CLUB_POS_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Output logs as JSON.
    #[arg(long, env = "CLUB_POS_LOG_JSON")]
    pub log_json: bool,

    /// Public URL customers reach; table QR codes point below it.
    #[arg(long, env = "CLUB_POS_PUBLIC_URL", default_value = "http://localhost:8080")]
    pub public_url: String,

    // -- Accounts ------------------------------------------------------------
    /// Minutes between stale-account sweeps.
    #[arg(long, env = "CLUB_POS_SWEEP_MINUTES", default_value_t = 15)]
    pub sweep_minutes: u64,

    /// Hours after which an open account is stale.
    #[arg(long, env = "CLUB_POS_STALE_ACCOUNT_HOURS", default_value_t = 12)]
    pub stale_account_hours: i64,

    /// Local hour (0-23) at which the business day ends.
    #[arg(long, env = "CLUB_POS_ROLLOVER_HOUR", value_parser = clap::value_parser!(u32).range(0..24))]
    pub rollover_hour: Option<u32>,

    /// Local UTC offset for business days and reports, e.g. `-05:00`.
    #[arg(long, env = "CLUB_POS_UTC_OFFSET", default_value = "+00:00", value_parser = parse_offset, allow_hyphen_values = true)]
    pub utc_offset: FixedOffset,

    // -- Sessions ------------------------------------------------------------
    #[arg(long, env = "CLUB_POS_SESSION_IDLE_MINUTES", default_value_t = 120)]
    pub session_idle_minutes: i64,

    #[arg(long, env = "CLUB_POS_SESSION_MAX_HOURS", default_value_t = 14)]
    pub session_max_hours: i64,

    // -- First run -----------------------------------------------------------
    /// Administrator created when the users table is empty.
    #[arg(long, env = "CLUB_POS_ADMIN_USERNAME", default_value = "admin")]
    pub admin_username: String,

    #[arg(long, env = "CLUB_POS_ADMIN_PASSWORD", hide_env_values = true)]
    pub admin_password: Option<String>,

    // -- PayPal --------------------------------------------------------------
    #[arg(long, env = "PAYPAL_CLIENT_ID")]
    pub paypal_client_id: Option<String>,

    #[arg(long, env = "PAYPAL_CLIENT_SECRET", hide_env_values = true)]
    pub paypal_client_secret: Option<String>,

    #[arg(long, env = "PAYPAL_MODE", value_enum, default_value = "sandbox")]
    pub paypal_mode: PayPalMode,

    #[arg(long, env = "PAYPAL_CURRENCY", default_value = "USD")]
    pub paypal_currency: String,

    // -- SMTP ----------------------------------------------------------------
    #[arg(long, env = "SMTP_HOST")]
    pub smtp_host: Option<String>,

    #[arg(long, env = "SMTP_PORT", default_value_t = 587)]
    pub smtp_port: u16,

    #[arg(long, env = "SMTP_USER")]
    pub smtp_user: Option<String>,

    #[arg(long, env = "SMTP_PASSWORD", hide_env_values = true)]
    pub smtp_password: Option<String>,

    #[arg(long, env = "SMTP_FROM")]
    pub smtp_from: Option<String>,

    // -- Push ----------------------------------------------------------------
    /// Path to the VAPID P-256 private key (PKCS#8 PEM).
    #[arg(long, env = "VAPID_PRIVATE_KEY_FILE")]
    pub vapid_private_key_file: Option<PathBuf>,

    #[arg(long, env = "VAPID_PUBLIC_KEY")]
    pub vapid_public_key: Option<String>,

    #[arg(long, env = "VAPID_SUBJECT", default_value = "mailto:admin@localhost")]
    pub vapid_subject: String,

    #[arg(long, env = "FCM_PROJECT_ID")]
    pub fcm_project_id: Option<String>,

    #[arg(long, env = "FCM_ACCESS_TOKEN", hide_env_values = true)]
    pub fcm_access_token: Option<String>,
}

/// `Z`, `+HH:MM` or `-HH:MM`.
fn parse_offset(raw: &str) -> Result<FixedOffset, String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| "invalid offset".to_string());
    }
    let (sign, rest) = match raw.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(format!("offset must start with + or -: {raw}")),
    };
    let (hours, minutes) = rest
        .split_once(':')
        .ok_or_else(|| format!("offset must look like +HH:MM: {raw}"))?;
    let hours: i32 = hours.parse().map_err(|_| format!("bad hours in offset: {raw}"))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| format!("bad minutes in offset: {raw}"))?;
    if hours > 14 || minutes > 59 {
        return Err(format!("offset out of range: {raw}"));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("offset out of range: {raw}"))
}

impl Config {
    pub fn stale_policy(&self) -> StalePolicy {
        StalePolicy {
            max_age: Duration::hours(self.stale_account_hours.max(1)),
            rollover_hour: self.rollover_hour,
            utc_offset: self.utc_offset,
        }
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            inactivity: Duration::minutes(self.session_idle_minutes.max(1)),
            max_duration: Duration::hours(self.session_max_hours.max(1)),
        }
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_minutes.max(1) * 60)
    }

    pub fn base_url(&self) -> &str {
        self.public_url.trim_end_matches('/')
    }

    /// PayPal credentials, when both halves are present.
    pub fn paypal_credentials(&self) -> Option<(String, Zeroizing<String>)> {
        match (&self.paypal_client_id, &self.paypal_client_secret) {
            (Some(id), Some(secret)) => Some((id.clone(), Zeroizing::new(secret.clone()))),
            _ => None,
        }
    }

    pub fn smtp_settings(&self) -> Option<SmtpSettings> {
        let host = self.smtp_host.clone()?;
        let username = self.smtp_user.clone().unwrap_or_default();
        let from = self.smtp_from.clone().unwrap_or_else(|| username.clone());
        Some(SmtpSettings {
            host,
            port: self.smtp_port,
            username,
            password: Zeroizing::new(self.smtp_password.clone().unwrap_or_default()),
            from,
        })
    }

    pub fn fcm_settings(&self) -> Option<FcmSettings> {
        match (&self.fcm_project_id, &self.fcm_access_token) {
            (Some(project_id), Some(token)) => Some(FcmSettings {
                project_id: project_id.clone(),
                access_token: Zeroizing::new(token.clone()),
            }),
            _ => None,
        }
    }

    /// Reads the key file, so it can fail.
    pub fn vapid_settings(&self) -> std::io::Result<Option<VapidSettings>> {
        let (Some(path), Some(public_key)) = (&self.vapid_private_key_file, &self.vapid_public_key) else {
            return Ok(None);
        };
        let pem = Zeroizing::new(std::fs::read_to_string(path)?);
        Ok(Some(VapidSettings {
            private_key_pem: pem,
            public_key: public_key.clone(),
            subject: self.vapid_subject.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["club-pos"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.addr.port(), 8080);
        assert_eq!(config.sweep_interval().as_secs(), 900);
        assert_eq!(config.stale_policy().max_age, Duration::hours(12));
        assert_eq!(config.stale_policy().rollover_hour, None);
        assert_eq!(config.session_limits().inactivity, Duration::minutes(120));
        assert_eq!(config.paypal_mode, PayPalMode::Sandbox);
    }

    #[test]
    fn offsets() {
        assert_eq!(parse_offset("-05:00").unwrap().local_minus_utc(), -5 * 3600);
        assert_eq!(parse_offset("+05:30").unwrap().local_minus_utc(), 5 * 3600 + 1800);
        assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_offset("05:00").is_err());
        assert!(parse_offset("+25:00").is_err());

        let config = parse(&["--utc-offset=-06:00", "--rollover-hour", "6"]);
        assert_eq!(config.stale_policy().utc_offset.local_minus_utc(), -6 * 3600);
        assert_eq!(config.stale_policy().rollover_hour, Some(6));
        assert!(Config::try_parse_from(["club-pos", "--rollover-hour", "24"]).is_err());
    }

    #[test]
    fn integrations_need_complete_settings() {
        let config = parse(&["--paypal-client-id", "abc"]);
        assert!(config.paypal_credentials().is_none());
        let config = parse(&["--paypal-client-id", "abc", "--paypal-client-secret", "s3cret"]);
        assert_eq!(config.paypal_credentials().unwrap().0, "abc");

        let config = parse(&["--smtp-host", "smtp.example.com", "--smtp-user", "tickets@club.example"]);
        let smtp = config.smtp_settings().unwrap();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.from, "tickets@club.example");

        assert!(parse(&["--fcm-project-id", "club"]).fcm_settings().is_none());
        assert!(parse(&[]).vapid_settings().unwrap().is_none());
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let config = parse(&["--public-url", "https://club.example/"]);
        assert_eq!(config.base_url(), "https://club.example");
    }
}
