//! Outgoing email: the sender contract, an SMTP implementation, and the
//! ticket email with inline QR images.
//!
//! Ticket emails are best-effort. A failed send is logged and leaves
//! `email_sent = 0`; it never undoes the sale.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::auth::{self, Action, Principal};
use crate::db::DbState;
use crate::entries;
use crate::error::{PosError, Result};
use crate::events;
use crate::models::{Entry, EntryStatus, Event};
use crate::qr;

pub const SEND_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// Set for inline parts referenced from the HTML as `cid:<id>`.
    pub content_id: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SMTP
// ---------------------------------------------------------------------------

pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Zeroizing<String>,
    /// `Name <address>` or a bare address.
    pub from: String,
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self> {
        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|e| PosError::validation(format!("Invalid from address: {e}")))?;
        let creds = Credentials::new(settings.username.clone(), settings.password.to_string());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
            .map_err(|e| PosError::Internal(format!("Failed to create SMTP transport: {e}")))?
            .port(settings.port)
            .credentials(creds)
            .timeout(Some(SEND_TIMEOUT))
            .build();
        info!(host = %settings.host, port = settings.port, "SMTP mailer configured");
        Ok(Self { transport, from })
    }
}

fn build_message(from: &Mailbox, message: EmailMessage) -> Result<Message> {
    let to: Mailbox = message
        .to
        .parse()
        .map_err(|e| PosError::validation(format!("Invalid to address: {e}")))?;

    let mut related = MultiPart::related().singlepart(SinglePart::html(message.html));
    for attachment in message.attachments {
        let content_type = ContentType::parse(&attachment.content_type)
            .map_err(|e| PosError::Internal(format!("Invalid content type: {e}")))?;
        let part = match attachment.content_id {
            Some(cid) => MimeAttachment::new_inline(cid).body(attachment.data, content_type),
            None => MimeAttachment::new(attachment.filename).body(attachment.data, content_type),
        };
        related = related.singlepart(part);
    }

    Message::builder()
        .from(from.clone())
        .to(to)
        .subject(message.subject)
        .multipart(
            MultiPart::alternative()
                .singlepart(SinglePart::plain(message.text))
                .multipart(related),
        )
        .map_err(|e| PosError::Internal(format!("Failed to build email: {e}")))
}

#[async_trait]
impl EmailSender for SmtpMailer {
    async fn send(&self, message: EmailMessage) -> Result<()> {
        let email = build_message(&self.from, message)?;
        self.transport
            .send(email)
            .await
            .map_err(|e| PosError::Delivery(format!("SMTP send failed: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Ticket email
// ---------------------------------------------------------------------------

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// One email for all `entries` of a single buyer, with one inline QR each.
pub fn compose_ticket_email(event: &Event, entries: &[Entry]) -> Result<EmailMessage> {
    let first = entries
        .first()
        .ok_or_else(|| PosError::validation("No entries to send"))?;

    let mut html = format!(
        "<h2>{}</h2><p>Hola {}, estas son tus entradas para el {}.</p>",
        escape_html(&event.name),
        escape_html(&first.client_name),
        escape_html(&event.date[..10.min(event.date.len())]),
    );
    let mut text = format!("Hola {}, estas son tus entradas para {}:\n", first.client_name, event.name);
    let mut attachments = Vec::with_capacity(entries.len());

    for (i, entry) in entries.iter().enumerate() {
        let cid = format!("ticket-{}", i + 1);
        html.push_str(&format!(
            "<div><p>Entrada {} ({} persona(s)) &middot; <code>{}</code></p>\
             <img src=\"cid:{cid}\" alt=\"{}\" width=\"240\" height=\"240\"/></div>",
            i + 1,
            entry.number_of_entries,
            entry.qr_token,
            entry.qr_token,
        ));
        text.push_str(&format!("  {}. {}\n", i + 1, entry.qr_token));
        attachments.push(Attachment {
            filename: format!("{}.png", entry.qr_token),
            content_type: "image/png".into(),
            content_id: Some(cid),
            data: qr::render_png(&entry.qr_token, qr::DEFAULT_SCALE, qr::DEFAULT_MARGIN)?,
        });
    }
    html.push_str("<p>Presenta el código QR en la puerta.</p>");

    Ok(EmailMessage {
        to: first.client_email.clone(),
        subject: format!("Tus entradas: {}", event.name),
        html,
        text,
        attachments,
    })
}

/// Send the ticket email and flag the entries as emailed on success.
pub async fn send_ticket_email(
    db: &DbState,
    sender: &dyn EmailSender,
    event: &Event,
    entries: &[Entry],
) -> Result<()> {
    let message = compose_ticket_email(event, entries)?;
    tokio::time::timeout(SEND_TIMEOUT, sender.send(message))
        .await
        .map_err(|_| PosError::Delivery("Email send timed out".into()))??;

    let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
    let conn = db.lock()?;
    entries::mark_email_sent(&conn, &ids)?;
    info!(event_id = %event.id, tickets = ids.len(), "Ticket email sent");
    Ok(())
}

/// Fire-and-forget ticket email after a committed sale.
pub fn spawn_ticket_email(
    db: Arc<DbState>,
    sender: Option<Arc<dyn EmailSender>>,
    event: Event,
    entries: Vec<Entry>,
) {
    let Some(sender) = sender else {
        warn!(event_id = %event.id, "No mailer configured; ticket email skipped");
        return;
    };
    tokio::spawn(async move {
        if let Err(e) = send_ticket_email(&db, sender.as_ref(), &event, &entries).await {
            warn!(event_id = %event.id, error = %e, "Ticket email failed");
        }
    });
}

/// Staff-triggered resend for one entry. Unlike the post-sale email, a
/// failure here is reported to the caller.
pub async fn resend_ticket_email(
    db: &DbState,
    principal: &Principal,
    sender: Option<&dyn EmailSender>,
    entry_id: &str,
) -> Result<Entry> {
    auth::authorize(principal, Action::ResendTicketEmail)?;
    let sender = sender.ok_or_else(|| PosError::Delivery("Email is not configured".into()))?;
    let (entry, event) = {
        let conn = db.lock()?;
        let entry = entries::load(&conn, entry_id)?;
        let event = events::load(&conn, &entry.event_id)?;
        (entry, event)
    };
    if entry.status == EntryStatus::Cancelled {
        return Err(crate::error::Conflict::EntryCancelled.into());
    }
    send_ticket_email(db, sender, &event, std::slice::from_ref(&entry)).await?;
    let conn = db.lock()?;
    entries::load(&conn, entry_id)
}
