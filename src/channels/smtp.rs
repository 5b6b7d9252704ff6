//! SMTP delivery via lettre.
//!
//! Port 465 uses implicit TLS, every other port STARTTLS. Sending is
//! synchronous and runs inside `spawn_blocking`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;

use crate::channels::{Mailer, OutgoingMail};
use crate::error::MailError;
use crate::store::OutboundAccount;

/// Port used when `!setup smtp` names none.
pub const DEFAULT_SMTP_PORT: u16 = 587;

const SMTP_TIMEOUT: Duration = Duration::from_secs(60);

fn send_err(reason: impl Into<String>, permanent: bool) -> MailError {
    MailError::Send {
        reason: reason.into(),
        permanent,
    }
}

/// Sends mail through the room's outbound account.
#[derive(Debug, Clone, Default)]
pub struct LettreMailer;

#[async_trait]
impl Mailer for LettreMailer {
    async fn send(&self, account: &OutboundAccount, mail: &OutgoingMail) -> Result<(), MailError> {
        let account = account.clone();
        let mail = mail.clone();
        tokio::task::spawn_blocking(move || send_blocking(&account, &mail))
            .await
            .map_err(|e| send_err(format!("send task failed: {e}"), false))?
    }
}

fn send_blocking(account: &OutboundAccount, mail: &OutgoingMail) -> Result<(), MailError> {
    let message = build_message(mail)?;

    let mut tls = TlsParameters::builder(account.host.clone());
    if account.ignore_cert {
        tls = tls
            .dangerous_accept_invalid_certs(true)
            .dangerous_accept_invalid_hostnames(true);
    }
    let tls = tls
        .build()
        .map_err(|e| send_err(format!("TLS setup failed: {e}"), true))?;
    let tls = if account.port == 465 {
        Tls::Wrapper(tls)
    } else {
        Tls::Required(tls)
    };

    let transport = SmtpTransport::builder_dangerous(&account.host)
        .port(account.port)
        .tls(tls)
        .timeout(Some(SMTP_TIMEOUT))
        .credentials(Credentials::new(
            account.username.clone(),
            account.password.expose_secret().to_string(),
        ))
        .build();

    transport
        .send(&message)
        .map_err(|e| send_err(e.to_string(), e.is_permanent()))?;

    info!(
        host = %account.host,
        recipients = mail.to.len(),
        attachments = mail.attachments.len(),
        "Mail sent"
    );
    Ok(())
}

/// Assemble the MIME message: plain text, or plain+HTML alternative, wrapped
/// in multipart/mixed when there are attachments.
pub fn build_message(mail: &OutgoingMail) -> Result<Message, MailError> {
    let from: Mailbox = mail
        .from
        .parse()
        .map_err(|e| send_err(format!("invalid sender {}: {e}", mail.from), true))?;

    let mut builder = Message::builder().from(from).subject(mail.subject.clone());
    for to in &mail.to {
        let to: Mailbox = to
            .parse()
            .map_err(|e| send_err(format!("invalid recipient {to}: {e}"), true))?;
        builder = builder.to(to);
    }

    let built = if mail.attachments.is_empty() {
        match &mail.html {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(
                mail.text.clone(),
                html.clone(),
            )),
            None => builder.body(mail.text.clone()),
        }
    } else {
        let mut mixed = match &mail.html {
            Some(html) => MultiPart::mixed().multipart(MultiPart::alternative_plain_html(
                mail.text.clone(),
                html.clone(),
            )),
            None => MultiPart::mixed().singlepart(SinglePart::plain(mail.text.clone())),
        };
        for attachment in &mail.attachments {
            let data = std::fs::read(&attachment.path)?;
            mixed = mixed.singlepart(
                Attachment::new(attachment.file_name.clone())
                    .body(data, content_type_for(&attachment.path)),
            );
        }
        builder.multipart(mixed)
    };

    built.map_err(|e| send_err(format!("failed to build mail: {e}"), true))
}

fn content_type_for(path: &Path) -> ContentType {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let mime = match ext.as_str() {
        "txt" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    };
    ContentType::parse(mime).unwrap_or(ContentType::TEXT_PLAIN)
}
