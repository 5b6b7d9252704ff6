//! Email-specific types: inbound mail parsing, outbound mail description,
//! address extraction.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};

use crate::error::MailError;

/// A message fetched from a mailbox, parsed into the parts the bridge shows.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMail {
    /// Server-assigned UID within the selected mailbox.
    pub uid: u32,
    /// Subject header, empty when absent.
    pub subject: String,
    /// Server-assigned arrival time (IMAP INTERNALDATE).
    pub internal_date: DateTime<Utc>,
    /// Every address found in `From` and `Sender`, deduplicated.
    pub sender_addresses: Vec<String>,
    /// `Name <address>` of the first `From` entry.
    pub from_display: String,
    /// Readable text body.
    pub body: String,
    /// File names of attached parts.
    pub attachments: Vec<String>,
}

impl InboundMail {
    /// Parse a raw RFC 5322 message.
    pub fn parse(uid: u32, internal_date: DateTime<Utc>, raw: &[u8]) -> Result<Self, MailError> {
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| MailError::InvalidMessage(format!("UID {uid} is not a mail message")))?;

        let mut sender_addresses = extract_addresses(parsed.from());
        for addr in extract_addresses(parsed.sender()) {
            if !sender_addresses
                .iter()
                .any(|known| known.eq_ignore_ascii_case(&addr))
            {
                sender_addresses.push(addr);
            }
        }

        let attachments = parsed
            .attachments()
            .filter_map(|part| MimeHeaders::attachment_name(part).map(str::to_string))
            .collect();

        Ok(Self {
            uid,
            subject: parsed.subject().unwrap_or_default().to_string(),
            internal_date,
            sender_addresses,
            from_display: extract_display(&parsed),
            body: extract_text(&parsed),
            attachments,
        })
    }

    /// The body followed by a list of attachment names, if any.
    pub fn notification_body(&self) -> String {
        if self.attachments.is_empty() {
            return self.body.clone();
        }
        format!(
            "{}\r\n\r\nAttachments: {}",
            self.body.trim_end(),
            self.attachments.join(", ")
        )
    }
}

/// A file to attach to an outgoing mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAttachment {
    /// File name shown to the recipient.
    pub file_name: String,
    /// Location of the content on disk.
    pub path: PathBuf,
}

/// A fully assembled outgoing mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    /// Plain-text part (always present).
    pub text: String,
    /// HTML part; when set, `text` becomes the alternative.
    pub html: Option<String>,
    pub attachments: Vec<OutgoingAttachment>,
}

/// Extract email addresses from an optional mail_parser Address field.
///
/// Returns an empty vec if the address is None.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

fn extract_display(parsed: &mail_parser::Message) -> String {
    let Some(first) = parsed.from().and_then(|addr| addr.first()) else {
        return "unknown".into();
    };
    match (first.name(), first.address()) {
        (Some(name), Some(address)) if !name.trim().is_empty() => {
            format!("{} <{address}>", name.trim())
        }
        (_, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => "unknown".into(),
    }
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Strip HTML tags, keeping one line per block.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut tag = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name = tag
                    .trim_start_matches('/')
                    .split(|c: char| c.is_whitespace() || c == '/')
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                if matches!(name.as_str(), "br" | "p" | "div" | "tr" | "li" | "h1" | "h2" | "h3") {
                    result.push('\n');
                }
            }
            _ if in_tag => tag.push(ch),
            _ => result.push(ch),
        }
    }

    result
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
