//! Channel abstractions: the chat network on one side, mailboxes and mail
//! transfer on the other.
//!
//! The bridge core only talks to these traits; `matrix`, `imap` and `smtp`
//! hold the network implementations.

pub mod email_poller;
pub mod email_types;
pub mod imap;
pub mod matrix;
pub mod smtp;

use std::path::Path;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::{ChannelError, MailError};
use crate::store::{InboundAccount, NewInboundAccount, OutboundAccount};

pub use email_poller::{PollCounters, PollScheduler};
pub use email_types::{InboundMail, OutgoingAttachment, OutgoingMail};
pub use imap::ImapConnector;
pub use matrix::MatrixChannel;
pub use smtp::LettreMailer;

// ── Chat side ───────────────────────────────────────────────────────

/// Content of a room message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    /// An uploaded file or image, referenced by a network URL.
    File { name: String, url: String },
}

/// Events delivered by the chat network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Message {
        room: String,
        sender: String,
        content: MessageContent,
    },
    /// The bot was invited into `room` by `inviter`.
    Invite { room: String, inviter: String },
    /// The bot is no longer a member of `room`.
    Left { room: String },
}

/// Outbound operations on the chat network.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    async fn send_text(&self, room: &str, text: &str) -> Result<(), ChannelError>;

    /// Send a rich message with a plain-text fallback.
    async fn send_html(&self, room: &str, plain: &str, html: &str) -> Result<(), ChannelError>;

    /// Download an uploaded file to `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<(), ChannelError>;

    async fn join_room(&self, room: &str) -> Result<(), ChannelError>;

    async fn leave_room(&self, room: &str) -> Result<(), ChannelError>;
}

// ── Mail side ───────────────────────────────────────────────────────

/// Everything needed to open a mailbox session.
#[derive(Debug, Clone)]
pub struct MailboxParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    pub ignore_cert: bool,
}

impl From<&InboundAccount> for MailboxParams {
    fn from(account: &InboundAccount) -> Self {
        Self {
            host: account.host.clone(),
            port: account.port,
            username: account.username.clone(),
            password: account.password.clone(),
            mailbox: account.mailbox.clone(),
            ignore_cert: account.ignore_cert,
        }
    }
}

impl From<&NewInboundAccount> for MailboxParams {
    fn from(account: &NewInboundAccount) -> Self {
        Self {
            host: account.host.clone(),
            port: account.port,
            username: account.username.clone(),
            password: account.password.clone(),
            mailbox: account.mailbox.clone(),
            ignore_cert: account.ignore_cert,
        }
    }
}

/// Opens mailbox sessions.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    /// Log in and select the configured mailbox.
    async fn connect(&self, params: &MailboxParams) -> Result<Box<dyn MailboxSession>, MailError>;
}

/// A logged-in mailbox with a read cursor.
#[async_trait]
pub trait MailboxSession: Send {
    /// Messages that arrived after the session's cursor. The first call
    /// returns the most recent messages of the mailbox.
    async fn fetch_new(&mut self) -> Result<Vec<InboundMail>, MailError>;

    /// Names of all mailboxes on the server.
    async fn list_mailboxes(&mut self) -> Result<Vec<String>, MailError>;

    /// Close the session. Errors are ignored.
    async fn logout(&mut self);
}

/// Delivers outgoing mail.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, account: &OutboundAccount, mail: &OutgoingMail) -> Result<(), MailError>;
}
