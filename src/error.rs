//! Error types for the mail bridge.

use std::time::Duration;

/// Top-level error type for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Binding error: {0}")]
    Bind(#[from] BindError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Data directory {0} exists but is not a directory")]
    NotADirectory(String),

    #[error("No configuration found. A default one was written to {0}, edit it and restart")]
    DefaultWritten(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl DatabaseError {
    /// Classify a libSQL error raised by a write statement.
    ///
    /// SQLite reports unique and foreign-key violations through the message
    /// text, so the classification is textual.
    pub(crate) fn from_write(context: &str, err: libsql::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("UNIQUE constraint failed") || msg.contains("FOREIGN KEY constraint failed")
        {
            DatabaseError::Constraint(format!("{context}: {msg}"))
        } else {
            DatabaseError::Query(format!("{context}: {msg}"))
        }
    }
}

/// Messaging-network (chat) errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Login to {server} failed: {reason}")]
    LoginFailed { server: String, reason: String },

    #[error("Failed to send to room {room}: {reason}")]
    SendFailed { room: String, reason: String },

    #[error("Sync failed: {0}")]
    SyncFailed(String),

    #[error("Download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("Membership change in {room} failed: {reason}")]
    Membership { room: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Mailbox (IMAP) and transfer (SMTP) errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Could not connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication rejected for {username}")]
    Auth { username: String },

    #[error("Mailbox {mailbox} could not be selected: {reason}")]
    Select { mailbox: String, reason: String },

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Send failed: {reason}")]
    Send { reason: String, permanent: bool },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailError {
    /// Whether retrying the same operation with the same account is pointless.
    pub fn is_permanent(&self) -> bool {
        match self {
            MailError::Auth { .. } => true,
            MailError::Send { permanent, .. } => *permanent,
            _ => false,
        }
    }
}

/// Account binding errors.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("This room already has an account of that kind")]
    AlreadyBound,

    #[error("Username {0} is already bound to another room")]
    UsernameInUse(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the bridge.
pub type Result<T> = std::result::Result<T, Error>;
