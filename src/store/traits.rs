//! `Database` trait: the single async interface for all bridge persistence.
//!
//! Rooms are addressed by their messaging-network identifier; the numeric
//! primary keys never leave the store except as account ids.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::error::DatabaseError;

/// A bridged chat room.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: i64,
    pub room_id: String,
    /// Seconds between poll cycles.
    pub poll_interval: u64,
    /// Whether inbound notifications are rendered as HTML.
    pub html_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Connection parameters for a polled mailbox.
#[derive(Debug, Clone)]
pub struct NewInboundAccount {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    pub ignore_cert: bool,
}

/// A stored inbound account joined with its room's settings.
#[derive(Debug, Clone)]
pub struct InboundAccount {
    pub id: i64,
    pub room_id: String,
    pub room_pk: i64,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    pub ignore_cert: bool,
    pub poll_interval: u64,
    pub html_enabled: bool,
}

/// Connection parameters for a sending account.
#[derive(Debug, Clone)]
pub struct NewOutboundAccount {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub ignore_cert: bool,
}

/// A stored outbound account.
#[derive(Debug, Clone)]
pub struct OutboundAccount {
    pub id: i64,
    pub room_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub ignore_cert: bool,
}

/// Ids of the accounts bound to one room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomAccounts {
    pub inbound: Option<i64>,
    pub outbound: Option<i64>,
}

/// A persisted compose session (at most one per room).
#[derive(Debug, Clone)]
pub struct ComposeRecord {
    pub id: i64,
    pub room_id: String,
    pub receivers: Vec<String>,
    pub subject: String,
    pub body: String,
    pub markdown: bool,
    pub created_at: DateTime<Utc>,
}

/// A file attached to a compose session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub session_id: i64,
    /// Name of the file inside the temp directory.
    pub stored_name: String,
    /// File name as uploaded by the user.
    pub original_name: String,
}

/// Backend-agnostic database trait covering rooms, accounts, dedup markers,
/// blocklists and compose sessions.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Rooms ───────────────────────────────────────────────────────

    /// Return the room row, creating it with `poll_interval` and
    /// `html_enabled` if it does not exist yet.
    async fn ensure_room(
        &self,
        room_id: &str,
        poll_interval: u64,
        html_enabled: bool,
    ) -> Result<Room, DatabaseError>;

    async fn get_room(&self, room_id: &str) -> Result<Option<Room>, DatabaseError>;

    async fn set_room_html(&self, room_id: &str, enabled: bool) -> Result<(), DatabaseError>;

    /// Delete a room with all accounts, dedup markers, blocklist entries and
    /// compose sessions in one transaction. Returns false if it did not exist.
    async fn delete_room(&self, room_id: &str) -> Result<bool, DatabaseError>;

    // ── Accounts ────────────────────────────────────────────────────

    async fn accounts_for(&self, room_id: &str) -> Result<RoomAccounts, DatabaseError>;

    async fn inbound_username_in_use(&self, username: &str) -> Result<bool, DatabaseError>;

    async fn outbound_username_in_use(&self, username: &str) -> Result<bool, DatabaseError>;

    /// Insert an inbound account for `room_pk`. Uniqueness of the room and the
    /// username is enforced by the schema and reported as
    /// [`DatabaseError::Constraint`].
    async fn insert_inbound_account(
        &self,
        room_pk: i64,
        account: &NewInboundAccount,
    ) -> Result<i64, DatabaseError>;

    async fn insert_outbound_account(
        &self,
        room_pk: i64,
        account: &NewOutboundAccount,
    ) -> Result<i64, DatabaseError>;

    async fn get_inbound_account(&self, room_id: &str)
    -> Result<Option<InboundAccount>, DatabaseError>;

    async fn list_inbound_accounts(&self) -> Result<Vec<InboundAccount>, DatabaseError>;

    async fn get_outbound_account(
        &self,
        room_id: &str,
    ) -> Result<Option<OutboundAccount>, DatabaseError>;

    async fn delete_outbound_account(&self, room_id: &str) -> Result<bool, DatabaseError>;

    async fn set_mailbox(&self, room_id: &str, mailbox: &str) -> Result<(), DatabaseError>;

    // ── Seen mail ───────────────────────────────────────────────────

    async fn has_seen_mail(&self, mail_id: &str, room_pk: i64) -> Result<bool, DatabaseError>;

    /// Record a dedup marker. Recording an existing marker is a no-op.
    async fn insert_seen_mail(&self, mail_id: &str, room_pk: i64) -> Result<(), DatabaseError>;

    /// Delete all dedup markers of a room. Returns the number removed.
    async fn purge_seen_mail(&self, room_pk: i64) -> Result<u64, DatabaseError>;

    async fn count_seen_mail(&self, room_pk: i64) -> Result<u64, DatabaseError>;

    // ── Blocklist ───────────────────────────────────────────────────

    /// Returns false if the pattern was already present.
    async fn add_blocklist_entry(&self, account_id: i64, pattern: &str)
    -> Result<bool, DatabaseError>;

    /// Returns false if the pattern was not present.
    async fn remove_blocklist_entry(
        &self,
        account_id: i64,
        pattern: &str,
    ) -> Result<bool, DatabaseError>;

    async fn clear_blocklist(&self, account_id: i64) -> Result<u64, DatabaseError>;

    /// Patterns in insertion order.
    async fn list_blocklist(&self, account_id: i64) -> Result<Vec<String>, DatabaseError>;

    // ── Compose sessions ────────────────────────────────────────────

    /// Create a compose session for `room_pk`. Fails with a constraint
    /// violation if one already exists.
    async fn create_compose_session(
        &self,
        room_pk: i64,
        receivers: &[String],
        markdown: bool,
    ) -> Result<i64, DatabaseError>;

    async fn get_compose_session(
        &self,
        room_id: &str,
    ) -> Result<Option<ComposeRecord>, DatabaseError>;

    async fn set_compose_subject(&self, session_id: i64, subject: &str)
    -> Result<(), DatabaseError>;

    /// Append `text` to the body buffer.
    async fn append_compose_body(&self, session_id: i64, text: &str) -> Result<(), DatabaseError>;

    /// Delete the session and its attachment rows, returning the attachments
    /// so the caller can remove the files.
    async fn delete_compose_session(
        &self,
        session_id: i64,
    ) -> Result<Vec<AttachmentRecord>, DatabaseError>;

    /// Delete every compose session (startup cleanup).
    async fn delete_all_compose_sessions(&self) -> Result<Vec<AttachmentRecord>, DatabaseError>;

    async fn add_attachment(
        &self,
        session_id: i64,
        stored_name: &str,
        original_name: &str,
    ) -> Result<(), DatabaseError>;

    /// Returns false if no attachment with that stored name exists.
    async fn remove_attachment(&self, session_id: i64, stored_name: &str)
    -> Result<bool, DatabaseError>;

    async fn list_attachments(&self, session_id: i64)
    -> Result<Vec<AttachmentRecord>, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError>;
}
