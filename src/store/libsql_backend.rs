//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    AttachmentRecord, ComposeRecord, Database, InboundAccount, NewInboundAccount,
    NewOutboundAccount, OutboundAccount, Room, RoomAccounts,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations. No
/// transaction is ever opened on it: every write is one statement, and
/// dependent rows are removed by the schema's cascades.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_one(
        &self,
        context: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<libsql::Row>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))
    }

    async fn query_count(
        &self,
        context: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<i64, DatabaseError> {
        match self.query_one(context, sql, params).await? {
            Some(row) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("{context}: {e}"))),
            None => Ok(0),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_err(context: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{context}: {e}"))
}

fn flag(b: bool) -> i64 {
    i64::from(b)
}

/// Column order matches ROOM_COLUMNS.
fn row_to_room(row: &libsql::Row) -> Result<Room, libsql::Error> {
    let created: String = row.get(4)?;
    Ok(Room {
        id: row.get(0)?,
        room_id: row.get(1)?,
        poll_interval: row.get::<i64>(2)?.max(1) as u64,
        html_enabled: row.get::<i64>(3)? != 0,
        created_at: parse_datetime(&created),
    })
}

/// Column order matches INBOUND_COLUMNS.
fn row_to_inbound(row: &libsql::Row) -> Result<InboundAccount, libsql::Error> {
    let password: String = row.get(6)?;
    Ok(InboundAccount {
        id: row.get(0)?,
        room_id: row.get(1)?,
        room_pk: row.get(2)?,
        host: row.get(3)?,
        port: row.get::<i64>(4)? as u16,
        username: row.get(5)?,
        password: SecretString::from(password),
        mailbox: row.get(7)?,
        ignore_cert: row.get::<i64>(8)? != 0,
        poll_interval: row.get::<i64>(9)?.max(1) as u64,
        html_enabled: row.get::<i64>(10)? != 0,
    })
}

/// Column order matches OUTBOUND_COLUMNS.
fn row_to_outbound(row: &libsql::Row) -> Result<OutboundAccount, libsql::Error> {
    let password: String = row.get(5)?;
    Ok(OutboundAccount {
        id: row.get(0)?,
        room_id: row.get(1)?,
        host: row.get(2)?,
        port: row.get::<i64>(3)? as u16,
        username: row.get(4)?,
        password: SecretString::from(password),
        ignore_cert: row.get::<i64>(6)? != 0,
    })
}

/// Column order matches COMPOSE_COLUMNS.
fn row_to_compose(row: &libsql::Row) -> Result<ComposeRecord, libsql::Error> {
    let receivers: String = row.get(2)?;
    let created: String = row.get(6)?;
    Ok(ComposeRecord {
        id: row.get(0)?,
        room_id: row.get(1)?,
        receivers: serde_json::from_str(&receivers).unwrap_or_default(),
        subject: row.get(3)?,
        body: row.get(4)?,
        markdown: row.get::<i64>(5)? != 0,
        created_at: parse_datetime(&created),
    })
}

fn row_to_attachment(row: &libsql::Row) -> Result<AttachmentRecord, libsql::Error> {
    Ok(AttachmentRecord {
        session_id: row.get(0)?,
        stored_name: row.get(1)?,
        original_name: row.get(2)?,
    })
}

async fn collect_attachments(
    mut rows: libsql::Rows,
    context: &str,
) -> Result<Vec<AttachmentRecord>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(row_err(context))? {
        out.push(row_to_attachment(&row).map_err(row_err(context))?);
    }
    Ok(out)
}

// ── Trait implementation ────────────────────────────────────────────

const ROOM_COLUMNS: &str = "id, room_id, poll_interval, html_enabled, created_at";

const INBOUND_COLUMNS: &str = "a.id, r.room_id, r.id, a.host, a.port, a.username, a.password, a.mailbox, a.ignore_cert, r.poll_interval, r.html_enabled";

const OUTBOUND_COLUMNS: &str =
    "a.id, r.room_id, a.host, a.port, a.username, a.password, a.ignore_cert";

const COMPOSE_COLUMNS: &str =
    "c.id, r.room_id, c.receivers, c.subject, c.body, c.markdown, c.created_at";

const ATTACHMENT_COLUMNS: &str = "session_id, stored_name, original_name";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Rooms ───────────────────────────────────────────────────────

    async fn ensure_room(
        &self,
        room_id: &str,
        poll_interval: u64,
        html_enabled: bool,
    ) -> Result<Room, DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO rooms (room_id, poll_interval, html_enabled) VALUES (?1, ?2, ?3)",
                params![room_id, poll_interval as i64, flag(html_enabled)],
            )
            .await
            .map_err(|e| DatabaseError::from_write("ensure_room", e))?;

        self.get_room(room_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "room".into(),
                id: room_id.to_string(),
            })
    }

    async fn get_room(&self, room_id: &str) -> Result<Option<Room>, DatabaseError> {
        let row = self
            .query_one(
                "get_room",
                &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE room_id = ?1"),
                params![room_id],
            )
            .await?;
        row.map(|r| row_to_room(&r))
            .transpose()
            .map_err(row_err("get_room"))
    }

    async fn set_room_html(&self, room_id: &str, enabled: bool) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE rooms SET html_enabled = ?1 WHERE room_id = ?2",
                params![flag(enabled), room_id],
            )
            .await
            .map_err(|e| DatabaseError::from_write("set_room_html", e))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "room".into(),
                id: room_id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_room(&self, room_id: &str) -> Result<bool, DatabaseError> {
        // One statement; accounts, seen mail, blocklist and compose rows go
        // with the room through ON DELETE CASCADE.
        let deleted = self
            .conn()
            .execute("DELETE FROM rooms WHERE room_id = ?1", params![room_id])
            .await
            .map_err(|e| DatabaseError::from_write("delete_room", e))?;
        Ok(deleted > 0)
    }

    // ── Accounts ────────────────────────────────────────────────────

    async fn accounts_for(&self, room_id: &str) -> Result<RoomAccounts, DatabaseError> {
        let row = self
            .query_one(
                "accounts_for",
                "SELECT
                    (SELECT a.id FROM inbound_accounts a JOIN rooms r ON r.id = a.room_id WHERE r.room_id = ?1),
                    (SELECT a.id FROM outbound_accounts a JOIN rooms r ON r.id = a.room_id WHERE r.room_id = ?1)",
                params![room_id],
            )
            .await?;

        Ok(match row {
            Some(row) => RoomAccounts {
                inbound: row.get::<Option<i64>>(0).map_err(row_err("accounts_for"))?,
                outbound: row.get::<Option<i64>>(1).map_err(row_err("accounts_for"))?,
            },
            None => RoomAccounts::default(),
        })
    }

    async fn inbound_username_in_use(&self, username: &str) -> Result<bool, DatabaseError> {
        let count = self
            .query_count(
                "inbound_username_in_use",
                "SELECT COUNT(*) FROM inbound_accounts WHERE username = ?1",
                params![username],
            )
            .await?;
        Ok(count > 0)
    }

    async fn outbound_username_in_use(&self, username: &str) -> Result<bool, DatabaseError> {
        let count = self
            .query_count(
                "outbound_username_in_use",
                "SELECT COUNT(*) FROM outbound_accounts WHERE username = ?1",
                params![username],
            )
            .await?;
        Ok(count > 0)
    }

    async fn insert_inbound_account(
        &self,
        room_pk: i64,
        account: &NewInboundAccount,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO inbound_accounts (room_id, host, port, username, password, mailbox, ignore_cert) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) RETURNING id",
                params![
                    room_pk,
                    account.host.clone(),
                    i64::from(account.port),
                    account.username.clone(),
                    account.password.expose_secret().to_string(),
                    account.mailbox.clone(),
                    flag(account.ignore_cert),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("insert_inbound_account", e))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_write("insert_inbound_account", e))?
        {
            Some(row) => row.get::<i64>(0).map_err(row_err("insert_inbound_account")),
            None => Err(DatabaseError::Query(
                "insert_inbound_account: no id returned".into(),
            )),
        }
    }

    async fn insert_outbound_account(
        &self,
        room_pk: i64,
        account: &NewOutboundAccount,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO outbound_accounts (room_id, host, port, username, password, ignore_cert) VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING id",
                params![
                    room_pk,
                    account.host.clone(),
                    i64::from(account.port),
                    account.username.clone(),
                    account.password.expose_secret().to_string(),
                    flag(account.ignore_cert),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("insert_outbound_account", e))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_write("insert_outbound_account", e))?
        {
            Some(row) => row.get::<i64>(0).map_err(row_err("insert_outbound_account")),
            None => Err(DatabaseError::Query(
                "insert_outbound_account: no id returned".into(),
            )),
        }
    }

    async fn get_inbound_account(
        &self,
        room_id: &str,
    ) -> Result<Option<InboundAccount>, DatabaseError> {
        let row = self
            .query_one(
                "get_inbound_account",
                &format!(
                    "SELECT {INBOUND_COLUMNS} FROM inbound_accounts a JOIN rooms r ON r.id = a.room_id WHERE r.room_id = ?1"
                ),
                params![room_id],
            )
            .await?;
        row.map(|r| row_to_inbound(&r))
            .transpose()
            .map_err(row_err("get_inbound_account"))
    }

    async fn list_inbound_accounts(&self) -> Result<Vec<InboundAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INBOUND_COLUMNS} FROM inbound_accounts a JOIN rooms r ON r.id = a.room_id ORDER BY a.id"
                ),
                (),
            )
            .await
            .map_err(row_err("list_inbound_accounts"))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err("list_inbound_accounts"))? {
            out.push(row_to_inbound(&row).map_err(row_err("list_inbound_accounts"))?);
        }
        Ok(out)
    }

    async fn get_outbound_account(
        &self,
        room_id: &str,
    ) -> Result<Option<OutboundAccount>, DatabaseError> {
        let row = self
            .query_one(
                "get_outbound_account",
                &format!(
                    "SELECT {OUTBOUND_COLUMNS} FROM outbound_accounts a JOIN rooms r ON r.id = a.room_id WHERE r.room_id = ?1"
                ),
                params![room_id],
            )
            .await?;
        row.map(|r| row_to_outbound(&r))
            .transpose()
            .map_err(row_err("get_outbound_account"))
    }

    async fn delete_outbound_account(&self, room_id: &str) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM outbound_accounts WHERE room_id IN (SELECT id FROM rooms WHERE room_id = ?1)",
                params![room_id],
            )
            .await
            .map_err(|e| DatabaseError::from_write("delete_outbound_account", e))?;
        Ok(deleted > 0)
    }

    async fn set_mailbox(&self, room_id: &str, mailbox: &str) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE inbound_accounts SET mailbox = ?1 WHERE room_id IN (SELECT id FROM rooms WHERE room_id = ?2)",
                params![mailbox, room_id],
            )
            .await
            .map_err(|e| DatabaseError::from_write("set_mailbox", e))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "inbound_account".into(),
                id: room_id.to_string(),
            });
        }
        Ok(())
    }

    // ── Seen mail ───────────────────────────────────────────────────

    async fn has_seen_mail(&self, mail_id: &str, room_pk: i64) -> Result<bool, DatabaseError> {
        let count = self
            .query_count(
                "has_seen_mail",
                "SELECT COUNT(*) FROM seen_mails WHERE mail_id = ?1 AND room_id = ?2",
                params![mail_id, room_pk],
            )
            .await?;
        Ok(count > 0)
    }

    async fn insert_seen_mail(&self, mail_id: &str, room_pk: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO seen_mails (mail_id, room_id) VALUES (?1, ?2)",
                params![mail_id, room_pk],
            )
            .await
            .map_err(|e| DatabaseError::from_write("insert_seen_mail", e))?;
        Ok(())
    }

    async fn purge_seen_mail(&self, room_pk: i64) -> Result<u64, DatabaseError> {
        self.conn()
            .execute("DELETE FROM seen_mails WHERE room_id = ?1", params![room_pk])
            .await
            .map_err(|e| DatabaseError::from_write("purge_seen_mail", e))
    }

    async fn count_seen_mail(&self, room_pk: i64) -> Result<u64, DatabaseError> {
        let count = self
            .query_count(
                "count_seen_mail",
                "SELECT COUNT(*) FROM seen_mails WHERE room_id = ?1",
                params![room_pk],
            )
            .await?;
        Ok(count.max(0) as u64)
    }

    // ── Blocklist ───────────────────────────────────────────────────

    async fn add_blocklist_entry(
        &self,
        account_id: i64,
        pattern: &str,
    ) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO blocklist (account_id, pattern) VALUES (?1, ?2)",
                params![account_id, pattern],
            )
            .await
            .map_err(|e| DatabaseError::from_write("add_blocklist_entry", e))?;
        Ok(inserted > 0)
    }

    async fn remove_blocklist_entry(
        &self,
        account_id: i64,
        pattern: &str,
    ) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM blocklist WHERE account_id = ?1 AND pattern = ?2",
                params![account_id, pattern],
            )
            .await
            .map_err(|e| DatabaseError::from_write("remove_blocklist_entry", e))?;
        Ok(deleted > 0)
    }

    async fn clear_blocklist(&self, account_id: i64) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM blocklist WHERE account_id = ?1",
                params![account_id],
            )
            .await
            .map_err(|e| DatabaseError::from_write("clear_blocklist", e))
    }

    async fn list_blocklist(&self, account_id: i64) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT pattern FROM blocklist WHERE account_id = ?1 ORDER BY id",
                params![account_id],
            )
            .await
            .map_err(row_err("list_blocklist"))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err("list_blocklist"))? {
            out.push(row.get::<String>(0).map_err(row_err("list_blocklist"))?);
        }
        Ok(out)
    }

    // ── Compose sessions ────────────────────────────────────────────

    async fn create_compose_session(
        &self,
        room_pk: i64,
        receivers: &[String],
        markdown: bool,
    ) -> Result<i64, DatabaseError> {
        let receivers_json = serde_json::to_string(receivers)
            .map_err(|e| DatabaseError::Query(format!("create_compose_session: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                "INSERT INTO compose_sessions (room_id, receivers, markdown) VALUES (?1, ?2, ?3) RETURNING id",
                params![room_pk, receivers_json, flag(markdown)],
            )
            .await
            .map_err(|e| DatabaseError::from_write("create_compose_session", e))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_write("create_compose_session", e))?
        {
            Some(row) => row.get::<i64>(0).map_err(row_err("create_compose_session")),
            None => Err(DatabaseError::Query(
                "create_compose_session: no id returned".into(),
            )),
        }
    }

    async fn get_compose_session(
        &self,
        room_id: &str,
    ) -> Result<Option<ComposeRecord>, DatabaseError> {
        let row = self
            .query_one(
                "get_compose_session",
                &format!(
                    "SELECT {COMPOSE_COLUMNS} FROM compose_sessions c JOIN rooms r ON r.id = c.room_id WHERE r.room_id = ?1"
                ),
                params![room_id],
            )
            .await?;
        row.map(|r| row_to_compose(&r))
            .transpose()
            .map_err(row_err("get_compose_session"))
    }

    async fn set_compose_subject(
        &self,
        session_id: i64,
        subject: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE compose_sessions SET subject = ?1 WHERE id = ?2",
                params![subject, session_id],
            )
            .await
            .map_err(|e| DatabaseError::from_write("set_compose_subject", e))?;
        Ok(())
    }

    async fn append_compose_body(&self, session_id: i64, text: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE compose_sessions SET body = body || ?1 WHERE id = ?2",
                params![text, session_id],
            )
            .await
            .map_err(|e| DatabaseError::from_write("append_compose_body", e))?;
        Ok(())
    }

    async fn delete_compose_session(
        &self,
        session_id: i64,
    ) -> Result<Vec<AttachmentRecord>, DatabaseError> {
        let attachments = self.list_attachments(session_id).await?;
        self.conn()
            .execute(
                "DELETE FROM compose_sessions WHERE id = ?1",
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::from_write("delete_compose_session", e))?;
        Ok(attachments)
    }

    async fn delete_all_compose_sessions(&self) -> Result<Vec<AttachmentRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ATTACHMENT_COLUMNS} FROM compose_attachments ORDER BY id"),
                (),
            )
            .await
            .map_err(row_err("delete_all_compose_sessions"))?;
        let attachments = collect_attachments(rows, "delete_all_compose_sessions").await?;

        self.conn()
            .execute("DELETE FROM compose_sessions", ())
            .await
            .map_err(|e| DatabaseError::from_write("delete_all_compose_sessions", e))?;
        Ok(attachments)
    }

    async fn add_attachment(
        &self,
        session_id: i64,
        stored_name: &str,
        original_name: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO compose_attachments (session_id, stored_name, original_name) VALUES (?1, ?2, ?3)",
                params![session_id, stored_name, original_name],
            )
            .await
            .map_err(|e| DatabaseError::from_write("add_attachment", e))?;
        Ok(())
    }

    async fn remove_attachment(
        &self,
        session_id: i64,
        stored_name: &str,
    ) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM compose_attachments WHERE session_id = ?1 AND stored_name = ?2",
                params![session_id, stored_name],
            )
            .await
            .map_err(|e| DatabaseError::from_write("remove_attachment", e))?;
        Ok(deleted > 0)
    }

    async fn list_attachments(
        &self,
        session_id: i64,
    ) -> Result<Vec<AttachmentRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ATTACHMENT_COLUMNS} FROM compose_attachments WHERE session_id = ?1 ORDER BY id"),
                params![session_id],
            )
            .await
            .map_err(row_err("list_attachments"))?;
        collect_attachments(rows, "list_attachments").await
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let row = self
            .query_one(
                "get_setting",
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
            )
            .await?;
        row.map(|r| r.get::<String>(0))
            .transpose()
            .map_err(row_err("get_setting"))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value],
            )
            .await
            .map_err(|e| DatabaseError::from_write("set_setting", e))?;
        Ok(())
    }
}
