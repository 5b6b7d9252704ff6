//! Dedup ledger: remembers which mails were already surfaced in a room.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::store::Database;

/// Identifier of a mail inside a room: subject followed by the arrival time
/// in unix seconds.
///
/// Two different mails with the same subject arriving in the same second
/// share an identifier.
pub fn mail_id(subject: &str, internal_date: DateTime<Utc>) -> String {
    format!("{subject}{}", internal_date.timestamp())
}

#[derive(Clone)]
pub struct DedupLedger {
    db: Arc<dyn Database>,
}

impl DedupLedger {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn is_seen(&self, room_pk: i64, mail_id: &str) -> Result<bool, DatabaseError> {
        self.db.has_seen_mail(mail_id, room_pk).await
    }

    /// Mark a mail as surfaced. Recording twice is a no-op.
    pub async fn record(&self, room_pk: i64, mail_id: &str) -> Result<(), DatabaseError> {
        self.db.insert_seen_mail(mail_id, room_pk).await
    }

    /// Forget all mails of a room. Used when the room switches mailbox.
    pub async fn purge(&self, room_pk: i64) -> Result<u64, DatabaseError> {
        self.db.purge_seen_mail(room_pk).await
    }

    pub async fn count(&self, room_pk: i64) -> Result<u64, DatabaseError> {
        self.db.count_seen_mail(room_pk).await
    }
}
