//! Inbound mail pipeline: dedup, record, blocklist, notify.
//!
//! Runs once per fetched batch, inside the room's poll task:
//! 1. Compute the mail id and skip mails the room has already seen
//! 2. Record the dedup marker (before anything is sent)
//! 3. Stop here when the batch is silenced
//! 4. Drop mails from blocklisted senders
//! 5. Hand the rest to the `Notifier`

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::channels::InboundMail;
use crate::notifier::Notifier;
use crate::pipeline::dedup::{DedupLedger, mail_id};
use crate::pipeline::rules::BlocklistFilter;
use crate::store::{Database, InboundAccount};

/// Counts for one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Mails skipped because the room had seen them.
    pub duplicates: usize,
    /// Dedup markers written.
    pub recorded: usize,
    /// New mails suppressed by the blocklist.
    pub blocked: usize,
    /// Notifications delivered.
    pub notified: usize,
}

pub struct MailPipeline {
    db: Arc<dyn Database>,
    ledger: DedupLedger,
    blocklist: BlocklistFilter,
    notifier: Notifier,
}

impl MailPipeline {
    pub fn new(db: Arc<dyn Database>, notifier: Notifier) -> Self {
        Self {
            ledger: DedupLedger::new(Arc::clone(&db)),
            blocklist: BlocklistFilter::new(Arc::clone(&db)),
            db,
            notifier,
        }
    }

    /// Process one batch of fetched mail for `account`'s room, in listing
    /// order. With `silent` set, new mails are only recorded.
    pub async fn process_batch(
        &self,
        account: &InboundAccount,
        mails: Vec<InboundMail>,
        silent: bool,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if mails.is_empty() {
            return outcome;
        }

        // HTML mode can change while the task runs, so read it per batch.
        let html = match self.db.get_room(&account.room_id).await {
            Ok(Some(room)) => room.html_enabled,
            _ => account.html_enabled,
        };

        for mail in mails {
            let id = mail_id(&mail.subject, mail.internal_date);

            match self.ledger.is_seen(account.room_pk, &id).await {
                Ok(true) => {
                    outcome.duplicates += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(code = 11, room = %account.room_id, error = %e, "Dedup lookup failed");
                    continue;
                }
            }

            if let Err(e) = self.ledger.record(account.room_pk, &id).await {
                // Without a marker the mail would be announced again next cycle.
                error!(code = 12, room = %account.room_id, error = %e, "Recording seen mail failed");
                continue;
            }
            outcome.recorded += 1;

            if silent {
                continue;
            }

            match self
                .blocklist
                .first_match(account.id, &mail.sender_addresses)
                .await
            {
                Ok(Some(pattern)) => {
                    info!(room = %account.room_id, pattern = %pattern, "Blocked mail");
                    outcome.blocked += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(room = %account.room_id, error = %e, "Blocklist lookup failed, delivering anyway");
                }
            }

            match self
                .notifier
                .notify(
                    &account.room_id,
                    &mail.from_display,
                    &mail.subject,
                    &mail.notification_body(),
                    html,
                )
                .await
            {
                Ok(()) => outcome.notified += 1,
                Err(e) => warn!(room = %account.room_id, error = %e, "Failed to deliver notification"),
            }
        }

        debug!(
            room = %account.room_id,
            silent,
            duplicates = outcome.duplicates,
            recorded = outcome.recorded,
            blocked = outcome.blocked,
            notified = outcome.notified,
            "Processed mail batch"
        );
        outcome
    }
}
