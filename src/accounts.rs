//! Account registry: binds rooms to their inbound and outbound accounts.
//!
//! A room holds at most one account of each kind and a username can be bound
//! to only one room. The store's unique constraints are the final word on
//! both rules; the checks here exist to produce a precise error.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::channels::PollScheduler;
use crate::compose::remove_attachment_files;
use crate::error::{BindError, DatabaseError};
use crate::pipeline::DedupLedger;
use crate::store::{Database, NewInboundAccount, NewOutboundAccount, RoomAccounts};

pub struct AccountRegistry {
    db: Arc<dyn Database>,
    scheduler: PollScheduler,
    ledger: DedupLedger,
    temp_dir: PathBuf,
    default_interval: u64,
    html_default: bool,
}

impl AccountRegistry {
    pub fn new(
        db: Arc<dyn Database>,
        scheduler: PollScheduler,
        temp_dir: PathBuf,
        default_interval: u64,
        html_default: bool,
    ) -> Self {
        Self {
            ledger: DedupLedger::new(Arc::clone(&db)),
            db,
            scheduler,
            temp_dir,
            default_interval,
            html_default,
        }
    }

    pub async fn accounts_for(&self, room: &str) -> Result<RoomAccounts, DatabaseError> {
        self.db.accounts_for(room).await
    }

    /// Bind a mailbox to `room` and start polling it silently, so mail that is
    /// already in the mailbox is not announced.
    pub async fn bind_inbound(
        &self,
        room: &str,
        account: &NewInboundAccount,
    ) -> Result<i64, BindError> {
        if self.db.accounts_for(room).await?.inbound.is_some() {
            return Err(BindError::AlreadyBound);
        }
        if self.db.inbound_username_in_use(&account.username).await? {
            return Err(BindError::UsernameInUse(account.username.clone()));
        }

        let row = self
            .db
            .ensure_room(room, self.default_interval, self.html_default)
            .await?;
        let id = match self.db.insert_inbound_account(row.id, account).await {
            Ok(id) => id,
            Err(DatabaseError::Constraint(_)) => {
                return Err(self.classify_conflict(room, &account.username, true).await);
            }
            Err(e) => return Err(e.into()),
        };

        let stored = self
            .db
            .get_inbound_account(room)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "inbound_account".into(),
                id: id.to_string(),
            })?;
        self.scheduler.start(stored, true).await;

        info!(room = %room, host = %account.host, "Inbound account bound");
        Ok(id)
    }

    pub async fn bind_outbound(
        &self,
        room: &str,
        account: &NewOutboundAccount,
    ) -> Result<i64, BindError> {
        if self.db.accounts_for(room).await?.outbound.is_some() {
            return Err(BindError::AlreadyBound);
        }
        if self.db.outbound_username_in_use(&account.username).await? {
            return Err(BindError::UsernameInUse(account.username.clone()));
        }

        let row = self
            .db
            .ensure_room(room, self.default_interval, self.html_default)
            .await?;
        match self.db.insert_outbound_account(row.id, account).await {
            Ok(id) => {
                info!(room = %room, host = %account.host, "Outbound account bound");
                Ok(id)
            }
            Err(DatabaseError::Constraint(_)) => {
                Err(self.classify_conflict(room, &account.username, false).await)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A concurrent bind won the race; report which rule it violated.
    async fn classify_conflict(&self, room: &str, username: &str, inbound: bool) -> BindError {
        match self.db.accounts_for(room).await {
            Ok(bound) if inbound && bound.inbound.is_some() => BindError::AlreadyBound,
            Ok(bound) if !inbound && bound.outbound.is_some() => BindError::AlreadyBound,
            Ok(_) => BindError::UsernameInUse(username.to_string()),
            Err(e) => BindError::Database(e),
        }
    }

    /// Remove everything the room owns: poll task, accounts, seen mail,
    /// blocklist and any open compose session with its files.
    pub async fn unbind(&self, room: &str) -> Result<bool, DatabaseError> {
        self.scheduler.stop(room).await;

        if let Some(session) = self.db.get_compose_session(room).await? {
            let attachments = self.db.delete_compose_session(session.id).await?;
            remove_attachment_files(&self.temp_dir, &attachments).await;
        }
        let existed = self.db.delete_room(room).await?;
        if existed {
            info!(room = %room, "Room unbound");
        }
        Ok(existed)
    }

    /// Drop the room's sending account, e.g. after it failed hard.
    pub async fn unbind_outbound(&self, room: &str) -> Result<bool, DatabaseError> {
        self.db.delete_outbound_account(room).await
    }

    /// Switch the polled mailbox. Seen mail is forgotten and the new task
    /// starts silent. Returns false if the room has no inbound account.
    pub async fn change_mailbox(&self, room: &str, mailbox: &str) -> Result<bool, DatabaseError> {
        if self.db.accounts_for(room).await?.inbound.is_none() {
            return Ok(false);
        }

        self.scheduler.stop(room).await;
        self.db.set_mailbox(room, mailbox).await?;

        let Some(account) = self.db.get_inbound_account(room).await? else {
            return Ok(false);
        };
        let purged = self.ledger.purge(account.room_pk).await?;
        self.scheduler.start(account, true).await;

        info!(room = %room, mailbox, purged, "Mailbox changed");
        Ok(true)
    }

    pub async fn set_html(&self, room: &str, enabled: bool) -> Result<(), DatabaseError> {
        self.db.set_room_html(room, enabled).await
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    /// Start polling for every stored inbound account.
    pub async fn resume_all(&self) -> Result<usize, DatabaseError> {
        let accounts = self.db.list_inbound_accounts().await?;
        if accounts.is_empty() {
            warn!("No inbound accounts stored, nothing to poll");
        }
        Ok(self.scheduler.start_all(accounts, false).await)
    }
}
