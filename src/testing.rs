//! In-process fakes of the chat, mailbox and transfer collaborators for unit
//! tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::DateTime;

use crate::channels::{
    ChatChannel, InboundMail, MailboxConnector, MailboxParams, MailboxSession, Mailer,
    OutgoingMail,
};
use crate::error::{ChannelError, MailError};
use crate::store::OutboundAccount;

/// A message the bot posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub room: String,
    pub text: String,
    pub html: Option<String>,
}

#[derive(Default)]
pub struct FakeChat {
    pub sent: Mutex<Vec<Sent>>,
    pub joined: Mutex<Vec<String>>,
    pub left: Mutex<Vec<String>>,
    /// Content written by `download`.
    pub download_body: Mutex<Vec<u8>>,
    /// Sends fail while set.
    pub fail_sends: AtomicBool,
}

impl FakeChat {
    pub fn texts(&self, room: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.room == room)
            .map(|s| s.text.clone())
            .collect()
    }

    pub fn last(&self, room: &str) -> String {
        self.texts(room).pop().unwrap_or_default()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    fn check_send(&self, room: &str) -> Result<(), ChannelError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed {
                room: room.into(),
                reason: "unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatChannel for FakeChat {
    async fn send_text(&self, room: &str, text: &str) -> Result<(), ChannelError> {
        self.check_send(room)?;
        self.sent.lock().unwrap().push(Sent {
            room: room.into(),
            text: text.into(),
            html: None,
        });
        Ok(())
    }

    async fn send_html(&self, room: &str, plain: &str, html: &str) -> Result<(), ChannelError> {
        self.check_send(room)?;
        self.sent.lock().unwrap().push(Sent {
            room: room.into(),
            text: plain.into(),
            html: Some(html.into()),
        });
        Ok(())
    }

    async fn download(&self, _url: &str, dest: &Path) -> Result<(), ChannelError> {
        let body = self.download_body.lock().unwrap().clone();
        std::fs::write(dest, body).map_err(|e| ChannelError::DownloadFailed {
            url: dest.display().to_string(),
            reason: e.to_string(),
        })
    }

    async fn join_room(&self, room: &str) -> Result<(), ChannelError> {
        self.joined.lock().unwrap().push(room.into());
        Ok(())
    }

    async fn leave_room(&self, room: &str) -> Result<(), ChannelError> {
        self.left.lock().unwrap().push(room.into());
        Ok(())
    }
}

/// Mailbox whose contents the test controls. Every session returns the mail
/// queued in `inbox` on its next fetch; an empty inbox yields empty batches.
#[derive(Default)]
pub struct FakeMailbox {
    pub connects: AtomicUsize,
    pub fetches: AtomicUsize,
    pub reject_login: AtomicBool,
    /// Number of upcoming connects that are refused.
    pub failing_connects: AtomicUsize,
    /// Number of upcoming fetches that fail.
    pub failing_fetches: AtomicUsize,
    pub inbox: Mutex<VecDeque<Vec<InboundMail>>>,
    pub mailboxes: Mutex<Vec<String>>,
    pub last_params: Mutex<Option<MailboxParams>>,
}

impl FakeMailbox {
    pub fn deliver(&self, batch: Vec<InboundMail>) {
        self.inbox.lock().unwrap().push_back(batch);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// Decrement `counter` if it is positive. Returns whether it was.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

struct FakeSession(Arc<FakeMailbox>);

#[async_trait]
impl MailboxConnector for Arc<FakeMailbox> {
    async fn connect(&self, params: &MailboxParams) -> Result<Box<dyn MailboxSession>, MailError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock().unwrap() = Some(params.clone());
        if self.reject_login.load(Ordering::SeqCst) {
            return Err(MailError::Auth {
                username: params.username.clone(),
            });
        }
        if take_one(&self.failing_connects) {
            return Err(MailError::Connect {
                host: params.host.clone(),
                reason: "refused".into(),
            });
        }
        Ok(Box::new(FakeSession(Arc::clone(self))))
    }
}

#[async_trait]
impl MailboxSession for FakeSession {
    async fn fetch_new(&mut self) -> Result<Vec<InboundMail>, MailError> {
        self.0.fetches.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.0.failing_fetches) {
            return Err(MailError::Fetch("connection dropped".into()));
        }
        Ok(self.0.inbox.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn list_mailboxes(&mut self) -> Result<Vec<String>, MailError> {
        Ok(self.0.mailboxes.lock().unwrap().clone())
    }

    async fn logout(&mut self) {}
}

/// Records sent mail; `fail_with` makes the next send fail.
#[derive(Default)]
pub struct FakeMailer {
    pub sent: Mutex<Vec<(String, OutgoingMail)>>,
    pub fail_with: Mutex<Option<MailError>>,
    /// Attachment paths that existed at send time.
    pub attachment_files: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, account: &OutboundAccount, mail: &OutgoingMail) -> Result<(), MailError> {
        if let Some(err) = self.fail_with.lock().unwrap().take() {
            return Err(err);
        }
        for attachment in &mail.attachments {
            if !attachment.path.exists() {
                return Err(MailError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    attachment.path.display().to_string(),
                )));
            }
            self.attachment_files
                .lock()
                .unwrap()
                .push(attachment.path.clone());
        }
        self.sent
            .lock()
            .unwrap()
            .push((account.username.clone(), mail.clone()));
        Ok(())
    }
}

pub fn mail(subject: &str, ts: i64, from: &str) -> InboundMail {
    InboundMail {
        uid: ts as u32,
        subject: subject.into(),
        internal_date: DateTime::from_timestamp(ts, 0).unwrap(),
        sender_addresses: vec![from.into()],
        from_display: from.into(),
        body: "hello".into(),
        attachments: vec![],
    }
}
