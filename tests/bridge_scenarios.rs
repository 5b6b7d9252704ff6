//! End-to-end scenarios for the bridge core.
//!
//! The dispatcher, registry, poll scheduler and compose sessions run for
//! real against an in-memory database; chat, mailbox and SMTP are in-process
//! fakes.

use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;

use mail_bridge::accounts::AccountRegistry;
use mail_bridge::channels::{
    ChatChannel, ChatEvent, InboundMail, MailboxConnector, MailboxParams, MailboxSession, Mailer,
    MessageContent, OutgoingMail, PollScheduler,
};
use mail_bridge::commands::Dispatcher;
use mail_bridge::compose::ComposeSessions;
use mail_bridge::config::{BridgeConfig, SchedulerConfig};
use mail_bridge::error::{ChannelError, MailError};
use mail_bridge::notifier::Notifier;
use mail_bridge::pipeline::MailPipeline;
use mail_bridge::store::{Database, LibSqlBackend, OutboundAccount};

/// Maximum time any wait is allowed to take before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const ROOM: &str = "!bridge:example.com";

// ── Fakes ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct StubChat {
    sent: Mutex<Vec<(String, String)>>,
}

impl StubChat {
    fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    fn notifications(&self) -> usize {
        self.texts()
            .iter()
            .filter(|t| t.starts_with("You've got a new Email"))
            .count()
    }

    fn last(&self) -> String {
        self.texts().pop().unwrap_or_default()
    }
}

#[async_trait]
impl ChatChannel for StubChat {
    async fn send_text(&self, room: &str, text: &str) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push((room.into(), text.into()));
        Ok(())
    }
    async fn send_html(&self, room: &str, plain: &str, _html: &str) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push((room.into(), plain.into()));
        Ok(())
    }
    async fn download(&self, _url: &str, dest: &Path) -> Result<(), ChannelError> {
        std::fs::write(dest, b"file contents").map_err(|e| ChannelError::DownloadFailed {
            url: dest.display().to_string(),
            reason: e.to_string(),
        })
    }
    async fn join_room(&self, _room: &str) -> Result<(), ChannelError> {
        Ok(())
    }
    async fn leave_room(&self, _room: &str) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Each fetch returns the next queued batch.
#[derive(Default)]
struct StubMailbox {
    fetches: AtomicUsize,
    queue: Mutex<VecDeque<Vec<InboundMail>>>,
}

struct StubConnector(Arc<StubMailbox>);

struct StubSession(Arc<StubMailbox>);

#[async_trait]
impl MailboxConnector for StubConnector {
    async fn connect(&self, _p: &MailboxParams) -> Result<Box<dyn MailboxSession>, MailError> {
        Ok(Box::new(StubSession(Arc::clone(&self.0))))
    }
}

#[async_trait]
impl MailboxSession for StubSession {
    async fn fetch_new(&mut self) -> Result<Vec<InboundMail>, MailError> {
        let batch = self.0.queue.lock().unwrap().pop_front().unwrap_or_default();
        self.0.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(batch)
    }
    async fn list_mailboxes(&mut self) -> Result<Vec<String>, MailError> {
        Ok(vec!["INBOX".into()])
    }
    async fn logout(&mut self) {}
}

#[derive(Default)]
struct StubMailer {
    sent: Mutex<Vec<OutgoingMail>>,
}

#[async_trait]
impl Mailer for StubMailer {
    async fn send(&self, _account: &OutboundAccount, mail: &OutgoingMail) -> Result<(), MailError> {
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}

fn inbound(subject: &str, ts: i64, from: &str) -> InboundMail {
    InboundMail {
        uid: ts as u32,
        subject: subject.into(),
        internal_date: DateTime::from_timestamp(ts, 0).unwrap(),
        sender_addresses: vec![from.into()],
        from_display: from.into(),
        body: "Hello there".into(),
        attachments: vec![],
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Bridge {
    db: Arc<LibSqlBackend>,
    chat: Arc<StubChat>,
    mailbox: Arc<StubMailbox>,
    mailer: Arc<StubMailer>,
    dispatcher: Dispatcher,
    temp: tempfile::TempDir,
}

impl Bridge {
    async fn new() -> Self {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let chat = Arc::new(StubChat::default());
        let mailbox = Arc::new(StubMailbox::default());
        let mailer = Arc::new(StubMailer::default());
        let temp = tempfile::tempdir().unwrap();

        let pipeline = Arc::new(MailPipeline::new(db.clone(), Notifier::new(chat.clone())));
        let scheduler = PollScheduler::new(
            Arc::new(StubConnector(mailbox.clone())),
            pipeline,
            SchedulerConfig::default(),
        );
        let registry =
            AccountRegistry::new(db.clone(), scheduler, temp.path().to_path_buf(), 60, false);
        let compose = ComposeSessions::new(
            db.clone(),
            chat.clone(),
            mailer.clone(),
            temp.path().to_path_buf(),
            false,
        );
        let dispatcher = Dispatcher::new(
            db.clone(),
            chat.clone(),
            Arc::new(StubConnector(mailbox.clone())),
            registry,
            compose,
            Arc::new(BridgeConfig::default()),
        );
        Self {
            db,
            chat,
            mailbox,
            mailer,
            dispatcher,
            temp,
        }
    }

    async fn send(&self, content: MessageContent) {
        self.dispatcher
            .dispatch(ChatEvent::Message {
                room: ROOM.into(),
                sender: "@alice:example.com".into(),
                content,
            })
            .await;
    }

    async fn say(&self, text: &str) -> String {
        self.send(MessageContent::Text(text.into())).await;
        self.chat.last()
    }

    fn deliver(&self, batch: Vec<InboundMail>) {
        self.mailbox.queue.lock().unwrap().push_back(batch);
    }

    fn fetches(&self) -> usize {
        self.mailbox.fetches.load(Ordering::SeqCst)
    }

    /// Trigger a poll cycle and wait for it to finish.
    async fn check(&self) {
        let before = self.fetches();
        self.say("!check").await;
        wait_until(|| async { self.fetches() > before }).await;
        // The batch is processed after the fetch returns.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn setup_imap(&self) {
        let reply = self
            .say("!setup imap, mail.example.com:993, me@example.com, pw, INBOX, false")
            .await;
        assert!(reply.starts_with("Bridge created successfully!"), "{reply}");
        wait_until(|| async { self.fetches() >= 1 }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn room_pk(&self) -> i64 {
        self.db.get_room(ROOM).await.unwrap().unwrap().id
    }

    async fn shutdown(&self) {
        self.dispatcher.registry().scheduler().shutdown().await;
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn setup_creates_poller_and_rejects_duplicate() {
    let bridge = Bridge::new().await;
    bridge.setup_imap().await;

    let room = bridge.db.get_room(ROOM).await.unwrap().unwrap();
    assert_eq!(room.poll_interval, 60);
    assert!(bridge.dispatcher.registry().scheduler().is_running(ROOM).await);

    let reply = bridge
        .say("!setup imap, mail.example.com:993, me@example.com, pw, INBOX, false")
        .await;
    assert!(reply.contains("already existing"));
    bridge.shutdown().await;
}

#[tokio::test]
async fn same_mail_twice_notifies_once() {
    let bridge = Bridge::new().await;
    bridge.setup_imap().await;

    bridge.deliver(vec![inbound("Invoice", 1_700_000_000, "billing@shop.com")]);
    bridge.check().await;
    bridge.deliver(vec![inbound("Invoice", 1_700_000_000, "billing@shop.com")]);
    bridge.check().await;

    assert_eq!(bridge.chat.notifications(), 1);
    let pk = bridge.room_pk().await;
    assert_eq!(bridge.db.count_seen_mail(pk).await.unwrap(), 1);
    bridge.shutdown().await;
}

#[tokio::test]
async fn blocklisted_sender_is_seen_but_not_notified() {
    let bridge = Bridge::new().await;
    bridge.setup_imap().await;
    assert_eq!(
        bridge.say("!blocklist add *@spam.com").await,
        "Success adding *@spam.com to blocklist!"
    );

    bridge.deliver(vec![inbound("Cheap pills", 1_700_000_100, "x@spam.com")]);
    bridge.check().await;

    assert_eq!(bridge.chat.notifications(), 0);
    let pk = bridge.room_pk().await;
    assert_eq!(bridge.db.count_seen_mail(pk).await.unwrap(), 1);
    bridge.shutdown().await;
}

#[tokio::test]
async fn mailbox_change_resets_history_silently() {
    let bridge = Bridge::new().await;
    bridge.setup_imap().await;
    let pk = bridge.room_pk().await;
    bridge.db.insert_seen_mail("Before1", pk).await.unwrap();

    bridge.deliver(vec![inbound("Archived", 1_600_000_000, "old@example.com")]);
    let before = bridge.fetches();
    assert_eq!(bridge.say("!setmailbox Archive").await, "Mailbox updated");
    wait_until(|| async { bridge.fetches() > before }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!bridge.db.has_seen_mail("Before1", pk).await.unwrap());
    assert!(bridge.db.has_seen_mail("Archived1600000000", pk).await.unwrap());
    assert_eq!(bridge.chat.notifications(), 0);

    bridge.deliver(vec![inbound("Fresh", 1_700_000_200, "new@example.com")]);
    bridge.check().await;
    assert_eq!(bridge.chat.notifications(), 1);
    bridge.shutdown().await;
}

#[tokio::test]
async fn write_subject_body_send() {
    let bridge = Bridge::new().await;
    bridge
        .say("!setup smtp, smtp.example.com:587, me@example.com, pw")
        .await;

    bridge.say("!write a@b.com").await;
    bridge.say("Quarterly report").await;
    bridge.say("Numbers are up.").await;
    assert_eq!(bridge.say("!send").await, "Message sent successfully");

    let sent = bridge.mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["a@b.com"]);
    assert_eq!(sent[0].subject, "Quarterly report");
    assert_eq!(sent[0].text, "Numbers are up.\r\n");
}

#[tokio::test]
async fn cancel_leaves_no_session_or_attachments() {
    let bridge = Bridge::new().await;
    bridge
        .say("!setup smtp, smtp.example.com:587, me@example.com, pw")
        .await;

    bridge.say("!write a@b.com c@d.com").await;
    bridge.say("With attachment").await;
    bridge
        .send(MessageContent::File {
            name: "report.pdf".into(),
            url: "mxc://example.com/report".into(),
        })
        .await;
    assert!(bridge.chat.last().ends_with("_report.pdf attached!"));
    let session = bridge.db.get_compose_session(ROOM).await.unwrap().unwrap();

    assert_eq!(bridge.say("!cancel").await, "Mail canceled");

    assert!(bridge.db.get_compose_session(ROOM).await.unwrap().is_none());
    assert!(bridge.db.list_attachments(session.id).await.unwrap().is_empty());
    assert_eq!(std::fs::read_dir(bridge.temp.path()).unwrap().count(), 0);
    assert!(bridge.mailer.sent.lock().unwrap().is_empty());
}
