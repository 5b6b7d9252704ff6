//! Compose sessions: turn a run of chat messages into one outgoing mail.
//!
//! ```text
//! Idle ──!write──▶ AwaitingSubject ──text──▶ Composing ──!send──▶ Idle
//!                        │                     │  ▲
//!                        └──────!cancel────────┤  └── text line / file upload / !rm
//!                                              ▼
//!                                             Idle
//! ```
//!
//! Sessions live in the store, so the state of a room is whatever the store
//! says. A room has at most one session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::channels::{ChatChannel, Mailer, MessageContent, OutgoingAttachment, OutgoingMail};
use crate::error::{DatabaseError, MailError};
use crate::markdown;
use crate::store::{AttachmentRecord, ComposeRecord, Database};

pub const SUBJECT_PROMPT: &str = "Now send me the subject of your email";
pub const BODY_PROMPT: &str = "Now send me the content of the email. One message is one line. If you want to send or cancel enter !send or !cancel";
pub const SETUP_SMTP_HINT: &str = "To fix this error you have to run !setup smtp .... again";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeState {
    Idle,
    AwaitingSubject,
    Composing,
}

impl ComposeState {
    fn of(record: &ComposeRecord) -> Self {
        if record.subject.trim().is_empty() {
            ComposeState::AwaitingSubject
        } else {
            ComposeState::Composing
        }
    }
}

/// Parsed `!write` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteArgs {
    pub receivers: Vec<String>,
    pub markdown: Option<bool>,
}

/// Parse `!write` arguments: space separated recipients, optionally followed
/// by a markdown flag. Invalid and repeated addresses are dropped.
pub fn parse_write_args(args: &str) -> WriteArgs {
    let mut tokens: Vec<&str> = args.split_whitespace().collect();
    let markdown = match tokens.last().map(|t| t.to_ascii_lowercase()) {
        Some(last) if last == "true" || last == "false" => {
            tokens.pop();
            Some(last == "true")
        }
        _ => None,
    };

    let mut receivers: Vec<String> = Vec::new();
    for token in tokens {
        let address = token.trim_matches(',');
        if !is_address(address) || receivers.iter().any(|r| r == address) {
            continue;
        }
        receivers.push(address.to_string());
    }
    WriteArgs {
        receivers,
        markdown,
    }
}

fn is_address(s: &str) -> bool {
    s.contains('@') && s.contains('.')
}

/// Keep only the final path component of an uploaded file name.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." {
        "attachment".to_string()
    } else {
        base.to_string()
    }
}

/// Delete the temp files of `attachments`. Missing files are ignored.
pub async fn remove_attachment_files(temp_dir: &Path, attachments: &[AttachmentRecord]) {
    for attachment in attachments {
        let path = temp_dir.join(&attachment.stored_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Could not remove attachment file"),
        }
    }
}

pub struct ComposeSessions {
    db: Arc<dyn Database>,
    chat: Arc<dyn ChatChannel>,
    mailer: Arc<dyn Mailer>,
    temp_dir: PathBuf,
    markdown_default: bool,
}

impl ComposeSessions {
    pub fn new(
        db: Arc<dyn Database>,
        chat: Arc<dyn ChatChannel>,
        mailer: Arc<dyn Mailer>,
        temp_dir: PathBuf,
        markdown_default: bool,
    ) -> Self {
        Self {
            db,
            chat,
            mailer,
            temp_dir,
            markdown_default,
        }
    }

    async fn reply(&self, room: &str, text: &str) {
        if let Err(e) = self.chat.send_text(room, text).await {
            warn!(room = %room, error = %e, "Failed to reply");
        }
    }

    pub async fn state(&self, room: &str) -> Result<ComposeState, DatabaseError> {
        Ok(self
            .db
            .get_compose_session(room)
            .await?
            .map_or(ComposeState::Idle, |s| ComposeState::of(&s)))
    }

    /// `!write`: open a session for `room`, replacing any open one.
    pub async fn start(&self, room: &str, args: &str) -> Result<(), DatabaseError> {
        if self.db.accounts_for(room).await?.outbound.is_none() {
            self.reply(
                room,
                "You have to setup an smtp account. Type !help or !login for more information",
            )
            .await;
            return Ok(());
        }
        if args.trim().is_empty() {
            self.reply(room, "Usage: !write <emailaddress> [markdown true/false]")
                .await;
            return Ok(());
        }

        let parsed = parse_write_args(args);
        if parsed.receivers.is_empty() {
            self.reply(
                room,
                &format!("this is an email: max@google.de\r\nthis is no email: {}", args.trim()),
            )
            .await;
            return Ok(());
        }

        let Some(room_row) = self.db.get_room(room).await? else {
            self.reply(room, "You have to login to use this command!").await;
            return Ok(());
        };
        self.discard(room).await?;

        let markdown = parsed.markdown.unwrap_or(self.markdown_default);
        self.db
            .create_compose_session(room_row.id, &parsed.receivers, markdown)
            .await?;
        info!(room = %room, receivers = parsed.receivers.len(), markdown, "Compose session opened");
        self.reply(room, SUBJECT_PROMPT).await;
        Ok(())
    }

    /// Feed a non-command message into the room's open session.
    pub async fn handle(&self, room: &str, content: &MessageContent) -> Result<(), DatabaseError> {
        let Some(session) = self.db.get_compose_session(room).await? else {
            return Ok(());
        };

        match (ComposeState::of(&session), content) {
            (ComposeState::AwaitingSubject, MessageContent::Text(text)) if !text.trim().is_empty() => {
                self.db.set_compose_subject(session.id, text).await?;
                self.reply(room, BODY_PROMPT).await;
            }
            (ComposeState::AwaitingSubject, _) => {
                self.reply(room, "You have to send a text for subject!").await;
            }
            (_, MessageContent::Text(text)) => {
                self.db
                    .append_compose_body(session.id, &format!("{text}\r\n"))
                    .await?;
            }
            (_, MessageContent::File { name, url }) => {
                self.attach(room, &session, name, url).await?;
            }
        }
        Ok(())
    }

    async fn attach(
        &self,
        room: &str,
        session: &ComposeRecord,
        name: &str,
        url: &str,
    ) -> Result<(), DatabaseError> {
        let original = sanitize_file_name(name);
        let now = Utc::now().timestamp();
        let mut stored = format!("{now}_{original}");
        let mut n = 1;
        while tokio::fs::try_exists(self.temp_dir.join(&stored))
            .await
            .unwrap_or(false)
        {
            stored = format!("{now}_{n}_{original}");
            n += 1;
        }
        let path = self.temp_dir.join(&stored);

        if let Err(e) = self.chat.download(url, &path).await {
            warn!(room = %room, error = %e, "Attachment download failed");
            self.reply(room, &format!("Couldn't download file: {e}")).await;
            return Ok(());
        }
        if let Err(e) = self.db.add_attachment(session.id, &stored, &original).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
        self.reply(room, &format!("File {stored} attached!")).await;
        Ok(())
    }

    /// `!send`: deliver the mail and close the session.
    pub async fn send(&self, room: &str) -> Result<(), DatabaseError> {
        let Some(session) = self.db.get_compose_session(room).await? else {
            return Ok(());
        };
        if ComposeState::of(&session) == ComposeState::AwaitingSubject {
            self.reply(room, "You have to send me the subject first!").await;
            return Ok(());
        }

        let Some(account) = self.db.get_outbound_account(room).await? else {
            self.reply(room, "There is no smtp account for this room anymore. Mail canceled")
                .await;
            self.close(room, session.id).await?;
            return Ok(());
        };

        let attachments = self.db.list_attachments(session.id).await?;
        for attachment in &attachments {
            self.reply(room, &format!("Attaching file: {}", attachment.original_name))
                .await;
        }

        let (text, html) = if session.markdown {
            (
                markdown::plain_alternative(&session.body),
                Some(markdown::email_html(&session.body)),
            )
        } else {
            (session.body.clone(), None)
        };
        let mail = OutgoingMail {
            from: account.username.clone(),
            to: session.receivers.clone(),
            subject: session.subject.clone(),
            text,
            html,
            attachments: attachments
                .iter()
                .map(|a| OutgoingAttachment {
                    file_name: a.original_name.clone(),
                    path: self.temp_dir.join(&a.stored_name),
                })
                .collect(),
        };

        self.reply(room, "Sending...").await;
        match self.mailer.send(&account, &mail).await {
            Ok(()) => {
                info!(room = %room, receivers = mail.to.len(), "Mail sent from compose session");
                self.reply(room, "Message sent successfully").await;
                self.close(room, session.id).await?;
            }
            Err(MailError::Io(e)) => {
                warn!(room = %room, error = %e, "Attachment unreadable, keeping session");
                self.reply(
                    room,
                    &format!(
                        "Couldn't read an attachment: {e}\r\nRemove it with !rm <name> and !send again"
                    ),
                )
                .await;
            }
            Err(e) => {
                error!(code = 53, room = %room, permanent = e.is_permanent(), error = %e, "Sending mail failed");
                self.reply(room, &format!("An server-error occured Errorcode: #53\r\n{e}"))
                    .await;
                self.db.delete_outbound_account(room).await?;
                self.reply(room, SETUP_SMTP_HINT).await;
                self.close(room, session.id).await?;
            }
        }
        Ok(())
    }

    /// `!cancel`: drop the session and its files.
    pub async fn cancel(&self, room: &str) -> Result<(), DatabaseError> {
        if self.discard(room).await? {
            self.reply(room, "Mail canceled").await;
        }
        Ok(())
    }

    /// `!rm <name>`: remove one attachment by its stored name.
    pub async fn remove_attachment(&self, room: &str, name: &str) -> Result<(), DatabaseError> {
        let Some(session) = self.db.get_compose_session(room).await? else {
            return Ok(());
        };
        let name = name.trim();
        if name.is_empty() {
            self.reply(room, "Usage: !rm <file name>").await;
            return Ok(());
        }

        if !self.db.remove_attachment(session.id, name).await? {
            self.reply(room, &format!("Couldn't delete attachment: no attachment named {name}"))
                .await;
            return Ok(());
        }
        remove_attachment_files(
            &self.temp_dir,
            &[AttachmentRecord {
                session_id: session.id,
                stored_name: name.to_string(),
                original_name: String::new(),
            }],
        )
        .await;
        self.reply(room, "Attachment deleted!").await;
        Ok(())
    }

    /// Delete the room's session, if any. Returns whether one existed.
    pub async fn discard(&self, room: &str) -> Result<bool, DatabaseError> {
        match self.db.get_compose_session(room).await? {
            Some(session) => {
                self.close(room, session.id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&self, room: &str, session_id: i64) -> Result<(), DatabaseError> {
        let attachments = self.db.delete_compose_session(session_id).await?;
        remove_attachment_files(&self.temp_dir, &attachments).await;
        info!(room = %room, attachments = attachments.len(), "Compose session closed");
        Ok(())
    }

    /// Drop every session, e.g. ones left over from before a restart.
    pub async fn discard_all(&self) -> Result<usize, DatabaseError> {
        let attachments = self.db.delete_all_compose_sessions().await?;
        remove_attachment_files(&self.temp_dir, &attachments).await;
        Ok(attachments.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    use crate::store::{LibSqlBackend, NewOutboundAccount};
    use crate::testing::{FakeChat, FakeMailer};

    const ROOM: &str = "!room:example.com";

    struct Harness {
        db: Arc<LibSqlBackend>,
        chat: Arc<FakeChat>,
        mailer: Arc<FakeMailer>,
        sessions: ComposeSessions,
        temp: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let room = db.ensure_room(ROOM, 30, false).await.unwrap();
        db.insert_outbound_account(
            room.id,
            &NewOutboundAccount {
                host: "smtp.example.com".into(),
                port: 587,
                username: "me@example.com".into(),
                password: SecretString::from("pw".to_string()),
                ignore_cert: false,
            },
        )
        .await
        .unwrap();
        let chat = Arc::new(FakeChat::default());
        let mailer = Arc::new(FakeMailer::default());
        let temp = tempfile::tempdir().unwrap();
        let sessions = ComposeSessions::new(
            db.clone(),
            chat.clone(),
            mailer.clone(),
            temp.path().to_path_buf(),
            false,
        );
        Harness {
            db,
            chat,
            mailer,
            sessions,
            temp,
        }
    }

    fn text(s: &str) -> MessageContent {
        MessageContent::Text(s.into())
    }

    fn file(name: &str) -> MessageContent {
        MessageContent::File {
            name: name.into(),
            url: "mxc://example.com/abc".into(),
        }
    }

    #[test]
    fn write_args_dedupe_and_validate() {
        let args = parse_write_args("a@b.com nope a@b.com, c@d.org true");
        assert_eq!(args.receivers, vec!["a@b.com", "c@d.org"]);
        assert_eq!(args.markdown, Some(true));

        let args = parse_write_args("a@b.com");
        assert_eq!(args.markdown, None);

        assert!(parse_write_args("nobody false").receivers.is_empty());
    }

    #[test]
    fn file_names_lose_their_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\docs\\a.pdf"), "a.pdf");
        assert_eq!(sanitize_file_name(".."), "attachment");
        assert_eq!(sanitize_file_name("report 1.pdf"), "report 1.pdf");
    }

    #[tokio::test]
    async fn write_subject_body_send() {
        let h = harness().await;
        h.sessions.start(ROOM, "a@b.com").await.unwrap();
        assert_eq!(h.chat.last(ROOM), SUBJECT_PROMPT);
        assert_eq!(h.sessions.state(ROOM).await.unwrap(), ComposeState::AwaitingSubject);

        h.sessions.handle(ROOM, &text("Greetings")).await.unwrap();
        assert_eq!(h.chat.last(ROOM), BODY_PROMPT);
        assert_eq!(h.sessions.state(ROOM).await.unwrap(), ComposeState::Composing);

        h.sessions.handle(ROOM, &text("line one")).await.unwrap();
        h.sessions.handle(ROOM, &text("line two")).await.unwrap();
        h.sessions.send(ROOM).await.unwrap();

        let sent = h.mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (from, mail) = &sent[0];
        assert_eq!(from, "me@example.com");
        assert_eq!(mail.to, vec!["a@b.com"]);
        assert_eq!(mail.subject, "Greetings");
        assert_eq!(mail.text, "line one\r\nline two\r\n");
        assert!(mail.html.is_none());
        drop(sent);

        assert_eq!(h.chat.last(ROOM), "Message sent successfully");
        assert_eq!(h.sessions.state(ROOM).await.unwrap(), ComposeState::Idle);
    }

    #[tokio::test]
    async fn markdown_session_sends_html() {
        let h = harness().await;
        h.sessions.start(ROOM, "a@b.com true").await.unwrap();
        h.sessions.handle(ROOM, &text("Subject")).await.unwrap();
        h.sessions.handle(ROOM, &text("**bold**")).await.unwrap();
        h.sessions.send(ROOM).await.unwrap();

        let sent = h.mailer.sent.lock().unwrap();
        let html = sent[0].1.html.as_deref().unwrap();
        assert!(html.contains("<strong>bold</strong>"));
        assert_eq!(sent[0].1.text, "**bold**\r\n");
    }

    #[tokio::test]
    async fn write_without_valid_recipient() {
        let h = harness().await;
        h.sessions.start(ROOM, "not-an-address").await.unwrap();
        assert!(h.chat.last(ROOM).contains("this is no email: not-an-address"));
        assert_eq!(h.sessions.state(ROOM).await.unwrap(), ComposeState::Idle);
    }

    #[tokio::test]
    async fn write_requires_outbound_account() {
        let h = harness().await;
        h.db.delete_outbound_account(ROOM).await.unwrap();
        h.sessions.start(ROOM, "a@b.com").await.unwrap();
        assert!(h.chat.last(ROOM).contains("setup an smtp account"));
        assert_eq!(h.sessions.state(ROOM).await.unwrap(), ComposeState::Idle);
    }

    #[tokio::test]
    async fn file_in_subject_state_is_rejected() {
        let h = harness().await;
        h.sessions.start(ROOM, "a@b.com").await.unwrap();
        h.sessions.handle(ROOM, &file("a.txt")).await.unwrap();
        assert_eq!(h.chat.last(ROOM), "You have to send a text for subject!");
        assert_eq!(h.sessions.state(ROOM).await.unwrap(), ComposeState::AwaitingSubject);
    }

    #[tokio::test]
    async fn cancel_leaves_no_rows_or_files() {
        let h = harness().await;
        *h.chat.download_body.lock().unwrap() = b"data".to_vec();
        h.sessions.start(ROOM, "a@b.com").await.unwrap();
        h.sessions.handle(ROOM, &text("Subject")).await.unwrap();
        h.sessions.handle(ROOM, &file("notes.txt")).await.unwrap();

        let session = h.db.get_compose_session(ROOM).await.unwrap().unwrap();
        let attachments = h.db.list_attachments(session.id).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].original_name, "notes.txt");
        let path = h.temp.path().join(&attachments[0].stored_name);
        assert!(path.exists());

        h.sessions.cancel(ROOM).await.unwrap();
        assert_eq!(h.chat.last(ROOM), "Mail canceled");
        assert!(h.db.get_compose_session(ROOM).await.unwrap().is_none());
        assert!(h.db.list_attachments(session.id).await.unwrap().is_empty());
        assert!(!path.exists());
        assert!(h.mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn attachments_are_sent_and_removable() {
        let h = harness().await;
        h.sessions.start(ROOM, "a@b.com").await.unwrap();
        h.sessions.handle(ROOM, &text("Files")).await.unwrap();
        h.sessions.handle(ROOM, &file("keep.txt")).await.unwrap();
        h.sessions.handle(ROOM, &file("drop.txt")).await.unwrap();

        let session = h.db.get_compose_session(ROOM).await.unwrap().unwrap();
        let drop_name = h
            .db
            .list_attachments(session.id)
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.original_name == "drop.txt")
            .unwrap()
            .stored_name;

        h.sessions.remove_attachment(ROOM, "missing.txt").await.unwrap();
        assert!(h.chat.last(ROOM).starts_with("Couldn't delete attachment"));

        h.sessions.remove_attachment(ROOM, &drop_name).await.unwrap();
        assert_eq!(h.chat.last(ROOM), "Attachment deleted!");
        assert!(!h.temp.path().join(&drop_name).exists());

        h.sessions.send(ROOM).await.unwrap();
        let sent = h.mailer.sent.lock().unwrap();
        assert_eq!(sent[0].1.attachments.len(), 1);
        assert_eq!(sent[0].1.attachments[0].file_name, "keep.txt");
        assert!(h.chat.texts(ROOM).contains(&"Attaching file: keep.txt".to_string()));
    }

    #[tokio::test]
    async fn send_failure_revokes_outbound_account() {
        let h = harness().await;
        h.sessions.start(ROOM, "a@b.com").await.unwrap();
        h.sessions.handle(ROOM, &text("Subject")).await.unwrap();
        *h.mailer.fail_with.lock().unwrap() = Some(MailError::Auth {
            username: "me@example.com".into(),
        });

        h.sessions.send(ROOM).await.unwrap();

        assert_eq!(h.chat.last(ROOM), SETUP_SMTP_HINT);
        assert!(h.db.get_outbound_account(ROOM).await.unwrap().is_none());
        assert_eq!(h.sessions.state(ROOM).await.unwrap(), ComposeState::Idle);
    }

    #[tokio::test]
    async fn unreadable_attachment_keeps_session() {
        let h = harness().await;
        h.sessions.start(ROOM, "a@b.com").await.unwrap();
        h.sessions.handle(ROOM, &text("Subject")).await.unwrap();
        h.sessions.handle(ROOM, &file("a.txt")).await.unwrap();
        let session = h.db.get_compose_session(ROOM).await.unwrap().unwrap();
        let stored = h.db.list_attachments(session.id).await.unwrap()[0]
            .stored_name
            .clone();
        std::fs::remove_file(h.temp.path().join(&stored)).unwrap();

        h.sessions.send(ROOM).await.unwrap();

        assert!(h.chat.last(ROOM).starts_with("Couldn't read an attachment"));
        assert!(h.db.get_outbound_account(ROOM).await.unwrap().is_some());
        assert_eq!(h.sessions.state(ROOM).await.unwrap(), ComposeState::Composing);
    }

    #[tokio::test]
    async fn new_write_replaces_open_session() {
        let h = harness().await;
        h.sessions.start(ROOM, "a@b.com").await.unwrap();
        h.sessions.handle(ROOM, &text("Old subject")).await.unwrap();
        h.sessions.start(ROOM, "c@d.com").await.unwrap();

        let session = h.db.get_compose_session(ROOM).await.unwrap().unwrap();
        assert_eq!(session.receivers, vec!["c@d.com"]);
        assert!(session.subject.is_empty());
    }

    #[tokio::test]
    async fn send_before_subject_is_refused() {
        let h = harness().await;
        h.sessions.start(ROOM, "a@b.com").await.unwrap();
        h.sessions.send(ROOM).await.unwrap();
        assert!(h.mailer.sent.lock().unwrap().is_empty());
        assert_eq!(h.sessions.state(ROOM).await.unwrap(), ComposeState::AwaitingSubject);
    }

    #[tokio::test]
    async fn discard_all_clears_leftovers() {
        let h = harness().await;
        h.sessions.start(ROOM, "a@b.com").await.unwrap();
        h.sessions.discard_all().await.unwrap();
        assert_eq!(h.sessions.state(ROOM).await.unwrap(), ComposeState::Idle);
    }
}
