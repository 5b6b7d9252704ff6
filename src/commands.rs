//! Command dispatcher: routes chat events to handlers.
//!
//! Routing is two-level. A room with an open compose session sends plain
//! messages and `!send`/`!cancel`/`!rm` to the session and refuses every
//! other command. Otherwise the leading `!word` selects a handler and plain
//! text is ignored.
//!
//! [`RoomQueues`] sits in front of the dispatcher: each room gets one worker
//! that handles its events in arrival order, while rooms run in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::accounts::AccountRegistry;
use crate::channels::matrix::server_of;
use crate::channels::smtp::DEFAULT_SMTP_PORT;
use crate::channels::{ChatChannel, ChatEvent, MailboxConnector, MailboxParams, MessageContent};
use crate::compose::{ComposeSessions, ComposeState};
use crate::config::BridgeConfig;
use crate::error::{BindError, DatabaseError};
use crate::pipeline::BlocklistFilter;
use crate::pipeline::rules::is_valid_pattern;
use crate::store::{Database, NewInboundAccount, NewOutboundAccount};

pub const DEFAULT_IMAP_PORT: u16 = 993;
pub const DEFAULT_MAILBOX: &str = "INBOX";

const HELP_TEXT: &str = "-------- Help --------\r\n\
!setup imap/smtp, host:port, username(em@ail.com), password, <mailbox (only for imap)>, ignoreSSLcert(true/false) - creates a bridge for this room\r\n\
!login - shows how to use !setup\r\n\
!ping - gets information about the email bridge for this room\r\n\
!help - shows this command help overview\r\n\
!write (receiver(s) email(s) splitted by space!) <markdown true/false> - sends an email to the given addresses\r\n\
!view - run it to see available options\r\n\
!setmailbox (mailbox) - changes the mailbox for the room\r\n\
!sethtml (on/off or true/false) - sets HTML-rendering for messages on/off\r\n\
!blocklist <add/delete/clear/view> <email address> - hides mail from the given senders\r\n\
!check - checks for new mail right now\r\n\
!logout - remove email bridge from current room\r\n\
!leave - unbridge the current room and kick the bot\r\n\
\r\n---- Email writing commands ----\r\n\
!send - sends the email\r\n\
!cancel - discards the email\r\n\
!rm <file> - removes given attachment from email";

const LOGIN_TEXT: &str = "Okay send me the data of your server(at first IMAPs) in the given order, splitted by a comma(,)\r\n\
!setup imap, host:port, username/email, password, mailbox, ignoreSSL\r\n\
!setup smtp, host:port, email, password, ignoreSSL\r\n\r\n\
Example: \r\n\
!setup imap, host.com:993, mail@host.com, w0rdp4ss, INBOX, false\r\n\
or\r\n\
!setup smtp, host.com:587, mail@host.com, w0rdp4ss, false";

const SETUP_SYNTAX: &str = "Wrong syntax :/\r\nExample: \r\n\
!setup imap, host.com:993, mail@host.com, w0rdp4ss, INBOX, false\r\nor\r\n\
!setup smtp, host.com:587, mail@host.com, w0rdp4ss, false";

const VIEW_HELP: &str = "Available options:\n\n\
mb/mailbox\t-\tViews the current used mailbox\n\
mbs/mailboxes\t-\tView the available mailboxes\n\
bl/blocklist\t-\tViews the list of blocked addresses";

const BLOCKLIST_USAGE: &str = "Usage: !blocklist <add/delete/clear/view> <email address>\n\
Don't show any emails from a given email address.\n\
Wildcards (like *@evilEmailAddress.com) are supported";

const NEEDS_IMAP: &str = "You have to setup an IMAP account to use this command. Use !setup or !login for more informations";
const NEEDS_LOGIN: &str = "You have to login to use this command!";
const GREETING: &str = "Hey you have invited me to a new room. Enter !login to bridge this room to a Mail account";

/// A parsed `!command` with its argument text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Help,
    Login,
    Logout,
    Setup(&'a str),
    Write(&'a str),
    Ping,
    SetMailbox(&'a str),
    SetHtml(&'a str),
    Leave,
    Blocklist(&'a str),
    View(&'a str),
    Check,
    Send,
    Cancel,
    Remove(&'a str),
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    /// Parse a message. Returns `None` for text that is not a command.
    pub fn parse(text: &'a str) -> Option<Self> {
        let text = text.trim();
        if !text.starts_with('!') {
            return None;
        }
        let (word, rest) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
        let rest = rest.trim();
        Some(match word {
            "!help" => Command::Help,
            "!login" => Command::Login,
            "!logout" => Command::Logout,
            "!setup" => Command::Setup(rest),
            "!write" => Command::Write(rest),
            "!ping" => Command::Ping,
            "!setmailbox" => Command::SetMailbox(rest),
            "!sethtml" => Command::SetHtml(rest),
            "!leave" => Command::Leave,
            "!blocklist" | "!bl" => Command::Blocklist(rest),
            "!view" => Command::View(rest),
            "!check" => Command::Check,
            "!send" => Command::Send,
            "!cancel" => Command::Cancel,
            "!rm" => Command::Remove(rest),
            other => Command::Unknown(other),
        })
    }
}

/// A validated `!setup` request.
#[derive(Debug)]
pub enum SetupRequest {
    Imap(NewInboundAccount),
    Smtp {
        account: NewOutboundAccount,
        /// No port was given and the default is used.
        default_port: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    WrongSyntax,
    UnknownKind(String),
    InvalidPort,
}

fn split_host(host: &str, default_port: u16) -> Result<(String, u16, bool), SetupError> {
    match host.rsplit_once(':') {
        Some((name, port)) => {
            let port = port.trim().parse().map_err(|_| SetupError::InvalidPort)?;
            Ok((name.to_string(), port, false))
        }
        None => Ok((host.to_string(), default_port, true)),
    }
}

/// `1`, `t`, `T`, `TRUE`, `true` and `True` are true. The false spellings
/// and anything unrecognised are false.
fn parse_flag(field: Option<&&str>) -> bool {
    field.is_some_and(|f| matches!(f.trim(), "1" | "t" | "T" | "TRUE" | "true" | "True"))
}

/// Parse `kind, host[:port], username, password[, mailbox][, ignoreSSL]`.
pub fn parse_setup(args: &str) -> Result<SetupRequest, SetupError> {
    let fields: Vec<&str> = args.split(',').map(str::trim).collect();
    if !(4..=6).contains(&fields.len()) {
        return Err(SetupError::WrongSyntax);
    }
    let kind = fields[0].to_ascii_lowercase();
    let host = fields[1].replace(' ', "");
    let username = fields[2].replace(' ', "");
    let password = fields[3].to_string();
    if host.is_empty() || username.is_empty() || password.is_empty() {
        return Err(SetupError::WrongSyntax);
    }

    match kind.as_str() {
        "imap" => {
            let (host, port, _) = split_host(&host, DEFAULT_IMAP_PORT)?;
            let mailbox = fields
                .get(4)
                .map(|m| m.trim())
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_MAILBOX)
                .to_string();
            Ok(SetupRequest::Imap(NewInboundAccount {
                host,
                port,
                username,
                password: SecretString::from(password),
                mailbox,
                ignore_cert: parse_flag(fields.get(5)),
            }))
        }
        "smtp" => {
            let (host, port, default_port) = split_host(&host, DEFAULT_SMTP_PORT)?;
            let ignore_cert = if fields.len() >= 5 {
                parse_flag(fields.last())
            } else {
                false
            };
            Ok(SetupRequest::Smtp {
                account: NewOutboundAccount {
                    host,
                    port,
                    username,
                    password: SecretString::from(password),
                    ignore_cert,
                },
                default_port,
            })
        }
        _ => Err(SetupError::UnknownKind(fields[0].to_string())),
    }
}

fn format_list(title: &str, items: &[String]) -> String {
    let mut out = title.to_string();
    for item in items {
        out.push_str("\r\n- ");
        out.push_str(item);
    }
    out
}

pub struct Dispatcher {
    db: Arc<dyn Database>,
    chat: Arc<dyn ChatChannel>,
    connector: Arc<dyn MailboxConnector>,
    registry: AccountRegistry,
    compose: ComposeSessions,
    blocklist: BlocklistFilter,
    config: Arc<BridgeConfig>,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        chat: Arc<dyn ChatChannel>,
        connector: Arc<dyn MailboxConnector>,
        registry: AccountRegistry,
        compose: ComposeSessions,
        config: Arc<BridgeConfig>,
    ) -> Self {
        Self {
            blocklist: BlocklistFilter::new(Arc::clone(&db)),
            db,
            chat,
            connector,
            registry,
            compose,
            config,
        }
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    async fn reply(&self, room: &str, text: &str) {
        if let Err(e) = self.chat.send_text(room, text).await {
            warn!(room = %room, error = %e, "Failed to reply");
        }
    }

    /// Log a persistence failure and tell the room which code to report.
    async fn server_error(&self, room: &str, code: u16, err: impl std::fmt::Display) {
        error!(code, room = %room, error = %err, "Persistence failure");
        self.reply(
            room,
            &format!("Something went wrong! Contact the admin. Errorcode: #{code:02}"),
        )
        .await;
    }

    pub async fn dispatch(&self, event: ChatEvent) {
        match event {
            ChatEvent::Invite { room, inviter } => self.on_invite(&room, &inviter).await,
            ChatEvent::Left { room } => {
                match self.registry.unbind(&room).await {
                    Ok(true) => info!(room = %room, "Bot left room, bridge removed"),
                    Ok(false) => {}
                    Err(e) => error!(code = 65, room = %room, error = %e, "Unbinding left room failed"),
                }
            }
            ChatEvent::Message {
                room,
                sender,
                content,
            } => self.on_message(&room, &sender, &content).await,
        }
    }

    async fn on_invite(&self, room: &str, inviter: &str) {
        if self.config.is_server_allowed(server_of(inviter)) {
            if let Err(e) = self.chat.join_room(room).await {
                warn!(room = %room, error = %e, "Could not join room");
                return;
            }
            info!(room = %room, inviter = %inviter, "Joined room");
            self.reply(room, GREETING).await;
        } else {
            info!(
                room = %room,
                inviter = %inviter,
                "Declined invite, server not in allowed_servers"
            );
            if let Err(e) = self.chat.leave_room(room).await {
                warn!(room = %room, error = %e, "Could not decline invite");
            }
        }
    }

    async fn on_message(&self, room: &str, sender: &str, content: &MessageContent) {
        let state = match self.compose.state(room).await {
            Ok(state) => state,
            Err(e) => return self.server_error(room, 41, e).await,
        };
        let command = match content {
            MessageContent::Text(text) => Command::parse(text),
            MessageContent::File { .. } => None,
        };

        if state != ComposeState::Idle {
            let result = match command {
                Some(Command::Send) => self.compose.send(room).await,
                Some(Command::Cancel) => self.compose.cancel(room).await,
                Some(Command::Remove(name)) => self.compose.remove_attachment(room, name).await,
                // Starts over: the open session is torn down first.
                Some(Command::Write(args)) => self.compose.start(room, args).await,
                // Lines such as "!!! urgent" are body text, not commands.
                Some(Command::Unknown(_)) | None => self.compose.handle(room, content).await,
                Some(_) => {
                    self.reply(
                        room,
                        "You are writing an email. Finish it with !send or discard it with !cancel first",
                    )
                    .await;
                    Ok(())
                }
            };
            if let Err(e) = result {
                self.server_error(room, 43, &e).await;
                if let Err(e) = self.compose.discard(room).await {
                    error!(code = 40, room = %room, error = %e, "Discarding compose session failed");
                }
            }
            return;
        }

        let Some(command) = command else {
            return;
        };
        info!(room = %room, sender = %sender, command = command_name(&command), "Command");
        self.run(room, command).await;
    }

    async fn run(&self, room: &str, command: Command<'_>) {
        match command {
            Command::Help => self.reply(room, HELP_TEXT).await,
            Command::Login => self.reply(room, LOGIN_TEXT).await,
            Command::Logout => match self.registry.unbind(room).await {
                Ok(_) => self.reply(room, "Successfully logged out").await,
                Err(e) => self.server_error(room, 2, e).await,
            },
            Command::Leave => self.leave(room).await,
            Command::Setup(args) => self.setup(room, args).await,
            Command::Write(args) => {
                if let Err(e) = self.compose.start(room, args).await {
                    self.server_error(room, 42, e).await;
                }
            }
            Command::Ping => self.ping(room).await,
            Command::SetMailbox(args) => self.set_mailbox(room, args).await,
            Command::SetHtml(args) => self.set_html(room, args).await,
            Command::Blocklist(args) => self.blocklist(room, args).await,
            Command::View(args) => self.view(room, args).await,
            Command::Check => {
                if self.registry.scheduler().poll_now(room).await {
                    self.reply(room, "Checking for new mail...").await;
                } else {
                    self.reply(room, NEEDS_IMAP).await;
                }
            }
            Command::Send | Command::Cancel | Command::Remove(_) => {
                self.reply(room, "You are not writing an email. Start one with !write")
                    .await;
            }
            Command::Unknown(_) => self.reply(room, "command not found!").await,
        }
    }

    async fn leave(&self, room: &str) {
        if let Err(e) = self.registry.unbind(room).await {
            return self.server_error(room, 64, e).await;
        }
        self.reply(room, "Successfully unbridged").await;
        if let Err(e) = self.chat.leave_room(room).await {
            error!(code = 65, room = %room, error = %e, "Bot can't leave room");
            self.reply(room, &format!("Error leaving: {e}")).await;
        }
    }

    async fn setup(&self, room: &str, args: &str) {
        let request = match parse_setup(args) {
            Ok(request) => request,
            Err(SetupError::WrongSyntax) => return self.reply(room, SETUP_SYNTAX).await,
            Err(SetupError::UnknownKind(kind)) => {
                return self
                    .reply(
                        room,
                        &format!("What? you can setup 'imap' and 'smtp', not \"{kind}\""),
                    )
                    .await;
            }
            Err(SetupError::InvalidPort) => return self.reply(room, "The port must be a number!").await,
        };

        match request {
            SetupRequest::Imap(account) => self.setup_imap(room, account).await,
            SetupRequest::Smtp {
                account,
                default_port,
            } => self.setup_smtp(room, account, default_port).await,
        }
    }

    async fn setup_imap(&self, room: &str, account: NewInboundAccount) {
        const ALREADY: &str = "IMAP account already existing. Create a new room if you want to use a different account!";
        const IN_USE: &str = "This email is already in Use! You cannot use your email twice!";

        match self.db.accounts_for(room).await {
            Ok(bound) if bound.inbound.is_some() => return self.reply(room, ALREADY).await,
            Ok(_) => {}
            Err(e) => return self.server_error(room, 37, e).await,
        }
        match self.db.inbound_username_in_use(&account.username).await {
            Ok(true) => return self.reply(room, IN_USE).await,
            Ok(false) => {}
            Err(e) => return self.server_error(room, 3, e).await,
        }

        // Only bind credentials that actually work.
        match self.connector.connect(&MailboxParams::from(&account)).await {
            Ok(mut session) => session.logout().await,
            Err(e) => {
                warn!(room = %room, host = %account.host, error = %e, "Mailbox login failed during setup");
                return self
                    .reply(room, &format!("Error creating bridge! Errorcode: #04\r\nReason: {e}"))
                    .await;
            }
        }

        match self.registry.bind_inbound(room, &account).await {
            Ok(_) => {
                self.reply(
                    room,
                    &format!(
                        "Bridge created successfully!\r\nYou should delete the message containing your credentials ;)\r\nIMAP:\r\n\
                         host: {}:{}\r\nusername: {}\r\nmailbox: {}\r\nignoreSSL: {}",
                        account.host, account.port, account.username, account.mailbox, account.ignore_cert
                    ),
                )
                .await;
            }
            Err(BindError::AlreadyBound) => self.reply(room, ALREADY).await,
            Err(BindError::UsernameInUse(_)) => self.reply(room, IN_USE).await,
            Err(BindError::Database(e)) => self.server_error(room, 35, e).await,
        }
    }

    async fn setup_smtp(&self, room: &str, account: NewOutboundAccount, default_port: bool) {
        const ALREADY: &str = "SMTP account already existing. Create a new room if you want to use a different account!";
        const IN_USE: &str =
            "This smtp-username is already in Use! You cannot use your email twice!";

        match self.db.accounts_for(room).await {
            Ok(bound) if bound.outbound.is_some() => return self.reply(room, ALREADY).await,
            Ok(_) => {}
            Err(e) => return self.server_error(room, 37, e).await,
        }
        match self.db.outbound_username_in_use(&account.username).await {
            Ok(true) => return self.reply(room, IN_USE).await,
            Ok(false) => {}
            Err(e) => return self.server_error(room, 24, e).await,
        }
        if default_port {
            self.reply(room, &format!("No port specified! Using {DEFAULT_SMTP_PORT}"))
                .await;
        }

        match self.registry.bind_outbound(room, &account).await {
            Ok(_) => {
                self.reply(
                    room,
                    &format!(
                        "SMTP data saved.\r\nSMTP:\r\nhost: {}\r\nport: {}\r\nusername: {}\r\nignoreSSL: {}",
                        account.host, account.port, account.username, account.ignore_cert
                    ),
                )
                .await;
            }
            Err(BindError::AlreadyBound) => self.reply(room, ALREADY).await,
            Err(BindError::UsernameInUse(_)) => self.reply(room, IN_USE).await,
            Err(BindError::Database(e)) => self.server_error(room, 34, e).await,
        }
    }

    async fn ping(&self, room: &str) {
        let summary = match self.room_summary(room).await {
            Ok(Some(summary)) => summary,
            Ok(None) => return self.reply(room, NEEDS_LOGIN).await,
            Err(e) => return self.server_error(room, 6, e).await,
        };
        self.reply(room, &summary).await;
    }

    async fn room_summary(&self, room: &str) -> Result<Option<String>, DatabaseError> {
        let Some(row) = self.db.get_room(room).await? else {
            return Ok(None);
        };
        let mut out = format!("Room: {room}\r\n");

        match self.db.get_inbound_account(room).await? {
            Some(a) => out.push_str(&format!(
                "IMAP: {}@{}:{} mailbox {}{}\r\n",
                a.username,
                a.host,
                a.port,
                a.mailbox,
                if a.ignore_cert { " (ignoring certificate)" } else { "" }
            )),
            None => out.push_str("IMAP: not set up\r\n"),
        }
        match self.db.get_outbound_account(room).await? {
            Some(a) => out.push_str(&format!("SMTP: {}@{}:{}\r\n", a.username, a.host, a.port)),
            None => out.push_str("SMTP: not set up\r\n"),
        }
        out.push_str(&format!(
            "Check interval: {}s\r\nHTML rendering: {}\r\n",
            row.poll_interval,
            if row.html_enabled { "on" } else { "off" }
        ));
        match self.registry.scheduler().counters(room).await {
            Some(c) => out.push_str(&format!(
                "Mail checker: running ({} checks on this connection, {} errors, {} reconnects)",
                c.cycles, c.errors, c.reconnects
            )),
            None => out.push_str("Mail checker: not running"),
        }
        Ok(Some(out))
    }

    async fn set_mailbox(&self, room: &str, args: &str) {
        let mailbox = args.trim();
        if mailbox.is_empty() || mailbox.contains(char::is_whitespace) {
            return self.reply(room, "Usage: !setmailbox <new mailbox>").await;
        }
        match self.registry.change_mailbox(room, mailbox).await {
            Ok(true) => self.reply(room, "Mailbox updated").await,
            Ok(false) => self.reply(room, NEEDS_IMAP).await,
            Err(e) => self.server_error(room, 49, e).await,
        }
    }

    async fn set_html(&self, room: &str, args: &str) {
        match self.db.accounts_for(room).await {
            Ok(bound) if bound.inbound.is_none() => return self.reply(room, NEEDS_IMAP).await,
            Ok(_) => {}
            Err(e) => return self.server_error(room, 50, e).await,
        }
        let mode = args.trim().to_ascii_lowercase();
        let enabled = match mode.as_str() {
            "on" | "true" => true,
            "off" | "false" => false,
            "" => return self.reply(room, "Usage: !sethtml (on/off) or (true/false)").await,
            _ => return self.reply(room, "What?\r\non/off or true/false").await,
        };
        match self.registry.set_html(room, enabled).await {
            Ok(()) => {
                self.reply(room, &format!("Successfully set HTML-rendering to {mode}"))
                    .await
            }
            Err(e) => self.server_error(room, 56, e).await,
        }
    }

    async fn inbound_account_id(&self, room: &str) -> Option<i64> {
        match self.db.accounts_for(room).await {
            Ok(bound) if bound.inbound.is_some() => bound.inbound,
            Ok(_) => {
                self.reply(room, "You need to login with an imap account to use this command!")
                    .await;
                None
            }
            Err(e) => {
                self.server_error(room, 48, e).await;
                None
            }
        }
    }

    async fn blocklist(&self, room: &str, args: &str) {
        let Some(account) = self.inbound_account_id(room).await else {
            return;
        };
        let words: Vec<&str> = args.split_whitespace().collect();

        match words.as_slice() {
            [cmd] if matches!(*cmd, "view" | "list") => self.show_blocklist(room, account).await,
            ["clear"] => match self.blocklist.clear(account).await {
                Ok(_) => self.reply(room, "Blocklist is now clean!").await,
                Err(e) => self.server_error(room, 58, e).await,
            },
            [cmd, pattern, ..] => {
                let cmd = cmd.to_ascii_lowercase();
                if !matches!(cmd.as_str(), "add" | "remove" | "delete" | "rm") {
                    return self.reply(room, BLOCKLIST_USAGE).await;
                }
                if !is_valid_pattern(pattern) {
                    return self
                        .reply(room, &format!("Error! {pattern} is an invalid email address!"))
                        .await;
                }
                let (result, done, noop) = if cmd == "add" {
                    (
                        self.blocklist.add(account, pattern).await,
                        format!("Success adding {pattern} to blocklist!"),
                        format!("{pattern} is already on the blocklist"),
                    )
                } else {
                    (
                        self.blocklist.remove(account, pattern).await,
                        format!("Success deleting {pattern} from blocklist!"),
                        format!("{pattern} is not on the blocklist"),
                    )
                };
                match result {
                    Ok(true) => self.reply(room, &done).await,
                    Ok(false) => self.reply(room, &noop).await,
                    Err(e) => self.server_error(room, 57, e).await,
                }
            }
            _ => self.reply(room, BLOCKLIST_USAGE).await,
        }
    }

    async fn show_blocklist(&self, room: &str, account: i64) {
        match self.blocklist.list(account).await {
            Ok(patterns) if patterns.is_empty() => self.reply(room, "Your blocklist is empty").await,
            Ok(patterns) => {
                self.reply(room, &format_list("Blocked addresses:", &patterns))
                    .await
            }
            Err(e) => self.server_error(room, 59, e).await,
        }
    }

    async fn view(&self, room: &str, args: &str) {
        let Some(account_id) = self.inbound_account_id(room).await else {
            return;
        };
        match args.trim().to_ascii_lowercase().as_str() {
            "mb" | "mailbox" => match self.db.get_inbound_account(room).await {
                Ok(Some(account)) => {
                    self.reply(room, &format!("Current mailbox: {}", account.mailbox))
                        .await
                }
                Ok(None) => self.reply(room, NEEDS_IMAP).await,
                Err(e) => self.server_error(room, 60, e).await,
            },
            "mbs" | "mailboxes" => self.view_mailboxes(room).await,
            "bl" | "blocklist" | "blocklists" | "blo" | "blocked" => {
                self.show_blocklist(room, account_id).await
            }
            _ => self.reply(room, VIEW_HELP).await,
        }
    }

    async fn view_mailboxes(&self, room: &str) {
        let account = match self.db.get_inbound_account(room).await {
            Ok(Some(account)) => account,
            Ok(None) => return self.reply(room, NEEDS_IMAP).await,
            Err(e) => return self.server_error(room, 61, e).await,
        };
        let mut session = match self.connector.connect(&MailboxParams::from(&account)).await {
            Ok(session) => session,
            Err(e) => {
                return self
                    .reply(room, &format!("Could not connect to your mailbox: {e}"))
                    .await;
            }
        };
        let listed = session.list_mailboxes().await;
        session.logout().await;
        match listed {
            Ok(names) => self.reply(room, &format_list("Available mailboxes:", &names)).await,
            Err(e) => self.reply(room, &format!("Could not list mailboxes: {e}")).await,
        }
    }
}

fn event_room(event: &ChatEvent) -> &str {
    match event {
        ChatEvent::Invite { room, .. } | ChatEvent::Left { room } | ChatEvent::Message { room, .. } => {
            room
        }
    }
}

/// One FIFO queue and worker task per room in front of a [`Dispatcher`].
///
/// A room's worker exits once its queue is closed and drained. Queues are
/// closed when the bot leaves the room, and all at once by [`drain`].
///
/// [`drain`]: RoomQueues::drain
pub struct RoomQueues {
    dispatcher: Arc<Dispatcher>,
    rooms: HashMap<String, mpsc::UnboundedSender<ChatEvent>>,
    workers: JoinSet<()>,
}

impl RoomQueues {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            rooms: HashMap::new(),
            workers: JoinSet::new(),
        }
    }

    /// Queue `event` behind the earlier events of its room.
    pub fn route(&mut self, event: ChatEvent) {
        let room = event_room(&event).to_string();
        let leaving = matches!(event, ChatEvent::Left { .. });

        let pending = match self.rooms.get(&room) {
            Some(queue) => queue.send(event).err().map(|closed| closed.0),
            None => Some(event),
        };
        if let Some(event) = pending {
            let (queue, rx) = mpsc::unbounded_channel();
            if queue.send(event).is_ok() {
                self.workers
                    .spawn(room_worker(Arc::clone(&self.dispatcher), rx));
                self.rooms.insert(room.clone(), queue);
            }
        }
        if leaving {
            self.rooms.remove(&room);
            debug!(room = %room, "Room queue closed");
        }

        while let Some(finished) = self.workers.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Room worker failed");
            }
        }
    }

    /// Rooms with an open queue.
    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    /// Close every queue and wait until the queued events are handled.
    pub async fn drain(mut self) {
        self.rooms.clear();
        while let Some(finished) = self.workers.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Room worker failed");
            }
        }
    }
}

async fn room_worker(dispatcher: Arc<Dispatcher>, mut events: mpsc::UnboundedReceiver<ChatEvent>) {
    while let Some(event) = events.recv().await {
        dispatcher.dispatch(event).await;
    }
}

fn command_name(command: &Command<'_>) -> &'static str {
    match command {
        Command::Help => "help",
        Command::Login => "login",
        Command::Logout => "logout",
        Command::Setup(_) => "setup",
        Command::Write(_) => "write",
        Command::Ping => "ping",
        Command::SetMailbox(_) => "setmailbox",
        Command::SetHtml(_) => "sethtml",
        Command::Leave => "leave",
        Command::Blocklist(_) => "blocklist",
        Command::View(_) => "view",
        Command::Check => "check",
        Command::Send => "send",
        Command::Cancel => "cancel",
        Command::Remove(_) => "rm",
        Command::Unknown(_) => "unknown",
    }
}
