//! IMAP over TLS: persistent mailbox sessions with a UID cursor.
//!
//! The protocol work is blocking (rustls `StreamOwned` over a `TcpStream`)
//! and runs inside `spawn_blocking`. Messages are read with
//! `BODY.PEEK[]`, so the server-side `\Seen` flags are never touched.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConnection, DigitallySignedStruct, SignatureScheme, StreamOwned};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::channels::{InboundMail, MailboxConnector, MailboxParams, MailboxSession};
use crate::error::MailError;

/// Messages returned by the first listing of a fresh session.
pub const INITIAL_FETCH_LIMIT: usize = 25;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Opens IMAP sessions.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    timeout: Duration,
}

impl Default for ImapConnector {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ImapConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self, params: &MailboxParams) -> Result<Box<dyn MailboxSession>, MailError> {
        let params = params.clone();
        let timeout = self.timeout;
        let client = tokio::task::spawn_blocking(move || ImapClient::connect(&params, timeout))
            .await
            .map_err(|e| MailError::Connect {
                host: "imap".into(),
                reason: format!("connect task failed: {e}"),
            })??;
        Ok(Box::new(ImapSession {
            client: Arc::new(Mutex::new(client)),
        }))
    }
}

/// A logged-in session with the configured mailbox selected.
pub struct ImapSession {
    client: Arc<Mutex<ImapClient>>,
}

impl ImapSession {
    async fn with_client<T, F>(&self, op: F) -> Result<T, MailError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapClient) -> Result<T, MailError> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            let mut guard = client
                .lock()
                .map_err(|_| MailError::Fetch("IMAP session lock poisoned".into()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| MailError::Fetch(format!("IMAP task failed: {e}")))?
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn fetch_new(&mut self) -> Result<Vec<InboundMail>, MailError> {
        self.with_client(|client| client.fetch_new()).await
    }

    async fn list_mailboxes(&mut self) -> Result<Vec<String>, MailError> {
        self.with_client(|client| client.list_mailboxes()).await
    }

    async fn logout(&mut self) {
        if let Err(e) = self.with_client(|client| client.logout()).await {
            debug!(error = %e, "IMAP logout failed");
        }
    }
}

/// One untagged response line, with any literals it carried.
#[derive(Debug, Default)]
struct ResponseLine {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Blocking IMAP protocol state.
pub struct ImapClient {
    stream: TlsStream,
    next_tag: u32,
    mailbox: String,
    /// Highest UID handed out so far.
    last_uid: Option<u32>,
}

impl ImapClient {
    fn connect(params: &MailboxParams, timeout: Duration) -> Result<Self, MailError> {
        let connect_err = |reason: String| MailError::Connect {
            host: params.host.clone(),
            reason,
        };

        let addr = (params.host.as_str(), params.port)
            .to_socket_addrs()
            .map_err(|e| connect_err(e.to_string()))?
            .next()
            .ok_or_else(|| connect_err("host did not resolve".into()))?;
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        let tls_config = Arc::new(tls_config(params.ignore_cert).map_err(|e| connect_err(e.to_string()))?);
        let server_name = ServerName::try_from(params.host.clone())
            .map_err(|e| connect_err(format!("invalid host name: {e}")))?;
        let conn = ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut client = Self {
            stream: StreamOwned::new(conn, tcp),
            next_tag: 1,
            mailbox: params.mailbox.clone(),
            last_uid: None,
        };

        let greeting = client.read_line()?;
        if !greeting.text.starts_with("* OK") && !greeting.text.starts_with("* PREAUTH") {
            return Err(connect_err(format!("unexpected greeting: {}", greeting.text.trim())));
        }

        let (_, status) = client.command(&format!(
            "LOGIN {} {}",
            quote(&params.username),
            quote(params.password.expose_secret())
        ))?;
        if !is_ok(&status) {
            return Err(MailError::Auth {
                username: params.username.clone(),
            });
        }

        let (_, status) = client.command(&format!("SELECT {}", quote(&params.mailbox)))?;
        if !is_ok(&status) {
            return Err(MailError::Select {
                mailbox: params.mailbox.clone(),
                reason: status.trim().to_string(),
            });
        }

        debug!(host = %params.host, mailbox = %params.mailbox, "IMAP session ready");
        Ok(client)
    }

    fn fetch_new(&mut self) -> Result<Vec<InboundMail>, MailError> {
        // NOOP lets the server report mail that arrived since the last command.
        let (_, status) = self.command("NOOP")?;
        if !is_ok(&status) {
            return Err(MailError::Fetch(format!("NOOP: {}", status.trim())));
        }

        let search = match self.last_uid {
            Some(uid) => format!("UID SEARCH UID {}:*", uid + 1),
            None => "UID SEARCH ALL".to_string(),
        };
        let (lines, status) = self.command(&search)?;
        if !is_ok(&status) {
            return Err(MailError::Fetch(format!("SEARCH: {}", status.trim())));
        }

        let mut uids = parse_search(&lines);
        // `n:*` always matches the highest UID, even when it is below n.
        if let Some(last) = self.last_uid {
            uids.retain(|uid| *uid > last);
        } else if uids.len() > INITIAL_FETCH_LIMIT {
            uids = uids.split_off(uids.len() - INITIAL_FETCH_LIMIT);
        }

        let mut mails = Vec::with_capacity(uids.len());
        for uid in uids {
            let (lines, status) = self.command(&format!("UID FETCH {uid} (INTERNALDATE BODY.PEEK[])"))?;
            if !is_ok(&status) {
                return Err(MailError::Fetch(format!("FETCH {uid}: {}", status.trim())));
            }
            self.last_uid = Some(self.last_uid.map_or(uid, |last| last.max(uid)));

            let Some(line) = lines.iter().find(|l| l.text.contains("FETCH") && !l.literals.is_empty())
            else {
                warn!(uid, "FETCH returned no message body");
                continue;
            };
            let internal_date = parse_internal_date_field(&line.text).unwrap_or_else(Utc::now);
            match InboundMail::parse(uid, internal_date, &line.literals[0]) {
                Ok(mail) => mails.push(mail),
                Err(e) => warn!(uid, error = %e, "Skipping unparsable message"),
            }
        }

        if self.last_uid.is_none() {
            // Empty mailbox: start the cursor at 0 so later listings are incremental.
            self.last_uid = Some(0);
        }
        debug!(mailbox = %self.mailbox, count = mails.len(), "Fetched new mail");
        Ok(mails)
    }

    fn list_mailboxes(&mut self) -> Result<Vec<String>, MailError> {
        let (lines, status) = self.command("LIST \"\" \"*\"")?;
        if !is_ok(&status) {
            return Err(MailError::Fetch(format!("LIST: {}", status.trim())));
        }
        Ok(lines.iter().filter_map(parse_list_line).collect())
    }

    fn logout(&mut self) -> Result<(), MailError> {
        self.command("LOGOUT")?;
        Ok(())
    }

    // ── Protocol helpers ────────────────────────────────────────────

    /// Send a tagged command; returns the untagged lines and the tagged
    /// status line.
    fn command(&mut self, cmd: &str) -> Result<(Vec<ResponseLine>, String), MailError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        self.stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.stream.flush()?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.text.strip_prefix(&format!("{tag} ")) {
                return Ok((lines, status.to_string()));
            }
            lines.push(line);
        }
    }

    /// Read one logical response line, including any `{n}` literals.
    fn read_line(&mut self) -> Result<ResponseLine, MailError> {
        let mut line = ResponseLine::default();
        loop {
            let raw = self.read_raw_line()?;
            let text = String::from_utf8_lossy(&raw).into_owned();
            match literal_len(&text) {
                Some(len) => {
                    let mut literal = vec![0u8; len];
                    self.stream.read_exact(&mut literal)?;
                    line.text.push_str(text.trim_end());
                    line.literals.push(literal);
                }
                None => {
                    line.text.push_str(&text);
                    return Ok(line);
                }
            }
        }
    }

    fn read_raw_line(&mut self) -> Result<Vec<u8>, MailError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(MailError::Fetch("IMAP connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(MailError::Timeout(DEFAULT_TIMEOUT));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn tls_config(ignore_cert: bool) -> Result<rustls::ClientConfig, rustls::Error> {
    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?;

    if ignore_cert {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth());
    }
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Ok(builder
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// Certificate verifier for accounts that opted out of validation.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ── Parsing ─────────────────────────────────────────────────────────

/// Quote a string for use as an IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn is_ok(status: &str) -> bool {
    status.starts_with("OK")
}

/// Length of a literal announced at the end of `line` (`... {123}\r\n`).
fn literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches("\r\n");
    let open = trimmed.rfind('{')?;
    let inner = trimmed[open + 1..].strip_suffix('}')?;
    inner.trim_end_matches('+').parse().ok()
}

fn parse_search(lines: &[ResponseLine]) -> Vec<u32> {
    let mut uids: Vec<u32> = lines
        .iter()
        .filter_map(|l| l.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect();
    uids.sort_unstable();
    uids.dedup();
    uids
}

/// Mailbox name from a `* LIST (...) "/" name` line.
fn parse_list_line(line: &ResponseLine) -> Option<String> {
    let rest = line.text.strip_prefix("* LIST ")?;
    if let Some(literal) = line.literals.first() {
        return Some(String::from_utf8_lossy(literal).into_owned());
    }
    let after_flags = &rest[rest.find(')')? + 1..];
    let after_flags = after_flags.trim();
    // Skip the hierarchy delimiter: a quoted char or NIL.
    let name = if let Some(stripped) = after_flags.strip_prefix('"') {
        let end = stripped.find('"')?;
        stripped[end + 1..].trim()
    } else {
        after_flags.strip_prefix("NIL")?.trim()
    };
    Some(name.trim_matches('"').to_string())
}

/// Parse an IMAP date-time such as `17-Jul-1996 02:44:25 -0700`.
pub fn parse_internal_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_internal_date_field(text: &str) -> Option<DateTime<Utc>> {
    let start = text.find("INTERNALDATE \"")? + "INTERNALDATE \"".len();
    let len = text[start..].find('"')?;
    parse_internal_date(&text[start..start + len])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> ResponseLine {
        ResponseLine {
            text: text.into(),
            literals: vec![],
        }
    }

    #[test]
    fn literal_length_is_detected() {
        assert_eq!(literal_len("* 1 FETCH (UID 5 BODY[] {342}\r\n"), Some(342));
        assert_eq!(literal_len("* 1 FETCH (UID 5 BODY[] {12+}\r\n"), Some(12));
        assert_eq!(literal_len("A1 OK done\r\n"), None);
    }

    #[test]
    fn search_results_are_sorted() {
        let lines = vec![line("* SEARCH 9 3 7\r\n"), line("* 4 EXISTS\r\n")];
        assert_eq!(parse_search(&lines), vec![3, 7, 9]);
        assert!(parse_search(&[line("* SEARCH\r\n")]).is_empty());
    }

    #[test]
    fn list_lines_yield_names() {
        assert_eq!(
            parse_list_line(&line("* LIST (\\HasNoChildren) \"/\" \"INBOX\"\r\n")).as_deref(),
            Some("INBOX")
        );
        assert_eq!(
            parse_list_line(&line("* LIST (\\HasNoChildren) \".\" Archive\r\n")).as_deref(),
            Some("Archive")
        );
        assert_eq!(
            parse_list_line(&line("* LIST (\\Noselect) NIL \"Shared Folders\"\r\n")).as_deref(),
            Some("Shared Folders")
        );
        assert!(parse_list_line(&line("* 3 EXISTS\r\n")).is_none());
    }

    #[test]
    fn internal_date_parses() {
        let dt = parse_internal_date("17-Jul-1996 02:44:25 -0700").unwrap();
        assert_eq!(dt.timestamp(), 837_596_665);
    }

    #[test]
    fn internal_date_field_is_extracted() {
        let text = "* 12 FETCH (UID 40 INTERNALDATE \"01-Jan-2024 00:00:00 +0000\" BODY[] {10}";
        assert_eq!(parse_internal_date_field(text).unwrap().timestamp(), 1_704_067_200);
    }

    #[test]
    fn quoting_escapes_specials() {
        assert_eq!(quote("pa\"ss\\"), "\"pa\\\"ss\\\\\"");
    }
}
