//! Matrix channel: Client-Server API over reqwest.
//!
//! Logs in with a password, long-polls `/sync` and turns the response into
//! [`ChatEvent`]s. The sync token is persisted in the settings table so a
//! restart does not replay old room history.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::channels::{ChatChannel, ChatEvent, MessageContent};
use crate::error::ChannelError;
use crate::store::Database;

/// Settings key holding the last `next_batch` token.
pub const SYNC_TOKEN_KEY: &str = "matrix_next_batch";

/// Server-side long-poll timeout for `/sync`.
const SYNC_TIMEOUT_MS: u64 = 30_000;

/// Pause after a failed sync.
const SYNC_RETRY: Duration = Duration::from_secs(5);

/// Matrix client bound to one logged-in bot user.
pub struct MatrixChannel {
    homeserver: Url,
    user_id: String,
    access_token: SecretString,
    client: reqwest::Client,
}

/// Prefix a scheme when missing and drop trailing slashes.
pub fn normalize_homeserver(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else {
        format!("https://{server}")
    }
}

impl MatrixChannel {
    /// Log in with `m.login.password`.
    pub async fn login(server: &str, user: &str, password: &str) -> Result<Self, ChannelError> {
        let homeserver = Url::parse(&normalize_homeserver(server)).map_err(|e| {
            ChannelError::LoginFailed {
                server: server.to_string(),
                reason: e.to_string(),
            }
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(SYNC_TIMEOUT_MS) + Duration::from_secs(30))
            .build()
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": user },
            "password": password,
            "initial_device_display_name": "mail-bridge",
        });
        let url = endpoint(&homeserver, &["login"]);
        let resp = client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::LoginFailed {
                server: server.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        let data: Value = resp.json().await.map_err(|e| ChannelError::LoginFailed {
            server: server.to_string(),
            reason: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(ChannelError::LoginFailed {
                server: server.to_string(),
                reason: api_error(status, &data),
            });
        }

        let token = data
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::LoginFailed {
                server: server.to_string(),
                reason: "no access_token in login response".into(),
            })?;
        let user_id = data
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or(user)
            .to_string();

        tracing::info!(user = %user_id, homeserver = %homeserver, "Logged in to Matrix");
        Ok(Self {
            homeserver,
            user_id,
            access_token: SecretString::from(token.to_string()),
            client,
        })
    }

    /// Fully qualified id of the bot user.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn url(&self, segments: &[&str]) -> Url {
        endpoint(&self.homeserver, segments)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(self.access_token.expose_secret())
    }

    /// One `/sync` request. Returns the `next_batch` token and the raw body.
    pub async fn sync_once(&self, since: Option<&str>) -> Result<(String, Value), ChannelError> {
        let mut url = self.url(&["sync"]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &SYNC_TIMEOUT_MS.to_string());
            if let Some(since) = since {
                query.append_pair("since", since);
            }
        }

        let resp = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(|e| ChannelError::SyncFailed(e.to_string()))?;
        let status = resp.status();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::SyncFailed(e.to_string()))?;
        if !status.is_success() {
            return Err(ChannelError::SyncFailed(api_error(status, &data)));
        }

        let next = data
            .get("next_batch")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::SyncFailed("no next_batch in sync response".into()))?
            .to_string();
        Ok((next, data))
    }

    /// Spawn the sync loop. Events go to `tx` until `shutdown` flips or the
    /// receiver is dropped.
    ///
    /// Without a stored token the first sync only records the position, so
    /// history from before the bridge started is never dispatched.
    pub fn run(
        self: Arc<Self>,
        db: Arc<dyn Database>,
        tx: mpsc::Sender<ChatEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut since = match db.get_setting(SYNC_TOKEN_KEY).await {
                Ok(token) => token,
                Err(e) => {
                    tracing::warn!(error = %e, "Could not read sync token, starting fresh");
                    None
                }
            };

            tracing::info!("Matrix channel listening for events...");

            loop {
                let result = tokio::select! {
                    r = self.sync_once(since.as_deref()) => r,
                    _ = shutdown.changed() => break,
                };

                let (next, data) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Matrix sync error: {e}");
                        tokio::select! {
                            _ = tokio::time::sleep(SYNC_RETRY) => continue,
                            _ = shutdown.changed() => break,
                        }
                    }
                };

                if since.is_some() {
                    for event in parse_sync(&data, &self.user_id) {
                        if tx.send(event).await.is_err() {
                            tracing::info!("Matrix event receiver closed");
                            return;
                        }
                    }
                } else {
                    // Invites are state, not history; answer those that are pending.
                    for event in parse_sync(&data, &self.user_id) {
                        if matches!(event, ChatEvent::Invite { .. })
                            && tx.send(event).await.is_err()
                        {
                            return;
                        }
                    }
                }

                if let Err(e) = db.set_setting(SYNC_TOKEN_KEY, &next).await {
                    tracing::warn!(error = %e, "Could not persist sync token");
                }
                since = Some(next);

                if *shutdown.borrow() {
                    break;
                }
            }
            tracing::info!("Matrix sync loop stopped");
        })
    }

    async fn send_content(&self, room: &str, content: Value) -> Result<(), ChannelError> {
        let txn = uuid::Uuid::new_v4().to_string();
        let url = self.url(&["rooms", room, "send", "m.room.message", &txn]);
        let resp = self
            .authorized(self.client.put(url))
            .json(&content)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                room: room.to_string(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let data: Value = resp.json().await.unwrap_or(Value::Null);
            return Err(ChannelError::SendFailed {
                room: room.to_string(),
                reason: api_error(status, &data),
            });
        }
        Ok(())
    }

    async fn membership(&self, room: &str, url: Url) -> Result<(), ChannelError> {
        let resp = self
            .authorized(self.client.post(url))
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| ChannelError::Membership {
                room: room.to_string(),
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            let status = resp.status();
            let data: Value = resp.json().await.unwrap_or(Value::Null);
            return Err(ChannelError::Membership {
                room: room.to_string(),
                reason: api_error(status, &data),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatChannel for MatrixChannel {
    async fn send_text(&self, room: &str, text: &str) -> Result<(), ChannelError> {
        self.send_content(room, json!({ "msgtype": "m.text", "body": text }))
            .await
    }

    async fn send_html(&self, room: &str, plain: &str, html: &str) -> Result<(), ChannelError> {
        self.send_content(
            room,
            json!({
                "msgtype": "m.text",
                "body": plain,
                "format": "org.matrix.custom.html",
                "formatted_body": html,
            }),
        )
        .await
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), ChannelError> {
        let download_err = |reason: String| ChannelError::DownloadFailed {
            url: url.to_string(),
            reason,
        };
        let (server, media_id) =
            parse_mxc(url).ok_or_else(|| download_err("not an mxc:// URI".into()))?;

        let resp = self
            .authorized(self.client.get(self.url_v1(&["media", "download", server, media_id])))
            .send()
            .await
            .map_err(|e| download_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(download_err(format!("HTTP {}", resp.status())));
        }
        let bytes = resp.bytes().await.map_err(|e| download_err(e.to_string()))?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| download_err(e.to_string()))?;

        tracing::debug!(url, dest = %dest.display(), size = bytes.len(), "Downloaded media");
        Ok(())
    }

    async fn join_room(&self, room: &str) -> Result<(), ChannelError> {
        self.membership(room, self.url(&["join", room])).await
    }

    async fn leave_room(&self, room: &str) -> Result<(), ChannelError> {
        self.membership(room, self.url(&["rooms", room, "leave"])).await
    }
}

impl MatrixChannel {
    fn url_v1(&self, segments: &[&str]) -> Url {
        versioned_endpoint(&self.homeserver, "v1", segments)
    }
}

fn endpoint(homeserver: &Url, segments: &[&str]) -> Url {
    versioned_endpoint(homeserver, "v3", segments)
}

/// Build `/_matrix/client/{version}/...`, percent-encoding each segment.
fn versioned_endpoint(homeserver: &Url, version: &str, segments: &[&str]) -> Url {
    let mut url = homeserver.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty()
            .extend(["_matrix", "client", version])
            .extend(segments);
    }
    url
}

fn api_error(status: reqwest::StatusCode, body: &Value) -> String {
    let code = body.get("errcode").and_then(Value::as_str).unwrap_or("");
    let msg = body.get("error").and_then(Value::as_str).unwrap_or("");
    format!("HTTP {status} {code} {msg}").trim_end().to_string()
}

/// Split `mxc://server/media_id`.
fn parse_mxc(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("mxc://")?;
    let (server, id) = rest.split_once('/')?;
    if server.is_empty() || id.is_empty() {
        return None;
    }
    Some((server, id))
}

/// The server part of a user id (`@user:server`).
pub fn server_of(user_id: &str) -> &str {
    user_id.split_once(':').map(|(_, s)| s).unwrap_or("")
}

/// Turn a `/sync` response into chat events for `own_user`.
///
/// Reported: invites to the bot, rooms the bot has left or been removed
/// from, and text/file messages from other users in joined rooms.
pub fn parse_sync(data: &Value, own_user: &str) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    let rooms = match data.get("rooms") {
        Some(r) => r,
        None => return events,
    };

    if let Some(invites) = rooms.get("invite").and_then(Value::as_object) {
        for (room, body) in invites {
            let inviter = body
                .pointer("/invite_state/events")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .find(|e| {
                    e.get("type").and_then(Value::as_str) == Some("m.room.member")
                        && e.get("state_key").and_then(Value::as_str) == Some(own_user)
                        && e.pointer("/content/membership").and_then(Value::as_str)
                            == Some("invite")
                })
                .and_then(|e| e.get("sender").and_then(Value::as_str));
            if let Some(inviter) = inviter {
                events.push(ChatEvent::Invite {
                    room: room.clone(),
                    inviter: inviter.to_string(),
                });
            }
        }
    }

    if let Some(joined) = rooms.get("join").and_then(Value::as_object) {
        for (room, body) in joined {
            let timeline = body
                .pointer("/timeline/events")
                .and_then(Value::as_array)
                .into_iter()
                .flatten();
            for event in timeline {
                let kind = event.get("type").and_then(Value::as_str);
                let sender = event.get("sender").and_then(Value::as_str).unwrap_or("");

                if kind == Some("m.room.member") {
                    let target = event.get("state_key").and_then(Value::as_str);
                    let membership = event.pointer("/content/membership").and_then(Value::as_str);
                    if target == Some(own_user) && matches!(membership, Some("leave" | "ban")) {
                        events.push(ChatEvent::Left { room: room.clone() });
                    }
                    continue;
                }

                if kind != Some("m.room.message") || sender == own_user {
                    continue;
                }
                if let Some(content) = message_content(event.get("content")) {
                    events.push(ChatEvent::Message {
                        room: room.clone(),
                        sender: sender.to_string(),
                        content,
                    });
                }
            }
        }
    }

    if let Some(left) = rooms.get("leave").and_then(Value::as_object) {
        for room in left.keys() {
            let already = events
                .iter()
                .any(|e| matches!(e, ChatEvent::Left { room: r } if r == room));
            if !already {
                events.push(ChatEvent::Left { room: room.clone() });
            }
        }
    }

    events
}

fn message_content(content: Option<&Value>) -> Option<MessageContent> {
    let content = content?;
    let body = content.get("body").and_then(Value::as_str)?;
    match content.get("msgtype").and_then(Value::as_str)? {
        "m.text" | "m.notice" => Some(MessageContent::Text(body.to_string())),
        "m.file" | "m.image" | "m.video" | "m.audio" => {
            let url = content.get("url").and_then(Value::as_str)?;
            let name = content
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or(body);
            Some(MessageContent::File {
                name: name.to_string(),
                url: url.to_string(),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT: &str = "@bridge:example.com";

    #[test]
    fn homeserver_normalization() {
        assert_eq!(normalize_homeserver("matrix.org"), "https://matrix.org");
        assert_eq!(normalize_homeserver("https://matrix.org/"), "https://matrix.org");
        assert_eq!(normalize_homeserver("http://localhost:8008"), "http://localhost:8008");
    }

    #[test]
    fn room_ids_are_percent_encoded() {
        let hs = Url::parse("https://matrix.example.com").unwrap();
        let url = endpoint(&hs, &["rooms", "!abc:example.com", "leave"]);
        assert_eq!(
            url.as_str(),
            "https://matrix.example.com/_matrix/client/v3/rooms/!abc:example.com/leave"
        );
        let url = endpoint(&hs, &["join", "#room/with slash:example.com"]);
        assert!(url.as_str().ends_with("/join/%23room%2Fwith%20slash:example.com"));
    }

    #[test]
    fn mxc_parsing() {
        assert_eq!(parse_mxc("mxc://example.com/abc"), Some(("example.com", "abc")));
        assert_eq!(parse_mxc("https://example.com/abc"), None);
        assert_eq!(parse_mxc("mxc://example.com/"), None);
    }

    #[test]
    fn server_part_of_user() {
        assert_eq!(server_of("@alice:example.com"), "example.com");
        assert_eq!(server_of("alice"), "");
    }

    #[test]
    fn text_and_file_messages() {
        let data = json!({
            "next_batch": "s2",
            "rooms": { "join": { "!r:example.com": { "timeline": { "events": [
                { "type": "m.room.message", "sender": "@alice:example.com",
                  "content": { "msgtype": "m.text", "body": "!ping" } },
                { "type": "m.room.message", "sender": BOT,
                  "content": { "msgtype": "m.text", "body": "own echo" } },
                { "type": "m.room.message", "sender": "@alice:example.com",
                  "content": { "msgtype": "m.image", "body": "cat.png", "url": "mxc://example.com/xyz" } },
                { "type": "m.reaction", "sender": "@alice:example.com", "content": {} }
            ] } } } }
        });

        let events = parse_sync(&data, BOT);
        assert_eq!(
            events,
            vec![
                ChatEvent::Message {
                    room: "!r:example.com".into(),
                    sender: "@alice:example.com".into(),
                    content: MessageContent::Text("!ping".into()),
                },
                ChatEvent::Message {
                    room: "!r:example.com".into(),
                    sender: "@alice:example.com".into(),
                    content: MessageContent::File {
                        name: "cat.png".into(),
                        url: "mxc://example.com/xyz".into(),
                    },
                },
            ]
        );
    }

    #[test]
    fn invites_carry_the_inviter() {
        let data = json!({
            "rooms": { "invite": { "!new:example.com": { "invite_state": { "events": [
                { "type": "m.room.name", "sender": "@bob:other.org", "state_key": "", "content": { "name": "x" } },
                { "type": "m.room.member", "sender": "@bob:other.org", "state_key": BOT,
                  "content": { "membership": "invite" } }
            ] } } } }
        });
        assert_eq!(
            parse_sync(&data, BOT),
            vec![ChatEvent::Invite {
                room: "!new:example.com".into(),
                inviter: "@bob:other.org".into(),
            }]
        );
    }

    #[test]
    fn kicks_and_leaves_are_reported_once() {
        let data = json!({
            "rooms": {
                "join": { "!a:example.com": { "timeline": { "events": [
                    { "type": "m.room.member", "sender": "@admin:example.com", "state_key": BOT,
                      "content": { "membership": "ban" } },
                    { "type": "m.room.member", "sender": "@carol:example.com",
                      "state_key": "@carol:example.com", "content": { "membership": "leave" } }
                ] } } },
                "leave": { "!a:example.com": {}, "!b:example.com": {} }
            }
        });
        let events = parse_sync(&data, BOT);
        assert_eq!(events.len(), 2);
        assert!(events.contains(&ChatEvent::Left { room: "!a:example.com".into() }));
        assert!(events.contains(&ChatEvent::Left { room: "!b:example.com".into() }));
    }

    #[test]
    fn empty_sync_yields_nothing() {
        assert!(parse_sync(&json!({ "next_batch": "s1" }), BOT).is_empty());
    }
}
