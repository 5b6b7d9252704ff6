//! Turns inbound mail into room notifications.

use std::sync::Arc;

use crate::channels::ChatChannel;
use crate::error::ChannelError;
use crate::markdown;

/// Separator between the header and the body of rich notifications.
pub const SEPARATOR: &str = "────────────────";

/// Plain-text notification, sent as-is or as the fallback of a rich one.
pub fn plain_text(from: &str, subject: &str, body: &str) -> String {
    format!("You've got a new Email from {from}\r\nSubject: {subject}\r\n{body}")
}

/// Rich notification; the body is rendered as markdown.
pub fn rich_text(from: &str, subject: &str, body: &str) -> String {
    format!(
        "<b>You've got a new Email</b> from <b>{}</b><br>Subject: {}<br>{SEPARATOR}<br>{}",
        html_escape::encode_text(from),
        html_escape::encode_text(subject),
        markdown::to_html(body)
    )
}

#[derive(Clone)]
pub struct Notifier {
    chat: Arc<dyn ChatChannel>,
}

impl Notifier {
    pub fn new(chat: Arc<dyn ChatChannel>) -> Self {
        Self { chat }
    }

    /// Deliver a notification to `room`, rich when `html` is set.
    pub async fn notify(
        &self,
        room: &str,
        from: &str,
        subject: &str,
        body: &str,
        html: bool,
    ) -> Result<(), ChannelError> {
        let plain = plain_text(from, subject, body);
        if html {
            let rich = rich_text(from, subject, body);
            self.chat.send_html(room, &plain, &rich).await
        } else {
            self.chat.send_text(room, &plain).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_layout() {
        assert_eq!(
            plain_text("a@example.com", "Hi", "Body"),
            "You've got a new Email from a@example.com\r\nSubject: Hi\r\nBody"
        );
    }

    #[test]
    fn rich_layout_escapes_sender() {
        let html = rich_text("Alice <alice@example.com>", "Hi", "**Body**");
        assert!(html.starts_with("<b>You've got a new Email</b> from <b>Alice &lt;alice@example.com&gt;</b><br>"));
        assert!(html.contains(SEPARATOR));
        assert!(html.contains("<strong>Body</strong>"));
    }
}
