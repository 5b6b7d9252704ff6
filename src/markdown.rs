//! Markdown rendering for notifications and outgoing mail.

use pulldown_cmark::{Event, Options, Parser, html};

fn options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TABLES);
    options
}

/// Render markdown to an HTML fragment.
pub fn to_html(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, Parser::new_ext(markdown, options()));
    out
}

/// Render a composed mail body to the HTML part of an outgoing mail.
///
/// Every line the user sent stays a line in the mail, so soft breaks become
/// `<br>`. Block-start tags are not preceded by blank lines or line breaks.
pub fn email_html(body: &str) -> String {
    let events = Parser::new_ext(body, options()).map(|event| match event {
        Event::SoftBreak => Event::InlineHtml("<br>".into()),
        other => other,
    });
    let mut rendered = String::with_capacity(body.len() * 3 / 2);
    html::push_html(&mut rendered, events);

    rendered
        .replace("\r\n<h", "<h")
        .replace("\n\n<h", "<h")
        .replace(">\n\n", ">")
        .replace("\r\n", "<br>")
}

/// Plain-text alternative for an HTML mail.
pub fn plain_alternative(body: &str) -> String {
    body.replace("<br>", "\r\n")
}
