//! # Comment formatting
//!
//! Markdown source goes through four stages: render, sanitize, converters, link shortening.
//! The sanitizer policy is the usual user-generated-content whitelist plus
//! `class="language-*"` on `<code>` so fenced blocks keep their highlighting hint.

use std::borrow::Cow;
use std::sync::Arc;

use domains::Comment;
use once_cell::sync::Lazy;
use pulldown_cmark::{html, CowStr, Event, LinkType, Options, Parser, Tag, TagEnd, TextMergeStream};
use regex::Regex;

/// Length (in chars) an auto-linked URL is shortened to when displayed.
pub const DEFAULT_LINK_LEN: usize = 48;
/// Snippet length used when the caller passes a non-positive limit.
pub const DEFAULT_SNIPPET_LEN: usize = 200;

static LANGUAGE_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^language-[a-zA-Z0-9_+\-]+$").expect("valid regex"));
static BARE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"']+[^\s<>"'.,;:!?)\]]"#).expect("valid regex"));
static ANCHOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<a ([^>]*?)href="([^"]*)"([^>]*)>([^<]*)</a>"#).expect("valid regex")
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// A pure `text -> text` transformation applied after sanitization.
pub trait CommentConverter: Send + Sync {
    fn convert(&self, text: &str) -> String;
}

/// Adapter turning any `Fn(&str) -> String` into a [`CommentConverter`].
pub struct ConverterFn<F>(pub F);

impl<F> CommentConverter for ConverterFn<F>
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn convert(&self, text: &str) -> String {
        (self.0)(text)
    }
}

/// Renders comment sources into safe HTML.
#[derive(Clone)]
pub struct CommentFormatter {
    converters: Vec<Arc<dyn CommentConverter>>,
    link_len: usize,
}

impl Default for CommentFormatter {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl CommentFormatter {
    pub fn new(converters: Vec<Arc<dyn CommentConverter>>) -> Self {
        Self { converters, link_len: DEFAULT_LINK_LEN }
    }

    pub fn with_link_len(mut self, link_len: usize) -> Self {
        self.link_len = link_len.max(4);
        self
    }

    /// Renders `comment.orig` into `comment.text`.
    pub fn format(&self, comment: &mut Comment) {
        comment.text = self.format_text(&comment.orig);
    }

    pub fn format_text(&self, source: &str) -> String {
        let rendered = render_markdown(source);
        let mut text = ugc_policy().clean(&rendered).to_string();
        for converter in &self.converters {
            text = converter.convert(&text);
        }
        shorten_auto_links(&text, self.link_len)
    }
}

fn markdown_options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options
}

fn render_markdown(source: &str) -> String {
    let mut events = Vec::new();
    let mut link_depth = 0usize;
    let mut in_code = false;
    for event in TextMergeStream::new(Parser::new_ext(source, markdown_options())) {
        match event {
            Event::Start(Tag::Link { .. }) => {
                link_depth += 1;
                events.push(event);
            }
            Event::End(TagEnd::Link) => {
                link_depth = link_depth.saturating_sub(1);
                events.push(event);
            }
            Event::Start(Tag::CodeBlock(_)) => {
                in_code = true;
                events.push(event);
            }
            Event::End(TagEnd::CodeBlock) => {
                in_code = false;
                events.push(event);
            }
            // every newline inside a paragraph is a line break
            Event::SoftBreak => events.push(Event::HardBreak),
            Event::Text(text) if link_depth == 0 && !in_code => autolink(&text, &mut events),
            other => events.push(other),
        }
    }
    let mut out = String::with_capacity(source.len() * 2);
    html::push_html(&mut out, events.into_iter());
    out
}

fn autolink<'a>(text: &str, events: &mut Vec<Event<'a>>) {
    let mut last = 0;
    for m in BARE_URL.find_iter(text) {
        if m.start() > last {
            events.push(Event::Text(CowStr::from(text[last..m.start()].to_string())));
        }
        let url = m.as_str().to_string();
        events.push(Event::Start(Tag::Link {
            link_type: LinkType::Autolink,
            dest_url: CowStr::from(url.clone()),
            title: CowStr::from(""),
            id: CowStr::from(""),
        }));
        events.push(Event::Text(CowStr::from(url)));
        events.push(Event::End(TagEnd::Link));
        last = m.end();
    }
    if last < text.len() {
        events.push(Event::Text(CowStr::from(text[last..].to_string())));
    }
}

/// The user-generated-content sanitizer policy.
pub fn ugc_policy() -> ammonia::Builder<'static> {
    let mut builder = ammonia::Builder::default();
    builder
        .add_tag_attributes("code", &["class"])
        .attribute_filter(|element, attribute, value| {
            if element == "code" && attribute == "class" && !LANGUAGE_CLASS.is_match(value) {
                return None;
            }
            Some(Cow::Borrowed(value))
        });
    builder
}

/// Replaces the visible text of auto-links (`href == text`) that are too long.
fn shorten_auto_links(html: &str, max_len: usize) -> String {
    if !html.contains("<a ") {
        return html.to_string();
    }
    ANCHOR
        .replace_all(html, |caps: &regex::Captures| {
            let whole = caps[0].to_string();
            let href = &caps[2];
            let text = &caps[4];
            if href != text || href.chars().count() < max_len + 3 {
                return whole;
            }
            let Ok(parsed) = url::Url::parse(&html_escape::decode_html_entities(href)) else {
                return whole;
            };
            let Some(host) = parsed.host_str().filter(|h| !h.is_empty()) else {
                return whole;
            };
            let prefix = format!("{}://{}", parsed.scheme(), host);
            let short = if prefix.chars().count() > max_len - 3 {
                format!("{host}...")
            } else {
                format!("{}...", truncate_chars(href, max_len - 3))
            };
            format!("<a {}href=\"{}\"{}>{}</a>", &caps[1], href, &caps[3], short)
        })
        .into_owned()
}

fn truncate_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Sanitizes every user-controlled field of the comment in place. Idempotent.
pub fn sanitize_comment(comment: &mut Comment) {
    let policy = ugc_policy();
    comment.text = policy.clean(&comment.text).to_string();
    comment.orig = policy.clean(&comment.orig).to_string();
    comment.post_title = policy.clean(&comment.post_title).to_string();
    comment.user.id = escape_idempotent(&comment.user.id);
    comment.user.name = escape_idempotent(&comment.user.name);
    comment.user.picture = strip_script_url(&comment.user.picture);
    comment.locator.url = strip_script_url(&comment.locator.url);
}

fn escape_idempotent(s: &str) -> String {
    html_escape::encode_safe(&html_escape::decode_html_entities(s)).into_owned()
}

fn strip_script_url(s: &str) -> String {
    let lowered = s.trim_start().to_ascii_lowercase();
    if lowered.starts_with("javascript:") || lowered.starts_with("vbscript:") || lowered.starts_with("data:text") {
        String::new()
    } else {
        s.to_string()
    }
}

/// Plain-text excerpt of rendered HTML, cut on a word boundary.
pub fn snippet(html: &str, limit: i64) -> String {
    let limit = if limit <= 0 { DEFAULT_SNIPPET_LEN } else { limit as usize };
    let stripped = TAG.replace_all(html, "");
    let plain = html_escape::decode_html_entities(&stripped).replace('\n', " ");
    let plain = plain.trim();
    if plain.chars().count() <= limit {
        return plain.to_string();
    }
    let cut = truncate_chars(plain, limit);
    let cut = match cut.rfind(' ') {
        Some(idx) if idx > 0 => &cut[..idx],
        _ => cut,
    };
    format!("{} ...", cut.trim_end())
}
