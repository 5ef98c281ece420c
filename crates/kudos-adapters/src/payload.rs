//! Interpretation of Feishu message bodies: deal cards and bot mentions.

use std::sync::OnceLock;

use kudos_core::EventKind;
use regex::Regex;
use serde_json::Value as JsonValue;

/// Placeholder used when a mention carries no text besides the `@`.
pub const EMPTY_MENTION_TEXT: &str = "(无文字内容)";

fn deal_title_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"恭喜(.+?)成单").expect("deal title pattern is a valid regex"))
}

fn mention_placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@_user_\d+\s*").expect("mention pattern is a valid regex"))
}

/// Card title, looked up as `header.title.content`, `header.title`, then `title`.
pub fn card_title(card: &JsonValue) -> Option<String> {
    let header_title = card.get("header").and_then(|h| h.get("title"));
    let from_header = match header_title {
        Some(JsonValue::Object(obj)) => obj.get("content").and_then(JsonValue::as_str),
        Some(JsonValue::String(s)) => Some(s.as_str()),
        _ => None,
    };
    from_header
        .filter(|s| !s.is_empty())
        .or_else(|| card.get("title").and_then(JsonValue::as_str).filter(|s| !s.is_empty()))
        .map(str::to_string)
}

/// The salesperson name in a `恭喜<name>成单` title.
pub fn deal_subject(title: &str) -> Option<&str> {
    let captures = deal_title_pattern().captures(title)?;
    let name = captures.get(1)?.as_str().trim();
    (!name.is_empty()).then_some(name)
}

/// Raw name from a deal card, or `None` when the card is something else.
pub fn deal_card_subject(card: &JsonValue) -> Option<String> {
    let title = card_title(card)?;
    deal_subject(&title).map(str::to_string)
}

/// Text of a message that mentions `bot_handle`, cleaned of `@_user_N` keys.
///
/// Returns `None` when the message does not mention the bot.
pub fn bot_mention_text(kind: EventKind, body: &JsonValue, bot_handle: &str) -> Option<String> {
    let (text, mentioned) = match kind {
        EventKind::PlainText => plain_text_mention(body, bot_handle),
        EventKind::RichText => rich_text_mention(body, bot_handle),
        EventKind::Card | EventKind::Other => return None,
    };
    if !mentioned {
        return None;
    }
    let cleaned = mention_placeholder_pattern()
        .replace_all(&text, "")
        .trim()
        .to_string();
    Some(if cleaned.is_empty() {
        EMPTY_MENTION_TEXT.to_string()
    } else {
        cleaned
    })
}

fn plain_text_mention(body: &JsonValue, bot_handle: &str) -> (String, bool) {
    let text = body
        .get("text")
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    let mentioned = body
        .get("mentions")
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
        .any(|mention| match mention.get("id") {
            Some(JsonValue::Object(id)) => id.get("open_id").and_then(JsonValue::as_str) == Some(bot_handle),
            Some(JsonValue::String(id)) => id == bot_handle,
            _ => false,
        });
    (text, mentioned)
}

// Post bodies hold rows of inline elements, either at the top level or keyed
// by locale.
fn rich_text_mention(body: &JsonValue, bot_handle: &str) -> (String, bool) {
    let mut texts = Vec::new();
    let mut mentioned = false;
    let posts: Vec<&JsonValue> = if body.get("content").is_some_and(JsonValue::is_array) {
        vec![body]
    } else {
        match body.as_object() {
            Some(locales) => locales.values().collect(),
            None => return (String::new(), false),
        }
    };
    for post in posts {
        let rows = post
            .get("content")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten();
        for element in rows.filter_map(JsonValue::as_array).flatten() {
            match element.get("tag").and_then(JsonValue::as_str) {
                Some("text") => texts.push(
                    element
                        .get("text")
                        .and_then(JsonValue::as_str)
                        .unwrap_or_default()
                        .to_string(),
                ),
                Some("at") => {
                    if element.get("user_id").and_then(JsonValue::as_str) == Some(bot_handle) {
                        mentioned = true;
                    }
                }
                _ => {}
            }
        }
    }
    (texts.join(" "), mentioned)
}
