//! Digest of chat messages that mention the bot, delivered to an administrator.

use chrono::Local;
use kudos_adapters::payload::bot_mention_text;
use kudos_core::{Event, EventId, MemberDirectory, SenderKind};
use serde::Serialize;
use serde_json::Value as JsonValue;

pub const UNKNOWN_SENDER: &str = "未知用户";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MentionEntry {
    pub event_id: EventId,
    pub sender_name: String,
    pub text: String,
    /// Local wall-clock `HH:MM`.
    pub time: String,
}

/// Builds a digest entry when `event` is a human message mentioning the bot.
pub fn mention_entry(
    event: &Event,
    body: &JsonValue,
    bot_handle: &str,
    directory: &MemberDirectory,
) -> Option<MentionEntry> {
    if event.sender.kind != SenderKind::Human {
        return None;
    }
    let text = bot_mention_text(event.kind, body, bot_handle)?;
    let sender_name = event
        .sender
        .handle
        .as_deref()
        .and_then(|handle| {
            directory
                .iter()
                .find(|(_, member)| member.as_str() == handle)
                .map(|(name, _)| name.clone())
        })
        .unwrap_or_else(|| UNKNOWN_SENDER.to_string());

    Some(MentionEntry {
        event_id: event.id.clone(),
        sender_name,
        text,
        time: event.created_at.with_timezone(&Local).format("%H:%M").to_string(),
    })
}

pub fn render_digest(entries: &[MentionEntry]) -> String {
    let mut lines = vec![format!("📬 收到 {} 条 @消息：\n", entries.len())];
    for (i, entry) in entries.iter().enumerate() {
        lines.push(format!("{}. 【{}】{}：", i + 1, entry.time, entry.sender_name));
        lines.push(format!("   {}\n", entry.text));
    }
    lines.push("\n💡 请回复对应序号+内容来回复用户".to_string());
    lines.push("例如：1 好的，收到！".to_string());
    lines.join("\n")
}
