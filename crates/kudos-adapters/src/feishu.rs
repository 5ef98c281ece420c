//! Feishu (Lark) open-platform client implementing [`ChatSource`].

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use kudos_core::{Event, EventId, EventKind, MemberDirectory, ResolvedIdentity, Sender, SenderKind, TimeWindow};
use kudos_storage::{HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{ChatSource, EventPage, SourceError};

pub const DEFAULT_API_BASE: &str = "https://open.feishu.cn/open-apis";

const MESSAGE_PAGE_SIZE: &str = "50";
const MEMBER_PAGE_SIZE: &str = "100";
/// Separator between the structural mention and the praise line.
pub const ADDRESS_SUFFIX: &str = "伙伴 ";

#[derive(Debug, Clone)]
pub struct FeishuCredentials {
    pub app_id: String,
    pub app_secret: String,
}

#[derive(Debug, Deserialize)]
struct TenantTokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    tenant_access_token: Option<String>,
}

#[derive(Debug)]
pub struct FeishuClient {
    http: HttpFetcher,
    api_base: String,
    credentials: FeishuCredentials,
    token: Mutex<Option<String>>,
}

impl FeishuClient {
    pub fn new(
        api_base: &str,
        credentials: FeishuCredentials,
        http: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(http)?,
            api_base: api_base.trim_end_matches('/').to_string(),
            credentials,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    /// Tenant access token, fetched once and reused for the client's lifetime.
    async fn tenant_token(&self) -> Result<String, SourceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let url = self.url("auth/v3/tenant_access_token/internal");
        let body = json!({
            "app_id": self.credentials.app_id,
            "app_secret": self.credentials.app_secret,
        });
        let raw = self
            .http
            .send_json("tenant_access_token", |c| c.post(&url).json(&body), true)
            .await?;
        let resp: TenantTokenResponse =
            serde_json::from_value(raw).map_err(|e| SourceError::Decode {
                op: "tenant_access_token".into(),
                detail: e.to_string(),
            })?;
        if resp.code != 0 {
            return Err(SourceError::Api {
                op: "tenant_access_token".into(),
                code: resp.code,
                msg: resp.msg,
            });
        }
        let token = resp.tenant_access_token.ok_or_else(|| SourceError::Decode {
            op: "tenant_access_token".into(),
            detail: "missing tenant_access_token".into(),
        })?;
        info!("tenant access token acquired");
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Authenticated call; unwraps the `{code, msg, data}` envelope.
    async fn call(
        &self,
        op: &str,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&JsonValue>,
        retry: bool,
    ) -> Result<JsonValue, SourceError> {
        let token = self.tenant_token().await?;
        let url = self.url(path);
        let raw = self
            .http
            .send_json(
                op,
                |c| {
                    let mut req = c
                        .request(method.clone(), &url)
                        .bearer_auth(&token)
                        .query(query);
                    if let Some(body) = body {
                        req = req.json(body);
                    }
                    req
                },
                retry,
            )
            .await?;
        check_envelope(op, raw)
    }
}

fn check_envelope(op: &str, raw: JsonValue) -> Result<JsonValue, SourceError> {
    let code = raw.get("code").and_then(JsonValue::as_i64).unwrap_or(-1);
    if code != 0 {
        return Err(SourceError::Api {
            op: op.to_string(),
            code,
            msg: raw
                .get("msg")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    Ok(raw)
}

fn page_token_of(data: &JsonValue) -> Option<String> {
    let has_more = data.get("has_more").and_then(JsonValue::as_bool).unwrap_or(false);
    if !has_more {
        return None;
    }
    data.get("page_token")
        .and_then(JsonValue::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn event_kind(msg_type: &str) -> EventKind {
    match msg_type {
        "interactive" => EventKind::Card,
        "text" => EventKind::PlainText,
        "post" => EventKind::RichText,
        _ => EventKind::Other,
    }
}

fn sender_kind(sender_type: &str) -> SenderKind {
    match sender_type {
        "user" => SenderKind::Human,
        "app" => SenderKind::Application,
        _ => SenderKind::Other,
    }
}

/// `create_time` is epoch milliseconds as a string; ten digits or fewer means seconds.
fn parse_create_time(raw: &str) -> Option<DateTime<Utc>> {
    let value: i64 = raw.trim().parse().ok()?;
    if raw.trim().len() > 10 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

/// Maps one `im/v1/messages` item; items without an id are dropped.
pub fn event_from_item(item: &JsonValue, fallback_time: DateTime<Utc>) -> Option<Event> {
    let id = item.get("message_id").and_then(JsonValue::as_str)?;
    if id.is_empty() {
        return None;
    }
    let str_at = |path: &[&str]| {
        path.iter()
            .try_fold(item, |v, key| v.get(*key))
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
    };
    let created_at = parse_create_time(str_at(&["create_time"])).unwrap_or_else(|| {
        warn!(message_id = id, "message has no usable create_time");
        fallback_time
    });
    let handle = str_at(&["sender", "id"]);

    Some(Event {
        id: EventId::new(id),
        kind: event_kind(str_at(&["msg_type"])),
        sender: Sender {
            kind: sender_kind(str_at(&["sender", "sender_type"])),
            handle: (!handle.is_empty()).then(|| handle.to_string()),
        },
        created_at,
        raw_payload: str_at(&["body", "content"]).to_string(),
    })
}

/// Outbound body for a group message addressed to `recipient`.
pub fn group_message_body(chat_id: &str, recipient: &ResolvedIdentity, text: &str) -> JsonValue {
    match &recipient.handle {
        Some(handle) => {
            let content = json!({
                "zh_cn": {
                    "title": "",
                    "content": [
                        [
                            {"tag": "at", "user_id": handle},
                            {"tag": "text", "text": ADDRESS_SUFFIX},
                        ],
                        [
                            {"tag": "text", "text": text},
                        ],
                    ],
                }
            });
            json!({
                "receive_id": chat_id,
                "msg_type": "post",
                "content": content.to_string(),
            })
        }
        None => json!({
            "receive_id": chat_id,
            "msg_type": "text",
            "content": json!({
                "text": format!("{}{}{}", recipient.canonical_name, ADDRESS_SUFFIX, text)
            })
            .to_string(),
        }),
    }
}

#[async_trait]
impl ChatSource for FeishuClient {
    async fn fetch_event_page(
        &self,
        container_id: &str,
        window: &TimeWindow,
        page_token: Option<&str>,
    ) -> Result<EventPage, SourceError> {
        let mut query = vec![
            ("container_id_type", "chat".to_string()),
            ("container_id", container_id.to_string()),
            ("start_time", window.start.timestamp().to_string()),
            ("end_time", window.end.timestamp().to_string()),
            ("sort_type", "ByCreateTimeAsc".to_string()),
            ("page_size", MESSAGE_PAGE_SIZE.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("page_token", token.to_string()));
        }
        let raw = self
            .call("list_messages", reqwest::Method::GET, "im/v1/messages", &query, None, true)
            .await?;

        let data = raw.get("data").cloned().unwrap_or(JsonValue::Null);
        let events: Vec<Event> = data
            .get("items")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .filter_map(|item| event_from_item(item, window.end))
            .collect();
        debug!(count = events.len(), "message page fetched");
        Ok(EventPage {
            events,
            next_page_token: page_token_of(&data),
        })
    }

    async fn fetch_member_directory(&self, container_id: &str) -> Result<MemberDirectory, SourceError> {
        let path = format!("im/v1/chats/{container_id}/members");
        let mut directory = MemberDirectory::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("member_id_type", "open_id".to_string()),
                ("page_size", MEMBER_PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }
            let raw = self
                .call("list_members", reqwest::Method::GET, &path, &query, None, true)
                .await?;
            let data = raw.get("data").cloned().unwrap_or(JsonValue::Null);
            for item in data.get("items").and_then(JsonValue::as_array).into_iter().flatten() {
                let name = item.get("name").and_then(JsonValue::as_str).unwrap_or_default();
                let handle = item.get("member_id").and_then(JsonValue::as_str).unwrap_or_default();
                if !name.is_empty() && !handle.is_empty() {
                    directory.insert(name.to_string(), handle.to_string());
                }
            }
            match page_token_of(&data) {
                Some(next) if Some(&next) != page_token.as_ref() => page_token = Some(next),
                _ => break,
            }
        }
        info!(members = directory.len(), "member directory fetched");
        Ok(directory)
    }

    async fn fetch_bot_identity(&self) -> Result<Option<String>, SourceError> {
        let raw = self
            .call("bot_info", reqwest::Method::GET, "bot/v3/info", &[], None, true)
            .await?;
        let bot = raw.get("bot");
        let handle = bot
            .and_then(|b| b.get("open_id"))
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        info!(
            app_name = bot.and_then(|b| b.get("app_name")).and_then(JsonValue::as_str).unwrap_or_default(),
            handle = handle.as_deref().unwrap_or_default(),
            "bot identity resolved"
        );
        Ok(handle)
    }

    async fn send_message(
        &self,
        container_id: &str,
        recipient: &ResolvedIdentity,
        text: &str,
    ) -> Result<(), SourceError> {
        let body = group_message_body(container_id, recipient, text);
        self.call(
            "send_group_message",
            reqwest::Method::POST,
            "im/v1/messages",
            &[("receive_id_type", "chat_id".to_string())],
            Some(&body),
            false,
        )
        .await?;
        Ok(())
    }

    async fn send_direct_message(&self, handle: &str, text: &str) -> Result<(), SourceError> {
        let body = json!({
            "receive_id": handle,
            "msg_type": "text",
            "content": json!({"text": text}).to_string(),
        });
        self.call(
            "send_direct_message",
            reqwest::Method::POST,
            "im/v1/messages",
            &[("receive_id_type", "open_id".to_string())],
            Some(&body),
            false,
        )
        .await?;
        Ok(())
    }
}
