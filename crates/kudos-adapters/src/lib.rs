//! Chat platform collaborator contract + the Feishu implementation.

use async_trait::async_trait;
use kudos_core::{Event, MemberDirectory, ResolvedIdentity, TimeWindow};
use kudos_storage::FetchError;
use thiserror::Error;

pub mod feishu;
pub mod payload;

pub use feishu::{FeishuClient, FeishuCredentials, DEFAULT_API_BASE};

pub const CRATE_NAME: &str = "kudos-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{op} rejected by platform: code={code} msg={msg}")]
    Api { op: String, code: i64, msg: String },
    #[error("{op} returned an unexpected response: {detail}")]
    Decode { op: String, detail: String },
}

/// One page of the timeline, oldest first.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub next_page_token: Option<String>,
}

/// What the ingestion driver needs from a chat platform.
#[async_trait]
pub trait ChatSource: Send + Sync {
    async fn fetch_event_page(
        &self,
        container_id: &str,
        window: &TimeWindow,
        page_token: Option<&str>,
    ) -> Result<EventPage, SourceError>;

    /// Drains every page of the window, in creation order.
    async fn fetch_events(
        &self,
        container_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<Event>, SourceError> {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .fetch_event_page(container_id, window, page_token.as_deref())
                .await?;
            events.extend(page.events);
            match page.next_page_token {
                Some(next) if Some(&next) != page_token.as_ref() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(events)
    }

    /// May legitimately be empty; callers keep their cached directory then.
    async fn fetch_member_directory(&self, container_id: &str) -> Result<MemberDirectory, SourceError>;

    /// Handle of the bot account itself, if the platform reports one.
    async fn fetch_bot_identity(&self) -> Result<Option<String>, SourceError>;

    /// Posts `text` to the container, structurally mentioning the recipient
    /// when it has a handle and naming it in plain text otherwise.
    async fn send_message(
        &self,
        container_id: &str,
        recipient: &ResolvedIdentity,
        text: &str,
    ) -> Result<(), SourceError>;

    async fn send_direct_message(&self, handle: &str, text: &str) -> Result<(), SourceError>;
}
