//! Core domain model and the pure decision engine for the deal kudos job.
//!
//! Nothing in this crate performs I/O. The ingestion driver feeds it fetched
//! events plus the persisted [`RunState`] and gets back decisions.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod amount;
pub mod dedup;
pub mod identity;
pub mod templates;
pub mod window;

pub use amount::{extract_amount, format_amount};
pub use dedup::Deduplicator;
pub use identity::{clean_display_name, resolve_identity};
pub use templates::{render_template, TemplateCatalog, TemplateSelector};
pub use window::{plan_window, LookbackPolicy, TimeWindow};

pub const CRATE_NAME: &str = "kudos-core";

/// Current layout version of the persisted state document.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Display name -> addressable handle, as reported by the chat platform.
pub type MemberDirectory = BTreeMap<String, String>;

/// Canonical name -> template indices used in the current rotation cycle.
pub type RotationHistory = BTreeMap<String, Vec<usize>>;

/// Identifier of a timeline message, unique within the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Interactive card, the shape deal notifications arrive in.
    Card,
    PlainText,
    /// Rich text ("post") with inline mention elements.
    RichText,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderKind {
    Human,
    Application,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub kind: SenderKind,
    pub handle: Option<String>,
}

/// One timeline message. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    pub sender: Sender,
    pub created_at: DateTime<Utc>,
    /// Message body exactly as delivered by the source (a JSON document in text form).
    pub raw_payload: String,
}

impl Event {
    /// Parses the structured body. Failure here is a malformed payload.
    pub fn payload(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.raw_payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub canonical_name: String,
    pub handle: Option<String>,
}

impl ResolvedIdentity {
    pub fn unresolved(canonical_name: impl Into<String>) -> Self {
        Self {
            canonical_name: canonical_name.into(),
            handle: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountInfo {
    pub display_text: String,
    pub numeric_value: f64,
}

/// Durable job state, read once at the start of a run and written once at the end.
///
/// Every field defaults when missing so older or partial documents still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub processed_ids: Vec<EventId>,
    #[serde(default, alias = "used_praise")]
    pub rotation_history: RotationHistory,
    #[serde(default)]
    pub members: MemberDirectory,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub last_check_time: Option<DateTime<Utc>>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            processed_ids: Vec::new(),
            rotation_history: RotationHistory::new(),
            members: MemberDirectory::new(),
            last_check_time: None,
        }
    }
}

impl RunState {
    /// Replaces the cached directory unless the refresh came back empty.
    ///
    /// Returns `true` when the fresh snapshot was taken.
    pub fn refresh_members(&mut self, fetched: MemberDirectory) -> bool {
        if fetched.is_empty() {
            return false;
        }
        self.members = fetched;
        true
    }
}
