//! Durable run-state storage + HTTP request utilities for the kudos job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use kudos_core::{RunState, STATE_SCHEMA_VERSION};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kudos-storage";

/// Single JSON document holding everything the job remembers between runs.
///
/// Read once at the start of a run, replaced once at the end. Concurrent
/// writers race with last-writer-wins semantics; the rename keeps each
/// write whole.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the state, falling back to the empty state when the file is
    /// missing or unreadable. A lost state only widens the next window to the
    /// default lookback.
    pub async fn load(&self) -> RunState {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no state file yet, starting empty");
                return RunState::default();
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "reading state failed, starting empty");
                return RunState::default();
            }
        };

        match serde_json::from_str::<RunState>(&text) {
            Ok(state) => {
                if state.schema_version > STATE_SCHEMA_VERSION {
                    warn!(
                        found = state.schema_version,
                        supported = STATE_SCHEMA_VERSION,
                        "state written by a newer version, unknown fields are ignored"
                    );
                }
                info!(
                    processed_ids = state.processed_ids.len(),
                    rotation_entries = state.rotation_history.len(),
                    members = state.members.len(),
                    last_check_time = ?state.last_check_time,
                    "state loaded"
                );
                state
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "state file is corrupt, starting empty");
                RunState::default()
            }
        }
    }

    /// Writes the state through a temp file in the same directory and an atomic rename.
    pub async fn save(&self, state: &RunState) -> anyhow::Result<()> {
        let mut to_write = state.clone();
        to_write.schema_version = STATE_SCHEMA_VERSION;
        let mut payload =
            serde_json::to_vec_pretty(&to_write).context("serializing run state")?;
        payload.push(b'\n');

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating state directory {}", parent.display()))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.json".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
        file.write_all(&payload)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp state {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        info!(
            path = %self.path.display(),
            processed_ids = state.processed_ids.len(),
            "state saved"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON-over-HTTP client with capped exponential backoff for idempotent calls.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Sends the request produced by `build` and decodes the JSON response.
    ///
    /// With `retry` set, transient failures are retried per the backoff
    /// policy; otherwise the request is attempted exactly once.
    pub async fn send_json<F>(&self, op: &str, build: F, retry: bool) -> Result<JsonValue, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let span = info_span!("http_request", op);
        self.send_json_inner(build, retry).instrument(span).await
    }

    async fn send_json_inner<F>(&self, build: F, retry: bool) -> Result<JsonValue, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let max_retries = if retry { self.backoff.max_retries } else { 0 };
        let mut attempt = 0usize;

        loop {
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let url = resp.url().to_string();
                    let bytes = resp.bytes().await?;

                    if status.is_success() {
                        return serde_json::from_slice(&bytes)
                            .map_err(|source| FetchError::Decode { url, source });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && attempt < max_retries {
                        debug!(%status, attempt, "retrying after transient status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url,
                        body: truncate_for_error(&String::from_utf8_lossy(&bytes), 512),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && attempt < max_retries {
                        debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use httpmock::prelude::*;
    use kudos_core::EventId;
    use tempfile::tempdir;

    fn fast_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        })
        .expect("fetcher")
    }

    #[tokio::test]
    async fn missing_state_file_loads_default() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().await, RunState::default());
    }

    #[tokio::test]
    async fn corrupt_state_file_loads_default() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").expect("write");
        assert_eq!(StateStore::new(&path).load().await, RunState::default());
    }

    #[tokio::test]
    async fn save_then_load_preserves_state_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("nested").join("state.json"));

        let mut state = RunState {
            processed_ids: vec![EventId::new("om_1"), EventId::new("om_2")],
            last_check_time: Utc.timestamp_opt(1_760_000_000, 0).single(),
            ..RunState::default()
        };
        state.rotation_history.insert("张三".into(), vec![1, 4]);
        state.members.insert("张三".into(), "ou_1".into());

        store.save(&state).await.expect("first save");
        state.processed_ids.push(EventId::new("om_3"));
        store.save(&state).await.expect("overwrite");

        assert_eq!(store.load().await, state);
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["state.json".to_string()]);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retryable_status_is_retried_only_when_allowed() {
        let server = MockServer::start();
        let flaky = server.mock(|when, then| {
            when.method(GET).path("/flaky");
            then.status(503).body("busy");
        });
        let fetcher = fast_fetcher();
        let url = server.url("/flaky");

        let err = fetcher
            .send_json("flaky", |c| c.get(&url), true)
            .await
            .expect_err("still failing");
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        flaky.assert_calls(3);

        fetcher
            .send_json("flaky", |c| c.get(&url), false)
            .await
            .expect_err("single attempt");
        flaky.assert_calls(4);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start();
        let forbidden = server.mock(|when, then| {
            when.method(POST).path("/send");
            then.status(403).json_body(serde_json::json!({"code": 99991663}));
        });
        let fetcher = fast_fetcher();
        let url = server.url("/send");

        let err = fetcher
            .send_json("send", |c| c.post(&url), true)
            .await
            .expect_err("forbidden");
        assert!(matches!(err, FetchError::HttpStatus { status: 403, .. }));
        forbidden.assert_calls(1);
    }
}
