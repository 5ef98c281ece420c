//! Ingestion run orchestration: window, fetch, dedupe, praise, digest, commit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Utc};
use kudos_adapters::payload::deal_card_subject;
use kudos_adapters::{ChatSource, FeishuClient, FeishuCredentials, SourceError, DEFAULT_API_BASE};
use kudos_core::dedup::DEFAULT_PROCESSED_ID_CAP;
use kudos_core::{
    extract_amount, plan_window, resolve_identity, Deduplicator, Event, EventKind, LookbackPolicy,
    RunState, SenderKind, TemplateCatalog, TemplateSelector, TimeWindow,
};
use kudos_storage::{HttpClientConfig, StateStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod digest;

use digest::{mention_entry, render_digest, MentionEntry};

pub const CRATE_NAME: &str = "kudos-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("FEISHU_APP_ID and FEISHU_APP_SECRET must both be set")]
    MissingCredentials,
    #[error("FEISHU_CHAT_ID must be set")]
    MissingChatId,
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct KudosConfig {
    pub credentials: FeishuCredentials,
    pub chat_id: String,
    pub api_base: String,
    pub admin_handle: Option<String>,
    pub state_file: PathBuf,
    pub lookback: LookbackPolicy,
    pub processed_id_cap: usize,
    pub templates_file: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub schedule_cron: String,
}

impl KudosConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let parse_u64 = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match get(key) {
                None => Ok(default),
                Some(value) => value
                    .parse::<u64>()
                    .ok()
                    .filter(|v| *v > 0)
                    .ok_or(ConfigError::InvalidValue { key, value }),
            }
        };

        let (Some(app_id), Some(app_secret)) = (get("FEISHU_APP_ID"), get("FEISHU_APP_SECRET")) else {
            return Err(ConfigError::MissingCredentials);
        };
        let chat_id = get("FEISHU_CHAT_ID").ok_or(ConfigError::MissingChatId)?;

        let default_lookback = parse_u64("KUDOS_DEFAULT_LOOKBACK_SECS", 6 * 60 * 60)?;
        let max_lookback = parse_u64("KUDOS_MAX_LOOKBACK_SECS", 24 * 60 * 60)?;
        let processed_id_cap = parse_u64("KUDOS_PROCESSED_ID_CAP", DEFAULT_PROCESSED_ID_CAP as u64)?;
        let http_timeout_secs = parse_u64("KUDOS_HTTP_TIMEOUT_SECS", 20)?;

        Ok(Self {
            credentials: FeishuCredentials { app_id, app_secret },
            chat_id,
            api_base: get("FEISHU_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            admin_handle: get("ADMIN_OPEN_ID"),
            state_file: get("STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("state.json")),
            lookback: LookbackPolicy {
                default_lookback: Duration::seconds(default_lookback as i64),
                max_lookback: Duration::seconds(max_lookback as i64),
            },
            processed_id_cap: processed_id_cap as usize,
            templates_file: get("KUDOS_TEMPLATES_FILE").map(PathBuf::from),
            http_timeout_secs,
            schedule_cron: get("KUDOS_SCHEDULE_CRON").unwrap_or_else(|| "0 */30 * * * *".to_string()),
        })
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            chat_id: self.chat_id.clone(),
            admin_handle: self.admin_handle.clone(),
            lookback: self.lookback,
            processed_id_cap: self.processed_id_cap,
        }
    }

    pub fn load_catalog(&self) -> Result<TemplateCatalog> {
        match &self.templates_file {
            Some(path) => TemplateCatalog::from_path(path),
            None => TemplateCatalog::builtin(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub chat_id: String,
    pub admin_handle: Option<String>,
    pub lookback: LookbackPolicy,
    pub processed_id_cap: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub fetched_events: usize,
    pub praised: usize,
    pub digested: usize,
    pub skipped_malformed: usize,
    pub send_failures: usize,
    pub next_check_time: DateTime<Utc>,
}

/// Result of a completed run: the state to persist plus what happened.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunState,
    pub summary: RunSummary,
}

/// Drives one ingestion run against a [`ChatSource`].
pub struct IngestionDriver<S> {
    source: S,
    settings: DriverSettings,
    catalog: TemplateCatalog,
}

impl<S: ChatSource> IngestionDriver<S> {
    pub fn new(source: S, settings: DriverSettings, catalog: TemplateCatalog) -> Self {
        Self {
            source,
            settings,
            catalog,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Runs plan -> fetch -> dedupe -> praise/digest and returns the next state.
    ///
    /// A fetch failure returns `Err` and leaves `state` untouched, so the next
    /// run re-covers the interval. Send failures are per event: the event stays
    /// unprocessed and the watermark is held back to it.
    pub async fn run_once<R: Rng + Send>(
        &self,
        state: &RunState,
        now: DateTime<Utc>,
        effective_date: NaiveDate,
        rng: &mut R,
    ) -> Result<RunOutcome, SourceError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingestion_run", %run_id);
        self.run_inner(run_id, state, now, effective_date, rng)
            .instrument(span)
            .await
    }

    async fn run_inner<R: Rng + Send>(
        &self,
        run_id: Uuid,
        state: &RunState,
        now: DateTime<Utc>,
        effective_date: NaiveDate,
        rng: &mut R,
    ) -> Result<RunOutcome, SourceError> {
        let chat_id = self.settings.chat_id.as_str();
        let window = plan_window(state.last_check_time, now, &self.settings.lookback);
        info!(start = %window.start, end = %window.end, "planned window");

        let bot_handle = self.resolve_bot_handle().await;
        let directory = self.source.fetch_member_directory(chat_id).await?;
        let events = self.source.fetch_events(chat_id, &window).await?;
        info!(count = events.len(), "events fetched");

        let mut next = state.clone();
        if !next.refresh_members(directory) {
            warn!(cached = next.members.len(), "member directory came back empty, using cache");
        }

        let mut dedup = Deduplicator::from_state(state, self.settings.processed_id_cap);
        let mut selector = TemplateSelector::new(rng);
        let pool = self.catalog.pool_for(effective_date);
        let mut tally = Tally::default();
        let mut mentions: Vec<(MentionEntry, DateTime<Utc>)> = Vec::new();

        for event in &events {
            if !dedup.is_new(&event.id) {
                continue;
            }
            let is_deal_candidate =
                event.kind == EventKind::Card && event.sender.kind == SenderKind::Application;
            let is_mention_candidate = bot_handle.is_some()
                && event.sender.kind == SenderKind::Human
                && matches!(event.kind, EventKind::PlainText | EventKind::RichText);
            if !is_deal_candidate && !is_mention_candidate {
                continue;
            }

            let body = match event.payload() {
                Ok(body) => body,
                Err(err) => {
                    warn!(event_id = %event.id, error = %err, "malformed payload, skipping for good");
                    dedup.mark_processed(&event.id);
                    tally.skipped_malformed += 1;
                    continue;
                }
            };

            if is_mention_candidate {
                if let Some(bot) = bot_handle.as_deref() {
                    if let Some(entry) = mention_entry(event, &body, bot, &next.members) {
                        info!(event_id = %event.id, sender = %entry.sender_name, "bot mention detected");
                        mentions.push((entry, event.created_at));
                    }
                }
                continue;
            }

            let Some(raw_name) = deal_card_subject(&body) else {
                continue;
            };
            self.praise(event, &raw_name, &body, &pool, &mut next, &mut selector, &mut dedup, &mut tally)
                .await;
        }

        self.send_digest(&mentions, &mut dedup, &mut tally).await;

        let next_check_time = hold_back_watermark(&window, &tally.failed_at);
        dedup.commit(&mut next);
        next.last_check_time = Some(next_check_time);

        let summary = RunSummary {
            run_id,
            window_start: window.start,
            window_end: window.end,
            fetched_events: events.len(),
            praised: tally.praised,
            digested: tally.digested,
            skipped_malformed: tally.skipped_malformed,
            send_failures: tally.failed_at.len(),
            next_check_time,
        };
        info!(
            praised = summary.praised,
            digested = summary.digested,
            skipped_malformed = summary.skipped_malformed,
            send_failures = summary.send_failures,
            next_check_time = %summary.next_check_time,
            "run complete"
        );
        Ok(RunOutcome {
            state: next,
            summary,
        })
    }

    /// The digest is optional; any problem here only disables it for this run.
    async fn resolve_bot_handle(&self) -> Option<String> {
        if self.settings.admin_handle.is_none() {
            warn!("ADMIN_OPEN_ID not configured, mention digest disabled");
            return None;
        }
        match self.source.fetch_bot_identity().await {
            Ok(Some(handle)) => Some(handle),
            Ok(None) => {
                warn!("bot identity unknown, mention digest disabled");
                None
            }
            Err(err) => {
                warn!(error = %err, "bot identity lookup failed, mention digest disabled");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn praise<R: Rng>(
        &self,
        event: &Event,
        raw_name: &str,
        body: &serde_json::Value,
        pool: &[&str],
        next: &mut RunState,
        selector: &mut TemplateSelector<R>,
        dedup: &mut Deduplicator,
        tally: &mut Tally,
    ) {
        let identity = resolve_identity(raw_name, &next.members);
        let amount = extract_amount(body);
        info!(
            event_id = %event.id,
            raw_name,
            canonical_name = %identity.canonical_name,
            amount = %amount.display_text,
            amount_value = amount.numeric_value,
            handle = identity.handle.as_deref().unwrap_or_default(),
            "deal detected"
        );

        let previous = next.rotation_history.get(&identity.canonical_name).cloned();
        let Some(text) = selector.render(
            &identity.canonical_name,
            &amount.display_text,
            &mut next.rotation_history,
            pool,
        ) else {
            error!(event_id = %event.id, "template pool is empty, cannot praise");
            tally.failed_at.push(event.created_at);
            return;
        };

        match self
            .source
            .send_message(&self.settings.chat_id, &identity, &text)
            .await
        {
            Ok(()) => {
                info!(event_id = %event.id, canonical_name = %identity.canonical_name, "praise sent");
                dedup.mark_processed(&event.id);
                tally.praised += 1;
            }
            Err(err) => {
                error!(event_id = %event.id, error = %err, "praise send failed, will retry next run");
                // The template was never seen, so it stays available.
                match previous {
                    Some(used) => {
                        next.rotation_history.insert(identity.canonical_name.clone(), used);
                    }
                    None => {
                        next.rotation_history.remove(&identity.canonical_name);
                    }
                }
                tally.failed_at.push(event.created_at);
            }
        }
    }

    async fn send_digest(
        &self,
        mentions: &[(MentionEntry, DateTime<Utc>)],
        dedup: &mut Deduplicator,
        tally: &mut Tally,
    ) {
        let Some(admin) = self.settings.admin_handle.as_deref() else {
            return;
        };
        if mentions.is_empty() {
            return;
        }
        let entries: Vec<MentionEntry> = mentions.iter().map(|(entry, _)| entry.clone()).collect();
        let text = render_digest(&entries);
        match self.source.send_direct_message(admin, &text).await {
            Ok(()) => {
                info!(count = entries.len(), "mention digest sent to admin");
                for entry in &entries {
                    dedup.mark_processed(&entry.event_id);
                }
                tally.digested += entries.len();
            }
            Err(err) => {
                error!(error = %err, "mention digest send failed, will retry next run");
                tally.failed_at.extend(mentions.iter().map(|(_, at)| *at));
            }
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    praised: usize,
    digested: usize,
    skipped_malformed: usize,
    failed_at: Vec<DateTime<Utc>>,
}

/// Next check time: the window end, or the earliest failed event (whole
/// seconds, rounded down) so the next window fetches it again.
fn hold_back_watermark(window: &TimeWindow, failed_at: &[DateTime<Utc>]) -> DateTime<Utc> {
    failed_at
        .iter()
        .min()
        .and_then(|earliest| Utc.timestamp_opt(earliest.timestamp(), 0).single())
        .map(|earliest| earliest.min(window.end))
        .unwrap_or(window.end)
}

/// Load state, run once, persist. Nothing is written when the run aborts.
pub async fn run_and_persist<S: ChatSource, R: Rng + Send>(
    driver: &IngestionDriver<S>,
    store: &StateStore,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Result<RunSummary> {
    let state = store.load().await;
    let effective_date = now.with_timezone(&Local).date_naive();
    let outcome = driver
        .run_once(&state, now, effective_date, rng)
        .await
        .context("ingestion run aborted, state left untouched")?;
    store
        .save(&outcome.state)
        .await
        .with_context(|| format!("saving state to {}", store.path().display()))?;
    Ok(outcome.summary)
}

pub fn build_driver(config: &KudosConfig) -> Result<IngestionDriver<FeishuClient>> {
    let catalog = config.load_catalog()?;
    let source = FeishuClient::new(
        &config.api_base,
        config.credentials.clone(),
        HttpClientConfig {
            timeout: std::time::Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(format!("kudos-bot/{}", env!("CARGO_PKG_VERSION"))),
            ..Default::default()
        },
    )?;
    Ok(IngestionDriver::new(source, config.driver_settings(), catalog))
}

pub async fn run_once_from_config(config: &KudosConfig) -> Result<RunSummary> {
    let driver = build_driver(config)?;
    let store = StateStore::new(config.state_file.clone());
    let mut rng = StdRng::from_entropy();
    run_and_persist(&driver, &store, Utc::now(), &mut rng).await
}

/// Cron-driven runner. Ticks that arrive while a run is in flight are skipped.
pub async fn build_scheduler(config: Arc<KudosConfig>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let in_flight = Arc::new(Mutex::new(()));
    let cron = config.schedule_cron.clone();

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = Arc::clone(&config);
        let in_flight = Arc::clone(&in_flight);
        Box::pin(async move {
            let Ok(_guard) = in_flight.try_lock() else {
                warn!("previous run still in progress, skipping tick");
                return;
            };
            match run_once_from_config(&config).await {
                Ok(summary) => info!(run_id = %summary.run_id, praised = summary.praised, "scheduled run finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Human-readable summary of a persisted state document.
pub fn state_report(state: &RunState) -> String {
    let mut lines = vec!["# Kudos State".to_string(), String::new()];
    lines.push(format!("- schema version: {}", state.schema_version));
    lines.push(format!(
        "- last check: {}",
        state
            .last_check_time
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string())
    ));
    lines.push(format!("- processed ids: {}", state.processed_ids.len()));
    lines.push(format!("- cached members: {}", state.members.len()));
    lines.push(String::new());
    lines.push("## Rotation".to_string());
    if state.rotation_history.is_empty() {
        lines.push("- (none)".to_string());
    }
    for (name, used) in &state.rotation_history {
        lines.push(format!("- {name}: {} used this cycle", used.len()));
    }
    lines.join("\n")
}
