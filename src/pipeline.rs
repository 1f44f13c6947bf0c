use chrono::Utc;
use std::collections::HashSet;
use std::fmt;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::ai::CoverLetterWriter;
use crate::config::{AppConfig, ConfigError};
use crate::db::{SeenStore, StoreError};
use crate::matcher::score_posting;
use crate::models::{NotifyStatus, Posting, Profile, RawPosting, ScoredPosting};
use crate::notifier::{BatchContext, NotificationSink};
use crate::retry::RetryPolicy;
use crate::source::{FetchError, Page, PostingSource};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Starting,
    Fetching,
    Deduping,
    Scoring,
    Filtering,
    Notifying,
    Done,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Starting => "STARTING",
            RunState::Fetching => "FETCHING",
            RunState::Deduping => "DEDUPING",
            RunState::Scoring => "SCORING",
            RunState::Filtering => "FILTERING",
            RunState::Notifying => "NOTIFYING",
            RunState::Done => "DONE",
            RunState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("fetch failed in {state}: {reason}")]
    Fetch { state: RunState, reason: String },

    #[error("store unavailable in {state}: {source}")]
    Store {
        state: RunState,
        #[source]
        source: StoreError,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RunError {
    pub fn state(&self) -> RunState {
        match self {
            RunError::Fetch { state, .. } | RunError::Store { state, .. } => *state,
            RunError::Config(_) => RunState::Starting,
        }
    }

    pub fn class(&self) -> &'static str {
        match self {
            RunError::Fetch { .. } => "FatalFetchError",
            RunError::Store { .. } => "StoreUnavailableError",
            RunError::Config(_) => "ConfigError",
        }
    }
}

/// An aborted run: the error plus whatever was counted before it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunAborted {
    #[source]
    pub error: RunError,
    pub summary: RunSummary,
}

impl From<RunError> for RunAborted {
    fn from(error: RunError) -> Self {
        Self {
            error,
            summary: RunSummary {
                state: RunState::Aborted,
                ..Default::default()
            },
        }
    }
}

impl From<ConfigError> for RunAborted {
    fn from(error: ConfigError) -> Self {
        RunError::from(error).into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    pub page: u32,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// 1-based, as shown to users.
    pub batch: usize,
    pub attempts: u32,
    pub reason: String,
    pub postings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub fetched: usize,
    pub new: usize,
    pub matched: usize,
    pub notified: usize,
    pub failed: usize,
    pub pages_ok: u32,
    /// Job detail pages dropped from otherwise successful listing pages.
    pub detail_failures: usize,
    pub skipped_pages: Vec<PageFailure>,
    pub failed_batches: Vec<BatchFailure>,
    pub cover_letters: usize,
    pub state: RunState,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  State:     {}", self.state)?;
        writeln!(f, "  Fetched:   {}", self.fetched)?;
        writeln!(f, "  New:       {}", self.new)?;
        writeln!(f, "  Matched:   {}", self.matched)?;
        writeln!(f, "  Notified:  {}", self.notified)?;
        writeln!(f, "  Failed:    {}", self.failed)?;
        if self.cover_letters > 0 {
            writeln!(f, "  Cover letters: {}", self.cover_letters)?;
        }
        if self.detail_failures > 0 {
            writeln!(f, "  Job pages that failed to load: {}", self.detail_failures)?;
        }
        for page in &self.skipped_pages {
            writeln!(
                f,
                "  Skipped page {} after {} attempt(s): {}",
                page.page, page.attempts, page.reason
            )?;
        }
        for batch in &self.failed_batches {
            writeln!(
                f,
                "  Failed batch {} after {} attempt(s): {}",
                batch.batch, batch.attempts, batch.reason
            )?;
            for title in &batch.postings {
                writeln!(f, "    - {}", title)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub max_pages: u32,
    pub page_delay: Duration,
    pub batch_size: usize,
    pub notifications_enabled: bool,
    pub cover_letters_enabled: bool,
    pub fetch_retry: RetryPolicy,
    pub notify_retry: RetryPolicy,
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            max_pages: config.scraper.max_pages,
            page_delay: config.page_delay()?,
            batch_size: config.notifications.batch_size,
            notifications_enabled: config.notifications.enabled,
            cover_letters_enabled: config.cover_letter.enabled,
            fetch_retry: config.retry.fetch_policy(),
            notify_retry: config.retry.notify_policy(),
        })
    }
}

/// One pass of fetch → dedupe → score → filter → notify.
///
/// Every new posting is recorded in the store before any notification goes
/// out, so an interrupted run can skip a posting but never alert twice.
pub struct Pipeline<'a> {
    source: &'a dyn PostingSource,
    store: &'a dyn SeenStore,
    sink: Option<&'a dyn NotificationSink>,
    cover_letters: Option<&'a dyn CoverLetterWriter>,
    profile: &'a Profile,
    options: PipelineOptions,
    state: RunState,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        source: &'a dyn PostingSource,
        store: &'a dyn SeenStore,
        profile: &'a Profile,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            store,
            sink: None,
            cover_letters: None,
            profile,
            options,
            state: RunState::Starting,
        }
    }

    pub fn with_sink(mut self, sink: &'a dyn NotificationSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_cover_letters(mut self, writer: &'a dyn CoverLetterWriter) -> Self {
        self.cover_letters = Some(writer);
        self
    }

    /// On abort the error carries the partial summary, including batches that
    /// already went out.
    pub fn run(&mut self) -> Result<RunSummary, RunAborted> {
        let mut summary = RunSummary::default();
        match self.run_stages(&mut summary) {
            Ok(()) => {
                self.enter(RunState::Done);
                summary.state = RunState::Done;
                tracing::info!(
                    fetched = summary.fetched,
                    new = summary.new,
                    notified = summary.notified,
                    failed = summary.failed,
                    "run complete"
                );
                Ok(summary)
            }
            Err(error) => {
                tracing::error!(state = %self.state, class = error.class(), %error, "run aborted");
                self.state = RunState::Aborted;
                summary.state = RunState::Aborted;
                Err(RunAborted { error, summary })
            }
        }
    }

    fn run_stages(&mut self, summary: &mut RunSummary) -> Result<(), RunError> {
        self.enter(RunState::Fetching);
        let raw = self.fetch(summary)?;
        summary.fetched = raw.len();

        self.enter(RunState::Deduping);
        let fresh = self.dedupe(raw)?;
        summary.new = fresh.len();

        self.enter(RunState::Scoring);
        let scored: Vec<ScoredPosting> = fresh
            .iter()
            .map(|posting| score_posting(posting, self.profile))
            .collect();

        self.enter(RunState::Filtering);
        let kept = self.filter_and_record(scored)?;
        summary.matched = kept.len();

        self.enter(RunState::Notifying);
        self.notify(kept, summary)?;
        Ok(())
    }

    fn enter(&mut self, next: RunState) {
        tracing::debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
    }

    fn store_err(&self, source: StoreError) -> RunError {
        RunError::Store {
            state: self.state,
            source,
        }
    }

    fn fetch(&self, summary: &mut RunSummary) -> Result<Vec<RawPosting>, RunError> {
        let mut postings = Vec::new();

        for page in 1..=self.options.max_pages {
            if page > 1 && !self.options.page_delay.is_zero() {
                thread::sleep(self.options.page_delay);
            }

            let outcome = self.options.fetch_retry.run(
                |attempt| {
                    if attempt > 1 {
                        tracing::info!(page, attempt, "retrying page");
                    }
                    self.source.fetch_page(page)
                },
                FetchError::is_transient,
            );

            match outcome.result {
                Ok(Page {
                    postings: batch,
                    detail_failures,
                }) => {
                    summary.pages_ok += 1;
                    summary.detail_failures += detail_failures;
                    tracing::info!(page, postings = batch.len(), detail_failures, "page fetched");
                    if batch.is_empty() {
                        break;
                    }
                    postings.extend(batch);
                }
                Err(FetchError::Transient(reason)) => {
                    tracing::warn!(page, attempts = outcome.attempts, %reason, "skipping page");
                    summary.skipped_pages.push(PageFailure {
                        page,
                        attempts: outcome.attempts,
                        reason,
                    });
                }
                Err(FetchError::Fatal(reason)) => {
                    return Err(RunError::Fetch {
                        state: self.state,
                        reason: format!("page {}: {}", page, reason),
                    });
                }
            }
        }

        if summary.pages_ok == 0 {
            return Err(RunError::Fetch {
                state: self.state,
                reason: format!(
                    "no page could be fetched ({} skipped)",
                    summary.skipped_pages.len()
                ),
            });
        }
        Ok(postings)
    }

    fn dedupe(&self, raw: Vec<RawPosting>) -> Result<Vec<Posting>, RunError> {
        let now = Utc::now();
        let mut seen_this_run = HashSet::new();
        let mut fresh = Vec::new();

        for item in raw {
            let posting = Posting::from_raw(item, now);
            if !seen_this_run.insert(posting.id.clone()) {
                tracing::debug!(id = %posting.id, "duplicate within run");
                continue;
            }
            if self.store.is_new(&posting).map_err(|e| self.store_err(e))? {
                fresh.push(posting);
            }
        }
        tracing::info!(new = fresh.len(), "deduplicated postings");
        Ok(fresh)
    }

    /// Records every new posting and returns the ones at or above the
    /// threshold, highest score first.
    fn filter_and_record(&self, scored: Vec<ScoredPosting>) -> Result<Vec<ScoredPosting>, RunError> {
        let threshold = self.profile.min_match_score;
        let mut kept = Vec::new();

        for job in scored {
            let status = if job.score >= threshold {
                NotifyStatus::Pending
            } else {
                NotifyStatus::Skipped
            };
            self.store.record(&job, status).map_err(|e| self.store_err(e))?;
            if status == NotifyStatus::Pending {
                kept.push(job);
            }
        }

        kept.sort_by(|a, b| b.score.cmp(&a.score));
        tracing::info!(matched = kept.len(), threshold, "filtered postings");
        Ok(kept)
    }

    fn notify(&self, kept: Vec<ScoredPosting>, summary: &mut RunSummary) -> Result<(), RunError> {
        let sink = match self.sink {
            Some(sink) if self.options.notifications_enabled => sink,
            _ => {
                tracing::info!(pending = kept.len(), "notifications disabled");
                return Ok(());
            }
        };
        if kept.is_empty() {
            return Ok(());
        }

        let batch_size = self.options.batch_size.max(1);
        let total_batches = kept.len().div_ceil(batch_size);

        for (index, batch) in kept.chunks(batch_size).enumerate() {
            let ctx = BatchContext {
                index,
                total_batches,
                total_postings: kept.len(),
            };
            let outcome = self.options.notify_retry.run(|_| sink.send(batch, ctx), |_| true);
            let ids: Vec<&str> = batch.iter().map(|j| j.posting.id.as_str()).collect();

            match outcome.result {
                Ok(()) => {
                    tracing::info!(batch = index + 1, of = total_batches, jobs = batch.len(), "batch sent");
                    // Counted before the write so an abort still reports what went out.
                    summary.notified += batch.len();
                    self.store
                        .mark_status(&ids, NotifyStatus::Notified)
                        .map_err(|e| self.store_err(e))?;
                    self.write_cover_letters(batch, summary)?;
                }
                Err(e) => {
                    tracing::warn!(
                        batch = index + 1,
                        attempts = outcome.attempts,
                        error = %e,
                        "batch failed, marking postings as seen"
                    );
                    summary.failed += batch.len();
                    summary.failed_batches.push(BatchFailure {
                        batch: index + 1,
                        attempts: outcome.attempts,
                        reason: e.to_string(),
                        postings: batch
                            .iter()
                            .map(|j| format!("{} at {}", j.posting.title, j.posting.company))
                            .collect(),
                    });
                    self.store
                        .mark_status(&ids, NotifyStatus::Failed)
                        .map_err(|e| self.store_err(e))?;
                }
            }
        }

        if let Err(e) = sink.send_summary(summary) {
            tracing::warn!(error = %e, "failed to send run summary");
        }
        Ok(())
    }

    fn write_cover_letters(&self, batch: &[ScoredPosting], summary: &mut RunSummary) -> Result<(), RunError> {
        let writer = match self.cover_letters {
            Some(writer) if self.options.cover_letters_enabled => writer,
            _ => return Ok(()),
        };

        for job in batch {
            match writer.write(job, self.profile) {
                Ok(text) => {
                    self.store
                        .save_cover_letter(&job.posting.id, &text)
                        .map_err(|e| self.store_err(e))?;
                    summary.cover_letters += 1;
                }
                Err(e) => {
                    tracing::warn!(id = %job.posting.id, error = %e, "cover letter failed, continuing without");
                }
            }
        }
        Ok(())
    }
}
