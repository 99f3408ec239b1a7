//! Crawl state machines
//!
//! `YearScheduler` walks backwards one calendar year per invocation and hands
//! each year to the task queue. `WindowPaginator` then walks that year forward
//! one month-sized window and one upstream page per invocation, re-enqueueing
//! itself until the year is done. All state travels in the task payload or the
//! cursor store, so any invocation can crash and simply be redelivered.

use crate::database::{CursorStore, TaskDispatcher};
use crate::indexer::Indexer;
use crate::interface::FilmDataError;
use crate::upstream::{FilmSource, WINDOW_DATE_FORMAT};
use chrono::{Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where the paginator stands inside one year
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationWindow {
    pub year: i32,
    /// First day of the month being fetched
    pub from_date: NaiveDate,
    /// Upstream continuation token, empty for a fresh window
    #[serde(default)]
    pub cursor: String,
}

impl PaginationWindow {
    /// Fresh window at January 1st of `year`
    pub fn start_of(year: i32) -> Self {
        Self {
            year,
            from_date: NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or_default(),
            cursor: String::new(),
        }
    }

    pub fn new(year: i32, from_date: NaiveDate, cursor: impl Into<String>) -> Self {
        Self { year, from_date, cursor: cursor.into() }
    }
}

/// Unit of work carried by the task queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrawlTask {
    GetFilms(PaginationWindow),
}

impl CrawlTask {
    /// Route the task is addressed to, for logs and status output
    pub fn target(&self) -> String {
        match self {
            CrawlTask::GetFilms(window) => format!("/tasks/getfilms/{}", window.year),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// YEAR SCHEDULER
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerOutcome {
    /// The first window of `year` was enqueued
    Enqueued { year: i32 },
    /// Back-fill reached the oldest year; the cursor was cleared
    Exhausted,
}

/// Picks the next year to crawl, newest first
pub struct YearScheduler {
    cursor: Arc<dyn CursorStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    min_year: i32,
}

impl YearScheduler {
    pub fn new(cursor: Arc<dyn CursorStore>, dispatcher: Arc<dyn TaskDispatcher>, min_year: i32) -> Self {
        Self { cursor, dispatcher, min_year }
    }

    /// One scheduler step.
    ///
    /// Reads the stored year (the current calendar year when none is stored).
    /// While the year before it is not older than `min_year`, that previous
    /// year is stored and the stored year is enqueued; otherwise the cursor is
    /// cleared and nothing is enqueued, so the following step starts over from
    /// `today_year`.
    pub fn advance(&self, today_year: i32) -> Result<SchedulerOutcome, FilmDataError> {
        let year = self.cursor.read()?.unwrap_or(today_year);
        let previous = year - 1;

        if previous < self.min_year {
            self.cursor.clear()?;
            tracing::info!(year, "Back-fill complete, crawl cursor cleared");
            return Ok(SchedulerOutcome::Exhausted);
        }

        // Enqueue before moving the cursor: a crash in between re-enqueues the
        // same year, which is harmless because indexing is an upsert
        self.dispatcher.enqueue(&CrawlTask::GetFilms(PaginationWindow::start_of(year)))?;
        self.cursor.write(previous)?;
        tracing::info!(year, next = previous, "Scheduled year");
        Ok(SchedulerOutcome::Enqueued { year })
    }

    pub fn advance_now(&self) -> Result<SchedulerOutcome, FilmDataError> {
        self.advance(Utc::now().year())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WINDOW PAGINATOR
// ─────────────────────────────────────────────────────────────────────────────

/// What one paginator step should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPlan {
    /// The year is finished (or lies in the future)
    Done,
    /// Fetch films released in `[from, to)`
    Fetch { from: NaiveDate, to: NaiveDate },
}

/// Result of one paginator step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    Complete,
    /// The follow-up window that was enqueued
    Continue(PaginationWindow),
}

/// Decide the fetch range for `window` as of `today`.
///
/// A window is done once its start lies after December 31st of its year or
/// after today. December is fetched as `[Dec 1, Jan 1)`.
pub fn plan(window: &PaginationWindow, today: NaiveDate) -> WindowPlan {
    let last_day = NaiveDate::from_ymd_opt(window.year, 12, 31);
    let past_year = last_day.map_or(true, |last| window.from_date > last);
    if past_year || window.from_date > today {
        return WindowPlan::Done;
    }

    match window.from_date.checked_add_months(Months::new(1)) {
        Some(to) => WindowPlan::Fetch { from: window.from_date, to },
        None => WindowPlan::Done,
    }
}

/// Window to enqueue after fetching `[window.from_date, to)`.
///
/// A continuation token keeps the same month; its absence moves on to `to`
/// with a fresh cursor.
pub fn next_window(window: &PaginationWindow, to: NaiveDate, next_cursor: Option<&str>) -> PaginationWindow {
    match next_cursor.filter(|c| !c.is_empty()) {
        Some(cursor) => PaginationWindow::new(window.year, window.from_date, cursor),
        None => PaginationWindow::new(window.year, to, ""),
    }
}

/// Fetches, indexes and re-enqueues one page of a year
pub struct WindowPaginator {
    source: Arc<dyn FilmSource>,
    index: Arc<Indexer>,
    dispatcher: Arc<dyn TaskDispatcher>,
    retry_malformed_pages: bool,
}

impl WindowPaginator {
    pub fn new(source: Arc<dyn FilmSource>, index: Arc<Indexer>, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self { source, index, dispatcher, retry_malformed_pages: false }
    }

    /// Fail the step on a page without `result` instead of skipping it
    pub fn with_retry_malformed_pages(mut self, retry: bool) -> Self {
        self.retry_malformed_pages = retry;
        self
    }

    pub async fn run_task(&self, task: &CrawlTask) -> Result<NextAction, FilmDataError> {
        match task {
            CrawlTask::GetFilms(window) => self.run(window, Utc::now().date_naive()).await,
        }
    }

    /// Execute one step for `window` as of `today`
    pub async fn run(&self, window: &PaginationWindow, today: NaiveDate) -> Result<NextAction, FilmDataError> {
        let (from, to) = match plan(window, today) {
            WindowPlan::Done => {
                tracing::info!("Got films for: {}", window.year);
                return Ok(NextAction::Complete);
            }
            WindowPlan::Fetch { from, to } => (from, to),
        };

        tracing::info!(
            year = window.year,
            cursor = %window.cursor,
            "Getting films from {} to {}",
            from.format(WINDOW_DATE_FORMAT),
            to.format(WINDOW_DATE_FORMAT)
        );

        let page = self.source.fetch_page(from, to, &window.cursor).await?;

        match page.records {
            Some(records) => {
                let index = Arc::clone(&self.index);
                let report = tokio::task::spawn_blocking(move || index.index_batch(&records)).await??;
                tracing::info!(
                    year = window.year,
                    indexed = report.indexed,
                    skipped = report.skipped,
                    "Indexed page"
                );
            }
            None => {
                let raw = page.raw.unwrap_or_default();
                tracing::error!("Freebase response error: {}", raw);
                if self.retry_malformed_pages {
                    return Err(FilmDataError::MalformedUpstreamResponse(format!(
                        "no result for {} window {}",
                        window.year,
                        from.format(WINDOW_DATE_FORMAT)
                    )));
                }
            }
        }

        let next = next_window(window, to, page.next_cursor.as_deref());
        let dispatcher = Arc::clone(&self.dispatcher);
        let task = CrawlTask::GetFilms(next.clone());
        tokio::task::spawn_blocking(move || dispatcher.enqueue(&task)).await??;
        Ok(NextAction::Continue(next))
    }
}
