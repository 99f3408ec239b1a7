//! Background execution of crawl tasks
//!
//! The worker leases one task at a time from the SQLite queue and runs it
//! through the paginator. A failed task goes back to the queue with an
//! exponential delay; a worker that dies mid-task loses its lease and the task
//! is delivered again.

use crate::config::QueueSettings;
use crate::crawler::{NextAction, WindowPaginator, YearScheduler};
use crate::database::{now_ms, Database};
use crate::interface::FilmDataError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What happened to one leased task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(NextAction),
    Retrying { attempts: u32, delay: Duration },
}

/// Retry delay after `attempts` earlier failures: `base * 2^attempts`, capped
pub fn backoff(attempts: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempts.min(31));
    base.saturating_mul(factor).min(max)
}

pub struct Worker {
    db: Arc<Database>,
    paginator: Arc<WindowPaginator>,
    settings: QueueSettings,
}

impl Worker {
    pub fn new(db: Arc<Database>, paginator: Arc<WindowPaginator>, settings: QueueSettings) -> Self {
        Self { db, paginator, settings }
    }

    /// Lease and run the oldest due task, if any
    pub async fn run_once(&self) -> Result<Option<TaskOutcome>, FilmDataError> {
        let db = Arc::clone(&self.db);
        let lease = Duration::from_secs(self.settings.lease_secs);
        let leased = tokio::task::spawn_blocking(move || db.claim_next(now_ms(), lease)).await??;

        let Some(leased) = leased else {
            return Ok(None);
        };

        let target = leased.task.target();
        match self.paginator.run_task(&leased.task).await {
            Ok(action) => {
                let db = Arc::clone(&self.db);
                tokio::task::spawn_blocking(move || db.complete(leased.id)).await??;
                Ok(Some(TaskOutcome::Completed(action)))
            }
            Err(e) => {
                let delay = backoff(
                    leased.attempts,
                    Duration::from_secs(self.settings.retry_base_secs),
                    Duration::from_secs(self.settings.retry_max_secs),
                );
                tracing::warn!(
                    task = %target,
                    attempts = leased.attempts + 1,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "Task failed"
                );
                let db = Arc::clone(&self.db);
                tokio::task::spawn_blocking(move || db.fail(leased.id, now_ms(), delay)).await??;
                Ok(Some(TaskOutcome::Retrying { attempts: leased.attempts + 1, delay }))
            }
        }
    }

    /// Run due tasks until none is left; returns how many ran
    pub async fn drain(&self) -> Result<usize, FilmDataError> {
        let mut ran = 0;
        while self.run_once().await?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    /// Poll the queue until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let idle = Duration::from_millis(self.settings.poll_interval_ms);
        tracing::info!("Worker started");

        loop {
            let wait = match self.run_once().await {
                Ok(Some(_)) => Duration::ZERO,
                Ok(None) => idle,
                Err(e) => {
                    tracing::error!(error = %e, "Queue error");
                    idle
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!("Worker stopped");
    }
}

/// Invoke the year scheduler every `interval` until `shutdown` is cancelled
pub async fn run_scheduler(scheduler: Arc<YearScheduler>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let scheduler = Arc::clone(&scheduler);
                match tokio::task::spawn_blocking(move || scheduler.advance_now()).await {
                    Ok(Ok(outcome)) => tracing::debug!(?outcome, "Scheduler tick"),
                    Ok(Err(e)) => tracing::error!(error = %e, "Scheduler tick failed"),
                    Err(e) => tracing::error!(error = %e, "Scheduler task panicked"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::{CrawlTask, PaginationWindow};
    use crate::database::TaskDispatcher;
    use crate::indexer::Indexer;
    use crate::models::RawFilmRecord;
    use crate::upstream::{FilmPage, FilmSource, UpstreamError};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parking_lot::Mutex;

    /// Fails the first `failures` calls, then returns one film per window
    struct FlakySource {
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl FilmSource for FlakySource {
        async fn fetch_page(&self, from: NaiveDate, _to: NaiveDate, _cursor: &str) -> Result<FilmPage, UpstreamError> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(UpstreamError::Status(500));
            }
            let id = format!("/m/{}", from);
            Ok(FilmPage::with_records(vec![RawFilmRecord::new(id, "Film").with_release_date(from.to_string())]))
        }
    }

    fn worker(failures: u32, retry_base_secs: u64) -> (Worker, Arc<Database>, Arc<Indexer>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let index = Arc::new(Indexer::new_in_memory().unwrap());
        let source = Arc::new(FlakySource { failures: Mutex::new(failures) });
        let paginator = Arc::new(WindowPaginator::new(source, index.clone(), db.clone()));
        let settings = QueueSettings {
            retry_base_secs,
            retry_max_secs: retry_base_secs.max(600),
            ..QueueSettings::default()
        };
        (Worker::new(db.clone(), paginator, settings), db, index)
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(600);
        assert_eq!(backoff(0, base, max), Duration::from_secs(5));
        assert_eq!(backoff(1, base, max), Duration::from_secs(10));
        assert_eq!(backoff(3, base, max), Duration::from_secs(40));
        assert_eq!(backoff(10, base, max), max);
        assert_eq!(backoff(u32::MAX, base, max), max);
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (worker, _, _) = worker(0, 5);
        assert_eq!(worker.run_once().await.unwrap(), None);
        assert_eq!(worker.drain().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_walks_a_whole_year() {
        let (worker, db, index) = worker(0, 5);
        db.enqueue(&CrawlTask::GetFilms(PaginationWindow::start_of(1975))).unwrap();

        // Twelve fetches plus the terminal step
        assert_eq!(worker.drain().await.unwrap(), 13);
        assert_eq!(db.pending_count().unwrap(), 0);
        assert_eq!(index.num_docs(), 12);
    }

    #[tokio::test]
    async fn test_failed_task_is_rescheduled() {
        let (worker, db, index) = worker(1, 3600);
        db.enqueue(&CrawlTask::GetFilms(PaginationWindow::start_of(1975))).unwrap();

        let outcome = worker.run_once().await.unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::Retrying { attempts: 1, delay: Duration::from_secs(3600) });

        // Still queued, but not due yet
        assert_eq!(db.pending_count().unwrap(), 1);
        assert_eq!(worker.run_once().await.unwrap(), None);
        assert_eq!(index.num_docs(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (worker, _, _) = worker(0, 5);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), worker.run(shutdown)).await.unwrap();
    }
}
