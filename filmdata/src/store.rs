//! FilmStore: the assembled service
//!
//! Owns the database, the index and the cache, and hands out the pieces built
//! on top of them (query service, scheduler, paginator, worker, router).
//! Everything is `Arc`-shared so the HTTP server and the worker can run side by
//! side on one runtime.

use crate::api::QueryService;
use crate::cache::{MokaResponseCache, ResponseCache};
use crate::config::Settings;
use crate::crawler::{CrawlTask, PaginationWindow, SchedulerOutcome, WindowPaginator, YearScheduler};
use crate::database::{CursorStore, Database, TaskDispatcher};
use crate::indexer::Indexer;
use crate::interface::{CallerIdentity, FilmDataError, QueryRequest, QueryResponse};
use crate::server::{self, CallerAuth};
use crate::upstream::{FilmSource, FreebaseClient};
use crate::worker::Worker;
use std::sync::Arc;

/// Snapshot reported by `filmdata status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStatus {
    pub cursor_year: Option<i32>,
    pub pending_tasks: u64,
    pub pending_targets: Vec<String>,
    pub indexed_documents: u64,
}

pub struct FilmStore {
    settings: Settings,
    db: Arc<Database>,
    indexer: Arc<Indexer>,
    service: Arc<QueryService>,
    scheduler: Arc<YearScheduler>,
    paginator: Arc<WindowPaginator>,
}

impl FilmStore {
    /// Open the on-disk store under `settings.storage.data_dir`
    pub fn open(settings: Settings) -> Result<Self, FilmDataError> {
        let db = Database::open(settings.database_path())?;
        let indexer = Indexer::new(&settings.index_path())?;
        let source = FreebaseClient::new(&settings.upstream)?;
        tracing::info!(data_dir = %settings.storage.data_dir.display(), "Opened film store");
        Self::from_parts(settings, db, indexer, Arc::new(source))
    }

    /// Store backed by in-memory SQLite and Tantivy, fed by `source`
    pub fn new_in_memory(settings: Settings, source: Arc<dyn FilmSource>) -> Result<Self, FilmDataError> {
        let db = Database::open_in_memory()?;
        let indexer = Indexer::new_in_memory()?;
        Self::from_parts(settings, db, indexer, source)
    }

    fn from_parts(
        settings: Settings,
        db: Database,
        indexer: Indexer,
        source: Arc<dyn FilmSource>,
    ) -> Result<Self, FilmDataError> {
        let db = Arc::new(db);
        let indexer = Arc::new(indexer.with_rank_policy(settings.crawler.rank_policy));
        let cache: Arc<dyn ResponseCache> = Arc::new(MokaResponseCache::from_settings(&settings.cache));

        let service = Arc::new(QueryService::new(indexer.clone(), cache, &settings.api));
        let scheduler = Arc::new(YearScheduler::new(db.clone(), db.clone(), settings.crawler.min_year));
        let paginator = Arc::new(
            WindowPaginator::new(source, indexer.clone(), db.clone())
                .with_retry_malformed_pages(settings.crawler.retry_malformed_pages),
        );

        Ok(Self { settings, db, indexer, service, scheduler, paginator })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn scheduler(&self) -> &Arc<YearScheduler> {
        &self.scheduler
    }

    pub fn paginator(&self) -> &Arc<WindowPaginator> {
        &self.paginator
    }

    pub fn worker(&self) -> Worker {
        Worker::new(self.db.clone(), self.paginator.clone(), self.settings.queue.clone())
    }

    pub fn router(&self) -> Result<axum::Router, FilmDataError> {
        let auth = CallerAuth::new(&self.settings.api)?;
        Ok(server::router(
            self.service.clone(),
            self.scheduler.clone(),
            self.paginator.clone(),
            auth,
        ))
    }

    /// Answer an API request (blocking; index work runs on the caller's thread)
    pub fn query(&self, caller: &CallerIdentity, request: &QueryRequest) -> QueryResponse {
        self.service.handle_query(caller, request)
    }

    /// One year-scheduler step against today's date
    pub fn get_year(&self) -> Result<SchedulerOutcome, FilmDataError> {
        self.scheduler.advance_now()
    }

    /// Enqueue the first window of `year` without touching the crawl cursor
    pub fn enqueue_year(&self, year: i32) -> Result<(), FilmDataError> {
        self.db.enqueue(&CrawlTask::GetFilms(PaginationWindow::start_of(year)))?;
        Ok(())
    }

    /// Stop the back-fill: the next scheduler step starts from the current year
    pub fn reset_cursor(&self) -> Result<(), FilmDataError> {
        self.db.clear()?;
        Ok(())
    }

    pub fn status(&self) -> Result<StoreStatus, FilmDataError> {
        Ok(StoreStatus {
            cursor_year: self.db.read()?,
            pending_tasks: self.db.pending_count()?,
            pending_targets: self.db.pending_targets()?,
            indexed_documents: self.indexer.num_docs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RankPolicy;
    use crate::upstream::{FilmPage, UpstreamError};
    use async_trait::async_trait;
    use chrono::NaiveDate;

    struct EmptySource;

    #[async_trait]
    impl FilmSource for EmptySource {
        async fn fetch_page(&self, _: NaiveDate, _: NaiveDate, _: &str) -> Result<FilmPage, UpstreamError> {
            Ok(FilmPage::with_records(Vec::new()))
        }
    }

    fn store(settings: Settings) -> FilmStore {
        FilmStore::new_in_memory(settings, Arc::new(EmptySource)).unwrap()
    }

    #[test]
    fn test_status_of_fresh_store() {
        let store = store(Settings::default());
        let status = store.status().unwrap();
        assert_eq!(
            status,
            StoreStatus { cursor_year: None, pending_tasks: 0, pending_targets: Vec::new(), indexed_documents: 0 }
        );
    }

    #[test]
    fn test_get_year_and_reset() {
        let store = store(Settings::default());
        assert!(matches!(store.get_year().unwrap(), SchedulerOutcome::Enqueued { .. }));
        let status = store.status().unwrap();
        assert!(status.cursor_year.is_some());
        assert_eq!(status.pending_tasks, 1);

        store.reset_cursor().unwrap();
        assert_eq!(store.status().unwrap().cursor_year, None);
    }

    #[test]
    fn test_enqueue_year_leaves_cursor_alone() {
        let store = store(Settings::default());
        store.enqueue_year(1984).unwrap();
        let status = store.status().unwrap();
        assert_eq!(status.cursor_year, None);
        assert_eq!(status.pending_targets, vec!["/tasks/getfilms/1984"]);
    }

    #[test]
    fn test_rank_policy_comes_from_settings() {
        let mut settings = Settings::default();
        settings.crawler.rank_policy = RankPolicy::ShortTitle;
        let store = store(settings);
        assert_eq!(store.indexer().rank_policy(), RankPolicy::ShortTitle);
    }

    #[test]
    fn test_router_rejects_bad_header_name() {
        let mut settings = Settings::default();
        settings.api.app_id_header = "not a header".to_string();
        assert!(matches!(store(settings).router(), Err(FilmDataError::ConfigError(_))));
    }
}
