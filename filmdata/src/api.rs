//! Query service behind `/api`
//!
//! Authorizes the caller, answers from the response cache when it can, and
//! otherwise searches the index (or looks up one id) and renders the results
//! as JSON, optionally wrapped in a JSONP callback. Failures never reach the
//! caller: they are logged and answered with an empty body.

use crate::cache::ResponseCache;
use crate::config::ApiSettings;
use crate::indexer::SearchIndex;
use crate::interface::{CallerIdentity, QueryRequest, QueryResponse};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;

static VALID_CALLBACK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\w+(\.\w+)*$").unwrap()
});

/// `callback` when it is a plain (optionally dotted) identifier
pub fn valid_callback(callback: Option<&str>) -> Option<&str> {
    callback.filter(|cb| VALID_CALLBACK.is_match(cb))
}

#[derive(Clone, Copy)]
enum Lookup<'a> {
    Query(&'a str),
    Id(&'a str),
}

impl Lookup<'_> {
    fn cache_key(&self) -> String {
        match self {
            Lookup::Query(q) => format!("q:{}", q),
            Lookup::Id(id) => format!("id:{}", id),
        }
    }
}

pub struct QueryService {
    index: Arc<dyn SearchIndex>,
    cache: Arc<dyn ResponseCache>,
    authorized_apps: Vec<String>,
    default_limit: usize,
    max_limit: usize,
}

impl QueryService {
    pub fn new(index: Arc<dyn SearchIndex>, cache: Arc<dyn ResponseCache>, settings: &ApiSettings) -> Self {
        Self {
            index,
            cache,
            authorized_apps: settings.authorized_apps.clone(),
            default_limit: settings.default_limit,
            max_limit: settings.max_limit,
        }
    }

    pub fn is_authorized(&self, caller: &CallerIdentity) -> bool {
        caller.is_admin
            || caller
                .app_id
                .as_ref()
                .is_some_and(|app| self.authorized_apps.iter().any(|allowed| allowed == app))
    }

    pub fn handle_query(&self, caller: &CallerIdentity, request: &QueryRequest) -> QueryResponse {
        tracing::info!(app_id = ?caller.app_id, admin = caller.is_admin, "API access");
        if !self.is_authorized(caller) {
            return QueryResponse::forbidden();
        }

        // An exact id wins over a free-text query
        let lookup = match (non_blank(request.id.as_deref()), non_blank(request.q.as_deref())) {
            (Some(id), _) => Lookup::Id(id),
            (None, Some(q)) => Lookup::Query(q),
            (None, None) => return QueryResponse::empty(),
        };

        let callback = valid_callback(request.callback.as_deref());
        let limit = request.limit.unwrap_or(self.default_limit).clamp(1, self.max_limit);

        // Cursors only page searches; a lookup ignores them
        let (offset, cacheable) = match lookup {
            Lookup::Query(_) => match request.cursor.as_deref().map(decode_cursor) {
                Some(Some(offset)) => (offset, false),
                Some(None) => {
                    tracing::warn!(cursor = ?request.cursor, "Ignoring request with invalid cursor");
                    return QueryResponse::empty();
                }
                None => (0, limit == self.default_limit),
            },
            Lookup::Id(_) => (0, true),
        };
        let cacheable = cacheable && !request.debug;

        let mut fresh_count = None;
        let mut computed = false;
        let mut compute = || {
            computed = true;
            match lookup {
                Lookup::Query(q) => match self.index.search(q, limit, offset) {
                    Ok(results) if results.is_empty() => None,
                    Ok(results) => {
                        fresh_count = Some(results.len());
                        render(&results, request.debug)
                    }
                    Err(e) => {
                        tracing::error!(query = %q, error = %e, "Search failed");
                        None
                    }
                },
                Lookup::Id(id) => match self.index.get(id) {
                    Ok(Some(film)) => render(&film, request.debug),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::error!(id = %id, error = %e, "Lookup failed");
                        None
                    }
                },
            }
        };

        // Identical concurrent misses share one index query
        let body = if cacheable {
            self.cache.get_or_insert_with(&lookup.cache_key(), Box::new(compute))
        } else {
            compute()
        };

        let Some(body) = body else {
            return QueryResponse::empty();
        };
        if cacheable && !computed {
            tracing::debug!(key = %lookup.cache_key(), "Cache hit");
        }

        let next_cursor = match lookup {
            Lookup::Query(_) => next_cursor(fresh_count.unwrap_or_else(|| count_items(&body)), offset, limit),
            Lookup::Id(_) => None,
        };
        QueryResponse::ok(wrap(callback, body)).with_next_cursor(next_cursor)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn render<T: Serialize + ?Sized>(value: &T, debug: bool) -> Option<String> {
    let rendered = if debug {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(body) => Some(body),
        Err(e) => {
            tracing::error!(error = %e, "Failed to render response");
            None
        }
    }
}

fn wrap(callback: Option<&str>, body: String) -> String {
    match callback {
        Some(cb) => format!("{}({})", cb, body),
        None => body,
    }
}

/// Search cursors carry the offset of the first result of the page.
pub fn encode_cursor(offset: usize) -> String {
    offset.to_string()
}

fn decode_cursor(cursor: &str) -> Option<usize> {
    cursor.trim().parse().ok()
}

/// A full page suggests more results may follow
fn next_cursor(count: usize, offset: usize, limit: usize) -> Option<String> {
    (count == limit).then(|| encode_cursor(offset + limit))
}

fn count_items(body: &str) -> usize {
    serde_json::from_str::<Vec<serde::de::IgnoredAny>>(body)
        .map(|items| items.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MokaResponseCache;
    use crate::indexer::{Indexer, IndexerResult};
    use crate::interface::{FilmResult, QueryStatus};
    use crate::models::{RawFilmRecord, SearchDocument};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    struct Fixture {
        index: Arc<Indexer>,
        service: QueryService,
    }

    fn fixture() -> Fixture {
        let index = Arc::new(Indexer::new_in_memory().unwrap());
        index
            .index_batch(&[
                RawFilmRecord::new("/m/sw", "Star Wars").with_release_date("1977-05-25").with_gross_revenue(775_398_007.0),
                RawFilmRecord::new("/m/st", "Stardust").with_release_date("2007-08-10"),
                RawFilmRecord::new("/m/ss", "Starship Troopers").with_release_date("1997-11-07"),
                RawFilmRecord::new("/m/fg", "Fargo").with_release_date("1996-03-08"),
            ])
            .unwrap();
        let cache = Arc::new(MokaResponseCache::new(100, Duration::from_secs(60)));
        let service = QueryService::new(index.clone(), cache, &ApiSettings::default());
        Fixture { index, service }
    }

    fn decode_results(body: &str) -> Vec<FilmResult> {
        serde_json::from_str(body).unwrap()
    }

    fn app() -> CallerIdentity {
        CallerIdentity::app("ffc-app")
    }

    #[test]
    fn test_callback_validation() {
        assert_eq!(valid_callback(Some("foo")), Some("foo"));
        assert_eq!(valid_callback(Some("foo.bar_2")), Some("foo.bar_2"));
        assert_eq!(valid_callback(Some("foo();alert(1)")), None);
        assert_eq!(valid_callback(Some("foo.")), None);
        assert_eq!(valid_callback(Some("")), None);
        assert_eq!(valid_callback(None), None);
    }

    #[test]
    fn test_unauthorized_caller_is_forbidden() {
        let f = fixture();
        let response = f.service.handle_query(&CallerIdentity::default(), &QueryRequest::search("star"));
        assert_eq!(response.status, QueryStatus::Forbidden);
        assert!(response.body.is_empty());

        let stranger = CallerIdentity::app("other-app");
        assert_eq!(f.service.handle_query(&stranger, &QueryRequest::search("star")).status, QueryStatus::Forbidden);
        assert_eq!(f.index.query_count(), 0);
    }

    #[test]
    fn test_admin_and_dev_app_are_allowed() {
        let f = fixture();
        for caller in [CallerIdentity::admin(), CallerIdentity::app("dev~ffc-app")] {
            let response = f.service.handle_query(&caller, &QueryRequest::search("fargo"));
            assert_eq!(response.status, QueryStatus::Ok);
            assert!(response.body.contains("/m/fg"));
        }
    }

    #[test]
    fn test_blank_query_returns_empty_body() {
        let f = fixture();
        for request in [QueryRequest::default(), QueryRequest::search("   "), QueryRequest::lookup("")] {
            let response = f.service.handle_query(&app(), &request);
            assert_eq!(response, QueryResponse::empty());
        }
        assert_eq!(f.index.query_count(), 0);
    }

    #[test]
    fn test_search_results_ordered_by_rank() {
        let f = fixture();
        let response = f.service.handle_query(&app(), &QueryRequest::search("star"));
        let results = decode_results(&response.body);

        let keys: Vec<&str> = results.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["/m/sw", "/m/st", "/m/ss"]);
        assert_eq!(results[1].year, 2007);
        assert_eq!(results[1].rank, 2007);
        assert!(!response.body.contains('\n'));
    }

    #[test]
    fn test_repeated_query_is_served_from_cache() {
        let f = fixture();
        let first = f.service.handle_query(&app(), &QueryRequest::search("star"));
        assert_eq!(f.index.query_count(), 1);

        let second = f.service.handle_query(&app(), &QueryRequest::search("  star "));
        assert_eq!(f.index.query_count(), 1);
        assert_eq!(first.body, second.body);
    }

    #[test]
    fn test_debug_bypasses_cache_and_indents() {
        let f = fixture();
        f.service.handle_query(&app(), &QueryRequest::search("star"));

        let request = QueryRequest { debug: true, ..QueryRequest::search("star") };
        let response = f.service.handle_query(&app(), &request);
        assert_eq!(f.index.query_count(), 2);
        assert!(response.body.starts_with("[\n  {"));

        // Debug output is never cached
        let again = f.service.handle_query(&app(), &request);
        assert_eq!(f.index.query_count(), 3);
        assert_eq!(again.body, response.body);
    }

    #[test]
    fn test_empty_results_are_not_cached() {
        let f = fixture();
        assert_eq!(f.service.handle_query(&app(), &QueryRequest::search("zzz")), QueryResponse::empty());
        f.service.handle_query(&app(), &QueryRequest::search("zzz"));
        assert_eq!(f.index.query_count(), 2);
    }

    #[test]
    fn test_callback_wraps_cached_and_fresh_responses() {
        let f = fixture();
        let request = QueryRequest { callback: Some("foo.bar".to_string()), ..QueryRequest::search("fargo") };

        let fresh = f.service.handle_query(&app(), &request);
        assert!(fresh.body.starts_with("foo.bar(["));
        assert!(fresh.body.ends_with("])"));

        let cached = f.service.handle_query(&app(), &request);
        assert_eq!(f.index.query_count(), 1);
        assert_eq!(cached.body, fresh.body);

        // Unwrapped value is what sits in the cache
        let plain = f.service.handle_query(&app(), &QueryRequest::search("fargo"));
        assert!(plain.body.starts_with('['));
    }

    #[test]
    fn test_invalid_callback_is_ignored() {
        let f = fixture();
        let request = QueryRequest { callback: Some("foo();alert(1)".to_string()), ..QueryRequest::search("fargo") };
        let response = f.service.handle_query(&app(), &request);
        assert!(response.body.starts_with('['));
    }

    #[test]
    fn test_lookup_by_id() {
        let f = fixture();
        let response = f.service.handle_query(&app(), &QueryRequest::lookup("/m/fg"));
        let film: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(film["key"], "/m/fg");
        assert_eq!(film["title"], "Fargo");
        assert_eq!(film["year"], 1996);
        assert_eq!(response.next_cursor, None);

        assert_eq!(f.service.handle_query(&app(), &QueryRequest::lookup("/m/none")), QueryResponse::empty());
    }

    #[test]
    fn test_cursor_pages_and_bypasses_cache() {
        let f = fixture();
        let page_one = f.service.handle_query(&app(), &QueryRequest { limit: Some(2), ..QueryRequest::search("star") });
        assert_eq!(decode_results(&page_one.body).len(), 2);
        assert_eq!(page_one.next_cursor.as_deref(), Some("2"));

        let request = QueryRequest { limit: Some(2), cursor: page_one.next_cursor.clone(), ..QueryRequest::search("star") };
        let page_two = f.service.handle_query(&app(), &request);
        let results = decode_results(&page_two.body);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "/m/ss");
        assert_eq!(page_two.next_cursor, None);

        f.service.handle_query(&app(), &request);
        assert_eq!(f.index.query_count(), 3);

        let bad = QueryRequest { cursor: Some("later".to_string()), ..QueryRequest::search("star") };
        assert_eq!(f.service.handle_query(&app(), &bad), QueryResponse::empty());
    }

    #[test]
    fn test_lookup_ignores_cursor() {
        let f = fixture();
        let request = QueryRequest { cursor: Some("later".to_string()), ..QueryRequest::lookup("/m/fg") };
        let response = f.service.handle_query(&app(), &request);
        assert!(response.body.contains("\"Fargo\""));
        assert_eq!(response.next_cursor, None);
    }

    /// Index that takes a while to answer and counts its searches
    struct SlowIndex {
        searches: AtomicUsize,
    }

    impl SearchIndex for SlowIndex {
        fn put(&self, _: &[SearchDocument]) -> IndexerResult<()> {
            Ok(())
        }

        fn search(&self, _: &str, _: usize, _: usize) -> IndexerResult<Vec<FilmResult>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            Ok(vec![FilmResult { key: "/m/sw".into(), title: "Star Wars".into(), year: 1977, rank: 1977 }])
        }

        fn get(&self, _: &str) -> IndexerResult<Option<FilmResult>> {
            Ok(None)
        }
    }

    #[test]
    fn test_concurrent_identical_queries_share_one_search() {
        let index = Arc::new(SlowIndex { searches: AtomicUsize::new(0) });
        let cache = Arc::new(MokaResponseCache::new(100, Duration::from_secs(60)));
        let service = Arc::new(QueryService::new(index.clone(), cache, &ApiSettings::default()));

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = Arc::clone(&service);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    service.handle_query(&app(), &QueryRequest::search("star"))
                })
            })
            .collect();

        for handle in handles {
            let response = handle.join().unwrap();
            assert_eq!(decode_results(&response.body)[0].key, "/m/sw");
        }
        assert_eq!(index.searches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_limit_is_capped() {
        let f = fixture();
        let request = QueryRequest { limit: Some(10_000), ..QueryRequest::search("a") };
        let response = f.service.handle_query(&app(), &request);
        assert!(decode_results(&response.body).len() <= ApiSettings::default().max_limit);
    }
}
