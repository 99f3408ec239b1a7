//! HTTP surface
//!
//! `GET /api` serves queries. `GET /tasks/getyear` and
//! `GET /tasks/getfilms/:year` run one scheduler or paginator step inline and
//! are reserved for administrators.

use crate::api::QueryService;
use crate::config::ApiSettings;
use crate::crawler::{CrawlTask, NextAction, PaginationWindow, SchedulerOutcome, WindowPaginator, YearScheduler};
use crate::interface::{CallerIdentity, FilmDataError, QueryRequest, QueryResponse, QueryStatus};
use axum::extract::{Path, Query};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Response header carrying the cursor of the next search page
pub const NEXT_CURSOR_HEADER: HeaderName = HeaderName::from_static("x-next-cursor");

/// Works out who is calling from request headers
pub struct CallerAuth {
    app_id_header: HeaderName,
    admin_token: String,
}

impl CallerAuth {
    pub fn new(settings: &ApiSettings) -> Result<Self, FilmDataError> {
        let app_id_header = HeaderName::from_bytes(settings.app_id_header.as_bytes())
            .map_err(|e| FilmDataError::ConfigError(format!("api.app_id_header: {}", e)))?;
        Ok(Self { app_id_header, admin_token: settings.admin_token.clone() })
    }

    /// Inbound app id from the configured header; administrator when the
    /// request carries `Authorization: Bearer <admin_token>`.
    pub fn identify(&self, headers: &HeaderMap) -> CallerIdentity {
        let app_id = headers
            .get(&self.app_id_header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let is_admin = !self.admin_token.is_empty()
            && headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .is_some_and(|token| token == self.admin_token);

        CallerIdentity { app_id, is_admin }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiParams {
    pub q: Option<String>,
    pub id: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<String>,
    pub debug: Option<String>,
    pub callback: Option<String>,
}

impl ApiParams {
    fn into_request(self) -> QueryRequest {
        let debug = self
            .debug
            .as_deref()
            .is_some_and(|d| !d.is_empty() && d != "0" && !d.eq_ignore_ascii_case("false"));
        QueryRequest {
            q: self.q,
            id: self.id,
            cursor: self.cursor.filter(|c| !c.is_empty()),
            limit: self.limit.and_then(|l| l.trim().parse().ok()),
            debug,
            callback: self.callback.filter(|c| !c.is_empty()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GetFilmsParams {
    pub from_date: Option<String>,
    pub cursor: Option<String>,
}

/// Build the router with all shared state attached
pub fn router(
    service: Arc<QueryService>,
    scheduler: Arc<YearScheduler>,
    paginator: Arc<WindowPaginator>,
    auth: CallerAuth,
) -> Router {
    Router::new()
        .route("/api", get(handle_api))
        .route("/api/", get(handle_api))
        .route("/tasks/getyear", get(handle_get_year))
        .route("/tasks/getfilms/:year", get(handle_get_films))
        .layer(Extension(service))
        .layer(Extension(scheduler))
        .layer(Extension(paginator))
        .layer(Extension(Arc::new(auth)))
}

/// Serve `app` on `listener` until `shutdown` is cancelled
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!("HTTP server listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

pub async fn handle_api(
    headers: HeaderMap,
    Query(params): Query<ApiParams>,
    Extension(service): Extension<Arc<QueryService>>,
    Extension(auth): Extension<Arc<CallerAuth>>,
) -> Response {
    let caller = auth.identify(&headers);
    let request = params.into_request();

    let response = match tokio::task::spawn_blocking(move || service.handle_query(&caller, &request)).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "Query task failed");
            QueryResponse::empty()
        }
    };

    query_response(response)
}

fn query_response(response: QueryResponse) -> Response {
    if response.status == QueryStatus::Forbidden {
        return StatusCode::FORBIDDEN.into_response();
    }

    let mut http = (
        [(header::CONTENT_TYPE, QueryResponse::CONTENT_TYPE)],
        response.body,
    )
        .into_response();
    if let Some(cursor) = response.next_cursor.and_then(|c| HeaderValue::from_str(&c).ok()) {
        http.headers_mut().insert(NEXT_CURSOR_HEADER, cursor);
    }
    http
}

pub async fn handle_get_year(
    headers: HeaderMap,
    Extension(scheduler): Extension<Arc<YearScheduler>>,
    Extension(auth): Extension<Arc<CallerAuth>>,
) -> Response {
    if !auth.identify(&headers).is_admin {
        return StatusCode::FORBIDDEN.into_response();
    }

    match tokio::task::spawn_blocking(move || scheduler.advance_now()).await {
        Ok(Ok(SchedulerOutcome::Enqueued { year })) => format!("enqueued {}", year).into_response(),
        Ok(Ok(SchedulerOutcome::Exhausted)) => "exhausted".into_response(),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Scheduler step failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Scheduler task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn handle_get_films(
    headers: HeaderMap,
    Path(year): Path<String>,
    Query(params): Query<GetFilmsParams>,
    Extension(paginator): Extension<Arc<WindowPaginator>>,
    Extension(auth): Extension<Arc<CallerAuth>>,
) -> Response {
    if !auth.identify(&headers).is_admin {
        return StatusCode::FORBIDDEN.into_response();
    }

    let Some(year) = parse_year(&year) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let from_date = match params.from_date.as_deref().filter(|d| !d.is_empty()) {
        Some(raw) => match parse_month(raw) {
            Some(date) => date,
            None => return (StatusCode::BAD_REQUEST, "from_date must be YYYY-MM").into_response(),
        },
        None => PaginationWindow::start_of(year).from_date,
    };

    let window = PaginationWindow::new(year, from_date, params.cursor.unwrap_or_default());
    match paginator.run_task(&CrawlTask::GetFilms(window)).await {
        Ok(NextAction::Complete) => "complete".into_response(),
        Ok(NextAction::Continue(next)) => {
            format!("next {} {}", next.from_date.format("%Y-%m"), next.cursor).into_response()
        }
        Err(e) => {
            tracing::error!(year, error = %e, "Get films step failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn parse_year(raw: &str) -> Option<i32> {
    if raw.len() == 4 && raw.chars().all(|c| c.is_ascii_digit()) {
        raw.parse().ok()
    } else {
        None
    }
}

/// `YYYY-MM` (or a full `YYYY-MM-DD`) to the first day of that month
fn parse_month(raw: &str) -> Option<NaiveDate> {
    let month = raw.get(..7)?;
    NaiveDate::parse_from_str(&format!("{}-01", month), "%Y-%m-%d").ok()
}
