//! Upstream film source: the Freebase `mqlread` API
//!
//! One call fetches one page of films released inside a date window. Pages are
//! parsed through a typed boundary (`UpstreamFilm`); an item that does not fit
//! the expected shape is skipped on its own.

use crate::config::UpstreamSettings;
use crate::models::RawFilmRecord;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Date format of the window bounds sent upstream
pub const WINDOW_DATE_FORMAT: &str = "%Y-%m";

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Upstream returned status {0}")]
    Status(u16),
    #[error("Invalid upstream URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Response is not JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One page of upstream results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilmPage {
    /// `None` when the response carried no `result` member
    pub records: Option<Vec<RawFilmRecord>>,
    /// Continuation token; `None` once the window is exhausted
    pub next_cursor: Option<String>,
    /// Raw response body, kept for logging when `records` is `None`
    pub raw: Option<String>,
}

impl FilmPage {
    pub fn with_records(records: Vec<RawFilmRecord>) -> Self {
        Self { records: Some(records), ..Default::default() }
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.next_cursor = Some(cursor.into());
        self
    }

    /// Interpret a decoded `mqlread` response.
    pub fn parse(response: &Value) -> Self {
        let next_cursor = response
            .get("cursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        let Some(items) = response.get("result").and_then(Value::as_array) else {
            return Self {
                records: None,
                next_cursor,
                raw: serde_json::to_string_pretty(response).ok(),
            };
        };

        let records = items
            .iter()
            .filter_map(|item| match UpstreamFilm::deserialize(item) {
                Ok(film) => Some(film.into()),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping upstream film with unexpected shape");
                    None
                }
            })
            .collect();

        Self { records: Some(records), next_cursor, raw: None }
    }
}

/// Wire shape of one `/film/film` result
#[derive(Debug, Deserialize)]
struct UpstreamFilm {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    initial_release_date: Option<String>,
    #[serde(default)]
    imdb_id: Option<ValueField>,
    #[serde(default)]
    gross_revenue: Option<AmountField>,
}

#[derive(Debug, Deserialize)]
struct ValueField {
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AmountField {
    amount: Option<f64>,
}

impl From<UpstreamFilm> for RawFilmRecord {
    fn from(film: UpstreamFilm) -> Self {
        RawFilmRecord {
            id: film.id,
            name: film.name.unwrap_or_default(),
            initial_release_date: film.initial_release_date,
            imdb_id: film.imdb_id.and_then(|f| f.value),
            gross_revenue: film.gross_revenue.and_then(|f| f.amount),
        }
    }
}

/// A paginated source of films by release window
#[async_trait]
pub trait FilmSource: Send + Sync {
    /// Fetch one page of films released in `[from, to)`, continuing `cursor`
    /// when it is non-empty.
    async fn fetch_page(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        cursor: &str,
    ) -> Result<FilmPage, UpstreamError>;
}

/// HTTP client for the Freebase `mqlread` endpoint
pub struct FreebaseClient {
    client: reqwest::Client,
    base_url: String,
    lang: String,
    api_key: String,
    page_limit: u32,
    excluded_genres: Vec<String>,
}

impl FreebaseClient {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(concat!("filmdata/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            lang: settings.lang.clone(),
            api_key: settings.api_key.clone(),
            page_limit: settings.page_limit,
            excluded_genres: settings.excluded_genres.clone(),
        })
    }

    /// MQL query for films released in `[from, to)`
    pub fn film_query(&self, from: NaiveDate, to: NaiveDate) -> Value {
        json!([{
            "ns0:initial_release_date": [{
                "type": "/type/datetime",
                "value": null,
                "value>=": from.format(WINDOW_DATE_FORMAT).to_string(),
            }],
            "ns1:initial_release_date": [{
                "type": "/type/datetime",
                "value": null,
                "value<": to.format(WINDOW_DATE_FORMAT).to_string(),
            }],
            "id": null,
            "initial_release_date": null,
            "limit": self.page_limit,
            "name": null,
            "type": "/film/film",
            "gross_revenue": {
                "amount": null,
                "optional": true,
            },
            "imdb_id": {
                "value": null,
                "limit": 1,
                "optional": true,
            },
            "forbid:genre": {
                "id|=": self.excluded_genres,
                "optional": "forbidden",
            },
        }])
    }

    fn request_url(&self, from: NaiveDate, to: NaiveDate, cursor: &str) -> Result<url::Url, UpstreamError> {
        let query = self.film_query(from, to).to_string();
        let mut params = vec![
            ("lang", self.lang.as_str()),
            ("cursor", cursor),
            ("query", query.as_str()),
        ];
        if !self.api_key.is_empty() {
            params.push(("key", self.api_key.as_str()));
        }
        Ok(url::Url::parse_with_params(&self.base_url, &params)?)
    }
}

#[async_trait]
impl FilmSource for FreebaseClient {
    async fn fetch_page(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        cursor: &str,
    ) -> Result<FilmPage, UpstreamError> {
        let url = self.request_url(from, to, cursor)?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        let decoded: Value = serde_json::from_str(&body)?;
        Ok(FilmPage::parse(&decoded))
    }
}
