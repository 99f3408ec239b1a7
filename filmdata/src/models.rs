//! Core data models for the films index
//!
//! `RawFilmRecord` is the typed form of one upstream film; `SearchDocument` is
//! the immutable document derived from it and handed to the indexer.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::interface::FilmDataError;
use crate::tokenizer::joined_tokens;

/// Release date used when the upstream value is missing or unparsable (2000-01-01)
pub fn default_release_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

/// Language tag attached to every document
pub const DOCUMENT_LANGUAGE: &str = "en";

// ─────────────────────────────────────────────────────────────────────────────
// RAW RECORD
// ─────────────────────────────────────────────────────────────────────────────

/// One film as delivered by the upstream source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFilmRecord {
    pub id: String,
    pub name: String,
    pub initial_release_date: Option<String>,
    pub imdb_id: Option<String>,
    pub gross_revenue: Option<f64>,
}

impl RawFilmRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into(), ..Default::default() }
    }

    pub fn with_release_date(mut self, date: impl Into<String>) -> Self {
        self.initial_release_date = Some(date.into());
        self
    }

    pub fn with_gross_revenue(mut self, amount: f64) -> Self {
        self.gross_revenue = Some(amount);
        self
    }

    pub fn with_imdb_id(mut self, imdb_id: impl Into<String>) -> Self {
        self.imdb_id = Some(imdb_id.into());
        self
    }

    /// Gross revenue truncated to a whole non-negative amount
    pub fn gross_revenue_amount(&self) -> i64 {
        match self.gross_revenue {
            Some(amount) if amount.is_finite() && amount > 0.0 => amount as i64,
            _ => 0,
        }
    }

    pub fn release_date(&self) -> NaiveDate {
        parse_release_date(self.initial_release_date.as_deref())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RANKING
// ─────────────────────────────────────────────────────────────────────────────

/// How a document's rank falls back when gross revenue is zero or unknown.
///
/// One policy applies to a whole deployment; the index orders results by rank
/// descending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankPolicy {
    /// `max(gross_revenue, release_year)`
    #[default]
    ReleaseYear,
    /// `max(gross_revenue, 1000 - title_length)`, shorter titles first
    ShortTitle,
}

impl RankPolicy {
    pub fn rank(&self, gross_revenue: i64, name: &str, release_date: NaiveDate) -> i64 {
        let fallback = match self {
            RankPolicy::ReleaseYear => i64::from(release_date.year()),
            RankPolicy::ShortTitle => 1000 - name.chars().count() as i64,
        };
        gross_revenue.max(fallback).max(0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SEARCH DOCUMENT
// ─────────────────────────────────────────────────────────────────────────────

/// Index document built from one `RawFilmRecord`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchDocument {
    pub id: String,
    pub rank: i64,
    pub language: &'static str,
    pub name: String,
    /// Comma-joined partial substrings of `name`
    pub tokens: String,
    pub imdb_id: Option<String>,
    pub gross_revenue: i64,
    pub release_date: NaiveDate,
}

impl SearchDocument {
    /// Build the document for `record`.
    ///
    /// Fails with `InvalidRecord` when the id or the name is empty.
    pub fn build(record: &RawFilmRecord, policy: RankPolicy) -> Result<Self, FilmDataError> {
        if record.id.trim().is_empty() {
            return Err(FilmDataError::InvalidRecord(format!(
                "film {:?} has no id",
                record.name
            )));
        }
        if record.name.is_empty() {
            return Err(FilmDataError::InvalidRecord(format!("film {} has no name", record.id)));
        }

        let gross_revenue = record.gross_revenue_amount();
        let release_date = record.release_date();

        Ok(Self {
            id: record.id.clone(),
            rank: policy.rank(gross_revenue, &record.name, release_date),
            language: DOCUMENT_LANGUAGE,
            name: record.name.clone(),
            tokens: joined_tokens(&record.name),
            imdb_id: record.imdb_id.clone().filter(|id| !id.is_empty()),
            gross_revenue,
            release_date,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DATE PARSING
// ─────────────────────────────────────────────────────────────────────────────

/// Parse an upstream release date, filling missing parts from the default date.
///
/// Accepts `YYYY`, `YYYY-MM`, `YYYY-MM-DD` (optionally followed by a time) and
/// a few spelled-out forms. Anything else yields `default_release_date()`.
pub fn parse_release_date(raw: Option<&str>) -> NaiveDate {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(parse_lenient)
        .unwrap_or_else(default_release_date)
}

fn parse_lenient(raw: &str) -> Option<NaiveDate> {
    parse_iso_prefix(raw).or_else(|| {
        ["%B %d, %Y", "%d %B %Y", "%b %d, %Y", "%d %b %Y", "%Y/%m/%d"]
            .iter()
            .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
    })
}

fn parse_iso_prefix(raw: &str) -> Option<NaiveDate> {
    let date_part = raw.split(['T', ' ']).next()?;
    let mut parts = date_part.split('-');

    let year_part = parts.next()?;
    if year_part.is_empty() || !year_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = year_part.parse().ok()?;
    let month: u32 = match parts.next() {
        Some(month) => month.parse().ok()?,
        None => default_release_date().month(),
    };
    let day: u32 = match parts.next() {
        Some(day) => day.parse().ok()?,
        None => default_release_date().day(),
    };
    if parts.next().is_some() {
        return None;
    }

    NaiveDate::from_ymd_opt(year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_full_and_partial_dates() {
        assert_eq!(parse_release_date(Some("1977-05-25")), date(1977, 5, 25));
        assert_eq!(parse_release_date(Some("1977-05")), date(1977, 5, 1));
        assert_eq!(parse_release_date(Some("1977")), date(1977, 1, 1));
        assert_eq!(parse_release_date(Some("1977-05-25T00:00:00")), date(1977, 5, 25));
        assert_eq!(parse_release_date(Some("May 25, 1977")), date(1977, 5, 25));
    }

    #[test]
    fn test_parse_falls_back_to_default() {
        assert_eq!(parse_release_date(None), default_release_date());
        assert_eq!(parse_release_date(Some("")), default_release_date());
        assert_eq!(parse_release_date(Some("sometime")), default_release_date());
        assert_eq!(parse_release_date(Some("1977-13-40")), default_release_date());
    }

    #[test]
    fn test_short_title_rank_fallback() {
        let record = RawFilmRecord::new("/m/ab", "AB").with_gross_revenue(0.0);
        let doc = SearchDocument::build(&record, RankPolicy::ShortTitle).unwrap();
        assert_eq!(doc.rank, 998);
    }

    #[test]
    fn test_release_year_rank_fallback() {
        let record = RawFilmRecord::new("/m/jaws", "Jaws").with_release_date("1975-06-20");
        let doc = SearchDocument::build(&record, RankPolicy::ReleaseYear).unwrap();
        assert_eq!(doc.rank, 1975);
        assert_eq!(doc.release_date, date(1975, 6, 20));
    }

    #[test]
    fn test_rank_never_below_gross_revenue() {
        for policy in [RankPolicy::ReleaseYear, RankPolicy::ShortTitle] {
            for gross in [0.0, 12.0, 1999.5, 470_653_000.0] {
                let record = RawFilmRecord::new("/m/x", "Some Film").with_gross_revenue(gross);
                let doc = SearchDocument::build(&record, policy).unwrap();
                assert!(doc.rank >= doc.gross_revenue);
                assert!(doc.rank >= 0);
            }
        }
    }

    #[test]
    fn test_negative_or_missing_revenue_is_zero() {
        assert_eq!(RawFilmRecord::new("a", "b").gross_revenue_amount(), 0);
        assert_eq!(RawFilmRecord::new("a", "b").with_gross_revenue(-5.0).gross_revenue_amount(), 0);
        assert_eq!(RawFilmRecord::new("a", "b").with_gross_revenue(41.9).gross_revenue_amount(), 41);
    }

    #[test]
    fn test_very_long_title_rank_is_non_negative() {
        let record = RawFilmRecord::new("/m/long", "x".repeat(1500));
        let doc = SearchDocument::build(&record, RankPolicy::ShortTitle).unwrap();
        assert_eq!(doc.rank, 0);
    }

    #[test]
    fn test_build_rejects_empty_name_and_id() {
        let no_name = RawFilmRecord::new("/m/1", "");
        assert!(matches!(
            SearchDocument::build(&no_name, RankPolicy::default()),
            Err(FilmDataError::InvalidRecord(_))
        ));

        let no_id = RawFilmRecord::new("", "Vertigo");
        assert!(matches!(
            SearchDocument::build(&no_id, RankPolicy::default()),
            Err(FilmDataError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_document_fields() {
        let record = RawFilmRecord::new("/m/up", "Up")
            .with_release_date("2009")
            .with_imdb_id("tt1049413")
            .with_gross_revenue(735_099_082.0);
        let doc = SearchDocument::build(&record, RankPolicy::ReleaseYear).unwrap();

        assert_eq!(doc.language, "en");
        assert_eq!(doc.tokens, "u,p,up");
        assert_eq!(doc.imdb_id.as_deref(), Some("tt1049413"));
        assert_eq!(doc.gross_revenue, 735_099_082);
        assert_eq!(doc.rank, 735_099_082);
    }
}
