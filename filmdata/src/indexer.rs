//! Tantivy indexer for the films index
//!
//! Documents carry a `tokens` field holding every partial substring of the
//! title, so a query word matches when it is a term of that field. Results are
//! ordered by the `rank` fast field, highest first.

use crate::interface::FilmResult;
use crate::models::{RankPolicy, RawFilmRecord, SearchDocument};
use crate::tokenizer::TOKEN_SEPARATOR;
use chrono::Datelike;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::*;
use tantivy::tokenizer::{LowerCaser, RegexTokenizer, TextAnalyzer};
use tantivy::{DocAddress, DocId, Index, IndexReader, IndexWriter, ReloadPolicy, Score, Searcher, Term};
use thiserror::Error;

const PARTIALS_TOKENIZER: &str = "partials";

/// Error type for indexer operations
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),
    #[error("Directory error: {0}")]
    Directory(#[from] tantivy::directory::error::OpenDirectoryError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IndexerResult<T> = Result<T, IndexerError>;

/// Outcome of one `index_batch` call, for operator logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub indexed: usize,
    pub skipped: usize,
}

/// Narrow contract the crawler and the query service use to reach the index
pub trait SearchIndex: Send + Sync {
    /// Upsert `documents` by id and make them visible to readers
    fn put(&self, documents: &[SearchDocument]) -> IndexerResult<()>;

    /// Films matching every word of `query`, highest rank first
    fn search(&self, query: &str, limit: usize, offset: usize) -> IndexerResult<Vec<FilmResult>>;

    /// Film stored under exactly `id`
    fn get(&self, id: &str) -> IndexerResult<Option<FilmResult>>;
}

struct Fields {
    id: Field,
    rank: Field,
    language: Field,
    name: Field,
    tokens: Field,
    imdb_id: Field,
    gross_revenue: Field,
    release_date: Field,
}

/// Tantivy-based films index
pub struct Indexer {
    index: Index,
    writer: RwLock<IndexWriter>,
    reader: RwLock<IndexReader>,
    fields: Fields,
    rank_policy: RankPolicy,
    queries: AtomicU64,
}

impl Indexer {
    /// Open or create an on-disk index at the given path
    pub fn new(path: &Path) -> IndexerResult<Self> {
        std::fs::create_dir_all(path)?;
        let dir = MmapDirectory::open(path)?;
        let schema = Self::build_schema();
        let index = Index::open_or_create(dir, schema.clone())?;
        Self::register_tokenizer(&index)?;

        let writer = index.writer(50_000_000)?;
        let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;

        Self::from_parts(index, writer, reader, &schema)
    }

    /// Create an in-memory index (tests, benchmarks)
    pub fn new_in_memory() -> IndexerResult<Self> {
        let schema = Self::build_schema();
        let index = Index::create_in_ram(schema.clone());
        Self::register_tokenizer(&index)?;

        let writer = index.writer(15_000_000)?;
        let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;

        Self::from_parts(index, writer, reader, &schema)
    }

    /// Rank policy applied by `index_batch`
    pub fn with_rank_policy(mut self, policy: RankPolicy) -> Self {
        self.rank_policy = policy;
        self
    }

    pub fn rank_policy(&self) -> RankPolicy {
        self.rank_policy
    }

    fn from_parts(
        index: Index,
        writer: IndexWriter,
        reader: IndexReader,
        schema: &Schema,
    ) -> IndexerResult<Self> {
        let fields = Fields {
            id: schema.get_field("id")?,
            rank: schema.get_field("rank")?,
            language: schema.get_field("language")?,
            name: schema.get_field("name")?,
            tokens: schema.get_field("tokens")?,
            imdb_id: schema.get_field("imdb_id")?,
            gross_revenue: schema.get_field("gross_revenue")?,
            release_date: schema.get_field("release_date")?,
        };
        Ok(Self {
            index,
            writer: RwLock::new(writer),
            reader: RwLock::new(reader),
            fields,
            rank_policy: RankPolicy::default(),
            queries: AtomicU64::new(0),
        })
    }

    fn build_schema() -> Schema {
        let mut builder = Schema::builder();
        builder.add_text_field("id", STRING | STORED);
        builder.add_i64_field("rank", STORED | FAST);
        builder.add_text_field("language", STRING | STORED);
        builder.add_text_field("name", TEXT | STORED);

        // One term per comma-separated partial, positions are irrelevant
        let tokens_indexing = TextFieldIndexing::default()
            .set_tokenizer(PARTIALS_TOKENIZER)
            .set_index_option(IndexRecordOption::Basic);
        builder.add_text_field(
            "tokens",
            TextOptions::default().set_indexing_options(tokens_indexing),
        );

        builder.add_text_field("imdb_id", STRING | STORED);
        builder.add_i64_field("gross_revenue", STORED);
        builder.add_date_field("release_date", STORED);
        builder.build()
    }

    /// Split the stored `tokens` value back into its partials.
    fn register_tokenizer(index: &Index) -> IndexerResult<()> {
        let pattern = format!("[^{}]+", TOKEN_SEPARATOR);
        let tokenizer = TextAnalyzer::builder(RegexTokenizer::new(&pattern)?)
            .filter(LowerCaser)
            .build();
        index.tokenizers().register(PARTIALS_TOKENIZER, tokenizer);
        Ok(())
    }

    fn to_tantivy_document(&self, document: &SearchDocument) -> TantivyDocument {
        let f = &self.fields;
        let mut doc = TantivyDocument::default();
        doc.add_text(f.id, &document.id);
        doc.add_i64(f.rank, document.rank);
        doc.add_text(f.language, document.language);
        doc.add_text(f.name, &document.name);
        doc.add_text(f.tokens, &document.tokens);
        if let Some(imdb_id) = &document.imdb_id {
            doc.add_text(f.imdb_id, imdb_id);
        }
        doc.add_i64(f.gross_revenue, document.gross_revenue);
        let secs = document
            .release_date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        doc.add_date(f.release_date, tantivy::DateTime::from_timestamp_secs(secs));
        doc
    }

    /// Build, upsert and commit one page of upstream records.
    ///
    /// Records with an empty name are dropped silently. Any other record that
    /// fails to build is logged and skipped; the rest of the batch is still
    /// committed in a single commit.
    pub fn index_batch(&self, records: &[RawFilmRecord]) -> IndexerResult<BatchReport> {
        let mut report = BatchReport::default();
        let mut documents = Vec::with_capacity(records.len());

        for record in records {
            if record.name.is_empty() {
                report.skipped += 1;
                continue;
            }
            match SearchDocument::build(record, self.rank_policy) {
                Ok(document) => documents.push(document),
                Err(e) => {
                    tracing::error!(film = %record.id, error = %e, "Failed to build document");
                    report.skipped += 1;
                }
            }
        }

        self.put(&documents)?;
        report.indexed = documents.len();
        Ok(report)
    }

    pub fn commit(&self) -> IndexerResult<()> {
        self.writer.write().commit()?;
        self.reader.write().reload()?;
        Ok(())
    }

    /// Number of index queries served so far (searches and lookups)
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Get the number of documents in the index
    pub fn num_docs(&self) -> u64 {
        self.reader.read().searcher().num_docs()
    }

    fn build_query(&self, query: &str) -> Option<BooleanQuery> {
        let clauses: Vec<(Occur, Box<dyn Query>)> = query
            .to_lowercase()
            .split(|c: char| c.is_whitespace() || c == TOKEN_SEPARATOR)
            .filter(|word| !word.is_empty())
            .map(|word| {
                let term = Term::from_field_text(self.fields.tokens, word);
                let q: Box<dyn Query> = Box::new(TermQuery::new(term, IndexRecordOption::Basic));
                (Occur::Must, q)
            })
            .collect();

        if clauses.is_empty() {
            None
        } else {
            Some(BooleanQuery::new(clauses))
        }
    }

    fn film_result(&self, searcher: &Searcher, address: DocAddress) -> IndexerResult<FilmResult> {
        let doc: TantivyDocument = searcher.doc(address)?;
        let f = &self.fields;

        let key = doc.get_first(f.id).and_then(|v| v.as_str()).unwrap_or("").to_string();
        let title = doc.get_first(f.name).and_then(|v| v.as_str()).unwrap_or("").to_string();
        let rank = doc.get_first(f.rank).and_then(|v| v.as_i64()).unwrap_or(0);
        let year = doc
            .get_first(f.release_date)
            .and_then(|v| v.as_datetime())
            .and_then(|dt| chrono::DateTime::from_timestamp(dt.into_timestamp_secs(), 0))
            .map(|dt| dt.year())
            .unwrap_or_else(|| crate::models::default_release_date().year());

        Ok(FilmResult { key, title, year, rank })
    }
}

impl SearchIndex for Indexer {
    fn put(&self, documents: &[SearchDocument]) -> IndexerResult<()> {
        if documents.is_empty() {
            return Ok(());
        }

        {
            let writer = self.writer.read();
            for document in documents {
                // Delete existing document with same id (upsert semantics)
                writer.delete_term(Term::from_field_text(self.fields.id, &document.id));
                writer.add_document(self.to_tantivy_document(document))?;
            }
        }

        self.commit()
    }

    fn search(&self, query: &str, limit: usize, offset: usize) -> IndexerResult<Vec<FilmResult>> {
        self.queries.fetch_add(1, Ordering::Relaxed);

        let Some(query) = self.build_query(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let reader = self.reader.read();
        let searcher = reader.searcher();

        let collector = TopDocs::with_limit(limit)
            .and_offset(offset)
            .tweak_score(move |segment_reader: &tantivy::SegmentReader| {
                let ranks = segment_reader.fast_fields().i64("rank").ok();
                move |doc: DocId, _score: Score| {
                    ranks.as_ref().and_then(|column| column.first(doc)).unwrap_or(0)
                }
            });

        let top_docs = searcher.search(&query, &collector)?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (_rank, address) in top_docs {
            results.push(self.film_result(&searcher, address)?);
        }
        Ok(results)
    }

    fn get(&self, id: &str) -> IndexerResult<Option<FilmResult>> {
        self.queries.fetch_add(1, Ordering::Relaxed);

        let reader = self.reader.read();
        let searcher = reader.searcher();

        let query = TermQuery::new(
            Term::from_field_text(self.fields.id, id),
            IndexRecordOption::Basic,
        );
        let top_docs = searcher.search(&query, &TopDocs::with_limit(1))?;

        match top_docs.first() {
            Some((_, address)) => Ok(Some(self.film_result(&searcher, *address)?)),
            None => Ok(None),
        }
    }
}
