//! filmdata - films crawler, index and query service
//!
//! Harvests films from the Freebase `mqlread` API year by year and month by
//! month, indexes every partial substring of each title in Tantivy, and serves
//! ranked prefix/substring queries (JSON or JSONP) with a response cache in
//! front. Crawl progress lives in SQLite so a restarted process resumes where
//! it stopped.

pub mod api;
pub mod cache;
pub mod config;
pub mod crawler;
pub mod database;
pub mod indexer;
pub mod interface;
pub mod logging;
pub mod models;
pub mod server;
mod store;
pub mod tokenizer;
pub mod upstream;
pub mod worker;

pub use interface::*;
pub use store::{FilmStore, StoreStatus};
