//! Posttrade ingestion: drop-file fetching, parsing, and the incremental
//! fetch-and-store service.

pub mod fetcher;
pub mod parser;
pub mod service;

pub use fetcher::{FetchError, PosttradeFetcher};
pub use parser::TradeParser;
pub use service::{FetchSummary, HttpTradeFeed, PartialReport, PosttradeService, TradeFeed};
