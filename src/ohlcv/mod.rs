//! OHLCV ingestion: provider client, ticker registry, fetch service, and
//! the interval scheduler.

pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod service;

pub use provider::{Bar, HistoryQuery, OhlcvProvider, ProviderError, YahooChartProvider};
pub use registry::{StorageInfo, TickerEntry, TickerMap, TickerRegistry, TickerStatus};
pub use scheduler::IntervalScheduler;
pub use service::OhlcvService;
