pub mod client;
pub mod config;
pub mod crawler;
pub mod error;
pub mod paginate;

pub use client::{GraphClient, ListPage, PageSource};
pub use config::{CollectorConfig, GraphConfig, RetryConfig};
pub use crawler::{GraphCrawler, SyncReport};
pub use error::{CollectorError, CollectorResult};
pub use paginate::PagedRows;
