pub mod cache;
pub mod config;

pub use cache::SqliteRequestCache;
pub use config::{CacheConfig, CacheLocation};
