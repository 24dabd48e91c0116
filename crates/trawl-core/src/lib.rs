pub mod engine;
pub mod error;
mod files;
pub mod memory_cache;
pub mod models;
pub mod options;
pub mod queue;
pub mod routing;
pub mod sandbox;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use engine::{EngineConfig, EngineStats, FetchEngine};
pub use error::AppError;
pub use memory_cache::MemoryRequestCache;
pub use models::{
    CacheEntry, Cookie, FetchedResponse, HeaderMap, NewCacheEntry, OutboundRequest,
    RequestDescriptor, ResponseBody, compute_hash,
};
pub use options::{FetchOptions, FileTarget, StatusPolicy};
pub use queue::{RateLimitQueue, ThrottleConfig};
pub use routing::{EntrypointTable, ModuleRegistry, ScraperDefinition, ScraperModule};
pub use sandbox::{ControllerConfig, SandboxController, ScrapeContext, SessionOptions};
pub use traits::{
    BodyStream, Clock, DynHttpClient, DynRequestCache, HttpClient, HttpResponse, NullCache,
    RequestCache, SystemClock,
};
