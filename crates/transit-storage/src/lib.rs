//! Rate limiting, HTTP fetch utilities and station persistence.

pub mod http;
pub mod postgres;
pub mod rate_limit;
pub mod store;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use postgres::PgStationStore;
pub use rate_limit::{Cancelled, RateLimitConfig, RateLimiter, DEFAULT_STALE_AFTER};
pub use store::{MemoryStationStore, StationStore, StoreError};

pub const CRATE_NAME: &str = "transit-storage";
