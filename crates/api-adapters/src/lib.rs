//! # api-adapters
//!
//! The REST surface of the comment engine on axum: handlers, the response cache
//! glue, the image proxy, page title extraction and Prometheus metrics.

pub mod cache;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod proxy;
pub mod routes;
pub mod state;
pub mod title;

pub use error::ApiError;
pub use metrics::Metrics;
pub use proxy::{ImageProxy, IMAGE_ROUTE};
pub use routes::router;
pub use state::{ApiSettings, AppState};
pub use title::HttpTitleExtractor;
