//! Request middleware: tracing with request ids, and endpoint metrics.

pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;
