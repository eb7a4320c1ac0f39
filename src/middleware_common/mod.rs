//! Ready-to-use middleware for OJS job processing: logging, timeouts,
//! in-process retries, and metrics.
//!
//! Enabled by the `common-middleware` feature (on by default):
//!
//! ```toml
//! [dependencies]
//! ojs-worker = { version = "0.1", features = ["common-middleware"] }
//! ```

pub mod logging;
pub mod metrics;
pub mod retry;
pub mod timeout;
