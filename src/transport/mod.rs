#[cfg(feature = "reqwest-transport")]
pub(crate) mod http;
pub mod retryable;

#[cfg(feature = "reqwest-transport")]
pub use self::http::HttpTransport;
pub use self::retryable::{RetryConfig, RetryableTransport};

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// HTTP method for transport requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        })
    }
}

/// The future returned by [`Transport::request`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = crate::Result<serde_json::Value>> + Send + 'a>>;

/// An abstract transport layer for communicating with an OJS server.
///
/// This trait is object-safe and uses `Pin<Box<dyn Future>>` for async support.
/// The default implementation uses reqwest (enabled via the `reqwest-transport`
/// feature). Implement it to provide in-memory transports for tests or other
/// HTTP clients.
///
/// Failures must be reported as [`OjsError`](crate::OjsError) values whose
/// [`is_retryable`](crate::OjsError::is_retryable) flag is accurate:
/// [`RetryableTransport`] relies on it.
///
/// # Example
///
/// ```rust,no_run
/// use ojs_worker::transport::{Method, Transport, TransportFuture};
///
/// #[derive(Debug)]
/// struct MyTransport;
///
/// impl Transport for MyTransport {
///     fn request(
///         &self,
///         method: Method,
///         path: &str,
///         body: Option<serde_json::Value>,
///     ) -> TransportFuture<'_> {
///         Box::pin(async move { Ok(serde_json::json!({})) })
///     }
/// }
/// ```
pub trait Transport: Send + Sync + Debug {
    /// Send a request with the given method, path, and optional JSON body.
    ///
    /// `path` is relative to the OJS base path (e.g., `/jobs`,
    /// `/workers/fetch`). Empty response bodies are returned as `{}`.
    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> TransportFuture<'_>;
}

/// A cloneable, type-erased transport handle.
pub type DynTransport = Arc<dyn Transport>;

// ---------------------------------------------------------------------------
// Typed helper functions for working with DynTransport
// ---------------------------------------------------------------------------

pub(crate) async fn transport_get<T: serde::de::DeserializeOwned>(
    transport: &DynTransport,
    path: &str,
) -> crate::Result<T> {
    let value = transport.request(Method::Get, path, None).await?;
    deserialize_response(value)
}

pub(crate) async fn transport_post<B: serde::Serialize, T: serde::de::DeserializeOwned>(
    transport: &DynTransport,
    path: &str,
    body: &B,
) -> crate::Result<T> {
    let body = serde_json::to_value(body)?;
    let value = transport.request(Method::Post, path, Some(body)).await?;
    deserialize_response(value)
}

pub(crate) async fn transport_post_no_response<B: serde::Serialize>(
    transport: &DynTransport,
    path: &str,
    body: &B,
) -> crate::Result<()> {
    let body = serde_json::to_value(body)?;
    transport.request(Method::Post, path, Some(body)).await?;
    Ok(())
}

pub(crate) async fn transport_delete<T: serde::de::DeserializeOwned>(
    transport: &DynTransport,
    path: &str,
) -> crate::Result<T> {
    let value = transport.request(Method::Delete, path, None).await?;
    deserialize_response(value)
}

pub(crate) async fn transport_delete_no_response(
    transport: &DynTransport,
    path: &str,
) -> crate::Result<()> {
    transport.request(Method::Delete, path, None).await?;
    Ok(())
}

fn deserialize_response<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
) -> crate::Result<T> {
    serde_json::from_value(value)
        .map_err(|e| crate::OjsError::Serialization(format!("failed to parse response: {}", e)))
}
