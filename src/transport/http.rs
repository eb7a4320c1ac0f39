use crate::config::ConnectionConfig;
use crate::errors::{status_is_retryable, ErrorResponse, OjsError, ServerError};
use crate::transport::{Method, Transport, TransportFuture};
use std::collections::HashMap;

const OJS_CONTENT_TYPE: &str = "application/openjobspec+json";
const OJS_VERSION: &str = "1.0.0-rc.1";
const BASE_PATH: &str = "/ojs/v1";

/// HTTP transport layer for communicating with an OJS server over reqwest.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    auth_token: Option<String>,
    headers: HashMap<String, String>,
}

impl HttpTransport {
    /// Build a transport from connection settings.
    pub fn new(config: &ConnectionConfig) -> crate::Result<Self> {
        if !config.has_url() {
            return Err(OjsError::Builder("url is required".into()));
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| OjsError::Builder(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(config, client))
    }

    /// Build a transport around an existing reqwest client. The timeout in
    /// `config` is ignored; configure it on `client` instead.
    pub fn with_client(config: &ConnectionConfig, client: reqwest::Client) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            auth_token: config.auth_token.clone(),
            headers: config.headers.clone(),
        }
    }

    /// Build the full URL for a given path. Paths under `/ojs/` (the
    /// manifest) are rooted at the server; all others are relative to
    /// `/ojs/v1`.
    fn url(&self, path: &str) -> String {
        if path.starts_with("/ojs/") {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}{}", self.base_url, BASE_PATH, path)
        }
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req = req
            .header("Content-Type", OJS_CONTENT_TYPE)
            .header("Accept", OJS_CONTENT_TYPE)
            .header("OJS-Version", OJS_VERSION);

        if let Some(ref token) = self.auth_token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        req
    }

    async fn do_request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> crate::Result<serde_json::Value> {
        let url = self.url(path);
        let mut req = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Delete => self.client.delete(&url),
        };
        if let Some(body) = body {
            req = req.body(serde_json::to_vec(&body)?);
        }

        let response = self.apply_headers(req).send().await?;
        let status = response.status();
        let request_id = response
            .headers()
            .get("X-Request-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(parse_error_response(&body, status.as_u16(), request_id));
        }

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }

        serde_json::from_slice(&body).map_err(|e| {
            OjsError::Serialization(format!(
                "failed to parse response: {} (body: {})",
                e,
                String::from_utf8_lossy(&body)
            ))
        })
    }
}

impl Transport for HttpTransport {
    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> TransportFuture<'_> {
        let path = path.to_string();
        Box::pin(async move { self.do_request(method, &path, body).await })
    }
}

// ---------------------------------------------------------------------------
// Error response parsing
// ---------------------------------------------------------------------------

fn parse_error_response(body: &[u8], status_code: u16, request_id: Option<String>) -> OjsError {
    let raw = String::from_utf8_lossy(body);

    if let Ok(err_resp) = serde_json::from_slice::<ErrorResponse>(body) {
        let mut err = err_resp.error.into_server_error(status_code, request_id, &raw);
        // Servers that omit the flag still get the status-class default.
        err.retryable = err.retryable || status_is_retryable(status_code);
        return err.into();
    }

    let message = if raw.trim().is_empty() {
        format!("HTTP {}", status_code)
    } else {
        format!("HTTP {}: {}", status_code, raw)
    };
    let mut err = ServerError::new(format!("http_{}", status_code), message, status_code);
    err.request_id = request_id;
    err.into()
}
