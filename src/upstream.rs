//! HTTP client used by workers to call upstream origins
//!
//! Connections are not kept alive between calls; each dispatch opens a fresh
//! connection to the upstream.

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Error type for upstream calls
#[derive(Debug)]
pub enum UpstreamError {
    /// The upstream URL or request path could not form a valid URI
    InvalidUrl(String),
    /// Error from the HTTP client (connect, protocol)
    Client(hyper_util::client::legacy::Error),
    /// Error while reading the response body
    Body(hyper::Error),
    /// The upstream did not answer in time
    Timeout(Duration),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::InvalidUrl(s) => write!(f, "Invalid upstream url: {}", s),
            UpstreamError::Client(e) => write!(f, "Upstream request failed: {}", e),
            UpstreamError::Body(e) => write!(f, "Upstream body error: {}", e),
            UpstreamError::Timeout(d) => {
                write!(f, "Upstream timed out after {} seconds", d.as_secs())
            }
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<hyper_util::client::legacy::Error> for UpstreamError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        UpstreamError::Client(err)
    }
}

/// Response collected from an upstream
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: hyper::StatusCode,
    pub body: Bytes,
}

pub struct UpstreamClient {
    client: Client<HttpConnector, Empty<Bytes>>,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self { client, timeout }
    }

    /// GET `path` from the origin of `base_url`, sending `token` as a bearer credential
    pub async fn get(
        &self,
        base_url: &str,
        path: &str,
        token: Option<&str>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let uri = upstream_uri(base_url, path)?;

        let mut builder = Request::builder().method("GET").uri(&uri);
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| UpstreamError::InvalidUrl(format!("invalid token: {}", e)))?;
            builder = builder.header(AUTHORIZATION, value);
        }
        let req = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| UpstreamError::InvalidUrl(e.to_string()))?;

        debug!(%uri, "Calling upstream");

        let call = async {
            let response = self.client.request(req).await?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(UpstreamError::Body)?
                .to_bytes();
            Ok::<_, UpstreamError>(UpstreamResponse { status, body })
        };

        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout))?
    }
}

/// Combine the scheme and authority of `base_url` with the request's path and query
pub fn upstream_uri(base_url: &str, path: &str) -> Result<Uri, UpstreamError> {
    let base: Uri = base_url
        .parse()
        .map_err(|e| UpstreamError::InvalidUrl(format!("{}: {}", base_url, e)))?;

    let scheme = base
        .scheme()
        .cloned()
        .ok_or_else(|| UpstreamError::InvalidUrl(format!("{}: missing scheme", base_url)))?;
    let authority = base
        .authority()
        .cloned()
        .ok_or_else(|| UpstreamError::InvalidUrl(format!("{}: missing host", base_url)))?;

    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path.as_str())
        .build()
        .map_err(|e| UpstreamError::InvalidUrl(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_uri_uses_request_path() {
        let uri = upstream_uri("http://127.0.0.1:9000/ignored", "/users?page=2").unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9000/users?page=2");
    }

    #[test]
    fn test_upstream_uri_adds_leading_slash() {
        let uri = upstream_uri("http://example.com", "health").unwrap();
        assert_eq!(uri.to_string(), "http://example.com/health");
    }

    #[test]
    fn test_upstream_uri_requires_scheme() {
        let err = upstream_uri("example.com:80", "/").unwrap_err();
        assert!(err.to_string().contains("Invalid upstream url"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_client_error() {
        // Bind then drop to find a port with nothing listening
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = UpstreamClient::new(Duration::from_secs(2));
        let err = client
            .get(&format!("http://127.0.0.1:{}", port), "/", None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Client(_)));
    }
}
