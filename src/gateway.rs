//! Public listener and per-request pipeline
//!
//! Admission control, static files and the response cache are handled here;
//! everything else is dispatched to a worker and the reply relayed.

use crate::cache::{CacheKey, ResponseCache};
use crate::config::Config;
use crate::error::{json_error_response, json_error_response_with_status, GatewayErrorCode};
use crate::ipc::{IpcError, ReplyOutcome, RoutedRequest};
use crate::pool::WorkerPool;
use crate::ratelimit::{Decision, RateLimitConfig, RateLimiter, UNKNOWN_CLIENT};
use crate::router::Router;
use crate::static_files;
use futures::FutureExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

type GatewayResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Everything the request pipeline shares: owned by one coordinator instance
pub struct GatewayState {
    config: Arc<Config>,
    router: Router,
    limiter: RateLimiter,
    cache: ResponseCache,
    pool: Arc<WorkerPool>,
    response_headers: Vec<(HeaderName, HeaderValue)>,
}

impl GatewayState {
    pub fn new(config: Config, pool: Arc<WorkerPool>) -> anyhow::Result<Self> {
        let router = Router::new(&config.server.rules)?;
        let limiter = RateLimiter::new(RateLimitConfig::from(&config.limits));

        let response_headers = config
            .server
            .headers
            .iter()
            .map(|h| -> anyhow::Result<(HeaderName, HeaderValue)> {
                let name = HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Invalid header name '{}': {}", h.name, e))?;
                let value = HeaderValue::from_str(&h.value)
                    .map_err(|e| anyhow::anyhow!("Invalid value for header '{}': {}", h.name, e))?;
                Ok((name, value))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            config: Arc::new(config),
            router,
            limiter,
            cache: ResponseCache::new(),
            pool,
            response_headers,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Drop expired cache entries and rate limit windows
    pub fn sweep(&self) {
        let cached = self.cache.sweep_expired();
        let windows = self.limiter.sweep_expired();
        if cached > 0 || windows > 0 {
            debug!(cached, windows, "Swept expired entries");
        }
    }

    fn apply_response_headers(&self, response: &mut GatewayResponse) {
        let headers = response.headers_mut();
        for (name, value) in &self.response_headers {
            headers.insert(name.clone(), value.clone());
        }
    }
}

/// The public-facing HTTP server
pub struct GatewayServer {
    bind_addr: SocketAddr,
    state: Arc<GatewayState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<GatewayState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, workers = self.state.pool.len(), "Gateway listening (HTTP/1.1)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<GatewayState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, Some(addr)).await }
    });

    hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Outermost request boundary: any failure or panic in the pipeline becomes a 500
pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
    client_addr: Option<SocketAddr>,
) -> Result<GatewayResponse, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let outcome = AssertUnwindSafe(process_request(req, &state, client_addr, &request_id))
        .catch_unwind()
        .await;

    let mut response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(request_id = %request_id, error = %e, "Request failed");
            json_error_response(GatewayErrorCode::InternalError, "Internal server error")
        }
        Err(_) => {
            error!(request_id = %request_id, "Request handler panicked");
            json_error_response(GatewayErrorCode::InternalError, "Internal server error")
        }
    };

    state.apply_response_headers(&mut response);
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    Ok(response)
}

async fn process_request(
    req: Request<Incoming>,
    state: &GatewayState,
    client_addr: Option<SocketAddr>,
    request_id: &str,
) -> anyhow::Result<GatewayResponse> {
    let client = client_key(client_addr);

    match state.limiter.admit(&client) {
        Decision::Reject => {
            debug!(request_id, client = %client, "Rejecting rate limited client");
            return Ok(json_error_response(
                GatewayErrorCode::RateLimited,
                "Too many requests",
            ));
        }
        Decision::Throttle => {
            let delay = state.config.limits.throttle_delay();
            debug!(request_id, client = %client, delay_ms = delay.as_millis() as u64, "Throttling client");
            tokio::time::sleep(delay).await;
        }
        Decision::Allow => {}
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    debug!(request_id, %method, uri = %target, client = %client, "Incoming request");

    if let Some(file) = state
        .router
        .find(&path)
        .and_then(|rule| rule.static_file.as_deref())
    {
        return Ok(serve_static(state, file).await);
    }

    let key = CacheKey::new(method.clone(), target.clone());
    if let Some(body) = state.cache.get(&key) {
        debug!(request_id, uri = %target, "Cache hit");
        return Ok(json_response(body));
    }

    let Some(worker) = state.pool.next() else {
        return Ok(json_error_response(
            GatewayErrorCode::NoWorkerAvailable,
            "No worker available",
        ));
    };

    let headers: HashMap<String, String> = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let limit = state.config.limits.max_body_bytes;
    let body = match Limited::new(req.into_body(), limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            debug!(request_id, limit, "Request body over the size limit");
            return Ok(json_error_response(
                GatewayErrorCode::PayloadTooLarge,
                format!("Request body exceeds {} bytes", limit),
            ));
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to read request body: {}", e)),
    };

    let routed = RoutedRequest::new(method.as_str(), target.clone())
        .with_headers(headers)
        .with_body(String::from_utf8_lossy(&body));

    let timeout = state.config.limits.reply_timeout();
    match worker.channel().request(routed, timeout).await {
        Ok(reply) => match reply.outcome() {
            Ok(ReplyOutcome::Data(data)) => {
                state
                    .cache
                    .put(key, data.clone(), state.config.limits.cache_ttl());
                Ok(json_response(data))
            }
            Ok(ReplyOutcome::Error { code, message }) => {
                let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                debug!(request_id, slot = worker.slot(), %status, error = %message, "Worker reported an error");
                Ok(json_error_response_with_status(
                    GatewayErrorCode::from_status(status),
                    status,
                    message,
                ))
            }
            Err(e) => {
                warn!(request_id, slot = worker.slot(), error = %e, "Invalid reply from worker");
                Ok(json_error_response(
                    GatewayErrorCode::InternalError,
                    "Internal server error",
                ))
            }
        },
        Err(IpcError::Timeout(waited)) => {
            warn!(request_id, slot = worker.slot(), timeout_secs = waited.as_secs(), "Worker reply timed out");
            Ok(json_error_response(
                GatewayErrorCode::WorkerTimeout,
                format!("Worker did not reply within {} seconds", waited.as_secs()),
            ))
        }
        Err(IpcError::WorkerLost) | Err(IpcError::Closed) => {
            warn!(request_id, slot = worker.slot(), "Worker exited before replying");
            Ok(json_error_response(
                GatewayErrorCode::WorkerLost,
                "Worker exited before replying",
            ))
        }
        Err(e) => Err(e.into()),
    }
}

/// Rate limit key for a client; unknown addresses share one bucket
fn client_key(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

async fn serve_static(state: &GatewayState, file: &str) -> GatewayResponse {
    match static_files::load(&state.config.server.static_root, file).await {
        Some(contents) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/html")
            .body(Full::new(Bytes::from(contents)).map_err(|never| match never {}).boxed())
            .expect("valid response builder"),
        None => json_error_response(GatewayErrorCode::StaticFileNotFound, "Static file not found"),
    }
}

fn json_response(body: Bytes) -> GatewayResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolConfig, WorkerCommand};

    async fn empty_pool() -> Arc<WorkerPool> {
        let config = PoolConfig {
            size: 0,
            ..PoolConfig::default()
        };
        WorkerPool::start(WorkerCommand::new("unused"), "{}".to_string(), config)
            .await
            .unwrap()
    }

    #[test]
    fn test_client_key() {
        let addr: SocketAddr = "10.0.0.7:51234".parse().unwrap();
        assert_eq!(client_key(Some(addr)), "10.0.0.7");
        assert_eq!(client_key(None), UNKNOWN_CLIENT);
    }

    #[tokio::test]
    async fn test_response_headers_injected() {
        let config: Config = toml::from_str(
            r#"
[[server.headers]]
name = "x-served-by"
value = "forkgate"
"#,
        )
        .unwrap();
        let state = GatewayState::new(config, empty_pool().await).unwrap();

        let mut response = json_response(Bytes::from_static(b"{}"));
        state.apply_response_headers(&mut response);
        assert_eq!(response.headers().get("x-served-by").unwrap(), "forkgate");
    }

    #[tokio::test]
    async fn test_invalid_header_rejected() {
        let config: Config = toml::from_str(
            r#"
[[server.headers]]
name = "bad header"
value = "x"
"#,
        )
        .unwrap();
        let err = GatewayState::new(config, empty_pool().await).err().unwrap();
        assert!(err.to_string().contains("Invalid header name"));
    }

    #[tokio::test]
    async fn test_sweep_clears_expired_state() {
        let mut config: Config = toml::from_str("").unwrap();
        config.limits.window_secs = 0;
        let state = GatewayState::new(config, empty_pool().await).unwrap();

        state.limiter().admit("1.1.1.1");
        state.cache().put(
            CacheKey::new(hyper::Method::GET, "/"),
            Bytes::new(),
            std::time::Duration::ZERO,
        );
        state.sweep();
        assert_eq!(state.limiter().tracked_clients(), 0);
        assert!(state.cache().is_empty());
    }
}
