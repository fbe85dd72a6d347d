//! Worker process: authoritative routing and the upstream call
//!
//! A worker reads [`RoutedRequest`]s from stdin one at a time and writes one
//! [`RoutedReply`] per request to stdout. Every failure, including an
//! unreadable request, becomes an error reply; nothing crosses the channel as
//! a crash.

use crate::config::{Config, WORKER_CONFIG_ENV};
use crate::ipc::{decode_line, salvage_id, write_message, RoutedReply, RoutedRequest, WorkerEvent};
use crate::router::Router;
use crate::upstream::{UpstreamClient, UpstreamError};
use hyper::Uri;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, error, info, warn};

pub struct Worker {
    config: Config,
    router: Router,
    client: UpstreamClient,
}

impl Worker {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let router = Router::new(&config.server.rules)?;
        let client = UpstreamClient::new(config.limits.upstream_timeout());
        Ok(Self {
            config,
            router,
            client,
        })
    }

    /// Route a request and perform the upstream call
    pub async fn handle(&self, request: &RoutedRequest) -> RoutedReply {
        let id = Some(request.id);
        let path = request_path(&request.url);

        let Some(rule) = self.router.find(&path) else {
            debug!(url = %request.url, "No rule matched");
            return RoutedReply::error(id, 404, format!("No rule found for {}", request.url));
        };

        let Some(upstream_id) = rule.upstream.first() else {
            return RoutedReply::error(id, 500, "No upstream found");
        };

        let Some(upstream) = self.config.server.upstream(upstream_id) else {
            warn!(upstream = %upstream_id, rule = %rule.path, "Rule references an unknown upstream");
            return RoutedReply::error(id, 500, "Invalid upstream configuration");
        };

        match self
            .client
            .get(&upstream.url, &request.url, upstream.token.as_deref())
            .await
        {
            Ok(response) => {
                debug!(
                    upstream = %upstream.id,
                    status = %response.status,
                    bytes = response.body.len(),
                    "Upstream responded"
                );
                RoutedReply::success(request.id, response.body)
            }
            Err(e @ UpstreamError::Timeout(_)) => {
                warn!(upstream = %upstream.id, error = %e, "Upstream call timed out");
                RoutedReply::error(id, 504, e.to_string())
            }
            Err(e) => {
                warn!(upstream = %upstream.id, error = %e, "Upstream call failed");
                RoutedReply::error(id, 500, e.to_string())
            }
        }
    }

    /// Decode one inbound line and handle it
    pub async fn handle_line(&self, line: &str) -> RoutedReply {
        match decode_line::<RoutedRequest>(line) {
            Ok(request) => self.handle(&request).await,
            Err(e) => {
                warn!(error = %e, "Malformed request from coordinator");
                RoutedReply::error(salvage_id(line), 500, "Internal server error")
            }
        }
    }

    /// Announce readiness, then serve requests until the coordinator closes the channel
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let pid = std::process::id();
        write_message(&mut writer, &WorkerEvent::Ready { pid }).await?;
        info!(pid, rules = self.router.len(), "Worker ready");

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let reply = self.handle_line(&line).await;
            write_message(&mut writer, &WorkerEvent::Reply(reply)).await?;
        }

        info!(pid, "Coordinator closed the channel, worker exiting");
        Ok(())
    }
}

/// Path component of a request target, without the query string
fn request_path(url: &str) -> String {
    url.parse::<Uri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|_| url.split('?').next().unwrap_or(url).to_string())
}

/// Entry point for a worker process: read the startup context and serve stdin/stdout
pub async fn run_from_env() -> anyhow::Result<()> {
    let context = std::env::var(WORKER_CONFIG_ENV)
        .map_err(|_| anyhow::anyhow!("{} is not set", WORKER_CONFIG_ENV))?;

    let config = Config::from_worker_context(&context).map_err(|e| {
        error!(error = %e, "Invalid worker startup context, not accepting traffic");
        e
    })?;

    let worker = Worker::new(config)?;
    worker.serve(tokio::io::stdin(), tokio::io::stdout()).await
}
