mod dispatch;

pub use dispatch::ForwardError;

use crate::health::HealthMonitor;
use crate::metrics::Metrics;
use crate::middleware::{
    AfterNext, AfterStage, BoxFuture, Next, ProxyRequest, ProxyResponse, Stage,
};
use crate::upstream::Upstream;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Reverse proxy over one upstream.
///
/// Wraps the per-request dispatch loop between registered before- and
/// after-stages and owns the shared outbound client plus the health monitor
/// lifecycle.
pub struct Proxy {
    upstream: Arc<Upstream>,
    client: Client<HttpConnector, Full<Bytes>>,
    before: Vec<Box<dyn Stage>>,
    after: Vec<Box<dyn AfterStage>>,
    monitor: HealthMonitor,
}

impl Proxy {
    pub fn new(upstream: Upstream) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_reuse_address(true);
        // The backend decides the scheme; no TLS is negotiated here.
        connector.enforce_http(false);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(256)
            .build(connector);

        Self {
            upstream: Arc::new(upstream),
            client,
            before: Vec::new(),
            after: Vec::new(),
            monitor: HealthMonitor::new(),
        }
    }

    pub fn upstream(&self) -> &Arc<Upstream> {
        &self.upstream
    }

    /// Adds a stage ahead of the dispatcher. Stages run in registration
    /// order.
    pub fn register_before(&mut self, stage: Box<dyn Stage>) {
        self.before.push(stage);
    }

    /// Adds a stage behind the dispatcher. Stages run in registration order
    /// after a completed forward.
    pub fn register_after(&mut self, stage: Box<dyn AfterStage>) {
        self.after.push(stage);
    }

    pub fn before_stages(&self) -> &[Box<dyn Stage>] {
        &self.before
    }

    pub fn after_stages(&self) -> &[Box<dyn AfterStage>] {
        &self.after
    }

    /// Starts the health monitors for the upstream's backends.
    pub fn start(&self) {
        self.monitor.start(&self.upstream.backends());
    }

    /// Stops the health monitors.
    pub fn stop(&self) {
        self.monitor.stop();
    }

    /// Runs a buffered request through before-chain, dispatch and
    /// after-chain.
    pub async fn handle(&self, req: ProxyRequest) -> ProxyResponse {
        let endpoint = |req: ProxyRequest| self.endpoint(req);
        Next {
            stages: &self.before,
            endpoint: &endpoint,
        }
        .run(req)
        .await
    }

    fn endpoint<'a>(&'a self, req: ProxyRequest) -> BoxFuture<'a, ProxyResponse> {
        Box::pin(async move {
            let (head, body) = req.into_parts();
            let (resp, completed) = self.dispatch(&head, body).await;
            if completed {
                AfterNext::new(&self.after).run(&head, resp).await
            } else {
                resp
            }
        })
    }

    /// Entry point for a live hyper connection: buffers the request body,
    /// then hands off to [`Proxy::handle`].
    pub async fn serve(&self, req: Request<Incoming>) -> Result<ProxyResponse, Infallible> {
        let started = Instant::now();
        let (head, body) = req.into_parts();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                debug!("failed to read request body: {}", err);
                return Ok(error_response(StatusCode::BAD_REQUEST, "Bad Request"));
            }
        };

        let resp = self.handle(Request::from_parts(head, body)).await;
        Metrics::record_request(resp.status().as_u16(), started.elapsed());
        Ok(resp)
    }
}

pub(crate) fn error_response(status: StatusCode, message: &'static str) -> ProxyResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(message))
        .unwrap()
}

pub(crate) fn full_body<T: Into<Bytes>>(content: T) -> crate::middleware::ProxyBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed()
}
