use super::{error_response, Proxy};
use crate::metrics::Metrics;
use crate::middleware::ProxyResponse;
use crate::upstream::{Backend, ConnectionGuard};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tracing::{error, warn};

/// Failure kinds for a single forward attempt. Transport and body-stream
/// failures count against the backend's error window; a request we could not
/// even construct does not.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("internal server error: {0}")]
    Internal(#[source] hyper::http::Error),
    #[error("gateway timeout: {0}")]
    GatewayTimeout(#[source] hyper_util::client::legacy::Error),
    #[error("bad gateway: {0}")]
    BadGateway(String),
}

impl ForwardError {
    fn counts_against_backend(&self) -> bool {
        !matches!(self, ForwardError::Internal(_))
    }
}

impl Proxy {
    /// The per-request retry loop: keep asking the upstream for a backend
    /// and forwarding until one attempt completes or no backend is left.
    ///
    /// Returns the response and whether a forward completed; the after-chain
    /// only runs for completed forwards. A completed forward includes 5xx
    /// responses, which are counted against the backend but never retried.
    pub(crate) async fn dispatch(&self, head: &Parts, body: Bytes) -> (ProxyResponse, bool) {
        loop {
            let backend = match self.upstream().select(head) {
                Ok(backend) => backend,
                Err(err) => {
                    error!("upstream: {}", err);
                    return (
                        error_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"),
                        false,
                    );
                }
            };

            let guard = ConnectionGuard::new(&backend);
            let outcome = self.forward(&backend, head, body.clone()).await;
            drop(guard);

            match outcome {
                Ok(resp) => {
                    Metrics::record_attempt(&backend.to_string(), "ok");
                    return (resp, true);
                }
                Err(err) => {
                    if err.counts_against_backend() {
                        backend.incr_errors();
                    }
                    Metrics::record_attempt(&backend.to_string(), "error");
                    warn!("upstream [{}]: {}", backend, err);
                    // Next iteration picks another backend.
                }
            }
        }
    }

    /// One forward attempt against one backend. The response body is not
    /// consumed here; it streams to the client through a watcher that
    /// charges mid-stream failures to the backend.
    async fn forward(
        &self,
        backend: &Arc<Backend>,
        head: &Parts,
        body: Bytes,
    ) -> Result<ProxyResponse, ForwardError> {
        let url = format!("{}/{}", backend, request_uri(head));

        let mut outbound = Request::builder()
            .method(head.method.clone())
            .uri(url)
            .body(Full::new(body))
            .map_err(ForwardError::Internal)?;

        copy_headers(&head.headers, outbound.headers_mut());
        // Framing belongs to the outbound client: it sets Host from the URL
        // and computes the length of the buffered body itself.
        outbound.headers_mut().remove(HOST);
        outbound.headers_mut().remove(CONTENT_LENGTH);
        outbound.headers_mut().remove(TRANSFER_ENCODING);

        let inbound = self
            .client
            .request(outbound)
            .await
            .map_err(ForwardError::GatewayTimeout)?;

        if inbound.status().as_u16() >= 500 {
            backend.incr_errors();
        }

        let (parts, body) = inbound.into_parts();
        let mut resp = Response::new(
            WatchedBody::new(body.boxed(), Arc::clone(backend)).boxed(),
        );
        *resp.status_mut() = parts.status;
        copy_headers(&parts.headers, resp.headers_mut());
        resp.headers_mut().remove(TRANSFER_ENCODING);

        Ok(resp)
    }
}

/// The original request target: path plus query.
pub(crate) fn request_uri(head: &Parts) -> &str {
    head.uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
}

/// Copies every header from `src` into `dst`, collapsing multi-valued
/// headers into a single comma-joined value.
pub(crate) fn copy_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for name in src.keys() {
        let mut joined = Vec::new();
        for (i, value) in src.get_all(name).iter().enumerate() {
            if i > 0 {
                joined.push(b',');
            }
            joined.extend_from_slice(value.as_bytes());
        }
        if let Ok(value) = HeaderValue::from_bytes(&joined) {
            dst.insert(name.clone(), value);
        }
    }
}

/// Passes a backend's response body through to the client, charging a
/// mid-stream failure to the backend's error window. By the time the stream
/// fails the status line is long gone, so the client simply sees a truncated
/// body.
struct WatchedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    backend: Arc<Backend>,
    failed: bool,
}

impl WatchedBody {
    fn new(inner: BoxBody<Bytes, hyper::Error>, backend: Arc<Backend>) -> Self {
        Self {
            inner,
            backend,
            failed: false,
        }
    }
}

impl Body for WatchedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Err(err))) => {
                if !this.failed {
                    this.failed = true;
                    this.backend.incr_errors();
                    warn!(
                        "upstream [{}]: {}",
                        this.backend,
                        ForwardError::BadGateway(err.to_string())
                    );
                }
                Poll::Ready(Some(Err(err)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}
