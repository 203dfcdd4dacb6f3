use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::http::request::Parts;
use hyper::{Request, Response};
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Requests enter the pipeline with their body already buffered (the
/// dispatcher may need to replay it against another backend).
pub type ProxyRequest = Request<Bytes>;
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;
pub type ProxyResponse = Response<ProxyBody>;

/// A stage wrapping the request path ahead of the dispatcher. Stages run in
/// registration order; each one decides whether to call `next` or to
/// short-circuit with its own response.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn handle<'a>(&'a self, req: ProxyRequest, next: Next<'a>) -> BoxFuture<'a, ProxyResponse>;
}

/// The remainder of the before-chain plus the dispatcher at its end.
pub struct Next<'a> {
    pub(crate) stages: &'a [Box<dyn Stage>],
    pub(crate) endpoint: &'a (dyn Fn(ProxyRequest) -> BoxFuture<'a, ProxyResponse> + Send + Sync),
}

impl<'a> Next<'a> {
    pub fn run(self, req: ProxyRequest) -> BoxFuture<'a, ProxyResponse> {
        if let Some((current, rest)) = self.stages.split_first() {
            let next = Next {
                stages: rest,
                endpoint: self.endpoint,
            };
            current.handle(req, next)
        } else {
            (self.endpoint)(req)
        }
    }
}

/// A stage wrapping the response path. After-stages run in registration
/// order once a forward has completed; they are skipped entirely when the
/// dispatcher gave up with no valid servers.
pub trait AfterStage: Send + Sync {
    fn name(&self) -> &str;

    fn handle<'a>(
        &'a self,
        head: &'a Parts,
        resp: ProxyResponse,
        next: AfterNext<'a>,
    ) -> BoxFuture<'a, ProxyResponse>;
}

pub struct AfterNext<'a> {
    pub(crate) stages: &'a [Box<dyn AfterStage>],
}

impl<'a> AfterNext<'a> {
    pub fn new(stages: &'a [Box<dyn AfterStage>]) -> Self {
        Self { stages }
    }

    pub fn run(self, head: &'a Parts, resp: ProxyResponse) -> BoxFuture<'a, ProxyResponse> {
        if let Some((current, rest)) = self.stages.split_first() {
            current.handle(head, resp, AfterNext { stages: rest })
        } else {
            Box::pin(async move { resp })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn empty_response() -> ProxyResponse {
        Response::new(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
    }

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Stage for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        fn handle<'a>(&'a self, req: ProxyRequest, next: Next<'a>) -> BoxFuture<'a, ProxyResponse> {
            self.log.lock().push(self.label);
            next.run(req)
        }
    }

    struct AfterRecorder {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl AfterStage for AfterRecorder {
        fn name(&self) -> &str {
            self.label
        }

        fn handle<'a>(
            &'a self,
            head: &'a Parts,
            resp: ProxyResponse,
            next: AfterNext<'a>,
        ) -> BoxFuture<'a, ProxyResponse> {
            self.log.lock().push(self.label);
            next.run(head, resp)
        }
    }

    #[tokio::test]
    async fn test_before_chain_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(Recorder {
                label: "first",
                log: Arc::clone(&log),
            }),
            Box::new(Recorder {
                label: "second",
                log: Arc::clone(&log),
            }),
        ];

        let endpoint_log = Arc::clone(&log);
        let endpoint = move |_req: ProxyRequest| {
            endpoint_log.lock().push("endpoint");
            Box::pin(async move { empty_response() }) as BoxFuture<'_, ProxyResponse>
        };

        let req = Request::builder().uri("/").body(Bytes::new()).unwrap();
        Next {
            stages: &stages,
            endpoint: &endpoint,
        }
        .run(req)
        .await;

        assert_eq!(*log.lock(), vec!["first", "second", "endpoint"]);
    }

    #[tokio::test]
    async fn test_stage_can_short_circuit() {
        struct Refuse;
        impl Stage for Refuse {
            fn name(&self) -> &str {
                "refuse"
            }

            fn handle<'a>(
                &'a self,
                _req: ProxyRequest,
                _next: Next<'a>,
            ) -> BoxFuture<'a, ProxyResponse> {
                Box::pin(async move {
                    let mut resp = empty_response();
                    *resp.status_mut() = hyper::StatusCode::FORBIDDEN;
                    resp
                })
            }
        }

        let stages: Vec<Box<dyn Stage>> = vec![Box::new(Refuse)];
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let endpoint_log = Arc::clone(&log);
        let endpoint = move |_req: ProxyRequest| {
            endpoint_log.lock().push("endpoint");
            Box::pin(async move { empty_response() }) as BoxFuture<'_, ProxyResponse>
        };

        let req = Request::builder().uri("/").body(Bytes::new()).unwrap();
        let resp = Next {
            stages: &stages,
            endpoint: &endpoint,
        }
        .run(req)
        .await;

        assert_eq!(resp.status(), hyper::StatusCode::FORBIDDEN);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_after_chain_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages: Vec<Box<dyn AfterStage>> = vec![
            Box::new(AfterRecorder {
                label: "audit",
                log: Arc::clone(&log),
            }),
            Box::new(AfterRecorder {
                label: "last",
                log: Arc::clone(&log),
            }),
        ];

        let head = Request::builder()
            .uri("/")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        AfterNext::new(&stages).run(&head, empty_response()).await;

        assert_eq!(*log.lock(), vec!["audit", "last"]);
    }
}
