//! The ordered request pipeline.
//!
//! Every request walks the stages in order until one of them claims it. The
//! fallback responder is held apart from the stage list and always answers,
//! so each request ends in exactly one [`Outcome`].

use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::{body::Body, http::Request, response::Response};
use futures::future::BoxFuture;
use tower::Service;

use crate::abort::AbortInjector;
use crate::config::PipelineConfig;
use crate::delay::DelayInjector;
use crate::error::Aborted;
use crate::fallback::FallbackResponder;
use crate::logging::LogSink;
use crate::observer::{ObserverOptions, RequestObserver};
use crate::static_files::StaticFileResolver;

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Aborted,
    FileServed,
    ListingServed,
    FallbackServed,
}

/// What a stage decided for the request it was handed.
pub enum Flow {
    /// Hand the request on to the next stage
    Continue(Request<Body>),
    /// Answer with this response; no later stage runs
    Respond(Response),
    /// Drop the connection without answering
    Abort,
}

/// One step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Short stable name, used to check ordering.
    fn name(&self) -> &'static str;

    async fn handle(&self, request: Request<Body>) -> Flow;
}

/// Tag a response with the outcome it represents.
pub fn claim(mut response: Response, outcome: Outcome) -> Response {
    response.extensions_mut().insert(outcome);
    response
}

/// Ordered stages plus the terminal fallback.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<Vec<Arc<dyn Stage>>>,
    fallback: Arc<FallbackResponder>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>, fallback: FallbackResponder) -> Self {
        Self {
            stages: Arc::new(stages),
            fallback: Arc::new(fallback),
        }
    }

    /// Build the standard pipeline:
    /// observer, delay, abort, static files (when enabled), fallback.
    pub fn assemble(config: &PipelineConfig, sink: Arc<dyn LogSink>) -> Self {
        let mut stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(RequestObserver::new(
                ObserverOptions::from_config(config),
                sink.clone(),
            )),
            Arc::new(DelayInjector::new(config.delay_min_ms, config.delay_max_ms)),
            Arc::new(AbortInjector::new(config.abort_probability, sink.clone())),
        ];

        if config.serve_static {
            stages.push(Arc::new(StaticFileResolver::new(config.root.clone())));
        }

        let fallback = FallbackResponder::new(config.fallback_status, config.fallback_body.clone());
        Self::new(stages, fallback)
    }

    /// Names of all stages in execution order, fallback last.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages
            .iter()
            .map(|stage| stage.name())
            .chain(std::iter::once(FallbackResponder::NAME))
            .collect()
    }

    /// Run one request through the pipeline.
    pub async fn run(&self, request: Request<Body>) -> Result<Response, Aborted> {
        let mut request = request;
        for stage in self.stages.iter() {
            match stage.handle(request).await {
                Flow::Continue(next) => request = next,
                Flow::Respond(response) => return Ok(response),
                Flow::Abort => return Err(Aborted),
            }
        }
        Ok(self.fallback.respond(&request))
    }
}

impl Service<Request<Body>> for Pipeline {
    type Response = Response;
    type Error = Aborted;
    type Future = BoxFuture<'static, Result<Response, Aborted>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let pipeline = self.clone();
        Box::pin(async move { pipeline.run(request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use axum::http::StatusCode;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
        flow: fn(Request<Body>) -> Flow,
    }

    #[async_trait]
    impl Stage for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, request: Request<Body>) -> Flow {
            self.seen.lock().unwrap().push(self.name);
            (self.flow)(request)
        }
    }

    fn request() -> Request<Body> {
        Request::builder().uri("/x").body(Body::empty()).unwrap()
    }

    #[test]
    fn test_assembled_order_with_static() {
        let pipeline = Pipeline::assemble(&PipelineConfig::default(), Arc::new(MemorySink::new()));
        assert_eq!(
            pipeline.stage_names(),
            vec!["observer", "delay", "abort", "static", "fallback"]
        );
    }

    #[test]
    fn test_assembled_order_without_static() {
        let config = PipelineConfig {
            serve_static: false,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::assemble(&config, Arc::new(MemorySink::new()));
        assert_eq!(
            pipeline.stage_names(),
            vec!["observer", "delay", "abort", "fallback"]
        );
    }

    #[tokio::test]
    async fn test_stages_run_in_order_until_claimed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(Recorder {
                name: "first",
                seen: seen.clone(),
                flow: Flow::Continue,
            }),
            Arc::new(Recorder {
                name: "second",
                seen: seen.clone(),
                flow: |_| {
                    Flow::Respond(claim(
                        Response::new(Body::from("claimed")),
                        Outcome::FileServed,
                    ))
                },
            }),
            Arc::new(Recorder {
                name: "third",
                seen: seen.clone(),
                flow: Flow::Continue,
            }),
        ];
        let pipeline = Pipeline::new(stages, FallbackResponder::new(404, None));

        let response = pipeline.run(request()).await.unwrap();
        assert_eq!(response.extensions().get::<Outcome>(), Some(&Outcome::FileServed));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_abort_halts_pipeline() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(Recorder {
                name: "abort",
                seen: seen.clone(),
                flow: |_| Flow::Abort,
            }),
            Arc::new(Recorder {
                name: "after",
                seen: seen.clone(),
                flow: Flow::Continue,
            }),
        ];
        let pipeline = Pipeline::new(stages, FallbackResponder::new(404, None));

        assert_eq!(pipeline.run(request()).await.unwrap_err(), Aborted);
        assert_eq!(*seen.lock().unwrap(), vec!["abort"]);
    }

    #[tokio::test]
    async fn test_unclaimed_request_reaches_fallback() {
        let pipeline = Pipeline::new(Vec::new(), FallbackResponder::new(410, None));

        let response = pipeline.run(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
        assert_eq!(
            response.extensions().get::<Outcome>(),
            Some(&Outcome::FallbackServed)
        );
    }
}
