use std::sync::Arc;

use async_trait::async_trait;
use axum::{body::Body, http::Request};
use rand::Rng;

use crate::logging::LogSink;
use crate::pipeline::{Flow, Stage};

/// Drops the connection of a random share of requests.
///
/// One sample in `[0, 1)` is drawn per request; the request is aborted when it
/// falls below `probability`, so 0 never aborts and 1 always does.
pub struct AbortInjector {
    probability: f64,
    sink: Arc<dyn LogSink>,
}

impl AbortInjector {
    pub const NAME: &'static str = "abort";

    pub fn new(probability: f64, sink: Arc<dyn LogSink>) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            sink,
        }
    }

    pub fn should_abort(&self) -> bool {
        if self.probability <= 0.0 {
            return false;
        }
        rand::rng().random::<f64>() < self.probability
    }
}

#[async_trait]
impl Stage for AbortInjector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn handle(&self, request: Request<Body>) -> Flow {
        if !self.should_abort() {
            return Flow::Continue(request);
        }

        self.sink.warn(&format!(
            "Aborting connection for {} {} (abort probability {})",
            request.method(),
            request.uri(),
            self.probability
        ));
        Flow::Abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{MemorySink, SinkLevel};

    fn request() -> Request<Body> {
        Request::builder().uri("/flaky").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_zero_probability_never_aborts() {
        let sink = Arc::new(MemorySink::new());
        let abort = AbortInjector::new(0.0, sink.clone());
        for _ in 0..1000 {
            assert!(matches!(abort.handle(request()).await, Flow::Continue(_)));
        }
        assert!(sink.entries().is_empty());
    }

    #[tokio::test]
    async fn test_full_probability_always_aborts() {
        let sink = Arc::new(MemorySink::new());
        let abort = AbortInjector::new(1.0, sink.clone());
        for _ in 0..1000 {
            assert!(matches!(abort.handle(request()).await, Flow::Abort));
        }

        let warnings = sink.lines_at(SinkLevel::Warn);
        assert_eq!(warnings.len(), 1000);
        assert!(warnings[0].contains("GET /flaky"));
    }

    #[test]
    fn test_half_probability_aborts_some() {
        let abort = AbortInjector::new(0.5, Arc::new(MemorySink::new()));
        let aborted = (0..2000).filter(|_| abort.should_abort()).count();
        assert!((700..1300).contains(&aborted), "{aborted}");
    }
}
