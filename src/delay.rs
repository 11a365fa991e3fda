use std::time::Duration;

use async_trait::async_trait;
use axum::{body::Body, http::Request};
use rand::Rng;

use crate::pipeline::{Flow, Stage};

/// Holds each request for a random time in `[min_ms, max_ms]`.
///
/// The wait is a timer await, so other requests keep being served meanwhile.
#[derive(Debug, Clone, Copy)]
pub struct DelayInjector {
    min_ms: u64,
    max_ms: u64,
}

impl DelayInjector {
    pub const NAME: &'static str = "delay";

    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms: max_ms.max(min_ms),
        }
    }

    /// Draw the delay for one request.
    pub fn sample(&self) -> Duration {
        if self.max_ms == 0 {
            return Duration::ZERO;
        }
        let ms = if self.min_ms == self.max_ms {
            self.min_ms
        } else {
            rand::rng().random_range(self.min_ms..=self.max_ms)
        };
        Duration::from_millis(ms)
    }
}

#[async_trait]
impl Stage for DelayInjector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn handle(&self, request: Request<Body>) -> Flow {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Flow::Continue(request)
    }
}
