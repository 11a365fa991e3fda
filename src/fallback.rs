use axum::{
    body::Body,
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::observer::render_json;
use crate::pipeline::{Outcome, claim};

/// Terminal responder for requests no earlier stage claimed.
///
/// Matches every method and path. The body is the configured literal, or
/// `{"status": <code>}` indented with four spaces and a trailing newline.
#[derive(Debug, Clone)]
pub struct FallbackResponder {
    status: StatusCode,
    body: String,
}

impl FallbackResponder {
    pub const NAME: &'static str = "fallback";

    /// `status` must already be normalized to 100..=999.
    pub fn new(status: u16, body: Option<String>) -> Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::NOT_FOUND);
        let body = match body.filter(|b| !b.is_empty()) {
            Some(body) => body,
            None => default_body(status),
        };
        Self { status, body }
    }

    pub fn respond(&self, _request: &Request<Body>) -> Response {
        let response = (
            self.status,
            [(header::CONTENT_TYPE, "application/json")],
            self.body.clone(),
        )
            .into_response();
        claim(response, Outcome::FallbackServed)
    }
}

fn default_body(status: StatusCode) -> String {
    let mut body = render_json(&json!({ "status": status.as_u16() }), true);
    body.push('\n');
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    async fn body_of(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_default_body_is_indented_status() {
        let fallback = FallbackResponder::new(404, None);
        let response = fallback.respond(&request(Method::GET, "/missing"));

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(body_of(response).await, "{\n    \"status\": 404\n}\n");
    }

    #[tokio::test]
    async fn test_custom_status_and_body() {
        let fallback = FallbackResponder::new(503, Some("try later".to_string()));
        let response = fallback.respond(&request(Method::DELETE, "/a/b/c"));

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(body_of(response).await, "try later");
    }

    #[tokio::test]
    async fn test_custom_status_uses_it_in_default_body() {
        let fallback = FallbackResponder::new(200, Some(String::new()));
        let response = fallback.respond(&request(Method::POST, "/"));

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "{\n    \"status\": 200\n}\n");
    }

    #[tokio::test]
    async fn test_every_method_gets_same_answer() {
        let fallback = FallbackResponder::new(404, None);
        for method in [Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::OPTIONS] {
            let response = fallback.respond(&request(method.clone(), "/anything?x=1"));
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method}");
            assert_eq!(
                response.extensions().get::<Outcome>(),
                Some(&Outcome::FallbackServed)
            );
        }
    }
}
