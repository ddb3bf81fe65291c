//! Axum extractor that deserialises and validates JSON

use crate::error::PortalError;

use async_trait::async_trait;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Json},
    http::Request,
};
use serde::de::DeserializeOwned;
use validator::Validate;

/// An axum extractor based on the Json extractor that also performs validation using the validator
/// crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S, B> FromRequest<S, B> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
    Json<T>: FromRequest<S, B, Rejection = JsonRejection>,
    B: Send + 'static,
{
    type Rejection = PortalError;

    /// Extract a `ValidatedJson` from a `Request`.
    async fn from_request(req: Request<B>, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

#[cfg(test)]
mod tests {
    // https://github.com/tokio-rs/axum/blob/main/examples/testing/src/main.rs

    use super::*;
    use crate::models::MaterializationRequest;

    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        response::Response,
        routing::post,
        Router,
    };
    use regex::Regex;
    use tower::ServiceExt; // for `oneshot` and `ready`

    // Handler function that accepts a ValidatedJson extractor.
    async fn test_handler(ValidatedJson(request): ValidatedJson<MaterializationRequest>) -> String {
        format!("sources: {:?} shape: {:?}", request.sources, request.shape)
    }

    // Build a router and make a oneshot request.
    async fn request(body: &str) -> Response {
        Router::new()
            .route("/", post(test_handler))
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/")
                    .header(http::header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    // Jump through the hoops to get the body as a string.
    async fn body_string(response: Response) -> String {
        String::from_utf8(
            hyper::body::to_bytes(response.into_body())
                .await
                .unwrap()
                .to_vec(),
        )
        .unwrap()
    }

    async fn assert_rejected(body: &str, patterns: &[&str]) {
        let response = request(body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_string(response).await;
        for pattern in patterns {
            let re = Regex::new(pattern).unwrap();
            assert!(re.is_match(&body[..]), "body: {body}");
        }
    }

    #[tokio::test]
    async fn ok() {
        let response =
            request(r#"{"sources": ["/a/tas.nc"], "dtype": "float32", "shape": [4, 3]}"#).await;

        assert_eq!(response.status(), StatusCode::OK);

        let body = body_string(response).await;
        assert_eq!(&body[..], r#"sources: ["/a/tas.nc"] shape: [4, 3]"#);
    }

    #[tokio::test]
    async fn invalid_json() {
        assert_rejected("{\"", &[r"Failed to parse the request body as JSON"]).await;
    }

    #[tokio::test]
    async fn invalid_sources_type() {
        assert_rejected(
            r#"{"sources": "/a/tas.nc", "dtype": "float32", "shape": [4]}"#,
            &[r".*sources: invalid type: string.*"],
        )
        .await;
    }

    #[tokio::test]
    async fn unknown_field() {
        assert_rejected(
            r#"{"sources": ["/a/tas.nc"], "dtype": "float32", "shape": [4], "source": "x"}"#,
            &[r".*unknown field `source`.*"],
        )
        .await;
    }

    #[tokio::test]
    async fn empty_sources() {
        assert_rejected(
            r#"{"sources": [], "dtype": "float32", "shape": [4]}"#,
            &[
                r".*request data is not valid.*",
                r".*sources must not be empty.*",
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn zero_shape() {
        assert_rejected(
            r#"{"sources": ["/a/tas.nc"], "dtype": "float32", "shape": [4, 0]}"#,
            &[
                r".*request data is not valid.*",
                r".*shape indices must be greater than 0.*",
            ],
        )
        .await;
    }
}
