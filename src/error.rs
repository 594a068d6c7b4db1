use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Error returned by request handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct NormalizerError {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl IntoResponse for NormalizerError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: &self.message,
        });
        (self.status, body).into_response()
    }
}

/// Anything that fails inside a handler is a server side failure. The full
/// context chain is logged and returned.
impl<E> From<E> for NormalizerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let err = err.into();
        tracing::error!("Request failed: {err:#}");
        NormalizerError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

pub type NormalizerResult<T, E = NormalizerError> = Result<T, E>;

/// Logs a fatal startup error and exits the process.
#[macro_export]
macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {{
        tracing::error!($fmt $(, $arg)*);
        std::process::exit($code);
    }};
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    fn generate() -> NormalizerResult<()> {
        Err::<(), _>(anyhow::anyhow!("out of memory")).context("generation failed")?;
        Ok(())
    }

    #[tokio::test]
    async fn failures_render_as_json_with_context() {
        let res = generate().unwrap_err().into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "generation failed: out of memory");
    }

    #[test]
    fn anyhow_errors_become_internal_errors() {
        let err = NormalizerError::from(anyhow::anyhow!("tokenizer failed"));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "tokenizer failed");
    }
}
