use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::NormalizerResult;
use crate::inference::task::normalize::{NormalizeHandler, NormalizeRequest, NormalizeResponse};
use crate::ui::render_page;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) normalizer: Arc<dyn NormalizeHandler>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct NormalizeForm {
    #[serde(default)]
    symptom: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct HealthResponse {
    status: String,
    model: String,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_index).post(handle_form))
        .route("/api/normalize", post(handle_normalize_request))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Generation blocks for the whole request, keep it off the async workers.
async fn run_normalize(state: &AppState, symptom: String) -> NormalizerResult<NormalizeResponse> {
    let normalizer = state.normalizer.clone();
    let response = tokio::task::spawn_blocking(move || {
        normalizer.run_normalize(NormalizeRequest { symptom })
    })
    .await??;
    Ok(response)
}

#[axum_macros::debug_handler]
async fn handle_index() -> Html<String> {
    render_page("", "")
}

#[axum_macros::debug_handler]
async fn handle_form(
    State(state): State<AppState>,
    Form(form): Form<NormalizeForm>,
) -> NormalizerResult<Html<String>> {
    let response = run_normalize(&state, form.symptom.clone()).await?;
    Ok(render_page(&form.symptom, &response.term))
}

#[axum_macros::debug_handler]
async fn handle_normalize_request(
    State(state): State<AppState>,
    Json(req): Json<NormalizeRequest>,
) -> NormalizerResult<(StatusCode, Json<NormalizeResponse>)> {
    let response = run_normalize(&state, req.symptom).await?;
    Ok((StatusCode::OK, Json(response)))
}

#[axum_macros::debug_handler]
async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        model: state.normalizer.base().name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::inference::models::model::ModelBase;
    use crate::inference::text_pipeline::StopReason;

    /// Upper-cases the symptom, fails on "boom".
    struct EchoNormalizer {
        base: ModelBase,
    }

    impl NormalizeHandler for EchoNormalizer {
        fn base(&self) -> &ModelBase {
            &self.base
        }

        fn run_normalize(&self, request: NormalizeRequest) -> Result<NormalizeResponse> {
            if request.symptom == "boom" {
                bail!("generation failed")
            }
            Ok(NormalizeResponse {
                term: request.symptom.to_uppercase(),
                completion: format!("### Output:\n{}", request.symptom.to_uppercase()),
                marker_found: true,
                stop_reason: StopReason::Eos,
                generated_tokens: 1,
                inference_time: 0.0,
            })
        }
    }

    fn app() -> Router {
        router(AppState {
            normalizer: Arc::new(EchoNormalizer {
                base: ModelBase {
                    name: "test model".into(),
                    license: "MIT".into(),
                    repo_id: "test/model".into(),
                    repo_revision: "main".into(),
                    adapter: "./adapter".into(),
                },
            }),
        })
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn index_renders_empty_form() {
        let response = app()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response)
            .await
            .contains("Indian Medical Symptom Normalizer"));
    }

    #[tokio::test]
    async fn form_submit_renders_term() {
        let response = app()
            .oneshot(
                Request::post("/")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("symptom=fever"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = body_string(response).await;
        assert!(page.contains(">\nfever</textarea>"));
        assert!(page.contains(">\nFEVER</textarea>"));
    }

    #[tokio::test]
    async fn json_api_returns_response() {
        let response = app()
            .oneshot(
                Request::post("/api/normalize")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"symptom": "cough"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["term"], "COUGH");
        assert_eq!(json["marker_found"], true);
        assert_eq!(json["stop_reason"], "eos");
    }

    #[tokio::test]
    async fn backend_errors_surface_as_500() {
        let response = app()
            .oneshot(
                Request::post("/api/normalize")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"symptom": "boom"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["error"], "generation failed");
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let response = app()
            .oneshot(
                Request::post("/api/normalize")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"text": "cough"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn health_reports_model() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.model, "test model");
    }
}
