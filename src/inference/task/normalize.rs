use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::inference::model_config::GenerationConfig;
use crate::inference::models::model::ModelBase;
use crate::inference::text_pipeline::{CompletionBackend, StopReason};

/// Literal the answer is extracted after, the last occurrence wins.
pub const ANSWER_MARKER: &str = "Output";

#[derive(Deserialize, Debug)]
pub struct NormalizeRequest {
    pub symptom: String,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct NormalizeResponse {
    /// The normalized English term
    pub term: String,
    /// Decoded prompt echo followed by the continuation
    pub completion: String,
    pub marker_found: bool,
    pub stop_reason: StopReason,
    pub generated_tokens: usize,
    pub inference_time: f64,
}

pub trait NormalizeHandler: Send + Sync {
    fn base(&self) -> &ModelBase;

    fn run_normalize(&self, request: NormalizeRequest) -> Result<NormalizeResponse>;
}

pub fn render_prompt(symptom: &str) -> String {
    format!(
        "### Instruction:
Translate and normalize the symptom into a standard medical term in ENGLISH ONLY.
Do not repeat the original language.

### Symptom:
{symptom}

### Output:
"
    )
}

#[derive(Debug, PartialEq, Eq)]
pub struct Extraction<'a> {
    pub term: &'a str,
    pub marker_found: bool,
}

/// Takes what follows the last answer marker, without the colon of the template's
/// `### Output:` line. Without a marker the whole text is the answer.
pub fn extract_answer(decoded: &str) -> Extraction<'_> {
    match decoded.rfind(ANSWER_MARKER) {
        Some(index) => {
            let segment = &decoded[index + ANSWER_MARKER.len()..];
            let segment = segment.strip_prefix(':').unwrap_or(segment);
            Extraction {
                term: segment.trim(),
                marker_found: true,
            }
        }
        None => Extraction {
            term: decoded.trim(),
            marker_found: false,
        },
    }
}

#[tracing::instrument(level = "info", skip(backend, config))]
pub fn normalize<B>(
    backend: &mut B,
    symptom: &str,
    config: &GenerationConfig,
) -> Result<NormalizeResponse>
where
    B: CompletionBackend + ?Sized,
{
    let prompt = render_prompt(symptom);
    let completion = backend.complete(&prompt, config)?;
    let decoded = completion.text();

    let extraction = extract_answer(&decoded);
    if !extraction.marker_found {
        tracing::warn!("Answer marker missing from completion, returning it unchanged");
    } else if extraction.term.is_empty() {
        tracing::warn!("Model produced an empty answer");
    }
    tracing::debug!(
        term = extraction.term,
        stop_reason = ?completion.stop_reason,
        generated_tokens = completion.generated_tokens,
        "Normalized symptom"
    );

    Ok(NormalizeResponse {
        term: extraction.term.to_string(),
        marker_found: extraction.marker_found,
        stop_reason: completion.stop_reason,
        generated_tokens: completion.generated_tokens,
        inference_time: completion.inference_time,
        completion: decoded,
    })
}
