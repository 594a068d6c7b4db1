use std::sync::Mutex;

use anyhow::{anyhow, Result};
use candle_core::DType;
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};

use crate::config::{Config, WeightFormat};
use crate::inference::adapter::{resolve_adapter_dir, LoraAdapter};
use crate::inference::model_config::GenerationConfig;
use crate::inference::models::model::ModelBase;
use crate::inference::task::normalize::{
    normalize, NormalizeHandler, NormalizeRequest, NormalizeResponse,
};
use crate::inference::text_pipeline::{device, load_tokenizer, TextGeneratorPipeline};

/// Qwen2 with the symptom adapter merged in. The weights are loaded once, the KV
/// cache is reused, so requests take turns on the pipeline.
pub struct Qwen2Model {
    base: ModelBase,
    generator_pipeline: Mutex<TextGeneratorPipeline>,
    generation: GenerationConfig,
}

impl Qwen2Model {
    pub fn new(
        base: ModelBase,
        generator_pipeline: TextGeneratorPipeline,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            base,
            generator_pipeline: Mutex::new(generator_pipeline),
            generation,
        }
    }

    #[tracing::instrument(level = "info", skip(api, config))]
    pub fn load(api: &Api, config: &Config) -> Result<Self> {
        let base = ModelBase {
            name: format!("{} + LoRA", config.base_model_id),
            license: "Apache-2.0".into(),
            repo_id: config.base_model_id.clone(),
            repo_revision: config.base_model_revision.clone(),
            adapter: config.adapter_path.clone(),
        };
        let base_repo = api.repo(Repo::with_revision(
            base.repo_id.clone(),
            RepoType::Model,
            base.repo_revision.clone(),
        ));

        let adapter = LoraAdapter::load(&resolve_adapter_dir(api, &config.adapter_path)?)?;
        if let Some(adapter_base) = &adapter.config.base_model_name_or_path {
            if adapter_base != &base.repo_id {
                tracing::warn!(
                    "Adapter was trained on {adapter_base} but is merged into {}",
                    base.repo_id
                );
            }
        }

        let tokenizer = load_tokenizer(&base_repo.get("tokenizer.json")?)?;
        let device = device(config.cpu)?;
        tracing::info!("Loading {} weights on {:?}", format_name(config.weights), device);

        let generator_pipeline = match config.weights {
            WeightFormat::Gguf => {
                let gguf_repo = api.model(config.gguf_repo_id.clone());
                let gguf_file = gguf_repo.get(&config.gguf_filename)?;
                TextGeneratorPipeline::with_quantized_gguf(&gguf_file, tokenizer, &adapter, device)?
            }
            WeightFormat::F32 | WeightFormat::F16 | WeightFormat::Bf16 => {
                let config_file = base_repo.get("config.json")?;
                let weight_file = base_repo.get("model.safetensors")?;
                TextGeneratorPipeline::with_safetensors(
                    &config_file,
                    &[weight_file],
                    tokenizer,
                    &adapter,
                    dtype(config.weights),
                    device,
                )?
            }
        };
        tracing::info!("Loaded {}", base.name);

        Ok(Self::new(base, generator_pipeline, config.generation()))
    }
}

fn dtype(weights: WeightFormat) -> DType {
    match weights {
        WeightFormat::F16 => DType::F16,
        WeightFormat::Bf16 => DType::BF16,
        WeightFormat::F32 | WeightFormat::Gguf => DType::F32,
    }
}

fn format_name(weights: WeightFormat) -> &'static str {
    match weights {
        WeightFormat::Gguf => "quantized gguf",
        WeightFormat::F32 => "f32 safetensors",
        WeightFormat::F16 => "f16 safetensors",
        WeightFormat::Bf16 => "bf16 safetensors",
    }
}

impl NormalizeHandler for Qwen2Model {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    #[tracing::instrument(level = "info", skip(self, request))]
    fn run_normalize(&self, request: NormalizeRequest) -> Result<NormalizeResponse> {
        let mut pipeline = self
            .generator_pipeline
            .lock()
            .map_err(|_| anyhow!("Generator pipeline is poisoned by an earlier failure"))?;
        normalize(&mut *pipeline, &request.symptom, &self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_precision_formats_map_to_dtypes() {
        assert_eq!(dtype(WeightFormat::F16), DType::F16);
        assert_eq!(dtype(WeightFormat::Bf16), DType::BF16);
        assert_eq!(dtype(WeightFormat::F32), DType::F32);
        assert_eq!(format_name(WeightFormat::Gguf), "quantized gguf");
    }

    #[test]
    fn overlapping_requests_share_one_pipeline() -> Result<()> {
        use std::sync::Arc;

        use crate::inference::text_pipeline::tests::pipeline_always_emitting;

        let base = ModelBase {
            name: "tiny".into(),
            license: "Apache-2.0".into(),
            repo_id: "tiny".into(),
            repo_revision: "main".into(),
            adapter: "./indian-med-model".into(),
        };
        let generation = GenerationConfig {
            max_new_tokens: 2,
            ..GenerationConfig::default()
        };
        let model = Arc::new(Qwen2Model::new(
            base,
            pipeline_always_emitting("Abdominal")?,
            generation,
        ));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let model = Arc::clone(&model);
                std::thread::spawn(move || {
                    model.run_normalize(NormalizeRequest {
                        symptom: "पेट दर्द".into(),
                    })
                })
            })
            .collect();
        let mut terms = Vec::new();
        for worker in workers {
            let response = worker.join().map_err(|_| anyhow!("worker panicked"))??;
            assert_eq!(response.generated_tokens, 2);
            terms.push(response.term);
        }

        assert!(terms[0].ends_with("Abdominal Abdominal"));
        assert!(terms.iter().all(|term| term == &terms[0]));
        Ok(())
    }
}
