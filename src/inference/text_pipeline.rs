use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::qwen2::{Config as Qwen2Config, ModelForCausalLM as Qwen2};
use candle_transformers::models::quantized_qwen2::ModelWeights as QQwen2;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::inference::adapter::LoraAdapter;
use crate::inference::model_config::GenerationConfig;

/// Tokens that end a Qwen2 instruct turn
const EOS_TOKENS: [&str; 2] = ["<|im_end|>", "<|endoftext|>"];

/// A loaded Qwen2 model with its tokenizer. Generation mutates the KV cache,
/// so a pipeline serves one prompt at a time.
pub struct TextGeneratorPipeline {
    pub model: Model,
    pub device: Device,
    pub tokenizer: Tokenizer,
    eos_tokens: Vec<u32>,
}

pub enum Model {
    Quantized(QQwen2),
    Full(Qwen2),
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model emitted an end of sequence token
    Eos,
    /// The continuation reached a stop sequence
    StopSequence,
    /// `max_new_tokens` were generated
    Length,
}

/// Decoded generation result: the echoed prompt followed by the continuation.
#[derive(Debug, Clone)]
pub struct Completion {
    pub prompt: String,
    pub continuation: String,
    pub generated_tokens: usize,
    pub stop_reason: StopReason,
    pub inference_time: f64,
}

impl Completion {
    pub fn text(&self) -> String {
        format!("{}{}", self.prompt, self.continuation)
    }
}

pub trait CompletionBackend {
    fn complete(&mut self, prompt: &str, config: &GenerationConfig) -> Result<Completion>;
}

/// Picks an accelerator when candle was built with one, the CPU otherwise.
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

pub fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("Failed to load tokenizer {}", path.display()))
}

fn eos_tokens(tokenizer: &Tokenizer) -> Result<Vec<u32>> {
    let tokens: Vec<u32> = EOS_TOKENS
        .iter()
        .filter_map(|token| tokenizer.token_to_id(token))
        .collect();
    if tokens.is_empty() {
        bail!("Cannot find any of the {:?} tokens", EOS_TOKENS)
    }
    Ok(tokens)
}

impl TextGeneratorPipeline {
    pub fn new(model: Model, tokenizer: Tokenizer, device: Device) -> Result<Self> {
        Ok(TextGeneratorPipeline {
            model,
            device,
            eos_tokens: eos_tokens(&tokenizer)?,
            tokenizer,
        })
    }

    /// Loads quantized weights with the adapter merged in before the model is built.
    #[tracing::instrument(level = "info", skip(tokenizer, adapter))]
    pub fn with_quantized_gguf(
        gguf_file: &Path,
        tokenizer: Tokenizer,
        adapter: &LoraAdapter,
        device: Device,
    ) -> Result<TextGeneratorPipeline> {
        let mut file = std::fs::File::open(gguf_file)?;
        let content =
            gguf_file::Content::read(&mut file).map_err(|e| e.with_path(gguf_file))?;
        let mut merged = adapter.merge_into_gguf(&content, &mut file)?;
        drop(content);

        let content = gguf_file::Content::read(&mut merged)?;
        let model = QQwen2::from_gguf(content, &mut merged, &device)?;
        Self::new(Model::Quantized(model), tokenizer, device)
    }

    /// Loads unquantized safetensors weights in `dtype` with the adapter merged in.
    #[tracing::instrument(level = "info", skip(tokenizer, adapter))]
    pub fn with_safetensors(
        config_file: &Path,
        weight_files: &[std::path::PathBuf],
        tokenizer: Tokenizer,
        adapter: &LoraAdapter,
        dtype: DType,
        device: Device,
    ) -> Result<TextGeneratorPipeline> {
        let config: Qwen2Config = serde_json::from_str(&std::fs::read_to_string(config_file)?)?;

        let mut weights = std::collections::HashMap::new();
        for file in weight_files {
            weights.extend(candle_core::safetensors::load(file, &Device::Cpu)?);
        }
        adapter.merge_into_tensors(&mut weights)?;

        let vb = VarBuilder::from_tensors(weights, dtype, &device);
        let model = Qwen2::new(&config, vb)?;
        Self::new(Model::Full(model), tokenizer, device)
    }

    fn forward(&mut self, input: &Tensor, start_pos: usize) -> Result<Tensor> {
        let logits = match &mut self.model {
            Model::Quantized(model) => model.forward(input, start_pos)?.squeeze(0)?,
            Model::Full(model) => model.forward(input, start_pos)?.squeeze(0)?.squeeze(0)?,
        };
        Ok(logits.to_dtype(DType::F32)?)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Cannot decode tokens: {e}"))
    }

    pub fn generate(&mut self, prompt: &str, config: &GenerationConfig) -> Result<Completion> {
        // The quantized model starts a fresh cache whenever it sees position 0
        if let Model::Full(model) = &mut self.model {
            model.clear_kv_cache();
        }
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("Cannot encode prompt: {e}"))?
            .get_ids()
            .to_vec();
        if tokens.is_empty() {
            bail!("Prompt is empty");
        }
        let prompt_len = tokens.len();

        // No temperature means argmax, the seed is never used
        let mut logits_processor = LogitsProcessor::new(0, None, None);
        let mut continuation = String::new();
        let mut stop_reason = StopReason::Length;
        let start_gen = std::time::Instant::now();
        for index in 0..config.max_new_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&tokens[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self.forward(&input, start_pos)?;
            let logits = if (config.repeat_penalty - 1.).abs() < f32::EPSILON {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(config.repeat_context_size);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    config.repeat_penalty,
                    &tokens[start_at..],
                )?
            };

            let next_token = logits_processor.sample(&logits)?;
            if self.eos_tokens.contains(&next_token) {
                stop_reason = StopReason::Eos;
                break;
            }
            tokens.push(next_token);

            continuation = self.decode(&tokens[prompt_len..])?;
            if let Some(stop) = config.find_stop(&continuation) {
                continuation.truncate(stop);
                stop_reason = StopReason::StopSequence;
                break;
            }
        }

        let completion = Completion {
            prompt: self.decode(&tokens[..prompt_len])?,
            continuation,
            generated_tokens: tokens.len() - prompt_len,
            stop_reason,
            inference_time: start_gen.elapsed().as_secs_f64(),
        };
        tracing::debug!(
            "Generated {} tokens in {:.2}s ({:?})",
            completion.generated_tokens,
            completion.inference_time,
            completion.stop_reason
        );
        Ok(completion)
    }
}

impl CompletionBackend for TextGeneratorPipeline {
    fn complete(&mut self, prompt: &str, config: &GenerationConfig) -> Result<Completion> {
        self.generate(prompt, config)
    }
}
