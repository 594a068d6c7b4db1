use anyhow::Result;
use clap::ValueEnum;
use clap_serde_derive::ClapSerde;
use serde::{Deserialize, Serialize};

use crate::inference::model_config::GenerationConfig;

#[derive(ClapSerde, Serialize, Debug, Clone)]
pub struct Config {
    /// The address the listener binds to
    #[default("127.0.0.1".to_string())]
    #[arg(short, long, env)]
    pub(crate) address: String,

    /// The port the listener binds to
    #[default(7860)]
    #[arg(short, long, env)]
    pub(crate) port: u16,

    /// Hub repository of the base model, provides the tokenizer and safetensors weights
    #[default("Qwen/Qwen2-1.5B-Instruct".to_string())]
    #[arg(long, env)]
    pub(crate) base_model_id: String,

    /// Revision of the base model repository
    #[default("main".to_string())]
    #[arg(long, env)]
    pub(crate) base_model_revision: String,

    /// Hub repository holding the quantized GGUF weights
    #[default("Qwen/Qwen2-1.5B-Instruct-GGUF".to_string())]
    #[arg(long, env)]
    pub(crate) gguf_repo_id: String,

    /// GGUF file inside the quantized repository
    #[default("qwen2-1_5b-instruct-q8_0.gguf".to_string())]
    #[arg(long, env)]
    pub(crate) gguf_filename: String,

    /// Local directory or hub repository of the LoRA adapter
    #[default("./indian-med-model".to_string())]
    #[arg(long, env)]
    pub(crate) adapter_path: String,

    /// Weight format the base model is loaded in
    #[default(WeightFormat::Gguf)]
    #[arg(long, env, value_enum)]
    pub(crate) weights: WeightFormat,

    /// Run on the CPU even if an accelerator is available
    #[default(false)]
    #[arg(long, env)]
    pub(crate) cpu: bool,

    /// Upper bound of newly generated tokens per request
    #[default(30)]
    #[arg(long, env)]
    pub(crate) max_new_tokens: usize,

    /// Penalty applied to recently generated tokens, 1.0 disables it
    #[default(1.0)]
    #[arg(long, env)]
    pub(crate) repeat_penalty: f32,

    /// Number of trailing tokens the repeat penalty looks at
    #[default(64)]
    #[arg(long, env)]
    pub(crate) repeat_context_size: usize,

    /// OTLP collector endpoint, telemetry export is disabled when empty
    #[default(String::new())]
    #[arg(long, env)]
    pub(crate) otel_endpoint: String,

    /// Keep logging to the console while exporting telemetry
    #[default(false)]
    #[arg(long, env)]
    pub(crate) console: bool,
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WeightFormat {
    /// Pre-quantized GGUF weights
    Gguf,
    F32,
    F16,
    Bf16,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let opt: <Config as ClapSerde>::Opt = toml::from_str(&str)?;
        Ok(Config::from(opt))
    }

    pub fn otel_endpoint(&self) -> Option<&str> {
        Some(self.otel_endpoint.as_str()).filter(|endpoint| !endpoint.is_empty())
    }

    pub fn generation(&self) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: self.max_new_tokens,
            repeat_penalty: self.repeat_penalty,
            repeat_context_size: self.repeat_context_size,
            ..GenerationConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_qwen2_with_the_symptom_adapter() {
        let config = Config::default();
        assert_eq!(config.base_model_id, "Qwen/Qwen2-1.5B-Instruct");
        assert_eq!(config.adapter_path, "./indian-med-model");
        assert_eq!(config.weights, WeightFormat::Gguf);
        assert_eq!(config.max_new_tokens, 30);
        assert!(config.otel_endpoint().is_none());
    }

    #[test]
    fn toml_overrides_only_given_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("Normalizer.toml");
        std::fs::write(&path, "port = 8080\nweights = \"bf16\"\n")?;

        let config = Config::from_toml(path.to_str().unwrap())?;
        assert_eq!(config.port, 8080);
        assert_eq!(config.weights, WeightFormat::Bf16);
        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.generation().max_new_tokens, 30);
        Ok(())
    }
}
