use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use candle_core::quantized::{gguf_file, QTensor};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::sync::Api;
use serde::Deserialize;

pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";

/// Subset of a PEFT `adapter_config.json` needed to merge a LoRA adapter.
#[derive(Deserialize, Debug, Clone)]
pub struct LoraConfig {
    pub peft_type: String,
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    /// DoRA rescales every merged weight by a learned magnitude
    #[serde(default)]
    pub use_dora: bool,
    /// Fully trained modules shipped next to the low rank pairs
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

impl LoraConfig {
    pub fn scaling(&self) -> f64 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f64).sqrt()
        } else {
            self.lora_alpha / self.r as f64
        }
    }

    fn validate(&self) -> Result<()> {
        if self.peft_type != "LORA" {
            bail!("Unsupported adapter type {}, only LORA can be merged", self.peft_type)
        }
        if self.r == 0 {
            bail!("LoRA rank cannot be zero")
        }
        if self.use_dora {
            bail!("DoRA adapters cannot be merged as plain LoRA deltas")
        }
        if let Some(modules) = self.modules_to_save.as_ref().filter(|m| !m.is_empty()) {
            bail!("Adapters with fully trained modules are not supported: {modules:?}")
        }
        Ok(())
    }
}

/// The low rank pair of one adapted linear layer, `A` is `r x in` and `B` is `out x r`.
#[derive(Debug, Clone)]
pub struct LoraPair {
    pub a: Tensor,
    pub b: Tensor,
}

#[derive(Debug, Clone)]
pub struct LoraAdapter {
    pub config: LoraConfig,
    /// Keyed by module path, e.g. `model.layers.0.self_attn.q_proj`
    pub layers: BTreeMap<String, LoraPair>,
}

enum LoraPart {
    A,
    B,
}

/// Splits a PEFT tensor name into its module path and matrix.
fn split_lora_key(key: &str) -> Option<(&str, LoraPart)> {
    let key = key.strip_prefix("base_model.model.").unwrap_or(key);
    for (suffix, part) in [
        (".lora_A.weight", LoraPart::A),
        (".lora_B.weight", LoraPart::B),
        (".lora_A.default.weight", LoraPart::A),
        (".lora_B.default.weight", LoraPart::B),
    ] {
        if let Some(module) = key.strip_suffix(suffix) {
            return Some((module, part));
        }
    }
    None
}

/// Maps a Qwen2 module path onto the tensor name llama.cpp uses in GGUF files.
pub fn gguf_tensor_name(module: &str) -> Option<String> {
    if module == "lm_head" {
        return Some("output.weight".to_string());
    }
    let rest = module.strip_prefix("model.layers.")?;
    let (index, sub_module) = rest.split_once('.')?;
    let index: usize = index.parse().ok()?;
    let name = match sub_module {
        "self_attn.q_proj" => "attn_q",
        "self_attn.k_proj" => "attn_k",
        "self_attn.v_proj" => "attn_v",
        "self_attn.o_proj" => "attn_output",
        "mlp.gate_proj" => "ffn_gate",
        "mlp.up_proj" => "ffn_up",
        "mlp.down_proj" => "ffn_down",
        _ => return None,
    };
    Some(format!("blk.{index}.{name}.weight"))
}

/// Resolves the adapter directory, downloading it from the hub when `path` is not a local directory.
#[tracing::instrument(level = "info", skip(api))]
pub fn resolve_adapter_dir(api: &Api, path: &str) -> Result<PathBuf> {
    let local = Path::new(path);
    if local.is_dir() {
        return Ok(local.to_path_buf());
    }

    tracing::info!("No local adapter directory at {path}, fetching it from the hub");
    let repo = api.model(path.to_string());
    let config_file = repo
        .get(ADAPTER_CONFIG_FILENAME)
        .with_context(|| format!("Failed to fetch adapter {path}"))?;
    repo.get(ADAPTER_WEIGHTS_FILENAME)
        .with_context(|| format!("Failed to fetch adapter weights of {path}"))?;
    config_file
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("Adapter files of {path} have no parent directory"))
}

impl LoraAdapter {
    #[tracing::instrument(level = "info")]
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(ADAPTER_CONFIG_FILENAME);
        let config = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config: LoraConfig = serde_json::from_str(&config)
            .with_context(|| format!("Invalid adapter config {}", config_path.display()))?;
        config.validate()?;

        let weights_path = dir.join(ADAPTER_WEIGHTS_FILENAME);
        if !weights_path.exists() {
            bail!(
                "Adapter weights {} not found, only safetensors adapters are supported",
                weights_path.display()
            )
        }
        let tensors = candle_core::safetensors::load(&weights_path, &Device::Cpu)?;
        let adapter = Self::from_tensors(config, tensors)?;

        tracing::info!(
            "Loaded LoRA adapter with {} layers, rank {}, scaling {}",
            adapter.layers.len(),
            adapter.config.r,
            adapter.config.scaling()
        );
        Ok(adapter)
    }

    pub fn from_tensors(config: LoraConfig, tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut halves: BTreeMap<String, (Option<Tensor>, Option<Tensor>)> = BTreeMap::new();
        for (key, tensor) in tensors {
            if key.contains("lora_embedding") {
                bail!("Embedding adapters are not supported: {key}")
            }
            if key.contains("lora_magnitude_vector") {
                bail!("DoRA magnitude vectors are not supported: {key}")
            }
            if key.contains("modules_to_save") {
                bail!("Fully trained modules are not supported: {key}")
            }
            let Some((module, part)) = split_lora_key(&key) else {
                tracing::warn!("Ignoring non LoRA tensor {key} in adapter");
                continue;
            };
            let entry = halves.entry(module.to_string()).or_default();
            match part {
                LoraPart::A => entry.0 = Some(tensor),
                LoraPart::B => entry.1 = Some(tensor),
            }
        }

        let mut layers = BTreeMap::new();
        for (module, halves) in halves {
            let (Some(a), Some(b)) = halves else {
                bail!("Adapter layer {module} is missing one of its lora_A/lora_B matrices")
            };
            layers.insert(module, LoraPair { a, b });
        }
        if layers.is_empty() {
            bail!("Adapter does not contain any LoRA layers")
        }

        Ok(Self { config, layers })
    }

    /// `scaling * B x A` in f32, laid out like the base weight.
    pub fn delta(&self, pair: &LoraPair) -> Result<Tensor> {
        let a = pair.a.to_dtype(DType::F32)?;
        let b = pair.b.to_dtype(DType::F32)?;
        let delta = b.matmul(&a)?.affine(self.config.scaling(), 0.)?;
        if self.config.fan_in_fan_out {
            Ok(delta.t()?.contiguous()?)
        } else {
            Ok(delta)
        }
    }

    fn merge_weight(&self, name: &str, weight: &Tensor, pair: &LoraPair) -> Result<Tensor> {
        let delta = self.delta(pair)?.to_device(weight.device())?;
        if delta.dims() != weight.dims() {
            bail!(
                "Adapter delta for {name} has shape {:?} but the base weight is {:?}",
                delta.dims(),
                weight.dims()
            )
        }
        Ok(weight.to_dtype(DType::F32)?.add(&delta)?)
    }

    /// Merges into safetensors weights, keyed by the Hugging Face names.
    #[tracing::instrument(level = "info", skip_all)]
    pub fn merge_into_tensors(&self, weights: &mut HashMap<String, Tensor>) -> Result<()> {
        for (module, pair) in &self.layers {
            let name = format!("{module}.weight");
            let weight = weights
                .get(&name)
                .ok_or_else(|| anyhow!("Adapter targets {name} which the base model lacks"))?;
            let merged = self.merge_weight(&name, weight, pair)?.to_dtype(weight.dtype())?;
            weights.insert(name, merged);
        }
        Ok(())
    }

    /// Rewrites a GGUF file with the adapter merged in. Targeted tensors are dequantized,
    /// merged and quantized back to their original type, the rest is copied over.
    #[tracing::instrument(level = "info", skip_all)]
    pub fn merge_into_gguf<R: Read + Seek>(
        &self,
        content: &gguf_file::Content,
        reader: &mut R,
    ) -> Result<Cursor<Vec<u8>>> {
        let device = Device::Cpu;
        let mut targets = HashMap::new();
        for (module, pair) in &self.layers {
            let name = gguf_tensor_name(module)
                .ok_or_else(|| anyhow!("No GGUF tensor is known for adapter module {module}"))?;
            targets.insert(name, pair);
        }

        let mut names: Vec<&String> = content.tensor_infos.keys().collect();
        names.sort();
        let mut tensors = Vec::with_capacity(names.len());
        for name in names {
            let qtensor = content.tensor(reader, name, &device)?;
            let qtensor = match targets.remove(name.as_str()) {
                Some(pair) => {
                    let weight = qtensor.dequantize(&device)?;
                    let merged = self.merge_weight(name, &weight, pair)?;
                    QTensor::quantize(&merged, qtensor.dtype())?
                }
                None => qtensor,
            };
            tensors.push((name.as_str(), qtensor));
        }
        if !targets.is_empty() {
            let mut missing: Vec<_> = targets.into_keys().collect();
            missing.sort();
            bail!("Adapter targets tensors the base model lacks: {}", missing.join(", "))
        }

        // The writer applies its own alignment
        let metadata: Vec<(&str, &gguf_file::Value)> = content
            .metadata
            .iter()
            .filter(|(key, _)| key.as_str() != "general.alignment")
            .map(|(key, value)| (key.as_str(), value))
            .collect();
        let tensors: Vec<(&str, &QTensor)> =
            tensors.iter().map(|(name, tensor)| (*name, tensor)).collect();

        let mut buffer = Cursor::new(Vec::new());
        gguf_file::write(&mut buffer, &metadata, &tensors)?;
        buffer.set_position(0);
        Ok(buffer)
    }
}
