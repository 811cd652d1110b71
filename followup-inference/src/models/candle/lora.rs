//! Low-rank adapters saved in the PEFT format.
//!
//! An adapter checkpoint holds, for every targeted linear layer, a pair of
//! matrices `lora_A` (`r x in_features`) and `lora_B` (`out_features x r`).
//! The adapter is folded into the base weights once, at load time, so that
//! generation runs on a plain (quantized) model:
//!
//! ```text
//! W' = W + scaling * (B @ A)
//! ```
//!
//! Embedding layers store the pair as `lora_embedding_A` (`r x num_embeddings`)
//! and `lora_embedding_B` (`embedding_dim x r`), their update is the transpose
//! of `B @ A`.

use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
};

use candle::{DType, Device, Tensor};
use serde::Deserialize;
use tracing::{debug, info};

use crate::models::ModelError;

/// Prefix PEFT adds in front of the wrapped model parameter names
const PEFT_PREFIX: &str = "base_model.model.";
const LORA_A: &str = ".lora_A";
const LORA_B: &str = ".lora_B";
const LORA_EMBEDDING_A: &str = ".lora_embedding_A";
const LORA_EMBEDDING_B: &str = ".lora_embedding_B";
const LORA_MAGNITUDE: &str = ".lora_magnitude_vector";
const MODULES_TO_SAVE: &str = "modules_to_save.";
const ALL_LINEAR: &str = "all-linear";

/// Modules an adapter targets, either an explicit list or a single pattern
/// such as `all-linear`
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

impl TargetModules {
    /// Whether the module at path `module` (e.g. `model.layers.0.self_attn.q_proj`)
    /// is targeted. Names match the last path segments of the module.
    pub fn matches(&self, module: &str) -> bool {
        match self {
            Self::List(names) => names.iter().any(|name| module_matches(module, name)),
            Self::Pattern(pattern) if pattern == ALL_LINEAR => true,
            Self::Pattern(pattern) => module_matches(module, pattern),
        }
    }
}

fn module_matches(module: &str, name: &str) -> bool {
    module == name
        || module
            .strip_suffix(name)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// The subset of PEFT's `adapter_config.json` needed to merge the adapter
#[derive(Clone, Debug, Deserialize)]
pub struct LoraConfig {
    /// Rank of the decomposition
    pub r: usize,
    /// Numerator of the scaling factor
    pub lora_alpha: f64,
    #[serde(default)]
    pub target_modules: Option<TargetModules>,
    /// Rank-stabilized scaling, `alpha / sqrt(r)` instead of `alpha / r`
    #[serde(default)]
    pub use_rslora: bool,
    /// Set when the base layer stores its weight as `(in, out)`
    #[serde(default)]
    pub fan_in_fan_out: bool,
    /// Weight-decomposed adapters, which cannot be merged as a plain delta
    #[serde(default)]
    pub use_dora: bool,
    #[serde(default)]
    pub peft_type: Option<String>,
}

impl LoraConfig {
    pub fn scaling(&self) -> f64 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f64).sqrt()
        } else {
            self.lora_alpha / self.r as f64
        }
    }
}

/// Role of a tensor stored in an adapter checkpoint, keyed by the name of
/// the base weight it applies to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdapterWeight {
    LoraA(String),
    LoraB(String),
    EmbeddingA(String),
    EmbeddingB(String),
    Magnitude(String),
    Full(String),
}

/// Maps an adapter tensor name to the base weight it modifies.
///
/// Handles both `...q_proj.lora_A.weight` and the named-adapter form
/// `...q_proj.lora_A.default.weight`.
pub fn adapter_weight_name(key: &str) -> AdapterWeight {
    let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);
    let base_name = |position: usize| {
        let (module, rest) = key.split_at(position);
        let suffix = if rest.ends_with(".bias") {
            "bias"
        } else {
            "weight"
        };
        format!("{module}.{suffix}")
    };
    let markers: [(&str, fn(String) -> AdapterWeight); 5] = [
        (LORA_EMBEDDING_A, AdapterWeight::EmbeddingA),
        (LORA_EMBEDDING_B, AdapterWeight::EmbeddingB),
        (LORA_MAGNITUDE, AdapterWeight::Magnitude),
        (LORA_A, AdapterWeight::LoraA),
        (LORA_B, AdapterWeight::LoraB),
    ];
    for (marker, weight) in markers {
        if let Some(position) = key.find(marker) {
            return weight(base_name(position));
        }
    }
    AdapterWeight::Full(key.replace(MODULES_TO_SAVE, ""))
}

#[derive(Default)]
struct LoraPair {
    a: Option<Tensor>,
    b: Option<Tensor>,
    embedding: bool,
}

/// A complete low-rank pair. Embedding updates are transposed before merging.
struct LoraDelta {
    a: Tensor,
    b: Tensor,
    transpose: bool,
}

/// A LoRA adapter ready to be merged into base weights, one tensor at a time.
pub struct LoraAdapter {
    config: LoraConfig,
    /// Low-rank pairs, keyed by base weight name
    pairs: HashMap<String, LoraDelta>,
    /// Weights the adapter replaces entirely (`modules_to_save`)
    replacements: HashMap<String, Tensor>,
}

impl LoraAdapter {
    /// Loads `adapter_config.json` and `adapter_model.safetensors`, keeping the
    /// (small) adapter tensors on the CPU until they are merged
    pub fn load<P: AsRef<Path>>(config_path: P, weights_path: P) -> Result<Self, ModelError> {
        let config_file = std::fs::File::open(config_path.as_ref())?;
        let config: LoraConfig = serde_json::from_reader(config_file)?;
        let tensors = candle::safetensors::load(weights_path.as_ref(), &Device::Cpu)?;
        let adapter = Self::from_tensors(config, tensors)?;
        info!(
            rank = adapter.config.r,
            alpha = adapter.config.lora_alpha,
            lora_layers = adapter.pairs.len(),
            replaced_layers = adapter.replacements.len(),
            "Loaded LoRA adapter"
        );
        Ok(adapter)
    }

    pub fn from_tensors(
        config: LoraConfig,
        tensors: HashMap<String, Tensor>,
    ) -> Result<Self, ModelError> {
        if let Some(peft_type) = &config.peft_type {
            if peft_type != "LORA" {
                return Err(ModelError::InvalidAdapter(format!(
                    "unsupported peft type {peft_type}"
                )));
            }
        }
        if config.r == 0 {
            return Err(ModelError::InvalidAdapter("rank must be positive".into()));
        }
        if config.use_dora {
            return Err(ModelError::InvalidAdapter(
                "DoRA adapters are not supported".into(),
            ));
        }

        let mut partial_pairs: HashMap<String, LoraPair> = HashMap::new();
        let mut replacements = HashMap::new();
        for (key, tensor) in tensors {
            match adapter_weight_name(&key) {
                AdapterWeight::LoraA(name) => partial_pairs.entry(name).or_default().a = Some(tensor),
                AdapterWeight::LoraB(name) => partial_pairs.entry(name).or_default().b = Some(tensor),
                AdapterWeight::EmbeddingA(name) => {
                    let pair = partial_pairs.entry(name).or_default();
                    pair.a = Some(tensor);
                    pair.embedding = true;
                }
                AdapterWeight::EmbeddingB(name) => {
                    let pair = partial_pairs.entry(name).or_default();
                    pair.b = Some(tensor);
                    pair.embedding = true;
                }
                AdapterWeight::Magnitude(name) => {
                    return Err(ModelError::InvalidAdapter(format!(
                        "DoRA magnitude vector for {name} is not supported"
                    )))
                }
                AdapterWeight::Full(name) => {
                    replacements.insert(name, tensor);
                }
            }
        }

        let mut pairs = HashMap::with_capacity(partial_pairs.len());
        for (name, pair) in partial_pairs {
            if let Some(target_modules) = &config.target_modules {
                let module = name.rsplit_once('.').map_or(name.as_str(), |(module, _)| module);
                if !target_modules.matches(module) {
                    return Err(ModelError::InvalidAdapter(format!(
                        "{name} is not covered by the adapter target modules"
                    )));
                }
            }
            match (pair.a, pair.b) {
                (Some(a), Some(b)) => {
                    pairs.insert(
                        name,
                        LoraDelta {
                            a,
                            b,
                            transpose: pair.embedding,
                        },
                    );
                }
                _ => {
                    return Err(ModelError::InvalidAdapter(format!(
                        "incomplete lora pair for {name}"
                    )))
                }
            }
        }

        Ok(Self {
            config,
            pairs,
            replacements,
        })
    }

    /// Applies the adapter to the base weight `name`, consuming the adapter
    /// entry. Weights the adapter does not touch are returned as is.
    pub fn merge(&mut self, name: &str, weight: Tensor) -> Result<Tensor, ModelError> {
        if let Some(replacement) = self.replacements.remove(name) {
            debug!(weight = name, "Replacing base weight with adapter weight");
            return Ok(replacement.to_device(weight.device())?.to_dtype(weight.dtype())?);
        }
        let Some(LoraDelta { a, b, transpose }) = self.pairs.remove(name) else {
            return Ok(weight);
        };

        let device = weight.device();
        let a = a.to_device(device)?.to_dtype(DType::F32)?;
        let b = b.to_device(device)?.to_dtype(DType::F32)?;
        let delta = b.matmul(&a)?;
        let delta = if transpose || self.config.fan_in_fan_out {
            delta.t()?
        } else {
            delta
        };
        if delta.dims() != weight.dims() {
            return Err(ModelError::InvalidAdapter(format!(
                "lora delta for {name} has shape {:?}, base weight has shape {:?}",
                delta.dims(),
                weight.dims()
            )));
        }
        let delta = delta.affine(self.config.scaling(), 0.)?;
        let merged = weight.to_dtype(DType::F32)?.add(&delta)?;
        Ok(merged.to_dtype(weight.dtype())?)
    }

    /// Names of the base weights the adapter still holds updates for
    pub fn remaining(&self) -> BTreeSet<String> {
        self.pairs
            .keys()
            .chain(self.replacements.keys())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(r: usize, lora_alpha: f64) -> LoraConfig {
        LoraConfig {
            r,
            lora_alpha,
            target_modules: Some(TargetModules::List(vec![
                "q_proj".into(),
                "v_proj".into(),
                "up_proj".into(),
                "embed_tokens".into(),
            ])),
            use_rslora: false,
            fan_in_fan_out: false,
            use_dora: false,
            peft_type: Some("LORA".into()),
        }
    }

    #[test]
    fn test_adapter_weight_name() {
        assert_eq!(
            adapter_weight_name("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight"),
            AdapterWeight::LoraA("model.layers.0.self_attn.q_proj.weight".into())
        );
        assert_eq!(
            adapter_weight_name(
                "base_model.model.model.layers.31.mlp.down_proj.lora_B.default.weight"
            ),
            AdapterWeight::LoraB("model.layers.31.mlp.down_proj.weight".into())
        );
        assert_eq!(
            adapter_weight_name("base_model.model.lm_head.weight"),
            AdapterWeight::Full("lm_head.weight".into())
        );
        assert_eq!(
            adapter_weight_name("base_model.model.model.embed_tokens.modules_to_save.weight"),
            AdapterWeight::Full("model.embed_tokens.weight".into())
        );
    }

    #[test]
    fn test_adapter_weight_name_for_embeddings_and_dora() {
        assert_eq!(
            adapter_weight_name("base_model.model.model.embed_tokens.lora_embedding_A"),
            AdapterWeight::EmbeddingA("model.embed_tokens.weight".into())
        );
        assert_eq!(
            adapter_weight_name("base_model.model.model.embed_tokens.lora_embedding_B.default"),
            AdapterWeight::EmbeddingB("model.embed_tokens.weight".into())
        );
        assert_eq!(
            adapter_weight_name(
                "base_model.model.model.layers.0.self_attn.q_proj.lora_magnitude_vector"
            ),
            AdapterWeight::Magnitude("model.layers.0.self_attn.q_proj.weight".into())
        );
    }

    #[test]
    fn test_target_modules_matching() {
        let targets = TargetModules::List(vec!["q_proj".into(), "mlp.up_proj".into()]);
        assert!(targets.matches("model.layers.0.self_attn.q_proj"));
        assert!(targets.matches("model.layers.3.mlp.up_proj"));
        assert!(!targets.matches("model.layers.0.self_attn.k_proj"));
        assert!(!targets.matches("model.layers.0.self_attn.qq_proj"));
        assert!(TargetModules::Pattern(ALL_LINEAR.into()).matches("lm_head"));
        assert!(TargetModules::Pattern("v_proj".into()).matches("model.layers.1.self_attn.v_proj"));
    }

    #[test]
    fn test_scaling() {
        assert_eq!(config(16, 32.).scaling(), 2.);
        let rslora = LoraConfig {
            use_rslora: true,
            ..config(16, 32.)
        };
        assert_eq!(rslora.scaling(), 8.);
    }

    #[test]
    fn test_adapter_config_deserialization() {
        let json = r#"{
            "base_model_name_or_path": "meta-llama/Meta-Llama-3.1-8B",
            "peft_type": "LORA",
            "r": 8,
            "lora_alpha": 16,
            "lora_dropout": 0.05,
            "target_modules": ["q_proj", "k_proj", "v_proj", "o_proj"],
            "task_type": "CAUSAL_LM"
        }"#;
        let config: LoraConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.r, 8);
        assert_eq!(config.scaling(), 2.);
        assert!(!config.fan_in_fan_out);
        assert_eq!(
            config.target_modules,
            Some(TargetModules::List(vec![
                "q_proj".into(),
                "k_proj".into(),
                "v_proj".into(),
                "o_proj".into()
            ]))
        );
    }

    #[test]
    fn test_merge_adds_scaled_low_rank_update() {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight".to_string(),
            Tensor::ones((1, 3), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            "base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight".to_string(),
            Tensor::new(&[[1f32], [2f32]], &device).unwrap(),
        );
        let mut adapter = LoraAdapter::from_tensors(config(1, 2.), tensors).unwrap();
        assert_eq!(adapter.remaining().len(), 1);

        let base = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        let merged = adapter
            .merge("model.layers.0.self_attn.q_proj.weight", base)
            .unwrap();
        assert_eq!(
            merged.to_vec2::<f32>().unwrap(),
            vec![vec![2., 2., 2.], vec![4., 4., 4.]]
        );
        assert!(adapter.remaining().is_empty());

        let untouched = Tensor::ones((2, 3), DType::F32, &device).unwrap();
        let merged = adapter
            .merge("model.layers.0.self_attn.k_proj.weight", untouched)
            .unwrap();
        assert_eq!(
            merged.to_vec2::<f32>().unwrap(),
            vec![vec![1., 1., 1.], vec![1., 1., 1.]]
        );
    }

    #[test]
    fn test_merge_replaces_saved_modules() {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.lm_head.weight".to_string(),
            Tensor::ones((2, 2), DType::F32, &device).unwrap(),
        );
        let mut adapter = LoraAdapter::from_tensors(config(4, 8.), tensors).unwrap();
        let base = Tensor::zeros((2, 2), DType::F16, &device).unwrap();
        let merged = adapter.merge("lm_head.weight", base).unwrap();
        assert_eq!(merged.dtype(), DType::F16);
        assert_eq!(
            merged.to_dtype(DType::F32).unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![1., 1.], vec![1., 1.]]
        );
    }

    #[test]
    fn test_merge_rejects_mismatched_shapes() {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.layers.0.mlp.up_proj.lora_A.weight".to_string(),
            Tensor::ones((1, 3), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            "base_model.model.model.layers.0.mlp.up_proj.lora_B.weight".to_string(),
            Tensor::ones((2, 1), DType::F32, &device).unwrap(),
        );
        let mut adapter = LoraAdapter::from_tensors(config(1, 1.), tensors).unwrap();
        let base = Tensor::zeros((3, 3), DType::F32, &device).unwrap();
        assert!(matches!(
            adapter.merge("model.layers.0.mlp.up_proj.weight", base),
            Err(ModelError::InvalidAdapter(_))
        ));
    }

    #[test]
    fn test_merge_embedding_adds_transposed_update() {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        // r = 1, 3 embeddings of dimension 2
        tensors.insert(
            "base_model.model.model.embed_tokens.lora_embedding_A".to_string(),
            Tensor::new(&[[1f32, 2., 3.]], &device).unwrap(),
        );
        tensors.insert(
            "base_model.model.model.embed_tokens.lora_embedding_B".to_string(),
            Tensor::new(&[[1f32], [10.]], &device).unwrap(),
        );
        let mut adapter = LoraAdapter::from_tensors(config(1, 1.), tensors).unwrap();

        let base = Tensor::zeros((3, 2), DType::F32, &device).unwrap();
        let merged = adapter.merge("model.embed_tokens.weight", base).unwrap();
        assert_eq!(
            merged.to_vec2::<f32>().unwrap(),
            vec![vec![1., 10.], vec![2., 20.], vec![3., 30.]]
        );
        assert!(adapter.remaining().is_empty());
    }

    #[test]
    fn test_untargeted_pair_is_rejected() {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.layers.0.self_attn.k_proj.lora_A.weight".to_string(),
            Tensor::ones((1, 3), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            "base_model.model.model.layers.0.self_attn.k_proj.lora_B.weight".to_string(),
            Tensor::ones((2, 1), DType::F32, &device).unwrap(),
        );
        assert!(matches!(
            LoraAdapter::from_tensors(config(1, 1.), tensors),
            Err(ModelError::InvalidAdapter(_))
        ));
    }

    #[test]
    fn test_dora_adapters_are_rejected() {
        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.layers.0.self_attn.q_proj.lora_magnitude_vector".to_string(),
            Tensor::ones(2, DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(matches!(
            LoraAdapter::from_tensors(config(1, 1.), tensors),
            Err(ModelError::InvalidAdapter(_))
        ));

        let dora = LoraConfig {
            use_dora: true,
            ..config(1, 1.)
        };
        assert!(matches!(
            LoraAdapter::from_tensors(dora, HashMap::new()),
            Err(ModelError::InvalidAdapter(_))
        ));
    }

    #[test]
    fn test_incomplete_pair_is_rejected() {
        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.layers.0.self_attn.v_proj.lora_A.weight".to_string(),
            Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(matches!(
            LoraAdapter::from_tensors(config(1, 1.), tensors),
            Err(ModelError::InvalidAdapter(_))
        ));
    }
}
