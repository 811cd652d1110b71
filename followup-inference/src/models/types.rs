use std::{fmt::Display, path::PathBuf};

use candle::{quantized::GgmlDType, Device};
use candle_transformers::generation::Sampling;
use serde::{Deserialize, Serialize};

/// Block quantization applied to the linear layers of the model.
///
/// `Q8_0` keeps 8 bits per weight with one scale per 32-weight block. The
/// k-quant variants (`Q4K`, `Q5K`, `Q6K`) additionally quantize the block
/// scales inside 256-weight super blocks.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationType {
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    #[default]
    Q8_0,
    #[serde(rename = "q4k")]
    Q4K,
    #[serde(rename = "q5k")]
    Q5K,
    #[serde(rename = "q6k")]
    Q6K,
}

impl QuantizationType {
    pub fn ggml_dtype(&self) -> GgmlDType {
        match self {
            Self::Q4_0 => GgmlDType::Q4_0,
            Self::Q4_1 => GgmlDType::Q4_1,
            Self::Q5_0 => GgmlDType::Q5_0,
            Self::Q5_1 => GgmlDType::Q5_1,
            Self::Q8_0 => GgmlDType::Q8_0,
            Self::Q4K => GgmlDType::Q4K,
            Self::Q5K => GgmlDType::Q5K,
            Self::Q6K => GgmlDType::Q6K,
        }
    }

    /// Number of weights per quantization block, the last dimension of a
    /// quantized tensor must be a multiple of it
    pub fn block_size(&self) -> usize {
        self.ggml_dtype().block_size()
    }
}

impl Display for QuantizationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Q4_0 => write!(f, "q4_0"),
            Self::Q4_1 => write!(f, "q4_1"),
            Self::Q5_0 => write!(f, "q5_0"),
            Self::Q5_1 => write!(f, "q5_1"),
            Self::Q8_0 => write!(f, "q8_0"),
            Self::Q4K => write!(f, "q4k"),
            Self::Q5K => write!(f, "q5k"),
            Self::Q6K => write!(f, "q6k"),
        }
    }
}

/// Sampling configuration for a single generation call.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Maximum number of tokens generated after the prompt
    pub max_new_tokens: usize,
    /// Softmax temperature
    pub temperature: f64,
    /// Number of most likely tokens kept before nucleus filtering
    pub top_k: usize,
    /// Nucleus sampling probability mass
    pub top_p: f64,
    /// Samples from the distribution when set, otherwise decodes greedily
    pub do_sample: bool,
    /// Seed of the sampler, a fresh random seed is drawn per request when absent
    pub seed: Option<u64>,
    /// Penalty applied to recently generated tokens, `1.0` disables it
    pub repeat_penalty: f32,
    /// Window of recent tokens the repeat penalty looks at
    pub repeat_last_n: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: 0.3,
            top_k: 30,
            top_p: 0.95,
            do_sample: true,
            seed: None,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
        }
    }
}

impl GenerationParams {
    pub fn sampling(&self) -> Sampling {
        if !self.do_sample || self.temperature <= 0. {
            return Sampling::ArgMax;
        }
        Sampling::TopKThenTopP {
            k: self.top_k,
            p: self.top_p,
            temperature: self.temperature,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or_else(rand::random)
    }
}

/// Input of a text generation run
#[derive(Clone, Debug)]
pub struct TextModelInput {
    pub prompt: String,
    pub params: GenerationParams,
}

/// Output of a text generation run
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TextModelOutput {
    /// The prompt followed by the generated continuation
    pub generated_text: String,
    /// Number of tokens in the encoded prompt
    pub prompt_tokens: usize,
    /// Number of tokens sampled
    pub generated_tokens: usize,
    /// Generation wall time, in seconds
    pub time: f64,
}

#[derive(Debug)]
pub struct LlmLoadData {
    pub device: Device,
    pub file_paths: LlmFilePaths,
    pub model_id: String,
    pub quantization: QuantizationType,
    pub max_sequence_length: usize,
}

/// Local paths of every artifact fetched for the model
#[derive(Clone, Debug)]
pub struct LlmFilePaths {
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
    pub adapter_config: PathBuf,
    pub adapter_weights: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
}
