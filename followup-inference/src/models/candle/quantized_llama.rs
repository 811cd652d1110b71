//! Llama architecture running on weights quantized at load time.
//!
//! Unlike `candle_transformers::models::quantized_llama`, which reads weights
//! that were quantized ahead of time into a GGUF file, this model is built from
//! safetensors weights (with an adapter already merged into them) that are
//! quantized in memory. Tensor names and rotary layout therefore follow the
//! Hugging Face checkpoint conventions.

use std::collections::HashMap;

use candle::{
    quantized::{QMatMul, QTensor},
    DType, Device, IndexOp, Module, Tensor,
};
use candle_nn::{Embedding, RmsNorm};
use candle_transformers::utils::repeat_kv;
use serde::Deserialize;
use tracing::debug;

use crate::models::{types::QuantizationType, ModelError};

fn default_rope_theta() -> f32 {
    10_000.
}

fn default_max_position_embeddings() -> usize {
    4096
}

/// `config.json` of a Hugging Face Llama checkpoint
#[derive(Clone, Debug, Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<EosTokenId>,
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

impl LlamaConfig {
    pub fn num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        match &self.eos_token_id {
            Some(EosTokenId::Single(id)) => vec![*id],
            Some(EosTokenId::Multiple(ids)) => ids.clone(),
            None => vec![],
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EosTokenId {
    Single(u32),
    Multiple(Vec<u32>),
}

fn default_low_freq_factor() -> f32 {
    1.
}

fn default_high_freq_factor() -> f32 {
    4.
}

fn default_original_max_position_embeddings() -> usize {
    8192
}

/// Rotary frequency scaling, `llama3` (Llama 3.1 and later) or `linear`
#[derive(Clone, Debug, Deserialize)]
pub struct RopeScaling {
    pub factor: f32,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f32,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f32,
    #[serde(default = "default_original_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
    #[serde(alias = "type")]
    pub rope_type: String,
}

/// Inverse rotary frequencies for one attention head
pub fn rope_inv_freq(
    head_dim: usize,
    theta: f32,
    scaling: Option<&RopeScaling>,
) -> Result<Vec<f32>, ModelError> {
    let inv_freq = (0..head_dim)
        .step_by(2)
        .map(|i| 1f32 / theta.powf(i as f32 / head_dim as f32));
    let Some(scaling) = scaling else {
        return Ok(inv_freq.collect());
    };
    match scaling.rope_type.as_str() {
        "llama3" => {
            let original = scaling.original_max_position_embeddings as f32;
            let low_freq_wavelen = original / scaling.low_freq_factor;
            let high_freq_wavelen = original / scaling.high_freq_factor;
            Ok(inv_freq
                .map(|freq| {
                    let wavelen = 2. * std::f32::consts::PI / freq;
                    if wavelen < high_freq_wavelen {
                        freq
                    } else if wavelen > low_freq_wavelen {
                        freq / scaling.factor
                    } else {
                        let smooth = (original / wavelen - scaling.low_freq_factor)
                            / (scaling.high_freq_factor - scaling.low_freq_factor);
                        (1. - smooth) * freq / scaling.factor + smooth * freq
                    }
                })
                .collect())
        }
        "linear" => Ok(inv_freq.map(|freq| freq / scaling.factor).collect()),
        other => Err(ModelError::Msg(format!(
            "unsupported rope scaling type {other}"
        ))),
    }
}

/// Whether a checkpoint tensor is a linear layer weight, quantized on load
pub fn is_linear_weight(name: &str) -> bool {
    name == "lm_head.weight" || (name.starts_with("model.layers.") && name.ends_with("_proj.weight"))
}

/// Merged weights, ready to be assembled into a [`QuantizedLlama`]
#[derive(Default)]
pub struct WeightStore {
    linear: HashMap<String, QMatMul>,
    dense: HashMap<String, Tensor>,
}

impl WeightStore {
    /// Stores `tensor` under `name`, quantizing it when it is a linear weight
    /// whose rows split evenly into quantization blocks
    pub fn insert(
        &mut self,
        name: String,
        tensor: Tensor,
        quantization: QuantizationType,
        device: &Device,
    ) -> Result<(), ModelError> {
        let tensor = tensor.to_dtype(DType::F32)?.to_device(device)?;
        if is_linear_weight(&name) {
            let weight = quantize(&tensor, quantization)?;
            self.linear.insert(name, weight);
        } else {
            self.dense.insert(name, tensor);
        }
        Ok(())
    }

    fn linear(&mut self, name: &str) -> Result<QMatMul, ModelError> {
        self.linear
            .remove(name)
            .ok_or_else(|| ModelError::MissingWeight(name.to_string()))
    }

    fn dense(&mut self, name: &str) -> Result<Tensor, ModelError> {
        self.dense
            .remove(name)
            .ok_or_else(|| ModelError::MissingWeight(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.linear.len() + self.dense.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Quantizes a 2D weight, keeping it dense when its inner dimension is not a
/// multiple of the block size
pub fn quantize(tensor: &Tensor, quantization: QuantizationType) -> Result<QMatMul, ModelError> {
    let (_, inner) = tensor.dims2()?;
    if inner % quantization.block_size() != 0 {
        debug!(
            inner,
            quantization = %quantization,
            "Inner dimension not divisible by block size, keeping weight dense"
        );
        return Ok(QMatMul::Tensor(tensor.clone()));
    }
    let qtensor = QTensor::quantize(tensor, quantization.ggml_dtype())?;
    Ok(QMatMul::from_qtensor(qtensor)?)
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor, ModelError> {
    let shape = mask.shape();
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape.dims())?;
    Ok(mask.where_cond(&on_true, on_false)?)
}

struct Mlp {
    gate_proj: QMatMul,
    up_proj: QMatMul,
    down_proj: QMatMul,
}

impl Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor, ModelError> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct Attention {
    q_proj: QMatMul,
    k_proj: QMatMul,
    v_proj: QMatMul,
    o_proj: QMatMul,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn forward(
        &mut self,
        x: &Tensor,
        index_pos: usize,
        mask: Option<&Tensor>,
        cos: &Tensor,
        sin: &Tensor,
    ) -> Result<Tensor, ModelError> {
        let (b_sz, seq_len, hidden_size) = x.dims3()?;
        let q = self
            .q_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let cos = cos.narrow(0, index_pos, seq_len)?;
        let sin = sin.narrow(0, index_pos, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k, &cos, &sin)?;

        let (k, v) = match &self.kv_cache {
            None => (k, v),
            Some((k_cache, v_cache)) => (
                Tensor::cat(&[k_cache, &k], 2)?,
                Tensor::cat(&[v_cache, &v], 2)?,
            ),
        };
        self.kv_cache = Some((k.clone(), v.clone()));

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
        let att = match mask {
            None => att,
            Some(mask) => {
                let mask = mask.broadcast_as(att.shape())?;
                masked_fill(&att, &mask, f32::NEG_INFINITY)?
            }
        };
        let att = candle_nn::ops::softmax_last_dim(&att)?;
        let y = att
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, hidden_size))?;
        Ok(self.o_proj.forward(&y)?)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn forward(
        &mut self,
        x: &Tensor,
        index_pos: usize,
        mask: Option<&Tensor>,
        cos: &Tensor,
        sin: &Tensor,
    ) -> Result<Tensor, ModelError> {
        let h = self.input_layernorm.forward(x)?;
        let h = self.self_attn.forward(&h, index_pos, mask, cos, sin)?;
        let x = h.add(x)?;
        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        Ok(h.add(&x)?)
    }
}

/// A Llama causal language model with quantized linear layers and a KV cache
pub struct QuantizedLlama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: QMatMul,
    cos: Tensor,
    sin: Tensor,
    max_sequence_length: usize,
    device: Device,
}

impl QuantizedLlama {
    /// Assembles the model, taking every weight it needs out of `weights`
    pub fn load(
        config: &LlamaConfig,
        weights: &mut WeightStore,
        quantization: QuantizationType,
        max_sequence_length: usize,
        device: &Device,
    ) -> Result<Self, ModelError> {
        let head_dim = config.head_dim();
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads();
        if num_heads % num_kv_heads != 0 {
            return Err(ModelError::Msg(format!(
                "{num_heads} attention heads cannot be grouped over {num_kv_heads} key value heads"
            )));
        }
        let max_sequence_length = max_sequence_length.min(config.max_position_embeddings);

        let inv_freq = rope_inv_freq(head_dim, config.rope_theta, config.rope_scaling.as_ref())?;
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let positions = Tensor::arange(0u32, max_sequence_length as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_sequence_length, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        let cos = freqs.cos()?;
        let sin = freqs.sin()?;

        let embed_weight = weights.dense("model.embed_tokens.weight")?;
        let lm_head = match weights.linear("lm_head.weight") {
            Ok(lm_head) => lm_head,
            Err(_) if config.tie_word_embeddings => quantize(&embed_weight, quantization)?,
            Err(e) => return Err(e),
        };
        let embed_tokens = Embedding::new(embed_weight, config.hidden_size);

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for layer_idx in 0..config.num_hidden_layers {
            let prefix = format!("model.layers.{layer_idx}");
            let self_attn = Attention {
                q_proj: weights.linear(&format!("{prefix}.self_attn.q_proj.weight"))?,
                k_proj: weights.linear(&format!("{prefix}.self_attn.k_proj.weight"))?,
                v_proj: weights.linear(&format!("{prefix}.self_attn.v_proj.weight"))?,
                o_proj: weights.linear(&format!("{prefix}.self_attn.o_proj.weight"))?,
                num_heads,
                num_kv_heads,
                head_dim,
                kv_cache: None,
            };
            let mlp = Mlp {
                gate_proj: weights.linear(&format!("{prefix}.mlp.gate_proj.weight"))?,
                up_proj: weights.linear(&format!("{prefix}.mlp.up_proj.weight"))?,
                down_proj: weights.linear(&format!("{prefix}.mlp.down_proj.weight"))?,
            };
            let input_layernorm = RmsNorm::new(
                weights.dense(&format!("{prefix}.input_layernorm.weight"))?,
                config.rms_norm_eps,
            );
            let post_attention_layernorm = RmsNorm::new(
                weights.dense(&format!("{prefix}.post_attention_layernorm.weight"))?,
                config.rms_norm_eps,
            );
            layers.push(DecoderLayer {
                self_attn,
                mlp,
                input_layernorm,
                post_attention_layernorm,
            });
        }
        let norm = RmsNorm::new(weights.dense("model.norm.weight")?, config.rms_norm_eps);

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            cos,
            sin,
            max_sequence_length,
            device: device.clone(),
        })
    }

    pub fn max_sequence_length(&self) -> usize {
        self.max_sequence_length
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Causal mask for `seq_len` new positions attending to `index_pos`
    /// cached positions plus themselves, `1` marks masked entries
    fn mask(&self, seq_len: usize, index_pos: usize) -> Result<Tensor, ModelError> {
        let kv_len = index_pos + seq_len;
        let mask: Vec<u8> = (0..seq_len)
            .flat_map(|i| (0..kv_len).map(move |j| u8::from(j > i + index_pos)))
            .collect();
        Ok(Tensor::from_slice(&mask, (seq_len, kv_len), &self.device)?)
    }

    /// Runs `input` (`batch x seq_len` token ids) starting at position
    /// `index_pos` and returns the logits of the last position
    pub fn forward(&mut self, input: &Tensor, index_pos: usize) -> Result<Tensor, ModelError> {
        let (_, seq_len) = input.dims2()?;
        if index_pos + seq_len > self.max_sequence_length {
            return Err(ModelError::Msg(format!(
                "sequence of length {} exceeds the maximum of {}",
                index_pos + seq_len,
                self.max_sequence_length
            )));
        }
        let mask = if seq_len == 1 {
            None
        } else {
            Some(self.mask(seq_len, index_pos)?)
        };
        let mut x = self.embed_tokens.forward(input)?;
        for layer in self.layers.iter_mut() {
            x = layer.forward(&x, index_pos, mask.as_ref(), &self.cos, &self.sin)?;
        }
        let x = self.norm.forward(&x)?;
        let x = x.i((.., seq_len - 1, ..))?.contiguous()?;
        Ok(self.lm_head.forward(&x)?)
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.self_attn.kv_cache = None;
        }
    }
}
