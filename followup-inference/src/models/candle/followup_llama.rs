use std::{collections::BTreeSet, path::PathBuf, time::Instant};

use candle::{Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use hf_hub::{Repo, RepoType};
use serde_json::Value;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::{
    bail,
    models::{
        config::ModelConfig,
        types::{LlmFilePaths, LlmLoadData, TextModelInput, TextModelOutput},
        ModelError, ModelId, ModelTrait,
    },
};

use super::{
    device, hub_api, hub_load_safetensors,
    lora::LoraAdapter,
    quantized_llama::{LlamaConfig, QuantizedLlama, WeightStore},
};

const ADAPTER_CONFIG: &str = "adapter_config.json";
const ADAPTER_WEIGHTS: &str = "adapter_model.safetensors";
const TOKENIZER: &str = "tokenizer.json";
const TOKENIZER_CONFIG: &str = "tokenizer_config.json";

/// Base Llama checkpoint with a LoRA adapter merged in, quantized at load
/// time and used to generate follow-up questions.
pub struct FollowUpModel {
    model: QuantizedLlama,
    tokenizer: Tokenizer,
    eos_token_ids: BTreeSet<u32>,
    model_id: ModelId,
}

impl FollowUpModel {
    pub(crate) fn new(
        model: QuantizedLlama,
        tokenizer: Tokenizer,
        eos_token_ids: BTreeSet<u32>,
        model_id: ModelId,
    ) -> Self {
        Self {
            model,
            tokenizer,
            eos_token_ids,
            model_id,
        }
    }
}

impl ModelTrait for FollowUpModel {
    type Input = TextModelInput;
    type Output = TextModelOutput;
    type LoadData = LlmLoadData;

    fn fetch(
        api_key: Option<String>,
        cache_dir: PathBuf,
        config: ModelConfig,
    ) -> Result<Self::LoadData, ModelError> {
        let device = device(config.device_id)?;
        let api = hub_api(api_key, cache_dir)?;

        info!(
            target: "followup-inference",
            base_model = %config.base_model,
            adapter_model = %config.adapter_model,
            "Fetching model files ..."
        );
        let base_repo = api.repo(Repo::with_revision(
            config.base_model.clone(),
            RepoType::Model,
            config.base_revision.clone(),
        ));
        let config_file_path = base_repo.get("config.json")?;
        let weights = hub_load_safetensors(&base_repo)?;

        let adapter_repo = api.repo(Repo::with_revision(
            config.adapter_model.clone(),
            RepoType::Model,
            config.adapter_revision.clone(),
        ));
        let adapter_config = adapter_repo.get(ADAPTER_CONFIG)?;
        let adapter_weights = adapter_repo.get(ADAPTER_WEIGHTS)?;

        let tokenizer_repo = if config.tokenizer_model() == config.adapter_model {
            adapter_repo
        } else {
            api.model(config.tokenizer_model())
        };
        let tokenizer = tokenizer_repo.get(TOKENIZER)?;
        let tokenizer_config = match tokenizer_repo.get(TOKENIZER_CONFIG) {
            Ok(path) => Some(path),
            Err(e) => {
                debug!(
                    target: "followup-inference",
                    error = %e,
                    "No tokenizer config available, using the model config for EOS tokens"
                );
                None
            }
        };

        Ok(Self::LoadData {
            device,
            file_paths: LlmFilePaths {
                config: config_file_path,
                weights,
                adapter_config,
                adapter_weights,
                tokenizer,
                tokenizer_config,
            },
            model_id: config.model_id(),
            quantization: config.quantization,
            max_sequence_length: config.max_sequence_length,
        })
    }

    fn load(load_data: Self::LoadData) -> Result<Self, ModelError> {
        info!(
            target: "followup-inference",
            model_id = %load_data.model_id,
            quantization = %load_data.quantization,
            "Loading follow-up model ..."
        );
        let start = Instant::now();

        let device = load_data.device;
        let paths = load_data.file_paths;
        let config: LlamaConfig = serde_json::from_slice(&std::fs::read(&paths.config)?)?;
        let mut adapter = LoraAdapter::load(&paths.adapter_config, &paths.adapter_weights)?;

        // one full precision shard in memory at a time
        let mut weights = WeightStore::default();
        for shard in paths.weights.iter() {
            debug!(target: "followup-inference", shard = %shard.display(), "Loading weight shard");
            let tensors = candle::safetensors::load(shard, &Device::Cpu)?;
            for (name, tensor) in tensors {
                let tensor = adapter.merge(&name, tensor)?;
                weights.insert(name, tensor, load_data.quantization, &device)?;
            }
        }
        let remaining = adapter.remaining();
        if !remaining.is_empty() {
            warn!(
                target: "followup-inference",
                count = remaining.len(),
                weights = ?remaining,
                "Adapter weights without a matching base weight were ignored"
            );
        }

        let model = QuantizedLlama::load(
            &config,
            &mut weights,
            load_data.quantization,
            load_data.max_sequence_length,
            &device,
        )?;
        if !weights.is_empty() {
            debug!(
                target: "followup-inference",
                count = weights.len(),
                "Checkpoint weights not used by the model"
            );
        }

        let tokenizer = Tokenizer::from_file(&paths.tokenizer)?;
        let tokenizer_config = match &paths.tokenizer_config {
            Some(path) => Some(serde_json::from_slice::<Value>(&std::fs::read(path)?)?),
            None => None,
        };
        let eos_token_ids = eos_token_ids(&tokenizer, tokenizer_config.as_ref(), &config);
        if eos_token_ids.is_empty() {
            warn!(
                target: "followup-inference",
                "No end of sequence token found, generation always runs to max_new_tokens"
            );
        }

        info!(
            target: "followup-inference",
            eos_token_ids = ?eos_token_ids,
            "Loaded follow-up model in {:?}",
            start.elapsed()
        );
        Ok(Self::new(model, tokenizer, eos_token_ids, load_data.model_id))
    }

    fn model_id(&self) -> ModelId {
        self.model_id.clone()
    }

    fn run(&mut self, input: Self::Input) -> Result<Self::Output, ModelError> {
        let params = input.params;
        let mut tokens = self
            .tokenizer
            .encode(input.prompt.as_str(), true)?
            .get_ids()
            .to_vec();
        let prompt_tokens = tokens.len();
        let max_sequence_length = self.model.max_sequence_length();
        if prompt_tokens == 0 {
            bail!("prompt encodes to no tokens");
        }
        if prompt_tokens >= max_sequence_length {
            bail!(
                "prompt of {prompt_tokens} tokens does not fit the maximum sequence length of {max_sequence_length}"
            );
        }
        let max_new_tokens = params
            .max_new_tokens
            .min(max_sequence_length - prompt_tokens);

        let mut logits_processor = LogitsProcessor::from_sampling(params.seed(), params.sampling());
        let device = self.model.device().clone();
        self.model.clear_kv_cache();

        let start_gen = Instant::now();
        let mut index_pos = 0;
        for index in 0..max_new_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let context = &tokens[tokens.len().saturating_sub(context_size)..];
            let input_tensor = Tensor::new(context, &device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input_tensor, index_pos)?.squeeze(0)?;
            let logits = if params.repeat_penalty == 1. {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(params.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    params.repeat_penalty,
                    &tokens[start_at..],
                )?
            };
            index_pos += context.len();

            let next_token = logits_processor.sample(&logits)?;
            if self.eos_token_ids.contains(&next_token) {
                break;
            }
            tokens.push(next_token);
        }
        let generated_tokens = tokens.len() - prompt_tokens;
        let continuation = self.tokenizer.decode(&tokens[prompt_tokens..], true)?;

        let dt = start_gen.elapsed();
        info!(
            target: "followup-inference",
            prompt_tokens,
            generated_tokens,
            "{generated_tokens} tokens generated ({:.2} token/s)",
            generated_tokens as f64 / dt.as_secs_f64(),
        );

        Ok(TextModelOutput {
            generated_text: format!("{}{continuation}", input.prompt),
            prompt_tokens,
            generated_tokens,
            time: dt.as_secs_f64(),
        })
    }
}

/// Reads a special token entry of `tokenizer_config.json`, stored either as
/// the plain token or as an added token object with a `content` field
fn special_token(tokenizer_config: &Value, key: &str) -> Option<String> {
    match tokenizer_config.get(key)? {
        Value::String(token) => Some(token.clone()),
        Value::Object(token) => token.get("content")?.as_str().map(str::to_string),
        _ => None,
    }
}

/// Every token id that ends generation: the tokenizer config's `eos_token`
/// together with the ids listed in the model config
pub fn eos_token_ids(
    tokenizer: &Tokenizer,
    tokenizer_config: Option<&Value>,
    config: &LlamaConfig,
) -> BTreeSet<u32> {
    let mut ids: BTreeSet<u32> = config.eos_token_ids().into_iter().collect();
    if let Some(token) = tokenizer_config.and_then(|c| special_token(c, "eos_token")) {
        match tokenizer.token_to_id(&token) {
            Some(id) => {
                ids.insert(id);
            }
            None => warn!(
                target: "followup-inference",
                token = %token,
                "EOS token of the tokenizer config is not in the vocabulary"
            ),
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use serde_json::json;

    use super::*;
    use crate::models::{
        candle::quantized_llama::tests::{tiny_config, tiny_model},
        types::GenerationParams,
    };

    /// A word level tokenizer over a tiny vocabulary, splitting on whitespace
    fn word_level_tokenizer() -> Tokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [
                {"id": 1, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
            ],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {"<unk>": 0, "</s>": 1, "what": 2, "is": 3, "java": 4, "?": 5},
                "unk_token": "<unk>"
            }
        }"#;
        Tokenizer::from_str(json).unwrap()
    }

    fn tiny_followup_model(eos_token_ids: BTreeSet<u32>) -> FollowUpModel {
        FollowUpModel::new(
            tiny_model(),
            word_level_tokenizer(),
            eos_token_ids,
            "tiny+adapter".to_string(),
        )
    }

    fn greedy(max_new_tokens: usize) -> GenerationParams {
        GenerationParams {
            max_new_tokens,
            do_sample: false,
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn test_special_token_formats() {
        let config = json!({
            "eos_token": "</s>",
            "pad_token": {"content": "<pad>", "special": true},
            "bos_token": null
        });
        assert_eq!(special_token(&config, "eos_token"), Some("</s>".to_string()));
        assert_eq!(special_token(&config, "pad_token"), Some("<pad>".to_string()));
        assert_eq!(special_token(&config, "bos_token"), None);
        assert_eq!(special_token(&config, "unk_token"), None);
    }

    #[test]
    fn test_eos_token_ids_merge_both_sources() {
        let tokenizer = word_level_tokenizer();
        let config = tiny_config();

        let ids = eos_token_ids(&tokenizer, None, &config);
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1, 2]);

        let tokenizer_config = json!({"eos_token": {"content": "java"}});
        let ids = eos_token_ids(&tokenizer, Some(&tokenizer_config), &config);
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1, 2, 4]);

        let tokenizer_config = json!({"eos_token": "<|end_of_text|>"});
        let ids = eos_token_ids(&tokenizer, Some(&tokenizer_config), &config);
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_run_echoes_prompt() {
        let mut model = tiny_followup_model(BTreeSet::new());
        let output = model
            .run(TextModelInput {
                prompt: "what is java".to_string(),
                params: greedy(4),
            })
            .unwrap();
        assert!(output.generated_text.starts_with("what is java"));
        assert_eq!(output.prompt_tokens, 3);
        assert_eq!(output.generated_tokens, 4);
        assert_eq!(model.model_id(), "tiny+adapter");
    }

    #[test]
    fn test_run_is_deterministic_with_greedy_decoding() {
        let mut model = tiny_followup_model(BTreeSet::new());
        let input = TextModelInput {
            prompt: "what is java ?".to_string(),
            params: greedy(5),
        };
        let first = model.run(input.clone()).unwrap();
        let second = model.run(input).unwrap();
        assert_eq!(first.generated_text, second.generated_text);
    }

    #[test]
    fn test_run_stops_on_eos() {
        // every id of the vocabulary ends generation
        let mut model = tiny_followup_model((0..32).collect());
        let output = model
            .run(TextModelInput {
                prompt: "what is java".to_string(),
                params: greedy(10),
            })
            .unwrap();
        assert_eq!(output.generated_tokens, 0);
        assert_eq!(output.generated_text, "what is java");
    }

    #[test]
    fn test_run_without_new_tokens() {
        let mut model = tiny_followup_model(BTreeSet::new());
        let output = model
            .run(TextModelInput {
                prompt: "is java".to_string(),
                params: greedy(0),
            })
            .unwrap();
        assert_eq!(output.generated_text, "is java");
        assert_eq!(output.generated_tokens, 0);
    }

    #[test]
    fn test_run_rejects_empty_prompt() {
        let mut model = tiny_followup_model(BTreeSet::new());
        assert!(model
            .run(TextModelInput {
                prompt: String::new(),
                params: greedy(3),
            })
            .is_err());
    }

    #[test]
    fn test_run_with_sampling_and_repeat_penalty() {
        let mut model = tiny_followup_model(BTreeSet::new());
        let output = model
            .run(TextModelInput {
                prompt: "what is java".to_string(),
                params: GenerationParams {
                    max_new_tokens: 3,
                    seed: Some(42),
                    repeat_penalty: 1.1,
                    ..Default::default()
                },
            })
            .unwrap();
        assert_eq!(output.generated_tokens, 3);
    }
}
