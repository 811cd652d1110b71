use std::{collections::BTreeSet, path::PathBuf};

use candle::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};
use tracing::info;

use crate::bail;

use super::ModelError;

pub mod followup_llama;
pub mod lora;
pub mod quantized_llama;

/// Name of the index file listing the shards of a sharded safetensors checkpoint
const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
/// Name of a single file safetensors checkpoint
const SAFETENSORS_SINGLE: &str = "model.safetensors";

pub fn device(device_id: usize) -> Result<Device, candle::Error> {
    if cuda_is_available() {
        info!("Using CUDA");
        Device::new_cuda(device_id)
    } else if metal_is_available() {
        info!("Using Metal");
        Device::new_metal(device_id)
    } else {
        info!("Using Cpu");
        Ok(Device::Cpu)
    }
}

/// Builds the Hugging Face hub client, authenticated when a token is available
pub fn hub_api(api_key: Option<String>, cache_dir: PathBuf) -> Result<Api, ModelError> {
    Ok(ApiBuilder::new()
        .with_progress(true)
        .with_token(api_key)
        .with_cache_dir(cache_dir)
        .build()?)
}

/// Downloads every shard listed in the safetensors index of `repo`, or the
/// single `model.safetensors` file when the checkpoint is not sharded
pub fn hub_load_safetensors(repo: &ApiRepo) -> Result<Vec<PathBuf>, ModelError> {
    let json_file = match repo.get(SAFETENSORS_INDEX) {
        Ok(json_file) => json_file,
        Err(_) => return Ok(vec![repo.get(SAFETENSORS_SINGLE)?]),
    };
    let json_file = std::fs::File::open(json_file)?;
    let json: serde_json::Value = serde_json::from_reader(&json_file)?;
    let safetensors_files = safetensors_shards(&json)?;
    let safetensors_files = safetensors_files
        .iter()
        .map(|v| repo.get(v).map_err(ModelError::from))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(safetensors_files)
}

/// Collects the distinct shard file names of a safetensors index, in a stable order
fn safetensors_shards(index: &serde_json::Value) -> Result<BTreeSet<String>, ModelError> {
    let weight_map = match index.get("weight_map") {
        None => bail!("no weight map in safetensors index"),
        Some(serde_json::Value::Object(map)) => map,
        Some(_) => bail!("weight map in safetensors index is not a map"),
    };
    Ok(weight_map
        .values()
        .filter_map(|value| value.as_str())
        .map(|file| file.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_safetensors_shards_are_deduplicated() {
        let index = json!({
            "metadata": {"total_size": 16060522496u64},
            "weight_map": {
                "lm_head.weight": "model-00004-of-00004.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00004.safetensors",
                "model.layers.0.mlp.down_proj.weight": "model-00001-of-00004.safetensors",
                "model.norm.weight": "model-00004-of-00004.safetensors"
            }
        });
        let shards = safetensors_shards(&index).unwrap();
        assert_eq!(
            shards.into_iter().collect::<Vec<_>>(),
            vec![
                "model-00001-of-00004.safetensors".to_string(),
                "model-00004-of-00004.safetensors".to_string()
            ]
        );
    }

    #[test]
    fn test_safetensors_index_without_weight_map() {
        assert!(safetensors_shards(&json!({"metadata": {}})).is_err());
        assert!(safetensors_shards(&json!({"weight_map": []})).is_err());
    }
}
