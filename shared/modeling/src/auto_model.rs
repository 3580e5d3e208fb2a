use std::{collections::HashMap, path::PathBuf, time::Instant};

use candle_core::{DType, Device, Tensor};
use sae_data_provider::download_model_repo_sync;
use tracing::{debug, info};

use crate::{
    auto_tokenizer, HubTokenizer, Int8Weight, ModelConfig, ModelLoadError, PrecisionChoice,
    PretrainedSource, QuantizationConfig,
};

/// Pretrained weights resident on one device.
#[derive(Debug)]
pub struct ModelHandle {
    name: String,
    device: Device,
    dtype: DType,
    config: ModelConfig,
    weights: HashMap<String, Tensor>,
    quantized: HashMap<String, Int8Weight>,
}

impl ModelHandle {
    pub fn new(
        name: String,
        device: Device,
        dtype: DType,
        config: ModelConfig,
        weights: HashMap<String, Tensor>,
        quantized: HashMap<String, Int8Weight>,
    ) -> Self {
        Self {
            name,
            device,
            dtype,
            config,
            weights,
            quantized,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The dtype floating point weights are actually stored in.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn is_quantized(&self) -> bool {
        !self.quantized.is_empty()
    }

    pub fn num_tensors(&self) -> usize {
        self.weights.len() + self.quantized.len()
    }

    pub fn num_parameters(&self) -> usize {
        self.weights.values().map(Tensor::elem_count).sum::<usize>()
            + self
                .quantized
                .values()
                .map(|w| w.dims().iter().product::<usize>())
                .sum::<usize>()
    }

    /// A weight in the handle's dtype, dequantizing if needed.
    pub fn weight(&self, name: &str) -> Option<candle_core::Result<Tensor>> {
        if let Some(tensor) = self.weights.get(name) {
            return Some(Ok(tensor.clone()));
        }
        self.quantized
            .get(name)
            .map(|weight| weight.dequantize(self.dtype))
    }
}

/// Everything the loader needs to know about one model.
#[derive(Debug, Clone)]
pub struct ModelLoadRequest {
    pub model: String,
    pub revision: Option<String>,
    pub device: Device,
    pub precision: PrecisionChoice,
    pub quantization: QuantizationConfig,
    pub token: Option<String>,
    pub cache: Option<PathBuf>,
    pub progress_bar: bool,
}

fn local_repo_files(dir: &std::path::Path) -> Result<Vec<PathBuf>, ModelLoadError> {
    let io_err = |source| ModelLoadError::Io {
        path: dir.to_owned(),
        source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

/// Resolves `model` to repository files: a local directory as-is, anything
/// else from the HF hub.
pub fn fetch_pretrained(request: &ModelLoadRequest) -> Result<PretrainedSource, ModelLoadError> {
    let dir = std::path::Path::new(&request.model);
    let files = if dir.is_dir() {
        local_repo_files(dir)?
    } else {
        info!(model = %request.model, "Downloading model from HF hub");
        download_model_repo_sync(
            &request.model,
            request.revision.clone(),
            request.cache.clone(),
            request.token.clone(),
            request.progress_bar,
        )?
    };
    Ok(PretrainedSource::RepoFiles(files))
}

/// Decides the dtype floating point weights are kept in.
fn effective_dtype(
    precision: PrecisionChoice,
    config: &ModelConfig,
    stored: &HashMap<String, Tensor>,
) -> DType {
    precision
        .dtype()
        .or_else(|| config.torch_dtype())
        .or_else(|| {
            stored
                .values()
                .map(Tensor::dtype)
                .find(|dtype| dtype.is_float())
        })
        .unwrap_or(DType::F32)
}

/// Loads weights from `source` onto the request's device, quantizing linear
/// weights to int8 when asked to.
pub fn load_weights(
    name: &str,
    source: &PretrainedSource,
    request: &ModelLoadRequest,
) -> Result<ModelHandle, ModelLoadError> {
    let shards = source.safetensors();
    if shards.is_empty() {
        return Err(ModelLoadError::MissingFile("safetensors weights"));
    }
    let config = match source.find("config.json") {
        Some(path) => ModelConfig::from_file(path)?,
        None => ModelConfig::default(),
    };

    let mut stored = HashMap::new();
    for shard in shards {
        debug!(shard = %shard.display(), "Loading safetensors shard");
        stored.extend(candle_core::safetensors::load(shard, &request.device)?);
    }

    let dtype = effective_dtype(request.precision, &config, &stored);
    let mut weights = HashMap::with_capacity(stored.len());
    let mut quantized = HashMap::new();
    for (tensor_name, tensor) in stored {
        if request.quantization.load_in_8bit && crate::is_quantizable(&tensor_name, &tensor) {
            quantized.insert(tensor_name, Int8Weight::quantize(&tensor)?);
        } else if tensor.dtype().is_float() && tensor.dtype() != dtype {
            weights.insert(tensor_name, tensor.to_dtype(dtype)?);
        } else {
            weights.insert(tensor_name, tensor);
        }
    }

    Ok(ModelHandle::new(
        name.to_owned(),
        request.device.clone(),
        dtype,
        config,
        weights,
        quantized,
    ))
}

/// Fetches a pretrained model and its tokenizer and places the weights on the
/// requested device.
pub fn auto_model_from_pretrained(
    request: &ModelLoadRequest,
) -> Result<(ModelHandle, HubTokenizer), ModelLoadError> {
    let start_time = Instant::now();
    let source = fetch_pretrained(request)?;
    let tokenizer = auto_tokenizer(source.files())?;
    let model = load_weights(&request.model, &source, request)?;
    info!(
        model = %request.model,
        device = ?model.device().location(),
        dtype = model.dtype().as_str(),
        quantized = model.is_quantized(),
        parameters = model.num_parameters(),
        duration_secs = start_time.elapsed().as_secs_f32(),
        "Loaded model"
    );
    Ok((model, tokenizer))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn write_checkpoint(dir: &std::path::Path, torch_dtype: Option<&str>) -> Vec<PathBuf> {
        let device = Device::Cpu;
        let tensors: HashMap<String, Tensor> = [
            (
                "layers.0.mlp.weight".to_owned(),
                Tensor::arange(0f32, 12., &device).unwrap().reshape((3, 4)).unwrap(),
            ),
            (
                "embed_in.weight".to_owned(),
                Tensor::ones((5, 4), DType::F32, &device).unwrap(),
            ),
            (
                "layers.0.mlp.bias".to_owned(),
                Tensor::zeros(3, DType::F32, &device).unwrap(),
            ),
        ]
        .into_iter()
        .collect();
        let weights = dir.join("model.safetensors");
        candle_core::safetensors::save(&tensors, &weights).unwrap();

        let config = dir.join("config.json");
        let json = match torch_dtype {
            Some(dtype) => serde_json::json!({ "model_type": "gpt_neox", "torch_dtype": dtype }),
            None => serde_json::json!({ "model_type": "gpt_neox" }),
        };
        std::fs::write(&config, json.to_string()).unwrap();
        vec![weights, config]
    }

    fn request(precision: PrecisionChoice, load_in_8bit: bool) -> ModelLoadRequest {
        ModelLoadRequest {
            model: "test-model".to_owned(),
            revision: None,
            device: Device::Cpu,
            precision,
            quantization: QuantizationConfig { load_in_8bit },
            token: None,
            cache: None,
            progress_bar: false,
        }
    }

    #[test]
    fn explicit_precision_casts_weights() {
        let dir = tempfile::tempdir().unwrap();
        let source = PretrainedSource::RepoFiles(write_checkpoint(dir.path(), None));
        let model =
            load_weights("m", &source, &request(PrecisionChoice::BFloat16, false)).unwrap();
        assert_eq!(model.dtype(), DType::BF16);
        assert!(!model.is_quantized());
        assert_eq!(model.num_tensors(), 3);
        let weight = model.weight("layers.0.mlp.weight").unwrap().unwrap();
        assert_eq!(weight.dtype(), DType::BF16);
    }

    #[test]
    fn auto_precision_follows_config() {
        let dir = tempfile::tempdir().unwrap();
        let source = PretrainedSource::RepoFiles(write_checkpoint(dir.path(), Some("float16")));
        let model = load_weights("m", &source, &request(PrecisionChoice::Auto, false)).unwrap();
        assert_eq!(model.dtype(), DType::F16);
    }

    #[test]
    fn auto_precision_falls_back_to_stored_dtype() {
        let dir = tempfile::tempdir().unwrap();
        let source = PretrainedSource::RepoFiles(write_checkpoint(dir.path(), None));
        let model = load_weights("m", &source, &request(PrecisionChoice::Auto, false)).unwrap();
        assert_eq!(model.dtype(), DType::F32);
    }

    #[test]
    fn eight_bit_quantizes_linear_weights_only() {
        let dir = tempfile::tempdir().unwrap();
        let source = PretrainedSource::RepoFiles(write_checkpoint(dir.path(), None));
        let model = load_weights("m", &source, &request(PrecisionChoice::Float16, true)).unwrap();
        assert!(model.is_quantized());
        assert_eq!(model.dtype(), DType::F16);
        assert_eq!(model.num_tensors(), 3);
        assert_eq!(model.num_parameters(), 12 + 20 + 3);

        let restored = model.weight("layers.0.mlp.weight").unwrap().unwrap();
        assert_eq!(restored.dtype(), DType::F16);
        assert_eq!(restored.dims(), &[3, 4]);
        let embed = model.weight("embed_in.weight").unwrap().unwrap();
        assert_eq!(embed.dtype(), DType::F16);
    }

    #[test]
    fn missing_weights_is_an_error() {
        let source = PretrainedSource::RepoFiles(vec![PathBuf::from("/tmp/config.json")]);
        assert!(matches!(
            load_weights("m", &source, &request(PrecisionChoice::Auto, false)),
            Err(ModelLoadError::MissingFile(_))
        ));
    }
}
