use std::path::{Path, PathBuf};

use candle_core::DType;
use serde::Deserialize;
use thiserror::Error;

use crate::{AutoTokenizerError, DeviceError};

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("failed to fetch model from HF hub: {0}")]
    HfHub(#[from] hf_hub::api::sync::ApiError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid model config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("model files contain no {0}")]
    MissingFile(&'static str),

    #[error("failed to load weights: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("failed to load tokenizer: {0}")]
    Tokenizer(#[from] AutoTokenizerError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Where a pretrained model comes from.
#[derive(Debug, Clone)]
pub enum PretrainedSource {
    /// Every file of a downloaded or local model repository.
    RepoFiles(Vec<PathBuf>),
}

impl PretrainedSource {
    pub fn files(&self) -> &[PathBuf] {
        match self {
            PretrainedSource::RepoFiles(files) => files,
        }
    }

    pub fn find(&self, filename: &str) -> Option<&Path> {
        self.files()
            .iter()
            .find(|path| path.file_name().is_some_and(|name| name == filename))
            .map(PathBuf::as_path)
    }

    pub fn safetensors(&self) -> Vec<&Path> {
        let mut files: Vec<&Path> = self
            .files()
            .iter()
            .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
            .map(PathBuf::as_path)
            .collect();
        files.sort();
        files
    }
}

/// `config.json` of a Hugging Face model, kept as raw JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ModelConfig {
    config: serde_json::Value,
}

impl From<serde_json::Value> for ModelConfig {
    fn from(config: serde_json::Value) -> Self {
        Self { config }
    }
}

impl ModelConfig {
    pub fn from_file(path: &Path) -> Result<Self, ModelLoadError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
            path: path.to_owned(),
            source,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.config.as_object().and_then(|x| x.get(key))
    }

    pub fn model_type(&self) -> Option<&str> {
        self.get("model_type").and_then(|x| x.as_str())
    }

    /// The dtype the checkpoint declares for its weights.
    pub fn torch_dtype(&self) -> Option<DType> {
        self.get("torch_dtype")
            .and_then(|x| x.as_str())
            .and_then(parse_torch_dtype)
    }

    pub fn max_position_embeddings(&self) -> Option<usize> {
        self.get("max_position_embeddings")
            .and_then(|x| x.as_u64())
            .map(|x| x as usize)
    }

    pub fn num_hidden_layers(&self) -> Option<usize> {
        self.get("num_hidden_layers")
            .and_then(|x| x.as_u64())
            .map(|x| x as usize)
    }
}

pub fn parse_torch_dtype(name: &str) -> Option<DType> {
    match name.trim_start_matches("torch.") {
        "float16" | "half" => Some(DType::F16),
        "bfloat16" => Some(DType::BF16),
        "float32" | "float" => Some(DType::F32),
        "float64" | "double" => Some(DType::F64),
        _ => None,
    }
}

/// Human readable name of a floating point dtype, as written in model configs.
pub fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F16 => "float16",
        DType::BF16 => "bfloat16",
        DType::F32 => "float32",
        DType::F64 => "float64",
        other => other.as_str(),
    }
}
