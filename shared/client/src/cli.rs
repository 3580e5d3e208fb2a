use std::{ffi::OsString, path::PathBuf};

use clap::{ArgAction, Args, Parser};
use sae_core::{ShardStrategy, TopologyError};
use sae_data_provider::{LoadOptions, DEFAULT_TEXT_KEY};
use sae_modeling::{Devices, TrainerSettings};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("invalid launch environment: {0}")]
    Topology(#[from] TopologyError),

    #[error("{0}")]
    Arguments(#[from] clap::Error),

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Shape of the sparse autoencoder.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct SaeConfig {
    /// Multiple of the model's hidden size to use as the number of latents.
    #[clap(long, default_value_t = 32)]
    pub expansion_factor: usize,

    /// Normalize decoder rows to unit norm after every step.
    #[clap(long, default_value_t = true, action = ArgAction::Set)]
    pub normalize_decoder: bool,

    /// Number of latents. Overrides `--expansion-factor` when nonzero.
    #[clap(long, default_value_t = 0)]
    pub num_latents: usize,

    /// Number of latents kept active per token.
    #[clap(short, long, default_value_t = 32)]
    pub k: usize,
}

/// Settings handed through to the trainer.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct TrainConfig {
    #[clap(flatten)]
    pub sae: SaeConfig,

    #[clap(long, default_value_t = 8)]
    pub batch_size: usize,

    /// Number of batches whose gradients are accumulated before a step.
    #[clap(long, default_value_t = 1)]
    pub grad_acc_steps: usize,

    /// Number of micro-batches each batch is split into.
    #[clap(long, default_value_t = 1)]
    pub micro_acc_steps: usize,

    /// Base learning rate. Chosen from the number of latents when absent.
    #[clap(long)]
    pub lr: Option<f64>,

    #[clap(long, default_value_t = 1000)]
    pub lr_warmup_steps: usize,

    #[clap(long, default_value_t = 0.0)]
    pub auxk_alpha: f64,

    /// Number of tokens after which an inactive latent counts as dead.
    #[clap(long, default_value_t = 10_000_000)]
    pub dead_feature_threshold: usize,

    /// Module names to train SAEs on. Comma separated.
    #[clap(long, value_delimiter = ',')]
    pub hookpoints: Vec<String>,

    /// Layer indices to train SAEs on. Comma separated.
    #[clap(long, value_delimiter = ',')]
    pub layers: Vec<usize>,

    /// Train on every nth layer. Cannot be combined with `--layers`.
    #[clap(long, default_value_t = 1)]
    pub layer_stride: usize,

    /// Spread the SAEs of different layers across ranks instead of
    /// replicating them.
    #[clap(long)]
    pub distribute_modules: bool,

    #[clap(long, default_value_t = 1000)]
    pub save_every: usize,

    #[clap(long)]
    pub run_name: Option<String>,

    /// Load linear weights in 8-bit. Non-quantized tensors use float16.
    #[clap(long)]
    pub load_in_8bit: bool,

    /// Hugging Face access token for gated models and datasets.
    #[clap(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,
}

/// Everything a run needs to know, resolved once from the command line.
#[derive(Parser, Debug, Clone, PartialEq)]
#[clap(
    name = "sae-train",
    version,
    about = "Train sparse autoencoders on the activations of a pretrained language model"
)]
pub struct RunConfig {
    /// Name of the model to train on, or a local directory holding it.
    #[clap(default_value = "EleutherAI/pythia-160m")]
    pub model: String,

    /// Dataset to train on, or a local file or directory holding it.
    #[clap(default_value = "togethercomputer/RedPajama-Data-1T-Sample")]
    pub dataset: String,

    #[clap(long, default_value = "train")]
    pub split: String,

    /// Context length of each training sequence.
    #[clap(long, default_value_t = 2048)]
    pub ctx_len: usize,

    /// Column holding the document text.
    #[clap(long, default_value = DEFAULT_TEXT_KEY)]
    pub text_key: String,

    /// Allow reading the hub's parquet export of datasets that only ship a
    /// loading script.
    #[clap(long, default_value_t = true, action = ArgAction::Set)]
    pub trust_remote_code: bool,

    /// How tokenized sequences are divided between ranks.
    #[clap(long, value_enum, default_value_t = ShardStrategy::Contiguous)]
    pub shard_strategy: ShardStrategy,

    /// Device for single-process runs: auto, cpu, cuda or cuda:N. Distributed
    /// runs always use the device of their local rank.
    #[clap(long, default_value = "auto")]
    pub device: Devices,

    /// Hugging Face cache directory.
    #[clap(long)]
    pub cache_dir: Option<PathBuf>,

    #[clap(flatten)]
    pub train: TrainConfig,
}

impl RunConfig {
    /// Parses `args` (program name first) over the declared defaults and
    /// validates the result.
    pub fn resolve<I, T>(args: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let config = Self::try_parse_from(args)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let train = &self.train;
        let mut errors = Vec::new();
        if self.ctx_len == 0 {
            errors.push("ctx_len must be positive".to_owned());
        }
        if self.split.trim().is_empty() {
            errors.push("split must not be empty".to_owned());
        }
        if train.batch_size == 0 {
            errors.push("batch_size must be positive".to_owned());
        }
        if train.grad_acc_steps == 0 {
            errors.push("grad_acc_steps must be positive".to_owned());
        }
        if train.micro_acc_steps == 0 {
            errors.push("micro_acc_steps must be positive".to_owned());
        } else if train.batch_size % train.micro_acc_steps != 0 {
            errors.push(format!(
                "batch_size ({}) must be divisible by micro_acc_steps ({})",
                train.batch_size, train.micro_acc_steps
            ));
        }
        if train.sae.k == 0 {
            errors.push("k must be positive".to_owned());
        }
        if train.sae.num_latents == 0 && train.sae.expansion_factor == 0 {
            errors.push("either num_latents or expansion_factor must be positive".to_owned());
        }
        if let Some(lr) = train.lr {
            if !(lr.is_finite() && lr > 0.0) {
                errors.push(format!("lr must be a positive number, got {lr}"));
            }
        }
        if train.layer_stride == 0 {
            errors.push("layer_stride must be positive".to_owned());
        }
        if !train.layers.is_empty() && train.layer_stride != 1 {
            errors.push("cannot specify both layers and layer_stride".to_owned());
        }
        match errors.is_empty() {
            true => Ok(()),
            false => Err(ConfigurationError::Invalid(errors)),
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            split: self.split.clone(),
            text_key: self.text_key.clone(),
            trust_remote_code: self.trust_remote_code,
            revision: None,
            cache: self.cache_dir.clone(),
            token: self.train.hf_token.clone(),
            progress_bar: false,
        }
    }

    pub fn trainer_settings(&self) -> TrainerSettings {
        TrainerSettings {
            batch_size: self.train.batch_size,
            grad_acc_steps: self.train.grad_acc_steps,
            micro_acc_steps: self.train.micro_acc_steps,
            save_every: self.train.save_every,
            ..TrainerSettings::default()
        }
    }
}
