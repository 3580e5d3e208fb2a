use std::{ffi::OsString, io::Write, time::Instant};

use candle_core::{DType, Device};
use sae_core::{detect_launch, Environment, LaunchEnvironment, RendezvousConfig, RunTopology};
use sae_data_provider::{
    chunk_and_tokenize, ChunkOptions, LoadOptions, RawDataset, TextTokenizer, TokenizedDataset,
};
use sae_distributed::{CoordinationError, ProcessGroup};
use sae_logging::OutputGate;
use sae_modeling::{
    dtype_name, ModelHandle, ModelLoadRequest, PrecisionChoice, QuantizationConfig, Trainer,
};
use tracing::{debug, info, info_span};

use crate::{BootstrapError, ConfigurationError, ResourceAcquisitionError, RunConfig};

/// A joined process group and the accelerator this rank is bound to.
pub struct JoinedGroup {
    pub group: Box<dyn ProcessGroup>,
    pub device: Device,
}

pub trait ProcessGroupInitializer {
    /// Binds the local accelerator and blocks until the whole world has joined.
    fn init(
        &self,
        topology: &RunTopology,
        rendezvous: &RendezvousConfig,
    ) -> Result<JoinedGroup, CoordinationError>;
}

pub trait AcceleratorProbe {
    fn supports_bf16(&self, device: &Device) -> bool;
}

pub trait ModelAcquirer {
    fn acquire(
        &self,
        request: &ModelLoadRequest,
    ) -> Result<(ModelHandle, Box<dyn TextTokenizer>), ResourceAcquisitionError>;
}

pub trait DatasetSource {
    fn load(
        &self,
        dataset: &str,
        options: &LoadOptions,
    ) -> Result<RawDataset, ResourceAcquisitionError>;
}

pub trait TrainerBuilder {
    fn build(
        &self,
        config: &RunConfig,
        data: TokenizedDataset,
        model: ModelHandle,
    ) -> anyhow::Result<Box<dyn Trainer>>;
}

/// The outside world a run talks to.
pub struct Collaborators {
    pub process_groups: Box<dyn ProcessGroupInitializer>,
    pub accelerator: Box<dyn AcceleratorProbe>,
    pub models: Box<dyn ModelAcquirer>,
    pub datasets: Box<dyn DatasetSource>,
    pub trainers: Box<dyn TrainerBuilder>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub topology: RunTopology,
    pub precision: PrecisionChoice,
    pub dtype: DType,
    /// Training sequences this rank trained on.
    pub sequences: usize,
}

/// Brings a run from process start to a finished `fit`.
///
/// Every stage runs exactly once, in order: topology, process group,
/// configuration, precision, model and tokenizer, dataset, sharding and
/// finally the trainer. The first failure ends the run.
pub fn run<I, T>(
    env: &dyn Environment,
    args: I,
    collaborators: &Collaborators,
    console: Box<dyn Write + Send>,
) -> Result<RunSummary, BootstrapError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let start_time = Instant::now();
    let LaunchEnvironment {
        topology,
        rendezvous,
    } = detect_launch(env).map_err(ConfigurationError::from)?;
    let _span = info_span!("run", rank = topology.rank).entered();
    info!(%topology, "Detected launch topology");

    let (topology, joined) = if topology.is_distributed {
        let joined = collaborators.process_groups.init(&topology, &rendezvous)?;
        let topology = topology.with_world_size(joined.group.world_size());
        (topology, Some(joined))
    } else {
        (topology, None)
    };
    let gate = OutputGate::new(topology, console);
    if topology.is_distributed {
        gate.report(format_args!("Using DDP across {} GPUs.", topology.world_size));
    }

    let config = RunConfig::resolve(args)?;
    debug!(
        model = %config.model,
        dataset = %config.dataset,
        split = %config.split,
        ctx_len = config.ctx_len,
        "Resolved configuration"
    );

    let device = match &joined {
        Some(joined) => joined.device.clone(),
        None => config.device.device_for_rank(0)?,
    };
    let precision = PrecisionChoice::select(
        config.train.load_in_8bit,
        collaborators.accelerator.supports_bf16(&device),
    );
    info!(%precision, device = ?device.location(), "Selected precision");

    let request = ModelLoadRequest {
        model: config.model.clone(),
        revision: None,
        device,
        precision,
        quantization: QuantizationConfig {
            load_in_8bit: config.train.load_in_8bit,
        },
        token: config.train.hf_token.clone(),
        cache: config.cache_dir.clone(),
        progress_bar: topology.is_coordinator(),
    };
    let (model, tokenizer) = collaborators.models.acquire(&request)?;

    let raw = collaborators
        .datasets
        .load(&config.dataset, &config.load_options())?;
    let mut data = chunk_and_tokenize(
        &raw,
        tokenizer.as_ref(),
        &ChunkOptions::new(config.ctx_len),
    )?;
    drop(raw);

    if topology.is_distributed {
        let total = data.len();
        data = data.shard(topology.world_size, topology.rank, config.shard_strategy)?;
        info!(
            rank = topology.rank,
            total,
            local = data.len(),
            tokens = data.num_tokens(),
            strategy = %config.shard_strategy,
            "Sharded training data"
        );
    }

    let dtype = model.dtype();
    let sequences = data.len();
    gate.scope(|gate| {
        gate.report(format_args!(
            "Training on '{}' (split '{}')",
            config.dataset, config.split
        ));
        gate.report(format_args!("Storing model weights in {}", dtype_name(dtype)));
        let mut trainer = collaborators
            .trainers
            .build(&config, data, model)
            .map_err(BootstrapError::Trainer)?;
        trainer.fit().map_err(BootstrapError::Trainer)
    })?;

    // keep the group alive until every rank is done training
    drop(joined);
    info!(
        duration_secs = start_time.elapsed().as_secs_f32(),
        "Run finished"
    );
    Ok(RunSummary {
        topology,
        precision,
        dtype,
        sequences,
    })
}
