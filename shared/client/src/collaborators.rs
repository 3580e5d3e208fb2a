use candle_core::Device;
use sae_core::{RendezvousConfig, RunTopology};
use sae_data_provider::{load_dataset, LoadOptions, RawDataset, TextTokenizer, TokenizedDataset};
use sae_distributed::{init_process_group, Backend, CoordinationError};
use sae_modeling::{
    auto_model_from_pretrained, bind_device, supports_bf16, DataFeedTrainer, ModelHandle,
    ModelLoadRequest, Trainer,
};
use tracing::warn;

use crate::{
    AcceleratorProbe, Collaborators, DatasetSource, JoinedGroup, ModelAcquirer,
    ProcessGroupInitializer, ResourceAcquisitionError, RunConfig, TrainerBuilder,
};

/// Rendezvous over TCP, with NCCL on top when the build has it.
#[derive(Debug, Clone, Copy)]
pub struct TcpGroupInitializer {
    pub backend: Backend,
}

impl Default for TcpGroupInitializer {
    fn default() -> Self {
        Self {
            backend: Backend::preferred(),
        }
    }
}

impl ProcessGroupInitializer for TcpGroupInitializer {
    fn init(
        &self,
        topology: &RunTopology,
        rendezvous: &RendezvousConfig,
    ) -> Result<JoinedGroup, CoordinationError> {
        let device = bind_device(topology.local_device_index).map_err(|err| {
            warn!(%err, local_device_index = topology.local_device_index, "Failed to bind device");
            CoordinationError::NoDevice(topology.local_device_index)
        })?;
        let group = init_process_group(topology, rendezvous, self.backend)?;
        Ok(JoinedGroup {
            group: Box::new(group),
            device,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CandleAccelerator;

impl AcceleratorProbe for CandleAccelerator {
    fn supports_bf16(&self, device: &Device) -> bool {
        supports_bf16(device)
    }
}

/// Models from the HF hub or a local checkpoint directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubModels;

impl ModelAcquirer for HubModels {
    fn acquire(
        &self,
        request: &ModelLoadRequest,
    ) -> Result<(ModelHandle, Box<dyn TextTokenizer>), ResourceAcquisitionError> {
        let (model, tokenizer) = auto_model_from_pretrained(request)?;
        Ok((model, Box::new(tokenizer)))
    }
}

/// Datasets from the HF hub or local files.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubDatasets;

impl DatasetSource for HubDatasets {
    fn load(
        &self,
        dataset: &str,
        options: &LoadOptions,
    ) -> Result<RawDataset, ResourceAcquisitionError> {
        Ok(load_dataset(dataset, options)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DataFeedTrainers;

impl TrainerBuilder for DataFeedTrainers {
    fn build(
        &self,
        config: &RunConfig,
        data: TokenizedDataset,
        model: ModelHandle,
    ) -> anyhow::Result<Box<dyn Trainer>> {
        Ok(Box::new(DataFeedTrainer::new(
            config.trainer_settings(),
            data,
            model,
        )))
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            process_groups: Box::new(TcpGroupInitializer::default()),
            accelerator: Box::new(CandleAccelerator),
            models: Box::new(HubModels),
            datasets: Box::new(HubDatasets),
            trainers: Box::new(DataFeedTrainers),
        }
    }
}
