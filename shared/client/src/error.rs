use sae_core::PartitionError;
use sae_data_provider::{ChunkError, DatasetError};
use sae_distributed::CoordinationError;
use sae_modeling::{DeviceError, ModelLoadError};
use thiserror::Error;

use crate::ConfigurationError;

#[derive(Error, Debug)]
pub enum ResourceAcquisitionError {
    #[error("no usable device: {0}")]
    Device(#[from] DeviceError),

    #[error("failed to load model: {0}")]
    Model(#[from] ModelLoadError),

    #[error("failed to load dataset: {0}")]
    Dataset(#[from] DatasetError),
}

/// Why a run stopped before or during training.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    #[error("failed to join process group: {0}")]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    ResourceAcquisition(#[from] ResourceAcquisitionError),

    #[error("failed to prepare training data: {0}")]
    Data(#[from] ChunkError),

    #[error("failed to shard training data: {0}")]
    Partition(#[from] PartitionError),

    #[error("training failed: {0:#}")]
    Trainer(anyhow::Error),
}

impl From<DeviceError> for BootstrapError {
    fn from(err: DeviceError) -> Self {
        Self::ResourceAcquisition(err.into())
    }
}
