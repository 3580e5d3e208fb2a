mod bootstrap;
mod cli;
mod collaborators;
mod error;

pub use bootstrap::{
    run, AcceleratorProbe, Collaborators, DatasetSource, JoinedGroup, ModelAcquirer,
    ProcessGroupInitializer, RunSummary, TrainerBuilder,
};
pub use cli::{ConfigurationError, RunConfig, SaeConfig, TrainConfig};
pub use collaborators::{
    CandleAccelerator, DataFeedTrainers, HubDatasets, HubModels, TcpGroupInitializer,
};
pub use error::{BootstrapError, ResourceAcquisitionError};
