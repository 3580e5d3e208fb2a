mod error;
#[cfg(feature = "nccl")]
mod nccl;
mod process_group;
mod rendezvous;
mod wire;

pub use error::CoordinationError;
#[cfg(feature = "nccl")]
pub use nccl::NcclCommunicator;
pub use process_group::{
    init_process_group, Backend, Communicator, GroupOptions, ProcessGroup, TcpProcessGroup,
};
