use std::ffi::c_char;

use cudarc::{
    driver::CudaContext,
    nccl::safe::{Comm, Id},
};
use tracing::debug;

use crate::CoordinationError;

const NCCL_ID_LEN: usize = 128;

pub struct NcclCommunicator {
    comm: Comm,
}

impl NcclCommunicator {
    /// Raw bytes of a fresh NCCL unique id, ready to be sent to peers.
    pub fn unique_id() -> Result<Vec<u8>, CoordinationError> {
        let id = Id::new().map_err(|err| CoordinationError::Nccl(format!("{err:?}")))?;
        Ok(id.internal().iter().map(|byte| *byte as u8).collect())
    }

    /// Collective: every rank of the world must call this with the same id.
    pub fn new(
        device_ordinal: usize,
        rank: usize,
        world_size: usize,
        id: &[u8],
    ) -> Result<Self, CoordinationError> {
        let internal: [c_char; NCCL_ID_LEN] = id
            .iter()
            .map(|byte| *byte as c_char)
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| {
                CoordinationError::Nccl(format!(
                    "expected a {NCCL_ID_LEN} byte id, got {} bytes",
                    id.len()
                ))
            })?;
        let ctx = CudaContext::new(device_ordinal)
            .map_err(|_| CoordinationError::NoDevice(device_ordinal))?;
        let stream = ctx.default_stream();
        let comm = Comm::from_rank(stream, rank, world_size, Id::uninit(internal))
            .map_err(|err| CoordinationError::Nccl(format!("{err:?}")))?;
        debug!(rank, world_size, device_ordinal, "Created NCCL communicator");
        Ok(Self { comm })
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }
}
