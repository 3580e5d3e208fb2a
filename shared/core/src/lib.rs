mod env;
mod sharding;
mod topology;

pub use env::{Environment, ProcessEnvironment};
pub use sharding::{shard_indices, PartitionError, ShardIndices, ShardStrategy};
pub use topology::{
    detect_launch, detect_rendezvous, detect_topology, LaunchEnvironment, RendezvousConfig,
    RunTopology, TopologyError, DEFAULT_INIT_TIMEOUT, DEFAULT_MASTER_ADDR, DEFAULT_MASTER_PORT,
    INIT_TIMEOUT_VAR, LOCAL_RANK_VAR, MASTER_ADDR_VAR, MASTER_PORT_VAR, MAX_INIT_TIMEOUT, RANK_VAR,
    WORLD_SIZE_VAR,
};
