use std::{fmt, time::Duration};

use thiserror::Error;

use crate::Environment;

pub const LOCAL_RANK_VAR: &str = "LOCAL_RANK";
pub const RANK_VAR: &str = "RANK";
pub const WORLD_SIZE_VAR: &str = "WORLD_SIZE";
pub const MASTER_ADDR_VAR: &str = "MASTER_ADDR";
pub const MASTER_PORT_VAR: &str = "MASTER_PORT";
pub const INIT_TIMEOUT_VAR: &str = "SAE_INIT_TIMEOUT_SECS";

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const MAX_INIT_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TopologyError {
    #[error("environment variable {var} must be a non-negative integer, got {value:?}")]
    InvalidInteger { var: &'static str, value: String },

    #[error("{WORLD_SIZE_VAR} must be at least 1")]
    EmptyWorld,

    #[error("{MASTER_PORT_VAR} must be a port number, got {0:?}")]
    InvalidPort(String),

    #[error("{INIT_TIMEOUT_VAR} must be at most {max} seconds, got {0:?}", max = MAX_INIT_TIMEOUT.as_secs())]
    TimeoutTooLong(String),
}

/// Where this process sits in the launch.
///
/// Built once at start-up. A non-distributed run is always rank 0 of a world of
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTopology {
    pub is_distributed: bool,
    pub rank: usize,
    pub world_size: usize,
    pub local_device_index: usize,
}

impl RunTopology {
    pub const fn single_process() -> Self {
        Self {
            is_distributed: false,
            rank: 0,
            world_size: 1,
            local_device_index: 0,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// Re-stamps the topology with the world size the process group agreed on.
    pub fn with_world_size(self, world_size: usize) -> Self {
        Self { world_size, ..self }
    }
}

impl fmt::Display for RunTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_distributed {
            write!(
                f,
                "rank {}/{} (local device {})",
                self.rank, self.world_size, self.local_device_index
            )
        } else {
            write!(f, "single process")
        }
    }
}

/// Where rank 0 waits for its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousConfig {
    pub master_addr: String,
    pub master_port: u16,
    pub timeout: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            master_addr: DEFAULT_MASTER_ADDR.to_owned(),
            master_port: DEFAULT_MASTER_PORT,
            timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}

impl RendezvousConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}

/// Everything a launcher told this process through its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnvironment {
    pub topology: RunTopology,
    pub rendezvous: RendezvousConfig,
}

fn parse_index(env: &dyn Environment, var: &'static str) -> Result<Option<usize>, TopologyError> {
    env.var(var)
        .map(|value| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| TopologyError::InvalidInteger { var, value })
        })
        .transpose()
}

/// Decides whether this process is one of several launched together.
///
/// The presence of `LOCAL_RANK` is the sole signal. `RANK` overrides the
/// global rank for multi-node launches and `WORLD_SIZE` gives the expected
/// size of the group, defaulting to one.
pub fn detect_topology(env: &dyn Environment) -> Result<RunTopology, TopologyError> {
    let Some(local_rank) = parse_index(env, LOCAL_RANK_VAR)? else {
        return Ok(RunTopology::single_process());
    };
    let rank = parse_index(env, RANK_VAR)?.unwrap_or(local_rank);
    let world_size = parse_index(env, WORLD_SIZE_VAR)?.unwrap_or(1);
    if world_size == 0 {
        return Err(TopologyError::EmptyWorld);
    }
    Ok(RunTopology {
        is_distributed: true,
        rank,
        world_size,
        local_device_index: local_rank,
    })
}

pub fn detect_rendezvous(env: &dyn Environment) -> Result<RendezvousConfig, TopologyError> {
    let master_addr = env
        .var(MASTER_ADDR_VAR)
        .unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_owned());
    let master_port = match env.var(MASTER_PORT_VAR) {
        Some(port) => port
            .trim()
            .parse::<u16>()
            .map_err(|_| TopologyError::InvalidPort(port))?,
        None => DEFAULT_MASTER_PORT,
    };
    let timeout = match parse_index(env, INIT_TIMEOUT_VAR)? {
        Some(secs) => {
            let timeout = Duration::from_secs(secs as u64);
            if timeout > MAX_INIT_TIMEOUT {
                return Err(TopologyError::TimeoutTooLong(secs.to_string()));
            }
            timeout
        }
        None => DEFAULT_INIT_TIMEOUT,
    };
    Ok(RendezvousConfig {
        master_addr,
        master_port,
        timeout,
    })
}

/// Reads the topology, and for distributed launches the rendezvous point, in
/// one pass over the environment.
pub fn detect_launch(env: &dyn Environment) -> Result<LaunchEnvironment, TopologyError> {
    let topology = detect_topology(env)?;
    let rendezvous = match topology.is_distributed {
        true => detect_rendezvous(env)?,
        false => RendezvousConfig::default(),
    };
    Ok(LaunchEnvironment {
        topology,
        rendezvous,
    })
}
