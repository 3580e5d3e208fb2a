use std::{fmt, net::TcpListener, time::Duration};

use clap::ValueEnum;
use sae_core::{RendezvousConfig, RunTopology};
use tracing::{info, warn};

use crate::{
    rendezvous,
    wire::{deadline_after, Connection, Message},
    CoordinationError,
};
#[cfg(feature = "nccl")]
use crate::NcclCommunicator;

/// Transport used for collectives once the group is formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Rendezvous links only. Enough to agree on membership and barrier.
    Tcp,
    /// NCCL communicator on the bound GPU, id exchanged over the rendezvous.
    Nccl,
}

impl Backend {
    /// The fastest transport compiled into this build.
    pub fn preferred() -> Self {
        if cfg!(feature = "nccl") {
            Backend::Nccl
        } else {
            Backend::Tcp
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Tcp => write!(f, "tcp"),
            Backend::Nccl => write!(f, "nccl"),
        }
    }
}

pub enum Communicator {
    None,
    #[cfg(feature = "nccl")]
    Nccl(NcclCommunicator),
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Communicator::None => write!(f, "None"),
            #[cfg(feature = "nccl")]
            Communicator::Nccl(comm) => write!(f, "Nccl(rank {})", comm.rank()),
        }
    }
}

/// Membership of a formed collective group.
pub trait ProcessGroup {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    /// Returns once every rank of the group has entered the barrier.
    fn barrier(&mut self) -> Result<(), CoordinationError>;
}

#[derive(Debug, Clone, Copy)]
pub struct GroupOptions {
    pub backend: Backend,
    pub timeout: Duration,
    /// Accelerator the communicator lives on.
    pub device_ordinal: usize,
}

enum Links {
    Root(Vec<(usize, Connection)>),
    Peer(Connection),
}

pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    timeout: Duration,
    links: Links,
    communicator: Communicator,
}

impl fmt::Debug for TcpProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("communicator", &self.communicator)
            .finish()
    }
}

impl TcpProcessGroup {
    /// Forms the group as rank 0, accepting peers on an already bound listener.
    pub fn host(
        listener: TcpListener,
        world_size: usize,
        options: &GroupOptions,
    ) -> Result<Self, CoordinationError> {
        let nccl_id = match options.backend {
            Backend::Nccl => Some(new_nccl_id()?),
            Backend::Tcp => None,
        };
        let peers = rendezvous::host(listener, world_size, options.timeout, nccl_id.clone())?;
        let communicator = build_communicator(options, 0, world_size, nccl_id)?;
        Ok(Self {
            rank: 0,
            world_size,
            timeout: options.timeout,
            links: Links::Root(peers),
            communicator,
        })
    }

    /// Joins the group hosted at `addr` as a non-zero rank.
    pub fn join(
        addr: &str,
        rank: usize,
        world_size: usize,
        options: &GroupOptions,
    ) -> Result<Self, CoordinationError> {
        let (root, nccl_id) = rendezvous::join(addr, rank, world_size, options.timeout)?;
        let communicator = build_communicator(options, rank, world_size, nccl_id)?;
        Ok(Self {
            rank,
            world_size,
            timeout: options.timeout,
            links: Links::Peer(root),
            communicator,
        })
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }
}

impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&mut self) -> Result<(), CoordinationError> {
        let deadline = deadline_after(self.timeout);
        match &mut self.links {
            Links::Root(peers) => {
                for (rank, conn) in peers.iter_mut() {
                    match conn.recv(deadline, "barrier")? {
                        Message::Ready { rank: ready } if ready == *rank => {}
                        other => {
                            return Err(CoordinationError::Protocol(format!(
                                "expected ready from rank {rank}, got {other:?}"
                            )))
                        }
                    }
                }
                for (_, conn) in peers.iter_mut() {
                    conn.send(&Message::Go)?;
                }
            }
            Links::Peer(root) => {
                root.send(&Message::Ready { rank: self.rank })?;
                match root.recv(deadline, "barrier")? {
                    Message::Go => {}
                    other => {
                        return Err(CoordinationError::Protocol(format!(
                            "expected go, got {other:?}"
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(feature = "nccl")]
fn new_nccl_id() -> Result<Vec<u8>, CoordinationError> {
    NcclCommunicator::unique_id()
}

#[cfg(not(feature = "nccl"))]
fn new_nccl_id() -> Result<Vec<u8>, CoordinationError> {
    Err(CoordinationError::BackendUnavailable("nccl"))
}

#[allow(unused_variables)]
fn build_communicator(
    options: &GroupOptions,
    rank: usize,
    world_size: usize,
    nccl_id: Option<Vec<u8>>,
) -> Result<Communicator, CoordinationError> {
    match (options.backend, nccl_id) {
        (Backend::Tcp, _) => Ok(Communicator::None),
        #[cfg(feature = "nccl")]
        (Backend::Nccl, Some(id)) => Ok(Communicator::Nccl(NcclCommunicator::new(
            options.device_ordinal,
            rank,
            world_size,
            &id,
        )?)),
        #[cfg(not(feature = "nccl"))]
        (Backend::Nccl, Some(_)) => Err(CoordinationError::BackendUnavailable("nccl")),
        (Backend::Nccl, None) => Err(CoordinationError::Protocol(
            "rank 0 did not share an NCCL id".to_owned(),
        )),
    }
}

/// Joins the collective group described by the launch environment.
///
/// Rank 0 listens on the rendezvous address; every other rank connects to it.
/// Blocks until the whole world has arrived or the rendezvous timeout passes.
pub fn init_process_group(
    topology: &RunTopology,
    rendezvous: &RendezvousConfig,
    backend: Backend,
) -> Result<TcpProcessGroup, CoordinationError> {
    let RunTopology {
        rank,
        world_size,
        local_device_index,
        ..
    } = *topology;
    if rank >= world_size {
        return Err(CoordinationError::RankOutOfRange { rank, world_size });
    }
    if backend == Backend::Tcp && cfg!(feature = "nccl") {
        warn!("Using the TCP backend although NCCL is available");
    } else if backend == Backend::Tcp {
        warn!("Built without NCCL, collectives will only use the TCP rendezvous links");
    }

    let options = GroupOptions {
        backend,
        timeout: rendezvous.timeout,
        device_ordinal: local_device_index,
    };
    let addr = rendezvous.address();
    info!(rank, world_size, %backend, addr, "Joining process group");
    let group = if rank == 0 {
        let listener =
            TcpListener::bind(&addr).map_err(|source| CoordinationError::Bind {
                addr: addr.clone(),
                source,
            })?;
        TcpProcessGroup::host(listener, world_size, &options)?
    } else {
        TcpProcessGroup::join(&addr, rank, world_size, &options)?
    };
    info!(rank, world_size, "Joined process group");
    Ok(group)
}
