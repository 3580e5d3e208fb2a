use std::{
    io,
    net::{TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    wire::{deadline_after, Connection, Message},
    CoordinationError,
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Rank 0's side of the rendezvous: waits on `listener` until every other rank
/// of the world has said hello, then welcomes them all at once.
///
/// Returns one connection per peer, ordered by rank.
pub(crate) fn host(
    listener: TcpListener,
    world_size: usize,
    timeout: Duration,
    nccl_id: Option<Vec<u8>>,
) -> Result<Vec<(usize, Connection)>, CoordinationError> {
    let deadline = deadline_after(timeout);
    listener.set_nonblocking(true)?;

    let mut slots: Vec<Option<Connection>> = (0..world_size).map(|_| None).collect();
    let mut joined = 0;
    while joined + 1 < world_size {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(CoordinationError::Timeout {
                        what: format!(
                            "{} of {} peers to join",
                            world_size - 1 - joined,
                            world_size - 1
                        ),
                        after: timeout,
                    });
                }
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let mut conn = match stream
            .set_nonblocking(false)
            .and_then(|_| Connection::new(stream))
        {
            Ok(conn) => conn,
            Err(err) => {
                warn!(peer = %addr, %err, "Dropping rendezvous connection");
                continue;
            }
        };

        let hello_deadline = deadline.min(deadline_after(HANDSHAKE_TIMEOUT));
        let (rank, peer_world_size) = match conn.recv(hello_deadline, "peer hello") {
            Ok(Message::Hello { rank, world_size }) => (rank, world_size),
            Ok(other) => {
                warn!(peer = %addr, message = ?other, "Expected hello, dropping connection");
                continue;
            }
            Err(err) => {
                warn!(peer = %addr, %err, "No hello from connection, dropping it");
                continue;
            }
        };

        let rejection = if peer_world_size != world_size {
            Some(CoordinationError::WorldSizeMismatch {
                rank,
                expected: world_size,
                got: peer_world_size,
            })
        } else if rank == 0 || rank >= world_size {
            Some(CoordinationError::RankOutOfRange { rank, world_size })
        } else if slots[rank].is_some() {
            Some(CoordinationError::DuplicateRank(rank))
        } else {
            None
        };
        if let Some(err) = rejection {
            // best effort
            let _ = conn.send(&Message::Reject {
                reason: err.to_string(),
            });
            return Err(err);
        }

        debug!(rank, peer = %addr, "Peer joined rendezvous");
        slots[rank] = Some(conn);
        joined += 1;
    }

    let mut peers: Vec<(usize, Connection)> = slots
        .into_iter()
        .enumerate()
        .filter_map(|(rank, conn)| conn.map(|conn| (rank, conn)))
        .collect();
    for (_, conn) in peers.iter_mut() {
        conn.send(&Message::Welcome {
            world_size,
            nccl_id: nccl_id.clone(),
        })?;
    }
    info!(world_size, "All ranks joined rendezvous");
    Ok(peers)
}

fn is_retryable(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
    )
}

/// A non-zero rank's side of the rendezvous. Keeps dialing rank 0 until it
/// answers or the deadline passes.
pub(crate) fn join(
    addr: &str,
    rank: usize,
    world_size: usize,
    timeout: Duration,
) -> Result<(Connection, Option<Vec<u8>>), CoordinationError> {
    let deadline = deadline_after(timeout);
    let stream = loop {
        match TcpStream::connect(addr) {
            Ok(stream) => break stream,
            Err(err) if is_retryable(err.kind()) => {
                if Instant::now() >= deadline {
                    return Err(CoordinationError::Timeout {
                        what: format!("rank 0 at {addr}"),
                        after: timeout,
                    });
                }
                thread::sleep(CONNECT_RETRY_INTERVAL);
            }
            Err(source) => {
                return Err(CoordinationError::Connect {
                    addr: addr.to_owned(),
                    source,
                })
            }
        }
    };

    let mut conn = Connection::new(stream)?;
    debug!(rank, root = %conn.peer(), "Connected to rendezvous");
    conn.send(&Message::Hello { rank, world_size })?;
    match conn.recv(deadline, "the rest of the group")? {
        Message::Welcome {
            world_size: agreed,
            nccl_id,
        } => {
            if agreed != world_size {
                return Err(CoordinationError::WorldSizeMismatch {
                    rank,
                    expected: agreed,
                    got: world_size,
                });
            }
            Ok((conn, nccl_id))
        }
        Message::Reject { reason } => Err(CoordinationError::Rejected(reason)),
        other => Err(CoordinationError::Protocol(format!(
            "expected welcome, got {other:?}"
        ))),
    }
}
