use std::{
    io::{self, BufRead, BufReader, Write},
    net::{SocketAddr, TcpStream},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::CoordinationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Message {
    Hello {
        rank: usize,
        world_size: usize,
    },
    Welcome {
        world_size: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nccl_id: Option<Vec<u8>>,
    },
    Reject {
        reason: String,
    },
    Ready {
        rank: usize,
    },
    Go,
}

const FAR_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `timeout` from now, capped where the clock cannot represent it.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_DEADLINE))
        .unwrap_or(now)
}

/// One newline-delimited JSON link to another process.
pub(crate) struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send(&mut self, message: &Message) -> Result<(), CoordinationError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Blocks for the next frame, giving up at `deadline`.
    pub fn recv(&mut self, deadline: Instant, what: &str) -> Result<Message, CoordinationError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let timeout = || CoordinationError::Timeout {
            what: what.to_owned(),
            after: remaining,
        };
        if remaining.is_zero() {
            return Err(timeout());
        }
        self.reader.get_ref().set_read_timeout(Some(remaining))?;

        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Err(CoordinationError::Closed),
            Ok(_) => Ok(serde_json::from_str(line.trim_end())?),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Err(timeout())
            }
            Err(err) => Err(err.into()),
        }
    }
}
