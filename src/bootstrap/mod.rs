//! Bootstrap channel: the rendezvous and exchange primitive available
//! before any data-path transport exists. A detached root service collects
//! one check-in per rank and wires the ranks into a TCP ring; the ring then
//! carries AllGathers, and tagged out-of-band connections carry paired
//! send/recv.

pub mod task;

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use smol::lock::Mutex;
use smol::net::{TcpListener, TcpStream};
use thiserror::Error;

pub use task::{create_group_root, root_service};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("root received inconsistent group size {0} vs {1}")]
    GroupSizeMismatch(usize, usize),
    #[error("root received duplicate check-in from rank {0}")]
    DuplicateCheckIn(usize),
    #[error("root received out-of-range rank {0}")]
    RankOutOfRange(usize),
    #[error("received frame of {0} bytes, expected {1}")]
    FrameSizeMismatch(u32, u32),
    #[error("bootstrap session is busy: only one outstanding collective is allowed")]
    SessionBusy,
}

/// Opaque group identity created by the launcher on one process and shared
/// out-of-band with every participant. Names the root rendezvous point plus
/// a random magic word that fences off stale connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupId {
    pub addr: SocketAddr,
    pub magic: u64,
}

pub(crate) struct RingConns {
    pub(crate) send: TcpStream,
    pub(crate) recv: TcpStream,
}

pub(crate) struct PendingConn {
    pub(crate) peer: usize,
    pub(crate) tag: u32,
    pub(crate) stream: TcpStream,
}

/// Per-rank bootstrap session. All collective entry points take `&self`;
/// the ring mutex enforces the single-outstanding-collective rule.
pub struct BootstrapSession {
    pub(crate) listener: TcpListener,
    pub(crate) ring: Mutex<RingConns>,
    pub(crate) peer_addrs: Vec<SocketAddr>,
    // Tagged recv may accept a connection destined for a later recv call;
    // it is parked here until the matching call arrives.
    pub(crate) pending: Mutex<Vec<PendingConn>>,
    pub(crate) rank: usize,
    pub(crate) num_ranks: usize,
    pub(crate) magic: u64,
}

impl BootstrapSession {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    /// Tear down the session. Ring connections and the listener close when
    /// dropped; this exists so teardown order is explicit in destroy.
    pub fn close(self) {
        drop(self);
    }
}
