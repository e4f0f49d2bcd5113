//! Peer discovery: the first AllGather round. Every rank publishes its
//! identity record, then each rank independently derives the same view of
//! the group: intra-node ordinals, the node representative, compute
//! capability bounds, and a coarse host-count classification that later
//! biases tree shape.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::bootstrap::BootstrapSession;
use crate::comm::{DeviceSpec, PeerInfo};
use crate::error::CommError;

/// Coarse distinct-host count. Two-host groups prefer a plain tree; larger
/// groups prefer a depth-balanced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCount {
    One,
    Two,
    ThreeOrMore,
}

#[derive(Debug, Clone)]
pub struct PeerSummary {
    /// Ordinal of this rank among ranks sharing its (host, process).
    pub intra_rank: usize,
    pub intra_ranks: usize,
    /// First-seen rank of this rank's (host, process) group.
    pub intra_rank0: usize,
    pub min_comp_cap: u32,
    pub max_comp_cap: u32,
    pub host_count: HostCount,
}

fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn host_hash() -> u64 {
    let hostname = nix::unistd::gethostname().unwrap_or_else(|_| "localhost".into());
    hash_of(&hostname)
}

fn pid_hash() -> u64 {
    // Host hash folded in so two processes with the same pid on different
    // hosts never collide.
    hash_of(&(host_hash(), std::process::id()))
}

/// Build this rank's identity record. The group hash is folded into the
/// host/process hashes so identical ranks in two different groups never
/// alias each other.
pub fn fill_peer_info(rank: usize, comm_hash: u64, dev: &DeviceSpec) -> PeerInfo {
    PeerInfo {
        rank: rank as u64,
        host_hash: host_hash().wrapping_add(comm_hash),
        pid_hash: pid_hash().wrapping_add(comm_hash),
        device_index: dev.device_index,
        bus_id: dev.bus_id,
        comp_cap: dev.comp_cap,
        gdr_support: dev.gdr_support,
        cooperative_launch: dev.cooperative_launch,
    }
}

pub async fn exchange_peer_info(
    session: &BootstrapSession,
    my_info: &PeerInfo,
) -> Result<Vec<PeerInfo>, CommError> {
    let record = bincode::serialize(my_info)
        .map_err(|e| CommError::Internal(format!("peer record encode: {}", e)))?;
    let size = record.len();
    let gathered = session.all_gather(&record).await?;
    (0..session.num_ranks())
        .map(|i| {
            bincode::deserialize(&gathered[i * size..(i + 1) * size])
                .map_err(|e| CommError::Internal(format!("peer record decode: {}", e)))
        })
        .collect()
}

/// Derive the group view from the gathered records. Pure: every rank runs
/// this over the same data and must reach the same conclusions.
pub fn summarize(rank: usize, peers: &[PeerInfo]) -> Result<PeerSummary, CommError> {
    let me = &peers[rank];

    // Duplicate-device detection scans all pairs, not just pairs involving
    // this rank: the whole group must fail together, and every rank must
    // report the identical first-in-rank-order pair.
    for i in 0..peers.len() {
        for j in (i + 1)..peers.len() {
            if peers[i].host_hash == peers[j].host_hash && peers[i].bus_id == peers[j].bus_id {
                log::warn!(
                    "duplicate device detected: rank {} and rank {} both on device {:#x}",
                    i,
                    j,
                    peers[i].bus_id
                );
                return Err(CommError::DuplicateDevice(i, j, peers[i].bus_id));
            }
        }
    }

    let mut intra_rank = None;
    let mut intra_rank0 = None;
    let mut intra_ranks = 0;
    let mut min_comp_cap = me.comp_cap;
    let mut max_comp_cap = me.comp_cap;
    let mut other_host = None;
    let mut host_count = HostCount::One;
    for (i, peer) in peers.iter().enumerate() {
        if peer.host_hash == me.host_hash {
            if peer.pid_hash == me.pid_hash {
                if intra_ranks == 0 {
                    intra_rank0 = Some(i);
                }
                if i == rank {
                    intra_rank = Some(intra_ranks);
                }
                intra_ranks += 1;
            }
        } else {
            match other_host {
                None => {
                    other_host = Some(peer.host_hash);
                    host_count = HostCount::Two;
                }
                Some(h) if h != peer.host_hash => host_count = HostCount::ThreeOrMore,
                Some(_) => {}
            }
        }
        min_comp_cap = min_comp_cap.min(peer.comp_cap);
        max_comp_cap = max_comp_cap.max(peer.comp_cap);
    }

    match (intra_rank, intra_rank0) {
        (Some(intra_rank), Some(intra_rank0)) => Ok(PeerSummary {
            intra_rank,
            intra_ranks,
            intra_rank0,
            min_comp_cap,
            max_comp_cap,
            host_count,
        }),
        _ => Err(CommError::Internal(format!(
            "rank {} not found in its own intra-process scan",
            rank
        ))),
    }
}
