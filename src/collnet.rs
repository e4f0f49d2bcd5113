//! Collective-network negotiation: per-node master election, the
//! receive-before-send handshake between paired masters, and the final
//! all-or-nothing consensus. Setup failures here are never hard errors;
//! they degrade the whole group to point-to-point transports.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::bootstrap::BootstrapSession;
use crate::comm::PeerInfo;
use crate::error::CommError;
use crate::graph::{GraphPattern, NodeAssignment};
use crate::transport::channel::{CollTreePattern, CommChannel, ConnType};
use crate::transport::collnet::COLLNET_TRANSPORTER;
use crate::transport::connector::{ConnectHandle, CONNECT_HANDLE_SIZE};
use crate::transport::COLLNET_GRAPH_TAG;

/// Bootstrap tag for the paired master handshake of one channel pair.
/// Disjoint from the p2p exchange tags, whose low byte is a p2p graph tag.
fn handshake_tag(pair: usize) -> u32 {
    ((pair as u32) << 16) | COLLNET_GRAPH_TAG as u32
}

/// One rank's slot in the receive-direction AllGather. Fixed shape, equal
/// bincode size on every rank.
#[derive(Clone, Copy, Serialize, Deserialize)]
struct MasterRecord {
    is_master: u8,
    #[serde(with = "BigArray")]
    blob: [u8; CONNECT_HANDLE_SIZE],
}

/// Handshake from a receive-side master to its paired send-side master:
/// the dense collnet-local index plus the consolidated connect blob.
#[derive(Clone, Copy, Serialize, Deserialize)]
struct MasterHandshake {
    collnet_rank: u64,
    #[serde(with = "BigArray")]
    blob: [u8; CONNECT_HANDLE_SIZE],
}

/// Per-node master pair, chosen from the collnet graph's intra-node rank
/// ordering: receive master is the node's first rank; the send master is
/// the second unless the node settled on a plain tree.
pub(crate) fn node_masters(nodes: &NodeAssignment, node: usize) -> (usize, usize) {
    let members: Vec<usize> = nodes
        .node_of_rank
        .iter()
        .enumerate()
        .filter(|&(_, &n)| n == node)
        .map(|(r, _)| r)
        .collect();
    let recv_master = members[0];
    let send_index = if nodes.tree_patterns[node] == GraphPattern::Tree {
        0
    } else {
        1
    };
    let send_master = members[send_index % members.len()];
    (send_master, recv_master)
}

/// Compact the gathered records in rank order into the dense master list.
/// Every rank runs this over identical data, so the indices agree.
fn compact_masters(gathered: &[MasterRecord]) -> (Vec<usize>, Vec<ConnectHandle>) {
    let mut masters = Vec::new();
    let mut blobs = Vec::new();
    for (r, record) in gathered.iter().enumerate() {
        if record.is_master != 0 {
            masters.push(r);
            blobs.push(ConnectHandle(record.blob));
        }
    }
    (masters, blobs)
}

async fn all_gather_records(
    session: &BootstrapSession,
    record: &MasterRecord,
) -> Result<Vec<MasterRecord>, CommError> {
    let encoded = bincode::serialize(record)
        .map_err(|e| CommError::Internal(format!("collnet record encode: {}", e)))?;
    let size = encoded.len();
    let gathered = session.all_gather(&encoded).await?;
    (0..session.num_ranks())
        .map(|i| {
            bincode::deserialize(&gathered[i * size..(i + 1) * size])
                .map_err(|e| CommError::Internal(format!("collnet record decode: {}", e)))
        })
        .collect()
}

/// Set up one channel in one direction. Returns false when this rank's
/// master work failed; the failure stays local until consensus.
async fn setup_channel(
    session: &BootstrapSession,
    channel: &mut CommChannel,
    pair: usize,
    conn_type: ConnType,
    master_rank: usize,
    master_peer: usize,
    my_info: &PeerInfo,
) -> Result<bool, CommError> {
    let rank = session.rank();
    let num_ranks = session.num_ranks();
    let is_master = rank == master_rank;
    let mut ok = true;

    // Only the master probes against the virtual root; everyone else
    // assumes success.
    if is_master {
        ok = COLLNET_TRANSPORTER.can_connect(my_info);
        if !ok {
            log::warn!(
                "rank {}: collnet probe failed on channel {} ({:?})",
                rank,
                channel.id,
                conn_type
            );
        }
    }

    // Receive-before-send: the send-side master cannot proceed until its
    // paired receive-side master has finished and forwarded its state.
    let mut received: Option<MasterHandshake> = None;
    if is_master && conn_type == ConnType::Send {
        let mut buf = [0u8; 8 + CONNECT_HANDLE_SIZE];
        session
            .recv(master_peer, handshake_tag(pair), &mut buf)
            .await?;
        let handshake: MasterHandshake = bincode::deserialize(&buf)
            .map_err(|e| CommError::Internal(format!("collnet handshake decode: {}", e)))?;
        received = Some(handshake);
    }

    let mut my_blob = ConnectHandle([0u8; CONNECT_HANDLE_SIZE]);
    if is_master && ok {
        match COLLNET_TRANSPORTER.setup(channel.id, conn_type, my_info) {
            Ok(blob) => my_blob = blob,
            Err(e) => {
                log::warn!("rank {}: collnet setup failed: {}", rank, e);
                ok = false;
            }
        }
    }

    let (collnet_rank, master_blobs) = match conn_type {
        ConnType::Recv => {
            // Every rank participates so the dense index derivation sees
            // identical data everywhere.
            let record = MasterRecord {
                is_master: is_master as u8,
                blob: my_blob.0,
            };
            let gathered = all_gather_records(session, &record).await?;
            let (masters, blobs) = compact_masters(&gathered);
            let index = masters.iter().position(|&m| m == master_rank);
            (index, blobs)
        }
        ConnType::Send => {
            // Index and blob arrived in the handshake; no second gather.
            match &received {
                Some(handshake) => {
                    let index = handshake.collnet_rank as usize;
                    let mut blobs =
                        vec![ConnectHandle([0u8; CONNECT_HANDLE_SIZE]); index + 1];
                    blobs[index] = ConnectHandle(handshake.blob);
                    (Some(index), blobs)
                }
                None => (None, Vec::new()),
            }
        }
    };

    if is_master && ok {
        match collnet_rank {
            Some(index) => match COLLNET_TRANSPORTER.connect(&master_blobs, index) {
                Ok(resources) => {
                    channel.coll_tree = Some(CollTreePattern {
                        up: num_ranks,
                        down: None,
                        index,
                    });
                    channel.coll_resources = Some(resources);
                }
                Err(e) => {
                    log::warn!("rank {}: collnet connect failed: {}", rank, e);
                    ok = false;
                }
            },
            None => ok = false,
        }
    }

    // Receive-side master forwards its consolidated state to the paired
    // send-side master, unblocking the send direction.
    if is_master && conn_type == ConnType::Recv {
        let handshake = MasterHandshake {
            collnet_rank: collnet_rank.unwrap_or(0) as u64,
            blob: collnet_rank.map_or([0u8; CONNECT_HANDLE_SIZE], |i| master_blobs[i].0),
        };
        let encoded = bincode::serialize(&handshake)
            .map_err(|e| CommError::Internal(format!("collnet handshake encode: {}", e)))?;
        session
            .send(master_peer, handshake_tag(pair), &encoded)
            .await?;
    }

    Ok(ok)
}

/// Release whatever collnet state this rank holds. Symmetric: runs on every
/// rank on fallback, regardless of where the failure originated.
fn release_all(channels: &mut [CommChannel]) {
    for channel in channels.iter_mut() {
        channel.coll_tree = None;
        if let Some(resources) = channel.coll_resources.take() {
            if let Err(e) = COLLNET_TRANSPORTER.free(resources) {
                log::warn!("collnet resource release failed: {}", e);
            }
        }
    }
}

/// Run the full negotiation: recv then send per logical channel pair, then
/// the all-or-nothing consensus. Returns the group-wide support decision.
pub(crate) async fn negotiate(
    session: &BootstrapSession,
    channels: &mut [CommChannel],
    nodes: &NodeAssignment,
    peers_info: &[PeerInfo],
) -> Result<bool, CommError> {
    let rank = session.rank();
    let my_info = &peers_info[rank];
    let my_node = nodes.my_node;
    let (send_master, recv_master) = node_masters(nodes, my_node);

    let logic_channels = channels.len() / 2;
    let mut failed = false;
    for c in 0..logic_channels {
        // Recv lives on the upper half of the channel list, send on the
        // lower; the handshake chains them per pair.
        let (send_half, recv_half) = channels.split_at_mut(logic_channels);
        let ok_recv = setup_channel(
            session,
            &mut recv_half[c],
            c,
            ConnType::Recv,
            recv_master,
            send_master,
            my_info,
        )
        .await?;
        let ok_send = setup_channel(
            session,
            &mut send_half[c],
            c,
            ConnType::Send,
            send_master,
            recv_master,
            my_info,
        )
        .await?;
        if !ok_recv || !ok_send {
            failed = true;
        }
    }

    // Consensus: one flag per rank. Any failure anywhere disables collnet
    // everywhere and releases all partial state.
    let flag = [failed as u8];
    let gathered = session.all_gather(&flag).await?;
    let any_failed = gathered.iter().any(|&f| f != 0);
    if any_failed {
        if rank == 0 {
            log::warn!("cannot initialize collnet, falling back to point-to-point transports");
        }
        release_all(channels);
        return Ok(false);
    }
    log::info!("rank {}: collnet enabled group-wide", rank);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{create_group_root, root_service};
    use crate::graph::GraphPattern;
    use crate::rendezvous::tests::peer;
    use crate::transport::channel::{ChannelId, RingPattern, TreePattern};
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn init_sessions(num_ranks: usize) -> Vec<Arc<BootstrapSession>> {
        let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (socket, id) = create_group_root(&listen_addr).unwrap();
        let magic = id.magic;
        std::thread::spawn(move || {
            smol::block_on(root_service(socket, magic)).unwrap();
        });
        let handles: Vec<_> = (0..num_ranks)
            .map(|rank| {
                std::thread::spawn(move || {
                    let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
                    smol::block_on(BootstrapSession::init(&id, listen_addr, rank, num_ranks))
                        .map(Arc::new)
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn two_node_assignment() -> NodeAssignment {
        NodeAssignment {
            my_node: 0,
            num_nodes: 2,
            first_ranks: vec![0, 2],
            tree_patterns: vec![GraphPattern::BalancedTree; 2],
            node_of_rank: vec![0, 0, 1, 1],
        }
    }

    fn make_channels(rank: usize, num_ranks: usize, n: usize) -> Vec<CommChannel> {
        let order: Vec<usize> = (0..num_ranks).collect();
        (0..n)
            .map(|c| CommChannel {
                id: ChannelId(c as u32),
                peers: HashMap::new(),
                ring: RingPattern::from_order(rank, &order),
                tree: TreePattern {
                    parent: None,
                    children: [None; 3],
                },
                coll_tree: None,
                coll_resources: None,
            })
            .collect()
    }

    #[test]
    fn master_selection_follows_node_pattern() {
        let mut nodes = two_node_assignment();
        // Balanced tree: send master is the node's second rank.
        assert_eq!(node_masters(&nodes, 0), (1, 0));
        assert_eq!(node_masters(&nodes, 1), (3, 2));
        // Plain tree: both roles land on the first rank.
        nodes.tree_patterns = vec![GraphPattern::Tree; 2];
        assert_eq!(node_masters(&nodes, 0), (0, 0));
    }

    #[test]
    fn compaction_is_dense_and_rank_ordered() {
        let blob = [0u8; CONNECT_HANDLE_SIZE];
        let gathered: Vec<MasterRecord> = [0u8, 1, 0, 1, 1]
            .iter()
            .map(|&m| MasterRecord {
                is_master: m,
                blob,
            })
            .collect();
        let (masters, blobs) = compact_masters(&gathered);
        assert_eq!(masters, vec![1, 3, 4]);
        assert_eq!(blobs.len(), 3);
    }

    fn run_negotiation(gdr: [bool; 4]) -> Vec<(bool, Vec<CommChannel>)> {
        let num_ranks = 4;
        let sessions = init_sessions(num_ranks);
        let peers_info: Vec<_> = (0..num_ranks)
            .map(|r| {
                let host = if r < 2 { 0xa } else { 0xb };
                let mut info = peer(r, host, r as u64, 0x10 + r as u64, 90);
                info.gdr_support = gdr[r];
                info
            })
            .collect();

        let handles: Vec<_> = sessions
            .into_iter()
            .enumerate()
            .map(|(rank, session)| {
                let peers_info = peers_info.clone();
                std::thread::spawn(move || {
                    let mut nodes = two_node_assignment();
                    nodes.my_node = if rank < 2 { 0 } else { 1 };
                    let mut channels = make_channels(rank, num_ranks, 2);
                    let support = smol::block_on(negotiate(
                        &session,
                        &mut channels,
                        &nodes,
                        &peers_info,
                    ))
                    .unwrap();
                    (support, channels)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn all_masters_capable_enables_collnet_everywhere() {
        let results = run_negotiation([true; 4]);
        for (support, channels) in &results {
            assert!(*support);
            // Exactly the master channels carry collnet state; no channel
            // carries a pattern without resources.
            for channel in channels {
                assert_eq!(channel.coll_tree.is_some(), channel.coll_resources.is_some());
            }
        }
        // Recv masters are ranks 0 and 2 (first of each node); they hold
        // state on the recv channel (upper half).
        let (_, channels0) = &results[0];
        assert!(channels0[1].coll_resources.is_some());
    }

    #[test]
    fn one_incapable_master_disables_collnet_on_every_rank() {
        // Rank 2 is the recv master of node 1 and cannot connect.
        let mut gdr = [true; 4];
        gdr[2] = false;
        let results = run_negotiation(gdr);
        for (support, channels) in &results {
            assert!(!*support);
            for channel in channels {
                assert!(channel.coll_tree.is_none());
                assert!(channel.coll_resources.is_none());
            }
        }
    }
}
