//! Communicator initialization: the per-rank negotiation sequence. One
//! coordinating thread per rank drives every phase in order; ranks
//! synchronize only at the collective points (AllGathers, paired
//! send/recv, the intra-process barrier).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::Arc;

use crate::bootstrap::{BootstrapSession, GroupId};
use crate::collnet;
use crate::comm::{
    profile::CommProfile, Communicator, CommunicatorId, DeviceSpec, MAX_CHANNELS,
};
use crate::config::CommConfig;
use crate::error::{CommError, ErrorCode};
use crate::graph::{assign_nodes, reconcile, GraphExchange, GraphInfo, GraphPattern, LinkType};
use crate::launch;
use crate::rendezvous;
use crate::topo::{default_tree_shape, PatternConstraints, TopologyService};
use crate::transport::channel::{
    ChannelId, CommChannel, ConnType, PeerConnId, PeerConnector, RingPattern, TreePattern,
};
use crate::transport::collnet::COLLNET_TRANSPORTER;
use crate::transport::setup::TransportConnectState;
use crate::transport::{RING_GRAPH_TAG, TREE_GRAPH_TAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommInitStage {
    Allocated,
    TopologyBuilt,
    GraphsReconciled,
    ChannelsConnected,
    Ready,
}

fn advance(stage: &mut CommInitStage, next: CommInitStage, rank: usize) {
    log::trace!("rank {}: {:?} -> {:?}", rank, *stage, next);
    *stage = next;
}

/// Collective-network negotiation runs only when the group spans more than
/// one node, the option is on, and the reconciled collnet graph kept at
/// least one channel.
pub(crate) fn collnet_gate(num_nodes: usize, enable: bool, collnet_channels: usize) -> bool {
    num_nodes > 1 && enable && collnet_channels > 0
}

fn comm_hash(id: &GroupId) -> u64 {
    let mut hasher = DefaultHasher::new();
    (id.addr, id.magic).hash(&mut hasher);
    hasher.finish()
}

/// Register one edge unless an earlier phase already connected it (a tree
/// edge can coincide with a ring edge). Both endpoints derive the skip from
/// the same reconciled structures, so registration stays symmetric.
fn register_edge(
    state: &mut TransportConnectState,
    channels: &[CommChannel],
    channel_idx: usize,
    peer: usize,
    conn_type: ConnType,
) -> Result<(), CommError> {
    let already = channels[channel_idx]
        .peers
        .get(&peer)
        .map_or(false, |pc| match conn_type {
            ConnType::Send => pc.send[0].is_some(),
            ConnType::Recv => pc.recv[0].is_some(),
        });
    if !already {
        state.register_connect(&PeerConnId {
            peer_rank: peer,
            channel: ChannelId(channel_idx as u32),
            conn_index: 0,
            conn_type,
        })?;
    }
    Ok(())
}

fn store_connected(
    channels: &mut [CommChannel],
    connected: std::collections::HashMap<PeerConnId, PeerConnector>,
) {
    for (conn_id, connector) in connected {
        let entry = channels[conn_id.channel.0 as usize]
            .peers
            .entry(conn_id.peer_rank)
            .or_default();
        let slot = conn_id.conn_index as usize;
        match conn_id.conn_type {
            ConnType::Send => entry.send[slot] = Some(connector),
            ConnType::Recv => entry.recv[slot] = Some(connector),
        }
    }
}

/// Blocking entry point: validates arguments, then drives the async
/// negotiation to completion on the calling thread.
///
/// Failure fencing is the caller's responsibility: if only some ranks
/// detect a local error mid-negotiation, the survivors may block on the
/// next collective step until an external supervisor tears the group down.
pub(crate) fn init_rank_sync<S: TopologyService>(
    service: &S,
    id: &GroupId,
    num_ranks: usize,
    rank: usize,
    dev: DeviceSpec,
    config: &CommConfig,
) -> Result<Communicator, CommError> {
    if num_ranks < 1 {
        return Err(CommError::Config(format!("invalid group size {}", num_ranks)));
    }
    if rank >= num_ranks {
        return Err(CommError::Config(format!(
            "rank {} out of range for group size {}",
            rank, num_ranks
        )));
    }
    if dev.device_index < 0 {
        return Err(CommError::Config(format!(
            "invalid device index {}",
            dev.device_index
        )));
    }
    smol::block_on(init_rank_inner(service, id, num_ranks, rank, dev, config))
}

async fn init_rank_inner<S: TopologyService>(
    service: &S,
    id: &GroupId,
    num_ranks: usize,
    rank: usize,
    dev: DeviceSpec,
    config: &CommConfig,
) -> Result<Communicator, CommError> {
    let mut stage = CommInitStage::Allocated;
    let comm_id = CommunicatorId(comm_hash(id));
    let profile = CommProfile::compute(config);

    // Phase 1: bootstrap + peer discovery.
    let listen_addr = SocketAddr::new(id.addr.ip(), 0);
    let session = BootstrapSession::init(id, listen_addr, rank, num_ranks).await?;
    let my_info = rendezvous::fill_peer_info(rank, comm_id.0, &dev);
    let peers_info = rendezvous::exchange_peer_info(&session, &my_info).await?;
    let summary = rendezvous::summarize(rank, &peers_info)?;

    // Phase 2: topology + local graph search.
    let mut topo = service.build_system(&peers_info).map_err(CommError::Topology)?;
    service
        .compute_paths(&mut topo, &peers_info)
        .map_err(CommError::Topology)?;
    service
        .trim_unreachable(&mut topo, rank)
        .map_err(CommError::Topology)?;
    advance(&mut stage, CommInitStage::TopologyBuilt, rank);

    let mut ring_graph = service
        .compute_graph(
            &topo,
            &PatternConstraints {
                pattern: GraphPattern::Ring,
                min_channels: 1,
                max_channels: MAX_CHANNELS / 2,
                collnet: false,
                cross_nic: config.cross_nic,
                host_count: summary.host_count,
            },
        )
        .map_err(CommError::Topology)?;
    let tree_min = if ring_graph.type_inter == LinkType::Net {
        1
    } else {
        ring_graph.n_channels
    };
    let mut tree_graph = service
        .compute_graph(
            &topo,
            &PatternConstraints {
                pattern: default_tree_shape(summary.host_count),
                min_channels: tree_min,
                max_channels: ring_graph.n_channels,
                collnet: false,
                cross_nic: config.cross_nic,
                host_count: summary.host_count,
            },
        )
        .map_err(CommError::Topology)?;
    let mut collnet_graph = service
        .compute_graph(
            &topo,
            &PatternConstraints {
                pattern: GraphPattern::CollNetTree,
                min_channels: ring_graph.n_channels,
                max_channels: ring_graph.n_channels,
                collnet: true,
                cross_nic: config.cross_nic,
                host_count: summary.host_count,
            },
        )
        .map_err(CommError::Topology)?;

    if rank == config.graph_dump_rank {
        log::info!(
            "graphs for group {:?}: ring {:?}, tree {:?}, collnet {:?}",
            comm_id,
            ring_graph,
            tree_graph,
            collnet_graph
        );
    }

    // Phase 3: second AllGather + reconciliation.
    let n_channels_local = ring_graph.n_channels;
    let roles = service
        .preset_roles(&topo, rank, n_channels_local, &ring_graph)
        .map_err(CommError::Topology)?;
    let exchange = GraphExchange {
        comp_cap: dev.comp_cap,
        n_channels: n_channels_local as u32,
        ring: GraphInfo::from(&ring_graph),
        tree: GraphInfo::from(&tree_graph),
        collnet: GraphInfo::from(&collnet_graph),
        roles,
    };
    let encoded = bincode::serialize(&exchange)
        .map_err(|e| CommError::Internal(format!("graph record encode: {}", e)))?;
    let size = encoded.len();
    let gathered = session.all_gather(&encoded).await?;
    let all: Vec<GraphExchange> = (0..num_ranks)
        .map(|i| {
            bincode::deserialize(&gathered[i * size..(i + 1) * size])
                .map_err(|e| CommError::Internal(format!("graph record decode: {}", e)))
        })
        .collect::<Result<_, _>>()?;

    let n_channels = reconcile(
        n_channels_local,
        &mut ring_graph,
        &mut tree_graph,
        &mut collnet_graph,
        &all,
    );
    let nodes = assign_nodes(rank, &all);
    advance(&mut stage, CommInitStage::GraphsReconciled, rank);
    log::trace!(
        "rank {}: {} channels, node {} of {}",
        rank,
        n_channels,
        nodes.my_node,
        nodes.num_nodes
    );

    // Phase 4: channel assembly + point-to-point connect.
    let channel_roles = service
        .postset_channels(&topo, rank, n_channels, &nodes, &all)
        .map_err(CommError::Topology)?;
    let mut channels: Vec<CommChannel> = channel_roles
        .into_iter()
        .enumerate()
        .map(|(c, roles)| CommChannel {
            id: ChannelId(c as u32),
            peers: std::collections::HashMap::new(),
            ring: RingPattern::from_order(rank, &roles.ring_order),
            tree: TreePattern {
                parent: roles.tree.parent,
                children: roles.tree.children,
            },
            coll_tree: None,
            coll_resources: None,
        })
        .collect();

    if num_ranks > 1 {
        let mut state = TransportConnectState::new(rank, num_ranks, n_channels);
        // Ring edges: one predecessor, one successor per channel.
        for c in 0..n_channels {
            register_edge(&mut state, &channels, c, channels[c].ring.prev, ConnType::Recv)?;
            register_edge(&mut state, &channels, c, channels[c].ring.next, ConnType::Send)?;
        }
        let connected = state
            .connect_peers(&session, &peers_info, &profile, RING_GRAPH_TAG)
            .await?;
        store_connected(&mut channels, connected);
        log::info!("rank {}: connected all rings", rank);

        // Tree edges: parent and children, connected bidirectionally.
        for c in 0..n_channels {
            let parent = channels[c].tree.parent;
            let children = channels[c].tree.children;
            if let Some(parent) = parent {
                register_edge(&mut state, &channels, c, parent, ConnType::Send)?;
                register_edge(&mut state, &channels, c, parent, ConnType::Recv)?;
            }
            for child in children.iter().flatten() {
                register_edge(&mut state, &channels, c, *child, ConnType::Send)?;
                register_edge(&mut state, &channels, c, *child, ConnType::Recv)?;
            }
        }
        let connected = state
            .connect_peers(&session, &peers_info, &profile, TREE_GRAPH_TAG)
            .await?;
        store_connected(&mut channels, connected);
        log::info!("rank {}: connected all trees", rank);
    }
    advance(&mut stage, CommInitStage::ChannelsConnected, rank);

    // Phase 5: optional collective-network negotiation, all-or-nothing.
    let mut collnet_support = false;
    if collnet_gate(nodes.num_nodes, config.collnet_enable, collnet_graph.n_channels) {
        collnet_support =
            collnet::negotiate(&session, &mut channels, &nodes, &peers_info).await?;
    }

    // Phase 6: intra-process launch coordination.
    let (intra, launch_mode, group_stream) = launch::setup_intra_process(
        comm_id,
        summary.intra_rank,
        summary.intra_ranks,
        summary.intra_rank0,
        &dev,
        config,
    );

    advance(&mut stage, CommInitStage::Ready, rank);
    log::info!(
        "rank {} of {} ready: {} channels, collnet {}, {:?} launch",
        rank,
        num_ranks,
        n_channels,
        collnet_support,
        launch_mode
    );
    Ok(Communicator {
        id: comm_id,
        rank,
        num_ranks,
        node: nodes.my_node,
        num_nodes: nodes.num_nodes,
        device_index: dev.device_index,
        bus_id: dev.bus_id,
        peers_info,
        channels,
        topo: Some(Box::new(topo)),
        profile,
        bootstrap: Some(session),
        collnet_support,
        abort_flag: Arc::new(AtomicBool::new(false)),
        fatal_error: Arc::new(AtomicU32::new(ErrorCode::Success as u32)),
        launch_mode,
        group_stream,
        intra: Some(intra),
    })
}

/// Ordered synchronous teardown. Destroying an already-destroyed
/// communicator returns a usage error and performs no additional frees.
pub(crate) fn destroy(comm: &mut Communicator) -> Result<(), CommError> {
    if comm.is_poisoned() {
        return Err(CommError::Usage("communicator already destroyed"));
    }
    // Signal background work first; fencing outstanding device work is the
    // runtime layer's job before it calls in here.
    comm.set_abort();

    for mut channel in comm.channels.drain(..) {
        if let Some(resources) = channel.coll_resources.take() {
            if let Err(e) = COLLNET_TRANSPORTER.free(resources) {
                log::warn!("collnet resource release failed: {}", e);
            }
        }
        for (_, peer_conn) in channel.peers.drain() {
            for connector in peer_conn
                .send
                .into_iter()
                .chain(peer_conn.recv)
                .flatten()
            {
                if let Err(e) = connector.transporter.free(connector.resources) {
                    log::warn!("transport resource release failed: {}", e);
                }
            }
        }
    }
    comm.topo = None;
    if let Some(session) = comm.bootstrap.take() {
        session.close();
    }
    comm.group_stream = None;
    if let Some(intra) = comm.intra.take() {
        intra.detach();
    }
    comm.poison();
    Ok(())
}

/// Raise the abort flag. Advisory only: never blocks, never frees, and the
/// negotiation protocol does not poll it mid-round, so aborting during an
/// active bootstrap exchange risks a hang on other ranks.
pub(crate) fn abort(comm: &Communicator) -> Result<(), CommError> {
    if comm.is_poisoned() {
        return Err(CommError::Usage("communicator already destroyed"));
    }
    comm.set_abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{create_group_root, root_service};
    use crate::topo::FlatTopology;

    fn spawn_root() -> GroupId {
        let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (socket, id) = create_group_root(&listen_addr).unwrap();
        let magic = id.magic;
        std::thread::spawn(move || {
            smol::block_on(root_service(socket, magic)).unwrap();
        });
        id
    }

    fn dev(index: i32, bus_id: u64) -> DeviceSpec {
        DeviceSpec {
            device_index: index,
            bus_id,
            comp_cap: 90,
            cooperative_launch: true,
            gdr_support: false,
        }
    }

    fn init_group(num_ranks: usize, devs: Vec<DeviceSpec>) -> Vec<Result<Communicator, CommError>> {
        let id = spawn_root();
        let handles: Vec<_> = devs
            .into_iter()
            .enumerate()
            .map(|(rank, d)| {
                std::thread::spawn(move || {
                    init_rank_sync(&FlatTopology, &id, num_ranks, rank, d, &CommConfig::default())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn four_ranks_single_host_end_to_end() {
        let results = init_group(4, (0..4).map(|i| dev(i, 0x10 + i as u64)).collect());
        let mut comms: Vec<Communicator> = results.into_iter().map(|r| r.unwrap()).collect();

        let n_channels = comms[0].num_channels();
        assert!(n_channels > 0);
        let mut ring_edges: Option<Vec<(usize, usize)>> = None;
        for (rank, comm) in comms.iter().enumerate() {
            assert_eq!(comm.rank(), rank);
            assert_eq!(comm.size(), 4);
            // Single host: one node, no collnet, plain launch group.
            assert_eq!(comm.num_nodes(), 1);
            assert_eq!(comm.node(), 0);
            assert!(!comm.collnet_support());
            assert_eq!(comm.num_channels(), n_channels);
            assert_eq!(comm.launch_mode(), crate::launch::LaunchMode::Group);

            // Every rank sees the same cyclic order (rotation property).
            let ring = &comm.channels()[0].ring;
            let mut edges: Vec<(usize, usize)> = ring
                .user_ranks
                .iter()
                .zip(ring.user_ranks.iter().cycle().skip(1))
                .map(|(&a, &b)| (a, b))
                .collect();
            edges.sort_unstable();
            match &ring_edges {
                None => ring_edges = Some(edges),
                Some(expected) => assert_eq!(&edges, expected),
            }
        }

        // Abort only raises the flag.
        abort(&comms[1]).unwrap();
        assert!(comms[1].abort_requested());

        for comm in comms.iter_mut() {
            destroy(comm).unwrap();
        }
        // Second destroy is a usage error, with no further side effects.
        match destroy(&mut comms[0]) {
            Err(CommError::Usage(_)) => {}
            other => panic!("expected usage error, got {:?}", other),
        }
        assert_eq!(
            CommError::Usage("x").code(),
            crate::error::ErrorCode::InvalidUsage
        );
    }

    #[test]
    fn duplicate_device_fails_every_rank() {
        // Ranks 0 and 2 claim the same bus id on the same host.
        let results = init_group(3, vec![dev(0, 0xaa), dev(1, 0xbb), dev(2, 0xaa)]);
        for result in results {
            match result {
                Err(CommError::DuplicateDevice(lo, hi, bus)) => {
                    assert_eq!((lo, hi, bus), (0, 2, 0xaa));
                }
                other => panic!("expected DuplicateDevice, got {:?}", other.err()),
            }
        }
    }

    #[test]
    fn invalid_arguments_fail_before_any_network_activity() {
        let id = GroupId {
            // Nothing listens here; a config error must surface first.
            addr: "127.0.0.1:1".parse().unwrap(),
            magic: 0,
        };
        let config = CommConfig::default();
        assert!(matches!(
            init_rank_sync(&FlatTopology, &id, 0, 0, dev(0, 0x1), &config),
            Err(CommError::Config(_))
        ));
        assert!(matches!(
            init_rank_sync(&FlatTopology, &id, 2, 2, dev(0, 0x1), &config),
            Err(CommError::Config(_))
        ));
        assert!(matches!(
            init_rank_sync(&FlatTopology, &id, 2, 0, dev(-1, 0x1), &config),
            Err(CommError::Config(_))
        ));
    }

    #[test]
    fn collnet_gate_conditions() {
        assert!(collnet_gate(2, true, 2));
        // Single node: skipped regardless of configuration.
        assert!(!collnet_gate(1, true, 2));
        // Disabled by configuration: skipped entirely.
        assert!(!collnet_gate(2, false, 2));
        // Reconciled away: no channels survived.
        assert!(!collnet_gate(2, true, 0));
    }
}
