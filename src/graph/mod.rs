//! Logical-graph reconciliation: the second AllGather round. Each rank
//! computes ring/tree/collnet graphs locally, publishes the resulting
//! channel count and per-graph metrics, and recomputes every field as the
//! minimum over all participants. Identical values on every rank are a
//! correctness requirement: a mismatch causes divergent role assignment
//! and silent hangs.

use serde::{Deserialize, Serialize};

use crate::comm::MAX_CHANNELS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphPattern {
    Ring,
    /// Chain-shaped tree, preferred for one- and two-host groups.
    Tree,
    /// Depth-balanced tree, preferred for three or more hosts.
    BalancedTree,
    CollNetTree,
}

/// Link classes in preference order; reconciliation takes the minimum, so
/// the group settles on the best class *every* rank can claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LinkType {
    Loopback,
    Direct,
    PciInternal,
    Pci,
    Host,
    Net,
}

/// One logical graph as computed by the topology service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TopoGraph {
    pub pattern: GraphPattern,
    pub collnet: bool,
    pub n_channels: usize,
    pub same_channels: bool,
    pub speed_intra: f32,
    pub speed_inter: f32,
    pub type_intra: LinkType,
    pub type_inter: LinkType,
}

/// Per-graph slice of the round-2 exchange record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GraphInfo {
    pub pattern: GraphPattern,
    pub same_channels: bool,
    pub speed_intra: f32,
    pub speed_inter: f32,
    pub type_intra: LinkType,
    pub type_inter: LinkType,
}

impl From<&TopoGraph> for GraphInfo {
    fn from(g: &TopoGraph) -> Self {
        GraphInfo {
            pattern: g.pattern,
            same_channels: g.same_channels,
            speed_intra: g.speed_intra,
            speed_inter: g.speed_inter,
            type_intra: g.type_intra,
            type_inter: g.type_inter,
        }
    }
}

impl TopoGraph {
    /// Fold one peer's view into this graph, field-wise minimum. Minimum is
    /// associative and commutative, so a single gather round suffices and
    /// re-merging already-reconciled values is a no-op.
    pub fn merge_min(&mut self, other: &GraphInfo) {
        self.same_channels &= other.same_channels;
        self.speed_intra = self.speed_intra.min(other.speed_intra);
        self.speed_inter = self.speed_inter.min(other.speed_inter);
        self.type_intra = self.type_intra.min(other.type_intra);
        self.type_inter = self.type_inter.min(other.type_inter);
    }
}

pub const ROLE_NONE: u32 = u32::MAX;

/// Per-rank ring roles, one slot per channel: the node's first and last
/// rank on the intra-node chain, plus this rank's chain neighbors
/// (`ROLE_NONE` at the chain ends, resolved when node rings are stitched).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerRankRoles {
    pub ring_recv: [u32; MAX_CHANNELS],
    pub ring_send: [u32; MAX_CHANNELS],
    pub ring_prev: [u32; MAX_CHANNELS],
    pub ring_next: [u32; MAX_CHANNELS],
}

impl PerRankRoles {
    pub fn empty() -> Self {
        PerRankRoles {
            ring_recv: [ROLE_NONE; MAX_CHANNELS],
            ring_send: [ROLE_NONE; MAX_CHANNELS],
            ring_prev: [ROLE_NONE; MAX_CHANNELS],
            ring_next: [ROLE_NONE; MAX_CHANNELS],
        }
    }
}

/// Round-2 exchange record. Fixed shape, so every rank's bincode encoding
/// has the same length and the ring AllGather can slice by rank.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GraphExchange {
    pub comp_cap: u32,
    pub n_channels: u32,
    pub ring: GraphInfo,
    pub tree: GraphInfo,
    pub collnet: GraphInfo,
    pub roles: PerRankRoles,
}

/// Reconcile the channel count and all three graphs against every rank's
/// published view. Returns the agreed channel count.
pub fn reconcile(
    mut n_channels: usize,
    ring: &mut TopoGraph,
    tree: &mut TopoGraph,
    collnet: &mut TopoGraph,
    all: &[GraphExchange],
) -> usize {
    for peer in all {
        n_channels = n_channels.min(peer.n_channels as usize);
        ring.merge_min(&peer.ring);
        tree.merge_min(&peer.tree);
        collnet.merge_min(&peer.collnet);
    }
    ring.n_channels = n_channels;
    tree.n_channels = n_channels;
    collnet.n_channels = n_channels;
    n_channels
}

#[derive(Debug, Clone)]
pub struct NodeAssignment {
    pub my_node: usize,
    pub num_nodes: usize,
    /// Node leader (first ring-receive rank), indexed by node id.
    pub first_ranks: Vec<usize>,
    /// Tree pattern per node; nodes may differ by device architecture.
    pub tree_patterns: Vec<GraphPattern>,
    pub node_of_rank: Vec<usize>,
}

/// Derive node ids by scanning each rank's first ring-receive rank in rank
/// order and assigning nodes in first-seen order. Pure function of the
/// gathered data, so every rank assigns identically.
pub fn assign_nodes(rank: usize, all: &[GraphExchange]) -> NodeAssignment {
    let mut first_ranks: Vec<usize> = Vec::new();
    let mut tree_patterns = Vec::new();
    let mut node_of_rank = vec![0usize; all.len()];
    let mut my_node = 0;
    for (i, peer) in all.iter().enumerate() {
        let first_rank = peer.roles.ring_recv[0] as usize;
        let node = match first_ranks.iter().position(|&r| r == first_rank) {
            Some(node) => node,
            None => {
                first_ranks.push(first_rank);
                tree_patterns.push(peer.tree.pattern);
                first_ranks.len() - 1
            }
        };
        node_of_rank[i] = node;
        if i == rank {
            my_node = node;
        }
    }
    NodeAssignment {
        my_node,
        num_nodes: first_ranks.len(),
        first_ranks,
        tree_patterns,
        node_of_rank,
    }
}
