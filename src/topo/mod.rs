//! Topology service interface. Physical topology discovery (device/NIC
//! adjacency, path-cost search) is an external collaborator; the control
//! plane consumes it through this trait and ships a flat default so the
//! crate works stand-alone.

pub mod flat;

use crate::comm::{PeerInfo, MAX_TREE_ARITY};
use crate::config::CrossNicPolicy;
use crate::graph::{GraphExchange, GraphPattern, NodeAssignment, PerRankRoles, TopoGraph};
use crate::rendezvous::HostCount;

pub use flat::FlatTopology;

/// Constraints for one pattern search, mirroring the per-graph request
/// table: rings get up to half the channel slots, trees are bounded by the
/// ring result, the collnet tree is pinned to the ring channel count.
#[derive(Debug, Clone, Copy)]
pub struct PatternConstraints {
    pub pattern: GraphPattern,
    pub min_channels: usize,
    pub max_channels: usize,
    pub collnet: bool,
    pub cross_nic: CrossNicPolicy,
    pub host_count: HostCount,
}

/// Tree-shape selection is a pluggable policy. The default uses an
/// empirical host-count threshold; deployments with a real cost model can
/// substitute their own.
pub type TreeShapePolicy = fn(HostCount) -> GraphPattern;

pub fn default_tree_shape(host_count: HostCount) -> GraphPattern {
    match host_count {
        HostCount::One | HostCount::Two => GraphPattern::Tree,
        HostCount::ThreeOrMore => GraphPattern::BalancedTree,
    }
}

/// Tree edges for one channel: one parent, bounded fan-out of children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoles {
    pub parent: Option<usize>,
    pub children: [Option<usize>; MAX_TREE_ARITY],
}

/// Per-channel role assignment produced after reconciliation.
#[derive(Debug, Clone)]
pub struct ChannelRoles {
    /// Global ring membership, a permutation of all ranks.
    pub ring_order: Vec<usize>,
    pub tree: TreeRoles,
}

pub trait TopologyService: Send + Sync {
    type Topology: Send + 'static;

    fn build_system(&self, peers: &[PeerInfo]) -> anyhow::Result<Self::Topology>;

    fn compute_paths(&self, topo: &mut Self::Topology, peers: &[PeerInfo]) -> anyhow::Result<()>;

    fn trim_unreachable(&self, topo: &mut Self::Topology, rank: usize) -> anyhow::Result<()>;

    fn compute_graph(
        &self,
        topo: &Self::Topology,
        constraints: &PatternConstraints,
    ) -> anyhow::Result<TopoGraph>;

    /// Pre-reconciliation roles: the local node's chain membership per
    /// channel, published in the second AllGather.
    fn preset_roles(
        &self,
        topo: &Self::Topology,
        rank: usize,
        n_channels: usize,
        ring: &TopoGraph,
    ) -> anyhow::Result<PerRankRoles>;

    /// Post-reconciliation channel assembly: stitch node chains into global
    /// rings and assign tree edges, using the gathered per-rank roles.
    fn postset_channels(
        &self,
        topo: &Self::Topology,
        rank: usize,
        n_channels: usize,
        nodes: &NodeAssignment,
        all: &[GraphExchange],
    ) -> anyhow::Result<Vec<ChannelRoles>>;
}
