//! Built-in default topology service. Models every host as a flat PCIe
//! domain: ranks on one host form a chain in rank order, hosts are joined
//! by a generic network link. Good enough for loopback and single-switch
//! deployments; anything richer should supply its own `TopologyService`.

use crate::comm::{PeerInfo, MAX_CHANNELS, MAX_TREE_ARITY};
use crate::graph::{
    GraphExchange, NodeAssignment, PerRankRoles, TopoGraph, LinkType, ROLE_NONE,
};

use super::{ChannelRoles, PatternConstraints, TopologyService, TreeRoles};

const FLAT_SPEED_INTRA: f32 = 12.0;
const FLAT_SPEED_INTER: f32 = 5.0;
const FLAT_CHANNELS: usize = 2;

#[derive(Debug, Default)]
pub struct FlatTopology;

pub struct FlatSystem {
    /// Host hash per rank, in rank order.
    hosts: Vec<u64>,
    num_hosts: usize,
}

impl FlatSystem {
    fn host_members(&self, host: u64) -> Vec<usize> {
        (0..self.hosts.len())
            .filter(|&r| self.hosts[r] == host)
            .collect()
    }
}

impl TopologyService for FlatTopology {
    type Topology = FlatSystem;

    fn build_system(&self, peers: &[PeerInfo]) -> anyhow::Result<FlatSystem> {
        let hosts: Vec<u64> = peers.iter().map(|p| p.host_hash).collect();
        let mut distinct = hosts.clone();
        distinct.sort_unstable();
        distinct.dedup();
        Ok(FlatSystem {
            hosts,
            num_hosts: distinct.len(),
        })
    }

    fn compute_paths(&self, _topo: &mut FlatSystem, _peers: &[PeerInfo]) -> anyhow::Result<()> {
        // Flat model: one hop intra-host, one hop inter-host. Nothing to
        // precompute.
        Ok(())
    }

    fn trim_unreachable(&self, _topo: &mut FlatSystem, _rank: usize) -> anyhow::Result<()> {
        // Every rank that checked in over the bootstrap channel is
        // reachable by definition here.
        Ok(())
    }

    fn compute_graph(
        &self,
        topo: &FlatSystem,
        constraints: &PatternConstraints,
    ) -> anyhow::Result<TopoGraph> {
        let n_channels = FLAT_CHANNELS
            .clamp(constraints.min_channels, constraints.max_channels)
            .min(MAX_CHANNELS);
        Ok(TopoGraph {
            pattern: constraints.pattern,
            collnet: constraints.collnet,
            n_channels,
            same_channels: true,
            speed_intra: FLAT_SPEED_INTRA,
            speed_inter: FLAT_SPEED_INTER,
            type_intra: LinkType::Pci,
            type_inter: if topo.num_hosts > 1 {
                LinkType::Net
            } else {
                LinkType::Pci
            },
        })
    }

    fn preset_roles(
        &self,
        topo: &FlatSystem,
        rank: usize,
        n_channels: usize,
        _ring: &TopoGraph,
    ) -> anyhow::Result<PerRankRoles> {
        let members = topo.host_members(topo.hosts[rank]);
        let pos = members
            .iter()
            .position(|&r| r == rank)
            .expect("rank belongs to its own host");
        let first = members[0] as u32;
        let last = *members.last().unwrap() as u32;
        let prev = if pos > 0 {
            members[pos - 1] as u32
        } else {
            ROLE_NONE
        };
        let next = if pos + 1 < members.len() {
            members[pos + 1] as u32
        } else {
            ROLE_NONE
        };

        let mut roles = PerRankRoles::empty();
        for c in 0..n_channels.min(MAX_CHANNELS) {
            roles.ring_recv[c] = first;
            roles.ring_send[c] = last;
            roles.ring_prev[c] = prev;
            roles.ring_next[c] = next;
        }
        Ok(roles)
    }

    fn postset_channels(
        &self,
        _topo: &FlatSystem,
        rank: usize,
        n_channels: usize,
        nodes: &NodeAssignment,
        all: &[GraphExchange],
    ) -> anyhow::Result<Vec<ChannelRoles>> {
        // Stitch node chains into one global ring: nodes in first-seen
        // order, each node's members in rank order. Identical on every rank
        // because it is a pure function of the gathered data.
        let mut ring_order = Vec::with_capacity(all.len());
        for node in 0..nodes.num_nodes {
            for (r, &n) in nodes.node_of_rank.iter().enumerate() {
                if n == node {
                    ring_order.push(r);
                }
            }
        }

        // Tree edges: heap layout over the ring order, fan-out bounded by
        // the tree arity.
        let pos = ring_order
            .iter()
            .position(|&r| r == rank)
            .expect("rank present in stitched ring");
        let parent = if pos == 0 {
            None
        } else {
            Some(ring_order[(pos - 1) / MAX_TREE_ARITY])
        };
        let mut children = [None; MAX_TREE_ARITY];
        for (slot, child) in children.iter_mut().enumerate() {
            let child_pos = pos * MAX_TREE_ARITY + slot + 1;
            if child_pos < ring_order.len() {
                *child = Some(ring_order[child_pos]);
            }
        }
        let tree = TreeRoles { parent, children };

        Ok((0..n_channels)
            .map(|_| ChannelRoles {
                ring_order: ring_order.clone(),
                tree,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrossNicPolicy;
    use crate::graph::{assign_nodes, GraphInfo, GraphPattern};
    use crate::rendezvous::tests::peer;
    use crate::rendezvous::HostCount;

    fn exchange_for(roles: PerRankRoles) -> GraphExchange {
        let g = TopoGraph {
            pattern: GraphPattern::Ring,
            collnet: false,
            n_channels: 2,
            same_channels: true,
            speed_intra: FLAT_SPEED_INTRA,
            speed_inter: FLAT_SPEED_INTER,
            type_intra: LinkType::Pci,
            type_inter: LinkType::Net,
        };
        let info = GraphInfo::from(&g);
        GraphExchange {
            comp_cap: 90,
            n_channels: 2,
            ring: info,
            tree: info,
            collnet: info,
            roles,
        }
    }

    #[test]
    fn stitched_ring_is_a_permutation_and_trees_are_reciprocal() {
        // Two hosts, interleaved ranks: host A has 0,2 and host B has 1,3.
        let peers = vec![
            peer(0, 0xa, 1, 0x10, 90),
            peer(1, 0xb, 1, 0x10, 90),
            peer(2, 0xa, 2, 0x20, 90),
            peer(3, 0xb, 2, 0x20, 90),
        ];
        let service = FlatTopology;
        let topo = service.build_system(&peers).unwrap();
        let ring = service
            .compute_graph(
                &topo,
                &PatternConstraints {
                    pattern: GraphPattern::Ring,
                    min_channels: 1,
                    max_channels: MAX_CHANNELS / 2,
                    collnet: false,
                    cross_nic: CrossNicPolicy::Auto,
                    host_count: HostCount::Two,
                },
            )
            .unwrap();

        let all: Vec<_> = (0..4)
            .map(|r| exchange_for(service.preset_roles(&topo, r, 2, &ring).unwrap()))
            .collect();
        let nodes = assign_nodes(0, &all);
        assert_eq!(nodes.num_nodes, 2);

        let mut trees = Vec::new();
        for r in 0..4 {
            let channels = service
                .postset_channels(&topo, r, 2, &nodes, &all)
                .unwrap();
            assert_eq!(channels.len(), 2);
            let mut sorted = channels[0].ring_order.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![0, 1, 2, 3]);
            trees.push(channels[0].tree);
        }
        // Parent/child edges agree from both ends.
        for (r, tree) in trees.iter().enumerate() {
            if let Some(parent) = tree.parent {
                assert!(trees[parent].children.contains(&Some(r)));
            }
            for child in tree.children.iter().flatten() {
                assert_eq!(trees[*child].parent, Some(r));
            }
        }
    }
}
