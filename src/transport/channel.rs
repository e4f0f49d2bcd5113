use std::collections::HashMap;
use std::fmt::Display;

use crate::comm::MAX_TREE_ARITY;

use super::connector::{Transporter, TransportResources};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnType {
    Send,
    Recv,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.to_string().as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerConnId {
    pub peer_rank: usize,
    pub channel: ChannelId,
    pub conn_index: u32,
    pub conn_type: ConnType,
}

pub struct RingPattern {
    pub prev: usize,
    pub next: usize,
    /// Global ring membership rotated so index 0 is the local rank.
    pub user_ranks: Vec<usize>,
    // rank 0's distance to my rank along the ring send path
    pub index: usize,
}

impl RingPattern {
    /// Rotate the reconciled membership so it starts at `rank`; predecessor
    /// and successor become O(1) lookups. Rotation preserves the edge set:
    /// every rank derives the same (prev, next) pairs.
    pub fn from_order(rank: usize, order: &[usize]) -> RingPattern {
        let pos = order
            .iter()
            .position(|&r| r == rank)
            .expect("local rank present in ring order");
        let n = order.len();
        let user_ranks: Vec<usize> = (0..n).map(|i| order[(pos + i) % n]).collect();
        RingPattern {
            prev: order[(pos + n - 1) % n],
            next: order[(pos + 1) % n],
            user_ranks,
            index: pos,
        }
    }
}

pub struct TreePattern {
    pub parent: Option<usize>,
    pub children: [Option<usize>; MAX_TREE_ARITY],
}

/// Collective-network tree edges, present only while collnet is active.
/// `up` points toward the virtual root (rank = group size); `index` is the
/// dense collnet-local master index.
pub struct CollTreePattern {
    pub up: usize,
    pub down: Option<usize>,
    pub index: usize,
}

pub struct PeerConnector {
    pub transporter: &'static dyn Transporter,
    pub resources: TransportResources,
}

pub const CHANNEL_MAX_CONNS: usize = 2;

#[derive(Default)]
pub struct ChannelPeerConn {
    // conn_index -> PeerConnector
    pub send: [Option<PeerConnector>; CHANNEL_MAX_CONNS],
    pub recv: [Option<PeerConnector>; CHANNEL_MAX_CONNS],
}

pub struct CommChannel {
    pub id: ChannelId,
    // peer -> ChannelPeerConn
    pub peers: HashMap<usize, ChannelPeerConn>,
    pub ring: RingPattern,
    pub tree: TreePattern,
    /// Collnet fields live apart from `peers`: the virtual root is not a
    /// real rank. Both are cleared on fallback.
    pub coll_tree: Option<CollTreePattern>,
    pub coll_resources: Option<TransportResources>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_preserves_edges() {
        let order = [3usize, 0, 2, 1];
        let mut edges_seen: Option<Vec<(usize, usize)>> = None;
        for &rank in &order {
            let ring = RingPattern::from_order(rank, &order);
            assert_eq!(ring.user_ranks[0], rank);
            assert_eq!(ring.user_ranks.len(), order.len());
            // Collect the full edge set as this rank sees it.
            let mut edges: Vec<(usize, usize)> = ring
                .user_ranks
                .iter()
                .zip(ring.user_ranks.iter().cycle().skip(1))
                .map(|(&a, &b)| (a, b))
                .collect();
            edges.sort_unstable();
            match &edges_seen {
                None => edges_seen = Some(edges),
                Some(expected) => assert_eq!(&edges, expected),
            }
        }
    }

    #[test]
    fn rotation_neighbors_match_order() {
        let order = [0usize, 1, 2, 3];
        let ring = RingPattern::from_order(2, &order);
        assert_eq!(ring.prev, 1);
        assert_eq!(ring.next, 3);
        assert_eq!(ring.index, 2);
        assert_eq!(ring.user_ranks, vec![2, 3, 0, 1]);
    }
}
