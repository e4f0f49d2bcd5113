pub mod channel;
pub mod collnet;
pub mod connector;
pub mod p2p;
pub mod setup;

use self::connector::Transporter;
use self::p2p::{NetTransporter, ShmTransporter};

pub static SHM_TRANSPORTER: ShmTransporter = ShmTransporter;
pub static NET_TRANSPORTER: NetTransporter = NetTransporter;

/// Candidate transports in preference order; `select_transport` picks the
/// first whose `can_connect` accepts the peer pair.
pub static ALL_TRANSPORTERS: [&'static dyn Transporter; 2] =
    [&SHM_TRANSPORTER, &NET_TRANSPORTER];

// Bootstrap tag namespaces, one per connect phase. Handle-exchange rounds
// use (round << 8) | tag, so each graph gets a disjoint tag space.
pub const RING_GRAPH_TAG: u8 = 0x11;
pub const TREE_GRAPH_TAG: u8 = 0x12;
pub const COLLNET_GRAPH_TAG: u8 = 0x13;
