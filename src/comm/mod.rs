pub mod profile;

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bootstrap::BootstrapSession;
use crate::error::ErrorCode;
use crate::launch::{GroupStream, IntraProcessHandle, LaunchMode};
use crate::transport::channel::CommChannel;
use profile::CommProfile;

pub const MAX_CHANNELS: usize = 32;
pub const MAX_TREE_ARITY: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommunicatorId(pub u64);

/// Caller-supplied identity of the local device. Device discovery belongs
/// to the runtime layer above; the control plane only needs these facts.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSpec {
    pub device_index: i32,
    /// Stable per-host device identity (PCI bus id or equivalent). Two
    /// ranks presenting the same (host, bus_id) is a fatal config error.
    pub bus_id: u64,
    pub comp_cap: u32,
    pub cooperative_launch: bool,
    pub gdr_support: bool,
}

/// One rank's identity record, published once in the first AllGather and
/// immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub rank: u64,
    pub host_hash: u64,
    pub pid_hash: u64,
    pub device_index: i32,
    pub bus_id: u64,
    pub comp_cap: u32,
    pub gdr_support: bool,
    pub cooperative_launch: bool,
}

const POISON_RANK: usize = usize::MAX;
const POISON_DEVICE: i32 = -1;
const POISON_BUS_ID: u64 = u64::MAX;

/// The per-rank communicator: group membership plus everything the
/// negotiation agreed on. Created by `init_rank`, torn down by `destroy`;
/// `abort` only raises the shared flag.
pub struct Communicator {
    pub(crate) id: CommunicatorId,
    pub(crate) rank: usize,
    pub(crate) num_ranks: usize,
    pub(crate) node: usize,
    pub(crate) num_nodes: usize,
    pub(crate) device_index: i32,
    pub(crate) bus_id: u64,
    pub(crate) peers_info: Vec<PeerInfo>,
    pub(crate) channels: Vec<CommChannel>,
    pub(crate) topo: Option<Box<dyn Any + Send>>,
    pub(crate) profile: CommProfile,
    pub(crate) bootstrap: Option<BootstrapSession>,
    pub(crate) collnet_support: bool,
    // Advisory only: signals device-side and background work to quit; never
    // releases resources itself.
    pub(crate) abort_flag: Arc<AtomicBool>,
    // Sticky ErrorCode slot for failures discovered after Ready.
    pub(crate) fatal_error: Arc<AtomicU32>,
    pub(crate) launch_mode: LaunchMode,
    pub(crate) group_stream: Option<GroupStream>,
    pub(crate) intra: Option<IntraProcessHandle>,
}

impl Communicator {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.num_ranks
    }

    pub fn device_index(&self) -> i32 {
        self.device_index
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn collnet_support(&self) -> bool {
        self.collnet_support
    }

    pub fn launch_mode(&self) -> LaunchMode {
        self.launch_mode
    }

    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers_info
    }

    pub fn channels(&self) -> &[CommChannel] {
        &self.channels
    }

    /// Raise the shared abort flag (release ordering; observers load with
    /// acquire). Never blocks and never frees anything.
    pub(crate) fn set_abort(&self) {
        self.abort_flag.store(true, Ordering::Release);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_flag.load(Ordering::Acquire)
    }

    /// Record a fatal error discovered after Ready. First writer wins; the
    /// slot is sticky until the communicator is destroyed.
    pub fn set_fatal_error(&self, code: ErrorCode) {
        let _ = self.fatal_error.compare_exchange(
            ErrorCode::Success as u32,
            code as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn async_error(&self) -> ErrorCode {
        ErrorCode::from_u32(self.fatal_error.load(Ordering::Acquire))
    }

    /// Overwrite identity fields with sentinels so a second destroy is
    /// caught as a usage error instead of touching freed state.
    pub(crate) fn poison(&mut self) {
        self.rank = POISON_RANK;
        self.device_index = POISON_DEVICE;
        self.bus_id = POISON_BUS_ID;
        self.num_ranks = 0;
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.rank == POISON_RANK
            || self.num_ranks == 0
            || self.device_index == POISON_DEVICE
            || self.bus_id == POISON_BUS_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_error_slot_is_sticky() {
        let slot = Arc::new(AtomicU32::new(ErrorCode::Success as u32));
        let comm = Communicator {
            id: CommunicatorId(1),
            rank: 0,
            num_ranks: 1,
            node: 0,
            num_nodes: 1,
            device_index: 0,
            bus_id: 0x1f,
            peers_info: Vec::new(),
            channels: Vec::new(),
            topo: None,
            profile: CommProfile::default(),
            bootstrap: None,
            collnet_support: false,
            abort_flag: Arc::new(AtomicBool::new(false)),
            fatal_error: slot,
            launch_mode: LaunchMode::Parallel,
            group_stream: None,
            intra: None,
        };
        assert_eq!(comm.async_error(), ErrorCode::Success);
        comm.set_fatal_error(ErrorCode::TransportError);
        comm.set_fatal_error(ErrorCode::InternalError);
        assert_eq!(comm.async_error(), ErrorCode::TransportError);
    }
}
