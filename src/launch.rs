//! Intra-process launch coordination. Ranks sharing one process coordinate
//! cooperative kernel launch through a block of shared state: ordinal 0
//! allocates and publishes it once, the rest spin-wait (yield, not block)
//! until it appears. Publication goes through a process-wide registry, so
//! no lock is needed beyond the map's own sharding.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::comm::{CommunicatorId, DeviceSpec};
use crate::config::CommConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// All local devices launched together under one cooperative call.
    Group,
    /// Fully independent per-device launch.
    Parallel,
}

/// Auxiliary stream-like object owned by grouped launch; exists only while
/// the communicator's launch mode is `Group`.
pub struct GroupStream {
    _token: u64,
}

impl GroupStream {
    pub(crate) fn new() -> Self {
        GroupStream {
            _token: rand::random(),
        }
    }
}

// cg_mode bits: 0x01 = cooperative launch still viable (every rank must
// keep it set), 0x10 = initial sanity check pending.
const CG_COOPERATIVE: u32 = 0x01;
const CG_INITIAL: u32 = 0x11;

/// Cooperative launch needs a minimum device generation on top of the
/// driver capability flag.
const MIN_COOPERATIVE_COMP_CAP: u32 = 60;

pub(crate) struct IntraProcessShared {
    // Monotonic double-buffered barrier counters; never reset, waiters
    // compare against round * intra_ranks.
    barrier: [AtomicUsize; 2],
    device_ids: Vec<AtomicI32>,
    cg_mode: AtomicU32,
    min_comp_cap: AtomicU32,
    attached: AtomicUsize,
}

impl IntraProcessShared {
    fn new(intra_ranks: usize) -> Self {
        IntraProcessShared {
            barrier: [AtomicUsize::new(0), AtomicUsize::new(0)],
            device_ids: (0..intra_ranks).map(|_| AtomicI32::new(-1)).collect(),
            cg_mode: AtomicU32::new(CG_INITIAL),
            min_comp_cap: AtomicU32::new(u32::MAX),
            attached: AtomicUsize::new(intra_ranks),
        }
    }
}

type IntraKey = (CommunicatorId, usize);

static INTRA_REGISTRY: Lazy<DashMap<IntraKey, Arc<IntraProcessShared>>> =
    Lazy::new(DashMap::new);

pub struct IntraProcessHandle {
    shared: Arc<IntraProcessShared>,
    pub intra_rank: usize,
    pub intra_ranks: usize,
    // Local barrier bookkeeping: which buffer is next and how many rounds
    // each buffer has completed from this rank's perspective.
    phase: usize,
    rounds: [usize; 2],
    key: IntraKey,
}

impl IntraProcessHandle {
    /// Two-counter double-buffered barrier. Counters only grow; a rank in
    /// round r of buffer p waits until r * intra_ranks arrivals, so a fast
    /// rank re-entering the barrier can never corrupt the previous round.
    pub fn barrier(&mut self) {
        if self.intra_ranks == 1 {
            return;
        }
        let phase = self.phase;
        self.rounds[phase] += 1;
        let target = self.rounds[phase] * self.intra_ranks;
        self.shared.barrier[phase].fetch_add(1, Ordering::AcqRel);
        while self.shared.barrier[phase].load(Ordering::Acquire) < target {
            std::thread::yield_now();
        }
        self.phase = 1 - phase;
    }

    pub fn min_comp_cap(&self) -> u32 {
        self.shared.min_comp_cap.load(Ordering::Acquire)
    }

    pub fn device_id(&self, intra_rank: usize) -> i32 {
        self.shared.device_ids[intra_rank].load(Ordering::Acquire)
    }

    /// Release this rank's attachment; the last rank out frees the shared
    /// block by removing it from the registry.
    pub(crate) fn detach(self) {
        if self.shared.attached.fetch_sub(1, Ordering::AcqRel) == 1 {
            INTRA_REGISTRY.remove(&self.key);
        }
    }

    #[cfg(test)]
    fn shared_addr(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }
}

/// Join this rank to its intra-process group. Ordinal 0 allocates and
/// publishes the shared block; everyone else spin-waits for publication.
/// Returns the handle, the settled launch mode, and the group stream when
/// grouped launch was selected.
pub(crate) fn setup_intra_process(
    comm_id: CommunicatorId,
    intra_rank: usize,
    intra_ranks: usize,
    intra_rank0: usize,
    dev: &DeviceSpec,
    config: &CommConfig,
) -> (IntraProcessHandle, LaunchMode, Option<GroupStream>) {
    let key = (comm_id, intra_rank0);
    let shared = if intra_rank == 0 {
        // Fully initialize before insertion; the map publishes with
        // release/acquire.
        let shared = Arc::new(IntraProcessShared::new(intra_ranks));
        INTRA_REGISTRY.insert(key, Arc::clone(&shared));
        shared
    } else {
        loop {
            if let Some(entry) = INTRA_REGISTRY.get(&key) {
                break Arc::clone(entry.value());
            }
            std::thread::yield_now();
        }
    };

    shared.device_ids[intra_rank].store(dev.device_index, Ordering::Release);
    shared.min_comp_cap.fetch_min(dev.comp_cap, Ordering::AcqRel);

    let cooperative = (dev.cooperative_launch && dev.comp_cap >= MIN_COOPERATIVE_COMP_CAP)
        || config.force_enable_clique_launch;
    if !cooperative || config.launch_mode == LaunchMode::Parallel {
        shared.cg_mode.fetch_and(!CG_COOPERATIVE, Ordering::AcqRel);
    }

    let mut handle = IntraProcessHandle {
        shared,
        intra_rank,
        intra_ranks,
        phase: 0,
        rounds: [0, 0],
        key,
    };
    // Flags are final only once every rank has folded its device in.
    handle.barrier();

    let cg = handle.shared.cg_mode.load(Ordering::Acquire);
    let mode = if intra_ranks > 1 && cg & CG_COOPERATIVE != 0 {
        LaunchMode::Group
    } else {
        LaunchMode::Parallel
    };
    let stream = match mode {
        LaunchMode::Group => Some(GroupStream::new()),
        LaunchMode::Parallel => None,
    };
    log::debug!(
        "intra-process group {:?}: rank {} of {} settled on {:?} launch",
        comm_id,
        intra_rank,
        intra_ranks,
        mode
    );
    (handle, mode, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn dev(index: i32, comp_cap: u32, cooperative: bool) -> DeviceSpec {
        DeviceSpec {
            device_index: index,
            bus_id: 0x100 + index as u64,
            comp_cap,
            cooperative_launch: cooperative,
            gdr_support: false,
        }
    }

    fn join_all(
        comm_id: CommunicatorId,
        devs: Vec<DeviceSpec>,
        config: CommConfig,
    ) -> Vec<(IntraProcessHandle, LaunchMode, Option<GroupStream>)> {
        let n = devs.len();
        let handles: Vec<_> = devs
            .into_iter()
            .enumerate()
            .map(|(i, d)| {
                let config = config.clone();
                std::thread::spawn(move || setup_intra_process(comm_id, i, n, 0, &d, &config))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn single_allocator_and_shared_publication() {
        let results = join_all(
            CommunicatorId(100),
            vec![dev(0, 90, true), dev(1, 80, true), dev(2, 85, true)],
            CommConfig::default(),
        );
        let addr = results[0].0.shared_addr();
        for (handle, _, _) in &results {
            assert_eq!(handle.shared_addr(), addr);
            assert_eq!(handle.min_comp_cap(), 80);
        }
        // Device table is fully populated after the setup barrier.
        let ids: Vec<i32> = (0..3).map(|i| results[0].0.device_id(i)).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        for (handle, _, _) in results {
            handle.detach();
        }
        assert!(INTRA_REGISTRY.get(&(CommunicatorId(100), 0)).is_none());
    }

    #[test]
    fn launch_mode_selection_rules() {
        // All cooperative, more than one rank: grouped launch.
        let results = join_all(
            CommunicatorId(101),
            vec![dev(0, 90, true), dev(1, 90, true)],
            CommConfig::default(),
        );
        for (_, mode, stream) in &results {
            assert_eq!(*mode, LaunchMode::Group);
            assert!(stream.is_some());
        }
        results.into_iter().for_each(|(h, _, _)| h.detach());

        // One device without cooperative launch downgrades everyone.
        let results = join_all(
            CommunicatorId(102),
            vec![dev(0, 90, true), dev(1, 90, false)],
            CommConfig::default(),
        );
        for (_, mode, stream) in &results {
            assert_eq!(*mode, LaunchMode::Parallel);
            assert!(stream.is_none());
        }
        results.into_iter().for_each(|(h, _, _)| h.detach());

        // Config override forces per-device launch.
        let mut config = CommConfig::default();
        config.launch_mode = LaunchMode::Parallel;
        let results = join_all(
            CommunicatorId(103),
            vec![dev(0, 90, true), dev(1, 90, true)],
            config,
        );
        assert!(results.iter().all(|(_, m, _)| *m == LaunchMode::Parallel));
        results.into_iter().for_each(|(h, _, _)| h.detach());

        // Clique override re-enables grouped launch on a device that does
        // not advertise cooperative support.
        let mut config = CommConfig::default();
        config.force_enable_clique_launch = true;
        let results = join_all(
            CommunicatorId(104),
            vec![dev(0, 90, true), dev(1, 90, false)],
            config,
        );
        assert!(results.iter().all(|(_, m, _)| *m == LaunchMode::Group));
        results.into_iter().for_each(|(h, _, _)| h.detach());

        // A lone rank always launches independently.
        let results = join_all(CommunicatorId(105), vec![dev(0, 90, true)], CommConfig::default());
        assert_eq!(results[0].1, LaunchMode::Parallel);
        results.into_iter().for_each(|(h, _, _)| h.detach());

        // A device below the cooperative generation downgrades everyone.
        let results = join_all(
            CommunicatorId(107),
            vec![dev(0, 90, true), dev(1, 35, true)],
            CommConfig::default(),
        );
        assert!(results.iter().all(|(_, m, _)| *m == LaunchMode::Parallel));
        results.into_iter().for_each(|(h, _, _)| h.detach());
    }

    #[test]
    fn barrier_separates_rounds() {
        static PROGRESS: AtomicUsize = AtomicUsize::new(0);
        let n = 4;
        let results = join_all(
            CommunicatorId(106),
            (0..n as i32).map(|i| dev(i, 90, true)).collect(),
            CommConfig::default(),
        );
        let threads: Vec<_> = results
            .into_iter()
            .map(|(mut handle, _, _)| {
                std::thread::spawn(move || {
                    for round in 1..=10 {
                        PROGRESS.fetch_add(1, Ordering::AcqRel);
                        handle.barrier();
                        // After the barrier, every rank's increment for
                        // this round is visible.
                        assert!(PROGRESS.load(Ordering::Acquire) >= round * n);
                        handle.barrier();
                    }
                    handle
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap().detach();
        }
    }
}
