//! Control plane for multi-process, multi-device collective communication:
//! rendezvous, topology negotiation, channel connection, and communicator
//! lifecycle. Data movement itself lives behind the transporter seam.
//!
//! The entry points mirror the classic collective-library flow: one process
//! calls [`create_group_id`] and distributes the result out-of-band, then
//! every rank calls [`init_rank`] with its own rank and device. All ranks
//! must make the same calls in the same order; the negotiation is
//! collective from the first byte.

use std::net::SocketAddr;
use std::sync::Once;

use once_cell::sync::Lazy;

pub mod bootstrap;
pub mod comm;
pub mod config;
pub mod error;
pub mod graph;
pub mod launch;
pub mod rendezvous;
pub mod topo;
pub mod transport;

mod collnet;
mod init;
mod utils;

pub use bootstrap::GroupId;
pub use comm::{Communicator, CommunicatorId, DeviceSpec, PeerInfo};
pub use config::{CommConfig, CrossNicPolicy};
pub use error::{CommError, ErrorCode};
pub use launch::LaunchMode;
pub use topo::{FlatTopology, TopologyService};

static LIBRARY_INIT: Once = Once::new();

// Process-wide configuration: optional TOML file named by OCCL_CONFIG, with
// OCCL_* variables overriding individual fields.
static GLOBAL_CONFIG: Lazy<CommConfig> = Lazy::new(|| {
    let base = match std::env::var("OCCL_CONFIG") {
        Ok(path) => CommConfig::from_path(&path).unwrap_or_else(|e| {
            log::warn!("failed to load config from {}: {}; using defaults", path, e);
            CommConfig::default()
        }),
        Err(_) => CommConfig::default(),
    };
    base.with_env()
});

/// One-time process initialization. Idempotent and cheap after the first
/// call; every public entry point routes through it.
fn library_init() {
    LIBRARY_INIT.call_once(|| {
        Lazy::force(&GLOBAL_CONFIG);
        log::debug!("occl {} initialized", get_version());
    });
}

pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

static FLAT_SERVICE: FlatTopology = FlatTopology;

fn root_listen_addr() -> SocketAddr {
    match std::env::var("OCCL_BOOTSTRAP_ADDR") {
        Ok(v) => match v.parse() {
            Ok(addr) => return addr,
            Err(_) => log::warn!("OCCL_BOOTSTRAP_ADDR: unrecognized address {:?}", v),
        },
        Err(_) => {}
    }
    "127.0.0.1:0".parse().unwrap()
}

/// Create a group identity and start serving the root rendezvous for it on
/// a background thread. The returned id must reach every rank out-of-band
/// (an environment variable, a launcher argument, a shared file).
///
/// The root binds to `OCCL_BOOTSTRAP_ADDR` when set; multi-host groups must
/// set it to an externally reachable interface.
pub fn create_group_id() -> Result<GroupId, CommError> {
    library_init();
    let listen_addr = root_listen_addr();
    let (socket, id) = bootstrap::create_group_root(&listen_addr)?;
    let magic = id.magic;
    std::thread::spawn(move || {
        if let Err(e) = smol::block_on(bootstrap::root_service(socket, magic)) {
            log::error!("bootstrap root failed: {}", e);
        }
    });
    Ok(id)
}

/// Join the group as one rank and run the full negotiation to a ready
/// communicator. Blocks until every rank of the group has joined and the
/// collective phases complete.
pub fn init_rank(
    id: &GroupId,
    num_ranks: usize,
    rank: usize,
    dev: DeviceSpec,
) -> Result<Communicator, CommError> {
    library_init();
    init::init_rank_sync(&FLAT_SERVICE, id, num_ranks, rank, dev, &GLOBAL_CONFIG)
}

/// Like [`init_rank`], with an explicit configuration and topology service
/// in place of the process-wide defaults.
pub fn init_rank_with_service<S: TopologyService>(
    service: &S,
    id: &GroupId,
    num_ranks: usize,
    rank: usize,
    dev: DeviceSpec,
    config: &CommConfig,
) -> Result<Communicator, CommError> {
    library_init();
    init::init_rank_sync(service, id, num_ranks, rank, dev, config)
}

/// Convenience single-process path: one communicator per local device, one
/// coordinating thread each, group id created internally. Device indices
/// must be distinct; that is validated before any network activity.
pub fn init_all_local_devices(devices: &[DeviceSpec]) -> Result<Vec<Communicator>, CommError> {
    library_init();
    for (i, a) in devices.iter().enumerate() {
        for (j, b) in devices.iter().enumerate().skip(i + 1) {
            if a.device_index == b.device_index {
                return Err(CommError::Config(format!(
                    "devices {} and {} share device index {}",
                    i, j, a.device_index
                )));
            }
        }
    }
    let id = create_group_id()?;
    let num_ranks = devices.len();
    let threads: Vec<_> = devices
        .iter()
        .copied()
        .enumerate()
        .map(|(rank, dev)| {
            std::thread::spawn(move || {
                init::init_rank_sync(&FLAT_SERVICE, &id, num_ranks, rank, dev, &GLOBAL_CONFIG)
            })
        })
        .collect();
    let mut comms = Vec::with_capacity(num_ranks);
    let mut first_error = None;
    for t in threads {
        match t.join() {
            Ok(Ok(comm)) => comms.push(comm),
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(_) => {
                if first_error.is_none() {
                    first_error = Some(CommError::Internal(
                        "initialization thread panicked".to_string(),
                    ));
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(comms),
    }
}

/// Tear the communicator down in order: local synchronization, transport
/// release, bootstrap shutdown, intra-process detach. Blocks; a second call
/// on the same communicator is a usage error.
pub fn destroy(comm: &mut Communicator) -> Result<(), CommError> {
    init::destroy(comm)
}

/// Raise the abort flag and return immediately. Resources stay allocated
/// until [`destroy`] runs; in-flight collective phases on other ranks are
/// not interrupted.
pub fn abort(comm: &Communicator) -> Result<(), CommError> {
    init::abort(comm)
}

/// Read the sticky asynchronous error slot without clearing it.
pub fn get_async_error(comm: &Communicator) -> ErrorCode {
    comm.async_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_manifest() {
        assert_eq!(get_version(), env!("CARGO_PKG_VERSION"));
        assert!(!get_version().is_empty());
    }

    #[test]
    fn local_devices_validated_before_rendezvous() {
        let dev = |i: i32| DeviceSpec {
            device_index: i,
            bus_id: 0x40 + i as u64,
            comp_cap: 90,
            cooperative_launch: true,
            gdr_support: false,
        };
        match init_all_local_devices(&[dev(0), dev(1), dev(0)]) {
            Err(CommError::Config(msg)) => assert!(msg.contains("device index 0")),
            other => panic!("expected Config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn all_local_devices_end_to_end() {
        let devs: Vec<DeviceSpec> = (0..2)
            .map(|i| DeviceSpec {
                device_index: 10 + i,
                bus_id: 0x50 + i as u64,
                comp_cap: 90,
                cooperative_launch: true,
                gdr_support: false,
            })
            .collect();
        let mut comms = init_all_local_devices(&devs).unwrap();
        comms.sort_by_key(|c| c.rank());
        assert_eq!(comms.len(), 2);
        for (rank, comm) in comms.iter().enumerate() {
            assert_eq!(comm.rank(), rank);
            assert_eq!(comm.size(), 2);
            assert_eq!(get_async_error(comm), ErrorCode::Success);
        }
        for comm in comms.iter_mut() {
            destroy(comm).unwrap();
        }
    }
}
