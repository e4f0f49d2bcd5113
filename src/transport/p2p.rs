//! Built-in point-to-point transporters. The data path itself is an
//! external collaborator; these transporters carry out the control-plane
//! half of the contract: capability checks, handle fabrication, and
//! validation that each handle landed on the connection it was minted for.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use super::channel::PeerConnId;
use super::connector::{
    ConnectHandle, Transporter, TransportConnect, TransportResources, TransportSetup,
    TransporterError,
};
use crate::comm::{profile::CommProfile, PeerInfo};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct P2pHandle {
    rank: u64,
    channel: u32,
    conn_index: u32,
    /// Shared-memory segment key or network endpoint token, depending on
    /// the transport that minted the handle.
    token: u64,
}

fn mint_handle(conn_id: &PeerConnId, my_info: &PeerInfo, token: u64) -> Result<ConnectHandle, TransporterError> {
    let handle = P2pHandle {
        rank: my_info.rank,
        channel: conn_id.channel.0,
        conn_index: conn_id.conn_index,
        token,
    };
    Ok(ConnectHandle::serialize_from(handle)?)
}

fn check_handle(conn_id: &PeerConnId, handle: &ConnectHandle) -> Result<P2pHandle, TransporterError> {
    let peer: P2pHandle = handle.deserialize_to()?;
    if peer.rank as usize != conn_id.peer_rank
        || peer.channel != conn_id.channel.0
        || peer.conn_index != conn_id.conn_index
    {
        return Err(anyhow!(
            "handle misrouted: expected peer {} channel {} index {}, got peer {} channel {} index {}",
            conn_id.peer_rank,
            conn_id.channel,
            conn_id.conn_index,
            peer.rank,
            peer.channel,
            peer.conn_index,
        ));
    }
    Ok(peer)
}

pub(crate) struct P2pResources {
    pub(crate) peer_rank: usize,
    pub(crate) token: u64,
}

/// Shared-memory transport: eligible when both peers live on the same host.
pub struct ShmTransporter;

impl Transporter for ShmTransporter {
    fn name(&self) -> &'static str {
        "shm"
    }

    fn can_connect(
        &self,
        send_peer: &PeerInfo,
        recv_peer: &PeerInfo,
        _profile: &CommProfile,
    ) -> bool {
        send_peer.host_hash == recv_peer.host_hash
    }

    fn send_setup(
        &self,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        _peer_info: &PeerInfo,
        _profile: &CommProfile,
    ) -> Result<TransportSetup, TransporterError> {
        // The receiver owns the segment; the sender only announces itself.
        Ok(TransportSetup {
            peer_connect_handle: mint_handle(conn_id, my_info, 0)?,
            setup_resources: None,
        })
    }

    fn send_connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        _setup_resources: Option<TransportResources>,
    ) -> Result<TransportConnect, TransporterError> {
        let peer = check_handle(conn_id, &connect_handle)?;
        Ok(TransportConnect {
            transport_resources: Box::new(P2pResources {
                peer_rank: peer.rank as usize,
                token: peer.token,
            }),
        })
    }

    fn recv_setup(
        &self,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        _peer_info: &PeerInfo,
        _profile: &CommProfile,
    ) -> Result<TransportSetup, TransporterError> {
        let key: u64 = rand::random();
        Ok(TransportSetup {
            peer_connect_handle: mint_handle(conn_id, my_info, key)?,
            setup_resources: Some(Box::new(key)),
        })
    }

    fn recv_connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<TransportResources>,
    ) -> Result<TransportConnect, TransporterError> {
        let peer = check_handle(conn_id, &connect_handle)?;
        let key = setup_resources
            .and_then(|r| r.downcast::<u64>().ok())
            .map(|k| *k)
            .ok_or_else(|| anyhow!("shm recv connect without setup resources"))?;
        Ok(TransportConnect {
            transport_resources: Box::new(P2pResources {
                peer_rank: peer.rank as usize,
                token: key,
            }),
        })
    }

    fn free(&self, resources: TransportResources) -> Result<(), TransporterError> {
        drop(resources);
        Ok(())
    }
}

/// Generic network transport, the always-eligible fallback.
pub struct NetTransporter;

impl Transporter for NetTransporter {
    fn name(&self) -> &'static str {
        "net"
    }

    fn can_connect(
        &self,
        _send_peer: &PeerInfo,
        _recv_peer: &PeerInfo,
        _profile: &CommProfile,
    ) -> bool {
        true
    }

    fn send_setup(
        &self,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        _peer_info: &PeerInfo,
        _profile: &CommProfile,
    ) -> Result<TransportSetup, TransporterError> {
        Ok(TransportSetup {
            peer_connect_handle: mint_handle(conn_id, my_info, 0)?,
            setup_resources: None,
        })
    }

    fn send_connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        _setup_resources: Option<TransportResources>,
    ) -> Result<TransportConnect, TransporterError> {
        let peer = check_handle(conn_id, &connect_handle)?;
        Ok(TransportConnect {
            transport_resources: Box::new(P2pResources {
                peer_rank: peer.rank as usize,
                token: peer.token,
            }),
        })
    }

    fn recv_setup(
        &self,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        _peer_info: &PeerInfo,
        _profile: &CommProfile,
    ) -> Result<TransportSetup, TransporterError> {
        // Token stands in for the listening endpoint the data path would
        // advertise.
        let token: u64 = rand::random();
        Ok(TransportSetup {
            peer_connect_handle: mint_handle(conn_id, my_info, token)?,
            setup_resources: Some(Box::new(token)),
        })
    }

    fn recv_connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<TransportResources>,
    ) -> Result<TransportConnect, TransporterError> {
        let peer = check_handle(conn_id, &connect_handle)?;
        let token = setup_resources
            .and_then(|r| r.downcast::<u64>().ok())
            .map(|t| *t)
            .ok_or_else(|| anyhow!("net recv connect without setup resources"))?;
        Ok(TransportConnect {
            transport_resources: Box::new(P2pResources {
                peer_rank: peer.rank as usize,
                token,
            }),
        })
    }

    fn free(&self, resources: TransportResources) -> Result<(), TransporterError> {
        drop(resources);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::tests::peer;
    use crate::transport::channel::{ChannelId, ConnType};

    fn conn(peer_rank: usize, conn_type: ConnType) -> PeerConnId {
        PeerConnId {
            peer_rank,
            channel: ChannelId(0),
            conn_index: 0,
            conn_type,
        }
    }

    #[test]
    fn shm_requires_same_host() {
        let profile = CommProfile::default();
        let a = peer(0, 0x1, 1, 0x10, 90);
        let b = peer(1, 0x1, 2, 0x20, 90);
        let c = peer(2, 0x2, 1, 0x30, 90);
        assert!(ShmTransporter.can_connect(&a, &b, &profile));
        assert!(!ShmTransporter.can_connect(&a, &c, &profile));
        assert!(NetTransporter.can_connect(&a, &c, &profile));
    }

    #[test]
    fn misrouted_handle_is_rejected() {
        let profile = CommProfile::default();
        let me = peer(0, 0x1, 1, 0x10, 90);
        let other = peer(1, 0x1, 2, 0x20, 90);
        let setup = ShmTransporter
            .recv_setup(&conn(0, ConnType::Recv), &other, &me, &profile)
            .unwrap();
        // Sender expects a handle minted by rank 1; this one is from rank 1,
        // so connecting against peer 2 must fail.
        let err = ShmTransporter.send_connect(
            &conn(2, ConnType::Send),
            setup.peer_connect_handle,
            None,
        );
        assert!(err.is_err());
    }
}
