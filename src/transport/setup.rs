//! Connect-phase driver: registers ring/tree edges as (peer, channel,
//! direction) connections, runs transport setup, exchanges the resulting
//! handles peer-to-peer over the bootstrap channel, then completes the
//! connects. One phase per logical graph, identified by its tag.

use std::collections::{HashMap, VecDeque};
use std::io::Write;

use thiserror::Error;

use super::channel::{ChannelId, ConnType, PeerConnId, PeerConnector};
use super::connector::{
    ConnectHandle, ConnectHandleError, Transporter, TransportResources, TransporterError,
    CONNECT_HANDLE_SIZE,
};
use super::ALL_TRANSPORTERS;
use crate::bootstrap::{BootstrapError, BootstrapSession};
use crate::comm::{profile::CommProfile, PeerInfo};

#[derive(Debug, Error)]
pub enum TransportConnectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transporter error: {0}")]
    Transporter(#[from] TransporterError),
    #[error("Connect handle error: {0}")]
    Handle(#[from] ConnectHandleError),
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("No transport found for rank {0} -> rank {1}")]
    NoTransportFound(usize, usize),
    #[error("Connection {0:?} not found")]
    ConnectionNotFound(PeerConnId),
    #[error("Connection index mismatch: {0} vs {1}")]
    ConnIndexMismatch(u32, u32),
}

pub(crate) fn select_transport(
    send_peer: &PeerInfo,
    recv_peer: &PeerInfo,
    profile: &CommProfile,
) -> Result<&'static dyn Transporter, TransportConnectError> {
    for transporter in ALL_TRANSPORTERS.iter() {
        if transporter.can_connect(send_peer, recv_peer, profile) {
            return Ok(*transporter);
        }
    }
    Err(TransportConnectError::NoTransportFound(
        send_peer.rank as usize,
        recv_peer.rank as usize,
    ))
}

pub struct TransportConnectState {
    pub rank: usize,
    pub num_ranks: usize,
    pub num_channels: usize,
    conn_index: Option<u32>,
    // bitmask over channels, per peer rank
    recv_connect_mask: Vec<u64>,
    send_connect_mask: Vec<u64>,
}

impl TransportConnectState {
    pub fn new(rank: usize, num_ranks: usize, num_channels: usize) -> Self {
        TransportConnectState {
            rank,
            num_ranks,
            num_channels,
            conn_index: None,
            recv_connect_mask: vec![0; num_ranks],
            send_connect_mask: vec![0; num_ranks],
        }
    }

    /// Record an edge to connect in this phase. All edges of a phase must
    /// share one connection index.
    pub fn register_connect(&mut self, conn_id: &PeerConnId) -> Result<(), TransportConnectError> {
        if let Some(conn_index) = self.conn_index {
            if conn_index != conn_id.conn_index {
                return Err(TransportConnectError::ConnIndexMismatch(
                    conn_index,
                    conn_id.conn_index,
                ));
            }
        } else {
            self.conn_index = Some(conn_id.conn_index);
        }
        match conn_id.conn_type {
            ConnType::Send => {
                self.send_connect_mask[conn_id.peer_rank] |= 1u64 << conn_id.channel.0;
            }
            ConnType::Recv => {
                self.recv_connect_mask[conn_id.peer_rank] |= 1u64 << conn_id.channel.0;
            }
        }
        Ok(())
    }

    fn registered_conns(&self) -> Vec<PeerConnId> {
        // Round order: in round i we talk to recv peer (rank - i) and send
        // peer (rank + i); the exchange walks rounds in the same order.
        let conn_index = match self.conn_index {
            Some(idx) => idx,
            None => return Vec::new(),
        };
        let mut conns = Vec::new();
        for i in 1..self.num_ranks {
            let recv_peer = (self.rank + self.num_ranks - i) % self.num_ranks;
            let send_peer = (self.rank + i) % self.num_ranks;
            for c in 0..self.num_channels as u32 {
                if self.recv_connect_mask[recv_peer] & (1u64 << c) > 0 {
                    conns.push(PeerConnId {
                        peer_rank: recv_peer,
                        channel: ChannelId(c),
                        conn_index,
                        conn_type: ConnType::Recv,
                    });
                }
                if self.send_connect_mask[send_peer] & (1u64 << c) > 0 {
                    conns.push(PeerConnId {
                        peer_rank: send_peer,
                        channel: ChannelId(c),
                        conn_index,
                        conn_type: ConnType::Send,
                    });
                }
            }
        }
        conns
    }

    /// Run the whole phase: setup every registered edge, exchange handles,
    /// connect. Returns the connected edges; the masks reset afterwards so
    /// the state can drive the next graph.
    pub async fn connect_peers(
        &mut self,
        session: &BootstrapSession,
        peers_info: &[PeerInfo],
        profile: &CommProfile,
        graph_tag: u8,
    ) -> Result<HashMap<PeerConnId, PeerConnector>, TransportConnectError> {
        let mut rounds: VecDeque<HashMap<PeerConnId, ConnectHandle>> = VecDeque::new();
        rounds.resize_with(self.num_ranks.saturating_sub(1), HashMap::new);
        let mut constructors: HashMap<
            PeerConnId,
            (&'static dyn Transporter, Option<TransportResources>),
        > = HashMap::new();

        for conn_id in self.registered_conns() {
            let (setup, transporter) = match conn_id.conn_type {
                ConnType::Send => {
                    let transporter = select_transport(
                        &peers_info[self.rank],
                        &peers_info[conn_id.peer_rank],
                        profile,
                    )?;
                    let setup = transporter.send_setup(
                        &conn_id,
                        &peers_info[self.rank],
                        &peers_info[conn_id.peer_rank],
                        profile,
                    )?;
                    (setup, transporter)
                }
                ConnType::Recv => {
                    let transporter = select_transport(
                        &peers_info[conn_id.peer_rank],
                        &peers_info[self.rank],
                        profile,
                    )?;
                    let setup = transporter.recv_setup(
                        &conn_id,
                        &peers_info[self.rank],
                        &peers_info[conn_id.peer_rank],
                        profile,
                    )?;
                    (setup, transporter)
                }
            };
            let round_idx = match conn_id.conn_type {
                ConnType::Send => {
                    (self.num_ranks + conn_id.peer_rank - self.rank) % self.num_ranks
                }
                ConnType::Recv => {
                    (self.num_ranks + self.rank - conn_id.peer_rank) % self.num_ranks
                }
            } - 1;
            rounds[round_idx].insert(conn_id, setup.peer_connect_handle);
            constructors.insert(conn_id, (transporter, setup.setup_resources));
        }

        let peer_handles = self.exchange_connect_handles(session, graph_tag, rounds).await?;

        let mut connected = HashMap::new();
        for (conn_id, peer_handle) in peer_handles {
            let (transporter, setup_resources) = constructors
                .remove(&conn_id)
                .ok_or(TransportConnectError::ConnectionNotFound(conn_id))?;
            let connect = match conn_id.conn_type {
                ConnType::Send => {
                    transporter.send_connect(&conn_id, peer_handle, setup_resources)?
                }
                ConnType::Recv => {
                    transporter.recv_connect(&conn_id, peer_handle, setup_resources)?
                }
            };
            connected.insert(
                conn_id,
                PeerConnector {
                    transporter,
                    resources: connect.transport_resources,
                },
            );
        }
        log::trace!(
            "rank {} of {}: connected {} edges for graph tag {:#x}",
            self.rank,
            self.num_ranks,
            connected.len(),
            graph_tag
        );

        self.conn_index = None;
        self.recv_connect_mask.iter_mut().for_each(|m| *m = 0);
        self.send_connect_mask.iter_mut().for_each(|m| *m = 0);
        Ok(connected)
    }

    // Exchange connection handles with send/recv peers. At each round,
    // exchange handles with recv peer (rank - i) and send peer (rank + i);
    // handles received from peers are returned.
    async fn exchange_connect_handles(
        &self,
        session: &BootstrapSession,
        graph_tag: u8,
        mut rounds: VecDeque<HashMap<PeerConnId, ConnectHandle>>,
    ) -> Result<HashMap<PeerConnId, ConnectHandle>, TransportConnectError> {
        let rank = self.rank;
        let num_ranks = self.num_ranks;
        let conn_index = match self.conn_index {
            Some(idx) => idx,
            None => return Ok(HashMap::new()),
        };

        let mut all_peer_handles = HashMap::new();
        for i in 1..num_ranks {
            let bootstrap_tag = ((i as u32) << 8) + graph_tag as u32;
            let mut round_handles = rounds.pop_front().unwrap();

            let recv_peer = (rank + num_ranks - i) % num_ranks;
            let send_peer = (rank + i) % num_ranks;
            let recv_mask = self.recv_connect_mask[recv_peer];
            let send_mask = self.send_connect_mask[send_peer];

            let mut recv_handles = Vec::new();
            let mut send_handles = Vec::new();
            for c in 0..self.num_channels as u32 {
                if recv_mask & (1u64 << c) > 0 {
                    let conn_id = PeerConnId {
                        peer_rank: recv_peer,
                        conn_type: ConnType::Recv,
                        channel: ChannelId(c),
                        conn_index,
                    };
                    let handle = round_handles
                        .remove(&conn_id)
                        .ok_or(TransportConnectError::ConnectionNotFound(conn_id))?;
                    recv_handles.push(handle);
                }
                if send_mask & (1u64 << c) > 0 {
                    let conn_id = PeerConnId {
                        peer_rank: send_peer,
                        conn_type: ConnType::Send,
                        channel: ChannelId(c),
                        conn_index,
                    };
                    let handle = round_handles
                        .remove(&conn_id)
                        .ok_or(TransportConnectError::ConnectionNotFound(conn_id))?;
                    send_handles.push(handle);
                }
            }
            let recv_channels = recv_handles.len();
            let send_channels = send_handles.len();

            let (mut peer_recv_handles, mut peer_send_handles) = if send_peer == recv_peer {
                // One peer serves both directions this round: a single
                // paired message each way, recv handles first.
                let mut send_data = Vec::new();
                for handle in recv_handles.into_iter().chain(send_handles) {
                    send_data.write_all(handle.0.as_slice())?;
                }
                session
                    .send(recv_peer, bootstrap_tag, send_data.as_slice())
                    .await?;
                let mut recv_data =
                    vec![0u8; CONNECT_HANDLE_SIZE * (recv_channels + send_channels)];
                session
                    .recv(recv_peer, bootstrap_tag, recv_data.as_mut_slice())
                    .await?;

                // The peer's recv handles pair with our send connections.
                let mut peer_send_handles = Vec::new();
                let mut peer_recv_handles = Vec::new();
                for idx in 0..send_channels {
                    let data =
                        &recv_data[idx * CONNECT_HANDLE_SIZE..(idx + 1) * CONNECT_HANDLE_SIZE];
                    peer_send_handles.push(ConnectHandle(data.try_into().unwrap()));
                }
                for idx in send_channels..(send_channels + recv_channels) {
                    let data =
                        &recv_data[idx * CONNECT_HANDLE_SIZE..(idx + 1) * CONNECT_HANDLE_SIZE];
                    peer_recv_handles.push(ConnectHandle(data.try_into().unwrap()));
                }
                (peer_recv_handles, peer_send_handles)
            } else {
                let mut data_for_recv_peer = Vec::new();
                for handle in recv_handles.into_iter() {
                    data_for_recv_peer.write_all(handle.0.as_slice())?;
                }
                let mut data_for_send_peer = Vec::new();
                for handle in send_handles.into_iter() {
                    data_for_send_peer.write_all(handle.0.as_slice())?;
                }
                session
                    .send(recv_peer, bootstrap_tag, data_for_recv_peer.as_slice())
                    .await?;
                session
                    .send(send_peer, bootstrap_tag, data_for_send_peer.as_slice())
                    .await?;

                let mut from_send_peer = vec![0u8; CONNECT_HANDLE_SIZE * send_channels];
                let mut from_recv_peer = vec![0u8; CONNECT_HANDLE_SIZE * recv_channels];
                session
                    .recv(send_peer, bootstrap_tag, from_send_peer.as_mut_slice())
                    .await?;
                session
                    .recv(recv_peer, bootstrap_tag, from_recv_peer.as_mut_slice())
                    .await?;

                let mut peer_recv_handles = Vec::new();
                let mut peer_send_handles = Vec::new();
                for idx in 0..recv_channels {
                    let data =
                        &from_recv_peer[idx * CONNECT_HANDLE_SIZE..(idx + 1) * CONNECT_HANDLE_SIZE];
                    peer_recv_handles.push(ConnectHandle(data.try_into().unwrap()));
                }
                for idx in 0..send_channels {
                    let data =
                        &from_send_peer[idx * CONNECT_HANDLE_SIZE..(idx + 1) * CONNECT_HANDLE_SIZE];
                    peer_send_handles.push(ConnectHandle(data.try_into().unwrap()));
                }
                (peer_recv_handles, peer_send_handles)
            };

            for c in 0..self.num_channels as u32 {
                if recv_mask & (1u64 << c) > 0 {
                    let conn_id = PeerConnId {
                        peer_rank: recv_peer,
                        conn_type: ConnType::Recv,
                        channel: ChannelId(c),
                        conn_index,
                    };
                    all_peer_handles.insert(conn_id, peer_recv_handles.remove(0));
                }
                if send_mask & (1u64 << c) > 0 {
                    let conn_id = PeerConnId {
                        peer_rank: send_peer,
                        conn_type: ConnType::Send,
                        channel: ChannelId(c),
                        conn_index,
                    };
                    all_peer_handles.insert(conn_id, peer_send_handles.remove(0));
                }
            }
        }
        log::trace!(
            "rank {} of {} completed handle exchange for tag {:#x}",
            rank,
            num_ranks,
            graph_tag
        );
        Ok(all_peer_handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{create_group_root, root_service, BootstrapSession, GroupId};
    use crate::transport::p2p::P2pResources;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn init_sessions(num_ranks: usize) -> Vec<Arc<BootstrapSession>> {
        let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (socket, id) = create_group_root(&listen_addr).unwrap();
        let magic = id.magic;
        std::thread::spawn(move || {
            smol::block_on(root_service(socket, magic)).unwrap();
        });
        let handles: Vec<_> = (0..num_ranks)
            .map(|rank| {
                std::thread::spawn(move || {
                    let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
                    smol::block_on(BootstrapSession::init(&id, listen_addr, rank, num_ranks))
                        .map(Arc::new)
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn ring_conn(peer_rank: usize, channel: u32, conn_type: ConnType) -> PeerConnId {
        PeerConnId {
            peer_rank,
            channel: ChannelId(channel),
            conn_index: 0,
            conn_type,
        }
    }

    #[test]
    fn ring_edges_connect_on_all_ranks() {
        let num_ranks = 3;
        let num_channels = 2;
        let sessions = init_sessions(num_ranks);
        let peers_info: Vec<_> = (0..num_ranks)
            .map(|r| crate::rendezvous::tests::peer(r, 0x1, r as u64, 0x10 + r as u64, 90))
            .collect();

        let handles: Vec<_> = sessions
            .into_iter()
            .enumerate()
            .map(|(rank, session)| {
                let peers_info = peers_info.clone();
                std::thread::spawn(move || {
                    let profile = CommProfile::default();
                    let mut state = TransportConnectState::new(rank, num_ranks, num_channels);
                    let prev = (rank + num_ranks - 1) % num_ranks;
                    let next = (rank + 1) % num_ranks;
                    for c in 0..num_channels as u32 {
                        state.register_connect(&ring_conn(prev, c, ConnType::Recv)).unwrap();
                        state.register_connect(&ring_conn(next, c, ConnType::Send)).unwrap();
                    }
                    let connected = smol::block_on(state.connect_peers(
                        &session,
                        &peers_info,
                        &profile,
                        crate::transport::RING_GRAPH_TAG,
                    ))
                    .unwrap();
                    (rank, prev, next, connected)
                })
            })
            .collect();

        for h in handles {
            let (_rank, prev, next, connected) = h.join().unwrap();
            assert_eq!(connected.len(), 2 * num_channels);
            for c in 0..num_channels as u32 {
                let recv = connected.get(&ring_conn(prev, c, ConnType::Recv)).unwrap();
                let send = connected.get(&ring_conn(next, c, ConnType::Send)).unwrap();
                let recv_res = recv.resources.downcast_ref::<P2pResources>().unwrap();
                let send_res = send.resources.downcast_ref::<P2pResources>().unwrap();
                assert_eq!(recv_res.peer_rank, prev);
                assert_eq!(send_res.peer_rank, next);
            }
        }
    }
}
