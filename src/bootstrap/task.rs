use std::net::SocketAddr;

use byteorder::{ByteOrder, LittleEndian};
use bytes::buf::{Buf, BufMut};
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::lock::Mutex;
use smol::net::{TcpListener, TcpStream};
use socket2::Socket;

use super::{BootstrapError, BootstrapSession, GroupId, PendingConn, RingConns};
use crate::utils::tcp;

const CHECK_IN_SIZE: usize = 80;
const SOCK_ADDR_SIZE: usize = 32;

/// Record each rank sends to the root service: who it is, how large it
/// believes the group is, and where it listens (one socket for the root's
/// reply, one for its ring predecessor).
struct CheckIn {
    rank: usize,
    num_ranks: usize,
    root_reply_addr: SocketAddr,
    peer_listen_addr: SocketAddr,
}

impl CheckIn {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.rank as u64);
        buf.put_u64(self.num_ranks as u64);
        tcp::encode_socket_addr(&self.root_reply_addr, buf);
        tcp::encode_socket_addr(&self.peer_listen_addr, buf);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        let rank = buf.get_u64() as usize;
        let num_ranks = buf.get_u64() as usize;
        let root_reply_addr = tcp::decode_socket_addr(buf);
        let peer_listen_addr = tcp::decode_socket_addr(buf);
        CheckIn {
            rank,
            num_ranks,
            root_reply_addr,
            peer_listen_addr,
        }
    }
}

/// Length-prefixed frame send. The receiver knows the exact expected size;
/// a mismatch is a protocol error, not a short read.
pub(crate) async fn frame_send(stream: &mut TcpStream, data: &[u8]) -> Result<(), BootstrapError> {
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, data.len() as u32);
    stream.write_all(&len).await?;
    stream.write_all(data).await?;
    Ok(())
}

pub(crate) async fn frame_recv(
    stream: &mut TcpStream,
    data: &mut [u8],
) -> Result<(), BootstrapError> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let recv_size = LittleEndian::read_u32(&len);
    if recv_size != data.len() as u32 {
        return Err(BootstrapError::FrameSizeMismatch(
            recv_size,
            data.len() as u32,
        ));
    }
    stream.read_exact(data).await?;
    Ok(())
}

/// Create the root listen socket and the group id that names it. The caller
/// runs [`root_service`] on the returned socket (typically on a detached
/// thread) and distributes the `GroupId` to every rank out-of-band.
pub fn create_group_root(listen_addr: &SocketAddr) -> Result<(Socket, GroupId), BootstrapError> {
    let socket = if listen_addr.is_ipv4() {
        Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)?
    } else {
        Socket::new(socket2::Domain::IPV6, socket2::Type::STREAM, None)?
    };
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&(*listen_addr).into())?;
    socket.set_nonblocking(true)?;

    let addr = socket
        .local_addr()?
        .as_socket()
        .expect("bound TCP socket has an inet address");
    let magic = rand::random();
    Ok((socket, GroupId { addr, magic }))
}

/// Root rendezvous: collect one check-in per rank, then tell each rank the
/// peer listen address of its ring successor. The root learns the group
/// size from the first check-in and validates every later one against it.
pub async fn root_service(listen_sock: Socket, magic: u64) -> Result<(), BootstrapError> {
    listen_sock.listen(16384)?;
    let listener: std::net::TcpListener = listen_sock.into();
    let listener = TcpListener::try_from(listener)?;

    let mut recv_buf = [0u8; CHECK_IN_SIZE];
    let mut stream = tcp::accept(&listener, magic).await?;
    frame_recv(&mut stream, recv_buf.as_mut_slice()).await?;
    let first = CheckIn::decode(&mut recv_buf.as_slice());

    let num_ranks = first.num_ranks;
    let mut peer_addrs = vec![None; num_ranks];
    let mut reply_addrs = vec![None; num_ranks];
    peer_addrs[first.rank] = Some(first.peer_listen_addr);
    reply_addrs[first.rank] = Some(first.root_reply_addr);
    let mut received = 1;
    log::trace!("bootstrap root: check-in from rank {}", first.rank);

    while received < num_ranks {
        let mut stream = tcp::accept(&listener, magic).await?;
        frame_recv(&mut stream, recv_buf.as_mut_slice()).await?;
        let info = CheckIn::decode(&mut recv_buf.as_slice());
        if info.num_ranks != num_ranks {
            return Err(BootstrapError::GroupSizeMismatch(info.num_ranks, num_ranks));
        }
        if info.rank >= num_ranks {
            return Err(BootstrapError::RankOutOfRange(info.rank));
        }
        if peer_addrs[info.rank].is_some() {
            return Err(BootstrapError::DuplicateCheckIn(info.rank));
        }
        peer_addrs[info.rank] = Some(info.peer_listen_addr);
        reply_addrs[info.rank] = Some(info.root_reply_addr);
        received += 1;
        log::trace!("bootstrap root: check-in from rank {}", info.rank);
    }

    let mut send_buf = [0u8; SOCK_ADDR_SIZE];
    for r in 0..num_ranks {
        let next = (r + 1) % num_ranks;
        let reply_addr = reply_addrs[r].as_ref().unwrap();
        let mut stream = tcp::connect(reply_addr, magic).await?;
        let mut buf = send_buf.as_mut();
        tcp::encode_socket_addr(peer_addrs[next].as_ref().unwrap(), &mut buf);
        frame_send(&mut stream, send_buf.as_slice()).await?;
    }
    log::trace!("bootstrap root: all {} successor addresses sent", num_ranks);
    Ok(())
}

async fn ring_all_gather(
    ring_send: &mut TcpStream,
    ring_recv: &mut TcpStream,
    rank: usize,
    num_ranks: usize,
    data: &mut [u8],
) -> Result<(), BootstrapError> {
    assert_eq!(data.len() % num_ranks, 0);
    let size = data.len() / num_ranks;
    // Classic ring AllGather: in step i, forward the slice received in step
    // i-1 (initially our own) and receive one slice from the left.
    for i in 0..(num_ranks - 1) {
        let send_idx = (rank + num_ranks - i) % num_ranks;
        let recv_idx = (rank + num_ranks - i - 1) % num_ranks;
        frame_send(ring_send, &data[send_idx * size..(send_idx + 1) * size]).await?;
        frame_recv(ring_recv, &mut data[recv_idx * size..(recv_idx + 1) * size]).await?;
    }
    Ok(())
}

impl BootstrapSession {
    /// Check in with the root, learn the ring successor, connect the ring,
    /// and AllGather every rank's peer listen address so tagged
    /// point-to-point send/recv can connect directly from then on.
    pub async fn init(
        id: &GroupId,
        listen_addr: SocketAddr,
        rank: usize,
        num_ranks: usize,
    ) -> Result<BootstrapSession, BootstrapError> {
        let mut listen_addr = listen_addr;
        listen_addr.set_port(0);

        let peer_listener = tcp::listen(&listen_addr)?;
        let peer_listen_addr = peer_listener.local_addr()?;
        let reply_listener = tcp::listen(&listen_addr)?;
        let reply_listen_addr = reply_listener.local_addr()?;

        if num_ranks > 128 {
            // Stagger root connections in large groups so the root's accept
            // queue is not hammered all at once.
            smol::Timer::after(std::time::Duration::from_millis(rank as u64)).await;
        }

        log::trace!(
            "rank {} of {} checking in with root {:?}",
            rank,
            num_ranks,
            id.addr
        );
        let mut stream = tcp::connect(&id.addr, id.magic).await?;
        let check_in = CheckIn {
            rank,
            num_ranks,
            root_reply_addr: reply_listen_addr,
            peer_listen_addr,
        };
        let mut send_buf = [0u8; CHECK_IN_SIZE];
        let mut buf = send_buf.as_mut();
        check_in.encode(&mut buf);
        frame_send(&mut stream, send_buf.as_slice()).await?;

        // Root replies with the ring successor's listen address.
        let mut stream = tcp::accept(&reply_listener, id.magic).await?;
        let mut recv_buf = [0u8; SOCK_ADDR_SIZE];
        frame_recv(&mut stream, recv_buf.as_mut_slice()).await?;
        let next_addr = tcp::decode_socket_addr(&mut recv_buf.as_slice());

        let mut ring_send = tcp::connect(&next_addr, id.magic).await?;
        let mut ring_recv = tcp::accept(&peer_listener, id.magic).await?;

        let mut all_addrs = vec![0u8; SOCK_ADDR_SIZE * num_ranks];
        let mut my_slot = &mut all_addrs[rank * SOCK_ADDR_SIZE..(rank + 1) * SOCK_ADDR_SIZE];
        tcp::encode_socket_addr(&peer_listen_addr, &mut my_slot);
        ring_all_gather(
            &mut ring_send,
            &mut ring_recv,
            rank,
            num_ranks,
            all_addrs.as_mut_slice(),
        )
        .await?;

        let peer_addrs = (0..num_ranks)
            .map(|i| {
                let mut buf = &all_addrs[i * SOCK_ADDR_SIZE..(i + 1) * SOCK_ADDR_SIZE];
                tcp::decode_socket_addr(&mut buf)
            })
            .collect();

        log::trace!("rank {} of {} bootstrap session ready", rank, num_ranks);
        Ok(BootstrapSession {
            listener: peer_listener,
            ring: Mutex::new(RingConns {
                send: ring_send,
                recv: ring_recv,
            }),
            peer_addrs,
            pending: Mutex::new(Vec::new()),
            rank,
            num_ranks,
            magic: id.magic,
        })
    }

    fn pending_park(&self, peer: usize, tag: u32, stream: TcpStream) -> Result<(), BootstrapError> {
        let mut pending = self.pending.try_lock().ok_or(BootstrapError::SessionBusy)?;
        pending.push(PendingConn { peer, tag, stream });
        Ok(())
    }

    fn pending_take(&self, peer: usize, tag: u32) -> Result<Option<TcpStream>, BootstrapError> {
        let mut pending = self.pending.try_lock().ok_or(BootstrapError::SessionBusy)?;
        let idx = pending.iter().position(|c| c.peer == peer && c.tag == tag);
        Ok(idx.map(|idx| pending.swap_remove(idx).stream))
    }

    /// Tagged point-to-point send. Opens a fresh connection per message; the
    /// header carries (sender rank, tag) so the receiver can demultiplex.
    pub async fn send(&self, peer: usize, tag: u32, data: &[u8]) -> Result<(), BootstrapError> {
        log::trace!(
            "bootstrap rank {} send to {} ({:?}) tag {:#x}",
            self.rank,
            peer,
            self.peer_addrs[peer],
            tag
        );
        let mut stream = tcp::connect(&self.peer_addrs[peer], self.magic).await?;
        let mut header = [0u8; 12];
        LittleEndian::write_u64(&mut header[0..8], self.rank as u64);
        LittleEndian::write_u32(&mut header[8..12], tag);
        stream.write_all(&header).await?;
        frame_send(&mut stream, data).await?;
        Ok(())
    }

    /// Tagged point-to-point recv, blocking until the matching (peer, tag)
    /// message arrives. Mismatched connections are parked for later calls.
    pub async fn recv(
        &self,
        peer: usize,
        tag: u32,
        recv_buf: &mut [u8],
    ) -> Result<(), BootstrapError> {
        if let Some(mut stream) = self.pending_take(peer, tag)? {
            frame_recv(&mut stream, recv_buf).await?;
            return Ok(());
        }
        loop {
            let mut stream = tcp::accept(&self.listener, self.magic).await?;
            let mut header = [0u8; 12];
            stream.read_exact(&mut header).await?;
            let recv_peer = LittleEndian::read_u64(&header[0..8]) as usize;
            let recv_tag = LittleEndian::read_u32(&header[8..12]);
            if recv_peer == peer && recv_tag == tag {
                frame_recv(&mut stream, recv_buf).await?;
                return Ok(());
            }
            self.pending_park(recv_peer, recv_tag, stream)?;
        }
    }

    /// Ring AllGather of one fixed-size record per rank. `record` is this
    /// rank's slice; the result holds all ranks' slices in rank order.
    pub async fn all_gather(&self, record: &[u8]) -> Result<Vec<u8>, BootstrapError> {
        let size = record.len();
        let mut data = vec![0u8; size * self.num_ranks];
        data[self.rank * size..(self.rank + 1) * size].copy_from_slice(record);

        let mut ring = self.ring.try_lock().ok_or(BootstrapError::SessionBusy)?;
        let RingConns { send, recv } = &mut *ring;
        ring_all_gather(send, recv, self.rank, self.num_ranks, data.as_mut_slice()).await?;
        log::trace!(
            "bootstrap AllGather done: rank {} of {}, record size {}",
            self.rank,
            self.num_ranks,
            size
        );
        Ok(data)
    }

    /// Dissemination barrier over tagged send/recv (log2 rounds).
    pub async fn barrier(&self, tag: u32) -> Result<(), BootstrapError> {
        let num_ranks = self.num_ranks;
        if num_ranks == 1 {
            return Ok(());
        }
        let mut data = [0u8; 1];
        let mut mask = 1;
        while mask < num_ranks {
            let src = (self.rank + num_ranks - mask) % num_ranks;
            let dst = (self.rank + mask) % num_ranks;
            self.send(dst, tag, data.as_slice()).await?;
            self.recv(src, tag, data.as_mut_slice()).await?;
            mask <<= 1;
        }
        Ok(())
    }
}
