use crate::config::ChannelAddrs;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MAX_DATAGRAM: usize = 65_536;
const MAX_FRAME: usize = 128 * 1024;
const HUB_CAPACITY: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Control,
    Backup,
    Restore,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Control, ChannelKind::Backup, ChannelKind::Restore];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Control => "control",
            ChannelKind::Backup => "backup",
            ChannelKind::Restore => "restore",
        }
    }
}

/// One group-wide datagram channel. Every peer of the group, the sender
/// included, receives what is sent.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, datagram: &[u8]) -> io::Result<()>;
    async fn recv(&self) -> io::Result<Bytes>;
}

pub struct MulticastChannel {
    socket: UdpSocket,
    group: SocketAddr,
}

impl MulticastChannel {
    pub fn join(group: SocketAddr, interface: Ipv4Addr) -> io::Result<Self> {
        let IpAddr::V4(group_ip) = group.ip() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "multicast group must be IPv4"));
        };
        if !group_ip.is_multicast() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{group_ip} is not a multicast address"),
            ));
        }
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port())).into())?;
        socket.join_multicast_v4(&group_ip, &interface)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(1)?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self { socket, group })
    }
}

#[async_trait]
impl Channel for MulticastChannel {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, self.group).await?;
        Ok(())
    }

    async fn recv(&self) -> io::Result<Bytes> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok(Bytes::from(buf))
    }
}

/// In-process stand-in for a multicast group, optionally dropping a share of
/// datagrams the way UDP does.
#[derive(Clone)]
pub struct LocalHub {
    groups: [broadcast::Sender<Bytes>; 3],
    loss: f64,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    pub fn new() -> Self {
        Self::lossy(0.0)
    }

    pub fn lossy(loss: f64) -> Self {
        Self {
            groups: std::array::from_fn(|_| broadcast::channel(HUB_CAPACITY).0),
            loss: loss.clamp(0.0, 1.0),
        }
    }

    fn group(&self, kind: ChannelKind) -> &broadcast::Sender<Bytes> {
        match kind {
            ChannelKind::Control => &self.groups[0],
            ChannelKind::Backup => &self.groups[1],
            ChannelKind::Restore => &self.groups[2],
        }
    }

    pub fn channel(&self, kind: ChannelKind) -> LocalChannel {
        let tx = self.group(kind).clone();
        let rx = Mutex::new(tx.subscribe());
        LocalChannel {
            tx,
            rx,
            loss: self.loss,
        }
    }
}

pub struct LocalChannel {
    tx: broadcast::Sender<Bytes>,
    rx: Mutex<broadcast::Receiver<Bytes>>,
    loss: f64,
}

#[async_trait]
impl Channel for LocalChannel {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        if self.loss > 0.0 && rand::thread_rng().gen_bool(self.loss) {
            return Ok(());
        }
        // No subscribers is the same as nobody listening on the group.
        let _ = self.tx.send(Bytes::copy_from_slice(datagram));
        Ok(())
    }

    async fn recv(&self) -> io::Result<Bytes> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(datagram) => return Ok(datagram),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "local channel lagged, datagrams lost");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "local hub closed"));
                }
            }
        }
    }
}

/// Handles to the three protocol channels.
#[derive(Clone)]
pub struct Channels {
    pub control: Arc<dyn Channel>,
    pub backup: Arc<dyn Channel>,
    pub restore: Arc<dyn Channel>,
}

impl Channels {
    pub fn join_multicast(addrs: &ChannelAddrs) -> io::Result<Self> {
        Ok(Self {
            control: Arc::new(MulticastChannel::join(addrs.control, addrs.interface)?),
            backup: Arc::new(MulticastChannel::join(addrs.backup, addrs.interface)?),
            restore: Arc::new(MulticastChannel::join(addrs.restore, addrs.interface)?),
        })
    }

    pub fn local(hub: &LocalHub) -> Self {
        Self {
            control: Arc::new(hub.channel(ChannelKind::Control)),
            backup: Arc::new(hub.channel(ChannelKind::Backup)),
            restore: Arc::new(hub.channel(ChannelKind::Restore)),
        }
    }

    pub fn get(&self, kind: ChannelKind) -> &Arc<dyn Channel> {
        match kind {
            ChannelKind::Control => &self.control,
            ChannelKind::Backup => &self.backup,
            ChannelKind::Restore => &self.restore,
        }
    }
}

/// TCP listener receiving length-prefixed frames from a bounded number of
/// concurrent clients. Stops accepting when dropped.
pub struct FrameListener {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl FrameListener {
    pub async fn bind(ip: IpAddr, max_clients: usize, frames: mpsc::Sender<Bytes>) -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, 0)).await?;
        let addr = listener.local_addr()?;
        let permits = Arc::new(Semaphore::new(max_clients.max(1)));
        let task = tokio::spawn(async move {
            loop {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "frame listener accept failed");
                        continue;
                    }
                };
                let frames = frames.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    match read_frame(stream).await {
                        Ok(frame) => {
                            let _ = frames.send(frame).await;
                        }
                        Err(e) => debug!(%remote, error = %e, "dropping tcp frame"),
                    }
                });
            }
        });
        Ok(Self { addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for FrameListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_frame(mut stream: TcpStream) -> io::Result<Bytes> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("frame of {len} bytes")));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

pub async fn send_frame(addr: SocketAddr, frame: &[u8], timeout: Duration) -> io::Result<()> {
    if frame.len() > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
    }
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.write_u32(frame.len() as u32).await?;
    stream.write_all(frame).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_delivers_to_every_member_including_sender() {
        let hub = LocalHub::new();
        let a = hub.channel(ChannelKind::Backup);
        let b = hub.channel(ChannelKind::Backup);
        let other = hub.channel(ChannelKind::Control);
        a.send(b"hello").await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"hello"));
        other.send(b"ctl").await.unwrap();
        assert_eq!(other.recv().await.unwrap(), Bytes::from_static(b"ctl"));
    }

    #[tokio::test]
    async fn fully_lossy_hub_drops_everything() {
        let hub = LocalHub::lossy(1.0);
        let a = hub.channel(ChannelKind::Control);
        a.send(b"gone").await.unwrap();
        let got = tokio::time::timeout(Duration::from_millis(50), a.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn frames_travel_over_tcp() {
        let (tx, mut rx) = mpsc::channel(4);
        let listener = FrameListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 2, tx).await.unwrap();
        send_frame(listener.local_addr(), b"chunk-frame", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"chunk-frame"));
    }
}
