//! Node-to-node transport.
//!
//! Messages travel over TCP as newline-delimited JSON. The first line a
//! connecting peer writes is its node id; every later line is one wire
//! message. Each peer gets a single connection with a single writer task, so
//! messages to the same peer leave in the order they were queued.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::time;

use crate::tob::{Envelope, NodeId, Outbound};

pub trait Transport: Send + Sync + 'static {
    /// Hands `data` to the network for delivery to `to`.
    ///
    /// Fails if the peer is unreachable. Nothing is retried.
    fn send(&self, to: &NodeId, data: Vec<u8>) -> impl Future<Output = io::Result<()>> + Send;
}

/// Drains `outgoing` in order, handing every message to `transport`.
pub async fn run_out_messages<T: Transport>(
    transport: T,
    mut outgoing: UnboundedReceiver<Outbound>,
) {
    while let Some(msg) = outgoing.recv().await {
        if let Err(e) = transport.send(&msg.to, msg.data).await {
            log::error!("Failed to send message to {}: {}", msg.to, e);
        }
    }
}

/// Upper bound on connecting to a peer, so an unreachable address does not
/// hold up messages to every other peer.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Reads one `\n` terminated line as raw bytes, without the terminator.
///
/// Returns `None` at end of stream. Bytes are not checked for UTF-8, so a
/// garbled line never ends the connection.
pub(crate) async fn read_raw_line<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(buf))
}

/// Connection to a single peer node
struct PeerClient {
    /// Lines queued for the writer task
    sender: UnboundedSender<Vec<u8>>,
    /// Set by the writer task once the connection is broken
    invalid: Arc<AtomicBool>,
}

impl PeerClient {
    async fn new(self_id: &NodeId, addr: &str) -> io::Result<Self> {
        let mut stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", addr))
            })??;
        stream.set_nodelay(true)?;
        let hello = format!("{}\n", self_id.as_str());
        stream.write_all(hello.as_bytes()).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let invalid = Arc::new(AtomicBool::new(false));
        let invalid_clone = invalid.clone();
        let addr = addr.to_string();
        tokio::spawn(async move {
            if let Err(e) = Self::stream_messages(stream, receiver).await {
                log::error!("Streaming messages to {} failed: {}", addr, e);
                invalid_clone.store(true, Ordering::SeqCst);
            }
        });

        Ok(Self { sender, invalid })
    }

    async fn stream_messages(
        mut stream: TcpStream,
        mut receiver: UnboundedReceiver<Vec<u8>>,
    ) -> io::Result<()> {
        while let Some(mut line) = receiver.recv().await {
            line.push(b'\n');
            stream.write_all(&line).await?;
        }
        stream.shutdown().await
    }
}

/// TCP transport to the static membership.
pub struct PeerTransport {
    self_id: NodeId,
    addrs: HashMap<NodeId, String>,
    peers: Mutex<HashMap<NodeId, PeerClient>>,
    /// Messages to the local node skip the network
    loopback: UnboundedSender<Envelope>,
}

impl PeerTransport {
    pub fn new(
        self_id: NodeId,
        addrs: HashMap<NodeId, String>,
        loopback: UnboundedSender<Envelope>,
    ) -> Self {
        PeerTransport {
            self_id,
            addrs,
            peers: Mutex::new(HashMap::new()),
            loopback,
        }
    }
}

impl Transport for PeerTransport {
    async fn send(&self, to: &NodeId, data: Vec<u8>) -> io::Result<()> {
        if *to == self.self_id {
            return self
                .loopback
                .send(Envelope {
                    from: self.self_id.clone(),
                    data,
                })
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "local mailbox closed"));
        }

        let mut peers = self.peers.lock().await;
        if peers
            .get(to)
            .is_some_and(|peer| peer.invalid.load(Ordering::SeqCst))
        {
            peers.remove(to);
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("connection to {} is broken", to),
            ));
        }

        if !peers.contains_key(to) {
            let addr = self.addrs.get(to).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("unknown node {}", to))
            })?;
            let client = PeerClient::new(&self.self_id, addr).await?;
            log::info!("connected to peer {} at {}", to, addr);
            peers.insert(to.clone(), client);
        }

        match peers.get(to) {
            Some(peer) => peer.sender.send(data).map_err(|_| {
                io::Error::new(io::ErrorKind::BrokenPipe, format!("writer for {} stopped", to))
            }),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, to.to_string())),
        }
    }
}

/// Accepts peer connections and feeds their messages into `inbox`.
pub async fn serve_peers(
    listener: TcpListener,
    members: Vec<NodeId>,
    inbox: UnboundedSender<Envelope>,
) -> io::Result<()> {
    let members = Arc::new(members);
    loop {
        let (stream, addr) = listener.accept().await?;
        let members = members.clone();
        let inbox = inbox.clone();
        tokio::spawn(async move {
            if let Err(e) = read_peer(stream, &members, inbox).await {
                log::warn!("peer connection from {} closed: {}", addr, e);
            }
        });
    }
}

async fn read_peer(
    stream: TcpStream,
    members: &[NodeId],
    inbox: UnboundedSender<Envelope>,
) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let from = match read_raw_line(&mut reader).await? {
        Some(hello) => match std::str::from_utf8(&hello) {
            Ok(hello) => NodeId::from(hello.trim()),
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "hello is not utf-8"))
            }
        },
        None => return Ok(()),
    };
    if !members.contains(&from) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("{} is not a member", from),
        ));
    }
    log::info!("peer {} connected", from);

    // Lines go to the node undecoded; a bad one is dropped there on its own.
    while let Some(line) = read_raw_line(&mut reader).await? {
        if line.is_empty() {
            continue;
        }
        let envelope = Envelope {
            from: from.clone(),
            data: line,
        };
        if inbox.send(envelope).is_err() {
            break;
        }
    }
    Ok(())
}

/// In-process transport routing straight into node mailboxes.
#[cfg(test)]
pub(crate) struct LocalTransport<F> {
    self_id: NodeId,
    inboxes: HashMap<NodeId, UnboundedSender<Envelope>>,
    deliver: F,
}

#[cfg(test)]
impl<F> LocalTransport<F>
where
    F: Fn(&NodeId, &NodeId) -> bool + Send + Sync + 'static,
{
    pub(crate) fn new(
        self_id: NodeId,
        inboxes: HashMap<NodeId, UnboundedSender<Envelope>>,
        deliver: F,
    ) -> Self {
        LocalTransport {
            self_id,
            inboxes,
            deliver,
        }
    }
}

#[cfg(test)]
impl<F> Transport for LocalTransport<F>
where
    F: Fn(&NodeId, &NodeId) -> bool + Send + Sync + 'static,
{
    async fn send(&self, to: &NodeId, data: Vec<u8>) -> io::Result<()> {
        let inbox = self
            .inboxes
            .get(to)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, to.to_string()))?;
        // A dropped message looks like a successful send to the caller.
        if (self.deliver)(&self.self_id, to) {
            let _ = inbox.send(Envelope {
                from: self.self_id.clone(),
                data,
            });
        }
        Ok(())
    }
}
