//! Peer-to-peer transport for raft messages.
//!
//! Frames are length-prefixed:
//! - 4 bytes: payload length (big-endian u32)
//! - N bytes: payload
//!
//! Every outbound connection starts with one bincode [`Hello`] frame naming
//! the sender, followed by protobuf-encoded raft `Message` frames. The hello
//! lets a node that has not yet seen the membership log (a joiner) learn
//! where to answer its leader.
//!
//! Outbound traffic to each peer runs on its own thread holding a persistent
//! connection, fed through a bounded queue. Raft tolerates message loss, so a
//! full queue or a broken connection just drops frames; the connection is
//! re-established on the next frame.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use prost::Message as ProstMessage;
use raft::prelude::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const PEER_QUEUE_DEPTH: usize = 1024;
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub node_id: u64,
    pub raft_address: String,
}

/// Traffic delivered to the raft worker.
#[derive(Debug)]
pub enum Inbound {
    Hello(Hello),
    Message(Message),
}

/// Accepts peer connections and forwards decoded frames to the worker.
pub struct Listener {
    local_addr: SocketAddr,
    stopped: Arc<AtomicBool>,
}

impl Listener {
    /// Binds synchronously so address conflicts surface to the caller, then
    /// accepts on a background thread.
    pub fn bind(addr: &str, tx: Sender<Inbound>) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind raft address {addr}"))?;
        let local_addr = listener.local_addr()?;
        let stopped = Arc::new(AtomicBool::new(false));

        let flag = stopped.clone();
        thread::Builder::new()
            .name(format!("raft-net-listener-{local_addr}"))
            .spawn(move || accept_loop(listener, tx, flag))
            .context("failed to spawn network listener")?;

        Ok(Self {
            local_addr,
            stopped,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and releases the port.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            // Wake the blocking accept so it observes the flag.
            let _ = TcpStream::connect_timeout(&self.local_addr, CONNECT_TIMEOUT);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, tx: Sender<Inbound>, stopped: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let tx = tx.clone();
                let spawned = thread::Builder::new()
                    .name("raft-net-conn".into())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, tx) {
                            debug!(error = %err, "peer connection closed");
                        }
                    });
                if let Err(err) = spawned {
                    warn!(error = %err, "failed to spawn connection handler");
                }
            }
            Err(err) => warn!(error = %err, "accept error"),
        }
    }
    debug!("raft listener stopped");
}

/// Reads frames until the peer hangs up or the worker goes away.
fn handle_connection(mut stream: TcpStream, tx: Sender<Inbound>) -> Result<()> {
    let Some(frame) = read_frame(&mut stream)? else {
        return Ok(());
    };
    let hello: Hello = bincode::deserialize(&frame).context("malformed hello frame")?;
    tx.send(Inbound::Hello(hello))
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))?;

    while let Some(frame) = read_frame(&mut stream)? {
        let msg = Message::decode(&frame[..]).context("malformed raft message")?;
        tx.send(Inbound::Message(msg))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))?;
    }
    Ok(())
}

/// Returns `None` on a clean end of stream.
fn read_frame(stream: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn write_frame(stream: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(bytes)?;
    stream.flush()
}

struct PeerLink {
    address: String,
    frames: Sender<Vec<u8>>,
}

/// Outbound side: one persistent connection per peer.
pub struct Transport {
    hello: Vec<u8>,
    links: HashMap<u64, PeerLink>,
}

impl Transport {
    pub fn new(node_id: u64, raft_address: String) -> Result<Self> {
        let hello = bincode::serialize(&Hello {
            node_id,
            raft_address,
        })
        .context("encode hello failed")?;
        Ok(Self {
            hello,
            links: HashMap::new(),
        })
    }

    /// Queues a message for `to` at `address`. Never blocks.
    pub fn send(&mut self, to: u64, address: &str, msg: &Message) {
        let stale = self
            .links
            .get(&to)
            .map_or(true, |link| link.address != address);
        if stale {
            match self.connect(to, address) {
                Ok(link) => {
                    self.links.insert(to, link);
                }
                Err(err) => {
                    warn!(peer = to, %address, error = %err, "failed to start peer link");
                    return;
                }
            }
        }

        let Some(link) = self.links.get(&to) else {
            return;
        };
        match link.frames.try_send(msg.encode_to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(peer = to, "peer queue full, dropping message");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.links.remove(&to);
            }
        }
    }

    /// Forgets a peer; its connection thread exits once the queue drains.
    pub fn disconnect(&mut self, id: u64) {
        self.links.remove(&id);
    }

    fn connect(&self, to: u64, address: &str) -> Result<PeerLink> {
        let (frames, rx) = bounded(PEER_QUEUE_DEPTH);
        let hello = self.hello.clone();
        let target = address.to_string();
        thread::Builder::new()
            .name(format!("raft-peer-{to}"))
            .spawn(move || peer_loop(to, target, hello, rx))
            .context("failed to spawn peer connection thread")?;
        Ok(PeerLink {
            address: address.to_string(),
            frames,
        })
    }
}

fn peer_loop(to: u64, address: String, hello: Vec<u8>, rx: Receiver<Vec<u8>>) {
    let mut stream: Option<TcpStream> = None;
    for frame in rx {
        if stream.is_none() {
            match open(&address, &hello) {
                Ok(opened) => stream = Some(opened),
                Err(err) => {
                    debug!(peer = to, %address, error = %err, "peer unreachable, dropping message");
                    continue;
                }
            }
        }
        if let Some(conn) = stream.as_mut() {
            if let Err(err) = write_frame(conn, &frame) {
                debug!(peer = to, %address, error = %err, "peer connection lost");
                stream = None;
            }
        }
    }
}

fn open(address: &str, hello: &[u8]) -> Result<TcpStream> {
    let addr = address
        .to_socket_addrs()?
        .next()
        .with_context(|| format!("{address} did not resolve"))?;
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    write_frame(&mut stream, hello)?;
    Ok(stream)
}
