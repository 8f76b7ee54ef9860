//! TCP channels.
//!
//! [`TcpChannel`] is the client end: async sends only, since a network
//! round trip cannot block the calling turn. [`TcpChannelServer`] accepts
//! many clients and cannot originate sends itself; every inbound message is
//! delivered with a per-connection reply channel, which the service uses for
//! replies and for calling that client's callbacks.
//!
//! # Thread Safety
//!
//! Each connection runs a reader task and a writer task on the tokio
//! runtime. Sends are queued on an unbounded channel to the writer task, so
//! `send_async` never blocks.

use super::frame::{decode_payload, encode_payload, read_frame, write_frame};
use crate::channel::{Channel, MessageHandler};
use crate::config::TransportConfig;
use crate::error::{Result, TetherError};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

type Outbox = mpsc::UnboundedSender<Vec<u8>>;

fn runtime() -> Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current()
        .map_err(|_| TetherError::Unsupported("TCP delivery outside a tokio runtime"))
}

fn queue(outbox: &Outbox, message: &JsonValue) -> Result<()> {
    let payload = encode_payload(message)?;
    outbox.send(payload).map_err(|_| TetherError::ChannelClosed)
}

/// Drain queued payloads onto the socket until every sender is gone.
fn spawn_writer(peer: SocketAddr, mut writer: OwnedWriteHalf) -> (Outbox, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &payload).await {
                debug!("Write to {} failed: {}", peer, e);
                break;
            }
        }
    });
    (tx, task)
}

/// Read frames and hand each message to `handler` until EOF.
async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    handler: &MessageHandler,
    reply_to: Option<Arc<dyn Channel>>,
    peer: SocketAddr,
) -> Result<()> {
    while let Some(frame) = read_frame(reader).await? {
        let message = match decode_payload(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping frame from {}: {}", peer, e);
                continue;
            }
        };
        if let Some(reply) = handler(message, reply_to.clone()) {
            match &reply_to {
                Some(channel) => channel.send_async(reply)?,
                None => debug!("Dropping sync reply on an async-only connection"),
            }
        }
    }
    Ok(())
}

// ============================================================================
// Client
// ============================================================================

/// Client end of a TCP connection.
pub struct TcpChannel {
    peer: SocketAddr,
    outbox: Outbox,
    reader: Mutex<Option<OwnedReadHalf>>,
}

impl TcpChannel {
    /// Connect to a [`TcpChannelServer`].
    ///
    /// Uses [`TransportConfig::CONNECT_TIMEOUT`].
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(TransportConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TetherError::Io {
                message: format!("Timed out connecting to {}", addr),
                source: None,
            })??;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", addr);

        let (reader, writer) = stream.into_split();
        let (outbox, _writer_task) = spawn_writer(addr, writer);

        Ok(Self {
            peer: addr,
            outbox,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Channel for TcpChannel {
    fn supports_async(&self) -> bool {
        true
    }

    fn send_async(&self, message: JsonValue) -> Result<()> {
        queue(&self.outbox, &message)
    }

    fn receive(&self, handler: MessageHandler) -> Result<()> {
        let mut reader = self.reader.lock().take().ok_or_else(|| {
            TetherError::protocol("TCP channel already has a receiver")
        })?;
        let peer = self.peer;
        runtime()?.spawn(async move {
            match read_loop(&mut reader, &handler, None, peer).await {
                Ok(()) => info!("Connection to {} closed", peer),
                Err(e) => warn!("Connection to {} failed: {}", peer, e),
            }
        });
        Ok(())
    }
}

// ============================================================================
// Server
// ============================================================================

/// Reply channel for one accepted connection.
struct ConnectionChannel {
    outbox: Outbox,
}

impl Channel for ConnectionChannel {
    fn supports_async(&self) -> bool {
        true
    }

    fn send_async(&self, message: JsonValue) -> Result<()> {
        queue(&self.outbox, &message)
    }
}

/// Holds one of the [`TransportConfig::MAX_CONNECTIONS`] connection slots
/// until dropped.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < TransportConfig::MAX_CONNECTIONS).then_some(open + 1)
            })
            .ok()
            .map(|_| ConnectionSlot(active.clone()))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Server end accepting many clients. Dropping shuts it down.
pub struct TcpChannelServer {
    addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    /// Flipped to true once; the accept task and every connection watch it.
    closing: watch::Sender<bool>,
    active: Arc<AtomicUsize>,
}

impl TcpChannelServer {
    /// Bind to `addr`. Accepting starts when a receiver is registered.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("Listening on {}", addr);

        Ok(Self {
            addr,
            listener: Mutex::new(Some(listener)),
            closing: watch::channel(false).0,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The bound address, with the OS-assigned port if port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        if !self.closing.send_replace(true) {
            debug!("Shutting down TCP server on {}", self.addr);
        }
    }
}

async fn accept_clients(
    listener: TcpListener,
    handler: MessageHandler,
    mut closing: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
) {
    loop {
        let closed = *closing.borrow_and_update();
        if closed {
            break;
        }
        let (stream, peer) = tokio::select! {
            changed = closing.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    continue;
                }
            },
        };
        let Some(slot) = ConnectionSlot::acquire(&active) else {
            warn!(
                "Refusing {}: {} connections already open",
                peer,
                TransportConfig::MAX_CONNECTIONS
            );
            continue;
        };
        tokio::spawn(serve_client(stream, peer, handler.clone(), closing.clone(), slot));
    }
    info!("TCP server stopped accepting");
}

/// Run one client connection until it closes or the server shuts down.
async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    handler: MessageHandler,
    mut closing: watch::Receiver<bool>,
    _slot: ConnectionSlot,
) {
    debug!("Accepted {}", peer);
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", peer, e);
    }
    let (mut reader, writer) = stream.into_split();
    let (outbox, writer_task) = spawn_writer(peer, writer);
    let reply_to: Arc<dyn Channel> = Arc::new(ConnectionChannel { outbox });

    let outcome = tokio::select! {
        read = read_loop(&mut reader, &handler, Some(reply_to), peer) => read,
        _ = closing.wait_for(|closed| *closed) => Ok(()),
    };
    // Proxies may still hold the reply channel; stop writing regardless.
    writer_task.abort();
    match outcome {
        Ok(()) => debug!("{} disconnected", peer),
        Err(e) => debug!("Connection {} ended: {}", peer, e),
    }
}

impl Channel for TcpChannelServer {
    fn receive(&self, handler: MessageHandler) -> Result<()> {
        if *self.closing.borrow() {
            return Err(TetherError::protocol("TCP server already shut down"));
        }
        let listener = self.listener.lock().take().ok_or_else(|| {
            TetherError::protocol("TCP server already has a receiver")
        })?;
        runtime()?.spawn(accept_clients(
            listener,
            handler,
            self.closing.subscribe(),
            self.active.clone(),
        ));
        Ok(())
    }
}

impl Drop for TcpChannelServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
