//! UDP endpoint bridging a bound socket to a pull-based consumer.
//!
//! A dedicated I/O task owns the socket. Inbound datagrams are parsed with
//! [`message::parse`](super::message::parse) and pushed into the inbound queue;
//! outbound datagrams travel to the task over a control channel. The endpoint
//! moves `Open -> Closing -> Closed` (or straight to `Closed` when the socket
//! fails) and never reopens.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{Instrument, Span, debug, info_span, trace, warn};

use super::error::{Error, Result};
use super::message::{self, UdpEvent};

/// Maximum UDP payload we accept.
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Outbound bytes in flight above which writers should `drain()`.
const HIGH_WATER: usize = 64 * 1024;
const LOW_WATER: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Open,
    Closing,
    Closed,
}

/// Parameters for [`Endpoint::open`].
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    /// Inbound queue capacity; 0 means unbounded.
    pub queue_size: usize,
    /// Span the I/O task logs under.
    pub span: Span,
}

impl EndpointConfig {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            local,
            remote,
            queue_size: 0,
            span: info_span!("lookin_endpoint", %local, %remote),
        }
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

#[derive(Debug)]
enum Delivery {
    Frame(UdpEvent, SocketAddr),
    /// Pushed once on close so a blocked receiver wakes up.
    Closed,
}

enum Control {
    Datagram(Vec<u8>),
    Shutdown,
    /// Behave as if the socket reported an unrecoverable error.
    #[cfg(test)]
    Fail(std::io::Error),
}

enum Offer {
    Accepted,
    Full,
    Gone,
}

enum QueueTx {
    Bounded(mpsc::Sender<Delivery>),
    Unbounded(mpsc::UnboundedSender<Delivery>),
}

impl QueueTx {
    fn offer(&self, delivery: Delivery) -> Offer {
        match self {
            QueueTx::Bounded(tx) => match tx.try_send(delivery) {
                Ok(()) => Offer::Accepted,
                Err(TrySendError::Full(_)) => Offer::Full,
                Err(TrySendError::Closed(_)) => Offer::Gone,
            },
            QueueTx::Unbounded(tx) => match tx.send(delivery) {
                Ok(()) => Offer::Accepted,
                Err(_) => Offer::Gone,
            },
        }
    }
}

enum QueueRx {
    Bounded(mpsc::Receiver<Delivery>),
    Unbounded(mpsc::UnboundedReceiver<Delivery>),
}

impl QueueRx {
    fn try_recv(&mut self) -> std::result::Result<Delivery, TryRecvError> {
        match self {
            QueueRx::Bounded(rx) => rx.try_recv(),
            QueueRx::Unbounded(rx) => rx.try_recv(),
        }
    }

    async fn recv(&mut self) -> Option<Delivery> {
        match self {
            QueueRx::Bounded(rx) => rx.recv().await,
            QueueRx::Unbounded(rx) => rx.recv().await,
        }
    }
}

fn inbound_queue(capacity: usize) -> (QueueTx, QueueRx) {
    if capacity == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(capacity);
        (QueueTx::Bounded(tx), QueueRx::Bounded(rx))
    }
}

/// Tracks outbound bytes not yet handed to the socket and raises the
/// paused-writing signal around the water marks.
struct WriteBuffer {
    pending: AtomicUsize,
    paused: watch::Sender<bool>,
}

impl WriteBuffer {
    fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            pending: AtomicUsize::new(0),
            paused,
        }
    }

    fn reserve(&self, len: usize) {
        let pending = self.pending.fetch_add(len, Ordering::AcqRel) + len;
        if pending > HIGH_WATER {
            self.set_paused(true);
        }
    }

    fn release(&self, len: usize) {
        let pending = self.pending.fetch_sub(len, Ordering::AcqRel).saturating_sub(len);
        if pending <= LOW_WATER {
            self.set_paused(false);
        }
    }

    fn set_paused(&self, value: bool) {
        self.paused.send_if_modified(|paused| {
            if *paused == value {
                return false;
            }
            *paused = value;
            true
        });
    }
}

pub struct Endpoint {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state: Arc<watch::Sender<EndpointState>>,
    control: mpsc::UnboundedSender<Control>,
    queue: Mutex<QueueRx>,
    writes: Arc<WriteBuffer>,
    dropped: Arc<AtomicU64>,
}

impl Endpoint {
    /// Bind the socket and start the I/O task.
    pub async fn open(config: EndpointConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.local).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;

        let (state, _) = watch::channel(EndpointState::Open);
        let state = Arc::new(state);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = inbound_queue(config.queue_size);
        let writes = Arc::new(WriteBuffer::new());
        let dropped = Arc::new(AtomicU64::new(0));

        let io = IoTask {
            socket,
            remote: config.remote,
            control: control_rx,
            queue: queue_tx,
            state: state.clone(),
            writes: writes.clone(),
            dropped: dropped.clone(),
        };
        tokio::spawn(io.run().instrument(config.span));

        debug!(%local_addr, remote = %config.remote, "Endpoint opened");

        Ok(Self {
            local_addr,
            remote_addr: config.remote,
            state,
            control: control_tx,
            queue: Mutex::new(queue_rx),
            writes,
            dropped,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> EndpointState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() != EndpointState::Open
    }

    /// Frames shed because the inbound queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Fire-and-forget datagram to the remote address.
    pub fn send(&self, message: impl AsRef<[u8]>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::EndpointClosed);
        }
        let bytes = message.as_ref().to_vec();
        let len = bytes.len();
        self.writes.reserve(len);
        if self.control.send(Control::Datagram(bytes)).is_err() {
            self.writes.release(len);
            return Err(Error::EndpointClosed);
        }
        Ok(())
    }

    /// Send a text frame; the wire format is ASCII only.
    pub fn send_text(&self, text: &str) -> Result<()> {
        if !text.is_ascii() {
            return Err(Error::NotAscii);
        }
        self.send(text.as_bytes())
    }

    /// Next `(event, source)` pair in arrival order. Fails once the endpoint
    /// is closed and nothing is left to deliver.
    pub async fn receive(&self) -> Result<(UdpEvent, SocketAddr)> {
        let mut queue = self.queue.lock().await;
        let delivery = match queue.try_recv() {
            Ok(delivery) => Some(delivery),
            Err(TryRecvError::Disconnected) => None,
            Err(TryRecvError::Empty) if self.is_closed() => None,
            Err(TryRecvError::Empty) => queue.recv().await,
        };
        match delivery {
            Some(Delivery::Frame(event, addr)) => Ok((event, addr)),
            Some(Delivery::Closed) | None => Err(Error::EndpointClosed),
        }
    }

    /// Wait until outbound backpressure clears. Returns at once when writing
    /// is not paused.
    pub async fn drain(&self) {
        let mut paused = self.writes.paused.subscribe();
        let _ = paused.wait_for(|paused| !*paused).await;
    }

    /// Idempotent. Wakes pending receivers and stops the I/O task.
    pub fn close(&self) {
        let first = self.state.send_if_modified(|state| {
            if *state != EndpointState::Open {
                return false;
            }
            *state = EndpointState::Closing;
            true
        });
        if first {
            debug!(local_addr = %self.local_addr, "Closing endpoint");
            let _ = self.control.send(Control::Shutdown);
        }
    }

    /// Like [`close`](Self::close), but fails if the endpoint is already closed.
    pub fn abort(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::EndpointClosed);
        }
        self.close();
        Ok(())
    }

    /// Resolves once the I/O task has finished shutting down.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| *state == EndpointState::Closed).await;
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

struct IoTask {
    socket: UdpSocket,
    remote: SocketAddr,
    control: mpsc::UnboundedReceiver<Control>,
    queue: QueueTx,
    state: Arc<watch::Sender<EndpointState>>,
    writes: Arc<WriteBuffer>,
    dropped: Arc<AtomicU64>,
}

impl IoTask {
    async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                command = self.control.recv() => match command {
                    Some(Control::Datagram(bytes)) => {
                        if let Err(e) = self.socket.send_to(&bytes, self.remote).await {
                            warn!(error = %e, remote = %self.remote, "Failed to send datagram");
                        }
                        self.writes.release(bytes.len());
                    }
                    Some(Control::Shutdown) | None => break,
                    #[cfg(test)]
                    Some(Control::Fail(e)) => {
                        warn!(error = %e, "Socket lost, closing endpoint");
                        break;
                    }
                },
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => self.feed_datagram(&buf[..len], addr),
                    Err(e) if is_transient(&e) => {
                        warn!(error = %e, "Endpoint received an error");
                    }
                    Err(e) => {
                        warn!(error = %e, "Socket lost, closing endpoint");
                        break;
                    }
                },
            }
        }

        self.state.send_replace(EndpointState::Closing);
        // Best effort: if the queue is full the receivers still observe
        // closure once it is drained.
        let _ = self.queue.offer(Delivery::Closed);
        self.writes.set_paused(false);
        self.state.send_replace(EndpointState::Closed);
        debug!("Endpoint closed");
    }

    fn feed_datagram(&self, data: &[u8], addr: SocketAddr) {
        let Ok(text) = std::str::from_utf8(data) else {
            debug!(%addr, len = data.len(), "Dropping non-text datagram");
            return;
        };
        let Some(event) = message::parse(text) else {
            debug!(%addr, frame = text, "Dropping malformed frame");
            return;
        };
        trace!(%addr, ?event, "Frame received");

        match self.queue.offer(Delivery::Frame(event, addr)) {
            Offer::Accepted => {}
            Offer::Full => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%addr, "Endpoint queue is full, dropping frame");
            }
            Offer::Gone => debug!(%addr, "Endpoint receiver dropped, discarding frame"),
        }
    }
}

fn is_transient(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::lookin::message::DeviceType;

    const ALIVE: &str = "LOOK.in:Alive!98F33011:81:1:127.0.0.1:2.38:0";
    const UPDATED: &str = "LOOK.in:Updated!98F33011:FE:00:00EB01C2";

    async fn peer() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn open_towards(remote: SocketAddr, queue_size: usize) -> Endpoint {
        let config = EndpointConfig::new("127.0.0.1:0".parse().unwrap(), remote)
            .with_queue_size(queue_size);
        Endpoint::open(config).await.unwrap()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_send_reaches_remote() {
        let remote = peer().await;
        let endpoint = open_towards(remote.local_addr().unwrap(), 0).await;

        endpoint.send_text(message::DISCOVER_FRAME).unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], message::DISCOVER_FRAME.as_bytes());
        assert_eq!(from, endpoint.local_addr());
    }

    #[tokio::test]
    async fn test_receive_parses_frames_in_order() {
        let remote = peer().await;
        let endpoint = open_towards(remote.local_addr().unwrap(), 0).await;

        remote.send_to(b"garbage", endpoint.local_addr()).await.unwrap();
        remote.send_to(ALIVE.as_bytes(), endpoint.local_addr()).await.unwrap();
        remote.send_to(UPDATED.as_bytes(), endpoint.local_addr()).await.unwrap();

        let (first, from) = endpoint.receive().await.unwrap();
        assert_eq!(from, remote.local_addr().unwrap());
        let UdpEvent::Alive(alive) = first else {
            panic!("expected alive event first");
        };
        assert_eq!(alive.device_type, DeviceType::Remote);

        let (second, _) = endpoint.receive().await.unwrap();
        assert!(matches!(second, UdpEvent::Updated(_)));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let remote = peer().await;
        let endpoint = open_towards(remote.local_addr().unwrap(), 0).await;

        endpoint.close();
        endpoint.close();

        assert!(endpoint.is_closed());
        assert!(matches!(endpoint.send(b"x"), Err(Error::EndpointClosed)));
        assert!(matches!(endpoint.abort(), Err(Error::EndpointClosed)));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receive() {
        let remote = peer().await;
        let endpoint = Arc::new(open_towards(remote.local_addr().unwrap(), 0).await);

        let waiter = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        endpoint.close();

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("receive hung after close")
            .unwrap();
        assert!(matches!(result, Err(Error::EndpointClosed)));

        endpoint.closed().await;
        assert_eq!(endpoint.state(), EndpointState::Closed);
        // Later receivers fail as well instead of hanging.
        assert!(matches!(endpoint.receive().await, Err(Error::EndpointClosed)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_new_frames() {
        let remote = peer().await;
        let endpoint = open_towards(remote.local_addr().unwrap(), 1).await;

        remote.send_to(ALIVE.as_bytes(), endpoint.local_addr()).await.unwrap();
        remote.send_to(UPDATED.as_bytes(), endpoint.local_addr()).await.unwrap();
        wait_until(|| endpoint.dropped_frames() == 1).await;

        let (retained, _) = endpoint.receive().await.unwrap();
        assert!(matches!(retained, UdpEvent::Alive(_)));

        endpoint.close();
        assert!(matches!(endpoint.receive().await, Err(Error::EndpointClosed)));
        assert_eq!(endpoint.dropped_frames(), 1);
    }

    #[tokio::test]
    async fn test_drain_is_released_by_close() {
        let remote = peer().await;
        let endpoint = Arc::new(open_towards(remote.local_addr().unwrap(), 0).await);

        // not paused: returns immediately
        tokio::time::timeout(Duration::from_millis(200), endpoint.drain())
            .await
            .unwrap();

        endpoint.writes.reserve(HIGH_WATER + 1);
        let drainer = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drainer.is_finished());

        endpoint.close();
        tokio::time::timeout(Duration::from_secs(2), drainer)
            .await
            .expect("drain hung after close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_socket_loss_closes_endpoint() {
        let remote = peer().await;
        let endpoint = Arc::new(open_towards(remote.local_addr().unwrap(), 0).await);

        let receiver = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.receive().await })
        };
        endpoint.writes.reserve(HIGH_WATER + 1);
        let drainer = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!receiver.is_finished());
        assert!(!drainer.is_finished());

        let failure = std::io::Error::other("network unreachable");
        assert!(endpoint.control.send(Control::Fail(failure)).is_ok());

        let result = tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .expect("receive hung after socket loss")
            .unwrap();
        assert!(matches!(result, Err(Error::EndpointClosed)));
        tokio::time::timeout(Duration::from_secs(2), drainer)
            .await
            .expect("drain hung after socket loss")
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), endpoint.closed())
            .await
            .unwrap();
        assert_eq!(endpoint.state(), EndpointState::Closed);
        assert!(matches!(endpoint.send(b"x"), Err(Error::EndpointClosed)));
        assert!(matches!(endpoint.receive().await, Err(Error::EndpointClosed)));
    }

    #[tokio::test]
    async fn test_open_on_taken_port_fails_with_bind() {
        let remote = peer().await;
        let first = open_towards(remote.local_addr().unwrap(), 0).await;

        let taken = EndpointConfig::new(first.local_addr(), remote.local_addr().unwrap());
        match Endpoint::open(taken).await {
            Err(Error::Bind(e)) => assert_eq!(e.kind(), std::io::ErrorKind::AddrInUse),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("second bind on the same port succeeded"),
        }
    }

    #[tokio::test]
    async fn test_send_text_rejects_non_ascii() {
        let remote = peer().await;
        let endpoint = open_towards(remote.local_addr().unwrap(), 0).await;
        assert!(matches!(endpoint.send_text("LOOK.in:Déc!"), Err(Error::NotAscii)));
    }
}
