//! The external TCP-socket collaborator interface.
//!
//! Everything in this module is the seam between the from-scratch
//! [`ReadinessEngine`](crate::engine::ReadinessEngine) and a real network
//! stack. The engine only ever touches a socket through [`Socket`]; how
//! readiness is actually observed on the wire is a collaborator's concern,
//! out of scope for this crate's core (spec section 1). [`MioTcpSocket`]
//! and [`NetworkStackDriver`] are one concrete, working bridge over
//! `mio`, grounded in the polling loop this crate's source repository
//! already used for its own listener.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use mio::{Events, Interest, Poll, Token};

use crate::mask::EventMask;

/// The `(remote_address, remote_port)` key the readiness engine's ordered
/// index is keyed by (spec section 4.2). Only IPv4 remotes are
/// representable, matching the 32-bit address field in the original
/// kernel module this crate's readiness engine is modeled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemoteEndpoint {
    /// Remote IPv4 address, network byte order as a plain integer.
    pub address: u32,
    /// Remote TCP port.
    pub port: u16,
}

impl RemoteEndpoint {
    /// Builds a key from a socket address. Returns `None` for IPv6, which
    /// this engine's ordered index cannot represent (see spec section 9's
    /// note on the key's scope).
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(RemoteEndpoint {
                address: u32::from_be_bytes(v4.ip().octets()),
                port: v4.port(),
            }),
            SocketAddr::V6(_) => None,
        }
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.address.to_be_bytes();
        write!(f, "{a}.{b}.{c}.{d}:{}", self.port)
    }
}

/// Anything that can sit on a socket's sleep queue and be notified when the
/// socket's readiness state changes. The readiness engine's event item is
/// the only real implementor; this indirection keeps the socket/wait-queue
/// plumbing ignorant of the engine's internals.
pub trait WakeupTarget: Send + Sync {
    /// Invoked by the network stack (or, here, by [`NetworkStackDriver`])
    /// when the underlying socket's state may have changed. Must not block
    /// or allocate in a way that could deadlock against the caller (spec
    /// section 4.2, "Wakeup callback").
    fn on_wakeup(self: Arc<Self>);
}

/// A socket's sleep/wait queue: the set of parties interested in being
/// notified when the socket's readiness changes.
///
/// Entries are held as `Weak` references. This is what makes the
/// Event-Item-to-Readiness-Engine-to-Herder-to-Event-Item cycle described
/// in spec section 9 safe to express in safe Rust: the wait queue never
/// keeps an item alive on its own, and `detach` (called by `remove` before
/// the item's last strong reference is dropped) guarantees a callback
/// racing removal will simply fail to upgrade and do nothing.
#[derive(Default)]
pub struct WaitQueue {
    entries: Mutex<Vec<(u64, Weak<dyn WakeupTarget>)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.entries.lock().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("WaitQueue").field("entries", &len).finish()
    }
}

/// A handle returned by [`WaitQueue::attach`], used to detach later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitQueueHandle(u64);

impl WaitQueue {
    /// Attaches `target` to this wait queue, returning a handle that can
    /// later be passed to [`WaitQueue::detach`].
    pub fn attach(&self, target: &Arc<dyn WakeupTarget>) -> WaitQueueHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().expect("wait queue lock poisoned");
        entries.push((id, Arc::downgrade(target)));
        WaitQueueHandle(id)
    }

    /// Detaches the entry identified by `handle`. Idempotent: detaching an
    /// already-detached (or never-attached) handle is a no-op.
    pub fn detach(&self, handle: WaitQueueHandle) {
        let mut entries = self.entries.lock().expect("wait queue lock poisoned");
        entries.retain(|(id, _)| *id != handle.0);
    }

    /// Notifies every attached, still-live target. Dead (dropped) entries
    /// are pruned opportunistically.
    pub fn notify(&self) {
        let mut entries = self.entries.lock().expect("wait queue lock poisoned");
        entries.retain(|(_, weak)| {
            if let Some(target) = weak.upgrade() {
                target.on_wakeup();
                true
            } else {
                false
            }
        });
    }
}

/// The TCP socket collaborator interface consumed by the readiness engine.
///
/// Only the operations the engine actually needs are exposed: a cheap,
/// non-blocking readiness snapshot, the socket's sleep queue, and its
/// identity for the ordered index. Reading/writing application bytes is a
/// worker-pool concern and does not go through this trait.
pub trait Socket: Send + Sync + fmt::Debug {
    /// A cheap, non-blocking snapshot of the socket's current readiness.
    /// Mirrors calling `poll` with no poll table on a TCP socket: it
    /// returns immediately and never blocks (spec section 4.2).
    fn poll_state(&self) -> EventMask;

    /// The key this socket registers under in the readiness engine's
    /// ordered index.
    fn remote_endpoint(&self) -> RemoteEndpoint;

    /// The socket's sleep queue, onto which an event item's wait-queue
    /// entry is attached at `insert` time.
    fn sleep_queue(&self) -> &WaitQueue;
}

/// A concrete [`Socket`] backed by a real `mio::net::TcpStream`, bridged by
/// a [`NetworkStackDriver`] that owns the actual OS-level polling.
pub struct MioTcpSocket {
    endpoint: RemoteEndpoint,
    stream: Mutex<mio::net::TcpStream>,
    wait_queue: WaitQueue,
    cached_mask: AtomicU8,
}

impl fmt::Debug for MioTcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MioTcpSocket")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl MioTcpSocket {
    fn new(stream: mio::net::TcpStream, endpoint: RemoteEndpoint) -> Self {
        Self {
            endpoint,
            stream: Mutex::new(stream),
            wait_queue: WaitQueue::default(),
            cached_mask: AtomicU8::new(0),
        }
    }

    fn set_cached_mask(&self, mask: EventMask) {
        self.cached_mask.store(mask.to_bits(), Ordering::Release);
    }

    /// Access the underlying stream under lock, for the worker pool's use
    /// once an event has been dispatched.
    pub fn with_stream<R>(&self, f: impl FnOnce(&mut mio::net::TcpStream) -> R) -> R {
        let mut guard = self.stream.lock().expect("stream lock poisoned");
        f(&mut guard)
    }
}

impl Socket for MioTcpSocket {
    fn poll_state(&self) -> EventMask {
        EventMask::from_raw(self.cached_mask.load(Ordering::Acquire))
    }

    fn remote_endpoint(&self) -> RemoteEndpoint {
        self.endpoint
    }

    fn sleep_queue(&self) -> &WaitQueue {
        &self.wait_queue
    }
}

/// Owns the real OS-level `mio::Poll` instance and translates its events
/// into [`WaitQueue::notify`] calls on the sockets it tracks. This is the
/// "network stack" from the engine's point of view (spec section 4.2):
/// the readiness engine itself never touches an OS poll facility directly.
pub struct NetworkStackDriver {
    poll: Poll,
    sockets: Mutex<HashMap<Token, Arc<MioTcpSocket>>>,
    next_token: std::sync::atomic::AtomicUsize,
}

impl fmt::Debug for NetworkStackDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkStackDriver").finish()
    }
}

impl NetworkStackDriver {
    /// Creates a new driver with its own `mio::Poll`.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            sockets: Mutex::new(HashMap::new()),
            next_token: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    /// Registers a raw `mio::net::TcpStream` with the driver, returning a
    /// [`Socket`] handle that the readiness engine can track.
    pub fn register(&self, mut stream: mio::net::TcpStream) -> io::Result<Arc<MioTcpSocket>> {
        let peer = stream.peer_addr()?;
        let endpoint = RemoteEndpoint::from_socket_addr(peer).ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "IPv6 remotes are not supported")
        })?;

        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let socket = Arc::new(MioTcpSocket::new(stream, endpoint));
        self.sockets
            .lock()
            .expect("driver lock poisoned")
            .insert(token, socket.clone());
        Ok(socket)
    }

    /// Deregisters a previously-registered socket.
    pub fn deregister(&self, socket: &MioTcpSocket) {
        let mut sockets = self.sockets.lock().expect("driver lock poisoned");
        let token = sockets
            .iter()
            .find(|(_, s)| std::ptr::eq(s.as_ref(), socket))
            .map(|(t, _)| *t);

        if let Some(token) = token {
            if let Some(s) = sockets.remove(&token) {
                let _ = s.with_stream(|stream| self.poll.registry().deregister(stream));
            }
        }
    }

    /// Runs the driver loop until `should_stop` returns true between
    /// iterations. Intended to run on its own background thread, spawned
    /// by [`NetworkStackDriver::spawn`].
    pub fn run(&self, should_stop: impl Fn() -> bool) {
        let mut events = Events::with_capacity(1024);
        while !should_stop() {
            if let Err(e) = self
                .poll
                .poll(&mut events, Some(std::time::Duration::from_millis(200)))
            {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::warn!(error = %e, "network stack driver poll failed");
                continue;
            }

            for event in events.iter() {
                let socket = {
                    let sockets = self.sockets.lock().expect("driver lock poisoned");
                    sockets.get(&event.token()).cloned()
                };
                let Some(socket) = socket else { continue };

                let mut mask = EventMask::EMPTY;
                if event.is_readable() {
                    mask |= EventMask::READABLE;
                }
                if event.is_writable() {
                    mask |= EventMask::WRITABLE;
                }
                if event.is_error() {
                    mask |= EventMask::ERROR;
                }
                if event.is_read_closed() || event.is_write_closed() {
                    mask |= EventMask::HANGUP;
                }

                socket.set_cached_mask(mask);
                socket.wait_queue.notify();
            }
        }
    }

    /// Spawns [`NetworkStackDriver::run`] on a dedicated background
    /// thread, returning its join handle.
    pub fn spawn(self: Arc<Self>, should_stop: impl Fn() -> bool + Send + 'static) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("network-stack-driver".into())
            .spawn(move || self.run(should_stop))
            .expect("failed to spawn network stack driver thread")
    }
}

