//! Connection Record: per-connection state owned by a Herder's shard.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::socket::{RemoteEndpoint, Socket};

/// The opaque, parsed request header a connection may carry. HTTP parsing
/// is out of scope for this crate (spec section 1); this type is only a
/// placeholder slot the external parser populates and the worker pool
/// reads.
#[derive(Debug, Clone, Default)]
pub struct ParsedRequest {
    /// Opaque bytes the external parser produced. Never interpreted here.
    pub opaque: Vec<u8>,
}

struct Mutable {
    request: Option<ParsedRequest>,
    body_len: usize,
}

/// Per-connection state: the owned socket, an optional parsed request, a
/// body-length counter, and a liveness counter.
///
/// A `ConnectionRecord` is created by [`dispatch`](crate::dispatch::dispatch)
/// with liveness 2 (one reference for the shard, one for the readiness
/// engine) and destroyed exactly once, when removed from both.
pub struct ConnectionRecord {
    socket: Arc<dyn Socket>,
    mutable: RwLock<Mutable>,
    /// Outstanding-reference counter (spec section 3). Starts at 2: one for
    /// the shard, one for the readiness engine. The record's actual memory
    /// is reclaimed by ordinary `Arc` refcounting once both sides let go;
    /// this counter lets teardown code assert that invariant rather than
    /// drive the free itself.
    liveness: AtomicU32,
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("endpoint", &self.socket.remote_endpoint())
            .field("liveness", &self.liveness.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionRecord {
    /// Creates a new record wrapping `socket`, liveness initialized to 2.
    pub fn new(socket: Arc<dyn Socket>) -> Arc<Self> {
        Arc::new(Self {
            socket,
            mutable: RwLock::new(Mutable {
                request: None,
                body_len: 0,
            }),
            liveness: AtomicU32::new(2),
        })
    }

    /// The connection's remote endpoint, used as its shard/index key.
    pub fn remote_endpoint(&self) -> RemoteEndpoint {
        self.socket.remote_endpoint()
    }

    /// The owned socket handle.
    pub fn socket(&self) -> &Arc<dyn Socket> {
        &self.socket
    }

    /// Replaces the parsed request header, as produced by the external
    /// parser during worker processing.
    pub fn set_request(&self, request: ParsedRequest) {
        self.mutable.write().expect("connection lock poisoned").request = Some(request);
    }

    /// The currently parsed request header, if any.
    pub fn request(&self) -> Option<ParsedRequest> {
        self.mutable
            .read()
            .expect("connection lock poisoned")
            .request
            .clone()
    }

    /// The current body-length counter.
    pub fn body_len(&self) -> usize {
        self.mutable.read().expect("connection lock poisoned").body_len
    }

    /// Adds `n` bytes to the body-length counter.
    pub fn add_body_len(&self, n: usize) {
        self.mutable.write().expect("connection lock poisoned").body_len += n;
    }

    /// Releases one outstanding reference (shard or readiness engine).
    /// Returns the remaining count.
    pub(crate) fn release_reference(&self) -> u32 {
        self.liveness.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::WaitQueue;

    #[derive(Debug)]
    struct StubSocket(RemoteEndpoint, WaitQueue);

    impl Socket for StubSocket {
        fn poll_state(&self) -> crate::mask::EventMask {
            crate::mask::EventMask::EMPTY
        }
        fn remote_endpoint(&self) -> RemoteEndpoint {
            self.0
        }
        fn sleep_queue(&self) -> &WaitQueue {
            &self.1
        }
    }

    #[test]
    fn starts_with_liveness_two() {
        let socket = Arc::new(StubSocket(
            RemoteEndpoint { address: 1, port: 1 },
            WaitQueue::default(),
        ));
        let record = ConnectionRecord::new(socket);
        assert_eq!(record.release_reference(), 1);
        assert_eq!(record.release_reference(), 0);
    }

    #[test]
    fn body_len_accumulates() {
        let socket = Arc::new(StubSocket(
            RemoteEndpoint { address: 1, port: 1 },
            WaitQueue::default(),
        ));
        let record = ConnectionRecord::new(socket);
        record.add_body_len(10);
        record.add_body_len(5);
        assert_eq!(record.body_len(), 15);
    }
}
