//! Herder: the per-CPU owner of one connection shard and one Readiness
//! Engine (spec section 4.1).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::config::HerderConfig;
use crate::connection::ConnectionRecord;
use crate::engine::ReadinessEngine;
use crate::error::HerderError;
use crate::mask::EventMask;
use crate::socket::RemoteEndpoint;
use crate::worker_pool::{EventJob, WorkerPool};
use crate::Result;

struct Inner {
    cpu: usize,
    engine: ReadinessEngine,
    shard: RwLock<HashMap<RemoteEndpoint, Arc<ConnectionRecord>>>,
    shard_load: AtomicUsize,
    worker_pool: Arc<dyn WorkerPool>,
    stop: AtomicBool,
    config: HerderConfig,
}

impl Inner {
    fn run_loop(self: &Arc<Self>) {
        if let Some(core_id) = self.target_core_id() {
            if !core_affinity::set_for_current(core_id) {
                tracing::warn!(cpu = self.cpu, "failed to pin herder thread to its cpu");
            }
        }

        tracing::info!(cpu = self.cpu, "herder run loop starting");
        while !self.stop.load(Ordering::Acquire) {
            let items = self
                .engine
                .wait(self.config.max_events, Some(self.config.wait_timeout));
            if items.is_empty() {
                continue;
            }

            for item in items {
                let pending = item.take_pending();
                let endpoint = item.socket.remote_endpoint();
                let connection = {
                    let shard = self.shard.read().expect("shard lock poisoned");
                    shard.get(&endpoint).cloned()
                };
                let Some(connection) = connection else {
                    // Socket was removed from the engine but the shard
                    // hasn't caught up yet (or vice versa); the next
                    // readiness cycle, if any, will reconcile.
                    continue;
                };

                let job = EventJob {
                    connection,
                    events: pending,
                    herder_cpu: self.cpu,
                };
                if let Err(job) = self.worker_pool.submit(job) {
                    tracing::warn!(
                        cpu = self.cpu,
                        endpoint = %job.connection.remote_endpoint(),
                        "worker pool submission failed, dropping event (will resurface)"
                    );
                }
            }
        }
        tracing::info!(cpu = self.cpu, "herder run loop stopped");
    }

    fn target_core_id(&self) -> Option<core_affinity::CoreId> {
        core_affinity::get_core_ids()?.into_iter().nth(self.cpu)
    }
}

/// A per-CPU owner of one shard of connections, one Readiness Engine, and
/// a pinned execution context.
pub struct Herder {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Herder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Herder")
            .field("cpu", &self.inner.cpu)
            .field("shard_load", &self.shard_load())
            .finish()
    }
}

impl Herder {
    /// Creates a Herder for `cpu`, launching its pinned execution context
    /// running the Herder Run Loop. Fails with
    /// [`HerderError::ResourceExhausted`] if the thread can't be spawned.
    pub(crate) fn spawn(
        cpu: usize,
        worker_pool: Arc<dyn WorkerPool>,
        config: HerderConfig,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            cpu,
            engine: ReadinessEngine::new(),
            shard: RwLock::new(HashMap::new()),
            shard_load: AtomicUsize::new(0),
            worker_pool,
            stop: AtomicBool::new(false),
            config,
        });

        let run_inner = inner.clone();
        let thread = std::thread::Builder::new()
            .name(format!("herder-{cpu}"))
            .spawn(move || run_inner.run_loop())
            .map_err(|e| HerderError::ResourceExhausted(e.to_string()))?;

        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// This Herder's CPU identity.
    pub fn cpu(&self) -> usize {
        self.inner.cpu
    }

    /// Current shard size, as tracked by the atomic load counter. May be
    /// read without the shard lock; the dispatch policy tolerates small
    /// staleness (spec section 4.1).
    pub fn shard_load(&self) -> usize {
        self.inner.shard_load.load(Ordering::Relaxed)
    }

    /// Links `connection` into this Herder's shard and registers its
    /// socket with the Readiness Engine under `{READABLE}` interest. Rolls
    /// back the shard insertion if engine registration fails.
    pub(crate) fn register_connection(&self, connection: Arc<ConnectionRecord>) -> Result<()> {
        if self.inner.stop.load(Ordering::Acquire) {
            return Err(HerderError::Shutdown);
        }

        let endpoint = connection.remote_endpoint();
        {
            let mut shard = self.inner.shard.write().expect("shard lock poisoned");
            shard.insert(endpoint, connection.clone());
        }
        self.inner.shard_load.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = self
            .inner
            .engine
            .insert(connection.socket().clone(), EventMask::READABLE)
        {
            let mut shard = self.inner.shard.write().expect("shard lock poisoned");
            shard.remove(&endpoint);
            self.inner.shard_load.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }

        Ok(())
    }

    /// Removes `endpoint` from both the Readiness Engine and the shard,
    /// releasing both outstanding references on its connection record.
    /// Safe to call even if the engine side was already removed (e.g. by
    /// [`Herder::shutdown`]); a stale removal there is simply a no-op.
    pub fn close_connection(&self, endpoint: RemoteEndpoint) {
        let engine_had_it = self.inner.engine.remove(endpoint).is_ok();

        let connection = {
            let mut shard = self.inner.shard.write().expect("shard lock poisoned");
            shard.remove(&endpoint)
        };

        if let Some(connection) = connection {
            if engine_had_it {
                connection.release_reference();
            }
            let remaining = connection.release_reference();
            self.inner.shard_load.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(cpu = self.inner.cpu, %endpoint, remaining, "connection closed");
        }
    }

    /// Begins teardown: sets the engine's should-wake flag, unblocking any
    /// consumer parked in `wait`, and signals the run loop to stop.
    pub(crate) fn begin_shutdown(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.engine.force_wake();
    }

    /// Joins the pinned execution context. Must be called after
    /// [`Herder::begin_shutdown`].
    pub(crate) fn join(&self) {
        if let Some(handle) = self.thread.lock().expect("thread handle lock poisoned").take() {
            if handle.join().is_err() {
                tracing::warn!(cpu = self.inner.cpu, "herder thread panicked during shutdown");
            }
        }
    }

    /// Destroys the Readiness Engine (freeing every Event Item) and walks
    /// the shard, destroying each Connection Record in turn. Only called
    /// from teardown, under the Herder List write lock.
    pub(crate) fn destroy_all(&self) {
        self.inner.engine.destroy();
        let mut shard = self.inner.shard.write().expect("shard lock poisoned");
        for (endpoint, connection) in shard.drain() {
            // The engine side's reference was just released in bulk above.
            connection.release_reference();
            let remaining = connection.release_reference();
            debug_assert_eq!(remaining, 0, "connection record outlived both owners");
            tracing::debug!(cpu = self.inner.cpu, %endpoint, "connection torn down");
        }
        self.inner.shard_load.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{RemoteEndpoint, Socket, WaitQueue};
    use crate::worker_pool::ChannelWorkerPool;
    use std::sync::atomic::AtomicU8;
    use std::time::Duration;

    #[derive(Debug)]
    struct TestSocket {
        endpoint: RemoteEndpoint,
        mask: AtomicU8,
        queue: WaitQueue,
    }

    impl TestSocket {
        fn new(port: u16) -> Arc<Self> {
            Arc::new(Self {
                endpoint: RemoteEndpoint { address: 0x0a000001, port },
                mask: AtomicU8::new(0),
                queue: WaitQueue::default(),
            })
        }

        fn set_readable(&self) {
            self.mask.store(EventMask::READABLE.to_bits(), Ordering::Release);
        }
    }

    impl Socket for TestSocket {
        fn poll_state(&self) -> EventMask {
            EventMask::from_raw(self.mask.load(Ordering::Acquire))
        }
        fn remote_endpoint(&self) -> RemoteEndpoint {
            self.endpoint
        }
        fn sleep_queue(&self) -> &WaitQueue {
            &self.queue
        }
    }

    fn test_config() -> HerderConfig {
        HerderConfig {
            wait_timeout: Duration::from_millis(20),
            ..Default::default()
        }
    }

    /// Spec section 8, scenario 1: a single connection with a single
    /// asserted event produces exactly one Event Job carrying that
    /// connection and its pending mask.
    #[test]
    fn single_connection_single_event_produces_one_job() {
        let (pool, rx) = ChannelWorkerPool::new(16);
        let herder = Herder::spawn(0, Arc::new(pool), test_config()).unwrap();

        let socket = TestSocket::new(5000);
        let endpoint = socket.remote_endpoint();
        socket.set_readable();
        herder
            .register_connection(ConnectionRecord::new(socket))
            .unwrap();

        let job = rx.recv_timeout(Duration::from_secs(1)).expect("one job");
        assert_eq!(job.connection.remote_endpoint(), endpoint);
        assert!(job.events.intersects(EventMask::READABLE));
        assert_eq!(herder.shard_load(), 1);

        herder.begin_shutdown();
        herder.join();
        herder.destroy_all();
    }

    /// Spec section 8, scenario 5: tearing down a herder with pending
    /// events on its connections completes cleanly and releases every
    /// connection record (liveness reaches zero for each).
    #[test]
    fn teardown_with_pending_events_releases_every_connection() {
        let (pool, _rx) = ChannelWorkerPool::new(16);
        let herder = Herder::spawn(0, Arc::new(pool), test_config()).unwrap();

        let s1 = TestSocket::new(5001);
        let s2 = TestSocket::new(5002);
        s1.set_readable();
        s2.set_readable();
        let c1 = ConnectionRecord::new(s1);
        let c2 = ConnectionRecord::new(s2);
        herder.register_connection(c1.clone()).unwrap();
        herder.register_connection(c2.clone()).unwrap();

        herder.begin_shutdown();
        herder.join();
        herder.destroy_all();

        assert_eq!(herder.shard_load(), 0);
        assert_eq!(c1.release_reference(), 0);
        assert_eq!(c2.release_reference(), 0);
    }

    #[test]
    fn close_connection_drops_shard_load_and_releases_record() {
        let (pool, _rx) = ChannelWorkerPool::new(16);
        let herder = Herder::spawn(0, Arc::new(pool), test_config()).unwrap();

        let socket = TestSocket::new(5003);
        let endpoint = socket.remote_endpoint();
        let connection = ConnectionRecord::new(socket);
        herder.register_connection(connection.clone()).unwrap();
        assert_eq!(herder.shard_load(), 1);

        herder.close_connection(endpoint);
        assert_eq!(herder.shard_load(), 0);
        assert_eq!(connection.release_reference(), 0);

        herder.begin_shutdown();
        herder.join();
        herder.destroy_all();
    }
}
