//! The Worker Pool collaborator interface.
//!
//! The worker pool is external to this crate's core (spec section 1):
//! it's a shared, bounded concurrent job queue that invokes a
//! request-processing callback the Herder never sees. This module defines
//! the narrow seam ([`WorkerPool`], [`EventJob`]) plus one concrete,
//! bounded channel-backed implementation suitable for tests and the
//! example binary.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::connection::ConnectionRecord;
use crate::mask::EventMask;

/// One unit of work handed from a Herder to the worker pool: a connection
/// with a snapshot of the events that were pending on it, named after the
/// `event_process` struct in the module this crate's readiness engine is
/// modeled on.
pub struct EventJob {
    /// The connection the event occurred on.
    pub connection: Arc<ConnectionRecord>,
    /// The pending events snapshot taken when the job was built.
    pub events: EventMask,
    /// Which CPU's Herder produced this job, for worker-side metrics/affinity.
    pub herder_cpu: usize,
}

impl fmt::Debug for EventJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventJob")
            .field("endpoint", &self.connection.remote_endpoint())
            .field("herder_cpu", &self.herder_cpu)
            .finish()
    }
}

/// The Worker Pool handle a Herder submits jobs to.
///
/// `submit` never blocks the Herder's run loop for long: a full pool is a
/// normal, expected outcome (spec section 4.1, step 4), not an error the
/// caller need unwind over.
pub trait WorkerPool: Send + Sync + fmt::Debug {
    /// Submits one job. Returns `Err(job)` (handing the job back) if the
    /// pool is full; the caller is expected to drop it, relying on
    /// level-triggered redelivery to resurface the event later.
    fn submit(&self, job: EventJob) -> std::result::Result<(), EventJob>;
}

/// A bounded, `crossbeam_channel`-backed worker pool. Workers pull jobs off
/// the shared receiver; this crate does not prescribe how many worker
/// threads run, only the submission side.
pub struct ChannelWorkerPool {
    sender: Sender<EventJob>,
}

impl fmt::Debug for ChannelWorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWorkerPool")
            .field("capacity", &self.sender.capacity())
            .finish()
    }
}

impl ChannelWorkerPool {
    /// Creates a bounded worker pool with room for `capacity` queued jobs,
    /// returning the submission side and the receiver workers pull from.
    pub fn new(capacity: usize) -> (Self, Receiver<EventJob>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl WorkerPool for ChannelWorkerPool {
    fn submit(&self, job: EventJob) -> std::result::Result<(), EventJob> {
        match self.sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => Err(job),
            Err(TrySendError::Disconnected(job)) => Err(job),
        }
    }
}
