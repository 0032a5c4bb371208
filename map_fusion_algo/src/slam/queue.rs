//! Bounded submap queue between the front end and the fusion engine
//!
//! The front end pushes finished submaps through a [`SubmapProducer`]; the
//! engine consumes them in arrival order, either by draining the queue in
//! place or on a dedicated worker thread.
//!
//! A worker reports one [`FusionStatus`] per submap on a channel with the
//! same capacity as the queue. Once that many statuses are unread the worker
//! waits, which in turn fills the queue and blocks the producers.

use std::any::Any;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, warn};

use super::fusion::{FusionReport, GlobalMapFusionEngine};
use super::submap::LocalSubmap;
use crate::error::{FusionError, FusionResult};

/// Result of fusing one queued submap
#[derive(Debug, Clone, PartialEq)]
pub enum FusionStatus {
    Completed(FusionReport),
    Failed { sequence: usize, reason: String },
}

impl FusionStatus {
    fn from_result(sequence: usize, result: FusionResult<FusionReport>) -> Self {
        match result {
            Ok(report) => FusionStatus::Completed(report),
            Err(err) => FusionStatus::Failed {
                sequence,
                reason: err.to_string(),
            },
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, FusionStatus::Completed(_))
    }
}

/// Sending half handed to the front end
#[derive(Debug, Clone)]
pub struct SubmapProducer {
    sender: Sender<LocalSubmap>,
}

impl SubmapProducer {
    /// Enqueue without blocking
    pub fn try_enqueue(&self, submap: LocalSubmap) -> FusionResult<()> {
        self.sender.try_send(submap).map_err(|err| match err {
            TrySendError::Full(_) => FusionError::QueueFull,
            TrySendError::Disconnected(_) => FusionError::QueueClosed,
        })
    }

    /// Enqueue, waiting for room
    pub fn enqueue(&self, submap: LocalSubmap) -> FusionResult<()> {
        self.sender
            .send(submap)
            .map_err(|_| FusionError::QueueClosed)
    }
}

#[derive(Debug)]
pub struct SubmapQueue {
    sender: Sender<LocalSubmap>,
    receiver: Receiver<LocalSubmap>,
}

impl SubmapQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self { sender, receiver }
    }

    pub fn producer(&self) -> SubmapProducer {
        SubmapProducer {
            sender: self.sender.clone(),
        }
    }

    pub fn try_enqueue(&self, submap: LocalSubmap) -> FusionResult<()> {
        self.sender.try_send(submap).map_err(|err| match err {
            TrySendError::Full(_) => FusionError::QueueFull,
            TrySendError::Disconnected(_) => FusionError::QueueClosed,
        })
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.receiver.capacity()
    }

    /// Fuse everything currently queued, in order
    pub fn drain_into(&self, engine: &mut GlobalMapFusionEngine) -> Vec<FusionStatus> {
        let mut statuses = Vec::with_capacity(self.receiver.len());
        while let Ok(submap) = self.receiver.try_recv() {
            statuses.push(consume(engine, submap));
        }
        statuses
    }

    /// Move the engine onto a worker thread that fuses submaps as they arrive
    ///
    /// The worker stops once every producer is dropped and the queue is empty.
    pub fn spawn_worker(self, mut engine: GlobalMapFusionEngine) -> FusionWorker {
        let Self { sender, receiver } = self;
        drop(sender);
        let (status_sender, statuses) = bounded(receiver.capacity().unwrap_or(1).max(1));

        let handle = thread::spawn(move || {
            for submap in receiver.iter() {
                let status = consume(&mut engine, submap);
                if status_sender.send(status).is_err() {
                    debug!("Status receiver dropped");
                }
            }
            debug!(submaps = engine.submap_count(), "Fusion worker finished");
            engine
        });

        FusionWorker { handle, statuses }
    }
}

fn consume(engine: &mut GlobalMapFusionEngine, submap: LocalSubmap) -> FusionStatus {
    let sequence = engine.next_sequence();
    let status = FusionStatus::from_result(sequence, engine.consume_local_submap(submap));
    if let FusionStatus::Failed { reason, .. } = &status {
        warn!(reason = %reason, "Queued submap not fused");
    }
    status
}

/// Handle to a running fusion worker
#[derive(Debug)]
pub struct FusionWorker {
    handle: JoinHandle<GlobalMapFusionEngine>,
    statuses: Receiver<FusionStatus>,
}

impl FusionWorker {
    /// Status of each submap, in fusion order
    pub fn statuses(&self) -> &Receiver<FusionStatus> {
        &self.statuses
    }

    /// Wait for the worker to finish; returns the engine and any unread statuses
    ///
    /// Unread statuses are drained while waiting so the worker never blocks
    /// on a full status channel. Returns once every producer is dropped.
    pub fn join(self) -> FusionResult<(GlobalMapFusionEngine, Vec<FusionStatus>)> {
        let remaining = self.statuses.iter().collect();
        let engine = self.handle.join().map_err(worker_panic)?;
        Ok((engine, remaining))
    }
}

fn worker_panic(payload: Box<dyn Any + Send>) -> FusionError {
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    error!(reason = %reason, "Fusion worker panicked");
    FusionError::WorkerPanicked(reason)
}
