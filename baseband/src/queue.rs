//! Event Queues
//!
//! One bounded MPMC work queue feeds every worker; completions flow back on
//! a separate notification queue. Each worker owns a private producer
//! handle for the notification side.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

use common::Event;

use crate::EngineError;

/// Work and notification channels of one engine
pub struct EventQueues {
    work_tx: Sender<Event>,
    work_rx: Receiver<Event>,
    notify_tx: Sender<Event>,
    notify_rx: Receiver<Event>,
}

impl EventQueues {
    pub fn new(capacity: usize) -> Self {
        let (work_tx, work_rx) = bounded(capacity);
        let (notify_tx, notify_rx) = bounded(capacity);
        Self {
            work_tx,
            work_rx,
            notify_tx,
            notify_rx,
        }
    }

    /// Dequeue handle for a worker
    pub fn work_receiver(&self) -> Receiver<Event> {
        self.work_rx.clone()
    }

    /// Completion handle for a worker
    pub fn producer(&self) -> Producer {
        Producer {
            tx: self.notify_tx.clone(),
        }
    }

    /// Enqueue one unit of work without blocking
    pub fn submit(&self, event: Event) -> Result<(), EngineError> {
        self.work_tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => EngineError::QueueFull,
            TrySendError::Disconnected(_) => EngineError::QueueDisconnected,
        })
    }

    /// Next completion, if one is ready
    pub fn try_completion(&self) -> Option<Event> {
        self.notify_rx.try_recv().ok()
    }

    /// Next completion, waiting up to `timeout`
    pub fn completion_timeout(&self, timeout: Duration) -> Result<Option<Event>, EngineError> {
        match self.notify_rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::QueueDisconnected),
        }
    }

    /// Work items not yet picked up
    pub fn pending_work(&self) -> usize {
        self.work_rx.len()
    }
}

/// A worker's private handle on the notification queue
#[derive(Clone)]
pub struct Producer {
    tx: Sender<Event>,
}

impl Producer {
    /// Publish a completion without blocking. The caller must treat an
    /// error as fatal: the lost completion stalls the frame.
    pub fn publish(&self, event: Event) -> Result<(), EngineError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(event) => EngineError::CompletionRejected(event.event_type, event.tag),
            TrySendError::Disconnected(_) => EngineError::QueueDisconnected,
        })
    }
}
