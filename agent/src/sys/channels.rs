// agent/src/sys/channels.rs
//
// Fixed internal queue topology. Producers: broker receiver, signal bridge,
// internal log emitters. Consumers: log processor, command dispatcher,
// result submitter.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

use crate::sys::logs::LogEvent;

// ==============================================================================
// 1. Capacities
// ==============================================================================
// Sized to absorb a burst without unbounded growth. The agent handles one
// broker message at a time (prefetch = 1), so the command-side queues only
// need room for a handful of in-flight operations; the log queue is the
// largest because every component emits into it.

pub const TERMINATE_CAPACITY: usize = 12;
pub const NEW_COMMAND_CAPACITY: usize = 7;
pub const RUN_AGENT_COMMAND_CAPACITY: usize = 5;
pub const RUN_EXTERNAL_COMMAND_CAPACITY: usize = 5;
pub const RESULTS_CAPACITY: usize = 5;
pub const LOG_CAPACITY: usize = 97;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("queue '{0}' is closed")]
pub struct QueueClosed(pub &'static str);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("queue '{name}' needs a positive capacity")]
pub struct QueueSetupError {
    pub name: &'static str,
}

/// An operation handed to a command module. Produced by the dispatcher
/// outside this core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleOp {
    pub command_id: u64,
    pub module: String,
    pub params: serde_json::Value,
}

/// A finished command on its way back to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: u64,
    pub status: String,
    pub results: Vec<serde_json::Value>,
}

// ==============================================================================
// 2. Closable bounded FIFO
// ==============================================================================

/// A bounded FIFO that can be closed from the owning side. Closing wakes
/// every task suspended in `send` or `recv`; `recv` still drains items that
/// were buffered before the close.
pub struct Queue<T> {
    name: &'static str,
    capacity: usize,
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    closed: watch::Sender<bool>,
}

async fn closed_signal(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

impl<T: Send> Queue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Result<Self, QueueSetupError> {
        if capacity == 0 {
            return Err(QueueSetupError { name });
        }
        let (tx, rx) = mpsc::channel(capacity);
        let (closed, _) = watch::channel(false);
        Ok(Self {
            name,
            capacity,
            tx,
            rx: Mutex::new(rx),
            closed,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Suspends while the queue is full. Fails once the queue is closed.
    pub async fn send(&self, item: T) -> Result<(), QueueClosed> {
        if self.is_closed() {
            return Err(QueueClosed(self.name));
        }
        tokio::select! {
            biased;
            _ = closed_signal(self.closed.subscribe()) => Err(QueueClosed(self.name)),
            sent = self.tx.send(item) => sent.map_err(|_| QueueClosed(self.name)),
        }
    }

    /// Never suspends. Hands the item back when the queue is full or closed.
    pub fn try_send(&self, item: T) -> Result<(), T> {
        if self.is_closed() {
            return Err(item);
        }
        self.tx.try_send(item).map_err(|e| e.into_inner())
    }

    /// Suspends while the queue is empty. Returns `None` once the queue is
    /// closed and drained.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        if !self.is_closed() {
            tokio::select! {
                biased;
                item = rx.recv() => return item,
                _ = closed_signal(self.closed.subscribe()) => {}
            }
        }
        rx.try_recv().ok()
    }

    /// Returns `true` only for the call that actually closed the queue.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }
}

// ==============================================================================
// 3. Topology
// ==============================================================================

#[derive(Clone)]
pub struct QueueTopology {
    pub terminate: Arc<Queue<String>>,
    pub new_command: Arc<Queue<Vec<u8>>>,
    pub run_agent_command: Arc<Queue<ModuleOp>>,
    pub run_external_command: Arc<Queue<ModuleOp>>,
    pub results: Arc<Queue<CommandResult>>,
    pub log: Arc<Queue<LogEvent>>,
}

impl QueueTopology {
    pub fn new() -> Result<Self, QueueSetupError> {
        Ok(Self {
            terminate: Arc::new(Queue::new("terminate", TERMINATE_CAPACITY)?),
            new_command: Arc::new(Queue::new("new_command", NEW_COMMAND_CAPACITY)?),
            run_agent_command: Arc::new(Queue::new(
                "run_agent_command",
                RUN_AGENT_COMMAND_CAPACITY,
            )?),
            run_external_command: Arc::new(Queue::new(
                "run_external_command",
                RUN_EXTERNAL_COMMAND_CAPACITY,
            )?),
            results: Arc::new(Queue::new("results", RESULTS_CAPACITY)?),
            log: Arc::new(Queue::new("log", LOG_CAPACITY)?),
        })
    }

    /// Closes every queue, the log queue last so teardown can still report
    /// progress. Returns how many queues this call closed.
    pub fn close_all(&self) -> usize {
        [
            self.terminate.close(),
            self.new_command.close(),
            self.run_agent_command.close(),
            self.run_external_command.close(),
            self.results.close(),
            self.log.close(),
        ]
        .into_iter()
        .filter(|closed| *closed)
        .count()
    }

    pub fn all_closed(&self) -> bool {
        self.terminate.is_closed()
            && self.new_command.is_closed()
            && self.run_agent_command.is_closed()
            && self.run_external_command.is_closed()
            && self.results.is_closed()
            && self.log.is_closed()
    }
}
