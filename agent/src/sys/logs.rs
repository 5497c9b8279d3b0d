// agent/src/sys/logs.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::sys::channels::Queue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub desc: String,
}

/// Cheap, cloneable producer handle onto the log queue.
///
/// Emitting never blocks, so a stalled log consumer can never deadlock the
/// connector or the orchestrator. Queued events keep send order: an event
/// that finds the queue full is dropped and counted, and the count is queued
/// as a single warning ahead of the next event that fits. Once the queue is
/// closed there is no consumer left and events go straight to the subscriber.
#[derive(Clone)]
pub struct AgentLog {
    queue: Arc<Queue<LogEvent>>,
    dropped: Arc<AtomicUsize>,
}

impl AgentLog {
    pub fn new(queue: Arc<Queue<LogEvent>>) -> Self {
        Self {
            queue,
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn debug(&self, desc: impl Into<String>) {
        self.emit(LogLevel::Debug, desc.into());
    }

    pub fn info(&self, desc: impl Into<String>) {
        self.emit(LogLevel::Info, desc.into());
    }

    pub fn warn(&self, desc: impl Into<String>) {
        self.emit(LogLevel::Warn, desc.into());
    }

    pub fn error(&self, desc: impl Into<String>) {
        self.emit(LogLevel::Error, desc.into());
    }

    fn emit(&self, level: LogLevel, desc: String) {
        let pending = self.dropped.swap(0, Ordering::AcqRel);
        if pending > 0 {
            let summary = LogEvent {
                level: LogLevel::Warn,
                desc: format!("log queue full, {} event(s) dropped", pending),
            };
            if let Err(summary) = self.queue.try_send(summary) {
                if self.queue.is_closed() {
                    forward(&summary);
                } else {
                    self.dropped.fetch_add(pending + 1, Ordering::AcqRel);
                    return;
                }
            }
        }

        if let Err(event) = self.queue.try_send(LogEvent { level, desc }) {
            if self.queue.is_closed() {
                forward(&event);
            } else {
                self.dropped.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}

pub fn forward(event: &LogEvent) {
    match event.level {
        LogLevel::Debug => tracing::debug!(target: "fleet_agent", "{}", event.desc),
        LogLevel::Info => tracing::info!(target: "fleet_agent", "{}", event.desc),
        LogLevel::Warn => tracing::warn!(target: "fleet_agent", "{}", event.desc),
        LogLevel::Error => tracing::error!(target: "fleet_agent", "{}", event.desc),
    }
}

/// Single consumer: events reach the subscriber in send order. Exits once the
/// queue is closed and drained.
pub fn spawn_log_processor(queue: Arc<Queue<LogEvent>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = queue.recv().await {
            forward(&event);
        }
    })
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_subscriber(config: &LoggingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| format!("invalid log level '{}': {}", config.level, e))?;

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };

    installed.map_err(|e| format!("failed to install log subscriber: {}", e))
}
