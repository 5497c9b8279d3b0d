// agent/src/sys/traits.rs
//
// Contracts at the edges of the core. Concrete implementations live next to
// their subsystem; tests swap in fakes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::DiscoveryHints;
use crate::context::AgentIdentity;
use crate::sys::broker::{DialParams, Route};
use crate::sys::channels::Queue;
use crate::sys::environment::EnvironmentSnapshot;
use crate::sys::logs::AgentLog;

// ==============================================================================
// 1. Host Discovery
// ==============================================================================

#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Samples the host. The result is compared structurally against the
    /// previous sample, so implementations must be deterministic for an
    /// unchanged host (e.g. stable address ordering).
    async fn sample(&self, hints: &DiscoveryHints) -> Result<EnvironmentSnapshot, String>;
}

// ==============================================================================
// 2. Broker Transport
// ==============================================================================

#[async_trait]
pub trait BrokerDialer: Send + Sync {
    /// Runs one connection strategy end to end: transport, TLS, channel,
    /// prefetch, queue declare, bind and consume. Any failure aborts only this
    /// attempt.
    async fn dial(&self, route: &Route, params: &DialParams) -> Result<Box<dyn BrokerSession>, String>;
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Hands the delivery stream to a task feeding `inbox`. Yields `None` when
    /// the stream was already taken.
    fn spawn_delivery_pump(&mut self, inbox: Arc<Queue<Vec<u8>>>, log: AgentLog) -> Option<JoinHandle<()>>;

    async fn close(&mut self) -> Result<(), String>;
}

// ==============================================================================
// 3. Process Lifecycle
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonOutcome {
    /// Running under an init system; respawning is its job, not ours.
    Supervised,
    /// Another process (or the service manager) took over. Exit now.
    HandedOff,
}

#[async_trait]
pub trait Daemonizer: Send + Sync {
    async fn daemonize(
        &self,
        identity: &AgentIdentity,
        upgrade: bool,
        log: &AgentLog,
    ) -> Result<DaemonOutcome, String>;
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn stop(&self) -> Result<(), String>;
    async fn remove(&self) -> Result<(), String>;
    async fn install(&self) -> Result<(), String>;
    async fn start(&self) -> Result<(), String>;
}
