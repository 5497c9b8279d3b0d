// agent/src/sys/signals.rs
//
// The only cancellation entry point of the core: an OS interrupt becomes a
// message on the terminate queue. Unwinding is up to whoever reads it.

use std::io;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::sys::channels::{Queue, QueueClosed};
use crate::sys::logs::AgentLog;

pub const INTERRUPT: &str = "interrupt";

/// Registers the SIGINT handler now, so a registration failure surfaces
/// during bootstrap rather than later.
pub fn arm_signal_bridge(terminate: Arc<Queue<String>>, log: AgentLog) -> io::Result<JoinHandle<()>> {
    let mut interrupts = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        if interrupts.recv().await.is_some() {
            log.info(format!("caught signal '{}'", INTERRUPT));
            if forward_signal(&terminate, INTERRUPT).await.is_err() {
                log.debug("terminate queue closed before the signal could be forwarded");
            }
        }
    }))
}

pub async fn forward_signal(terminate: &Queue<String>, name: &str) -> Result<(), QueueClosed> {
    terminate.send(name.to_string()).await
}
