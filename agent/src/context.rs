// agent/src/context.rs
//
// Bootstrap and teardown of the agent core. `init` walks the phases in a
// fixed order and either returns a ready context or the first failure,
// tagged with the phase it came from.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::error::{InitError, InitPhase};
use crate::sys::acl::{load_acl, Acl};
use crate::sys::amqp::LapinDialer;
use crate::sys::broker::{self, Binding, DialParams, Route};
use crate::sys::channels::QueueTopology;
use crate::sys::daemon::SystemDaemonizer;
use crate::sys::environment::HostEnvironment;
use crate::sys::logs::{self, AgentLog};
use crate::sys::refresher::{spawn_refresher, RefresherHandle};
use crate::sys::signals::arm_signal_bridge;
use crate::sys::systemd::{LinuxSystemdManager, SYSTEMD_DIR};
use crate::sys::traits::{BrokerDialer, BrokerSession, DaemonOutcome, Daemonizer, EnvironmentProvider};
use crate::sys::volatile::VolatileStore;

/// Time dependent tasks get to notice closed queues before the relay
/// connection goes away.
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Daemon,
    #[default]
    Foreground,
    CheckIn,
}

/// Write-once identity fields. Set during bootstrap before anything else can
/// see them, so they are read without the volatile lock.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentIdentity {
    pub bin_path: PathBuf,
    pub run_dir: PathBuf,
    pub queue_loc: String,
    pub mode: AgentMode,
    pub uid: String,
    pub respawn: bool,
    pub check_in: bool,
    pub modules: Vec<String>,
    pub tags: serde_json::Value,
}

pub struct BrokerHandles {
    pub binding: Binding,
    pub route: Route,
    session: Box<dyn BrokerSession>,
}

/// The ready agent, as handed from bootstrap to the long-running tasks.
pub struct AgentContext {
    pub acl: Acl,
    pub agent: Arc<AgentIdentity>,
    pub volatile: Arc<VolatileStore>,
    pub channels: QueueTopology,
    pub mq: Option<BrokerHandles>,
    pub op_id: u64,
    pub sleeper: Duration,
    pub socket: Option<String>,
    pub log: AgentLog,
    refresher: Option<RefresherHandle>,
    log_processor: Option<JoinHandle<()>>,
    signal_bridge: Option<JoinHandle<()>>,
    delivery_pump: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    pub foreground: bool,
    pub upgrade: bool,
    /// Off in tests: the global subscriber can be installed once per process.
    pub install_subscriber: bool,
}

pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// External collaborators of the bootstrap path.
pub struct Collaborators {
    pub environment: Arc<dyn EnvironmentProvider>,
    pub dialer: Arc<dyn BrokerDialer>,
    pub daemonizer: Arc<dyn Daemonizer>,
    pub env_lookup: EnvLookup,
}

impl Collaborators {
    /// Production wiring: host discovery, lapin, systemd.
    pub fn system(config: &AgentConfig, config_path: &Path) -> std::io::Result<Self> {
        let bin_path = std::env::current_exe()?;
        let services = LinuxSystemdManager::new(PathBuf::from(SYSTEMD_DIR), bin_path, config_path.to_path_buf());

        Ok(Self {
            environment: Arc::new(HostEnvironment::new(config.run_dir.clone())),
            dialer: Arc::new(LapinDialer),
            daemonizer: Arc::new(SystemDaemonizer::new(Box::new(services), config_path.to_path_buf())),
            env_lookup: Arc::new(|key| std::env::var(key).ok()),
        })
    }
}

fn agent_mode(config: &AgentConfig, options: &InitOptions) -> AgentMode {
    if config.check_in {
        AgentMode::CheckIn
    } else if options.foreground {
        AgentMode::Foreground
    } else {
        AgentMode::Daemon
    }
}

fn new_op_id() -> u64 {
    u64::try_from(Utc::now().timestamp_micros()).unwrap_or_default()
}

// ==============================================================================
// 1. Bootstrap
// ==============================================================================

pub async fn init(
    config: Arc<AgentConfig>,
    options: InitOptions,
    collab: Collaborators,
) -> Result<AgentContext, InitError> {
    // start → queues-ready
    let channels = QueueTopology::new().map_err(|e| InitError::phase(InitPhase::Queues, e))?;

    match bring_up(config, options, collab, channels.clone()).await {
        Ok(ctx) => Ok(ctx),
        Err(e) => {
            // Nothing half-initialized survives a failed bootstrap.
            channels.close_all();
            Err(e)
        }
    }
}

async fn bring_up(
    config: Arc<AgentConfig>,
    options: InitOptions,
    collab: Collaborators,
    channels: QueueTopology,
) -> Result<AgentContext, InitError> {
    // queues-ready → logging-ready
    if options.install_subscriber {
        logs::init_subscriber(&config.logging).map_err(|e| InitError::phase(InitPhase::Logging, e))?;
    }
    let log = AgentLog::new(channels.log.clone());
    let log_processor = logs::spawn_log_processor(channels.log.clone());

    // logging-ready → environment-seeded
    let snapshot = collab
        .environment
        .sample(&config.discovery)
        .await
        .map_err(|e| InitError::phase(InitPhase::Environment, e))?;

    let mut identity = AgentIdentity {
        bin_path: snapshot.bin_path.clone(),
        run_dir: snapshot.run_dir.clone(),
        queue_loc: snapshot.queue_loc.clone(),
        mode: agent_mode(&config, &options),
        uid: snapshot.uid.clone(),
        respawn: config.immortal,
        check_in: config.check_in,
        modules: config.modules.clone(),
        tags: config.tags.clone(),
    };

    let volatile = Arc::new(VolatileStore::new());
    volatile.apply(snapshot);
    volatile.set_modules(identity.modules.clone());
    log.debug(format!("agent environment seeded for {}", identity.queue_loc));

    // environment-seeded → (optional) daemonized
    if identity.mode == AgentMode::Daemon || options.upgrade {
        let outcome = collab
            .daemonizer
            .daemonize(&identity, options.upgrade, &log)
            .await
            .map_err(|e| InitError::phase(InitPhase::Daemonize, e))?;
        match outcome {
            DaemonOutcome::HandedOff => return Err(InitError::HandedOff),
            // The init system restarts us; respawning ourselves would race it.
            DaemonOutcome::Supervised => identity.respawn = false,
        }
    }

    // → permissions-loaded
    let acl = load_acl(&config.acl, &log).map_err(|e| InitError::phase(InitPhase::Permissions, e))?;

    // → broker-connected
    let sleeper = config.sleeper();
    let params = DialParams::new(config.clone(), &identity.queue_loc, sleeper)
        .map_err(|e| InitError::phase(InitPhase::Broker, e))?;
    let env_proxy = broker::proxy_from_env(params.host(), |key| (collab.env_lookup)(key));
    let mut connected = broker::connect(collab.dialer.as_ref(), &params, env_proxy, &log)
        .await
        .map_err(|e| InitError::phase(InitPhase::Broker, e))?;
    volatile.record_route(connected.route.proxy());

    // → signal-bridge-armed
    let signal_bridge = match arm_signal_bridge(channels.terminate.clone(), log.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            let _ = connected.session.close().await;
            return Err(InitError::phase(InitPhase::SignalBridge, e));
        }
    };

    // → ready: long-running work is handed to background tasks.
    let delivery_pump = connected
        .session
        .spawn_delivery_pump(channels.new_command.clone(), log.clone());
    let refresher = spawn_refresher(
        collab.environment.clone(),
        config.discovery.clone(),
        volatile.clone(),
        config.refresh_interval(),
        log.clone(),
    );

    log.info(format!("agent ready, mode {:?}", identity.mode));

    Ok(AgentContext {
        acl,
        agent: Arc::new(identity),
        volatile,
        channels,
        mq: Some(BrokerHandles {
            binding: params.binding.clone(),
            route: connected.route,
            session: connected.session,
        }),
        op_id: new_op_id(),
        sleeper,
        socket: config.socket.clone(),
        log,
        refresher: Some(refresher),
        log_processor: Some(log_processor),
        signal_bridge: Some(signal_bridge),
        delivery_pump,
    })
}

// ==============================================================================
// 2. Teardown
// ==============================================================================

impl AgentContext {
    pub async fn destroy(self) -> usize {
        self.destroy_with_grace(TEARDOWN_GRACE).await
    }

    /// Closes every queue, lets dependent tasks notice, then drops the relay
    /// connection. Returns the number of queues this call closed.
    pub async fn destroy_with_grace(mut self, grace: Duration) -> usize {
        if let Some(refresher) = self.refresher.take() {
            refresher.stop().await;
        }
        if let Some(bridge) = self.signal_bridge.take() {
            bridge.abort();
        }

        let closed = self.channels.close_all();
        tokio::time::sleep(grace).await;

        if let Some(mut mq) = self.mq.take() {
            if let Err(e) = mq.session.close().await {
                tracing::warn!("failed to close relay connection cleanly: {}", e);
            }
        }
        if let Some(pump) = self.delivery_pump.take() {
            pump.abort();
        }
        // The log consumer drains what is left, then exits on its own.
        if let Some(processor) = self.log_processor.take() {
            let _ = processor.await;
        }
        closed
    }
}
