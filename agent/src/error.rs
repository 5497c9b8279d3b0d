// agent/src/error.rs

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Bootstrap phases, in the order the orchestrator walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Queues,
    Logging,
    Environment,
    Daemonize,
    Permissions,
    Broker,
    SignalBridge,
}

impl fmt::Display for InitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InitPhase::Queues => "init queues",
            InitPhase::Logging => "init logging",
            InitPhase::Environment => "seed environment",
            InitPhase::Daemonize => "daemonize",
            InitPhase::Permissions => "load permissions",
            InitPhase::Broker => "connect broker",
            InitPhase::SignalBridge => "arm signal bridge",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("{phase} failed: {source}")]
    Phase {
        phase: InitPhase,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The process relaunched itself (or redeployed its service) and must exit.
    #[error("agent handed off to a new process")]
    HandedOff,
}

impl InitError {
    pub fn phase<E>(phase: InitPhase, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Phase {
            phase,
            source: source.into(),
        }
    }

    pub fn failed_phase(&self) -> Option<InitPhase> {
        match self {
            Self::Phase { phase, .. } => Some(*phase),
            Self::HandedOff => None,
        }
    }
}
