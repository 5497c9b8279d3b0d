// agent/src/sys/daemon.rs

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;

use crate::context::AgentIdentity;
use crate::sys::logs::AgentLog;
use crate::sys::traits::{DaemonOutcome, Daemonizer, ServiceManager};

/// Replaces the installed service with the running binary. Stopping and
/// removing the old service may fail (it may not exist yet); installing and
/// starting the new one may not.
pub async fn service_deploy(services: &dyn ServiceManager, log: &AgentLog) -> Result<(), String> {
    log.info("Service deploy: stopping existing service");
    if let Err(e) = services.stop().await {
        log.info(format!("Service deploy: stop failed, continuing: {}", e));
    }

    log.info("Service deploy: removing existing service");
    if let Err(e) = services.remove().await {
        log.info(format!("Service deploy: remove failed, continuing: {}", e));
    }

    services
        .install()
        .await
        .map_err(|e| format!("service install failed: {}", e))?;
    log.info("Service deploy: installed service");

    services
        .start()
        .await
        .map_err(|e| format!("service start failed: {}", e))?;
    log.info("Service deploy: started service");
    Ok(())
}

pub struct SystemDaemonizer {
    services: Box<dyn ServiceManager>,
    config_path: PathBuf,
}

impl SystemDaemonizer {
    pub fn new(services: Box<dyn ServiceManager>, config_path: PathBuf) -> Self {
        Self { services, config_path }
    }

    fn relaunch(&self, identity: &AgentIdentity) -> Result<u32, String> {
        // std spawn; the child must outlive our runtime.
        let child = self
            .foreground_command(identity)
            .spawn()
            .map_err(|e| format!("failed to relaunch {:?}: {}", identity.bin_path, e))?;
        Ok(child.id())
    }

    fn foreground_command(&self, identity: &AgentIdentity) -> std::process::Command {
        use std::os::unix::process::CommandExt;

        let mut cmd = std::process::Command::new(&identity.bin_path);
        cmd.arg("--foreground")
            .arg("--config")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        cmd
    }
}

#[async_trait]
impl Daemonizer for SystemDaemonizer {
    async fn daemonize(
        &self,
        identity: &AgentIdentity,
        upgrade: bool,
        log: &AgentLog,
    ) -> Result<DaemonOutcome, String> {
        if upgrade {
            service_deploy(self.services.as_ref(), log).await?;
            return Ok(DaemonOutcome::HandedOff);
        }

        if nix::unistd::getppid().as_raw() == 1 {
            log.debug("parent is init; running under supervision");
            return Ok(DaemonOutcome::Supervised);
        }

        let pid = self.relaunch(identity)?;
        log.info(format!("relaunched agent in the background as pid {}", pid));
        Ok(DaemonOutcome::HandedOff)
    }
}
