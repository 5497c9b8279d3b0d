// agent/src/sys/systemd.rs

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;

use crate::sys::traits::ServiceManager;

pub const SERVICE_NAME: &str = "fleet-agent";
pub const SYSTEMD_DIR: &str = "/etc/systemd/system";

pub struct LinuxSystemdManager {
    systemd_dir: PathBuf, // Injected path
    service_name: String,
    bin_path: PathBuf,
    config_path: PathBuf,
}

impl LinuxSystemdManager {
    pub fn new(systemd_dir: PathBuf, bin_path: PathBuf, config_path: PathBuf) -> Self {
        Self {
            systemd_dir,
            service_name: SERVICE_NAME.to_string(),
            bin_path,
            config_path,
        }
    }

    fn unit_path(&self) -> PathBuf {
        self.systemd_dir.join(format!("{}.service", self.service_name))
    }

    async fn systemctl(&self, args: &[&str]) -> Result<(), String> {
        let output = Command::new("systemctl")
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to run systemctl: {}", e))?;
        if !output.status.success() {
            return Err(format!(
                "systemctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// Renders the unit that keeps the agent running in the foreground under
/// systemd supervision.
pub fn unit_file_contents(service_name: &str, bin_path: &str, config_path: &str) -> String {
    format!(
        r#"[Unit]
Description=Fleet endpoint agent ({service_name})
Wants=network-online.target
After=network-online.target

[Service]
Type=simple
ExecStart={bin_path} --foreground --config {config_path}
Restart=always
RestartSec=3

# --- 🛡️ Security Directives ---
NoNewPrivileges=true
PrivateTmp=true
ProtectKernelTunables=true
ProtectKernelModules=true
ProtectControlGroups=true

[Install]
WantedBy=multi-user.target
"#
    )
}

#[async_trait]
impl ServiceManager for LinuxSystemdManager {
    async fn stop(&self) -> Result<(), String> {
        self.systemctl(&["stop", &self.service_name]).await
    }

    async fn remove(&self) -> Result<(), String> {
        self.systemctl(&["disable", &self.service_name]).await?;
        fs::remove_file(self.unit_path())
            .await
            .map_err(|e| format!("failed to remove systemd unit: {}", e))?;
        self.systemctl(&["daemon-reload"]).await
    }

    async fn install(&self) -> Result<(), String> {
        let unit = unit_file_contents(
            &self.service_name,
            &self.bin_path.to_string_lossy(),
            &self.config_path.to_string_lossy(),
        );
        fs::write(self.unit_path(), unit)
            .await
            .map_err(|e| format!("failed to write systemd unit: {}", e))?;
        self.systemctl(&["daemon-reload"]).await?;
        self.systemctl(&["enable", &self.service_name]).await
    }

    async fn start(&self) -> Result<(), String> {
        self.systemctl(&["start", &self.service_name]).await
    }
}
