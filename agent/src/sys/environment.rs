// agent/src/sys/environment.rs

use std::net::{SocketAddrV4, SocketAddrV6};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use serde::Serialize;
use tokio::fs;
use tracing::warn;

use crate::config::DiscoveryHints;
use crate::sys::traits::EnvironmentProvider;

const UID_FILE: &str = ".fleet-agent-id";
const AWS_METADATA_URL: &str = "http://169.254.169.254/latest/meta-data/";
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const AWS_METADATA_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AwsMeta {
    pub instance_id: String,
    pub local_ipv4: String,
    pub ami_id: String,
    pub instance_type: String,
}

/// One sample of host facts. Equality covers every field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentSnapshot {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub ident: String,
    pub init: String,
    pub addresses: Vec<String>,
    pub public_ip: String,
    pub aws: AwsMeta,

    // Static for the lifetime of the process.
    pub bin_path: PathBuf,
    pub run_dir: PathBuf,
    pub uid: String,
    pub queue_loc: String,
}

// ==============================================================================
// 1. Concrete Implementation (Linux host)
// ==============================================================================

pub struct HostEnvironment {
    run_dir: PathBuf,
}

impl HostEnvironment {
    pub fn new(run_dir: PathBuf) -> Self {
        Self { run_dir }
    }
}

#[async_trait]
impl EnvironmentProvider for HostEnvironment {
    async fn sample(&self, hints: &DiscoveryHints) -> Result<EnvironmentSnapshot, String> {
        let hostname = nix::unistd::gethostname()
            .map_err(|e| format!("failed to read hostname: {}", e))?
            .to_string_lossy()
            .into_owned();
        let os = std::env::consts::OS.to_string();
        let uid = load_or_create_uid(&self.run_dir).await?;
        let bin_path = std::env::current_exe()
            .map_err(|e| format!("failed to locate agent binary: {}", e))?;

        let ident = match fs::read_to_string("/etc/os-release").await {
            Ok(content) => parse_os_release(&content).unwrap_or_default(),
            Err(_) => String::new(),
        };

        let public_ip = if hints.discover_public_ip {
            discover_public_ip(hints).await.unwrap_or_else(|e| {
                warn!("public IP discovery failed: {}", e);
                String::new()
            })
        } else {
            String::new()
        };

        let aws = if hints.discover_aws_meta {
            discover_aws_meta().await
        } else {
            AwsMeta::default()
        };

        Ok(EnvironmentSnapshot {
            queue_loc: queue_location(&os, &hostname, &uid),
            hostname,
            os,
            arch: std::env::consts::ARCH.to_string(),
            ident,
            init: detect_init(),
            addresses: interface_addresses()?,
            public_ip,
            aws,
            bin_path,
            run_dir: self.run_dir.clone(),
            uid,
        })
    }
}

pub fn queue_location(os: &str, hostname: &str, uid: &str) -> String {
    format!("{}.{}.{}", os, hostname, uid)
}

/// Extracts `PRETTY_NAME` from an os-release file.
pub fn parse_os_release(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

fn detect_init() -> String {
    let init = if cfg!(target_os = "macos") {
        "launchd"
    } else if Path::new("/run/systemd/system").exists() {
        "systemd"
    } else if Path::new("/sbin/initctl").exists() {
        "upstart"
    } else {
        "sysvinit"
    };
    init.to_string()
}

/// Non-loopback interface addresses, sorted so that an unchanged host always
/// samples identically.
fn interface_addresses() -> Result<Vec<String>, String> {
    let mut addresses: Vec<String> = getifaddrs()
        .map_err(|e| format!("failed to list interfaces: {}", e))?
        .filter(|ifa| !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK))
        .filter_map(|ifa| {
            let addr = ifa.address?;
            if let Some(v4) = addr.as_sockaddr_in() {
                Some(SocketAddrV4::from(*v4).ip().to_string())
            } else {
                addr.as_sockaddr_in6()
                    .map(|v6| SocketAddrV6::from(*v6).ip().to_string())
            }
        })
        .collect();
    addresses.sort();
    addresses.dedup();
    Ok(addresses)
}

/// The agent UID survives restarts: it is read from the run directory and
/// generated on first start.
pub async fn load_or_create_uid(run_dir: &Path) -> Result<String, String> {
    let path = run_dir.join(UID_FILE);
    if let Ok(existing) = fs::read_to_string(&path).await {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    fs::create_dir_all(run_dir)
        .await
        .map_err(|e| format!("failed to create run directory {:?}: {}", run_dir, e))?;
    let uid = uuid::Uuid::new_v4().simple().to_string();
    fs::write(&path, &uid)
        .await
        .map_err(|e| format!("failed to persist agent id to {:?}: {}", path, e))?;
    Ok(uid)
}

// ==============================================================================
// 2. Remote Discovery
// ==============================================================================

/// Asks the API for our public address, first directly then through each
/// discovery proxy in order.
async fn discover_public_ip(hints: &DiscoveryHints) -> Result<String, String> {
    if hints.api_url.is_empty() {
        return Err("no discovery API URL configured".into());
    }
    let target = format!("{}ip", hints.api_url);

    let mut candidates = vec![None];
    candidates.extend(hints.proxies.iter().map(Some));

    let mut last_error = String::new();
    for proxy in candidates {
        let mut builder = reqwest::Client::builder().timeout(DISCOVERY_TIMEOUT);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(format!("http://{}", proxy))
                .map_err(|e| format!("invalid discovery proxy '{}': {}", proxy, e))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| e.to_string())?;

        match fetch_text(&client, &target).await {
            Ok(ip) if !ip.is_empty() => return Ok(ip),
            Ok(_) => last_error = "empty response".to_string(),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

async fn discover_aws_meta() -> AwsMeta {
    let client = match reqwest::Client::builder()
        .timeout(AWS_METADATA_TIMEOUT)
        .no_proxy()
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("cannot build metadata client: {}", e);
            return AwsMeta::default();
        }
    };

    let fetch = |field: &'static str| {
        let client = client.clone();
        async move {
            fetch_text(&client, &format!("{}{}", AWS_METADATA_URL, field))
                .await
                .unwrap_or_default()
        }
    };

    AwsMeta {
        instance_id: fetch("instance-id").await,
        local_ipv4: fetch("local-ipv4").await,
        ami_id: fetch("ami-id").await,
        instance_type: fetch("instance-type").await,
    }
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String, String> {
    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| e.to_string())?;
    let body = response.text().await.map_err(|e| e.to_string())?;
    Ok(body.trim().to_string())
}
