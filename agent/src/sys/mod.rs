// 🛡️ Zero-Trust Architecture: traits and managers are public, wiring lives in context.rs.

pub mod traits;      // Global contracts
pub mod secrets;     // Memory hygiene (KeyMaterial)
pub mod tls;         // Client certificate material
pub mod channels;    // Bounded internal queues
pub mod logs;        // Log queue and subscriber
pub mod acl;         // Permission loading
pub mod environment; // Host discovery
pub mod volatile;    // Lock-guarded environment view
pub mod refresher;   // Periodic environment resample
pub mod tunnel;      // HTTP CONNECT tunnelling
pub mod broker;      // Relay strategies and binding
pub mod amqp;        // lapin transport
pub mod signals;     // SIGINT bridge
pub mod systemd;     // Service unit management
pub mod daemon;      // Relaunch and service redeploy
pub mod status;      // Local status socket
