// agent/src/sys/status.rs
//
// Local status socket: one line-oriented command per line, one JSON or text
// line back. Only started when `AgentConfig::socket` names an address.

use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;

use crate::context::AgentIdentity;
use crate::sys::logs::AgentLog;
use crate::sys::volatile::VolatileStore;

/// Builds the reply for one command line.
pub fn respond(command: &str, identity: &AgentIdentity, store: &VolatileStore) -> String {
    match command.trim() {
        "pid" => std::process::id().to_string(),
        "status" => json!({
            "queue_loc": identity.queue_loc,
            "mode": identity.mode,
            "uid": identity.uid,
            "tags": identity.tags,
            "volatile": store.read(),
        })
        .to_string(),
        other => format!("error: unknown command '{}'", other),
    }
}

pub async fn bind(addr: &str) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Accepts connections until the listener fails. Each connection gets its own
/// task so a slow client cannot hold up the others.
pub fn serve(
    listener: TcpListener,
    identity: Arc<AgentIdentity>,
    store: Arc<VolatileStore>,
    log: AgentLog,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut incoming = TcpListenerStream::new(listener);
        while let Some(conn) = incoming.next().await {
            match conn {
                Ok(stream) => {
                    let identity = identity.clone();
                    let store = store.clone();
                    let log = log.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle(stream, &identity, &store).await {
                            log.debug(format!("status connection ended: {}", e));
                        }
                    });
                }
                Err(e) => log.warn(format!("status socket accept failed: {}", e)),
            }
        }
    })
}

async fn handle(stream: TcpStream, identity: &AgentIdentity, store: &VolatileStore) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut reply = respond(&line, identity, store);
        reply.push('\n');
        writer.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::channels::Queue;
    use crate::sys::environment::EnvironmentSnapshot;

    fn identity() -> AgentIdentity {
        AgentIdentity {
            queue_loc: "linux.web-01.abcd".into(),
            uid: "abcd".into(),
            tags: serde_json::json!({ "operator": "IT", "env": "prod" }),
            ..AgentIdentity::default()
        }
    }

    #[test]
    fn pid_command_returns_own_pid() {
        let store = VolatileStore::new();
        assert_eq!(respond("pid\n", &identity(), &store), std::process::id().to_string());
    }

    #[test]
    fn status_command_is_json() {
        let store = VolatileStore::new();
        store.apply(EnvironmentSnapshot {
            hostname: "web-01".into(),
            ..Default::default()
        });
        let reply: serde_json::Value = serde_json::from_str(&respond("status", &identity(), &store)).unwrap();
        assert_eq!(reply["queue_loc"], "linux.web-01.abcd");
        assert_eq!(reply["volatile"]["hostname"], "web-01");
        assert_eq!(reply["tags"]["operator"], "IT");
    }

    #[test]
    fn unknown_command_is_an_error_line() {
        let store = VolatileStore::new();
        assert_eq!(respond("shutdown", &identity(), &store), "error: unknown command 'shutdown'");
    }

    #[tokio::test]
    async fn serves_commands_over_loopback() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = AgentLog::new(Arc::new(Queue::new("log", 16).unwrap()));
        let server = serve(listener, Arc::new(identity()), Arc::new(VolatileStore::new()), log);

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"pid\nbogus\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), std::process::id().to_string());
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("error:"));

        server.abort();
    }
}
