// agent/src/sys/amqp.rs

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::tcp::{HandshakeResult, OwnedTLSConfig, TcpStream};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::sys::broker::{Binding, DialParams, Route, EXCHANGE_TO_AGENTS};
use crate::sys::channels::Queue;
use crate::sys::logs::AgentLog;
use crate::sys::traits::{BrokerDialer, BrokerSession};
use crate::sys::tunnel;

/// One unacknowledged message at a time: a command is processed before the
/// next one is accepted.
const PREFETCH_COUNT: u16 = 1;

// ==============================================================================
// 1. Concrete Implementation (lapin)
// ==============================================================================

pub struct LapinDialer;

#[async_trait]
impl BrokerDialer for LapinDialer {
    async fn dial(&self, route: &Route, params: &DialParams) -> Result<Box<dyn BrokerSession>, String> {
        let tls = if params.use_tls {
            let material = params
                .config
                .tls
                .as_ref()
                .ok_or("amqps relay requires TLS material in the configuration")?;
            Some(material.owned_config()?)
        } else {
            None
        };

        let connect = transport_connector(route.proxy().map(str::to_string), params.target(), params.host().to_string(), tls);
        let connection = Connection::connector(params.uri.clone(), connect, connection_properties())
            .await
            .map_err(|e| format!("connection to relay failed: {}", e))?;

        match open_consumer(&connection, &params.binding).await {
            Ok((channel, consumer)) => Ok(Box::new(LapinSession {
                connection,
                _channel: channel,
                consumer: Some(consumer),
            })),
            Err(e) => {
                let _ = connection.close(200, "setup failed").await;
                Err(e)
            }
        }
    }
}

/// lapin drives its I/O on the agent's tokio runtime rather than a second
/// executor of its own.
fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}

fn qos_options() -> BasicQosOptions {
    BasicQosOptions { global: false }
}

/// The agent's queue outlives the agent process: durable, shared, kept when
/// the consumer goes away.
fn declare_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: true,
        exclusive: false,
        auto_delete: false,
        nowait: false,
    }
}

/// Manual acknowledgment, not exclusive, local delivery allowed.
fn consume_options() -> BasicConsumeOptions {
    BasicConsumeOptions {
        no_local: false,
        no_ack: false,
        exclusive: false,
        nowait: false,
    }
}

/// Builds the blocking socket factory handed to lapin: direct or tunnelled
/// TCP, then TLS on top when the relay requires it.
fn transport_connector(
    proxy: Option<String>,
    target: String,
    host: String,
    tls: Option<OwnedTLSConfig>,
) -> Box<dyn FnOnce(&AMQPUri) -> HandshakeResult + Send + Sync> {
    Box::new(move |_uri: &AMQPUri| {
        let raw = match proxy {
            Some(proxy) => tunnel::open_tunnel(&proxy, &target),
            None => tunnel::dial_direct(&target),
        }
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;

        let stream = TcpStream::try_from(raw).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        match tls {
            Some(config) => stream.into_tls(&host, config.as_ref()),
            None => Ok(stream),
        }
    })
}

async fn open_consumer(connection: &Connection, binding: &Binding) -> Result<(Channel, Consumer), String> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| format!("failed to open channel: {}", e))?;

    channel
        .basic_qos(PREFETCH_COUNT, qos_options())
        .await
        .map_err(|e| format!("failed to set prefetch: {}", e))?;

    channel
        .queue_declare(&binding.queue, declare_options(), FieldTable::default())
        .await
        .map_err(|e| format!("failed to declare queue {}: {}", binding.queue, e))?;

    channel
        .queue_bind(
            &binding.queue,
            EXCHANGE_TO_AGENTS,
            &binding.key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| format!("failed to bind queue {}: {}", binding.queue, e))?;

    let consumer = channel
        .basic_consume(&binding.queue, "", consume_options(), FieldTable::default())
        .await
        .map_err(|e| format!("failed to consume from {}: {}", binding.queue, e))?;

    Ok((channel, consumer))
}

pub struct LapinSession {
    connection: Connection,
    _channel: Channel,
    consumer: Option<Consumer>,
}

#[async_trait]
impl BrokerSession for LapinSession {
    fn spawn_delivery_pump(&mut self, inbox: Arc<Queue<Vec<u8>>>, log: AgentLog) -> Option<JoinHandle<()>> {
        let consumer = self.consumer.take()?;
        Some(tokio::spawn(pump_deliveries(consumer, inbox, log)))
    }

    async fn close(&mut self) -> Result<(), String> {
        self.connection
            .close(200, "agent shutdown")
            .await
            .map_err(|e| format!("failed to close relay connection: {}", e))
    }
}

// ==============================================================================
// 2. Delivery Pump
// ==============================================================================

/// Moves raw command bodies onto the new-command queue. A delivery is only
/// acknowledged once it has been queued.
async fn pump_deliveries(consumer: Consumer, inbox: Arc<Queue<Vec<u8>>>, log: AgentLog) {
    let mut deliveries = Box::pin(consumer);

    while let Some(delivery) = deliveries.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                log.error(format!("relay delivery failed: {}", e));
                break;
            }
        };

        if inbox.send(delivery.data.clone()).await.is_err() {
            log.debug("new command queue closed; stopping delivery pump");
            break;
        }
        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            log.error(format!("failed to acknowledge command: {}", e));
        }
    }
    log.debug("leaving delivery pump");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn uri() -> AMQPUri {
        "amqp://relay.example.net:5672/".parse().unwrap()
    }

    /// Answers one CONNECT with `reply` and holds the socket for a moment.
    fn fake_proxy(reply: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(conn.try_clone().unwrap());
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                line.clear();
            }
            conn.write_all(reply.as_bytes()).unwrap();
            thread::sleep(Duration::from_millis(200));
            request_line
        });
        (addr, handle)
    }

    #[test]
    fn consumer_contract_matches_broker_layout() {
        assert_eq!(PREFETCH_COUNT, 1);
        assert!(!qos_options().global);

        let declare = declare_options();
        assert!(declare.durable);
        assert!(!declare.exclusive);
        assert!(!declare.auto_delete);
        assert!(!declare.passive);

        let consume = consume_options();
        assert!(!consume.no_ack);
        assert!(!consume.no_local);
        assert!(!consume.exclusive);

        assert_eq!(EXCHANGE_TO_AGENTS, "toagents");
    }

    #[tokio::test]
    async fn connection_runs_on_the_tokio_runtime() {
        let props = connection_properties();
        assert!(props.executor.is_some());
        assert!(props.reactor.is_some());
    }

    #[test]
    fn direct_route_yields_plain_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap().to_string();

        let connect = transport_connector(None, target, "127.0.0.1".into(), None);
        assert!(matches!(connect(&uri()), Ok(TcpStream::Plain(..))));
        assert!(listener.accept().is_ok());
    }

    #[test]
    fn proxy_route_tunnels_then_yields_plain_socket() {
        let (proxy, handle) = fake_proxy("HTTP/1.1 200 Connection established\r\n\r\n");

        let connect = transport_connector(Some(proxy), "relay.example.net:5672".into(), "relay.example.net".into(), None);
        assert!(matches!(connect(&uri()), Ok(TcpStream::Plain(..))));
        assert_eq!(handle.join().unwrap(), "CONNECT relay.example.net:5672 HTTP/1.1\r\n");
    }

    #[test]
    fn refusing_proxy_fails_the_handshake() {
        let (proxy, handle) = fake_proxy("HTTP/1.1 403 Forbidden\r\n\r\n");

        let connect = transport_connector(Some(proxy), "relay.example.net:5672".into(), "relay.example.net".into(), None);
        assert!(connect(&uri()).is_err());
        handle.join().unwrap();
    }
}
