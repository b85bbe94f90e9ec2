//! The reconnect supervisor.
//!
//! A single task owns the current [`SshClient`], the target endpoint, and
//! the map of live channels with their cancellation handles. Everything
//! else talks to it through message passing: each inbound command carries
//! a completion ticket (a oneshot sender) so the caller can wait for the
//! result without sharing the supervisor's state.
//!
//! Commands:
//! - `halt` - close every channel, drop the client, stop the loop
//! - `reconnect(endpoint)` - drop the current client and channels, dial
//!   and authenticate again through the configured connector; the first
//!   failure is returned to the caller (retry policy stays with the
//!   caller)
//! - `status` - snapshot of the current client and channel map
//! - `open_channel` - open a `custom-inproc-stream` (or `direct-tcpip`)
//!   channel, attach the keepalive-only request consumer, apply the idle
//!   timeout, and hand the channel back through the ticket

use crate::ssh::channel::Channel;
use crate::ssh::client::SshClient;
use crate::ssh::connection::ChannelType;
use crate::ssh::session::keepalive::discard_requests_except_keepalives;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tether_platform::{TetherError, TetherResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A dial target: user plus host:port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Login name.
    pub user: String,
    /// Hostname or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Parses `user` and a `host:port` string. An empty host means
    /// loopback; the port is mandatory.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Format`] for a missing or non-numeric port.
    pub fn parse(user: &str, host_port: &str) -> TetherResult<Self> {
        let (host, port_str) = host_port.rsplit_once(':').ok_or_else(|| {
            TetherError::Format(format!("No port found in '{}'", host_port))
        })?;

        let port: u16 = port_str.parse().map_err(|_| {
            TetherError::Format(format!("Bad port in '{}': '{}'", host_port, port_str))
        })?;

        let host = if host.is_empty() {
            "127.0.0.1".to_string()
        } else {
            host.to_string()
        };

        Ok(Self {
            user: user.to_string(),
            host,
            port,
        })
    }

    /// Returns the `host:port` form.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Downstream target for `direct-tcpip` channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectTcpTarget {
    /// Downstream host.
    pub host: String,
    /// Downstream port.
    pub port: u16,
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Per-channel read-idle bound; zero disables it.
    pub idle_timeout_dur: Duration,
    /// Trust store handed to the connector's host-key policy.
    pub known_hosts: Option<PathBuf>,
    /// Path to the caller's signing key, for the connector's loader.
    pub private_key_path: Option<PathBuf>,
    /// Trust-on-first-use: let the connector pin an unknown server key.
    pub add_if_not_known: bool,
    /// Modulus size for generated RSA keys.
    pub bit_len_rsa_keys: usize,
    /// Request `direct-tcpip` forwarding instead of the in-process
    /// stream.
    pub direct_tcp: Option<DirectTcpTarget>,
    /// Deadline for each channel open.
    pub open_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            idle_timeout_dur: Duration::ZERO,
            known_hosts: None,
            private_key_path: None,
            add_if_not_known: false,
            bit_len_rsa_keys: 4096,
            direct_tcp: None,
            open_timeout: Duration::from_secs(5),
        }
    }
}

/// Dials and authenticates a client for an endpoint. Supplied by the
/// embedder; key loading and host-key storage live behind it.
pub type Connector = Arc<
    dyn Fn(Endpoint, SupervisorConfig) -> Pin<Box<dyn Future<Output = TetherResult<SshClient>> + Send>>
        + Send
        + Sync,
>;

/// Snapshot of the supervisor's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    /// Whether a client is currently connected.
    pub connected: bool,
    /// The current endpoint, if any.
    pub endpoint: Option<Endpoint>,
    /// Live channels in the supervisor's map.
    pub channels: usize,
}

enum Command {
    Halt,
    Reconnect {
        endpoint: Endpoint,
        ticket: oneshot::Sender<TetherResult<()>>,
    },
    Status {
        ticket: oneshot::Sender<SupervisorStatus>,
    },
    OpenChannel {
        ticket: oneshot::Sender<TetherResult<Arc<Channel>>>,
    },
    /// Internal: a channel's request consumer finished, so the channel is
    /// gone from the transport.
    ChannelDone(u32),
}

/// Handle to the supervisor task.
pub struct Supervisor {
    cmd_tx: mpsc::UnboundedSender<Command>,
    done_rx: Option<oneshot::Receiver<()>>,
}

impl Supervisor {
    /// Spawns the supervisor loop. No connection exists until the first
    /// [`Supervisor::reconnect`].
    pub fn new(config: SupervisorConfig, connector: Connector) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let state = SupervisorState {
            config,
            connector,
            cmd_tx: cmd_tx.clone(),
            client: None,
            endpoint: None,
            channels: HashMap::new(),
        };
        tokio::spawn(state.run(cmd_rx, done_tx));

        Self {
            cmd_tx,
            done_rx: Some(done_rx),
        }
    }

    /// Drops the current client, closes every channel, and dials the
    /// endpoint again. Dial errors are returned to this caller; the
    /// supervisor itself does not retry.
    pub async fn reconnect(&self, endpoint: Endpoint) -> TetherResult<()> {
        let (ticket, done) = oneshot::channel();
        self.cmd_tx
            .send(Command::Reconnect { endpoint, ticket })
            .map_err(|_| TetherError::Closed("supervisor stopped".to_string()))?;
        done.await
            .map_err(|_| TetherError::Closed("supervisor stopped".to_string()))?
    }

    /// Opens a new logical channel through the current client.
    pub async fn open_channel(&self) -> TetherResult<Arc<Channel>> {
        let (ticket, done) = oneshot::channel();
        self.cmd_tx
            .send(Command::OpenChannel { ticket })
            .map_err(|_| TetherError::Closed("supervisor stopped".to_string()))?;
        done.await
            .map_err(|_| TetherError::Closed("supervisor stopped".to_string()))?
    }

    /// Returns a snapshot of the supervisor's state.
    pub async fn status(&self) -> TetherResult<SupervisorStatus> {
        let (ticket, done) = oneshot::channel();
        self.cmd_tx
            .send(Command::Status { ticket })
            .map_err(|_| TetherError::Closed("supervisor stopped".to_string()))?;
        done.await
            .map_err(|_| TetherError::Closed("supervisor stopped".to_string()))
    }

    /// Terminates the loop: every channel's cancellation handle fires and
    /// the map empties before this returns.
    pub async fn halt(&mut self) {
        let _ = self.cmd_tx.send(Command::Halt);
        if let Some(done_rx) = self.done_rx.take() {
            let _ = done_rx.await;
        }
    }
}

struct SupervisorState {
    config: SupervisorConfig,
    connector: Connector,
    cmd_tx: mpsc::UnboundedSender<Command>,
    client: Option<SshClient>,
    endpoint: Option<Endpoint>,
    channels: HashMap<u32, ChannelEntry>,
}

struct ChannelEntry {
    channel: Arc<Channel>,
    consumer: JoinHandle<()>,
}

impl SupervisorState {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        done_tx: oneshot::Sender<()>,
    ) {
        debug!("Supervisor loop started");

        while let Some(command) = cmd_rx.recv().await {
            match command {
                Command::Halt => break,

                Command::Reconnect { endpoint, ticket } => {
                    let result = self.handle_reconnect(endpoint).await;
                    let _ = ticket.send(result);
                }

                Command::Status { ticket } => {
                    let _ = ticket.send(SupervisorStatus {
                        connected: self.client.is_some(),
                        endpoint: self.endpoint.clone(),
                        channels: self.channels.len(),
                    });
                }

                Command::OpenChannel { ticket } => {
                    let result = self.handle_open_channel().await;
                    let _ = ticket.send(result);
                }

                Command::ChannelDone(local_id) => {
                    if self.channels.remove(&local_id).is_some() {
                        debug!("Channel {} left the supervisor map", local_id);
                    }
                }
            }
        }

        self.close_channels();
        if let Some(mut client) = self.client.take() {
            client.disconnect();
        }
        let _ = done_tx.send(());
        debug!("Supervisor loop stopped");
    }

    async fn handle_reconnect(&mut self, endpoint: Endpoint) -> TetherResult<()> {
        info!("Reconnecting to {}", endpoint);
        self.close_channels();
        if let Some(mut client) = self.client.take() {
            client.disconnect();
        }
        self.endpoint = Some(endpoint.clone());

        match (self.connector)(endpoint, self.config.clone()).await {
            Ok(client) => {
                self.client = Some(client);
                Ok(())
            }
            Err(e) => {
                warn!("Reconnect failed: {}", e);
                Err(e)
            }
        }
    }

    async fn handle_open_channel(&mut self) -> TetherResult<Arc<Channel>> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| TetherError::Closed("not connected".to_string()))?;

        let channel_type = match &self.config.direct_tcp {
            Some(target) => ChannelType::DirectTcpip {
                host: target.host.clone(),
                port: u32::from(target.port),
                originator_address: "127.0.0.1".to_string(),
                originator_port: 0,
            },
            None => ChannelType::CustomInprocStream,
        };

        let channel = client
            .open_channel(channel_type, self.config.open_timeout)
            .await?;

        if !self.config.idle_timeout_dur.is_zero() {
            channel.set_idle_timeout(self.config.idle_timeout_dur);
        }

        let requests = channel
            .take_requests()
            .ok_or_else(|| TetherError::Closed("channel requests already taken".to_string()))?;
        let consumer = {
            let channel = Arc::clone(&channel);
            let notify = self.cmd_tx.clone();
            tokio::spawn(async move {
                let local_id = channel.local_id();
                discard_requests_except_keepalives(channel, requests).await;
                let _ = notify.send(Command::ChannelDone(local_id));
            })
        };

        self.channels.insert(
            channel.local_id(),
            ChannelEntry {
                channel: Arc::clone(&channel),
                consumer,
            },
        );
        Ok(channel)
    }

    fn close_channels(&mut self) {
        for (_, entry) in self.channels.drain() {
            let _ = entry.channel.close();
            entry.channel.halt();
            entry.consumer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let endpoint = Endpoint::parse("alice", "bastion:2022").unwrap();
        assert_eq!(endpoint.user, "alice");
        assert_eq!(endpoint.host, "bastion");
        assert_eq!(endpoint.port, 2022);
        assert_eq!(endpoint.addr(), "bastion:2022");
        assert_eq!(endpoint.to_string(), "alice@bastion:2022");
    }

    #[test]
    fn test_endpoint_parse_empty_host() {
        let endpoint = Endpoint::parse("alice", ":22").unwrap();
        assert_eq!(endpoint.host, "127.0.0.1");
    }

    #[test]
    fn test_endpoint_parse_errors() {
        assert!(matches!(
            Endpoint::parse("alice", "no-port"),
            Err(TetherError::Format(_))
        ));
        assert!(matches!(
            Endpoint::parse("alice", "host:99999"),
            Err(TetherError::Format(_))
        ));
    }

    #[test]
    fn test_supervisor_config_default() {
        let config = SupervisorConfig::default();
        assert!(config.idle_timeout_dur.is_zero());
        assert!(!config.add_if_not_known);
        assert_eq!(config.bit_len_rsa_keys, 4096);
        assert!(config.direct_tcp.is_none());
        assert_eq!(config.open_timeout, Duration::from_secs(5));
    }

    fn failing_connector() -> Connector {
        Arc::new(|endpoint, _config| {
            Box::pin(async move {
                Err(TetherError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("dial {}", endpoint.addr()),
                )))
            })
        })
    }

    #[tokio::test]
    async fn test_open_channel_without_connection() {
        let mut supervisor = Supervisor::new(SupervisorConfig::default(), failing_connector());

        assert!(matches!(
            supervisor.open_channel().await,
            Err(TetherError::Closed(_))
        ));
        supervisor.halt().await;
    }

    #[tokio::test]
    async fn test_reconnect_surfaces_first_failure() {
        let mut supervisor = Supervisor::new(SupervisorConfig::default(), failing_connector());

        let endpoint = Endpoint::parse("alice", "127.0.0.1:1").unwrap();
        assert!(matches!(
            supervisor.reconnect(endpoint).await,
            Err(TetherError::Io(_))
        ));

        let status = supervisor.status().await.unwrap();
        assert!(!status.connected);
        assert_eq!(status.channels, 0);
        assert!(status.endpoint.is_some());

        supervisor.halt().await;
    }

    #[tokio::test]
    async fn test_halt_is_idempotent_and_final() {
        let mut supervisor = Supervisor::new(SupervisorConfig::default(), failing_connector());
        supervisor.halt().await;

        assert!(matches!(
            supervisor.status().await,
            Err(TetherError::Closed(_))
        ));
    }
}
