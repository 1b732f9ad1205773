//! Server network layer handling UDP communications and task coordination

use crate::accounts::AccountDirectory;
use crate::config::ServerConfig;
use crate::engine::{BroadcastEngine, Outgoing};
use crate::error::ServerError;
use crate::reaper::LivenessReaper;
use crate::session::SessionTable;
use log::{debug, error, info, warn};
use shared::{encode, Message, MAX_DATAGRAM_SIZE};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

/// Messages sent from network tasks to the dispatch loop
#[derive(Debug)]
pub enum ServerMessage {
    DatagramReceived { data: Vec<u8>, addr: SocketAddr },
}

/// Chat server owning the socket, the session table and the background tasks
pub struct Server {
    socket: Arc<UdpSocket>,
    sessions: Arc<RwLock<SessionTable>>,
    engine: Arc<BroadcastEngine>,
    config: ServerConfig,
}

impl Server {
    /// Validates the configuration and binds the listening socket.
    ///
    /// This is the only fallible step of the server's life; once bound, no
    /// single datagram can bring it down.
    pub async fn bind(
        config: ServerConfig,
        accounts: Arc<dyn AccountDirectory>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let socket = UdpSocket::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        info!("Server listening on {}", socket.local_addr()?);

        let sessions = Arc::new(RwLock::new(SessionTable::new(
            config.max_clients,
            config.join_grace,
        )));
        let engine = Arc::new(BroadcastEngine::new(
            Arc::clone(&sessions),
            accounts,
            config.echo_chat,
        ));

        Ok(Server {
            socket: Arc::new(socket),
            sessions,
            engine,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Runs until Ctrl+C
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await
    }

    /// Main dispatch loop
    ///
    /// Datagrams are handled one at a time; `shutdown` is only checked between
    /// them, so the session table is never left half-updated. On shutdown the
    /// receiver and reaper stop, every member is told the server is going away,
    /// and the sender drains its queue before this returns.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let receiver = spawn_network_receiver(
            Arc::clone(&self.socket),
            server_tx,
            shutdown_rx.clone(),
        );
        let sender = spawn_network_sender(
            Arc::clone(&self.socket),
            outgoing_rx,
            self.config.send_timeout,
        );
        let reaper = spawn_reaper(
            LivenessReaper::new(Arc::clone(&self.sessions), self.config.session_timeout),
            self.config.reap_interval,
            outgoing_tx.clone(),
            shutdown_rx,
        );

        info!("Server started successfully");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Server shutting down");
                    break;
                }
                message = server_rx.recv() => {
                    match message {
                        Some(ServerMessage::DatagramReceived { data, addr }) => {
                            let outgoing = self.engine.handle_datagram(&data, addr, Instant::now()).await;
                            queue_all(&outgoing_tx, outgoing);
                        }
                        None => {
                            error!("Network receiver stopped unexpectedly");
                            break;
                        }
                    }
                }
            }
        }

        let _ = shutdown_tx.send(true);
        for (name, handle) in [("receiver", receiver), ("reaper", reaper)] {
            if let Err(e) = handle.await {
                error!("{} task failed: {}", name, e);
            }
        }

        queue_all(&outgoing_tx, self.engine.shutdown().await);
        drop(outgoing_tx);
        if let Err(e) = sender.await {
            error!("sender task failed: {}", e);
        }

        info!("Server stopped");
        Ok(())
    }
}

fn queue_all(outgoing_tx: &mpsc::UnboundedSender<Outgoing>, outgoing: Vec<Outgoing>) {
    for out in outgoing {
        if let Err(e) = outgoing_tx.send(out) {
            error!("Failed to queue outgoing datagram: {}", e);
        }
    }
}

/// Spawns task that continuously listens for incoming datagrams
fn spawn_network_receiver(
    socket: Arc<UdpSocket>,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // One spare byte so oversized datagrams are seen as oversized rather than truncated
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE + 1];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = socket.recv_from(&mut buffer) => match result {
                    Ok((len, addr)) => {
                        let message = ServerMessage::DatagramReceived {
                            data: buffer[..len].to_vec(),
                            addr,
                        };
                        if let Err(e) = server_tx.send(message) {
                            error!("Failed to send datagram to main loop: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }
    })
}

/// Spawns task that processes the outgoing datagram queue
///
/// Runs until every sender handle is dropped, so queued notices still go out
/// during shutdown.
fn spawn_network_sender(
    socket: Arc<UdpSocket>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
    send_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(outgoing) = outgoing_rx.recv().await {
            match outgoing {
                Outgoing::Send { message, addr } => {
                    if let Some(data) = encode_for_send(&message) {
                        send_datagram(&socket, &data, addr, send_timeout).await;
                    }
                }
                Outgoing::Broadcast {
                    message,
                    recipients,
                } => {
                    let Some(data) = encode_for_send(&message) else {
                        continue;
                    };
                    debug!("Broadcasting {:?} to {} members", message.kind(), recipients.len());

                    let data: Arc<[u8]> = data.into();
                    let mut sends = JoinSet::new();
                    for addr in recipients {
                        let socket = Arc::clone(&socket);
                        let data = Arc::clone(&data);
                        sends.spawn(async move {
                            send_datagram(&socket, &data, addr, send_timeout).await;
                        });
                    }
                    while sends.join_next().await.is_some() {}
                }
            }
        }
    })
}

/// Spawns task that periodically evicts silent participants
fn spawn_reaper(
    reaper: LivenessReaper,
    period: Duration,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    queue_all(&outgoing_tx, reaper.tick(Instant::now()).await);
                }
            }
        }
    })
}

fn encode_for_send(message: &Message) -> Option<Vec<u8>> {
    match encode(message) {
        Ok(data) => Some(data),
        Err(e) => {
            error!("Failed to encode {:?}: {}", message.kind(), e);
            None
        }
    }
}

/// Sends one datagram. Failures are logged and never abort other sends.
async fn send_datagram(socket: &UdpSocket, data: &[u8], addr: SocketAddr, limit: Duration) {
    match tokio::time::timeout(limit, socket.send_to(data, addr)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("Failed to send to {}: {}", addr, e),
        Err(_) => error!("Timed out sending to {}", addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::InMemoryAccounts;
    use shared::{decode, ErrorReason, UNKNOWN_SEQ};
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        }
    }

    async fn start() -> (SocketAddr, oneshot::Sender<()>, JoinHandle<Result<(), ServerError>>) {
        let server = Server::bind(test_config(), Arc::new(InMemoryAccounts::with_default_root()))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx, handle)
    }

    async fn recv(socket: &UdpSocket) -> Message {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for reply")
            .unwrap();
        decode(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            bind_addr: taken.local_addr().unwrap().to_string(),
            ..ServerConfig::default()
        };

        let result = Server::bind(config, Arc::new(InMemoryAccounts::new())).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_binding() {
        let config = ServerConfig {
            max_clients: 0,
            ..test_config()
        };
        let result = Server::bind(config, Arc::new(InMemoryAccounts::new())).await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_ping_without_session_over_udp() {
        let (addr, stop, handle) = start().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client
            .send_to(&encode(&Message::Ping { seq: 3 }).unwrap(), addr)
            .await
            .unwrap();
        assert_eq!(
            recv(&client).await,
            Message::ErrorAck {
                seq: 3,
                reason: ErrorReason::NotJoined
            }
        );

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_datagram_over_udp() {
        let (addr, stop, handle) = start().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client
            .send_to(&vec![1u8; MAX_DATAGRAM_SIZE + 100], addr)
            .await
            .unwrap();
        assert_eq!(
            recv(&client).await,
            Message::ErrorAck {
                seq: UNKNOWN_SEQ,
                reason: ErrorReason::Oversized
            }
        );

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_notifies_members() {
        let (addr, stop, handle) = start().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let join = Message::Join {
            seq: 1,
            username: "root".to_string(),
            secret: "root".to_string(),
        };
        client.send_to(&encode(&join).unwrap(), addr).await.unwrap();
        assert!(matches!(recv(&client).await, Message::Welcome { seq: 1, .. }));

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(
            recv(&client).await,
            Message::Left {
                username: "root".to_string(),
                reason: shared::LeaveReason::ServerShutdown
            }
        );
    }
}
