//! Client transport: sends requests to the chat server and hands everything
//! else it receives to the caller as an unbounded stream of messages.

use crate::backoff::ExponentialBackoff;
use log::{debug, info, warn};
use shared::{
    decode, encode, CodecError, ErrorReason, LeaveReason, Message, MessageKind, MAX_DATAGRAM_SIZE,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Total time spent retransmitting a request before giving up
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const SEND_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("cannot resolve server address {0:?}")]
    Address(String),
    #[error("no reply from server within {0:?}")]
    Timeout(Duration),
    #[error("server refused: {0}")]
    Rejected(#[from] ErrorReason),
    #[error("unexpected {0:?} in reply")]
    Unexpected(MessageKind),
    #[error("join the room first")]
    NotJoined,
    #[error("client is shut down")]
    Closed,
}

#[derive(Debug, Clone)]
struct Credentials {
    username: String,
    secret: String,
}

type PendingReplies = Arc<Mutex<HashMap<u32, oneshot::Sender<Message>>>>;
type SharedCredentials = Arc<Mutex<Option<Credentials>>>;

/// Room membership as reported when joining
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    /// Sorted, always including this client's own username
    pub members: Vec<String>,
    /// Members the server left out to keep its reply within one datagram
    pub omitted: u32,
}

pub struct ChatClient {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    next_seq: AtomicU32,
    pending: PendingReplies,
    credentials: SharedCredentials,
    request_timeout: Duration,
    receiver: JoinHandle<()>,
}

impl ChatClient {
    /// Opens a socket towards `server_addr` (`host:port`).
    ///
    /// Returns the client and the stream of messages the server pushes
    /// (chat broadcasts, arrivals, departures, unsolicited errors). Replies to
    /// this client's own requests are consumed internally.
    pub async fn connect(
        server_addr: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Message>), ClientError> {
        Self::connect_with_timeout(server_addr, REQUEST_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        server_addr: &str,
        request_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Message>), ClientError> {
        let server = tokio::net::lookup_host(server_addr)
            .await
            .map_err(|_| ClientError::Address(server_addr.to_string()))?
            .next()
            .ok_or_else(|| ClientError::Address(server_addr.to_string()))?;

        let local = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        info!("Client socket {} talking to {}", socket.local_addr()?, server);

        let socket = Arc::new(socket);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let credentials: SharedCredentials = Arc::new(Mutex::new(None));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            Arc::clone(&pending),
            Arc::clone(&credentials),
            inbound_tx,
        ));

        let client = ChatClient {
            socket,
            server_addr: server,
            next_seq: AtomicU32::new(1),
            pending,
            credentials,
            request_timeout,
            receiver,
        };
        Ok((client, inbound_rx))
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub async fn username(&self) -> Option<String> {
        self.credentials
            .lock()
            .await
            .as_ref()
            .map(|c| c.username.clone())
    }

    /// Sends one message without waiting for a reply.
    pub async fn send(&self, message: &Message) -> Result<(), ClientError> {
        let data = encode(message)?;
        self.send_raw(&data).await
    }

    /// Joins the room, returning the members present (including this user).
    pub async fn join(&self, username: &str, secret: &str) -> Result<Roster, ClientError> {
        let reply = self
            .request(|seq| Message::Join {
                seq,
                username: username.to_string(),
                secret: secret.to_string(),
            })
            .await?;

        match reply {
            Message::Welcome {
                members, omitted, ..
            } => {
                *self.credentials.lock().await = Some(Credentials {
                    username: username.to_string(),
                    secret: secret.to_string(),
                });
                Ok(Roster { members, omitted })
            }
            other => Err(ClientError::Unexpected(other.kind())),
        }
    }

    /// Sends a chat line and waits for the server to accept it.
    pub async fn chat(&self, text: &str) -> Result<(), ClientError> {
        let username = self.username().await.ok_or(ClientError::NotJoined)?;
        let reply = self
            .request(|seq| Message::Chat {
                seq,
                username,
                text: text.to_string(),
            })
            .await?;
        expect_kind(reply, MessageKind::Ack)
    }

    /// Leaves the room. Leaving when the server has already forgotten us is
    /// not an error.
    pub async fn leave(&self) -> Result<(), ClientError> {
        let result = self.request(|seq| Message::Leave { seq }).await;
        *self.credentials.lock().await = None;

        match result {
            Ok(reply) => expect_kind(reply, MessageKind::Ack),
            Err(ClientError::Rejected(ErrorReason::NotJoined)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        let reply = self.request(|seq| Message::Ping { seq }).await?;
        expect_kind(reply, MessageKind::Pong)
    }

    /// Pings the server, re-joining with the stored credentials if the
    /// session was evicted. Returns true when a re-join happened.
    ///
    /// After the session was taken over by a JOIN from another address the
    /// credentials are dropped and this fails with [`ClientError::NotJoined`].
    pub async fn keep_alive(&self) -> Result<bool, ClientError> {
        match self.ping().await {
            Ok(()) => Ok(false),
            Err(ClientError::Rejected(ErrorReason::NotJoined)) => {
                let Some(credentials) = self.credentials.lock().await.clone() else {
                    return Err(ClientError::NotJoined);
                };
                warn!("Session expired, joining again as {}", credentials.username);
                self.join(&credentials.username, &credentials.secret)
                    .await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Spawns a task calling [`ChatClient::keep_alive`] every `period`.
    pub fn spawn_heartbeat(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if client.username().await.is_none() {
                    continue;
                }
                if let Err(e) = client.keep_alive().await {
                    warn!("Heartbeat failed: {}", e);
                }
            }
        })
    }

    fn next_seq(&self) -> u32 {
        // Zero is reserved for replies that cannot be matched to a request
        loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != shared::UNKNOWN_SEQ {
                return seq;
            }
        }
    }

    /// Sends a request and retransmits it with backoff until the matching
    /// reply arrives or the request timeout elapses. An `ErrorAck` reply
    /// becomes [`ClientError::Rejected`].
    async fn request(&self, build: impl FnOnce(u32) -> Message) -> Result<Message, ClientError> {
        let seq = self.next_seq();
        let data = encode(&build(seq))?;

        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, reply_tx);
        let result = self.await_reply(seq, &data, &mut reply_rx).await;
        self.pending.lock().await.remove(&seq);

        match result? {
            Message::ErrorAck { reason, .. } => Err(ClientError::Rejected(reason)),
            reply => Ok(reply),
        }
    }

    async fn await_reply(
        &self,
        seq: u32,
        data: &[u8],
        reply_rx: &mut oneshot::Receiver<Message>,
    ) -> Result<Message, ClientError> {
        let deadline = Instant::now() + self.request_timeout;
        let mut backoff =
            ExponentialBackoff::new(INITIAL_RETRY_DELAY, self.request_timeout, 2.0);

        loop {
            self.send_raw(data).await?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = backoff.next_delay().min(remaining);
            match tokio::time::timeout(wait, &mut *reply_rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => return Err(ClientError::Closed),
                Err(_) => {}
            }

            if Instant::now() >= deadline {
                return Err(ClientError::Timeout(self.request_timeout));
            }
            debug!("No reply to request {}, retransmitting", seq);
        }
    }

    async fn send_raw(&self, data: &[u8]) -> Result<(), ClientError> {
        match tokio::time::timeout(SEND_TIMEOUT, self.socket.send(data)).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(ClientError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "send timed out",
            ))),
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

fn expect_kind(reply: Message, kind: MessageKind) -> Result<(), ClientError> {
    if reply.kind() == kind {
        Ok(())
    } else {
        Err(ClientError::Unexpected(reply.kind()))
    }
}

/// Routes replies to waiting requests and everything else to `inbound_tx`.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    pending: PendingReplies,
    credentials: SharedCredentials,
    inbound_tx: mpsc::UnboundedSender<Message>,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE + 1];

    loop {
        let len = match socket.recv(&mut buffer).await {
            Ok(len) => len,
            Err(e) => {
                // Typically ICMP port unreachable while the server is down
                debug!("Error receiving datagram: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        let message = match decode(&buffer[..len]) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping datagram from server: {}", e);
                continue;
            }
        };

        if let Some(seq) = message.reply_seq().filter(|seq| *seq != shared::UNKNOWN_SEQ) {
            match pending.lock().await.remove(&seq) {
                Some(reply_tx) => {
                    let _ = reply_tx.send(message);
                }
                None => debug!("Late reply to request {}", seq),
            }
            continue;
        }

        if let Message::Left {
            username,
            reason: LeaveReason::Superseded,
        } = &message
        {
            let mut credentials = credentials.lock().await;
            if credentials.as_ref().is_some_and(|c| &c.username == username) {
                warn!("Session for {} was taken over from another address", username);
                *credentials = None;
            }
        }

        // The caller may have stopped listening; replies still need routing
        let _ = inbound_tx.send(message);
    }
}
