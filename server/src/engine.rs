//! Per-datagram protocol handling
//!
//! The engine turns one inbound datagram into zero or more outbound ones. It
//! does no I/O itself: the network layer feeds it bytes and a source address
//! and sends whatever [`Outgoing`] values it returns. Membership is the only
//! state it touches, always through the shared session table lock, and every
//! read-then-write sequence happens under a single write guard.
//!
//! | Received | Condition | Reply to sender | Broadcast |
//! |---|---|---|---|
//! | JOIN | bad credentials | `ErrorAck(AuthFailed)` | none |
//! | JOIN | accepted | `Welcome` with member list (truncated to fit) | `Joined` to the others (not on a duplicate) |
//! | JOIN | rejected | `ErrorAck(AlreadyConnected / ServerFull)` | none |
//! | CHAT | member | `Ack` | `ChatBroadcast` (not on a duplicate) |
//! | LEAVE | member | `Ack` | `Left` to the remaining members |
//! | PING | member | `Pong` | none |
//! | CHAT / LEAVE / PING | not a member, or CHAT from another address | `ErrorAck(NotJoined)` | none |
//! | undecodable | | `ErrorAck` with `seq` 0 | none |

use crate::accounts::AccountDirectory;
use crate::session::{JoinKind, JoinOutcome, JoinRejection, SessionTable};
use log::{debug, error, info, warn};
use shared::{decode, ErrorReason, LeaveReason, Message, UNKNOWN_SEQ};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Datagrams the engine wants sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// A reply to one address
    Send { message: Message, addr: SocketAddr },
    /// The same message to every address captured in a membership snapshot
    Broadcast {
        message: Message,
        recipients: Vec<SocketAddr>,
    },
}

impl Outgoing {
    fn broadcast_to(
        message: Message,
        members: &[(String, SocketAddr)],
        exclude: Option<&str>,
    ) -> Option<Self> {
        let recipients: Vec<SocketAddr> = members
            .iter()
            .filter(|(username, _)| Some(username.as_str()) != exclude)
            .map(|(_, addr)| *addr)
            .collect();

        if recipients.is_empty() {
            None
        } else {
            Some(Outgoing::Broadcast {
                message,
                recipients,
            })
        }
    }
}

pub struct BroadcastEngine {
    sessions: Arc<RwLock<SessionTable>>,
    accounts: Arc<dyn AccountDirectory>,
    echo_chat: bool,
}

impl BroadcastEngine {
    pub fn new(
        sessions: Arc<RwLock<SessionTable>>,
        accounts: Arc<dyn AccountDirectory>,
        echo_chat: bool,
    ) -> Self {
        Self {
            sessions,
            accounts,
            echo_chat,
        }
    }

    /// Decodes and handles one datagram. Never fails: every problem becomes
    /// an `ErrorAck` to the sender or a dropped datagram.
    pub async fn handle_datagram(
        &self,
        data: &[u8],
        addr: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        match decode(data) {
            Ok(message) => self.handle_message(message, addr, now).await,
            Err(e) => {
                warn!("Dropping datagram from {}: {}", addr, e);
                vec![error_ack(UNKNOWN_SEQ, e.reason(), addr)]
            }
        }
    }

    pub async fn handle_message(
        &self,
        message: Message,
        addr: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        debug!("{:?} from {}", message.kind(), addr);

        match message {
            Message::Join {
                seq,
                username,
                secret,
            } => self.handle_join(seq, username, &secret, addr, now).await,
            Message::Chat {
                seq,
                username,
                text,
            } => self.handle_chat(seq, username, text, addr, now).await,
            Message::Leave { seq } => self.handle_leave(seq, addr).await,
            Message::Ping { seq } => self.handle_ping(seq, addr, now).await,
            other => {
                warn!("Unexpected {:?} from {}", other.kind(), addr);
                Vec::new()
            }
        }
    }

    async fn handle_join(
        &self,
        seq: u32,
        username: String,
        secret: &str,
        addr: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        if !self.accounts.verify(&username, secret) {
            warn!("Authentication failed for {:?} from {}", username, addr);
            return vec![error_ack(seq, ErrorReason::AuthFailed, addr)];
        }

        // The welcome is built before the table changes so a join is never
        // committed without a reply that can be sent
        let (outcome, welcome, members) = {
            let mut sessions = self.sessions.write().await;
            let mut roster: Vec<String> =
                sessions.snapshot().into_iter().map(|(name, _)| name).collect();
            if let Err(at) = roster.binary_search(&username) {
                roster.insert(at, username.clone());
            }

            match Message::welcome(seq, &username, &roster) {
                Ok(welcome) => {
                    let outcome = sessions.join(&username, addr, now);
                    (outcome, welcome, sessions.snapshot())
                }
                Err(e) => {
                    error!("Cannot build welcome for {}: {}", username, e);
                    return vec![error_ack(seq, e.reason(), addr)];
                }
            }
        };

        let kind = match outcome {
            JoinOutcome::Accepted(kind) => kind,
            JoinOutcome::Rejected(rejection) => {
                warn!("Rejected join of {} from {}: {:?}", username, addr, rejection);
                let reason = match rejection {
                    JoinRejection::AlreadyConnected => ErrorReason::AlreadyConnected,
                    JoinRejection::ServerFull => ErrorReason::ServerFull,
                };
                return vec![error_ack(seq, reason, addr)];
            }
        };

        let mut outgoing = vec![Outgoing::Send {
            message: welcome,
            addr,
        }];

        if let JoinKind::Superseded { previous } = kind {
            outgoing.push(Outgoing::Send {
                message: Message::Left {
                    username: username.clone(),
                    reason: LeaveReason::Superseded,
                },
                addr: previous,
            });
        }

        if kind != JoinKind::Duplicate {
            outgoing.extend(Outgoing::broadcast_to(
                Message::Joined {
                    username: username.clone(),
                },
                &members,
                Some(username.as_str()),
            ));
        }

        outgoing
    }

    async fn handle_chat(
        &self,
        seq: u32,
        username: String,
        text: String,
        addr: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        // CHAT carries no credentials, so it only counts from the address the
        // last authenticated JOIN bound
        let relay = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&username).map(|participant| participant.addr) {
                Some(bound) if bound == addr => {
                    let fresh = sessions.touch(&username, addr, now).is_ok()
                        && sessions.record_chat(&username, seq).unwrap_or(false);
                    Some((fresh, sessions.snapshot()))
                }
                Some(bound) => {
                    warn!(
                        "Chat as {} from {} ignored, session is bound to {}",
                        username, addr, bound
                    );
                    None
                }
                None => {
                    warn!("Chat from {} at {} without a session", username, addr);
                    None
                }
            }
        };

        let Some((fresh, members)) = relay else {
            return vec![error_ack(seq, ErrorReason::NotJoined, addr)];
        };

        let mut outgoing = vec![Outgoing::Send {
            message: Message::Ack { seq },
            addr,
        }];

        if !fresh {
            debug!("Duplicate chat {} from {}", seq, username);
            return outgoing;
        }

        let exclude = if self.echo_chat {
            None
        } else {
            Some(username.as_str())
        };
        outgoing.extend(Outgoing::broadcast_to(
            Message::ChatBroadcast {
                sender: username.clone(),
                text,
            },
            &members,
            exclude,
        ));
        outgoing
    }

    async fn handle_leave(&self, seq: u32, addr: SocketAddr) -> Vec<Outgoing> {
        let departed = {
            let mut sessions = self.sessions.write().await;
            match sessions.find_by_addr(addr) {
                Some(username) => {
                    sessions.leave(&username);
                    Some((username, sessions.snapshot()))
                }
                None => None,
            }
        };

        let Some((username, remaining)) = departed else {
            debug!("Leave from {} without a session", addr);
            return vec![error_ack(seq, ErrorReason::NotJoined, addr)];
        };

        let mut outgoing = vec![Outgoing::Send {
            message: Message::Ack { seq },
            addr,
        }];
        outgoing.extend(Outgoing::broadcast_to(
            Message::Left {
                username,
                reason: LeaveReason::Left,
            },
            &remaining,
            None,
        ));
        outgoing
    }

    async fn handle_ping(&self, seq: u32, addr: SocketAddr, now: Instant) -> Vec<Outgoing> {
        let touched = {
            let mut sessions = self.sessions.write().await;
            match sessions.find_by_addr(addr) {
                Some(username) => sessions.touch(&username, addr, now).is_ok(),
                None => false,
            }
        };

        if touched {
            vec![Outgoing::Send {
                message: Message::Pong { seq },
                addr,
            }]
        } else {
            debug!("Ping from {} without a session", addr);
            vec![error_ack(seq, ErrorReason::NotJoined, addr)]
        }
    }

    /// Empties the room, returning the shutdown notice for everyone who was in it.
    pub async fn shutdown(&self) -> Vec<Outgoing> {
        let members = {
            let mut sessions = self.sessions.write().await;
            let members = sessions.snapshot();
            for (username, _) in &members {
                sessions.leave(username);
            }
            members
        };

        if !members.is_empty() {
            info!("Notifying {} members of shutdown", members.len());
        }

        members
            .iter()
            .map(|(username, addr)| Outgoing::Send {
                message: Message::Left {
                    username: username.clone(),
                    reason: LeaveReason::ServerShutdown,
                },
                addr: *addr,
            })
            .collect()
    }
}

fn error_ack(seq: u32, reason: ErrorReason, addr: SocketAddr) -> Outgoing {
    Outgoing::Send {
        message: Message::ErrorAck { seq, reason },
        addr,
    }
}
