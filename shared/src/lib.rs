//! Wire protocol shared by the chat server and its clients.
//!
//! Every datagram carries exactly one [`Message`]. Client-originated messages
//! carry a sequence number which the server echoes in its reply so the client
//! can match acknowledgements to requests and retransmit lost ones.

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;

/// Largest datagram payload either side will produce or accept.
pub const MAX_DATAGRAM_SIZE: usize = 2048;
pub const MAX_USERNAME_LEN: usize = 32;

/// Sequence number used in replies that cannot be tied to a request.
pub const UNKNOWN_SEQ: u32 = 0;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Message {
    // Client -> server
    Join {
        seq: u32,
        username: String,
        secret: String,
    },
    Chat {
        seq: u32,
        username: String,
        text: String,
    },
    Leave {
        seq: u32,
    },
    Ping {
        seq: u32,
    },

    // Server -> client
    /// `members` is sorted and always contains the joiner; `omitted` counts
    /// members left out to keep the datagram within [`MAX_DATAGRAM_SIZE`].
    Welcome {
        seq: u32,
        members: Vec<String>,
        omitted: u32,
    },
    Ack {
        seq: u32,
    },
    Pong {
        seq: u32,
    },
    ErrorAck {
        seq: u32,
        reason: ErrorReason,
    },
    Joined {
        username: String,
    },
    Left {
        username: String,
        reason: LeaveReason,
    },
    ChatBroadcast {
        sender: String,
        text: String,
    },
}

/// Coarse classification of a [`Message`], used for logging and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Join,
    Chat,
    Leave,
    Ping,
    Welcome,
    Ack,
    Pong,
    ErrorAck,
    Joined,
    Left,
    ChatBroadcast,
}

/// Reason carried by an `ErrorAck`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorReason {
    #[error("authentication failed")]
    AuthFailed,
    #[error("username is already connected")]
    AlreadyConnected,
    #[error("server is full")]
    ServerFull,
    #[error("not joined")]
    NotJoined,
    #[error("malformed datagram")]
    Malformed,
    #[error("datagram too large")]
    Oversized,
    #[error("username must be 1 to 32 characters")]
    InvalidUsername,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Left,
    TimedOut,
    Superseded,
    ServerShutdown,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },
    #[error("malformed payload: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("invalid username {0:?}")]
    InvalidUsername(String),
}

impl CodecError {
    /// The reason to report back to the peer that sent the offending datagram.
    pub fn reason(&self) -> ErrorReason {
        match self {
            CodecError::Oversized { .. } => ErrorReason::Oversized,
            CodecError::Malformed(_) => ErrorReason::Malformed,
            CodecError::InvalidUsername(_) => ErrorReason::InvalidUsername,
        }
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Join { .. } => MessageKind::Join,
            Message::Chat { .. } => MessageKind::Chat,
            Message::Leave { .. } => MessageKind::Leave,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Welcome { .. } => MessageKind::Welcome,
            Message::Ack { .. } => MessageKind::Ack,
            Message::Pong { .. } => MessageKind::Pong,
            Message::ErrorAck { .. } => MessageKind::ErrorAck,
            Message::Joined { .. } => MessageKind::Joined,
            Message::Left { .. } => MessageKind::Left,
            Message::ChatBroadcast { .. } => MessageKind::ChatBroadcast,
        }
    }

    /// Sequence number of a reply, if this message answers a request.
    pub fn reply_seq(&self) -> Option<u32> {
        match self {
            Message::Welcome { seq, .. }
            | Message::Ack { seq }
            | Message::Pong { seq }
            | Message::ErrorAck { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Builds the reply to an accepted JOIN from `joiner`.
    ///
    /// `roster` is the sorted membership including the joiner. If the full
    /// list does not fit in one datagram, the joiner is kept, the others are
    /// taken in order while they fit, and the rest are counted in `omitted`.
    pub fn welcome(seq: u32, joiner: &str, roster: &[String]) -> Result<Message, CodecError> {
        let full = Message::Welcome {
            seq,
            members: roster.to_vec(),
            omitted: 0,
        };
        if encoded_size(&full)? <= MAX_DATAGRAM_SIZE {
            return Ok(full);
        }

        let total = u32::try_from(roster.len()).map_err(|_| CodecError::Oversized {
            size: usize::MAX,
            max: MAX_DATAGRAM_SIZE,
        })?;
        // Measured with the largest possible omitted count; the member count
        // prefix may still grow by up to two bytes
        let base = encoded_size(&Message::Welcome {
            seq,
            members: vec![joiner.to_string()],
            omitted: total,
        })?;
        let mut budget = MAX_DATAGRAM_SIZE.saturating_sub(base + 2);

        let mut members = vec![joiner.to_string()];
        for name in roster.iter().filter(|name| name.as_str() != joiner) {
            let cost = encoded_size(name)?;
            if cost <= budget {
                budget -= cost;
                members.push(name.clone());
            }
        }
        members.sort();

        let omitted = roster
            .iter()
            .filter(|name| members.binary_search(*name).is_err())
            .count() as u32;
        let welcome = Message::Welcome {
            seq,
            members,
            omitted,
        };

        let size = encoded_size(&welcome)?;
        if size > MAX_DATAGRAM_SIZE {
            return Err(CodecError::Oversized {
                size,
                max: MAX_DATAGRAM_SIZE,
            });
        }
        Ok(welcome)
    }

    fn username_field(&self) -> Option<&str> {
        match self {
            Message::Join { username, .. }
            | Message::Chat { username, .. }
            | Message::Joined { username }
            | Message::Left { username, .. } => Some(username),
            Message::ChatBroadcast { sender, .. } => Some(sender),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), CodecError> {
        if let Some(name) = self.username_field() {
            if !is_valid_username(name) {
                return Err(CodecError::InvalidUsername(name.to_string()));
            }
        }
        if let Message::Welcome { members, .. } = self {
            if let Some(bad) = members.iter().find(|m| !is_valid_username(m)) {
                return Err(CodecError::InvalidUsername(bad.clone()));
            }
        }
        Ok(())
    }
}

/// Usernames are case-sensitive and between 1 and [`MAX_USERNAME_LEN`] characters.
pub fn is_valid_username(username: &str) -> bool {
    let len = username.chars().count();
    (1..=MAX_USERNAME_LEN).contains(&len)
}

/// Formats `host:port`, bracketing IPv6 literals.
pub fn host_port(host: &str, port: u16) -> String {
    if host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn encoded_size<T: Serialize + ?Sized>(value: &T) -> Result<usize, CodecError> {
    Ok(bincode::DefaultOptions::new().serialized_size(value)? as usize)
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_DATAGRAM_SIZE as u64)
}

/// Serializes a message into a datagram payload.
///
/// Encoding is deterministic: equal messages always produce identical bytes.
/// Messages whose encoding would not fit in [`MAX_DATAGRAM_SIZE`] are rejected
/// with [`CodecError::Oversized`] instead of being truncated.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    message.validate()?;

    let size = encoded_size(message)?;
    if size > MAX_DATAGRAM_SIZE {
        return Err(CodecError::Oversized {
            size,
            max: MAX_DATAGRAM_SIZE,
        });
    }

    Ok(wire_options().serialize(message)?)
}

/// Parses a datagram payload. Never panics on hostile input.
pub fn decode(data: &[u8]) -> Result<Message, CodecError> {
    if data.len() > MAX_DATAGRAM_SIZE {
        return Err(CodecError::Oversized {
            size: data.len(),
            max: MAX_DATAGRAM_SIZE,
        });
    }

    let message: Message = wire_options().deserialize(data)?;
    message.validate()?;
    Ok(message)
}
