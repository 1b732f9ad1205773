//! Session table tracking which usernames are currently in the room
//!
//! UDP gives the server no connection objects, so this module stands in for
//! them:
//! - One participant record per username, bound to the address it was last heard from
//! - Liveness timestamps refreshed by every valid datagram
//! - Stale-binding supersession for clients reconnecting after a crash
//! - Bulk eviction of silent participants for the liveness reaper
//!
//! The table itself is plain data. The server wraps it in a single lock so
//! every operation below is atomic with respect to the others.

use log::info;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How many recent CHAT sequence numbers are remembered per participant.
pub const RECENT_CHAT_WINDOW: usize = 64;

/// A username currently bound to a network address
#[derive(Debug)]
pub struct Participant {
    /// Case-sensitive identity, unique within the table
    pub username: String,
    /// Where responses and broadcasts for this participant are sent
    pub addr: SocketAddr,
    /// Last time any valid datagram arrived from this participant
    pub last_seen: Instant,
    /// When the current binding was created
    pub joined_at: Instant,
    /// Sequence numbers of recently relayed chats, oldest first
    recent_chats: VecDeque<u32>,
}

impl Participant {
    pub fn new(username: String, addr: SocketAddr, now: Instant) -> Self {
        Self {
            username,
            addr,
            last_seen: now,
            joined_at: now,
            recent_chats: VecDeque::with_capacity(RECENT_CHAT_WINDOW),
        }
    }

    /// Returns true if nothing has been heard from this participant within `timeout`
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    fn record_chat(&mut self, seq: u32) -> bool {
        if self.recent_chats.contains(&seq) {
            return false;
        }
        if self.recent_chats.len() == RECENT_CHAT_WINDOW {
            self.recent_chats.pop_front();
        }
        self.recent_chats.push_back(seq);
        true
    }
}

/// How a successful JOIN was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// The username had no live binding
    New,
    /// Same username from the same address while already bound: a retransmitted JOIN
    Duplicate,
    /// A stale binding at another address was replaced
    Superseded { previous: SocketAddr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRejection {
    AlreadyConnected,
    ServerFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Accepted(JoinKind),
    Rejected(JoinRejection),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("{0:?} has no live session")]
    NotJoined(String),
}

/// All participants currently in the room
///
/// The table enforces a capacity limit and the rule that at most one
/// participant is bound to a username at any instant. It never looks at the
/// clock itself; every time-dependent operation takes `now` from the caller.
#[derive(Debug)]
pub struct SessionTable {
    /// Live participants keyed by username
    participants: HashMap<String, Participant>,
    /// Maximum number of simultaneous participants
    max_participants: usize,
    /// A binding silent for longer than this may be superseded by a new JOIN
    join_grace: Duration,
}

impl SessionTable {
    pub fn new(max_participants: usize, join_grace: Duration) -> Self {
        Self {
            participants: HashMap::new(),
            max_participants,
            join_grace,
        }
    }

    /// Binds `username` to `addr`
    ///
    /// A JOIN for a live username is rejected unless it repeats the existing
    /// binding (same address) or the existing binding has been silent for
    /// longer than the join grace window, in which case it is replaced.
    pub fn join(&mut self, username: &str, addr: SocketAddr, now: Instant) -> JoinOutcome {
        if let Some(existing) = self.participants.get_mut(username) {
            if existing.addr == addr {
                existing.last_seen = now;
                return JoinOutcome::Accepted(JoinKind::Duplicate);
            }

            if !existing.is_timed_out(now, self.join_grace) {
                return JoinOutcome::Rejected(JoinRejection::AlreadyConnected);
            }

            let previous = existing.addr;
            info!(
                "{} reconnected from {} (superseding stale binding at {})",
                username, addr, previous
            );
            *existing = Participant::new(username.to_string(), addr, now);
            return JoinOutcome::Accepted(JoinKind::Superseded { previous });
        }

        if self.participants.len() >= self.max_participants {
            return JoinOutcome::Rejected(JoinRejection::ServerFull);
        }

        info!("{} joined from {}", username, addr);
        self.participants.insert(
            username.to_string(),
            Participant::new(username.to_string(), addr, now),
        );
        JoinOutcome::Accepted(JoinKind::New)
    }

    /// Refreshes liveness and the return address of a live participant
    pub fn touch(
        &mut self,
        username: &str,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<(), SessionError> {
        let participant = self
            .participants
            .get_mut(username)
            .ok_or_else(|| SessionError::NotJoined(username.to_string()))?;

        if participant.addr != addr {
            info!("{} moved from {} to {}", username, participant.addr, addr);
            participant.addr = addr;
        }
        participant.last_seen = now;
        Ok(())
    }

    /// Remembers a CHAT sequence number from `username`
    ///
    /// Returns false if the same sequence number was seen recently, meaning
    /// the datagram is a duplicate and must not be relayed again.
    pub fn record_chat(&mut self, username: &str, seq: u32) -> Result<bool, SessionError> {
        self.participants
            .get_mut(username)
            .map(|participant| participant.record_chat(seq))
            .ok_or_else(|| SessionError::NotJoined(username.to_string()))
    }

    /// Removes a participant. Returns true if they were present.
    pub fn leave(&mut self, username: &str) -> bool {
        if let Some(participant) = self.participants.remove(username) {
            info!("{} left from {}", participant.username, participant.addr);
            true
        } else {
            false
        }
    }

    /// Finds the username bound to a network address
    ///
    /// Used for the message kinds that carry no identity of their own. If
    /// several usernames share the address, the lowest one wins.
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<String> {
        self.participants
            .values()
            .filter(|participant| participant.addr == addr)
            .map(|participant| &participant.username)
            .min()
            .cloned()
    }

    pub fn get(&self, username: &str) -> Option<&Participant> {
        self.participants.get(username)
    }

    /// Point-in-time copy of the membership, sorted by username
    ///
    /// The returned vector is owned by the caller, so fan-out can proceed
    /// after the table lock is released.
    pub fn snapshot(&self) -> Vec<(String, SocketAddr)> {
        let mut members: Vec<(String, SocketAddr)> = self
            .participants
            .values()
            .map(|participant| (participant.username.clone(), participant.addr))
            .collect();
        members.sort();
        members
    }

    /// Removes every participant silent for longer than `timeout`
    ///
    /// Returns the evicted usernames, sorted. An empty table is a no-op.
    pub fn evict_stale(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut evicted: Vec<String> = self
            .participants
            .values()
            .filter(|participant| participant.is_timed_out(now, timeout))
            .map(|participant| participant.username.clone())
            .collect();
        evicted.sort();

        for username in &evicted {
            if let Some(participant) = self.participants.remove(username) {
                info!(
                    "{} timed out (last seen {:?} ago)",
                    username,
                    now.saturating_duration_since(participant.last_seen)
                );
            }
        }

        evicted
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    const GRACE: Duration = Duration::from_secs(10);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn table() -> SessionTable {
        SessionTable::new(4, GRACE)
    }

    #[test]
    fn test_join_new_participant() {
        let mut table = table();
        let now = Instant::now();

        let outcome = table.join("alice", addr(9000), now);
        assert_eq!(outcome, JoinOutcome::Accepted(JoinKind::New));
        assert_eq!(table.len(), 1);

        let alice = table.get("alice").unwrap();
        assert_eq!(alice.addr, addr(9000));
        assert_eq!(alice.joined_at, now);
        assert_eq!(alice.last_seen, now);
    }

    #[test]
    fn test_second_join_from_other_address_is_rejected() {
        let mut table = table();
        let now = Instant::now();

        table.join("alice", addr(9000), now);
        let outcome = table.join("alice", addr(9001), now + Duration::from_secs(1));

        assert_eq!(
            outcome,
            JoinOutcome::Rejected(JoinRejection::AlreadyConnected)
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("alice").unwrap().addr, addr(9000));
    }

    #[test]
    fn test_repeated_join_from_same_address_is_duplicate() {
        let mut table = table();
        let now = Instant::now();
        let later = now + Duration::from_secs(3);

        table.join("alice", addr(9000), now);
        let outcome = table.join("alice", addr(9000), later);

        assert_eq!(outcome, JoinOutcome::Accepted(JoinKind::Duplicate));
        assert_eq!(table.len(), 1);
        let alice = table.get("alice").unwrap();
        assert_eq!(alice.joined_at, now);
        assert_eq!(alice.last_seen, later);
    }

    #[test]
    fn test_stale_binding_is_superseded() {
        let mut table = table();
        let now = Instant::now();

        table.join("alice", addr(9000), now);
        let later = now + GRACE + Duration::from_millis(1);
        let outcome = table.join("alice", addr(9001), later);

        assert_eq!(
            outcome,
            JoinOutcome::Accepted(JoinKind::Superseded {
                previous: addr(9000)
            })
        );
        assert_eq!(table.len(), 1);
        let alice = table.get("alice").unwrap();
        assert_eq!(alice.addr, addr(9001));
        assert_eq!(alice.joined_at, later);
    }

    #[test]
    fn test_grace_window_boundary_is_still_live() {
        let mut table = table();
        let now = Instant::now();

        table.join("alice", addr(9000), now);
        let outcome = table.join("alice", addr(9001), now + GRACE);
        assert_eq!(
            outcome,
            JoinOutcome::Rejected(JoinRejection::AlreadyConnected)
        );
    }

    #[test]
    fn test_capacity_limit() {
        let mut table = SessionTable::new(1, GRACE);
        let now = Instant::now();

        assert_eq!(
            table.join("alice", addr(9000), now),
            JoinOutcome::Accepted(JoinKind::New)
        );
        assert_eq!(
            table.join("bob", addr(9001), now),
            JoinOutcome::Rejected(JoinRejection::ServerFull)
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_touch_updates_liveness_and_address() {
        let mut table = table();
        let now = Instant::now();
        let later = now + Duration::from_secs(2);

        table.join("alice", addr(9000), now);
        assert_ok!(table.touch("alice", addr(9005), later));

        let alice = table.get("alice").unwrap();
        assert_eq!(alice.addr, addr(9005));
        assert_eq!(alice.last_seen, later);
        assert_eq!(table.find_by_addr(addr(9005)), Some("alice".to_string()));
        assert_eq!(table.find_by_addr(addr(9000)), None);
    }

    #[test]
    fn test_touch_unknown_user() {
        let mut table = table();
        let err = assert_err!(table.touch("ghost", addr(9000), Instant::now()));
        assert_eq!(err, SessionError::NotJoined("ghost".to_string()));
        assert!(table.is_empty());
    }

    #[test]
    fn test_leave() {
        let mut table = table();
        table.join("alice", addr(9000), Instant::now());

        assert!(table.leave("alice"));
        assert!(!table.leave("alice"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_snapshot_is_sorted_and_detached() {
        let mut table = table();
        let now = Instant::now();
        table.join("carol", addr(9002), now);
        table.join("alice", addr(9000), now);
        table.join("bob", addr(9001), now);

        let snapshot = table.snapshot();
        table.leave("bob");

        assert_eq!(
            snapshot,
            vec![
                ("alice".to_string(), addr(9000)),
                ("bob".to_string(), addr(9001)),
                ("carol".to_string(), addr(9002)),
            ]
        );
        assert_eq!(table.snapshot().len(), 2);
    }

    #[test]
    fn test_evict_stale() {
        let mut table = table();
        let start = Instant::now();
        let timeout = Duration::from_secs(5);

        table.join("alice", addr(9000), start);
        table.join("bob", addr(9001), start);
        table
            .touch("bob", addr(9001), start + Duration::from_secs(4))
            .unwrap();

        let evicted = table.evict_stale(start + Duration::from_secs(6), timeout);
        assert_eq!(evicted, vec!["alice".to_string()]);
        assert!(table.get("alice").is_none());
        assert!(table.get("bob").is_some());

        // Already evicted participants are not reported twice
        let evicted = table.evict_stale(start + Duration::from_secs(7), timeout);
        assert!(evicted.is_empty());
    }

    #[test]
    fn test_evict_stale_on_empty_table() {
        let mut table = table();
        assert!(table
            .evict_stale(Instant::now(), Duration::from_secs(1))
            .is_empty());
    }

    #[test]
    fn test_record_chat_suppresses_duplicates() {
        let mut table = table();
        table.join("alice", addr(9000), Instant::now());

        assert_eq!(table.record_chat("alice", 1), Ok(true));
        assert_eq!(table.record_chat("alice", 2), Ok(true));
        assert_eq!(table.record_chat("alice", 1), Ok(false));
        assert!(table.record_chat("ghost", 1).is_err());
    }

    #[test]
    fn test_recent_chat_window_is_bounded() {
        let mut participant = Participant::new("alice".to_string(), addr(9000), Instant::now());

        for seq in 0..(RECENT_CHAT_WINDOW as u32 + 1) {
            assert!(participant.record_chat(seq));
        }
        assert_eq!(participant.recent_chats.len(), RECENT_CHAT_WINDOW);
        // The oldest entry fell out of the window
        assert!(participant.record_chat(0));
    }

    #[test]
    fn test_rejoin_resets_chat_window() {
        let mut table = table();
        let now = Instant::now();
        table.join("alice", addr(9000), now);
        table.record_chat("alice", 1).unwrap();

        table.join("alice", addr(9001), now + GRACE * 2);
        assert_eq!(table.record_chat("alice", 1), Ok(true));
    }
}
