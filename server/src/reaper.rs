//! Periodic eviction of participants that stopped sending datagrams

use crate::engine::Outgoing;
use crate::session::SessionTable;
use log::info;
use shared::{LeaveReason, Message};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

pub struct LivenessReaper {
    sessions: Arc<RwLock<SessionTable>>,
    timeout: Duration,
}

impl LivenessReaper {
    pub fn new(sessions: Arc<RwLock<SessionTable>>, timeout: Duration) -> Self {
        Self { sessions, timeout }
    }

    /// Runs one sweep.
    ///
    /// Eviction and the snapshot of the remaining members are taken under one
    /// write guard; each evicted user produces exactly one departure notice to
    /// whoever is left.
    pub async fn tick(&self, now: Instant) -> Vec<Outgoing> {
        let (evicted, remaining) = {
            let mut sessions = self.sessions.write().await;
            if sessions.is_empty() {
                return Vec::new();
            }
            let evicted = sessions.evict_stale(now, self.timeout);
            (evicted, sessions.snapshot())
        };

        if evicted.is_empty() {
            return Vec::new();
        }
        info!("Evicted {} idle participants", evicted.len());

        let recipients: Vec<SocketAddr> = remaining.iter().map(|(_, addr)| *addr).collect();
        if recipients.is_empty() {
            return Vec::new();
        }

        evicted
            .into_iter()
            .map(|username| Outgoing::Broadcast {
                message: Message::Left {
                    username,
                    reason: LeaveReason::TimedOut,
                },
                recipients: recipients.clone(),
            })
            .collect()
    }
}
