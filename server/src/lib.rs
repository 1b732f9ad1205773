//! # Chat Server Library
//!
//! This library provides the server side of a multi-client group chat that
//! runs over plain UDP datagrams. It accepts connectionless packets from many
//! clients, keeps track of who is in the room, and rebroadcasts chat messages
//! to every connected participant.
//!
//! ## Core Responsibilities
//!
//! ### Session Reconstruction
//! UDP has no connections, so the server rebuilds "who is in the room" from
//! the datagrams themselves. A successful JOIN binds a username to the
//! sender's address; every later datagram from that participant refreshes
//! the binding.
//!
//! ### Authentication
//! JOIN requests carry a secret that is checked against an account directory.
//! Unknown usernames and wrong secrets produce the same generic failure.
//!
//! ### Broadcasting
//! Chat messages, arrivals and departures are fanned out to a consistent
//! snapshot of the membership. A failed send to one participant never stops
//! the others from being reached.
//!
//! ### Liveness
//! Participants that stop sending datagrams are evicted by a periodic reaper
//! and the remaining members are told they left.
//!
//! ## Architecture Design
//!
//! ### Single Dispatch Loop
//! Inbound datagrams are processed one at a time by a single loop. The
//! session table is the only shared mutable state; it sits behind one lock
//! and each operation on it is a single critical section, so the dispatch
//! loop and the reaper can never interleave a read-then-write.
//!
//! ### Best-Effort Delivery
//! The server does not retransmit and does not order messages across
//! senders. Loss and duplication are treated as normal: clients retransmit
//! unacknowledged requests and the server makes every handler safe to
//! repeat.
//!
//! ## Module Organization
//!
//! ### Accounts Module (`accounts`)
//! Credential verification behind the [`accounts::AccountDirectory`] trait,
//! with an in-memory implementation loadable from a `username:secret` file.
//!
//! ### Session Module (`session`)
//! The session table: join, touch, leave, snapshot and stale eviction.
//!
//! ### Engine Module (`engine`)
//! Per-datagram protocol handling. Pure with respect to I/O, which keeps the
//! whole protocol testable without sockets.
//!
//! ### Reaper Module (`reaper`)
//! One sweep of the liveness check, producing departure notices.
//!
//! ### Network Module (`network`)
//! Socket ownership, the dispatch loop and the receiver, sender and reaper
//! tasks, plus cooperative shutdown.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::accounts::InMemoryAccounts;
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut accounts = InMemoryAccounts::new();
//!     accounts.insert("alice", "wonderland");
//!
//!     let server = Server::bind(ServerConfig::default(), Arc::new(accounts)).await?;
//!
//!     // Runs until Ctrl+C, then tells every member the server is going away
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod accounts;
pub mod config;
pub mod engine;
pub mod error;
pub mod network;
pub mod reaper;
pub mod session;
