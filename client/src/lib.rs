//! # Chat Client Library
//!
//! Client side of the UDP group chat. It talks to a single server over one
//! UDP socket, retransmits requests until they are acknowledged, and exposes
//! everything the server pushes (chat lines, arrivals, departures) as a
//! stream the front-end can render.
//!
//! ## Reliability
//!
//! Every request carries a sequence number and the server echoes it in its
//! reply. Requests without a reply are resent with exponential backoff until
//! a fixed deadline. Because a reply can be lost after the server acted on a
//! request, the server side treats repeated requests as harmless.
//!
//! ## Staying Joined
//!
//! The server forgets participants that go quiet. A heartbeat task pings on a
//! fixed period and, if the server answers that the session is gone, joins
//! again with the credentials used the first time.
//!
//! ## Module Organization
//!
//! - `network`: [`network::ChatClient`], the request/reply transport
//! - `backoff`: retransmission delays
//! - `console`: terminal rendering and input parsing
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::ChatClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (client, mut events) = ChatClient::connect("127.0.0.1:5000").await?;
//!     let roster = client.join("root", "root").await?;
//!     println!("members: {:?}", roster.members);
//!
//!     client.chat("hello everyone").await?;
//!     if let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!
//!     client.leave().await?;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod console;
pub mod network;
