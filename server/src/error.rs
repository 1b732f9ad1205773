use crate::accounts::AccountsError;
use crate::config::ConfigError;
use std::io;
use thiserror::Error;

/// Errors that stop the server from starting or running.
///
/// Problems with individual datagrams never surface here; the broadcast
/// engine answers or drops them itself.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Accounts(#[from] AccountsError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
