use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_CLIENTS: usize = 32;
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_JOIN_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);
/// Upper bound on `--max-clients`
pub const MAX_CLIENTS_LIMIT: usize = 4096;

/// Command line arguments for the chat server.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "UDP group chat server")]
pub struct Args {
    /// Address to listen on
    #[arg(default_value = shared::DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on
    #[arg(default_value_t = shared::DEFAULT_PORT)]
    pub port: u16,

    /// Maximum number of simultaneously joined users
    #[arg(long, default_value_t = DEFAULT_MAX_CLIENTS)]
    pub max_clients: usize,

    /// Seconds of silence after which a user is evicted
    #[arg(long, default_value_t = DEFAULT_SESSION_TIMEOUT.as_secs())]
    pub session_timeout_secs: u64,

    /// Seconds between liveness sweeps
    #[arg(long, default_value_t = DEFAULT_REAP_INTERVAL.as_secs())]
    pub reap_interval_secs: u64,

    /// Seconds of silence after which a JOIN from a new address replaces the old binding
    #[arg(long, default_value_t = DEFAULT_JOIN_GRACE.as_secs())]
    pub join_grace_secs: u64,

    /// Upper bound on a single outbound send, in milliseconds
    #[arg(long, default_value_t = DEFAULT_SEND_TIMEOUT.as_millis() as u64)]
    pub send_timeout_ms: u64,

    /// Deliver chat broadcasts back to their sender
    #[arg(long)]
    pub echo: bool,

    /// Accounts file with one `username:secret` per line
    #[arg(long)]
    pub accounts: Option<PathBuf>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max clients must be at least 1")]
    NoCapacity,
    #[error("max clients {requested} exceeds the limit of {limit}")]
    TooManyClients { requested: usize, limit: usize },
    #[error("a welcome for a room of {0} members cannot be encoded")]
    RosterTooLarge(usize),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("session timeout ({timeout:?}) is shorter than the reap interval ({interval:?})")]
    TimeoutBelowInterval { timeout: Duration, interval: Duration },
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `host:port` to bind
    pub bind_addr: String,
    pub max_clients: usize,
    pub session_timeout: Duration,
    pub reap_interval: Duration,
    pub join_grace: Duration,
    pub send_timeout: Duration,
    /// Whether a chat sender also receives its own broadcast
    pub echo_chat: bool,
    pub accounts: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("{}:{}", shared::DEFAULT_HOST, shared::DEFAULT_PORT),
            max_clients: DEFAULT_MAX_CLIENTS,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            reap_interval: DEFAULT_REAP_INTERVAL,
            join_grace: DEFAULT_JOIN_GRACE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            echo_chat: false,
            accounts: None,
        }
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: shared::host_port(&args.host, args.port),
            max_clients: args.max_clients,
            session_timeout: Duration::from_secs(args.session_timeout_secs),
            reap_interval: Duration::from_secs(args.reap_interval_secs),
            join_grace: Duration::from_secs(args.join_grace_secs),
            send_timeout: Duration::from_millis(args.send_timeout_ms),
            echo_chat: args.echo,
            accounts: args.accounts,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::NoCapacity);
        }
        if self.max_clients > MAX_CLIENTS_LIMIT {
            return Err(ConfigError::TooManyClients {
                requested: self.max_clients,
                limit: MAX_CLIENTS_LIMIT,
            });
        }
        if !full_room_welcome_fits(self.max_clients) {
            return Err(ConfigError::RosterTooLarge(self.max_clients));
        }
        for (name, value) in [
            ("session timeout", self.session_timeout),
            ("reap interval", self.reap_interval),
            ("join grace", self.join_grace),
            ("send timeout", self.send_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.session_timeout < self.reap_interval {
            return Err(ConfigError::TimeoutBelowInterval {
                timeout: self.session_timeout,
                interval: self.reap_interval,
            });
        }
        Ok(())
    }
}

/// Checks that a room at `capacity`, every member holding a longest-possible
/// username, still yields an encodable welcome.
fn full_room_welcome_fits(capacity: usize) -> bool {
    let mut roster: Vec<String> = (0..capacity)
        .filter_map(|i| char::from_u32(0x10000 + i as u32))
        .map(|tag| {
            std::iter::once(tag)
                .chain(std::iter::repeat('\u{10FFFF}').take(shared::MAX_USERNAME_LEN - 1))
                .collect()
        })
        .collect();
    roster.sort();

    let Some(joiner) = roster.last() else {
        return true;
    };
    shared::Message::welcome(u32::MAX, joiner, &roster)
        .and_then(|welcome| shared::encode(&welcome))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(ServerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_positional_host_and_port() {
        let args = Args::try_parse_from(["server", "0.0.0.0", "6000", "--echo"]).unwrap();
        let config = ServerConfig::from(args);

        assert_eq!(config.bind_addr, "0.0.0.0:6000");
        assert!(config.echo_chat);
        assert_eq!(config.max_clients, DEFAULT_MAX_CLIENTS);
    }

    #[test]
    fn test_no_arguments_uses_documented_defaults() {
        let config = ServerConfig::from(Args::try_parse_from(["server"]).unwrap());

        assert_eq!(config.bind_addr, "127.0.0.1:5000");
        assert_eq!(config.session_timeout, DEFAULT_SESSION_TIMEOUT);
        assert_eq!(config.reap_interval, DEFAULT_REAP_INTERVAL);
        assert!(!config.echo_chat);
        assert!(config.accounts.is_none());
    }

    #[test]
    fn test_ipv6_host_is_bracketed() {
        let config = ServerConfig::from(Args::try_parse_from(["server", "::1", "5000"]).unwrap());
        assert_eq!(config.bind_addr, "[::1]:5000");
        assert!(config.bind_addr.parse::<std::net::SocketAddr>().is_ok());
    }

    #[test]
    fn test_capacity_bounds() {
        assert!(full_room_welcome_fits(DEFAULT_MAX_CLIENTS));
        assert!(full_room_welcome_fits(MAX_CLIENTS_LIMIT));

        let config = ServerConfig {
            max_clients: MAX_CLIENTS_LIMIT,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Ok(()));

        let config = ServerConfig {
            max_clients: MAX_CLIENTS_LIMIT + 1,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooManyClients {
                requested: MAX_CLIENTS_LIMIT + 1,
                limit: MAX_CLIENTS_LIMIT,
            })
        );
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        assert!(Args::try_parse_from(["server", "127.0.0.1", "70000"]).is_err());
    }

    #[test]
    fn test_validation_errors() {
        let config = ServerConfig {
            max_clients: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoCapacity));

        let config = ServerConfig {
            join_grace: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("join grace"))
        );

        let config = ServerConfig {
            session_timeout: Duration::from_secs(1),
            reap_interval: Duration::from_secs(2),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimeoutBelowInterval { .. })
        ));
    }
}
