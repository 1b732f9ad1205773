//! Account directory consulted when a client asks to JOIN.
//!
//! The server never creates or deletes accounts; it only asks whether a
//! username/secret pair is valid. Unknown usernames and wrong secrets both
//! answer `false`, and both paths perform the same comparison work so the
//! answer time does not reveal which usernames exist.

use crate::error::ServerError;
use log::{info, warn};
use std::collections::HashMap;
use std::fs;
use std::hint::black_box;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Compared against when the username is unknown
const DUMMY_SECRET: &[u8] = &[0x5a; 32];

/// Credential lookup capability used by the broadcast engine.
///
/// Implementations must be free of side effects and safe to call from
/// several tasks at once.
pub trait AccountDirectory: Send + Sync {
    fn verify(&self, username: &str, secret: &str) -> bool;
}

#[derive(Debug, Error)]
pub enum AccountsError {
    #[error("failed to read accounts: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: expected `username:secret`")]
    Parse { line: usize },
    #[error("line {line}: duplicate username {username:?}")]
    Duplicate { line: usize, username: String },
}

/// Accounts held in memory, optionally loaded from a `username:secret` file.
#[derive(Debug, Default, Clone)]
pub struct InMemoryAccounts {
    accounts: HashMap<String, String>,
}

impl InMemoryAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// The directory used when no accounts file is configured.
    pub fn with_default_root() -> Self {
        let mut accounts = Self::new();
        accounts.insert("root", "root");
        accounts
    }

    pub fn insert(&mut self, username: impl Into<String>, secret: impl Into<String>) {
        self.accounts.insert(username.into(), secret.into());
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self, AccountsError> {
        let accounts = Self::from_reader(fs::File::open(path)?)?;
        info!("Loaded {} accounts from {}", accounts.len(), path.display());
        Ok(accounts)
    }

    /// Parses one `username:secret` pair per line. Blank lines and lines
    /// starting with `#` are skipped. The secret is everything after the
    /// first colon.
    pub fn from_reader(reader: impl Read) -> Result<Self, AccountsError> {
        let mut accounts = Self::new();

        for (index, line) in BufReader::new(reader).lines().enumerate() {
            let line = line?;
            let number = index + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (username, secret) = trimmed
                .split_once(':')
                .ok_or(AccountsError::Parse { line: number })?;
            if !shared::is_valid_username(username) {
                return Err(AccountsError::Parse { line: number });
            }
            if accounts.accounts.contains_key(username) {
                return Err(AccountsError::Duplicate {
                    line: number,
                    username: username.to_string(),
                });
            }
            accounts.insert(username, secret);
        }

        Ok(accounts)
    }
}

/// Opens the directory the server authenticates against: the given accounts
/// file, or the built-in `root` account when there is none.
pub fn open_directory(path: Option<&Path>) -> Result<Arc<dyn AccountDirectory>, ServerError> {
    match path {
        Some(path) => Ok(Arc::new(InMemoryAccounts::load(path)?)),
        None => {
            warn!("No accounts file given, only root/root can join");
            Ok(Arc::new(InMemoryAccounts::with_default_root()))
        }
    }
}

impl AccountDirectory for InMemoryAccounts {
    fn verify(&self, username: &str, secret: &str) -> bool {
        match self.accounts.get(username) {
            Some(expected) => black_box(constant_time_eq(expected.as_bytes(), secret.as_bytes())),
            None => {
                black_box(constant_time_eq(DUMMY_SECRET, secret.as_bytes()));
                false
            }
        }
    }
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut diff = u8::from(a.len() != b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_known_account() {
        let mut accounts = InMemoryAccounts::new();
        accounts.insert("alice", "wonderland");

        assert!(accounts.verify("alice", "wonderland"));
        assert!(!accounts.verify("alice", "Wonderland"));
        assert!(!accounts.verify("alice", "wonderland!"));
        assert!(!accounts.verify("alice", ""));
    }

    #[test]
    fn test_unknown_user_and_wrong_secret_look_the_same() {
        let mut accounts = InMemoryAccounts::new();
        accounts.insert("alice", "wonderland");

        assert_eq!(
            accounts.verify("mallory", "wonderland"),
            accounts.verify("alice", "guess")
        );
    }

    #[test]
    fn test_usernames_are_case_sensitive() {
        let accounts = InMemoryAccounts::with_default_root();
        assert!(accounts.verify("root", "root"));
        assert!(!accounts.verify("Root", "root"));
    }

    #[test]
    fn test_parse_accounts_file() {
        let text = "# staff\nalice:wonder:land\n\n  bob:builder  \n";
        let accounts = InMemoryAccounts::from_reader(text.as_bytes()).unwrap();

        assert_eq!(accounts.len(), 2);
        assert!(accounts.verify("alice", "wonder:land"));
        assert!(accounts.verify("bob", "builder"));
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        let err = InMemoryAccounts::from_reader("alice:x\nnocolon\n".as_bytes()).unwrap_err();
        assert!(matches!(err, AccountsError::Parse { line: 2 }));

        let err = InMemoryAccounts::from_reader(":secret\n".as_bytes()).unwrap_err();
        assert!(matches!(err, AccountsError::Parse { line: 1 }));

        let err = InMemoryAccounts::from_reader("a:1\na:2\n".as_bytes()).unwrap_err();
        assert!(matches!(err, AccountsError::Duplicate { line: 2, .. }));
    }

    #[test]
    fn test_unknown_user_never_matches_dummy_secret() {
        let accounts = InMemoryAccounts::new();
        let dummy = String::from_utf8(DUMMY_SECRET.to_vec()).unwrap();
        assert!(!accounts.verify("nobody", &dummy));
    }

    #[test]
    fn test_open_directory_defaults_to_root() {
        let accounts = open_directory(None).unwrap();
        assert!(accounts.verify("root", "root"));
        assert!(!accounts.verify("alice", "wonderland"));
    }

    #[test]
    fn test_open_directory_missing_file() {
        let path = std::env::temp_dir().join("udp-chat-no-such-accounts-file");
        let err = open_directory(Some(&path)).err().unwrap();
        assert!(matches!(err, ServerError::Accounts(AccountsError::Io(_))));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"", b"a"));
    }
}
