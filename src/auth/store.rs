//! JSON user store with salted, iterated SHA-256 password hashes
//!
//! ## File Format
//!
//! ```json
//! {
//!   "users": [
//!     { "username": "alice", "password": "sha256:1000:9f2c4e61a0b3d7e8:5d41..." },
//!     { "username": "guest", "password": "guest" }
//!   ]
//! }
//! ```
//!
//! Hashed entries are `sha256:<iterations>:<salt>:<hex digest>` where
//! `h0 = password` and `h(i+1) = SHA256(h(i) || salt)`. Anything else is
//! treated as a legacy plaintext password.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use super::CredentialValidator;
use crate::error::AuthError;

/// Iterations used for newly hashed passwords
pub const DEFAULT_ITERATIONS: u32 = 1000;

/// Refuse stored hashes that would make a single login absurdly slow
const MAX_ITERATIONS: u32 = 1_000_000;

/// Random salt bytes (hex-encoded to 16 characters)
const SALT_BYTES: usize = 8;

const HASH_PREFIX: &str = "sha256";

#[derive(Debug, Serialize, Deserialize)]
struct UserFile {
    #[serde(default)]
    users: Vec<UserEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserEntry {
    username: String,
    password: String,
}

/// A stored password in either supported form
#[derive(Clone, PartialEq, Eq)]
pub enum StoredPassword {
    Hashed {
        iterations: u32,
        salt: String,
        digest: Vec<u8>,
    },
    Plaintext(String),
}

impl std::fmt::Debug for StoredPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hashed { iterations, .. } => {
                write!(f, "StoredPassword::Hashed {{ iterations: {iterations} }}")
            }
            Self::Plaintext(_) => f.write_str("StoredPassword::Plaintext"),
        }
    }
}

impl StoredPassword {
    /// Parse a stored password field
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MalformedHash`] when the value starts with the
    /// `sha256:` prefix but the remaining fields are invalid.
    pub fn parse(username: &str, stored: &str) -> Result<Self, AuthError> {
        let parts: Vec<&str> = stored.split(':').collect();
        if parts.len() != 4 || parts[0] != HASH_PREFIX {
            return Ok(Self::Plaintext(stored.to_string()));
        }

        let malformed = || AuthError::MalformedHash {
            username: username.to_string(),
        };
        let iterations: u32 = parts[1].parse().map_err(|_| malformed())?;
        if iterations == 0 || iterations > MAX_ITERATIONS {
            return Err(malformed());
        }
        let digest = hex::decode(parts[3]).map_err(|_| malformed())?;
        if digest.len() != 32 {
            return Err(malformed());
        }

        Ok(Self::Hashed {
            iterations,
            salt: parts[2].to_string(),
            digest,
        })
    }

    /// Constant-time check of `password` against this entry
    #[must_use]
    pub fn verify(&self, password: &str) -> bool {
        match self {
            Self::Hashed {
                iterations,
                salt,
                digest,
            } => {
                let computed = iterate_sha256(password, salt, *iterations);
                computed.as_slice().ct_eq(digest.as_slice()).into()
            }
            Self::Plaintext(stored) => stored.as_bytes().ct_eq(password.as_bytes()).into(),
        }
    }

    #[must_use]
    pub const fn is_plaintext(&self) -> bool {
        matches!(self, Self::Plaintext(_))
    }

    /// The password field as written to the store file
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Hashed {
                iterations,
                salt,
                digest,
            } => format!("{HASH_PREFIX}:{iterations}:{salt}:{}", hex::encode(digest)),
            Self::Plaintext(stored) => stored.clone(),
        }
    }
}

fn iterate_sha256(password: &str, salt: &str, iterations: u32) -> Vec<u8> {
    let mut state = password.as_bytes().to_vec();
    for _ in 0..iterations {
        let mut hasher = Sha256::new();
        hasher.update(&state);
        hasher.update(salt.as_bytes());
        state = hasher.finalize().to_vec();
    }
    state
}

/// Hash `password` with a fresh random salt
///
/// # Example
///
/// ```
/// use captive_portal::auth::{hash_password, StoredPassword};
///
/// let stored = hash_password("s3cret");
/// assert!(stored.starts_with("sha256:1000:"));
/// assert!(StoredPassword::parse("alice", &stored).unwrap().verify("s3cret"));
/// ```
#[must_use]
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);
    hash_password_with_salt(password, &hex::encode(salt), DEFAULT_ITERATIONS)
}

/// Hash `password` with the given salt and iteration count
#[must_use]
pub fn hash_password_with_salt(password: &str, salt: &str, iterations: u32) -> String {
    let digest = iterate_sha256(password, salt, iterations);
    format!("{HASH_PREFIX}:{iterations}:{salt}:{}", hex::encode(digest))
}

/// Username to stored password, loaded once at startup
#[derive(Debug, Default)]
pub struct UserStore {
    users: HashMap<String, StoredPassword>,
}

impl UserStore {
    /// Empty store: every login fails
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the store from a JSON file
    ///
    /// A missing file gives an empty store with a warning. Entries with a
    /// malformed hash are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        if !path.exists() {
            warn!(path = %path.display(), "User store not found, every login will fail");
            return Ok(Self::empty());
        }
        let content = std::fs::read_to_string(path)?;
        let store = Self::from_json(&content).map_err(|e| match e {
            AuthError::ParseError { reason, .. } => AuthError::ParseError {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })?;
        info!(path = %path.display(), users = store.len(), "User store loaded");
        Ok(store)
    }

    /// Parse the store from JSON text
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ParseError`] for invalid JSON.
    pub fn from_json(content: &str) -> Result<Self, AuthError> {
        let file: UserFile = serde_json::from_str(content).map_err(|e| AuthError::ParseError {
            path: "<inline>".into(),
            reason: e.to_string(),
        })?;

        let mut users = HashMap::with_capacity(file.users.len());
        let mut plaintext = 0usize;
        for entry in file.users {
            match StoredPassword::parse(&entry.username, &entry.password) {
                Ok(stored) => {
                    if stored.is_plaintext() {
                        plaintext += 1;
                    }
                    if users.insert(entry.username.clone(), stored).is_some() {
                        warn!(username = %entry.username, "Duplicate user entry, last one wins");
                    }
                }
                Err(e) => warn!(error = %e, "Skipping user entry"),
            }
        }
        if plaintext > 0 {
            warn!(count = plaintext, "User store contains plaintext passwords");
        }

        Ok(Self { users })
    }

    /// Add or replace a user with an already encoded password field
    pub fn insert(&mut self, username: impl Into<String>, stored: StoredPassword) {
        self.users.insert(username.into(), stored);
    }

    /// Add a new user, hashing `password` with a fresh salt
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidUsername`] for an empty name or one containing
    /// whitespace or control characters, [`AuthError::UserExists`] if the
    /// name is taken.
    pub fn add_user(&mut self, username: &str, password: &str) -> Result<(), AuthError> {
        if username.is_empty() || username.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(AuthError::InvalidUsername(username.to_string()));
        }
        if self.users.contains_key(username) {
            return Err(AuthError::UserExists {
                username: username.to_string(),
            });
        }
        let stored = StoredPassword::parse(username, &hash_password(password))?;
        self.users.insert(username.to_string(), stored);
        Ok(())
    }

    /// Remove a user
    ///
    /// # Errors
    ///
    /// [`AuthError::UnknownUser`] if no such user exists.
    pub fn remove_user(&mut self, username: &str) -> Result<(), AuthError> {
        self.users
            .remove(username)
            .map(|_| ())
            .ok_or_else(|| AuthError::UnknownUser {
                username: username.to_string(),
            })
    }

    /// Usernames in sorted order
    #[must_use]
    pub fn usernames(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.users.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Serialize the store as JSON, users sorted by name
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SerializeError`] if serialization fails.
    pub fn to_json(&self) -> Result<String, AuthError> {
        let file = UserFile {
            users: self
                .usernames()
                .into_iter()
                .map(|username| UserEntry {
                    username: username.to_string(),
                    password: self.users[username].encode(),
                })
                .collect(),
        };
        serde_json::to_string_pretty(&file).map_err(|e| AuthError::SerializeError(e.to_string()))
    }

    /// Write the store to `path`
    ///
    /// The file is written next to `path` and renamed over it, with mode
    /// `0600` on Unix.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if serialization or any file operation fails.
    pub fn save(&self, path: &Path) -> Result<(), AuthError> {
        let json = self.to_json()?;
        let staging = path.with_extension("json.tmp");

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&staging)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&staging, path)?;
        info!(path = %path.display(), users = self.len(), "User store saved");
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialValidator for UserStore {
    fn validate(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|stored| stored.verify(password))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_known_digest() {
        // One iteration is a plain SHA256(password || salt)
        let stored = hash_password_with_salt("abc", "", 1);
        assert_eq!(
            stored,
            "sha256:1::ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_and_verify() {
        let stored = hash_password("hunter2");
        let parts: Vec<&str> = stored.split(':').collect();
        assert_eq!(parts[0], "sha256");
        assert_eq!(parts[1], "1000");
        assert_eq!(parts[2].len(), 16);

        let parsed = StoredPassword::parse("alice", &stored).unwrap();
        assert!(parsed.verify("hunter2"));
        assert!(!parsed.verify("hunter3"));
    }

    #[test]
    fn test_salts_differ() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn test_malformed_hash() {
        assert!(matches!(
            StoredPassword::parse("bob", "sha256:many:salt:abcd"),
            Err(AuthError::MalformedHash { .. })
        ));
        assert!(StoredPassword::parse("bob", "sha256:0:salt:00").is_err());
        assert!(StoredPassword::parse("bob", "sha256:10:salt:zz").is_err());
    }

    #[test]
    fn test_plaintext_fallback() {
        let stored = StoredPassword::parse("guest", "guest-pass").unwrap();
        assert!(stored.is_plaintext());
        assert!(stored.verify("guest-pass"));
        assert!(!stored.verify("guest"));
    }

    #[test]
    fn test_store_from_json() {
        let json = format!(
            r#"{{"users":[
                {{"username":"alice","password":"{}"}},
                {{"username":"guest","password":"guest"}},
                {{"username":"broken","password":"sha256:x:y:z"}}
            ]}}"#,
            hash_password_with_salt("wonderland", "0011223344556677", 1000)
        );
        let store = UserStore::from_json(&json).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.validate("alice", "wonderland"));
        assert!(!store.validate("alice", "guest"));
        assert!(store.validate("guest", "guest"));
        assert!(!store.validate("broken", "anything"));
        assert!(!store.validate("nobody", ""));
    }

    #[test]
    fn test_add_remove_list_users() {
        let mut store = UserStore::empty();
        store.add_user("carol", "s3cret").unwrap();
        store.add_user("alice", "wonderland").unwrap();

        assert_eq!(store.usernames(), vec!["alice", "carol"]);
        assert!(store.validate("carol", "s3cret"));
        assert!(matches!(
            store.add_user("carol", "other"),
            Err(AuthError::UserExists { .. })
        ));
        assert!(store.validate("carol", "s3cret"));

        store.remove_user("carol").unwrap();
        assert!(!store.validate("carol", "s3cret"));
        assert!(matches!(
            store.remove_user("carol"),
            Err(AuthError::UnknownUser { .. })
        ));
        assert_eq!(store.usernames(), vec!["alice"]);
    }

    #[test]
    fn test_add_user_rejects_bad_names() {
        let mut store = UserStore::empty();
        for name in ["", "two words", "tab\there"] {
            assert!(matches!(
                store.add_user(name, "pw"),
                Err(AuthError::InvalidUsername(_))
            ));
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        let mut store = UserStore::from_json(r#"{"users":[{"username":"guest","password":"guest"}]}"#).unwrap();
        store.add_user("alice", "wonderland").unwrap();
        store.save(&path).unwrap();

        let reloaded = UserStore::load(&path).unwrap();
        assert_eq!(reloaded.usernames(), vec!["alice", "guest"]);
        assert!(reloaded.validate("alice", "wonderland"));
        assert!(reloaded.validate("guest", "guest"));
        assert!(!path.with_extension("json.tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_encode_preserves_stored_field() {
        let field = hash_password_with_salt("pw", "0011223344556677", 10);
        assert_eq!(StoredPassword::parse("u", &field).unwrap().encode(), field);
        assert_eq!(StoredPassword::parse("u", "plain").unwrap().encode(), "plain");
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let store = UserStore::load(Path::new("/nonexistent/users.json")).unwrap();
        assert!(store.is_empty());
        assert!(!store.validate("admin", "admin"));
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let err = UserStore::load(file.path()).unwrap_err();
        match err {
            AuthError::ParseError { path, .. } => {
                assert_eq!(path, file.path().display().to_string());
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
