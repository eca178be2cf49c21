//! Credential validation
//!
//! The portal only needs a yes/no answer for a username and password. The
//! [`CredentialValidator`] trait is that boundary; [`UserStore`] is the
//! JSON-file implementation shipped with the gateway.

mod store;

pub use store::{
    hash_password, hash_password_with_salt, StoredPassword, UserStore, DEFAULT_ITERATIONS,
};

/// Checks a username/password pair
///
/// Implementations must not reveal which of the two was wrong.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, username: &str, password: &str) -> bool;
}

/// Validator over a fixed list of plaintext pairs, for tests and demos
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    pairs: Vec<(String, String)>,
}

impl StaticCredentials {
    #[must_use]
    pub fn new<I, U, P>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(u, p)| (u.into(), p.into()))
                .collect(),
        }
    }
}

impl CredentialValidator for StaticCredentials {
    fn validate(&self, username: &str, password: &str) -> bool {
        self.pairs
            .iter()
            .any(|(u, p)| u == username && p == password)
    }
}
