//! Injectable credential store: a name-to-secret mapping shared between the
//! hub actor and application code.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

/// Shared mapping from client name to secret token.
///
/// Names are unique; re-adding a name replaces its secret. Clones share the
/// same underlying table.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    users: Arc<RwLock<HashMap<String, String>>>,
}

impl CredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the credential record for `name`. Setting the same
    /// pair twice is a no-op after the first.
    pub fn set_user(&self, name: &str, token: &str) {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), token.to_string());
    }

    /// Removes `name`; returns whether a record was present.
    pub fn remove_user(&self, name: &str) -> bool {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    #[must_use]
    pub fn contains_name(&self, name: &str) -> bool {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Validates credentials, returning the canonical client name.
    ///
    /// With a `name` supplied, succeeds iff that name's stored secret equals
    /// `token`. Token-only validation assigns the name the store associates
    /// with the token.
    #[must_use]
    pub fn validate(&self, token: &str, name: Option<&str>) -> Option<String> {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        match name {
            Some(name) => (users.get(name).map(String::as_str) == Some(token))
                .then(|| name.to_string()),
            None => users
                .iter()
                .find(|(_, secret)| secret.as_str() == token)
                .map(|(name, _)| name.clone()),
        }
    }
}
