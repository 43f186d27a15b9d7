//! External build-system locks.
//!
//! Devices may be tied to a named lock in an external build system.
//! How the lock is reached (HTTP, some CLI) is up to the [`LockBackend`].

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;

/// What to do with a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockAction {
    /// Ask who holds it.
    Test,
    /// Take it.
    Reserve,
    /// Give it back.
    Unreserve,
}

/// Who is asking.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockCredentials {
    /// Login in the build system.
    pub username: String,
    /// Key belonging to the login.
    pub api_key: String,
}

impl Debug for LockCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Talks to the system owning the locks.
#[async_trait]
pub trait LockBackend: Send + Sync + Debug {
    /// Perform `action` on `lock`.
    /// Returns who holds the lock afterwards.
    async fn perform(
        &self,
        lock: &str,
        action: LockAction,
        credentials: &LockCredentials,
    ) -> Result<Option<String>, Error>;
}

/// The backend used when none is configured. Every action fails.
#[derive(Debug, Default)]
pub struct UnconfiguredLocks;

#[async_trait]
impl LockBackend for UnconfiguredLocks {
    async fn perform(
        &self,
        lock: &str,
        _action: LockAction,
        _credentials: &LockCredentials,
    ) -> Result<Option<String>, Error> {
        Err(Error::LockBackend(format!(
            "No lock backend configured, can't reach `{lock}`"
        )))
    }
}

/// Locks kept in memory.
///
/// Reserving a lock held by someone else fails with [`Error::Busy`].
#[derive(Debug, Default)]
pub struct MemoryLocks {
    owners: Mutex<BTreeMap<String, String>>,
}

impl MemoryLocks {
    /// Who holds `lock`.
    pub fn owner(&self, lock: &str) -> Option<String> {
        self.owners.lock().get(lock).cloned()
    }
}

#[async_trait]
impl LockBackend for MemoryLocks {
    async fn perform(
        &self,
        lock: &str,
        action: LockAction,
        credentials: &LockCredentials,
    ) -> Result<Option<String>, Error> {
        let mut owners = self.owners.lock();
        debug!(%lock, ?action, user = %credentials.username, "Lock action");

        match action {
            LockAction::Test => {}
            LockAction::Reserve => match owners.get(lock) {
                Some(owner) if *owner != credentials.username => {
                    return Err(Error::Busy(format!("`{lock}` is held by {owner}")));
                }
                _ => {
                    owners.insert(lock.into(), credentials.username.clone());
                }
            },
            LockAction::Unreserve => {
                owners.remove(lock);
            }
        }

        Ok(owners.get(lock).cloned())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn who(username: &str) -> LockCredentials {
        LockCredentials {
            username: username.into(),
            api_key: "secret".into(),
        }
    }

    #[tokio::test]
    async fn reserve_then_unreserve() {
        let locks = MemoryLocks::default();

        assert_eq!(locks.perform("l", LockAction::Test, &who("ann")).await, Ok(None));
        assert_eq!(
            locks.perform("l", LockAction::Reserve, &who("ann")).await,
            Ok(Some("ann".into()))
        );
        assert!(matches!(
            locks.perform("l", LockAction::Reserve, &who("bob")).await,
            Err(Error::Busy(_))
        ));
        assert_eq!(
            locks.perform("l", LockAction::Unreserve, &who("bob")).await,
            Ok(None)
        );
        assert_eq!(locks.owner("l"), None);
    }

    #[tokio::test]
    async fn unconfigured_fails() {
        let result = UnconfiguredLocks
            .perform("l", LockAction::Test, &who("ann"))
            .await;
        assert!(matches!(result, Err(Error::LockBackend(_))));
    }

    #[test]
    fn credentials_debug_hides_key() {
        assert!(!format!("{:?}", who("ann")).contains("secret"));
    }
}
