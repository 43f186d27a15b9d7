use std::sync::Arc;

use crate::{
    blacklist::Blacklist,
    lock::{LockBackend, UnconfiguredLocks},
    port::driver::{SerialDriver, TokioSerialDriver},
    user::UserDirectory,
};

/// Process-wide collaborators, built once at startup and handed to whatever needs them.
#[derive(Debug, Clone)]
pub struct Context {
    /// Opens serial lines.
    pub driver: Arc<dyn SerialDriver>,

    /// Resolves hosts to users.
    pub users: Arc<UserDirectory>,

    /// Hosts refused by every node.
    pub blacklist: Arc<Blacklist>,

    /// Reaches external build-system locks.
    pub locks: Arc<dyn LockBackend>,
}

impl Context {
    /// A context using the given driver, an empty blacklist, a host-only user directory
    /// and no lock backend.
    pub fn new(driver: Arc<dyn SerialDriver>) -> Self {
        Self {
            driver,
            users: Arc::new(UserDirectory::default()),
            blacklist: Arc::new(Blacklist::default()),
            locks: Arc::new(UnconfiguredLocks),
        }
    }

    /// Replace the lock backend.
    pub fn with_locks(mut self, locks: Arc<dyn LockBackend>) -> Self {
        self.locks = locks;
        self
    }

    /// Replace the user directory.
    pub fn with_users(mut self, users: UserDirectory) -> Self {
        self.users = Arc::new(users);
        self
    }

    /// Forget cached users and blacklisted hosts.
    pub fn reset(&self) {
        self.users.reset();
        self.blacklist.reset();
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Arc::new(TokioSerialDriver))
    }
}
