use std::{
    collections::HashMap,
    fmt::Display,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A person (or machine) connected from some host.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// The normalized host address.
    pub host: String,

    /// What to show for this user.
    /// Falls back to the host when nothing better is known.
    pub display_name: String,

    /// Email, if known.
    pub email: Option<String>,

    /// Avatar image url, if known.
    pub avatar: Option<String>,
}

impl User {
    /// A user only known by host.
    pub fn anonymous(host: &str) -> Self {
        Self {
            host: host.into(),
            display_name: host.into(),
            email: None,
            avatar: None,
        }
    }
}

impl Display for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.display_name == self.host {
            write!(f, "{}", self.host)
        } else {
            write!(f, "{} ({})", self.display_name, self.host)
        }
    }
}

/// Strip the IPv4-mapped IPv6 prefix, if any.
pub fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => normalize_ip(ip).to_string(),
        Err(_) => host
            .strip_prefix("::ffff:")
            .unwrap_or(host)
            .to_string(),
    }
}

/// The normalized host part of a socket address.
pub fn host_of(addr: &SocketAddr) -> String {
    normalize_ip(addr.ip()).to_string()
}

fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// What a directory knows about a host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// A user name, e.g. found via reverse DNS.
    pub username: Option<String>,

    /// A real name.
    pub real_name: Option<String>,

    /// Email address.
    pub email: Option<String>,

    /// Avatar url.
    pub avatar: Option<String>,
}

/// Looks up who is behind a host.
/// Implemented outside this crate (directory services, persisted profiles).
#[async_trait]
pub trait UserResolver: Send + Sync {
    /// Resolve a host. `None` means nothing is known.
    async fn resolve(&self, host: &str) -> Option<Identity>;

    /// Persist an explicit profile update. Default: not persisted.
    async fn store(&self, _user: &User) {}
}

/// A resolver which knows nobody.
#[derive(Debug, Default)]
pub struct HostOnlyResolver;

#[async_trait]
impl UserResolver for HostOnlyResolver {
    async fn resolve(&self, _host: &str) -> Option<Identity> {
        None
    }
}

/// A resolver backed by an in-memory table.
#[derive(Debug, Default)]
pub struct StaticResolver {
    known: Mutex<HashMap<String, Identity>>,
}

impl StaticResolver {
    /// Add or replace what is known about a host.
    pub fn insert(&self, host: &str, identity: Identity) {
        self.known.lock().insert(normalize_host(host), identity);
    }
}

#[async_trait]
impl UserResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Option<Identity> {
        self.known.lock().get(host).cloned()
    }

    async fn store(&self, user: &User) {
        self.known.lock().insert(
            user.host.clone(),
            Identity {
                username: None,
                real_name: Some(user.display_name.clone()),
                email: user.email.clone(),
                avatar: user.avatar.clone(),
            },
        );
    }
}

/// Resolves hosts into [`User`]s, once per host.
pub struct UserDirectory {
    resolver: Arc<dyn UserResolver>,
    avatar_template: Option<String>,
    cache: Mutex<HashMap<String, User>>,
}

impl std::fmt::Debug for UserDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDirectory")
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl Default for UserDirectory {
    fn default() -> Self {
        Self::new(Arc::new(HostOnlyResolver))
    }
}

impl UserDirectory {
    /// A directory asking the given resolver.
    pub fn new(resolver: Arc<dyn UserResolver>) -> Self {
        Self {
            resolver,
            avatar_template: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Give users without an avatar one made from `template`, where `{host}` is replaced by their host.
    pub fn with_avatar_template(mut self, template: Option<String>) -> Self {
        self.avatar_template = template;
        self
    }

    /// Get the user for a host, resolving on first sight.
    pub async fn get(&self, host: &str) -> User {
        let host = normalize_host(host);

        if let Some(user) = self.cached(&host) {
            return user;
        }

        let mut user = match self.resolver.resolve(&host).await {
            Some(identity) => {
                let display_name = identity
                    .real_name
                    .clone()
                    .or_else(|| identity.username.clone())
                    .unwrap_or_else(|| host.clone());
                User {
                    host: host.clone(),
                    display_name,
                    email: identity.email,
                    avatar: identity.avatar,
                }
            }
            None => User::anonymous(&host),
        };
        if user.avatar.is_none() {
            user.avatar = self
                .avatar_template
                .as_ref()
                .map(|template| template.replace("{host}", &host));
        }
        debug!(%user, "Resolved user");

        // Another task may have resolved the same host while we awaited.
        self.cache
            .lock()
            .entry(host)
            .or_insert_with(|| user)
            .clone()
    }

    /// Get the user for a host if it has been resolved already.
    pub fn cached(&self, host: &str) -> Option<User> {
        self.cache.lock().get(&normalize_host(host)).cloned()
    }

    /// The cached user, or an anonymous one.
    pub fn cached_or_anonymous(&self, host: &str) -> User {
        self.cached(host)
            .unwrap_or_else(|| User::anonymous(&normalize_host(host)))
    }

    /// Explicitly set a profile for a host.
    pub async fn set_user_info(
        &self,
        host: &str,
        display_name: &str,
        email: Option<String>,
    ) -> User {
        let mut user = self.get(host).await;
        user.display_name = display_name.into();
        user.email = email;

        info!(%user, "Updating user info");
        self.cache.lock().insert(user.host.clone(), user.clone());
        self.resolver.store(&user).await;

        user
    }

    /// Forget every resolved user.
    pub fn reset(&self) {
        self.cache.lock().clear();
    }
}
