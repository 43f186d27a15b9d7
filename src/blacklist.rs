use std::{collections::BTreeSet, net::IpAddr};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::user::normalize_host;

/// Hosts which may not connect to any node.
#[derive(Debug, Default)]
pub struct Blacklist {
    hosts: RwLock<BTreeSet<String>>,
}

impl Blacklist {
    /// A blacklist with the given hosts.
    pub fn new<S: AsRef<str>>(hosts: impl IntoIterator<Item = S>) -> Self {
        let blacklist = Self::default();
        for host in hosts {
            blacklist.add(host.as_ref());
        }
        blacklist
    }

    /// Blacklist a host.
    pub fn add(&self, host: &str) {
        let host = normalize_host(host);
        info!(%host, "Blacklisting");
        self.hosts.write().insert(host);
    }

    /// Blacklist a host, along with whatever it resolves to.
    ///
    /// Names add their addresses, addresses add their name.
    pub async fn add_resolved(&self, host: &str) {
        self.add(host);

        match normalize_host(host).parse::<IpAddr>() {
            Ok(ip) => {
                if let Some(name) = reverse_lookup(ip).await {
                    self.add(&name);
                }
            }
            Err(_) => match tokio::net::lookup_host((host, 0)).await {
                Ok(addrs) => {
                    for addr in addrs {
                        self.add(&addr.ip().to_string());
                    }
                }
                Err(e) => debug!(%host, ?e, "Could not resolve blacklisted host"),
            },
        }
    }

    /// Check if a host is blacklisted.
    pub fn contains(&self, host: &str) -> bool {
        self.hosts.read().contains(&normalize_host(host))
    }

    /// All blacklisted hosts.
    pub fn hosts(&self) -> Vec<String> {
        self.hosts.read().iter().cloned().collect()
    }

    /// Forget all hosts.
    pub fn reset(&self) {
        self.hosts.write().clear();
    }
}

async fn reverse_lookup(ip: IpAddr) -> Option<String> {
    match tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip)).await {
        Ok(Ok(name)) if name != ip.to_string() => Some(name),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            debug!(%ip, ?e, "No name for blacklisted address");
            None
        }
        Err(e) => {
            debug!(%ip, ?e, "Reverse lookup task failed");
            None
        }
    }
}
