//! User/group resolution port. The real implementation would track
//! watched peers and membership the network reports; this crate ships only
//! an in-memory stand-in for tests.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::options::{DEFAULT_GROUP, PRIVILEGED_GROUP};

#[async_trait]
pub trait UserService: Send + Sync {
    /// The group the operator's configuration assigns this user to,
    /// ignoring network-granted privilege.
    async fn group_of(&self, username: &str) -> String;

    /// Whether the network currently reports this peer as privileged.
    async fn is_privileged(&self, username: &str) -> bool;

    async fn is_watched(&self, username: &str) -> bool;

    async fn watch(&self, username: &str);

    /// The group to actually use for governance/scheduling: the privileged
    /// group overrides any configured membership.
    async fn effective_group(&self, username: &str) -> String {
        if self.is_privileged(username).await {
            PRIVILEGED_GROUP.to_string()
        } else {
            self.group_of(username).await
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryUserService {
    groups: DashMap<String, String>,
    privileged: DashMap<String, ()>,
    watched: DashMap<String, ()>,
}

impl InMemoryUserService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_group(&self, username: &str, group: &str) {
        self.groups.insert(username.to_string(), group.to_string());
    }

    pub fn set_privileged(&self, username: &str, privileged: bool) {
        if privileged {
            self.privileged.insert(username.to_string(), ());
        } else {
            self.privileged.remove(username);
        }
    }
}

#[async_trait]
impl UserService for InMemoryUserService {
    async fn group_of(&self, username: &str) -> String {
        self.groups
            .get(username)
            .map(|g| g.clone())
            .unwrap_or_else(|| DEFAULT_GROUP.to_string())
    }

    async fn is_privileged(&self, username: &str) -> bool {
        self.privileged.contains_key(username)
    }

    async fn is_watched(&self, username: &str) -> bool {
        self.watched.contains_key(username)
    }

    async fn watch(&self, username: &str) {
        self.watched.insert(username.to_string(), ());
    }
}
