//! Pluggable per-session authorization, consulted by the HTTP layer before
//! it touches a session. The store itself never asks.
use dashmap::DashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

pub trait AuthorizationPolicy: Send + Sync {
    fn authorize(&self, session_id: &str, principal: Option<&str>) -> Decision;

    /// Called once a session has been created on behalf of `principal`.
    fn on_session_created(&self, _session_id: &str, _principal: Option<&str>) {}

    /// Called after a session was removed through the API.
    fn on_session_removed(&self, _session_id: &str) {}
}

/// Every principal may use every session.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AuthorizationPolicy for AllowAll {
    fn authorize(&self, _session_id: &str, _principal: Option<&str>) -> Decision {
        Decision::Allow
    }
}

/// The principal that created a session owns it.
///
/// Sessions created anonymously are open to everyone. Sessions the policy
/// has never seen are let through so the store can answer "not found".
#[derive(Debug, Default)]
pub struct OwnershipPolicy {
    owners: DashMap<String, Option<String>>,
}

impl OwnershipPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner_of(&self, session_id: &str) -> Option<String> {
        self.owners.get(session_id).and_then(|owner| owner.value().clone())
    }
}

impl AuthorizationPolicy for OwnershipPolicy {
    fn authorize(&self, session_id: &str, principal: Option<&str>) -> Decision {
        let Some(owner) = self.owners.get(session_id) else {
            return Decision::Allow;
        };
        match (owner.value().as_deref(), principal) {
            (None, _) => Decision::Allow,
            (Some(owner), Some(principal)) if owner == principal => Decision::Allow,
            (Some(owner), principal) => {
                warn!("Denied access to session {session_id} for {principal:?}, owned by {owner}");
                Decision::Deny
            }
        }
    }

    fn on_session_created(&self, session_id: &str, principal: Option<&str>) {
        self.owners.insert(session_id.to_string(), principal.map(str::to_string));
    }

    fn on_session_removed(&self, session_id: &str) {
        self.owners.remove(session_id);
    }
}
