//! The metaverse (central registry) client seam.
//!
//! The metaverse tracks domains, users, places, and groups. Every call
//! here may suspend on network IO and carries an explicit deadline in
//! its implementation; callers receive status-carrying errors so the
//! heartbeat engines can distinguish 401/404 from transient failures.

use crate::*;
use std::sync::Arc;

/// A metaverse request failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MetaverseError {
    /// The metaverse answered with a non-success status.
    #[error("metaverse answered http {status}: {msg}")]
    Http {
        /// The HTTP status code.
        status: u16,
        /// Response body or status text.
        msg: String,
    },

    /// Transport-level failure (DNS, refused, deadline).
    #[error("metaverse unreachable: {msg}")]
    Unreachable {
        /// What went wrong.
        msg: String,
    },
}

impl MetaverseError {
    /// The HTTP status, if the metaverse answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            MetaverseError::Http { status, .. } => Some(*status),
            MetaverseError::Unreachable { .. } => None,
        }
    }
}

/// A freshly granted temporary domain.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TemporaryDomain {
    /// The new domain uuid.
    pub id: DomainId,
    /// The granted temporary place name.
    pub name: String,
    /// The api key authenticating future heartbeats for this domain.
    pub api_key: String,
}

/// Group membership facts about one user, as known to the metaverse.
#[derive(Debug, Clone, Default)]
pub struct UserGroups {
    /// `(group name, rank)` memberships.
    pub groups: Vec<(String, u8)>,
    /// `true` if this user is a friend of the domain owner.
    pub is_friend: bool,
}

/// Represents the ability to talk to the metaverse API.
pub trait MetaverseClient: 'static + Send + Sync + std::fmt::Debug {
    /// PUT the periodic domain heartbeat.
    fn domain_heartbeat(
        &self,
        domain_id: DomainId,
        body: serde_json::Value,
    ) -> BoxFut<'_, Result<(), MetaverseError>>;

    /// PUT the domain's current ice-server address.
    fn update_ice_address(
        &self,
        domain_id: DomainId,
        address: String,
    ) -> BoxFut<'_, Result<(), MetaverseError>>;

    /// Ask for a fresh temporary domain name and id.
    fn request_temporary_name(
        &self,
    ) -> BoxFut<'_, Result<TemporaryDomain, MetaverseError>>;

    /// Upload the domain's (re)generated public key.
    fn upload_public_key(
        &self,
        domain_id: DomainId,
        public_key: bytes::Bytes,
    ) -> BoxFut<'_, Result<(), MetaverseError>>;

    /// Fetch the public key the metaverse holds for a user, `None` for
    /// an unknown user.
    fn user_public_key(
        &self,
        username: String,
    ) -> BoxFut<'_, Result<Option<bytes::Bytes>, MetaverseError>>;

    /// Fetch a user's group memberships and friend status.
    fn user_groups(
        &self,
        username: String,
    ) -> BoxFut<'_, Result<UserGroups, MetaverseError>>;

    /// Authenticated reverse proxy used by the admin HTTP surface for
    /// `/api/domains` and `/api/places`. Returns `(status, body)`.
    fn proxy(
        &self,
        method: String,
        path: String,
        body: Option<serde_json::Value>,
    ) -> BoxFut<'_, Result<(u16, bytes::Bytes), MetaverseError>>;
}

/// Trait-object [MetaverseClient].
pub type DynMetaverseClient = Arc<dyn MetaverseClient>;
