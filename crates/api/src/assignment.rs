//! Types dealing with worker spawn orders.

use crate::*;

/// A worker-spawn order.
///
/// Static assignments are re-enqueued (with a fresh [AssignmentId])
/// whenever the fulfilling node dies; ephemeral script assignments are
/// created on script upload and discarded once consumed.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Assignment {
    /// The deployment id. Regenerated on every redeployment so a stale
    /// worker can never reconnect under a consumed id.
    pub id: AssignmentId,

    /// The worker type this assignment spawns.
    pub node_type: NodeType,

    /// Optional pool tag. A queued assignment matches a request when the
    /// pools are equal or both empty.
    #[serde(default)]
    pub pool: String,

    /// Optional payload handed to the worker, typically a script URL or
    /// a small `--key value` arg vector. The literal bytes are preserved
    /// so existing workers continue to parse it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<bytes::Bytes>,

    /// Static assignments must always be (re)fulfilled.
    pub is_static: bool,
}

impl Assignment {
    /// Construct a static assignment for a worker type.
    pub fn new_static(node_type: NodeType, pool: impl Into<String>) -> Self {
        Self {
            id: AssignmentId::generate(),
            node_type,
            pool: pool.into(),
            payload: None,
            is_static: true,
        }
    }

    /// Construct an ephemeral script assignment.
    pub fn new_script(pool: impl Into<String>, payload: bytes::Bytes) -> Self {
        Self {
            id: AssignmentId::generate(),
            node_type: NodeType::Agent,
            pool: pool.into(),
            payload: Some(payload),
            is_static: false,
        }
    }

    /// Rotate the deployment id, returning the id this assignment
    /// previously carried.
    pub fn rotate_id(&mut self) -> AssignmentId {
        std::mem::replace(&mut self.id, AssignmentId::generate())
    }

    /// `true` if this assignment satisfies a request for `node_type`
    /// (`None` meaning all-types) in `pool`.
    ///
    /// Pool match semantics: equal, or both empty. Deliberately not
    /// tightened beyond that.
    pub fn matches(&self, node_type: Option<NodeType>, pool: &str) -> bool {
        let type_ok = match node_type {
            None => true,
            Some(t) => t == self.node_type,
        };
        let pool_ok = (self.pool.is_empty() && pool.is_empty())
            || self.pool == pool;
        type_ok && pool_ok
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rotate_changes_id() {
        let mut a = Assignment::new_static(NodeType::AudioMixer, "");
        let before = a.id;
        let returned = a.rotate_id();
        assert_eq!(before, returned);
        assert_ne!(before, a.id);
    }

    #[test]
    fn pool_match_semantics() {
        let a = Assignment::new_static(NodeType::AudioMixer, "");
        assert!(a.matches(Some(NodeType::AudioMixer), ""));
        assert!(a.matches(None, ""));
        assert!(!a.matches(Some(NodeType::AvatarMixer), ""));
        assert!(!a.matches(Some(NodeType::AudioMixer), "blue"));

        let b = Assignment::new_static(NodeType::AudioMixer, "blue");
        assert!(b.matches(Some(NodeType::AudioMixer), "blue"));
        assert!(!b.matches(Some(NodeType::AudioMixer), ""));
    }
}
