//! Types dealing with peer, domain, and assignment identity.
//!
//! All long identities in torii are RFC-4122 UUIDs: they travel the wire
//! as their raw 16 bytes. The compact [LocalId] is a controller-assigned
//! 16-bit handle used in sourced packet headers for wire efficiency.

macro_rules! imp_uuid_newtype {
    ($(#[doc = $doc:expr])* $i:ident) => {
        $(#[doc = $doc])*
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $i(pub uuid::Uuid);

        impl $i {
            /// Generate a new random (v4) id.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// The all-zero nil id.
            pub const fn nil() -> Self {
                Self(uuid::Uuid::nil())
            }

            /// `true` if this is the all-zero nil id.
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            /// The raw 16 wire bytes of this id.
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Reconstruct an id from its raw 16 wire bytes.
            pub fn from_bytes(b: [u8; 16]) -> Self {
                Self(uuid::Uuid::from_bytes(b))
            }
        }

        impl std::fmt::Display for $i {
            fn fmt(
                &self,
                f: &mut std::fmt::Formatter<'_>,
            ) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::fmt::Debug for $i {
            fn fmt(
                &self,
                f: &mut std::fmt::Formatter<'_>,
            ) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $i {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl From<uuid::Uuid> for $i {
            fn from(u: uuid::Uuid) -> Self {
                Self(u)
            }
        }
    };
}

imp_uuid_newtype!(
    /// Identifies a node admitted to (or requesting admission to) a domain.
    NodeId
);

imp_uuid_newtype!(
    /// Identifies one deployment of a worker assignment. Rotated every
    /// time the assignment re-enters the unfulfilled queue.
    AssignmentId
);

imp_uuid_newtype!(
    /// Identifies the domain itself with the metaverse and the ice-server.
    DomainId
);

imp_uuid_newtype!(
    /// A 128-bit value shared by an unordered pair of nodes, used to
    /// authenticate traffic between them. Lazily generated by the
    /// registry, symmetric, and stable for the lifetime of both nodes.
    SessionSecret
);

/// A compact 16-bit node handle assigned by the controller.
///
/// Unique among live nodes; returned to a free pool on eviction and only
/// then eligible for reuse.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct LocalId(pub u16);

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_bytes_roundtrip() {
        let id = NodeId::generate();
        assert_eq!(id, NodeId::from_bytes(*id.as_bytes()));
    }

    #[test]
    fn display_is_hyphenated_uuid() {
        let id: DomainId =
            "6ba7b810-9dad-11d1-80b4-00c04fd430c8".parse().unwrap();
        assert_eq!("6ba7b810-9dad-11d1-80b4-00c04fd430c8", id.to_string());
    }

    #[test]
    fn nil_detection() {
        assert!(AssignmentId::nil().is_nil());
        assert!(!AssignmentId::generate().is_nil());
    }
}
