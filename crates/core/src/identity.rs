//! The domain's own identity: its uuid, temporary-name state, and the
//! keypair that signs ice-server heartbeats.

use ed25519_dalek::{Signer, Verifier};
use std::sync::Mutex;
use torii_api::*;

struct Inner {
    id: DomainId,
    place_name: String,
    temporary: bool,
    api_key: Option<String>,
    signing_key: ed25519_dalek::SigningKey,
}

/// The domain's identity with the metaverse and the ice-server.
///
/// A configured domain keeps a stable id; a temporary domain adopts
/// whatever the metaverse grants and may be re-granted after 401/404
/// heartbeat failures. The keypair is regenerated after repeated
/// ice-server denials.
pub struct DomainIdentity(Mutex<Inner>);

impl std::fmt::Debug for DomainIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainIdentity")
            .field("id", &self.id())
            .finish()
    }
}

fn generate_signing_key() -> ed25519_dalek::SigningKey {
    use rand::RngCore;
    let mut seed = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    ed25519_dalek::SigningKey::from_bytes(&seed)
}

impl DomainIdentity {
    /// Construct an identity with a configured (stable) domain id.
    pub fn new(id: DomainId, place_name: impl Into<String>) -> Self {
        Self(Mutex::new(Inner {
            id,
            place_name: place_name.into(),
            temporary: false,
            api_key: None,
            signing_key: generate_signing_key(),
        }))
    }

    /// Construct an identity that will ask the metaverse for a
    /// temporary name on its first heartbeat.
    pub fn new_temporary() -> Self {
        Self(Mutex::new(Inner {
            id: DomainId::generate(),
            place_name: String::new(),
            temporary: true,
            api_key: None,
            signing_key: generate_signing_key(),
        }))
    }

    /// The current domain id.
    pub fn id(&self) -> DomainId {
        self.0.lock().unwrap().id
    }

    /// The current place name.
    pub fn place_name(&self) -> String {
        self.0.lock().unwrap().place_name.clone()
    }

    /// `true` for a metaverse-granted temporary domain.
    pub fn is_temporary(&self) -> bool {
        self.0.lock().unwrap().temporary
    }

    /// The api key authenticating heartbeats, for temporary domains.
    pub fn api_key(&self) -> Option<String> {
        self.0.lock().unwrap().api_key.clone()
    }

    /// Adopt a freshly granted temporary domain.
    pub fn adopt_temporary(&self, grant: TemporaryDomain) {
        let mut inner = self.0.lock().unwrap();
        tracing::info!(old = %inner.id, new = %grant.id, name = %grant.name,
            "adopting temporary domain");
        inner.id = grant.id;
        inner.place_name = grant.name;
        inner.temporary = true;
        inner.api_key = Some(grant.api_key);
    }

    /// Sign a message with the domain's private key.
    pub fn sign(&self, message: &[u8]) -> bytes::Bytes {
        let sig = self.0.lock().unwrap().signing_key.sign(message);
        bytes::Bytes::copy_from_slice(&sig.to_bytes())
    }

    /// The domain's public key bytes.
    pub fn public_key(&self) -> bytes::Bytes {
        bytes::Bytes::copy_from_slice(
            self.0
                .lock()
                .unwrap()
                .signing_key
                .verifying_key()
                .as_bytes(),
        )
    }

    /// Throw away the keypair and generate a new one, returning the new
    /// public key for upload to the metaverse.
    pub fn regenerate_keypair(&self) -> bytes::Bytes {
        let mut inner = self.0.lock().unwrap();
        inner.signing_key = generate_signing_key();
        bytes::Bytes::copy_from_slice(
            inner.signing_key.verifying_key().as_bytes(),
        )
    }
}

/// Verify a detached ed25519 signature against raw public-key bytes.
/// Malformed keys or signatures verify as `false`, never as an error.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> bool {
    let key: [u8; 32] = match public_key.try_into() {
        Ok(key) => key,
        Err(_) => return false,
    };
    let key = match ed25519_dalek::VerifyingKey::from_bytes(&key) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let sig: [u8; 64] = match signature.try_into() {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    key.verify(message, &ed25519_dalek::Signature::from_bytes(&sig))
        .is_ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let identity = DomainIdentity::new(DomainId::generate(), "home");
        let sig = identity.sign(b"heartbeat-plaintext");
        assert!(verify_signature(
            &identity.public_key(),
            b"heartbeat-plaintext",
            &sig,
        ));
        assert!(!verify_signature(
            &identity.public_key(),
            b"different-plaintext",
            &sig,
        ));
    }

    #[test]
    fn regenerated_keypair_invalidates_old_signatures() {
        let identity = DomainIdentity::new(DomainId::generate(), "home");
        let sig = identity.sign(b"msg");
        let new_public = identity.regenerate_keypair();
        assert!(!verify_signature(&new_public, b"msg", &sig));
        // fresh signatures verify against the fresh key
        assert!(verify_signature(&new_public, b"msg", &identity.sign(b"msg")));
    }

    #[test]
    fn adopt_temporary_swaps_id_and_key() {
        let identity = DomainIdentity::new_temporary();
        let before = identity.id();
        let grant = TemporaryDomain {
            id: DomainId::generate(),
            name: "rosy-hollow-1234".into(),
            api_key: "key".into(),
        };
        identity.adopt_temporary(grant.clone());
        assert_ne!(before, identity.id());
        assert_eq!(grant.id, identity.id());
        assert_eq!(Some("key".into()), identity.api_key());
        assert!(identity.is_temporary());
    }

    #[test]
    fn malformed_material_never_panics() {
        assert!(!verify_signature(b"short", b"msg", &[0; 64]));
        assert!(!verify_signature(&[0; 32], b"msg", b"short"));
    }
}
