//! Signer/verifier seams and remote key material.
//!
//! The engine never implements cryptographic primitives. Hosts inject a
//! [`Signer`] per local key and a [`KeyCodec`] that turns published key
//! material into a [`Verifier`]; everything else — canonical strings,
//! caching, ownership — lives in this module's siblings.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::activity::ActorKey;

use super::SigError;

/// Signature algorithms the two profiles carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// RSA PKCS#1 v1.5 with SHA-256, PEM-published.
    RsaSha256,
    /// Ed25519, multibase-published.
    Ed25519,
}

impl KeyAlgorithm {
    /// Name used by draft-cavage `algorithm` parameters.
    #[must_use]
    pub fn cavage_name(self) -> &'static str {
        match self {
            Self::RsaSha256 => "rsa-sha256",
            Self::Ed25519 => "ed25519",
        }
    }

    /// Name used by RFC 9421 `alg` parameters.
    #[must_use]
    pub fn rfc9421_name(self) -> &'static str {
        match self {
            Self::RsaSha256 => "rsa-v1_5-sha256",
            Self::Ed25519 => "ed25519",
        }
    }

    /// Parses either profile's algorithm name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rsa-sha256" | "rsa-v1_5-sha256" | "hs2019" => Some(Self::RsaSha256),
            "ed25519" => Some(Self::Ed25519),
            _ => None,
        }
    }
}

/// Published form of a public key, as it appears on an actor document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyMaterial {
    /// The key's algorithm.
    pub algorithm: KeyAlgorithm,
    /// PEM encoding (`publicKeyPem`), used by RSA keys.
    pub pem: Option<String>,
    /// Multibase encoding (`publicKeyMultibase`), used by Ed25519 keys.
    pub multibase: Option<String>,
}

/// Produces signatures with a private key held by the host.
pub trait Signer: Send + Sync + std::fmt::Debug {
    /// The algorithm this key signs with.
    fn algorithm(&self) -> KeyAlgorithm;

    /// Signs `message`.
    ///
    /// # Errors
    ///
    /// Returns [`SigError::Signing`] when the underlying key refuses.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigError>;
}

/// Checks signatures against a public key.
pub trait Verifier: Send + Sync + std::fmt::Debug {
    /// The algorithm this key verifies.
    fn algorithm(&self) -> KeyAlgorithm;

    /// Whether `signature` is valid over `message`.
    fn verify(&self, message: &[u8], signature: &[u8]) -> bool;
}

/// Decodes published key material into a [`Verifier`].
pub trait KeyCodec: Send + Sync + std::fmt::Debug {
    /// Builds a verifier from published material.
    ///
    /// # Errors
    ///
    /// Returns [`SigError::UnsupportedKey`] when the material cannot be
    /// decoded.
    fn decode(&self, key_id: &Url, material: &PublicKeyMaterial)
    -> Result<Arc<dyn Verifier>, SigError>;
}

/// Shared codec handle.
pub type SharedKeyCodec = Arc<dyn KeyCodec>;

/// A named key pair: the private half stays inside the process, the public
/// half is published through the actor dispatcher.
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// The key id URI, usually `actor#fragment`.
    pub key_id: Url,
    /// Signing half.
    pub signer: Arc<dyn Signer>,
    /// Published half.
    pub material: PublicKeyMaterial,
}

impl KeyPair {
    /// The pair's algorithm.
    #[must_use]
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.signer.algorithm()
    }

    /// Renders the published half as a `publicKey`-style JSON object.
    #[must_use]
    pub fn to_key_document(&self, owner: &Url) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        object.insert("id".into(), serde_json::json!(self.key_id.as_str()));
        object.insert("owner".into(), serde_json::json!(owner.as_str()));
        if let Some(pem) = &self.material.pem {
            object.insert("publicKeyPem".into(), serde_json::json!(pem));
        }
        if let Some(multibase) = &self.material.multibase {
            object.insert("publicKeyMultibase".into(), serde_json::json!(multibase));
        }
        serde_json::Value::Object(object)
    }
}

/// A remote actor's published key, as cached in the KV store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteKey {
    /// The key id URI.
    pub id: Url,
    /// The actor claiming ownership, when stated on the key itself.
    pub owner: Option<Url>,
    /// PEM-encoded material.
    pub pem: Option<String>,
    /// Multibase-encoded material.
    pub multibase: Option<String>,
}

impl RemoteKey {
    /// Converts an actor-document key entry.
    #[must_use]
    pub fn from_actor_key(key: &ActorKey) -> Self {
        Self {
            id: key.id.clone(),
            owner: key.owner.clone(),
            pem: key.pem.clone(),
            multibase: key.multibase.clone(),
        }
    }

    /// The published material, with the algorithm inferred from its
    /// encoding: PEM carries RSA, multibase carries Ed25519.
    ///
    /// # Errors
    ///
    /// Returns [`SigError::UnsupportedKey`] when neither encoding is
    /// present.
    pub fn material(&self) -> Result<PublicKeyMaterial, SigError> {
        if self.pem.is_some() {
            Ok(PublicKeyMaterial {
                algorithm: KeyAlgorithm::RsaSha256,
                pem: self.pem.clone(),
                multibase: None,
            })
        } else if self.multibase.is_some() {
            Ok(PublicKeyMaterial {
                algorithm: KeyAlgorithm::Ed25519,
                pem: None,
                multibase: self.multibase.clone(),
            })
        } else {
            Err(SigError::UnsupportedKey {
                key_id: self.id.clone(),
            })
        }
    }

    /// The algorithm inferred from the published encoding.
    #[must_use]
    pub fn algorithm(&self) -> Option<KeyAlgorithm> {
        self.material().ok().map(|material| material.algorithm)
    }
}
