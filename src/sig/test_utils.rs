//! Deterministic key material for test suites.
//!
//! The "signature" here is a salted SHA-256 over the message — NOT
//! cryptography. It exists so host and engine test suites can exercise
//! signing, caching, rotation, and ownership flows without key generation
//! or a crypto backend. Never wire this codec into a production federation.

use std::sync::Arc;

use base64::Engine as _;
use sha2::{Digest, Sha256};
use url::Url;

use super::keys::{KeyAlgorithm, KeyCodec, KeyPair, PublicKeyMaterial, Signer, Verifier};
use super::SigError;

fn salted_digest(seed: &[u8], message: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(message);
    hasher.finalize().to_vec()
}

/// Test signer: signature = SHA-256(seed ‖ message).
#[derive(Debug, Clone)]
pub struct TestSigner {
    algorithm: KeyAlgorithm,
    seed: Vec<u8>,
}

impl Signer for TestSigner {
    fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigError> {
        Ok(salted_digest(&self.seed, message))
    }
}

/// Test verifier: recomputes the salted digest.
#[derive(Debug, Clone)]
pub struct TestVerifier {
    algorithm: KeyAlgorithm,
    seed: Vec<u8>,
}

impl Verifier for TestVerifier {
    fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        salted_digest(&self.seed, message) == signature
    }
}

/// Codec decoding the material shapes [`test_key_pair`] publishes.
#[derive(Debug, Clone, Default)]
pub struct TestKeyCodec;

impl KeyCodec for TestKeyCodec {
    fn decode(
        &self,
        key_id: &Url,
        material: &PublicKeyMaterial,
    ) -> Result<Arc<dyn Verifier>, SigError> {
        let seed = match (&material.pem, &material.multibase) {
            (Some(pem), _) => {
                let body: String = pem
                    .lines()
                    .filter(|line| !line.starts_with("-----"))
                    .collect();
                base64::engine::general_purpose::STANDARD
                    .decode(body.as_bytes())
                    .map_err(|_| SigError::UnsupportedKey {
                        key_id: key_id.clone(),
                    })?
            }
            (None, Some(multibase)) => {
                let encoded =
                    multibase
                        .strip_prefix('u')
                        .ok_or_else(|| SigError::UnsupportedKey {
                            key_id: key_id.clone(),
                        })?;
                base64::engine::general_purpose::URL_SAFE_NO_PAD
                    .decode(encoded.as_bytes())
                    .map_err(|_| SigError::UnsupportedKey {
                        key_id: key_id.clone(),
                    })?
            }
            (None, None) => {
                return Err(SigError::UnsupportedKey {
                    key_id: key_id.clone(),
                });
            }
        };
        Ok(Arc::new(TestVerifier {
            algorithm: material.algorithm,
            seed,
        }))
    }
}

/// Builds a key pair whose published material encodes `seed` in the shape
/// real keys of `algorithm` use: PEM for RSA, multibase for Ed25519.
///
/// # Panics
///
/// Panics when `key_id` is not a valid URL; test-only helper.
#[must_use]
pub fn test_key_pair(key_id: &str, algorithm: KeyAlgorithm, seed: &[u8]) -> KeyPair {
    let material = match algorithm {
        KeyAlgorithm::RsaSha256 => PublicKeyMaterial {
            algorithm,
            pem: Some(format!(
                "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----",
                base64::engine::general_purpose::STANDARD.encode(seed)
            )),
            multibase: None,
        },
        KeyAlgorithm::Ed25519 => PublicKeyMaterial {
            algorithm,
            pem: None,
            multibase: Some(format!(
                "u{}",
                base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(seed)
            )),
        },
    };
    KeyPair {
        key_id: Url::parse(key_id).expect("test key id is a valid URL"),
        signer: Arc::new(TestSigner {
            algorithm,
            seed: seed.to_vec(),
        }),
        material,
    }
}
