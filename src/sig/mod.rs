//! HTTP request signing and verification.
//!
//! Two wire profiles are supported: the older
//! `draft-cavage-http-signatures-12` and RFC 9421 "HTTP Message
//! Signatures". Verification resolves the remote public key through the
//! document loader, caches it in the KV store, and refetches once when a
//! cached key no longer validates (key rotation).

mod cavage;
mod proofs;
mod rfc9421;

pub mod keys;
pub mod test_utils;

pub use keys::{
    KeyAlgorithm, KeyCodec, KeyPair, PublicKeyMaterial, RemoteKey, SharedKeyCodec, Signer,
    Verifier,
};

use std::time::Duration;

use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::Request;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::Instrument;
use url::Url;

use crate::activity::Actor;
use crate::docloader::{DocumentLoader, LoaderError};
use crate::kv::{KvError, KvKey, KvStore};

/// Cached public keys live this long before a refetch.
pub const KEY_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Default tolerance around a signature's `created` instant.
pub const DEFAULT_TIME_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Errors raised while signing or verifying requests.
#[derive(Debug, Error)]
pub enum SigError {
    /// A signature header failed to parse.
    #[error("malformed signature header: {reason}")]
    MalformedHeader {
        /// What the parser objected to.
        reason: String,
    },

    /// The request carries no signature in any accepted profile.
    #[error("no supported signature found")]
    NoSignature,

    /// The signature did not validate against the resolved key.
    #[error("signature verification failed for key {key_id}")]
    VerificationFailed {
        /// The key that rejected the signature.
        key_id: Url,
    },

    /// The signature's `created` instant is outside the accepted window.
    #[error("signature created time is outside the accepted window")]
    OutsideTimeWindow,

    /// A body digest header did not match the body.
    #[error("body digest mismatch")]
    DigestMismatch,

    /// The signing key could not be resolved to key material.
    #[error("could not resolve signing key {key_id}: {reason}")]
    KeyResolution {
        /// The unresolvable key.
        key_id: Url,
        /// Why resolution failed.
        reason: String,
    },

    /// The key material's encoding is not supported.
    #[error("unsupported key material for {key_id}")]
    UnsupportedKey {
        /// The key with unusable material.
        key_id: Url,
    },

    /// The signing key refused to produce a signature.
    #[error("signing failure: {reason}")]
    Signing {
        /// Why the signer refused.
        reason: String,
    },

    /// The resolved key is not owned by the claimed actor.
    #[error("key {key_id} is not owned by actor {actor}")]
    OwnershipMismatch {
        /// The signing key.
        key_id: Url,
        /// The actor that does not own it.
        actor: Url,
    },

    /// The document loader failed.
    #[error(transparent)]
    Loader(#[from] LoaderError),

    /// The KV store failed.
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Wire profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureProfile {
    /// `draft-cavage-http-signatures-12`.
    DraftCavage,
    /// RFC 9421 "HTTP Message Signatures".
    Rfc9421,
}

/// Options accepted by [`sign_request`].
#[derive(Debug, Clone)]
pub struct SignOptions {
    /// Which profile to emit.
    pub profile: SignatureProfile,
    /// Signing instant; defaults to now.
    pub created: Option<DateTime<Utc>>,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            profile: SignatureProfile::DraftCavage,
            created: None,
        }
    }
}

/// Options accepted by [`verify_request`].
pub struct VerifyOptions<'a> {
    /// Loader used to resolve signing keys.
    pub loader: &'a DocumentLoader,
    /// Store holding the public-key cache.
    pub kv: &'a dyn KvStore,
    /// Codec turning published material into verifiers.
    pub codec: &'a dyn KeyCodec,
    /// Restricts the accepted profiles; `None` accepts both.
    pub profiles: Option<&'a [SignatureProfile]>,
    /// The verifier's current time.
    pub current_time: DateTime<Utc>,
    /// Tolerance around the signature's `created` instant.
    pub time_window: Duration,
}

/// Signs `request` in place with `key` under the chosen profile.
///
/// # Errors
///
/// Returns [`SigError::Signing`] when the request cannot carry the needed
/// headers or the signer refuses.
pub fn sign_request(
    request: &mut Request<Bytes>,
    key: &KeyPair,
    options: &SignOptions,
) -> Result<(), SigError> {
    let created = options.created.unwrap_or_else(Utc::now);
    match options.profile {
        SignatureProfile::DraftCavage => cavage::sign(request, key, created),
        SignatureProfile::Rfc9421 => rfc9421::sign(request, key, created),
    }
}

/// Verifies the request's signature, resolving the signing key through the
/// loader.
///
/// Profile selection inspects headers; when both profiles are present the
/// RFC 9421 signature is preferred. Returns `Ok(None)` when no accepted
/// profile is present at all.
///
/// # Errors
///
/// Returns [`SigError`] when a present signature is malformed, stale,
/// unresolvable, or invalid.
pub async fn verify_request(
    request: &Request<Bytes>,
    options: &VerifyOptions<'_>,
) -> Result<Option<RemoteKey>, SigError> {
    let accepts = |profile: SignatureProfile| {
        options
            .profiles
            .is_none_or(|allowed| allowed.contains(&profile))
    };

    if rfc9421::is_present(request) && accepts(SignatureProfile::Rfc9421) {
        let parsed = rfc9421::parse(request)?;
        check_algorithm(parsed.algorithm.as_deref())?;
        check_window(rfc9421::created_time(&parsed), options)?;
        if parsed.components.iter().any(|c| c == "content-digest") {
            check_content_digest(request)?;
        }
        let base = rfc9421::signature_base(request, &parsed.components, &parsed.params_raw)?;
        let key =
            resolve_and_verify(&parsed.key_id, base.as_bytes(), &parsed.signature, options).await?;
        return Ok(Some(key));
    }

    if cavage::is_present(request) && accepts(SignatureProfile::DraftCavage) {
        let parsed = cavage::parse(request)?;
        check_algorithm(parsed.algorithm.as_deref())?;
        check_window(cavage::created_time(request), options)?;
        if parsed.headers.iter().any(|h| h.eq_ignore_ascii_case("digest")) {
            check_cavage_digest(request)?;
        }
        let base = cavage::signing_string(request, &parsed.headers)?;
        let key =
            resolve_and_verify(&parsed.key_id, base.as_bytes(), &parsed.signature, options).await?;
        return Ok(Some(key));
    }

    Ok(None)
}

/// Verifies a document-level integrity proof (Object Integrity Proof or
/// legacy LD Signature) over the canonicalized document.
///
/// Returns `Ok(None)` when the document carries no proof.
///
/// # Errors
///
/// Returns [`SigError`] when a present proof is malformed, stale, or
/// invalid.
pub async fn verify_document_proof(
    document: &Value,
    options: &VerifyOptions<'_>,
) -> Result<Option<RemoteKey>, SigError> {
    let Some(proof) = proofs::extract(document)? else {
        return Ok(None);
    };
    check_window(proof.created, options)?;
    let base = proofs::signing_document(document);
    let key = resolve_and_verify(&proof.key_id, base.as_bytes(), &proof.signature, options).await?;
    Ok(Some(key))
}

/// Checks that `actor_id` transitively owns `key`: either the actor's
/// document lists the key (`publicKey` or `assertionMethod`), or the key's
/// own `owner` names the actor.
///
/// # Errors
///
/// Returns [`SigError::OwnershipMismatch`] when neither holds, and loader
/// or extraction errors when the actor cannot be fetched.
pub async fn verify_key_ownership(
    actor_id: &Url,
    key: &RemoteKey,
    loader: &DocumentLoader,
) -> Result<Actor, SigError> {
    let span = tracing::info_span!(
        "activitypub.verify_key_ownership",
        key_id = %key.id,
        actor = %actor_id,
    );
    async {
        let fetched = loader.load(actor_id).await?;
        let actor =
            Actor::from_document(fetched.document).map_err(|source| SigError::KeyResolution {
                key_id: key.id.clone(),
                reason: format!("owner document is not an actor: {source}"),
            })?;
        let owned = actor.owns_key(&key.id) || key.owner.as_ref() == Some(actor.id());
        if owned {
            Ok(actor)
        } else {
            Err(SigError::OwnershipMismatch {
                key_id: key.id.clone(),
                actor: actor_id.clone(),
            })
        }
    }
    .instrument(span)
    .await
}

/// Resolves `key_id` (cache first), decodes a verifier, and checks the
/// signature. A cached key that no longer validates is dropped and
/// refetched exactly once before verification fails.
async fn resolve_and_verify(
    key_id: &Url,
    message: &[u8],
    signature: &[u8],
    options: &VerifyOptions<'_>,
) -> Result<RemoteKey, SigError> {
    let cache_key = KvKey::new(["public-key", key_id.as_str()]);

    let (mut remote, mut fetched_fresh) = match options.kv.get(&cache_key).await? {
        Some(cached) => match serde_json::from_value::<RemoteKey>(cached) {
            Ok(remote) => (remote, false),
            Err(_) => (fetch_and_cache(key_id, &cache_key, options).await?, true),
        },
        None => (fetch_and_cache(key_id, &cache_key, options).await?, true),
    };

    loop {
        let verifier = options.codec.decode(&remote.id, &remote.material()?)?;
        if verifier.verify(message, signature) {
            return Ok(remote);
        }
        if fetched_fresh {
            return Err(SigError::VerificationFailed {
                key_id: key_id.clone(),
            });
        }
        // The cached key may be rotated: invalidate and refetch once.
        tracing::debug!(key_id = %key_id, "cached key rejected signature, refetching");
        options.kv.delete(&cache_key).await?;
        remote = fetch_and_cache(key_id, &cache_key, options).await?;
        fetched_fresh = true;
    }
}

async fn fetch_and_cache(
    key_id: &Url,
    cache_key: &KvKey,
    options: &VerifyOptions<'_>,
) -> Result<RemoteKey, SigError> {
    let remote = fetch_remote_key(key_id, options.loader).await?;
    options
        .kv
        .set(
            cache_key,
            serde_json::to_value(&remote).map_err(KvError::from)?,
            Some(KEY_CACHE_TTL),
        )
        .await?;
    Ok(remote)
}

/// Fetches the document behind `key_id` and extracts the matching key: the
/// document is either a bare key object or an actor listing keys.
async fn fetch_remote_key(key_id: &Url, loader: &DocumentLoader) -> Result<RemoteKey, SigError> {
    let fetched = loader.load(key_id).await?;
    let document = fetched.document;
    let object = document
        .as_object()
        .ok_or_else(|| SigError::KeyResolution {
            key_id: key_id.clone(),
            reason: "key document is not a JSON object".into(),
        })?;

    if object.contains_key("publicKey") || object.contains_key("assertionMethod") {
        let actor = Actor::from_document(document.clone()).map_err(|source| {
            SigError::KeyResolution {
                key_id: key_id.clone(),
                reason: format!("actor document rejected: {source}"),
            }
        })?;
        let matching = actor
            .keys()
            .iter()
            .find(|key| &key.id == key_id)
            .or_else(|| actor.keys().first())
            .ok_or_else(|| SigError::KeyResolution {
                key_id: key_id.clone(),
                reason: "actor lists no usable keys".into(),
            })?;
        return Ok(RemoteKey::from_actor_key(matching));
    }

    let pem = object
        .get("publicKeyPem")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let multibase = object
        .get("publicKeyMultibase")
        .and_then(Value::as_str)
        .map(str::to_owned);
    if pem.is_none() && multibase.is_none() {
        return Err(SigError::KeyResolution {
            key_id: key_id.clone(),
            reason: "document carries no key material".into(),
        });
    }
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .and_then(|raw| Url::parse(raw).ok())
        .unwrap_or_else(|| key_id.clone());
    let owner = object
        .get("owner")
        .or_else(|| object.get("controller"))
        .and_then(Value::as_str)
        .and_then(|raw| Url::parse(raw).ok());
    Ok(RemoteKey {
        id,
        owner,
        pem,
        multibase,
    })
}

fn check_algorithm(declared: Option<&str>) -> Result<(), SigError> {
    match declared {
        Some(name) if KeyAlgorithm::from_name(name).is_none() => Err(SigError::MalformedHeader {
            reason: format!("unsupported signature algorithm {name:?}"),
        }),
        _ => Ok(()),
    }
}

fn check_window(
    created: Option<DateTime<Utc>>,
    options: &VerifyOptions<'_>,
) -> Result<(), SigError> {
    let Some(created) = created else {
        return Ok(());
    };
    let window = chrono::TimeDelta::from_std(options.time_window)
        .unwrap_or_else(|_| chrono::TimeDelta::hours(1));
    let skew = options.current_time - created;
    if skew > window || -skew > window {
        return Err(SigError::OutsideTimeWindow);
    }
    Ok(())
}

fn check_content_digest(request: &Request<Bytes>) -> Result<(), SigError> {
    let header = request
        .headers()
        .get("content-digest")
        .and_then(|value| value.to_str().ok())
        .ok_or(SigError::DigestMismatch)?;
    let expected = format!("sha-256=:{}:", body_digest_base64(request.body()));
    if header == expected {
        Ok(())
    } else {
        Err(SigError::DigestMismatch)
    }
}

fn check_cavage_digest(request: &Request<Bytes>) -> Result<(), SigError> {
    let header = request
        .headers()
        .get("digest")
        .and_then(|value| value.to_str().ok())
        .ok_or(SigError::DigestMismatch)?;
    let expected = format!("SHA-256={}", body_digest_base64(request.body()));
    if header.eq_ignore_ascii_case(&expected) {
        Ok(())
    } else {
        Err(SigError::DigestMismatch)
    }
}

/// Base64 SHA-256 of a request body.
pub(crate) fn body_digest_base64(body: &Bytes) -> String {
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(body))
}

/// The cavage `(request-target)` value: lowercased method, path, and query.
fn request_target(request: &Request<Bytes>) -> String {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or("/", http::uri::PathAndQuery::as_str);
    format!(
        "{} {}",
        request.method().as_str().to_ascii_lowercase(),
        path_and_query
    )
}

/// The absolute request URI for the `@target-uri` component.
fn target_uri(request: &Request<Bytes>) -> Result<String, SigError> {
    let uri = request.uri();
    if uri.scheme().is_some() {
        return Ok(uri.to_string());
    }
    let host = request
        .headers()
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .ok_or(SigError::MalformedHeader {
            reason: "cannot derive an absolute target URI".into(),
        })?;
    let path_and_query = uri
        .path_and_query()
        .map_or("/", http::uri::PathAndQuery::as_str);
    Ok(format!("https://{host}{path_and_query}"))
}

#[cfg(test)]
mod tests {
    use super::test_utils::{TestKeyCodec, test_key_pair};
    use super::*;
    use crate::docloader::test_transport::StubTransport;
    use crate::kv::MemoryKvStore;
    use serde_json::json;
    use std::sync::Arc;

    fn signed_request(profile: SignatureProfile, key: &KeyPair) -> Request<Bytes> {
        let mut request = Request::builder()
            .method("POST")
            .uri("https://example.com/users/alice/inbox")
            .header("content-type", "application/activity+json")
            .body(Bytes::from_static(b"{\"type\":\"Create\"}"))
            .unwrap();
        sign_request(
            &mut request,
            key,
            &SignOptions {
                profile,
                created: Some(Utc::now()),
            },
        )
        .unwrap();
        request
    }

    fn loader_with_key(key: &KeyPair, owner: &str) -> (DocumentLoader, Arc<MemoryKvStore>) {
        let kv = Arc::new(MemoryKvStore::new());
        let transport = StubTransport::new();
        transport.insert(
            key.key_id.as_str(),
            json!({
                "id": key.key_id.as_str(),
                "owner": owner,
                "publicKeyPem": key.material.pem,
                "publicKeyMultibase": key.material.multibase,
            }),
        );
        let loader = DocumentLoader::builder(Arc::clone(&kv) as _)
            .transport(Arc::new(transport))
            .build();
        (loader, kv)
    }

    #[tokio::test]
    async fn sign_verify_round_trip_both_profiles() {
        for (profile, algorithm) in [
            (SignatureProfile::DraftCavage, KeyAlgorithm::RsaSha256),
            (SignatureProfile::Rfc9421, KeyAlgorithm::Ed25519),
        ] {
            let key = test_key_pair("https://example.com/users/alice#key", algorithm, b"seed");
            let request = signed_request(profile, &key);
            let (loader, kv) = loader_with_key(&key, "https://example.com/users/alice");
            let codec = TestKeyCodec;

            let verified = verify_request(
                &request,
                &VerifyOptions {
                    loader: &loader,
                    kv: kv.as_ref(),
                    codec: &codec,
                    profiles: None,
                    current_time: Utc::now(),
                    time_window: DEFAULT_TIME_WINDOW,
                },
            )
            .await
            .unwrap()
            .expect("signature present");
            assert_eq!(verified.id, key.key_id);
        }
    }

    #[tokio::test]
    async fn prefers_rfc9421_when_both_profiles_are_present() {
        let cavage_key = test_key_pair(
            "https://example.com/users/alice#rsa",
            KeyAlgorithm::RsaSha256,
            b"rsa-seed",
        );
        let ed_key = test_key_pair(
            "https://example.com/users/alice#ed",
            KeyAlgorithm::Ed25519,
            b"ed-seed",
        );
        let mut request = Request::builder()
            .method("POST")
            .uri("https://example.com/users/alice/inbox")
            .body(Bytes::from_static(b"{}"))
            .unwrap();
        sign_request(&mut request, &cavage_key, &SignOptions::default()).unwrap();
        sign_request(
            &mut request,
            &ed_key,
            &SignOptions {
                profile: SignatureProfile::Rfc9421,
                created: Some(Utc::now()),
            },
        )
        .unwrap();

        let (loader, kv) = loader_with_key(&ed_key, "https://example.com/users/alice");
        let verified = verify_request(
            &request,
            &VerifyOptions {
                loader: &loader,
                kv: kv.as_ref(),
                codec: &TestKeyCodec,
                profiles: None,
                current_time: Utc::now(),
                time_window: DEFAULT_TIME_WINDOW,
            },
        )
        .await
        .unwrap()
        .expect("signature present");
        assert_eq!(verified.id, ed_key.key_id);
    }

    #[tokio::test]
    async fn stale_created_time_is_rejected() {
        let key = test_key_pair(
            "https://example.com/users/alice#key",
            KeyAlgorithm::RsaSha256,
            b"seed",
        );
        let request = signed_request(SignatureProfile::DraftCavage, &key);
        let (loader, kv) = loader_with_key(&key, "https://example.com/users/alice");

        let result = verify_request(
            &request,
            &VerifyOptions {
                loader: &loader,
                kv: kv.as_ref(),
                codec: &TestKeyCodec,
                profiles: None,
                current_time: Utc::now() + chrono::TimeDelta::hours(3),
                time_window: DEFAULT_TIME_WINDOW,
            },
        )
        .await;
        assert!(matches!(result, Err(SigError::OutsideTimeWindow)));
    }

    #[tokio::test]
    async fn tampered_body_fails_the_digest_check() {
        let key = test_key_pair(
            "https://example.com/users/alice#key",
            KeyAlgorithm::RsaSha256,
            b"seed",
        );
        let signed = signed_request(SignatureProfile::DraftCavage, &key);
        let (mut parts, _) = signed.into_parts();
        parts.headers.remove(http::header::CONTENT_LENGTH);
        let tampered = Request::from_parts(parts, Bytes::from_static(b"{\"type\":\"Delete\"}"));

        let (loader, kv) = loader_with_key(&key, "https://example.com/users/alice");
        let result = verify_request(
            &tampered,
            &VerifyOptions {
                loader: &loader,
                kv: kv.as_ref(),
                codec: &TestKeyCodec,
                profiles: None,
                current_time: Utc::now(),
                time_window: DEFAULT_TIME_WINDOW,
            },
        )
        .await;
        assert!(matches!(result, Err(SigError::DigestMismatch)));
    }

    #[tokio::test]
    async fn unsigned_requests_verify_to_none() {
        let request = Request::builder()
            .method("POST")
            .uri("https://example.com/inbox")
            .body(Bytes::new())
            .unwrap();
        let kv = Arc::new(MemoryKvStore::new());
        let loader = DocumentLoader::builder(Arc::clone(&kv) as _)
            .transport(Arc::new(StubTransport::new()))
            .build();
        let verified = verify_request(
            &request,
            &VerifyOptions {
                loader: &loader,
                kv: kv.as_ref(),
                codec: &TestKeyCodec,
                profiles: None,
                current_time: Utc::now(),
                time_window: DEFAULT_TIME_WINDOW,
            },
        )
        .await
        .unwrap();
        assert!(verified.is_none());
    }

    #[tokio::test]
    async fn rotated_key_triggers_one_refetch() {
        let old_key = test_key_pair(
            "https://example.com/users/alice#key",
            KeyAlgorithm::RsaSha256,
            b"old-seed",
        );
        let new_key = test_key_pair(
            "https://example.com/users/alice#key",
            KeyAlgorithm::RsaSha256,
            b"new-seed",
        );

        let kv = Arc::new(MemoryKvStore::new());
        // Seed the cache with the old key, then publish only the new one.
        kv.set(
            &KvKey::new(["public-key", old_key.key_id.as_str()]),
            json!({
                "id": old_key.key_id.as_str(),
                "owner": "https://example.com/users/alice",
                "pem": old_key.material.pem,
                "multibase": null,
            }),
            None,
        )
        .await
        .unwrap();
        let transport = StubTransport::new();
        transport.insert(
            new_key.key_id.as_str(),
            json!({
                "id": new_key.key_id.as_str(),
                "owner": "https://example.com/users/alice",
                "publicKeyPem": new_key.material.pem,
            }),
        );
        let loader = DocumentLoader::builder(Arc::clone(&kv) as _)
            .transport(Arc::new(transport))
            .build();

        let request = signed_request(SignatureProfile::DraftCavage, &new_key);
        let verified = verify_request(
            &request,
            &VerifyOptions {
                loader: &loader,
                kv: kv.as_ref(),
                codec: &TestKeyCodec,
                profiles: None,
                current_time: Utc::now(),
                time_window: DEFAULT_TIME_WINDOW,
            },
        )
        .await
        .unwrap()
        .expect("signature present");
        assert_eq!(verified.pem, new_key.material.pem);
    }

    #[tokio::test]
    async fn document_proof_fallback_verifies_and_ownership_checks() {
        let key = test_key_pair(
            "https://example.com/users/alice#ed",
            KeyAlgorithm::Ed25519,
            b"proof-seed",
        );
        let mut document = json!({
            "id": "https://example.com/create/9",
            "type": "Create",
            "actor": "https://example.com/users/alice",
        });
        let base = serde_json::to_string(&document).unwrap();
        let signature = key.signer.sign(base.as_bytes()).unwrap();
        use base64::Engine as _;
        let proof_value = format!(
            "u{}",
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(signature)
        );
        document["proof"] = json!({
            "type": "DataIntegrityProof",
            "verificationMethod": key.key_id.as_str(),
            "proofValue": proof_value,
        });

        let kv = Arc::new(MemoryKvStore::new());
        let transport = StubTransport::new();
        transport.insert(
            key.key_id.as_str(),
            json!({
                "id": key.key_id.as_str(),
                "owner": "https://example.com/users/alice",
                "publicKeyMultibase": key.material.multibase,
            }),
        );
        transport.insert(
            "https://example.com/users/alice",
            json!({
                "id": "https://example.com/users/alice",
                "type": "Person",
                "inbox": "https://example.com/users/alice/inbox",
                "assertionMethod": [{
                    "id": key.key_id.as_str(),
                    "controller": "https://example.com/users/alice",
                    "publicKeyMultibase": key.material.multibase,
                }],
            }),
        );
        let loader = DocumentLoader::builder(Arc::clone(&kv) as _)
            .transport(Arc::new(transport))
            .build();

        let verified = verify_document_proof(
            &document,
            &VerifyOptions {
                loader: &loader,
                kv: kv.as_ref(),
                codec: &TestKeyCodec,
                profiles: None,
                current_time: Utc::now(),
                time_window: DEFAULT_TIME_WINDOW,
            },
        )
        .await
        .unwrap()
        .expect("proof present");

        let actor_id = Url::parse("https://example.com/users/alice").unwrap();
        let actor = verify_key_ownership(&actor_id, &verified, &loader)
            .await
            .unwrap();
        assert_eq!(actor.id(), &actor_id);

        let stranger = Url::parse("https://other.example/users/mallory").unwrap();
        let transport = StubTransport::new();
        transport.insert(
            stranger.as_str(),
            json!({
                "id": stranger.as_str(),
                "type": "Person",
                "inbox": "https://other.example/users/mallory/inbox",
            }),
        );
        let loader = DocumentLoader::builder(Arc::new(MemoryKvStore::new()) as _)
            .transport(Arc::new(transport))
            .build();
        assert!(matches!(
            verify_key_ownership(&stranger, &verified, &loader).await,
            Err(SigError::OwnershipMismatch { .. })
        ));
    }
}
