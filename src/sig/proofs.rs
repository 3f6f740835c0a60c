//! Document-level integrity proofs.
//!
//! When the HTTP-layer signature cannot be verified, an inbound document may
//! still carry an Object Integrity Proof (`proof`) or a legacy LD Signature
//! (`signature`) computed over the canonicalized document itself.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::Value;
use url::Url;

use super::SigError;

/// A proof extracted from a document body.
#[derive(Debug, Clone)]
pub(super) struct DocumentProof {
    pub key_id: Url,
    pub created: Option<DateTime<Utc>>,
    pub signature: Vec<u8>,
}

/// Extracts the first supported proof from `document`, if any.
pub(super) fn extract(document: &Value) -> Result<Option<DocumentProof>, SigError> {
    let Some(object) = document.as_object() else {
        return Ok(None);
    };

    if let Some(proof) = object.get("proof").and_then(Value::as_object) {
        let key_id = proof
            .get("verificationMethod")
            .and_then(Value::as_str)
            .and_then(|raw| Url::parse(raw).ok())
            .ok_or(SigError::MalformedHeader {
                reason: "proof lists no verificationMethod URI".into(),
            })?;
        let signature = proof
            .get("proofValue")
            .and_then(Value::as_str)
            .map(decode_proof_value)
            .transpose()?
            .ok_or(SigError::MalformedHeader {
                reason: "proof carries no proofValue".into(),
            })?;
        return Ok(Some(DocumentProof {
            key_id,
            created: parse_created(proof.get("created")),
            signature,
        }));
    }

    if let Some(signature) = object.get("signature").and_then(Value::as_object) {
        let key_id = signature
            .get("creator")
            .and_then(Value::as_str)
            .and_then(|raw| Url::parse(raw).ok())
            .ok_or(SigError::MalformedHeader {
                reason: "signature lists no creator URI".into(),
            })?;
        let value = signature
            .get("signatureValue")
            .and_then(Value::as_str)
            .ok_or(SigError::MalformedHeader {
                reason: "signature carries no signatureValue".into(),
            })?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(value.as_bytes())
            .map_err(|_| SigError::MalformedHeader {
                reason: "signatureValue is not base64".into(),
            })?;
        return Ok(Some(DocumentProof {
            key_id,
            created: parse_created(signature.get("created")),
            signature: decoded,
        }));
    }

    Ok(None)
}

/// The canonical byte string a document proof signs: the document minus its
/// proof fields, serialized with ordered keys.
pub(super) fn signing_document(document: &Value) -> String {
    let mut stripped = document.clone();
    if let Some(object) = stripped.as_object_mut() {
        object.remove("proof");
        object.remove("signature");
    }
    serde_json::to_string(&stripped).expect("JSON value serializes")
}

fn parse_created(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn decode_proof_value(raw: &str) -> Result<Vec<u8>, SigError> {
    // Multibase base64url (the `u` prefix) or bare base64.
    if let Some(encoded) = raw.strip_prefix('u') {
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map_err(|_| SigError::MalformedHeader {
                reason: "proofValue is not multibase base64url".into(),
            })
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(raw.as_bytes())
            .map_err(|_| SigError::MalformedHeader {
                reason: "proofValue encoding is unsupported".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_an_object_integrity_proof() {
        let document = json!({
            "id": "https://a.example/create/1",
            "type": "Create",
            "proof": {
                "type": "DataIntegrityProof",
                "verificationMethod": "https://a.example/u/x#ed",
                "created": "2026-01-01T00:00:00Z",
                "proofValue": "uQUJD",
            },
        });
        let proof = extract(&document).unwrap().unwrap();
        assert_eq!(proof.key_id.as_str(), "https://a.example/u/x#ed");
        assert_eq!(proof.signature, b"ABC");
        assert!(proof.created.is_some());
    }

    #[test]
    fn extracts_a_legacy_ld_signature() {
        let document = json!({
            "type": "Create",
            "signature": {
                "type": "RsaSignature2017",
                "creator": "https://a.example/u/x#main",
                "signatureValue": "QUJD",
            },
        });
        let proof = extract(&document).unwrap().unwrap();
        assert_eq!(proof.key_id.as_str(), "https://a.example/u/x#main");
        assert_eq!(proof.signature, b"ABC");
    }

    #[test]
    fn signing_document_strips_proof_fields_and_orders_keys() {
        let document = json!({
            "type": "Create",
            "id": "https://a.example/1",
            "proof": {"proofValue": "uQUJD"},
        });
        assert_eq!(
            signing_document(&document),
            r#"{"id":"https://a.example/1","type":"Create"}"#
        );
    }

    #[test]
    fn absent_proofs_yield_none() {
        assert!(extract(&json!({"type": "Create"})).unwrap().is_none());
    }
}
