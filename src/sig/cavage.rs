//! The `draft-cavage-http-signatures-12` profile.
//!
//! Signatures cover a newline-joined list of `name: value` lines, announced
//! in the `Signature` header's `headers` parameter. The signing instant
//! rides in the standard `Date` header.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::Request;
use url::Url;

use super::keys::KeyPair;
use super::{SigError, body_digest_base64, request_target};

/// Parsed form of a `Signature` header.
#[derive(Debug, Clone)]
pub(super) struct ParsedSignature {
    pub key_id: Url,
    pub algorithm: Option<String>,
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

/// Signs `request` in place, setting `Date`, `Host`, `Digest` (for bodies),
/// and the `Signature` header.
pub(super) fn sign(
    request: &mut Request<Bytes>,
    key: &KeyPair,
    created: DateTime<Utc>,
) -> Result<(), SigError> {
    ensure_host_header(request)?;
    if !request.headers().contains_key(http::header::DATE) {
        let date = created.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        request.headers_mut().insert(
            http::header::DATE,
            date.parse().map_err(|_| SigError::Signing {
                reason: "date header render failed".into(),
            })?,
        );
    }

    let mut covered = vec!["(request-target)", "host", "date"];
    if !request.body().is_empty() {
        let digest = format!("SHA-256={}", body_digest_base64(request.body()));
        request.headers_mut().insert(
            "digest",
            digest.parse().map_err(|_| SigError::Signing {
                reason: "digest header render failed".into(),
            })?,
        );
        covered.push("digest");
    }

    let covered: Vec<String> = covered.into_iter().map(str::to_owned).collect();
    let base = signing_string(request, &covered)?;
    let signature = key.signer.sign(base.as_bytes())?;

    use base64::Engine as _;
    let header = format!(
        "keyId=\"{}\",algorithm=\"{}\",headers=\"{}\",signature=\"{}\"",
        key.key_id,
        key.algorithm().cavage_name(),
        covered.join(" "),
        base64::engine::general_purpose::STANDARD.encode(signature),
    );
    request.headers_mut().insert(
        "signature",
        header.parse().map_err(|_| SigError::Signing {
            reason: "signature header render failed".into(),
        })?,
    );
    Ok(())
}

/// Whether the request carries a cavage `Signature` header (and not an RFC
/// 9421 `Signature-Input`, which reuses the `Signature` name).
pub(super) fn is_present(request: &Request<Bytes>) -> bool {
    request.headers().contains_key("signature")
        && !request.headers().contains_key("signature-input")
}

/// Parses the `Signature` header.
pub(super) fn parse(request: &Request<Bytes>) -> Result<ParsedSignature, SigError> {
    let header = request
        .headers()
        .get("signature")
        .and_then(|value| value.to_str().ok())
        .ok_or(SigError::NoSignature)?;

    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;
    for (name, value) in split_params(header) {
        match name.as_str() {
            "keyId" => {
                key_id = Some(Url::parse(&value).map_err(|_| SigError::MalformedHeader {
                    reason: format!("keyId is not a URI: {value:?}"),
                })?);
            }
            "algorithm" => algorithm = Some(value),
            "headers" => {
                headers = Some(value.split(' ').map(str::to_owned).collect::<Vec<_>>());
            }
            "signature" => {
                use base64::Engine as _;
                signature = Some(
                    base64::engine::general_purpose::STANDARD
                        .decode(value.as_bytes())
                        .map_err(|_| SigError::MalformedHeader {
                            reason: "signature is not base64".into(),
                        })?,
                );
            }
            _ => {}
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or(SigError::MalformedHeader {
            reason: "missing keyId".into(),
        })?,
        algorithm,
        // Per the draft, an absent headers list means the Date header alone.
        headers: headers.unwrap_or_else(|| vec!["date".to_owned()]),
        signature: signature.ok_or(SigError::MalformedHeader {
            reason: "missing signature".into(),
        })?,
    })
}

/// Rebuilds the signing string for the covered header list.
pub(super) fn signing_string(
    request: &Request<Bytes>,
    covered: &[String],
) -> Result<String, SigError> {
    let mut lines = Vec::with_capacity(covered.len());
    for name in covered {
        let lower = name.to_ascii_lowercase();
        let line = match lower.as_str() {
            "(request-target)" => format!("(request-target): {}", request_target(request)),
            "(created)" | "(expires)" => {
                return Err(SigError::MalformedHeader {
                    reason: format!("unsupported pseudo-header {name}"),
                });
            }
            _ => {
                let values: Vec<&str> = request
                    .headers()
                    .get_all(lower.as_str())
                    .iter()
                    .filter_map(|value| value.to_str().ok())
                    .collect();
                if values.is_empty() {
                    return Err(SigError::MalformedHeader {
                        reason: format!("covered header {name} is absent"),
                    });
                }
                format!("{lower}: {}", values.join(", "))
            }
        };
        lines.push(line);
    }
    Ok(lines.join("\n"))
}

/// The signing instant: the request's `Date` header.
pub(super) fn created_time(request: &Request<Bytes>) -> Option<DateTime<Utc>> {
    let raw = request.headers().get(http::header::DATE)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn ensure_host_header(request: &mut Request<Bytes>) -> Result<(), SigError> {
    if request.headers().contains_key(http::header::HOST) {
        return Ok(());
    }
    let authority = request
        .uri()
        .authority()
        .map(|authority| authority.to_string())
        .ok_or(SigError::Signing {
            reason: "request has neither a Host header nor an authority".into(),
        })?;
    request.headers_mut().insert(
        http::header::HOST,
        authority.parse().map_err(|_| SigError::Signing {
            reason: "host header render failed".into(),
        })?,
    );
    Ok(())
}

/// Splits `k="v"` parameters separated by commas, tolerating commas inside
/// quoted values.
fn split_params(header: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = header;
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let name = rest[..eq].trim().to_owned();
        let after = &rest[eq + 1..];
        if let Some(stripped) = after.strip_prefix('"') {
            let Some(close) = stripped.find('"') else { break };
            params.push((name, stripped[..close].to_owned()));
            rest = stripped[close + 1..].trim_start_matches([',', ' ']);
        } else {
            let end = after.find(',').unwrap_or(after.len());
            params.push((name, after[..end].trim().to_owned()));
            rest = after[end..].trim_start_matches([',', ' ']);
        }
    }
    params
}
