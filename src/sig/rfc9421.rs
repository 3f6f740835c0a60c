//! The RFC 9421 "HTTP Message Signatures" profile.
//!
//! Covered components and signature parameters ride in `Signature-Input`;
//! the signature bytes ride in `Signature` as a byte-sequence item. Only
//! the structured-field subset these two headers need is parsed here.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::Request;
use url::Url;

use super::keys::KeyPair;
use super::{SigError, body_digest_base64, target_uri};

/// Label used for signatures this engine produces.
const LABEL: &str = "sig1";

/// Parsed form of a `Signature-Input` / `Signature` header pair.
#[derive(Debug, Clone)]
pub(super) struct ParsedSignature {
    pub key_id: Url,
    pub algorithm: Option<String>,
    pub components: Vec<String>,
    pub created: Option<i64>,
    /// The raw parameter text after the label, replayed verbatim into the
    /// `"@signature-params"` line of the signature base.
    pub params_raw: String,
    pub signature: Vec<u8>,
}

/// Signs `request` in place, setting `Content-Digest` (for bodies) plus the
/// `Signature-Input` and `Signature` headers.
pub(super) fn sign(
    request: &mut Request<Bytes>,
    key: &KeyPair,
    created: DateTime<Utc>,
) -> Result<(), SigError> {
    let mut components = vec!["@method".to_owned(), "@target-uri".to_owned()];
    if !request.body().is_empty() {
        let digest = format!("sha-256=:{}:", body_digest_base64(request.body()));
        request.headers_mut().insert(
            "content-digest",
            digest.parse().map_err(|_| SigError::Signing {
                reason: "content-digest header render failed".into(),
            })?,
        );
        components.push("content-digest".to_owned());
    }

    let inner_list = components
        .iter()
        .map(|component| format!("\"{component}\""))
        .collect::<Vec<_>>()
        .join(" ");
    let params = format!(
        "({inner_list});created={};keyid=\"{}\";alg=\"{}\"",
        created.timestamp(),
        key.key_id,
        key.algorithm().rfc9421_name(),
    );

    let base = signature_base(request, &components, &params)?;
    let signature = key.signer.sign(base.as_bytes())?;

    use base64::Engine as _;
    let encoded = base64::engine::general_purpose::STANDARD.encode(signature);
    request.headers_mut().insert(
        "signature-input",
        format!("{LABEL}={params}")
            .parse()
            .map_err(|_| SigError::Signing {
                reason: "signature-input header render failed".into(),
            })?,
    );
    request.headers_mut().insert(
        "signature",
        format!("{LABEL}=:{encoded}:")
            .parse()
            .map_err(|_| SigError::Signing {
                reason: "signature header render failed".into(),
            })?,
    );
    Ok(())
}

/// Whether the request carries an RFC 9421 signature.
pub(super) fn is_present(request: &Request<Bytes>) -> bool {
    request.headers().contains_key("signature-input")
        && request.headers().contains_key("signature")
}

/// Parses the first signature in `Signature-Input` / `Signature`.
pub(super) fn parse(request: &Request<Bytes>) -> Result<ParsedSignature, SigError> {
    let input = header_str(request, "signature-input")?;
    let (label, params_raw) = input.split_once('=').ok_or(SigError::MalformedHeader {
        reason: "signature-input lists no labeled signature".into(),
    })?;
    let label = label.trim().to_owned();
    let params_raw = params_raw.trim().to_owned();

    let inner = params_raw
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .ok_or(SigError::MalformedHeader {
            reason: "signature params carry no component list".into(),
        })?;
    let (component_list, param_tail) = inner;
    let components: Vec<String> = component_list
        .split_whitespace()
        .map(|item| item.trim_matches('"').to_owned())
        .collect();

    let mut key_id = None;
    let mut algorithm = None;
    let mut created = None;
    for param in param_tail.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = param.split_once('=').unwrap_or((param, ""));
        match name {
            "keyid" => {
                let raw = value.trim_matches('"');
                key_id = Some(Url::parse(raw).map_err(|_| SigError::MalformedHeader {
                    reason: format!("keyid is not a URI: {raw:?}"),
                })?);
            }
            "alg" => algorithm = Some(value.trim_matches('"').to_owned()),
            "created" => {
                created = Some(value.parse::<i64>().map_err(|_| SigError::MalformedHeader {
                    reason: format!("created is not an integer: {value:?}"),
                })?);
            }
            _ => {}
        }
    }

    let signature_header = header_str(request, "signature")?;
    let signature = signature_for_label(signature_header, &label)?;

    Ok(ParsedSignature {
        key_id: key_id.ok_or(SigError::MalformedHeader {
            reason: "missing keyid parameter".into(),
        })?,
        algorithm,
        components,
        created,
        params_raw,
        signature,
    })
}

/// Rebuilds the signature base for the covered components.
pub(super) fn signature_base(
    request: &Request<Bytes>,
    components: &[String],
    params: &str,
) -> Result<String, SigError> {
    let mut lines = Vec::with_capacity(components.len() + 1);
    for component in components {
        let value = match component.as_str() {
            "@method" => request.method().as_str().to_owned(),
            "@target-uri" => target_uri(request)?,
            "@authority" => request
                .headers()
                .get(http::header::HOST)
                .and_then(|value| value.to_str().ok())
                .or_else(|| request.uri().authority().map(|a| a.as_str()))
                .ok_or(SigError::MalformedHeader {
                    reason: "no authority for @authority component".into(),
                })?
                .to_owned(),
            "@path" => request.uri().path().to_owned(),
            other if other.starts_with('@') => {
                return Err(SigError::MalformedHeader {
                    reason: format!("unsupported derived component {other}"),
                });
            }
            header => {
                let values: Vec<&str> = request
                    .headers()
                    .get_all(header)
                    .iter()
                    .filter_map(|value| value.to_str().ok())
                    .collect();
                if values.is_empty() {
                    return Err(SigError::MalformedHeader {
                        reason: format!("covered field {header} is absent"),
                    });
                }
                values.join(", ")
            }
        };
        lines.push(format!("\"{component}\": {value}"));
    }
    lines.push(format!("\"@signature-params\": {params}"));
    Ok(lines.join("\n"))
}

/// The signing instant: the `created` signature parameter.
pub(super) fn created_time(parsed: &ParsedSignature) -> Option<DateTime<Utc>> {
    parsed.created.and_then(|ts| DateTime::from_timestamp(ts, 0))
}

fn header_str<'a>(request: &'a Request<Bytes>, name: &str) -> Result<&'a str, SigError> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or(SigError::NoSignature)
}

fn signature_for_label(header: &str, label: &str) -> Result<Vec<u8>, SigError> {
    for entry in header.split(',') {
        let Some((entry_label, value)) = entry.split_once('=') else {
            continue;
        };
        if entry_label.trim() != label {
            continue;
        }
        let value = value.trim();
        let encoded = value
            .strip_prefix(':')
            .and_then(|rest| rest.strip_suffix(':'))
            .ok_or(SigError::MalformedHeader {
                reason: "signature is not a byte sequence".into(),
            })?;
        use base64::Engine as _;
        return base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|_| SigError::MalformedHeader {
                reason: "signature is not base64".into(),
            });
    }
    Err(SigError::MalformedHeader {
        reason: format!("no signature for label {label}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signature_input_and_matching_signature() {
        let request = Request::builder()
            .method("POST")
            .uri("https://example.com/users/alice/inbox")
            .header(
                "signature-input",
                "sig1=(\"@method\" \"@target-uri\");created=1618884473;\
                 keyid=\"https://a.example/u/x#main\";alg=\"ed25519\"",
            )
            .header("signature", "sig1=:QUJD:")
            .body(Bytes::new())
            .unwrap();

        let parsed = parse(&request).unwrap();
        assert_eq!(parsed.key_id.as_str(), "https://a.example/u/x#main");
        assert_eq!(parsed.algorithm.as_deref(), Some("ed25519"));
        assert_eq!(parsed.components, vec!["@method", "@target-uri"]);
        assert_eq!(parsed.created, Some(1_618_884_473));
        assert_eq!(parsed.signature, b"ABC");
    }

    #[test]
    fn signature_base_replays_the_raw_params() {
        let request = Request::builder()
            .method("POST")
            .uri("https://example.com/inbox")
            .body(Bytes::new())
            .unwrap();
        let params = "(\"@method\" \"@target-uri\");created=1;keyid=\"https://k.example/#a\"";
        let base = signature_base(
            &request,
            &["@method".to_owned(), "@target-uri".to_owned()],
            params,
        )
        .unwrap();
        assert_eq!(
            base,
            "\"@method\": POST\n\
             \"@target-uri\": https://example.com/inbox\n\
             \"@signature-params\": (\"@method\" \"@target-uri\");created=1;keyid=\"https://k.example/#a\""
        );
    }

    #[test]
    fn rejects_unknown_derived_components() {
        let request = Request::builder()
            .method("GET")
            .uri("https://example.com/")
            .body(Bytes::new())
            .unwrap();
        assert!(signature_base(&request, &["@query".to_owned()], "()").is_err());
    }
}
