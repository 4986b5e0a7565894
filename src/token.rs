//! Debug-token codec: a compact, reversible encoding of a `BypassPayload`
//!
//! Tag-length-value fields, snap-compressed, then base64 url-safe
//! (no padding) encoded into the string carried in `X-GB403-Token` and
//! `RawHTTPResponseDetails::debug_token`. The shape (version byte, TLV
//! fields, a compression pass, a text-safe envelope) follows the general
//! "compact binary envelope" pattern common to wire-format codecs,
//! specialized here to the fields a payload carries.

use base64::Engine;
use rand::Rng;
use std::collections::HashMap;

use crate::error::TokenError;
use crate::payload::BypassPayload;

const VERSION: u8 = 1;

// Marks the start of the per-token nonce so a truncated or hand-edited
// token is rejected before the tag loop ever sees it, rather than
// misparsing the nonce bytes as a field tag.
const SENTINEL: [u8; 2] = [0xFF, 0x04];
const NONCE_LEN: usize = 4;

const TAG_SCHEME: u8 = 1;
const TAG_HOST: u8 = 2;
const TAG_RAW_URI: u8 = 3;
const TAG_METHOD: u8 = 4;
const TAG_BYPASS_MODULE: u8 = 5;
const TAG_HEADER: u8 = 6;
const TAG_ORIGINAL_URL: u8 = 7;

// Dictionary tags carry no length/value bytes at all: the tag itself names
// the one value it stands for, so the common case (scheme "https", method
// "GET") costs a single byte instead of a full length-prefixed field.
const TAG_SCHEME_HTTPS: u8 = 8;
const TAG_METHOD_GET: u8 = 9;

fn encode_field(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}

fn encode_payload_fields(payload: &BypassPayload) -> Vec<u8> {
    let mut fields = Vec::new();

    if payload.scheme == "https" {
        fields.push(TAG_SCHEME_HTTPS);
    } else {
        encode_field(&mut fields, TAG_SCHEME, payload.scheme.as_bytes());
    }

    encode_field(&mut fields, TAG_HOST, payload.host.as_bytes());
    encode_field(&mut fields, TAG_RAW_URI, payload.raw_uri.as_bytes());

    if payload.method == "GET" {
        fields.push(TAG_METHOD_GET);
    } else {
        encode_field(&mut fields, TAG_METHOD, payload.method.as_bytes());
    }

    encode_field(&mut fields, TAG_BYPASS_MODULE, payload.bypass_module.as_bytes());
    encode_field(&mut fields, TAG_ORIGINAL_URL, payload.original_url.as_bytes());

    for (name, value) in &payload.headers {
        let joined = format!("{name}\x00{value}");
        encode_field(&mut fields, TAG_HEADER, joined.as_bytes());
    }

    fields
}

/// Encodes `payload` into a compact, URL-safe debug token.
pub fn encode(payload: &BypassPayload) -> String {
    let mut raw = vec![VERSION];
    raw.extend_from_slice(&SENTINEL);
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill(&mut nonce);
    raw.extend_from_slice(&nonce);
    raw.extend(encode_payload_fields(payload));

    let compressed = snap::raw::Encoder::new()
        .compress_vec(&raw)
        .expect("snap compression of in-memory buffer cannot fail");

    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(compressed)
}

/// Decodes a previously-encoded token back into a reconstructed payload.
/// `token` itself is preserved on the returned value (callers resending a
/// token typically want to keep it attached for correlation).
pub fn decode(token: &str) -> Result<BypassPayload, TokenError> {
    let compressed = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| TokenError::Base64(e.to_string()))?;

    let raw = snap::raw::Decoder::new()
        .decompress_vec(&compressed)
        .map_err(|e| TokenError::Decompress(e.to_string()))?;

    let mut cursor: &[u8] = raw.as_slice();
    let version = *cursor.first().ok_or(TokenError::Truncated)?;
    if version != VERSION {
        return Err(TokenError::BadVersion(version));
    }
    cursor = &cursor[1..];

    let sentinel = cursor.get(..2).ok_or(TokenError::Truncated)?;
    if sentinel != SENTINEL {
        return Err(TokenError::BadSentinel);
    }
    cursor = &cursor[2..];
    cursor = cursor.get(NONCE_LEN..).ok_or(TokenError::Truncated)?;

    let mut scheme = String::new();
    let mut host = String::new();
    let mut raw_uri = String::new();
    let mut method = String::new();
    let mut bypass_module = String::new();
    let mut original_url = String::new();
    let mut headers = Vec::new();

    while !cursor.is_empty() {
        let tag = cursor[0];
        cursor = &cursor[1..];

        if tag == TAG_SCHEME_HTTPS {
            scheme = "https".to_string();
            continue;
        }
        if tag == TAG_METHOD_GET {
            method = "GET".to_string();
            continue;
        }

        let len = *cursor.first().ok_or(TokenError::Truncated)? as usize;
        cursor = &cursor[1..];
        let value = cursor.get(..len).ok_or(TokenError::Truncated)?;
        cursor = &cursor[len..];

        match tag {
            TAG_SCHEME => scheme = String::from_utf8_lossy(value).into_owned(),
            TAG_HOST => host = String::from_utf8_lossy(value).into_owned(),
            TAG_RAW_URI => raw_uri = String::from_utf8_lossy(value).into_owned(),
            TAG_METHOD => method = String::from_utf8_lossy(value).into_owned(),
            TAG_BYPASS_MODULE => bypass_module = String::from_utf8_lossy(value).into_owned(),
            TAG_ORIGINAL_URL => original_url = String::from_utf8_lossy(value).into_owned(),
            TAG_HEADER => {
                let text = String::from_utf8_lossy(value);
                if let Some((name, value)) = text.split_once('\x00') {
                    headers.push((name.to_string(), value.to_string()));
                }
            }
            other => return Err(TokenError::UnknownTag(other)),
        }
    }

    Ok(BypassPayload {
        original_url,
        method,
        scheme,
        host,
        raw_uri,
        headers,
        bypass_module,
        token: token.to_string(),
    })
}

/// Decodes `token` and returns its fields as a flat map, for diagnostic
/// display (`gb403 inspect-token`) without reconstructing a live payload.
pub fn inspect(token: &str) -> Result<HashMap<&'static str, String>, TokenError> {
    let payload = decode(token)?;
    let mut map = HashMap::new();
    map.insert("scheme", payload.scheme);
    map.insert("host", payload.host);
    map.insert("raw_uri", payload.raw_uri);
    map.insert("method", payload.method);
    map.insert("bypass_module", payload.bypass_module);
    map.insert("original_url", payload.original_url);
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_simple_payload() {
        let payload = BypassPayload::new(
            "http://example.com/admin",
            "GET",
            "https",
            "example.com",
            "/admin/..;/",
            "mid_paths",
        );
        let token = encode(&payload);
        let decoded = decode(&token).unwrap();
        assert_eq!(decoded.scheme, payload.scheme);
        assert_eq!(decoded.host, payload.host);
        assert_eq!(decoded.raw_uri, payload.raw_uri);
        assert_eq!(decoded.method, payload.method);
        assert_eq!(decoded.bypass_module, payload.bypass_module);
        assert_eq!(decoded.original_url, payload.original_url);
    }

    #[test]
    fn round_trips_with_custom_headers() {
        let payload = BypassPayload::new(
            "http://x/y",
            "POST",
            "http",
            "x",
            "/y",
            "http_headers_url",
        )
        .with_header("X-Forwarded-For", "127.0.0.1")
        .with_header("X-Original-URL", "/admin");
        let token = encode(&payload);
        let decoded = decode(&token).unwrap();
        assert_eq!(decoded.headers, payload.headers);
        assert_eq!(decoded.method, "POST");
    }

    #[test]
    fn rejects_bad_version_byte() {
        let mut raw = vec![99u8];
        raw.extend(encode_payload_fields(&BypassPayload::new(
            "http://x/", "GET", "http", "x", "/", "m",
        )));
        let compressed = snap::raw::Encoder::new().compress_vec(&raw).unwrap();
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(compressed);
        assert_eq!(decode(&token), Err(TokenError::BadVersion(99)));
    }

    #[test]
    fn rejects_garbage_base64() {
        assert!(matches!(decode("not valid base64!!"), Err(TokenError::Base64(_))));
    }

    #[test]
    fn token_is_url_safe() {
        let payload = BypassPayload::new(
            "http://x/a/b?c=d",
            "GET",
            "https",
            "x",
            "/a/b?c=d",
            "mid_paths",
        );
        let token = encode(&payload);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
