//! AWS Signature Version 4 verification.
//!
//! Every request must carry an `Authorization: AWS4-HMAC-SHA256 ...` header.
//! Verification follows the SigV4 algorithm:
//! 1. Parse the header into its three fields
//! 2. Check the access key and the credential scope
//! 3. Buffer the body and build the canonical request
//! 4. Build the string-to-sign and derive the signing key via HMAC chain
//! 5. Compare the computed signature with the presented one
//!
//! Nothing here is cached across requests.

use std::collections::BTreeMap;

use axum::body::Body;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use http::request::Parts;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

type HmacSha256 = Hmac<Sha256>;

/// The only signing algorithm accepted.
pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// SHA-256 of the empty string.
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

// ── Errors ──────────────────────────────────────────────────────────

/// Why a request was not accepted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingAuthorization,

    #[error("Authorization header does not use {ALGORITHM}")]
    UnsupportedAlgorithm,

    #[error("malformed Authorization header: {0}")]
    MalformedAuthorization(&'static str),

    #[error("credential does not belong to the configured access key")]
    UnknownAccessKey,

    #[error("credential scope must be <key>/<date>/<region>/s3/aws4_request")]
    InvalidCredentialScope,

    #[error("x-amz-date is missing or outside the allowed clock skew")]
    RequestTimeTooSkewed,

    #[error("signature does not match")]
    SignatureMismatch,

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    BodyRead(String),
}

impl AuthError {
    /// Short label used for the auth-failure metric.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingAuthorization => "missing",
            AuthError::UnsupportedAlgorithm => "algorithm",
            AuthError::MalformedAuthorization(_) => "malformed",
            AuthError::UnknownAccessKey => "access_key",
            AuthError::InvalidCredentialScope => "scope",
            AuthError::RequestTimeTooSkewed => "clock_skew",
            AuthError::SignatureMismatch => "signature",
            AuthError::BodyTooLarge { .. } => "body_too_large",
            AuthError::BodyRead(_) => "body_read",
        }
    }
}

// ── Parsed types ────────────────────────────────────────────────────

/// The three fields of an `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationHeader {
    /// `<key>/<date>/<region>/<service>/aws4_request`
    pub credential: String,
    /// Header names in the order the client listed them.
    pub signed_headers: Vec<String>,
    /// Lower-case hex signature.
    pub signature: String,
}

/// The credential split into its five components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialScope {
    pub access_key: String,
    pub date: String,
    pub region: String,
    pub service: String,
    pub terminator: String,
}

impl CredentialScope {
    /// Split a `Credential` value. Exactly five `/`-separated components are
    /// required, the last two being `s3` and `aws4_request`.
    pub fn parse(credential: &str) -> Result<Self, AuthError> {
        let parts: Vec<&str> = credential.split('/').collect();
        let [access_key, date, region, service, terminator] = parts.as_slice() else {
            return Err(AuthError::InvalidCredentialScope);
        };
        if *service != "s3" || *terminator != "aws4_request" || date.len() != 8 {
            return Err(AuthError::InvalidCredentialScope);
        }
        Ok(Self {
            access_key: access_key.to_string(),
            date: date.to_string(),
            region: region.to_string(),
            service: service.to_string(),
            terminator: terminator.to_string(),
        })
    }

    /// The credential without its access key: `date/region/service/aws4_request`.
    pub fn scope(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.date, self.region, self.service, self.terminator
        )
    }
}

// ── Authorization header parsing ────────────────────────────────────

/// Parse the `Authorization` header value into its components.
///
/// Expected format:
/// ```text
/// AWS4-HMAC-SHA256 Credential=AKID/20130524/us-east-1/s3/aws4_request, SignedHeaders=host;x-amz-date, Signature=abcdef...
/// ```
///
/// Exactly three comma-separated `Key=Value` fields are accepted; each of
/// `Credential`, `SignedHeaders` and `Signature` must appear once.
pub fn parse_authorization_header(header: &str) -> Result<AuthorizationHeader, AuthError> {
    let rest = header
        .trim()
        .strip_prefix(ALGORITHM)
        .ok_or(AuthError::UnsupportedAlgorithm)?
        .trim();

    let fields: Vec<&str> = rest.split(',').collect();
    if fields.len() != 3 {
        return Err(AuthError::MalformedAuthorization("expected three fields"));
    }

    let mut credential = None;
    let mut signed_headers = None;
    let mut signature = None;

    for field in fields {
        let mut pieces = field.trim().split('=');
        let (Some(name), Some(value), None) = (pieces.next(), pieces.next(), pieces.next()) else {
            return Err(AuthError::MalformedAuthorization("field is not Key=Value"));
        };
        let slot = match name {
            "Credential" => &mut credential,
            "SignedHeaders" => &mut signed_headers,
            "Signature" => &mut signature,
            _ => return Err(AuthError::MalformedAuthorization("unknown field")),
        };
        if slot.replace(value.trim()).is_some() {
            return Err(AuthError::MalformedAuthorization("duplicate field"));
        }
    }

    let (Some(credential), Some(signed_headers), Some(signature)) =
        (credential, signed_headers, signature)
    else {
        return Err(AuthError::MalformedAuthorization("missing field"));
    };
    if credential.is_empty() || signed_headers.is_empty() || signature.is_empty() {
        return Err(AuthError::MalformedAuthorization("empty field"));
    }

    Ok(AuthorizationHeader {
        credential: credential.to_string(),
        signed_headers: signed_headers.split(';').map(str::to_string).collect(),
        signature: signature.to_string(),
    })
}

// ── Header lookup ───────────────────────────────────────────────────

/// Case-insensitive, ordered view of the request headers.
///
/// Names are stored lower-case; inserting an existing name replaces the
/// previous value. Repeated HTTP headers are joined with `,` on construction.
#[derive(Debug, Clone, Default)]
pub struct HeaderLookup {
    entries: BTreeMap<String, String>,
}

impl HeaderLookup {
    /// Build the lookup for a request: the URI authority seeds `host`, then
    /// every transmitted header is added.
    pub fn from_parts(parts: &Parts) -> Self {
        let mut lookup = Self::default();
        if let Some(authority) = parts.uri.authority() {
            lookup.insert("host", authority.as_str());
        }

        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in parts.headers.iter() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            grouped.entry(name.as_str().to_string()).or_default().push(value);
        }
        for (name, values) in grouped {
            lookup.insert(&name, &values.join(","));
        }
        lookup
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.entries
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

// ── Body buffering ──────────────────────────────────────────────────

/// A request body read completely into memory.
///
/// The signature check hashes it and the operation consumes it; both get
/// their own view of the same bytes.
#[derive(Debug, Clone, Default)]
pub struct BufferedBody {
    bytes: Bytes,
}

impl BufferedBody {
    /// Read the whole body, failing once more than `limit` bytes arrive.
    pub async fn read(body: Body, limit: usize) -> Result<Self, AuthError> {
        let collected = Limited::new(body, limit).collect().await.map_err(|err| {
            if err.downcast_ref::<LengthLimitError>().is_some() {
                AuthError::BodyTooLarge { limit }
            } else {
                AuthError::BodyRead(err.to_string())
            }
        })?;
        Ok(Self {
            bytes: collected.to_bytes(),
        })
    }

    /// A fresh handle on the buffered bytes. Cloning `Bytes` does not copy.
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Bytes> for BufferedBody {
    fn from(bytes: Bytes) -> Self {
        Self { bytes }
    }
}

// ── Canonical request construction ──────────────────────────────────

/// Build the canonical request string.
///
/// ```text
/// HTTPMethod + '\n' +
/// CanonicalURI + '\n' +
/// CanonicalQueryString + '\n' +
/// CanonicalHeaders + '\n' +
/// SignedHeaders + '\n' +
/// HashedPayload
/// ```
///
/// Header lines follow the order of `signed_headers`. A listed header the
/// request does not carry contributes `name:` with an empty value.
pub fn build_canonical_request(
    method: &str,
    raw_path: &str,
    raw_query: &str,
    headers: &HeaderLookup,
    signed_headers: &[String],
    payload_hash: &str,
) -> String {
    let canonical_uri = s3_uri_encode_path(raw_path);
    let canonical_query = build_canonical_query_string(raw_query);

    let mut canonical_headers = String::new();
    for name in signed_headers {
        let name = name.to_ascii_lowercase();
        let value = headers.get(&name).map(collapse_whitespace).unwrap_or_default();
        canonical_headers.push_str(&name);
        canonical_headers.push(':');
        canonical_headers.push_str(&value);
        canonical_headers.push('\n');
    }

    let signed_headers = signed_headers.join(";");
    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    )
}

/// Build the canonical query string from the raw query string.
///
/// Each name and value is decoded (`+` meaning space) and re-encoded with
/// S3's URI rules, so a space always ends up as `%20`. Pairs are sorted by
/// name, then value. Parameters without a value render as `name=`.
pub fn build_canonical_query_string(raw_query: &str) -> String {
    let mut params: Vec<(String, String)> = raw_query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (name, value) = part.split_once('=').unwrap_or((part, ""));
            (
                s3_uri_encode(&form_decode(name), true),
                s3_uri_encode(&form_decode(value), true),
            )
        })
        .collect();

    params.sort();

    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Hex SHA-256 of a payload.
pub fn hash_payload(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

// ── String to sign ──────────────────────────────────────────────────

/// Build the string to sign.
///
/// ```text
/// AWS4-HMAC-SHA256 + '\n' +
/// Timestamp + '\n' +
/// CredentialScope + '\n' +
/// HexEncode(SHA256(CanonicalRequest))
/// ```
pub fn build_string_to_sign(
    timestamp: &str,
    credential_scope: &str,
    canonical_request: &str,
) -> String {
    let hash = hash_payload(canonical_request.as_bytes());
    format!("{ALGORITHM}\n{timestamp}\n{credential_scope}\n{hash}")
}

// ── Signing key derivation ──────────────────────────────────────────

/// Derive the signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC-SHA256("AWS4" + secret, dateStamp)
/// kRegion  = HMAC-SHA256(kDate, region)
/// kService = HMAC-SHA256(kRegion, service)
/// kSigning = HMAC-SHA256(kService, "aws4_request")
/// ```
pub fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let k_secret = format!("AWS4{secret_key}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// ── Signature computation ───────────────────────────────────────────

/// Compute the signature: HexEncode(HMAC-SHA256(SigningKey, StringToSign)).
pub fn compute_signature(signing_key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
}

/// Compare two signature strings in constant time. Case-sensitive.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Reject an `x-amz-date` further than `max_skew_secs` away from `now`.
pub fn check_clock_skew(
    amz_date: &str,
    now: DateTime<Utc>,
    max_skew_secs: u64,
) -> Result<(), AuthError> {
    let signed_at = NaiveDateTime::parse_from_str(amz_date, "%Y%m%dT%H%M%SZ")
        .map_err(|_| AuthError::RequestTimeTooSkewed)?
        .and_utc();
    let skew = (now - signed_at).num_seconds().unsigned_abs();
    if skew > max_skew_secs {
        return Err(AuthError::RequestTimeTooSkewed);
    }
    Ok(())
}

// ── Verifier ────────────────────────────────────────────────────────

/// Checks SigV4 `Authorization` headers against the configured key pair.
pub struct SigV4Verifier<'a> {
    access_key: &'a str,
    secret_key: &'a str,
    max_clock_skew_secs: u64,
    max_body: usize,
}

impl<'a> SigV4Verifier<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            access_key: &config.auth.access_key,
            secret_key: &config.auth.secret_key,
            max_clock_skew_secs: config.auth.max_clock_skew_secs,
            max_body: usize::try_from(config.server.max_object_size).unwrap_or(usize::MAX),
        }
    }

    /// Verify a request. On success the fully buffered body is returned for
    /// the operation to consume.
    ///
    /// The header is parsed and the credential checked before the body is
    /// read or anything is canonicalized.
    pub async fn verify(&self, parts: &Parts, body: Body) -> Result<BufferedBody, AuthError> {
        let header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .ok_or(AuthError::MissingAuthorization)?
            .to_str()
            .map_err(|_| AuthError::MalformedAuthorization("header is not ASCII"))?;
        let auth = parse_authorization_header(header)?;

        if !auth.credential.starts_with(&format!("{}/", self.access_key)) {
            return Err(AuthError::UnknownAccessKey);
        }
        let scope = CredentialScope::parse(&auth.credential)?;

        let headers = HeaderLookup::from_parts(parts);
        let amz_date = headers.get("x-amz-date").unwrap_or_default().to_string();
        if self.max_clock_skew_secs > 0 {
            check_clock_skew(&amz_date, Utc::now(), self.max_clock_skew_secs)?;
        }

        let body = BufferedBody::read(body, self.max_body).await?;

        let canonical_request = build_canonical_request(
            parts.method.as_str(),
            parts.uri.path(),
            parts.uri.query().unwrap_or(""),
            &headers,
            &auth.signed_headers,
            &hash_payload(&body.bytes),
        );
        let string_to_sign = build_string_to_sign(&amz_date, &scope.scope(), &canonical_request);
        let signing_key =
            derive_signing_key(self.secret_key, &scope.date, &scope.region, &scope.service);
        let expected = compute_signature(&signing_key, &string_to_sign);

        if !constant_time_eq(&expected, &auth.signature) {
            debug!(canonical_request = %canonical_request, "signature mismatch");
            return Err(AuthError::SignatureMismatch);
        }
        Ok(body)
    }
}

// ── URI encoding ────────────────────────────────────────────────────

/// S3-compatible URI encoding (RFC 3986 with S3 exceptions).
///
/// - Characters A-Z, a-z, 0-9, -, _, ., ~ are NOT encoded.
/// - All other bytes are percent-encoded with uppercase hex.
/// - If `encode_slash` is false, `/` is kept (for URI paths).
pub fn s3_uri_encode(input: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len() * 2);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            b'/' if !encode_slash => encoded.push('/'),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// URI-encode a path for S3 canonical requests.
///
/// The raw path may already be percent-encoded, so it is decoded first and
/// then re-encoded segment by segment, keeping `/`.
pub fn s3_uri_encode_path(raw_path: &str) -> String {
    if raw_path.is_empty() || raw_path == "/" {
        return "/".to_string();
    }
    let decoded = percent_decode_str(raw_path).decode_utf8_lossy();
    let encoded = s3_uri_encode(&decoded, false);
    if encoded.starts_with('/') {
        encoded
    } else {
        format!("/{encoded}")
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Decode one `application/x-www-form-urlencoded` component.
fn form_decode(s: &str) -> String {
    let spaced = s.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Collapse consecutive whitespace in a header value to a single space,
/// and trim leading/trailing whitespace.
fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Tests ───────────────────────────────────────────────────────────
