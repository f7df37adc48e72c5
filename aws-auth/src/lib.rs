// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Sentinel payload hash for bodies that are streamed and not hashed up front.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Everything except RFC 3986 unreserved characters gets percent-encoded.
const STRICT_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Error)]
pub enum SignError {
    #[error("request url has no host")]
    MissingHost,

    #[error("header {0} is not valid ascii")]
    InvalidHeader(String),

    #[error("invalid header value: {0}")]
    BuildHeader(#[from] reqwest::header::InvalidHeaderValue),
}

#[derive(Clone, Debug)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl AwsCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }
}

pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Signs `reqwest` requests with AWS Signature Version 4.
#[derive(Clone, Debug)]
pub struct RequestSigner {
    credentials: AwsCredentials,
    region: String,
    service: String,
}

impl RequestSigner {
    pub fn new(
        credentials: AwsCredentials,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            region: region.into(),
            service: service.into(),
        }
    }

    /// Adds `host`, `x-amz-date` (and `x-amz-content-sha256` for S3) to the
    /// request, then the `Authorization` header covering all present headers.
    ///
    /// `payload_hash` is the lowercase hex SHA-256 of the request body, the
    /// empty-body hash for no body, or [`UNSIGNED_PAYLOAD`] for streamed
    /// bodies.
    pub fn sign(&self, request: &mut reqwest::Request, payload_hash: &str) -> Result<(), SignError> {
        self.sign_at(request, payload_hash, Utc::now())
    }

    fn sign_at(
        &self,
        request: &mut reqwest::Request,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SignError> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let host = {
            let url = request.url();
            let host = url.host_str().ok_or(SignError::MissingHost)?;
            match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            }
        };

        {
            let headers = request.headers_mut();
            headers.insert("host", host.parse()?);
            headers.insert("x-amz-date", amz_date.parse()?);
            if self.service == "s3" {
                headers.insert("x-amz-content-sha256", payload_hash.parse()?);
            }
        }

        let mut canonical_headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in request.headers() {
            let value = value
                .to_str()
                .map_err(|_| SignError::InvalidHeader(name.to_string()))?;
            canonical_headers
                .entry(name.as_str().to_lowercase())
                .or_default()
                .push(value.trim().to_string());
        }

        let signed_headers = canonical_headers
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = {
            let mut query: Vec<(String, String)> = request
                .url()
                .query_pairs()
                .map(|(k, v)| {
                    (
                        utf8_percent_encode(&k, STRICT_ENCODE).to_string(),
                        utf8_percent_encode(&v, STRICT_ENCODE).to_string(),
                    )
                })
                .collect();
            query.sort();
            let canonical_query = query
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");

            let header_lines = canonical_headers
                .iter()
                .map(|(name, values)| format!("{}:{}\n", name, values.join(",")))
                .collect::<String>();

            format!(
                "{}\n{}\n{}\n{}\n{}\n{}",
                request.method().as_str(),
                request.url().path(),
                canonical_query,
                header_lines,
                signed_headers,
                payload_hash,
            )
        };

        let scope = format!("{}/{}/{}/aws4_request", date, self.region, self.service);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            sha256_hex(&canonical_request),
        );

        let key = derive_signing_key(
            &self.credentials.secret_access_key,
            &date,
            &self.region,
            &self.service,
        );
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.credentials.access_key_id, scope, signed_headers, signature,
        );
        request
            .headers_mut()
            .insert("authorization", authorization.parse()?);

        Ok(())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    // Test vectors from the AWS Signature Version 4 documentation.
    const SECRET: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";
    const ACCESS: &str = "AKIDEXAMPLE";

    #[test]
    fn test_derive_signing_key() {
        let key = derive_signing_key(SECRET, "20150830", "us-east-1", "iam");
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn test_sign_get_request() -> Result<(), SignError> {
        let signer = RequestSigner::new(
            AwsCredentials::new(ACCESS, SECRET),
            "us-east-1",
            "iam",
        );

        let client = reqwest::Client::new();
        let mut request = client
            .get("https://iam.amazonaws.com/?Action=ListUsers&Version=2010-05-08")
            .header(
                "content-type",
                "application/x-www-form-urlencoded; charset=utf-8",
            )
            .build()
            .unwrap();

        let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
        signer.sign_at(&mut request, &sha256_hex(b""), now)?;

        let authorization = request.headers()["authorization"].to_str().unwrap();
        assert_eq!(
            authorization,
            "AWS4-HMAC-SHA256 \
             Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request, \
             SignedHeaders=content-type;host;x-amz-date, \
             Signature=5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
        );
        assert_eq!(request.headers()["x-amz-date"], "20150830T123600Z");
        Ok(())
    }

    #[test]
    fn test_sign_inserts_content_hash_for_s3() {
        let signer = RequestSigner::new(AwsCredentials::new(ACCESS, SECRET), "us-east-1", "s3");
        let client = reqwest::Client::new();
        let mut request = client.get("https://s3.example.com/data/key").build().unwrap();

        signer.sign(&mut request, UNSIGNED_PAYLOAD).unwrap();

        assert_eq!(request.headers()["x-amz-content-sha256"], UNSIGNED_PAYLOAD);
        assert!(request.headers().contains_key("authorization"));
    }
}
