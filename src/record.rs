use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hyper::{
    HeaderMap,
    header::{HeaderName, HeaderValue},
};
use serde::{Deserialize, Deserializer, Serialize};

/// Header name to values, names in canonical MIME form. Values for a repeated
/// header keep their original order.
pub type Headers = BTreeMap<String, Vec<String>>;

/// One captured request/response exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "Request")]
    pub request: RecordedRequest,
    #[serde(rename = "Response")]
    pub response: RecordedResponse,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedRequest {
    #[serde(rename = "Method")]
    pub method: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Headers", default, deserialize_with = "null_as_default")]
    pub headers: Headers,
    #[serde(rename = "Body", default, with = "body_base64")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedResponse {
    #[serde(rename = "Status")]
    pub status: u16,
    #[serde(rename = "Headers", default, deserialize_with = "null_as_default")]
    pub headers: Headers,
    #[serde(rename = "Body", default, with = "body_base64")]
    pub body: Vec<u8>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

mod body_base64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(|err| D::Error::custom(format!("invalid base64 body: {err}"))),
            None => Ok(Vec::new()),
        }
    }
}

/// Canonical MIME form of a header name: `content-type` becomes
/// `Content-Type`. Names containing non-token bytes are returned unchanged.
pub fn canonical_header_key(name: &str) -> String {
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return name.to_owned();
    }

    let mut canonical = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            canonical.push(ch.to_ascii_uppercase());
        } else {
            canonical.push(ch.to_ascii_lowercase());
        }
        upper = ch == '-';
    }
    canonical
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

pub fn headers_from_http(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        out.entry(canonical_header_key(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

/// Converts recorded headers back to a `HeaderMap`, skipping the names in
/// `skip` (case-insensitive) and any entry that is not a legal header.
pub fn headers_to_http(headers: &Headers, skip: &[HeaderName]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, values) in headers {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!(header = %name, "skipping recorded header with invalid name");
            continue;
        };
        if skip.contains(&header_name) {
            continue;
        }
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(header_value) => {
                    out.append(header_name.clone(), header_value);
                }
                Err(_) => {
                    tracing::debug!(header = %name, "skipping recorded header with invalid value");
                }
            }
        }
    }
    out
}
