use okvm_core::{OkvmError, OkvmResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Header carrying the client key.
pub const CLIENT_HEADER: &str = "x-client-id";
/// Cookie carrying the client key.
pub const CLIENT_COOKIE: &str = "okvm_client";
/// Query parameter carrying the client key.
pub const CLIENT_QUERY_PARAM: &str = "client_id";

const MAX_KEY_LEN: usize = 128;

/// Opaque identifier that binds requests to one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientKey(String);

impl ClientKey {
    /// Accepts 1 to 128 characters of `[A-Za-z0-9._-]`.
    pub fn parse(raw: &str) -> OkvmResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OkvmError::InvalidClientKey("empty key".into()));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(OkvmError::InvalidClientKey(format!(
                "key longer than {MAX_KEY_LEN} characters"
            )));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(OkvmError::InvalidClientKey(format!(
                "unexpected character {bad:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// A fresh random key for a client that did not present one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ClientKey {
    type Error = OkvmError;

    fn try_from(value: String) -> OkvmResult<Self> {
        Self::parse(&value)
    }
}

impl From<ClientKey> for String {
    fn from(key: ClientKey) -> Self {
        key.0
    }
}

/// Finds the client key among the places a request can carry it.
///
/// Precedence is header, then cookie, then query string. The first source
/// that is present decides: a malformed value there is an error rather
/// than a reason to look further. `Ok(None)` means no source had a key.
pub fn derive_client_key(
    header: Option<&str>,
    cookie_header: Option<&str>,
    query: Option<&str>,
) -> OkvmResult<Option<ClientKey>> {
    if let Some(value) = header.filter(|v| !v.trim().is_empty()) {
        return ClientKey::parse(value).map(Some);
    }
    if let Some(value) = cookie_header.and_then(|c| pair_value(c, ';', CLIENT_COOKIE)) {
        return ClientKey::parse(value).map(Some);
    }
    if let Some(value) = query.and_then(|q| pair_value(q, '&', CLIENT_QUERY_PARAM)) {
        return ClientKey::parse(value).map(Some);
    }
    Ok(None)
}

/// Value of `name` in a `name=value` list split on `separator`.
fn pair_value<'a>(list: &'a str, separator: char, name: &str) -> Option<&'a str> {
    list.split(separator)
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| v.trim().trim_matches('"'))
        .filter(|v| !v.is_empty())
}

/// `Set-Cookie` value that pins a generated key to the browser.
pub fn client_cookie(key: &ClientKey) -> String {
    format!("{CLIENT_COOKIE}={key}; Path=/; HttpOnly; SameSite=Lax")
}
