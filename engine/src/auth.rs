//! Per-registry credential resolution.
//!
//! Credentials arrive as `address=<host>&&auth=<base64(user:pass)>` entries.
//! Malformed entries are a configuration error for the whole run; lookup
//! misses fall back to anonymous access and the remote decides whether that
//! is acceptable.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use regmirror_core::error::{MirrorError, Result};

/// Credential presented to a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    Basic { username: String, password: String },
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credential::Anonymous)
    }
}

/// Immutable host → credential table, shared read-only by all workers.
#[derive(Debug, Clone, Default)]
pub struct AuthResolver {
    table: HashMap<String, Credential>,
}

impl AuthResolver {
    /// Build a resolver from raw `--auths` entries.
    ///
    /// Each entry has the form `address=<host>&&auth=<base64(user:pass)>`.
    /// A missing address or an undecodable auth value fails the whole run
    /// before any network activity.
    pub fn from_entries(entries: &[String]) -> Result<Self> {
        let mut table = HashMap::new();
        for entry in entries {
            let (address, credential) = parse_entry(entry)?;
            tracing::debug!(registry = %address, "Registered credential");
            table.insert(address, credential);
        }
        Ok(Self { table })
    }

    /// Add or replace a credential for a host.
    pub fn insert(&mut self, address: impl Into<String>, credential: Credential) {
        self.table.insert(address.into(), credential);
    }

    /// Exact-match lookup; anonymous when no entry exists for the host.
    pub fn resolve(&self, host: &str) -> Credential {
        self.table
            .get(host)
            .cloned()
            .unwrap_or(Credential::Anonymous)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Parse one `address=<host>&&auth=<base64>` entry.
fn parse_entry(entry: &str) -> Result<(String, Credential)> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for pair in entry.split("&&") {
        if let Some((key, value)) = pair.split_once('=') {
            fields.insert(key.trim(), value.trim());
        }
    }

    let address = fields
        .get("address")
        .filter(|a| !a.is_empty())
        .ok_or_else(|| {
            MirrorError::Config(format!(
                "auths entry '{}' is missing an address, format is \
                 \"address=docker.io&&auth=YWRtaW46YWRtaW4=\"",
                entry
            ))
        })?;

    let credential = match fields.get("auth") {
        Some(encoded) if !encoded.is_empty() => decode_auth(encoded).map_err(|message| {
            MirrorError::Config(format!("auths entry for '{}': {}", address, message))
        })?,
        _ => Credential::Anonymous,
    };

    Ok((address.to_string(), credential))
}

/// Decode a base64 `user:pass` secret.
fn decode_auth(encoded: &str) -> std::result::Result<Credential, String> {
    let decoded = BASE64
        .decode(encoded)
        .map_err(|e| format!("undecodable auth value: {}", e))?;
    let decoded =
        String::from_utf8(decoded).map_err(|_| "auth value is not valid UTF-8".to_string())?;

    match decoded.split_once(':') {
        Some((user, pass)) if !user.is_empty() => Ok(Credential::basic(user, pass)),
        _ => Err("auth value must decode to user:pass".to_string()),
    }
}
