//! Root key authentication and permission checks.
//!
//! Keys are held as SHA-256 digests; the plaintext from configuration is
//! dropped once the key ring is built.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A root key as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootKey {
    pub key: String,
    pub workspace_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Authentication and authorization failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing or malformed Authorization header")]
    MissingCredentials,
    #[error("unknown root key")]
    UnknownKey,
    #[error("missing permission: {0}")]
    Forbidden(String),
}

/// The identity behind a verified key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub workspace_id: String,
    pub permissions: Vec<String>,
}

impl Principal {
    /// Whether any held permission grants `required`.
    pub fn has_permission(&self, required: &str) -> bool {
        self.permissions
            .iter()
            .any(|held| permission_matches(held, required))
    }

    /// Require `ratelimit.<namespace>.limit`.
    pub fn authorize_limit(&self, namespace: &str) -> Result<(), AuthError> {
        let required = limit_permission(namespace);
        if self.has_permission(&required) {
            Ok(())
        } else {
            Err(AuthError::Forbidden(required))
        }
    }
}

/// Permission needed to call the limit operation on a namespace.
pub fn limit_permission(namespace: &str) -> String {
    format!("ratelimit.{namespace}.limit")
}

/// `*` matches a single segment; a lone `*` matches everything.
fn permission_matches(held: &str, required: &str) -> bool {
    if held == "*" {
        return true;
    }

    let mut held_parts = held.split('.');
    let mut required_parts = required.split('.');
    loop {
        match (held_parts.next(), required_parts.next()) {
            (None, None) => return true,
            (Some(h), Some(r)) if h == "*" || h == r => continue,
            _ => return false,
        }
    }
}

/// Compare two secrets in time independent of where they differ.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (a_byte, b_byte) in a.bytes().zip(b.bytes()) {
        result |= a_byte ^ b_byte;
    }
    result == 0
}

fn digest(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

/// Verifies bearer tokens against the configured root keys.
#[derive(Debug, Default, Clone)]
pub struct KeyRing {
    keys: HashMap<String, Principal>,
}

impl KeyRing {
    pub fn new(root_keys: &[RootKey]) -> Self {
        let keys = root_keys
            .iter()
            .map(|root| {
                (
                    digest(&root.key),
                    Principal {
                        workspace_id: root.workspace_id.clone(),
                        permissions: root.permissions.clone(),
                    },
                )
            })
            .collect();
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Resolve the principal for a raw `Authorization` header value.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<&Principal, AuthError> {
        let token = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingCredentials)?;

        self.keys.get(&digest(token)).ok_or(AuthError::UnknownKey)
    }
}
