//! Principal resolution: who a request is evaluated on behalf of.
//!
//! Credential extraction is transport-specific (HTTP headers). This module
//! only turns an already-extracted session token and network origin into a
//! [`Principal`]. Session verification itself is delegated to a
//! [`SessionResolver`].

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use subtle::ConstantTimeEq;

/// Identity shared by every guest whose network origin is unknown.
pub const UNKNOWN_GUEST_ID: &str = "guest:unknown";

/// Whether a principal was resolved from a session or fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub enum PrincipalClass {
    Authenticated,
    Guest,
}

impl PrincipalClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticated => "authenticated",
            Self::Guest => "guest",
        }
    }
}

impl fmt::Display for PrincipalClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resolved identity a request is evaluated on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Principal {
    pub id: String,
    pub class: PrincipalClass,
}

impl Principal {
    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Self {
            id: user_id.into(),
            class: PrincipalClass::Authenticated,
        }
    }

    /// Guest fingerprinted by network origin. All guests without an origin
    /// share the [`UNKNOWN_GUEST_ID`] bucket.
    pub fn guest(origin: Option<IpAddr>) -> Self {
        let id = origin.map_or_else(|| UNKNOWN_GUEST_ID.to_string(), |ip| format!("guest:{ip}"));
        Self {
            id,
            class: PrincipalClass::Guest,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.class == PrincipalClass::Authenticated
    }
}

/// Maps an opaque session token to a stable user identity.
///
/// Implemented by whatever session system fronts the gateway.
pub trait SessionResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Option<String>;
}

/// Session resolver backed by a static table of API keys.
pub struct ApiKeyResolver {
    entries: Vec<(String, String)>,
}

impl ApiKeyResolver {
    /// Builds a resolver from `(token, user_id)` pairs.
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Parses `token=userId` pairs. Malformed entries are skipped with a warning.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Self {
        let entries = pairs
            .into_iter()
            .filter_map(|pair| match pair.split_once('=') {
                Some((token, user)) if !token.is_empty() && !user.is_empty() => {
                    Some((token.trim().to_string(), user.trim().to_string()))
                }
                _ => {
                    tracing::warn!("ignoring malformed API key entry (expected token=userId)");
                    None
                }
            })
            .collect::<Vec<_>>();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SessionResolver for ApiKeyResolver {
    fn resolve(&self, token: &str) -> Option<String> {
        // Compare against every entry so timing does not reveal the match position.
        let mut found = None;
        for (expected, user) in &self.entries {
            if ct_eq(token.as_bytes(), expected.as_bytes()) {
                found = Some(user.clone());
            }
        }
        found
    }
}

/// Resolves principals, falling back to guest fingerprints.
#[derive(Clone, Default)]
pub struct PrincipalResolver {
    sessions: Option<Arc<dyn SessionResolver>>,
}

impl PrincipalResolver {
    pub fn new(sessions: Option<Arc<dyn SessionResolver>>) -> Self {
        Self { sessions }
    }

    /// Resolves a principal. A missing or unrecognised token yields a guest.
    pub fn resolve(&self, token: Option<&str>, origin: Option<IpAddr>) -> Principal {
        if let Some(token) = token
            && let Some(sessions) = &self.sessions
            && let Some(user_id) = sessions.resolve(token)
        {
            return Principal::authenticated(user_id);
        }
        Principal::guest(origin)
    }
}

/// Constant-time comparison of two byte slices.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}
