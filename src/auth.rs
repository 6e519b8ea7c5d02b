//! Connection authorization
//!
//! Decides whether an HTTP request (WebSocket upgrade or server-side
//! publish) may use the relay.
//!
//! # Licence keys
//!
//! A licence key is bound to a registrable domain:
//! `hex(HMAC-SHA256(secret, domain))`. The domain is derived from the
//! request's `Origin` (or `Sec-WebSocket-Origin`) header, reduced to its last
//! two labels, so `www.example.com` and `api.example.com` share the key of
//! `example.com`.

use std::path::Path;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;
use url::{Host, Url};

type HmacSha256 = Hmac<Sha256>;

pub const LOCALHOST: &str = "localhost";

/// Request facts an authorizer looks at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// `Host` header
    pub host: String,
    /// `Origin` header, falling back to `Sec-WebSocket-Origin`
    pub origin: Option<String>,
}

impl RequestMeta {
    pub fn new(host: impl Into<String>, origin: Option<String>) -> Self {
        Self {
            host: host.into(),
            origin: origin.filter(|o| !o.is_empty()),
        }
    }
}

pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, request: &RequestMeta) -> bool;
}

/// Accepts every request
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_authorized(&self, _request: &RequestMeta) -> bool {
        true
    }
}

/// Licence-key authorizer
pub struct LicenseAuthorizer {
    secret: Vec<u8>,
    keys: Vec<String>,
}

impl LicenseAuthorizer {
    pub fn new(secret: &str, keys: Vec<String>) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            keys,
        }
    }

    /// Read licence keys from a file
    pub fn load(path: &Path, secret: &str) -> Result<Self, AuthError> {
        let text = std::fs::read_to_string(path).map_err(|source| AuthError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let keys = parse_keys(&text);
        debug!(path = %path.display(), keys = keys.len(), "licence keys loaded");
        Ok(Self::new(secret, keys))
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Licence key for a domain
    pub fn sign(&self, domain: &str) -> Result<String, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::InvalidKey)?;
        mac.update(domain.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn is_licensed(&self, domain: &str) -> bool {
        let Ok(expected) = self.sign(domain) else {
            return false;
        };
        let matched = self
            .keys
            .iter()
            .any(|key| bool::from(expected.as_bytes().ct_eq(key.as_bytes())));
        if !matched {
            debug!(domain, "no licence key for domain");
        }
        matched
    }
}

impl std::fmt::Debug for LicenseAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseAuthorizer")
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}

impl Authorizer for LicenseAuthorizer {
    fn is_authorized(&self, request: &RequestMeta) -> bool {
        let origin = request
            .origin
            .as_deref()
            .map(registrable_origin)
            .unwrap_or_default();
        let host = strip_port(&request.host);

        // Local clients of a local server are always let in
        if host == LOCALHOST && (origin.is_empty() || origin == LOCALHOST) {
            return true;
        }
        let domain = if origin.is_empty() { host } else { origin.as_str() };

        if self.keys.is_empty() {
            debug!(domain, "no licence keys loaded, request refused");
            return false;
        }
        self.is_licensed(domain)
    }
}

/// Licence keys from file text. Blank lines and lines containing `#`, `/`
/// or `;` are skipped.
pub fn parse_keys(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.contains(['#', '/', ';']))
        .map(str::to_string)
        .collect()
}

/// Reduce an origin URL to the domain its licence is issued for.
///
/// Unparseable origins are returned unchanged.
pub fn registrable_origin(origin: &str) -> String {
    let Ok(url) = Url::parse(origin) else {
        return origin.to_string();
    };
    match url.host() {
        Some(Host::Domain(domain)) => {
            let labels: Vec<&str> = domain.split('.').collect();
            if labels.len() > 2 {
                labels[labels.len() - 2..].join(".")
            } else {
                domain.to_string()
            }
        }
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => origin.to_string(),
    }
}

fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

/// Authorization errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to read licence file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid licence secret")]
    InvalidKey,
}
