//! Artifact reference encoding.
//!
//! Persisted references use `<provider>::<key>`. Records written before a
//! second provider existed carry a bare key with no prefix; those stay
//! readable forever by inferring the provider from the enabled backends.
//! This fallback is permanent: historical rows are never rewritten.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const SEPARATOR: &str = "::";

/// Storage provider kinds. Declaration order is the deterministic inference
/// order for bare legacy keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// S3-compatible object storage reached through presigned URLs.
    ObjectStore,
    /// Blob storage served through signed proxy tokens.
    Blob,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Self::ObjectStore, Self::Blob];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ObjectStore => "object_store",
            Self::Blob => "blob",
        }
    }

    pub fn parse(s: &str) -> Option<Provider> {
        match s {
            "object_store" => Some(Self::ObjectStore),
            "blob" => Some(Self::Blob),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub provider: Provider,
    pub key: String,
}

impl ArtifactRef {
    pub fn new(provider: Provider, key: impl Into<String>) -> Self {
        Self {
            provider,
            key: key.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("artifact key is empty")]
    Empty,
    #[error("no storage provider is enabled to resolve legacy artifact key")]
    NoProviderEnabled,
}

/// The set of providers whose configuration is complete in this process.
/// Computed once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnabledProviders {
    providers: Vec<Provider>,
    preferred: Option<Provider>,
}

impl EnabledProviders {
    /// Builds the set in declaration order. `preferred` is honored only if
    /// that provider is enabled; otherwise the first enabled one wins.
    pub fn new(enabled: impl IntoIterator<Item = Provider>, preferred: Option<Provider>) -> Self {
        let enabled: Vec<Provider> = enabled.into_iter().collect();
        let providers: Vec<Provider> = Provider::ALL
            .into_iter()
            .filter(|p| enabled.contains(p))
            .collect();
        let preferred = preferred
            .filter(|p| providers.contains(p))
            .or_else(|| providers.first().copied());
        Self {
            providers,
            preferred,
        }
    }

    #[must_use]
    pub fn contains(&self, provider: Provider) -> bool {
        self.providers.contains(&provider)
    }

    #[must_use]
    pub fn first(&self) -> Option<Provider> {
        self.providers.first().copied()
    }

    /// Provider new uploads go to.
    #[must_use]
    pub fn preferred(&self) -> Option<Provider> {
        self.preferred
    }

    pub fn iter(&self) -> impl Iterator<Item = Provider> + '_ {
        self.providers.iter().copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[must_use]
pub fn encode(reference: &ArtifactRef) -> String {
    format!("{}{SEPARATOR}{}", reference.provider.as_str(), reference.key)
}

/// Decodes a stored artifact reference.
///
/// Accepted shapes:
/// - `<provider>::<key>`
/// - a bare key such as `tenant/builds/b1.zip`
/// - a bare key with a leading slash, written by early path-style uploads
///
/// Both bare shapes resolve to the first enabled provider in declaration
/// order so the answer is stable across restarts.
pub fn decode(stored: &str, enabled: &EnabledProviders) -> Result<ArtifactRef, CodecError> {
    if stored.is_empty() {
        return Err(CodecError::Empty);
    }

    for provider in Provider::ALL {
        if let Some(key) = stored
            .strip_prefix(provider.as_str())
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
        {
            if key.is_empty() {
                return Err(CodecError::Empty);
            }
            return Ok(ArtifactRef::new(provider, key));
        }
    }

    let key = stored.trim_start_matches('/');
    if key.is_empty() {
        return Err(CodecError::Empty);
    }

    let provider = enabled.first().ok_or(CodecError::NoProviderEnabled)?;
    Ok(ArtifactRef::new(provider, key))
}
