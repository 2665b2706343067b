//! Opaque bearer secrets.
//!
//! Deploy keys, user session tokens and runner service tokens share one
//! shape: a kind tag followed by 32 random bytes in unpadded URL-safe base64.
//! The first [`LOOKUP_PREFIX_LEN`] characters of a raw token index its stored
//! record. Only a hash of the full token is ever persisted.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};

pub const DEPLOY_KEY_PREFIX: &str = "rydk_";
pub const USER_TOKEN_PREFIX: &str = "ryut_";
pub const RUNNER_TOKEN_PREFIX: &str = "ryrt_";

/// Length of the indexed lookup prefix, tag included.
pub const LOOKUP_PREFIX_LEN: usize = 16;
const TOKEN_BYTES: usize = 32;

// Deploy keys are checked on every publish call, so the cost stays low.
const ARGON2_MEMORY_KIB: u32 = 19 * 1024;
const ARGON2_ITERATIONS: u32 = 2;
const ARGON2_PARALLELISM: u32 = 1;
const ARGON2_OUTPUT_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    DeployKey,
    UserSession,
    Runner,
}

impl TokenKind {
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::DeployKey => DEPLOY_KEY_PREFIX,
            Self::UserSession => USER_TOKEN_PREFIX,
            Self::Runner => RUNNER_TOKEN_PREFIX,
        }
    }

    /// Whether `raw` carries this kind's tag. Says nothing about validity.
    #[must_use]
    pub fn tags(self, raw: &str) -> bool {
        raw.starts_with(self.prefix())
    }

    /// Mints a fresh raw token of this kind.
    #[must_use]
    pub fn mint(self) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("{}{}", self.prefix(), URL_SAFE_NO_PAD.encode(bytes))
    }

    /// The indexed lookup prefix of `raw`, or `None` when `raw` is not a
    /// token of this kind or is too short to have one.
    #[must_use]
    pub fn lookup_prefix(self, raw: &str) -> Option<&str> {
        if !self.tags(raw) {
            return None;
        }
        raw.get(..LOOKUP_PREFIX_LEN)
    }
}

/// A deploy key as handed to its owner once, with what gets stored for it.
#[derive(Debug, Clone)]
pub struct IssuedDeployKey {
    pub raw: String,
    pub lookup: String,
    pub hash: String,
}

/// Argon2id hashing for deploy keys.
pub struct KeyHasher {
    argon2: Argon2<'static>,
}

impl KeyHasher {
    pub fn new() -> Result<Self> {
        let params = Params::new(
            ARGON2_MEMORY_KIB,
            ARGON2_ITERATIONS,
            ARGON2_PARALLELISM,
            Some(ARGON2_OUTPUT_LEN),
        )
        .map_err(|e| Error::Config(format!("argon2 parameters rejected: {e}")))?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    pub fn issue_deploy_key(&self) -> Result<IssuedDeployKey> {
        let raw = TokenKind::DeployKey.mint();
        let lookup = TokenKind::DeployKey
            .lookup_prefix(&raw)
            .ok_or(Error::InvalidTokenFormat)?
            .to_string();
        let hash = self.hash(&raw)?;
        Ok(IssuedDeployKey { raw, lookup, hash })
    }

    /// PHC-format Argon2id hash of `raw` with a fresh salt.
    pub fn hash(&self, raw: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(raw.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| Error::Internal(format!("deploy key hashing failed: {e}")))
    }

    pub fn verify(&self, raw: &str, stored: &str) -> Result<bool> {
        let parsed = PasswordHash::new(stored)
            .map_err(|e| Error::Internal(format!("stored deploy key hash is malformed: {e}")))?;

        match self.argon2.verify_password(raw.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Internal(format!("deploy key verification failed: {e}"))),
        }
    }
}

/// Derives a purpose-bound key from the server's master secret, so storage
/// tokens and runner access tokens never share key material.
#[must_use]
pub fn derive_secret(master: &[u8], label: &str) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(master).expect("hmac accepts any key length");
    mac.update(label.as_bytes());
    mac.finalize().into_bytes().to_vec()
}
