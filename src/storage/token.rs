use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use super::Provider;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageAction {
    Upload,
    Download,
}

impl StorageAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

/// Self-contained grant to move one object through the proxy routes.
/// Never stored: validity is the signature plus `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageToken {
    pub action: StorageAction,
    pub provider: Provider,
    pub key: String,
    #[serde(rename = "exp")]
    pub expires_at: i64,
    /// Set on delegated client uploads; the upload must carry exactly this type.
    #[serde(rename = "ct", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageTokenError {
    #[error("malformed storage token")]
    Malformed,
    #[error("storage token signature mismatch")]
    BadSignature,
    #[error("storage token expired")]
    Expired,
    #[error("storage token not valid for {0}")]
    WrongAction(&'static str),
}

/// HMAC-SHA256 signer for [`StorageToken`]s, encoded as
/// `base64url(payload).base64url(signature)`.
#[derive(Clone)]
pub struct StorageTokenSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for StorageTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageTokenSigner").finish_non_exhaustive()
    }
}

impl StorageTokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length")
    }

    #[must_use]
    pub fn sign(&self, token: &StorageToken) -> String {
        let payload = serde_json::to_vec(token).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(payload);

        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        format!("{payload}.{signature}")
    }

    /// Checks signature first, then expiry, then action, so an expired but
    /// genuine token always reports `Expired`.
    pub fn verify(
        &self,
        raw: &str,
        action: StorageAction,
        now: DateTime<Utc>,
    ) -> Result<StorageToken, StorageTokenError> {
        let (payload, signature) = raw.split_once('.').ok_or(StorageTokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| StorageTokenError::Malformed)?;

        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| StorageTokenError::BadSignature)?;

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| StorageTokenError::Malformed)?;
        let token: StorageToken =
            serde_json::from_slice(&bytes).map_err(|_| StorageTokenError::Malformed)?;

        if now.timestamp() > token.expires_at {
            return Err(StorageTokenError::Expired);
        }

        if token.action != action {
            return Err(StorageTokenError::WrongAction(action.as_str()));
        }

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> StorageTokenSigner {
        StorageTokenSigner::new(b"0123456789abcdef0123456789abcdef".to_vec())
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn download_token(expires_at: i64) -> StorageToken {
        StorageToken {
            action: StorageAction::Download,
            provider: Provider::Blob,
            key: "t1/builds/b1.zip".to_string(),
            expires_at,
            content_type: None,
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let token = download_token(2_000);
        let raw = signer().sign(&token);

        assert_eq!(raw.split('.').count(), 2);
        let verified = signer()
            .verify(&raw, StorageAction::Download, at(1_000))
            .unwrap();
        assert_eq!(verified, token);
    }

    #[test]
    fn test_expired_token_reports_expiry_not_signature() {
        let raw = signer().sign(&download_token(2_000));

        assert!(signer().verify(&raw, StorageAction::Download, at(2_000)).is_ok());
        assert_eq!(
            signer().verify(&raw, StorageAction::Download, at(2_001)),
            Err(StorageTokenError::Expired)
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let raw = signer().sign(&download_token(2_000));
        let (_, signature) = raw.split_once('.').unwrap();

        let mut forged = download_token(9_999);
        forged.key = "other-tenant/builds/x.zip".to_string();
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());

        assert_eq!(
            signer().verify(
                &format!("{forged_payload}.{signature}"),
                StorageAction::Download,
                at(1_000)
            ),
            Err(StorageTokenError::BadSignature)
        );
    }

    #[test]
    fn test_other_secret_rejected() {
        let raw = StorageTokenSigner::new(b"another secret".to_vec()).sign(&download_token(2_000));
        assert_eq!(
            signer().verify(&raw, StorageAction::Download, at(1_000)),
            Err(StorageTokenError::BadSignature)
        );
    }

    #[test]
    fn test_action_mismatch() {
        let raw = signer().sign(&download_token(2_000));
        assert_eq!(
            signer().verify(&raw, StorageAction::Upload, at(1_000)),
            Err(StorageTokenError::WrongAction("upload"))
        );
    }

    #[test]
    fn test_malformed() {
        assert_eq!(
            signer().verify("nodot", StorageAction::Download, at(0)),
            Err(StorageTokenError::Malformed)
        );
        assert_eq!(
            signer().verify("a.!!!", StorageAction::Download, at(0)),
            Err(StorageTokenError::Malformed)
        );
    }
}
