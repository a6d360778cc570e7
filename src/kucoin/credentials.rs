//! API credentials and request signing

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

use super::types::StreamError;

type HmacSha256 = Hmac<Sha256>;

/// Default KuCoin API key version
pub const DEFAULT_API_VERSION: u8 = 2;

/// Whether the stream is opened anonymously or with an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    Public,
    Private,
}

/// Bootstrap credentials, immutable once built
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    mode: CredentialMode,
    key: String,
    secret: String,
    passphrase: String,
    api_version: u8,
}

/// Signed header set for a private REST request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub api_key: String,
    pub signature: String,
    pub timestamp: String,
    pub passphrase: String,
    pub key_version: String,
}

impl SignedHeaders {
    /// Header name/value pairs in the form the exchange expects
    pub fn pairs(&self) -> [(&'static str, &str); 5] {
        [
            ("KC-API-KEY", &self.api_key),
            ("KC-API-SIGN", &self.signature),
            ("KC-API-TIMESTAMP", &self.timestamp),
            ("KC-API-PASSPHRASE", &self.passphrase),
            ("KC-API-KEY-VERSION", &self.key_version),
        ]
    }
}

impl Credential {
    pub fn public() -> Self {
        Self {
            mode: CredentialMode::Public,
            key: String::new(),
            secret: String::new(),
            passphrase: String::new(),
            api_version: DEFAULT_API_VERSION,
        }
    }

    pub fn private(
        key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            mode: CredentialMode::Private,
            key: key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            api_version: DEFAULT_API_VERSION,
        }
    }

    /// Override the API key version (1 sends the passphrase in plain text)
    pub fn with_api_version(mut self, api_version: u8) -> Self {
        self.api_version = api_version;
        self
    }

    pub fn mode(&self) -> CredentialMode {
        self.mode
    }

    pub fn is_private(&self) -> bool {
        self.mode == CredentialMode::Private
    }

    pub fn api_version(&self) -> u8 {
        self.api_version
    }

    /// Sign a REST request: base64(HMAC-SHA256(secret, timestamp + method + path + body))
    pub fn sign(
        &self,
        timestamp_ms: i64,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<SignedHeaders, StreamError> {
        if !self.is_private() {
            return Err(StreamError::Auth(
                "Public credentials cannot sign requests".to_string(),
            ));
        }
        if self.key.is_empty() || self.secret.is_empty() {
            return Err(StreamError::Auth("API key and secret are required".to_string()));
        }

        let timestamp = timestamp_ms.to_string();
        let prehash = format!("{}{}{}{}", timestamp, method.to_uppercase(), path, body);
        let signature = self.hmac_base64(prehash.as_bytes())?;

        let passphrase = if self.api_version >= 2 {
            self.hmac_base64(self.passphrase.as_bytes())?
        } else {
            self.passphrase.clone()
        };

        Ok(SignedHeaders {
            api_key: self.key.clone(),
            signature,
            timestamp,
            passphrase,
            key_version: self.api_version.to_string(),
        })
    }

    fn hmac_base64(&self, msg: &[u8]) -> Result<String, StreamError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| StreamError::Auth(format!("Invalid API secret: {}", e)))?;
        mac.update(msg);
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("mode", &self.mode)
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("api_version", &self.api_version)
            .finish()
    }
}

/// Source of bootstrap credentials
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> Credential;
}

impl CredentialProvider for Credential {
    fn credential(&self) -> Credential {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_follows_constructor() {
        assert_eq!(Credential::public().mode(), CredentialMode::Public);
        assert!(!Credential::public().is_private());

        let credential = Credential::private("key", "secret", "phrase");
        assert_eq!(credential.mode(), CredentialMode::Private);
        assert!(credential.is_private());
    }

    #[test]
    fn test_public_credential_cannot_sign() {
        let result = Credential::public().sign(1, "POST", "/api/v1/bullet-public", "");
        assert!(matches!(result, Err(StreamError::Auth(_))));
    }

    #[test]
    fn test_sign_matches_manual_hmac() {
        let credential = Credential::private("key", "secret", "phrase");
        let headers = credential
            .sign(1700000000000, "post", "/api/v1/bullet-private", "")
            .unwrap();

        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"1700000000000POST/api/v1/bullet-private");
        let expected = STANDARD.encode(mac.finalize().into_bytes());

        assert_eq!(headers.signature, expected);
        assert_eq!(headers.timestamp, "1700000000000");
        assert_eq!(headers.key_version, "2");
        assert_ne!(headers.passphrase, "phrase");
    }

    #[test]
    fn test_v1_passphrase_is_plain() {
        let credential = Credential::private("key", "secret", "phrase").with_api_version(1);
        let headers = credential.sign(1, "POST", "/x", "").unwrap();
        assert_eq!(headers.passphrase, "phrase");
        assert_eq!(headers.key_version, "1");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", Credential::private("key", "s3cr3t", "p4ss"));
        assert!(!rendered.contains("s3cr3t"));
        assert!(!rendered.contains("p4ss"));
    }
}
