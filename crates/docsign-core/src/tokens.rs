//! Revision-scoped signing credentials, account tokens and download references.
//!
//! All three are compact HS256 tokens (`header.payload.signature`, URL-safe
//! base64). A signing token embeds the session's `token_version`; bumping the
//! version on revise/restart makes every previously mailed link stale without
//! enumerating or revoking them.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::error::SigningError;
use crate::model::{normalize_email, Session};

type HmacSha256 = Hmac<Sha256>;

const SIGNING_TOKEN: &str = "sign";
const ACCOUNT_TOKEN: &str = "account";
const DOWNLOAD_TOKEN: &str = "download";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Invalid token format")]
    Malformed,
    #[error("Invalid signature")]
    BadSignature,
    #[error("Unexpected token type")]
    WrongType,
    #[error("Token expired")]
    Expired,
    #[error("Token encoding failed: {0}")]
    Encoding(String),
}

impl From<TokenError> for SigningError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => SigningError::TokenExpired("token lifetime has elapsed".into()),
            TokenError::Encoding(reason) => SigningError::validation("token", reason),
            other => SigningError::Forbidden(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    typ: String,
}

impl Default for TokenHeader {
    fn default() -> Self {
        Self {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

/// Claims of a per-recipient signing credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningClaims {
    pub sid: String,
    pub rid: String,
    /// `token_version` of the session at issue time
    pub ver: u32,
    pub kind: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims identifying an account (owner or recipient) by email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountClaims {
    pub email: String,
    pub kind: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims of a time-scoped download reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadClaims {
    pub sid: String,
    /// `revision_count` the reference was issued for
    pub rev: u32,
    pub kind: String,
    pub iat: i64,
    pub exp: i64,
}

/// A recipient's signing link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningLink {
    pub recipient_id: String,
    pub signing_url: String,
}

/// A URL-like download reference with an embedded expiry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRef {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and validates every token the engine hands out
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Vec<u8>,
    base_url: String,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: impl AsRef<[u8]>, base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ============================================================
    // Signing credentials
    // ============================================================

    pub fn issue_signing_token(
        &self,
        session_id: &str,
        recipient_id: &str,
        token_version: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let claims = SigningClaims {
            sid: session_id.to_string(),
            rid: recipient_id.to_string(),
            ver: token_version,
            kind: SIGNING_TOKEN.to_string(),
            iat: Utc::now().timestamp(),
            exp: expires_at.timestamp(),
        };
        self.encode(&claims)
    }

    /// One link per recipient, scoped to the session's current token version
    pub fn signing_links(&self, session: &Session) -> Result<Vec<SigningLink>, TokenError> {
        session
            .recipients
            .iter()
            .map(|recipient| {
                let token = self.issue_signing_token(
                    &session.id,
                    &recipient.id,
                    session.token_version,
                    session.expires_at,
                )?;
                Ok(SigningLink {
                    recipient_id: recipient.id.clone(),
                    signing_url: format!(
                        "{}/sign/{}?recipient={}&token={}",
                        self.base_url, session.id, recipient.id, token
                    ),
                })
            })
            .collect()
    }

    /// Check signature, type, session binding and lifetime.
    ///
    /// The token version is compared against the live session separately
    /// (see [`check_token_version`]) because that needs the current record.
    pub fn verify_signing_token(
        &self,
        token: &str,
        session_id: &str,
    ) -> Result<SigningClaims, SigningError> {
        let claims: SigningClaims = self.decode(token)?;
        if claims.kind != SIGNING_TOKEN {
            return Err(TokenError::WrongType.into());
        }
        if claims.sid != session_id {
            return Err(SigningError::Forbidden(
                "signing link belongs to a different session".into(),
            ));
        }
        if claims.exp < Utc::now().timestamp() {
            return Err(TokenError::Expired.into());
        }
        Ok(claims)
    }

    // ============================================================
    // Account tokens
    // ============================================================

    pub fn issue_account_token(
        &self,
        email: &str,
        lifetime: chrono::Duration,
    ) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = AccountClaims {
            email: normalize_email(email),
            kind: ACCOUNT_TOKEN.to_string(),
            iat: now.timestamp(),
            exp: (now + lifetime).timestamp(),
        };
        self.encode(&claims)
    }

    pub fn verify_account_token(&self, token: &str) -> Result<AccountClaims, TokenError> {
        let claims: AccountClaims = self.decode(token)?;
        if claims.kind != ACCOUNT_TOKEN {
            return Err(TokenError::WrongType);
        }
        if claims.exp < Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    // ============================================================
    // Download references
    // ============================================================

    pub fn issue_download_ref(
        &self,
        session_id: &str,
        revision: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<DownloadRef, TokenError> {
        let claims = DownloadClaims {
            sid: session_id.to_string(),
            rev: revision,
            kind: DOWNLOAD_TOKEN.to_string(),
            iat: Utc::now().timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = self.encode(&claims)?;
        Ok(DownloadRef {
            url: format!(
                "{}/api/sessions/{}/download?token={}",
                self.base_url, session_id, token
            ),
            expires_at,
        })
    }

    pub fn verify_download_token(
        &self,
        token: &str,
        session_id: &str,
    ) -> Result<DownloadClaims, SigningError> {
        let claims: DownloadClaims = self.decode(token)?;
        if claims.kind != DOWNLOAD_TOKEN {
            return Err(TokenError::WrongType.into());
        }
        if claims.sid != session_id {
            return Err(SigningError::Forbidden(
                "download link belongs to a different session".into(),
            ));
        }
        if claims.exp < Utc::now().timestamp() {
            return Err(TokenError::Expired.into());
        }
        Ok(claims)
    }

    // ============================================================
    // Encoding
    // ============================================================

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| TokenError::Encoding(format!("HMAC error: {}", e)))
    }

    fn encode<T: Serialize>(&self, claims: &T) -> Result<String, TokenError> {
        let header_json = serde_json::to_vec(&TokenHeader::default())
            .map_err(|e| TokenError::Encoding(e.to_string()))?;
        let payload_json =
            serde_json::to_vec(claims).map_err(|e| TokenError::Encoding(e.to_string()))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(payload_json)
        );

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    fn decode<T: DeserializeOwned>(&self, token: &str) -> Result<T, TokenError> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(TokenError::Malformed);
        }
        let (header_b64, payload_b64, signature_b64) = (parts[0], parts[1], parts[2]);

        let mut mac = self.mac()?;
        mac.update(format!("{}.{}", header_b64, payload_b64).as_bytes());
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| TokenError::Malformed)?;
        let header: TokenHeader =
            serde_json::from_slice(&header_bytes).map_err(|_| TokenError::Malformed)?;
        if header.alg != "HS256" {
            return Err(TokenError::Malformed);
        }

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::Malformed)
    }
}

/// Reject credentials minted for an earlier revision of the session
pub fn check_token_version(claims: &SigningClaims, session: &Session) -> Result<(), SigningError> {
    if claims.ver != session.token_version {
        return Err(SigningError::TokenExpired(format!(
            "link was issued for version {}, document is now at version {}",
            claims.ver, session.token_version
        )));
    }
    Ok(())
}

/// Extract Bearer token from Authorization header
pub fn extract_bearer_token(auth_header: Option<&str>) -> Option<String> {
    auth_header
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
