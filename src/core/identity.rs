//! Bearer credential verification.
//!
//! [`IdentityVerifier`] turns a signed token into a typed [`Identity`]. It is
//! pure and synchronous: no I/O, no shared mutable state, so it can be called
//! inline on the request path. Expiry is reported separately from every other
//! rejection so callers can tell a client to refresh rather than re-authenticate.
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AuthConfig;

/// Account status that denies access to authenticated routes.
pub const BLOCKED_STATUS: &str = "blocked";

/// Caller identity derived from a verified credential. Lives for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: String,
    pub org_id: Option<String>,
    pub session_id: Option<String>,
    pub status: Option<String>,
    pub token_issuer: Option<String>,
    pub token_audience: Option<String>,
    /// Expiry as epoch seconds.
    pub expiry: i64,
}

impl Identity {
    pub fn is_blocked(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|status| status.eq_ignore_ascii_case(BLOCKED_STATUS))
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    #[error("token expired")]
    Expired,
    #[error("token malformed")]
    Malformed,
    #[error("token signature, issuer or audience rejected")]
    SignatureInvalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Many(Vec<String>),
}

impl Audience {
    fn first(&self) -> Option<String> {
        match self {
            Audience::Single(aud) => Some(aud.clone()),
            Audience::Many(auds) => auds.first().cloned(),
        }
    }
}

/// Claims the gateway consumes. Issuers in the fleet differ on spelling, so
/// each alternative lands in its own field and [`Claims::subject`] and friends
/// pick the first non-empty one. A token carrying both spellings is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Claims {
    pub sub: Option<String>,
    #[serde(rename = "userId")]
    pub user_id_camel: Option<String>,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: Option<String>,
    pub org_id: Option<String>,
    #[serde(rename = "orgId")]
    pub org_id_camel: Option<String>,
    pub session_id: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id_camel: Option<String>,
    pub status: Option<String>,
    pub iss: Option<String>,
    pub aud: Option<Audience>,
    pub exp: i64,
}

impl Claims {
    /// `sub`, then `userId`, then `user_id`.
    pub fn subject(&self) -> Option<&str> {
        first_present([&self.sub, &self.user_id_camel, &self.user_id])
    }

    pub fn organization(&self) -> Option<&str> {
        first_present([&self.org_id_camel, &self.org_id])
    }

    pub fn session(&self) -> Option<&str> {
        first_present([&self.session_id_camel, &self.session_id])
    }
}

fn first_present<const N: usize>(candidates: [&Option<String>; N]) -> Option<&str> {
    candidates
        .into_iter()
        .filter_map(Option::as_deref)
        .find(|value| !value.is_empty())
}

impl TryFrom<Claims> for Identity {
    type Error = VerifyError;

    fn try_from(claims: Claims) -> Result<Self, Self::Error> {
        let id = claims.subject().ok_or(VerifyError::Malformed)?.to_string();
        Ok(Identity {
            id,
            org_id: claims.organization().map(str::to_string),
            session_id: claims.session().map(str::to_string),
            token_audience: claims.aud.as_ref().and_then(Audience::first),
            email: claims.email,
            phone: claims.phone,
            role: claims.role.unwrap_or_else(|| "user".to_string()),
            status: claims.status,
            token_issuer: claims.iss,
            expiry: claims.exp,
        })
    }
}

/// HS256 verifier bound to the configured issuer and audience.
pub struct IdentityVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl IdentityVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.leeway_secs;
        validation.validate_exp = true;

        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience.as_str()]),
            None => validation.validate_aud = false,
        }

        Self {
            key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, credential: &str) -> Result<Identity, VerifyError> {
        let data = decode::<Claims>(credential, &self.key, &self.validation)
            .map_err(|err| classify(err.kind()))?;
        Identity::try_from(data.claims)
    }
}

fn classify(kind: &ErrorKind) -> VerifyError {
    match kind {
        ErrorKind::ExpiredSignature => VerifyError::Expired,
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidIssuer
        | ErrorKind::InvalidAudience
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::ImmatureSignature => VerifyError::SignatureInvalid,
        _ => VerifyError::Malformed,
    }
}

/// Extract the token from an `Authorization` value. Accepts `Bearer <token>`
/// (scheme matched case-insensitively) or a bare token. A bearer scheme with
/// nothing after it, or any other scheme, yields `None`.
pub fn extract_credential(header_value: &str) -> Option<&str> {
    let value = header_value.trim_start();
    let token = match value.get(..BEARER.len()) {
        Some(scheme)
            if scheme.eq_ignore_ascii_case(BEARER)
                && value[BEARER.len()..]
                    .chars()
                    .next()
                    .is_none_or(char::is_whitespace) =>
        {
            value[BEARER.len()..].trim()
        }
        _ => value.trim_end(),
    };
    (!token.is_empty() && !token.contains(char::is_whitespace)).then_some(token)
}

const BEARER: &str = "bearer";
