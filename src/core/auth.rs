//! Per-route access guard.
//!
//! [`AuthGuard`] composes the [`IdentityVerifier`] with the
//! [`PermissionAuthority`] port and evaluates one [`AuthRequirement`] against
//! the inbound headers. On success it yields the caller identity (if any) for
//! downstream header injection.
use std::sync::Arc;

use futures_util::future::join_all;
use http::{HeaderMap, HeaderName, header::AUTHORIZATION};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::{
    config::{AuthRequirement, GatewayConfig},
    core::identity::{Identity, IdentityVerifier, VerifyError, extract_credential},
    ports::permission_authority::PermissionAuthority,
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credential presented")]
    NoCredential,
    #[error("credential expired")]
    Expired,
    #[error("credential invalid")]
    Invalid,
    #[error("account blocked")]
    AccountBlocked,
    #[error("role not permitted")]
    InsufficientRole,
    #[error("permission denied")]
    InsufficientPermission,
    #[error("internal credential missing or invalid")]
    InternalCredentialRequired,
}

impl From<VerifyError> for AuthError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Expired => AuthError::Expired,
            VerifyError::Malformed | VerifyError::SignatureInvalid => AuthError::Invalid,
        }
    }
}

pub struct AuthGuard {
    verifier: IdentityVerifier,
    authority: Arc<dyn PermissionAuthority>,
    internal_header: Option<HeaderName>,
    internal_token: String,
}

impl AuthGuard {
    pub fn new(config: &GatewayConfig, authority: Arc<dyn PermissionAuthority>) -> Self {
        Self {
            verifier: IdentityVerifier::new(&config.auth),
            authority,
            internal_header: HeaderName::try_from(config.internal.token_header.as_str()).ok(),
            internal_token: config.internal.token.clone(),
        }
    }

    /// Evaluate `requirement` for a request carrying `headers`.
    pub async fn guard(
        &self,
        requirement: &AuthRequirement,
        headers: &HeaderMap,
    ) -> Result<Option<Identity>, AuthError> {
        match requirement {
            AuthRequirement::Public => Ok(None),
            AuthRequirement::Optional => Ok(self.authenticate(headers).ok()),
            AuthRequirement::Required => self.authenticate(headers).map(Some),
            AuthRequirement::Role { roles } => {
                let identity = self.authenticate(headers)?;
                if roles.iter().any(|role| role == &identity.role) {
                    Ok(Some(identity))
                } else {
                    tracing::debug!(user_id = %identity.id, role = %identity.role, "Role not permitted");
                    Err(AuthError::InsufficientRole)
                }
            }
            AuthRequirement::Permission { permissions } => {
                let identity = self.authenticate(headers)?;
                self.check_permissions(&identity, permissions).await?;
                Ok(Some(identity))
            }
            AuthRequirement::Internal => {
                self.check_internal(headers)?;
                Ok(None)
            }
        }
    }

    /// Verify the bearer credential and reject blocked accounts.
    fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let credential = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(extract_credential)
            .ok_or(AuthError::NoCredential)?;

        let identity = self.verifier.verify(credential)?;
        if identity.is_blocked() {
            return Err(AuthError::AccountBlocked);
        }
        Ok(identity)
    }

    /// Every permission must be granted; checks run concurrently and any
    /// denial (including an authority failure) denies the request.
    async fn check_permissions(
        &self,
        identity: &Identity,
        permissions: &[String],
    ) -> Result<(), AuthError> {
        if permissions.is_empty() {
            return Err(AuthError::InsufficientPermission);
        }
        let checks = permissions
            .iter()
            .map(|permission| self.authority.check(&identity.id, permission));
        let results = join_all(checks).await;

        if results.into_iter().all(|allowed| allowed) {
            Ok(())
        } else {
            Err(AuthError::InsufficientPermission)
        }
    }

    fn check_internal(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        if self.internal_token.is_empty() {
            return Err(AuthError::InternalCredentialRequired);
        }
        let presented = self
            .internal_header
            .as_ref()
            .and_then(|name| headers.get(name))
            .ok_or(AuthError::InternalCredentialRequired)?;

        if bool::from(presented.as_bytes().ct_eq(self.internal_token.as_bytes())) {
            Ok(())
        } else {
            Err(AuthError::InternalCredentialRequired)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use http::HeaderValue;

    use super::*;
    use crate::core::identity::test_support::{self, SECRET, sign, token};

    /// Grants exactly the listed permissions and counts calls.
    #[derive(Default)]
    struct StaticAuthority {
        granted: HashMap<String, Vec<String>>,
        calls: AtomicUsize,
    }

    impl StaticAuthority {
        fn granting(user: &str, permissions: &[&str]) -> Self {
            let mut granted = HashMap::new();
            granted.insert(
                user.to_string(),
                permissions.iter().map(|p| p.to_string()).collect(),
            );
            Self {
                granted,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PermissionAuthority for StaticAuthority {
        async fn check(&self, user_id: &str, permission: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.granted
                .get(user_id)
                .is_some_and(|perms| perms.iter().any(|p| p == permission))
        }
    }

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::builder()
            .internal_token("svc-secret")
            .build();
        config.auth = test_support::auth_config();
        config
    }

    fn guard_with(authority: Arc<StaticAuthority>) -> AuthGuard {
        AuthGuard::new(&config(), authority)
    }

    fn guard() -> AuthGuard {
        guard_with(Arc::new(StaticAuthority::default()))
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    fn expired_token() -> String {
        let mut claims = test_support::claims("user-1", "user");
        claims["exp"] = (test_support::now() - 600).into();
        sign(&claims, SECRET)
    }

    #[tokio::test]
    async fn test_public_never_checks() {
        let result = guard()
            .guard(&AuthRequirement::Public, &bearer("garbage"))
            .await;
        assert_eq!(result, Ok(None));
    }

    #[tokio::test]
    async fn test_optional_never_fails() {
        let guard = guard();
        assert_eq!(
            guard
                .guard(&AuthRequirement::Optional, &HeaderMap::new())
                .await,
            Ok(None)
        );
        assert_eq!(
            guard
                .guard(&AuthRequirement::Optional, &bearer(&expired_token()))
                .await,
            Ok(None)
        );
        let identity = guard
            .guard(&AuthRequirement::Optional, &bearer(&token("user-9", "user")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identity.id, "user-9");
    }

    #[tokio::test]
    async fn test_required_failures() {
        let guard = guard();
        assert_eq!(
            guard
                .guard(&AuthRequirement::Required, &HeaderMap::new())
                .await,
            Err(AuthError::NoCredential)
        );
        assert_eq!(
            guard
                .guard(&AuthRequirement::Required, &bearer(&expired_token()))
                .await,
            Err(AuthError::Expired)
        );
        assert_eq!(
            guard
                .guard(&AuthRequirement::Required, &bearer("a.b.c"))
                .await,
            Err(AuthError::Invalid)
        );

        let mut claims = test_support::claims("user-1", "user");
        claims["status"] = "blocked".into();
        assert_eq!(
            guard
                .guard(&AuthRequirement::Required, &bearer(&sign(&claims, SECRET)))
                .await,
            Err(AuthError::AccountBlocked)
        );
    }

    #[tokio::test]
    async fn test_empty_bearer_is_no_credential() {
        let guard = guard();
        for value in ["Bearer ", "Bearer", "bearer    "] {
            let mut headers = HeaderMap::new();
            headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
            assert_eq!(
                guard.guard(&AuthRequirement::Required, &headers).await,
                Err(AuthError::NoCredential)
            );
            assert_eq!(
                guard.guard(&AuthRequirement::Optional, &headers).await,
                Ok(None)
            );
        }
    }

    #[tokio::test]
    async fn test_bare_token_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&token("user-1", "user")).unwrap(),
        );
        let identity = guard()
            .guard(&AuthRequirement::Required, &headers)
            .await
            .unwrap();
        assert!(identity.is_some());
    }

    #[tokio::test]
    async fn test_role_restriction() {
        let requirement = AuthRequirement::Role {
            roles: vec!["agent".into(), "admin".into()],
        };
        let guard = guard();
        assert!(
            guard
                .guard(&requirement, &bearer(&token("user-1", "agent")))
                .await
                .is_ok()
        );
        assert_eq!(
            guard
                .guard(&requirement, &bearer(&token("user-1", "user")))
                .await,
            Err(AuthError::InsufficientRole)
        );
        assert_eq!(
            guard.guard(&requirement, &HeaderMap::new()).await,
            Err(AuthError::NoCredential)
        );
    }

    #[tokio::test]
    async fn test_permission_all_must_be_granted() {
        let authority = Arc::new(StaticAuthority::granting(
            "user-1",
            &["leads:read", "leads:write"],
        ));
        let guard = guard_with(authority.clone());

        let granted = AuthRequirement::Permission {
            permissions: vec!["leads:read".into(), "leads:write".into()],
        };
        let identity = guard
            .guard(&granted, &bearer(&token("user-1", "agent")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identity.id, "user-1");
        assert_eq!(authority.calls.load(Ordering::SeqCst), 2);

        let partly = AuthRequirement::Permission {
            permissions: vec!["leads:read".into(), "leads:delete".into()],
        };
        assert_eq!(
            guard
                .guard(&partly, &bearer(&token("user-1", "agent")))
                .await,
            Err(AuthError::InsufficientPermission)
        );
    }

    #[tokio::test]
    async fn test_permission_requires_authentication_first() {
        let authority = Arc::new(StaticAuthority::default());
        let guard = guard_with(authority.clone());
        let requirement = AuthRequirement::Permission {
            permissions: vec!["x".into()],
        };
        assert_eq!(
            guard.guard(&requirement, &bearer(&expired_token())).await,
            Err(AuthError::Expired)
        );
        assert_eq!(authority.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_internal_credential() {
        let guard = guard();
        let mut headers = HeaderMap::new();
        assert_eq!(
            guard.guard(&AuthRequirement::Internal, &headers).await,
            Err(AuthError::InternalCredentialRequired)
        );

        headers.insert("x-internal-token", HeaderValue::from_static("wrong"));
        assert_eq!(
            guard.guard(&AuthRequirement::Internal, &headers).await,
            Err(AuthError::InternalCredentialRequired)
        );

        headers.insert("x-internal-token", HeaderValue::from_static("svc-secret"));
        assert_eq!(
            guard.guard(&AuthRequirement::Internal, &headers).await,
            Ok(None)
        );
    }

    #[tokio::test]
    async fn test_internal_rejected_when_token_unset() {
        let mut config = config();
        config.internal.token.clear();
        let guard = AuthGuard::new(&config, Arc::new(StaticAuthority::default()));
        let mut headers = HeaderMap::new();
        headers.insert("x-internal-token", HeaderValue::from_static(""));
        assert_eq!(
            guard.guard(&AuthRequirement::Internal, &headers).await,
            Err(AuthError::InternalCredentialRequired)
        );
    }
}
