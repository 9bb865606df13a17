use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::{
    config::AuthorityConfig, metrics, ports::permission_authority::PermissionAuthority,
};

/// Path of the policy-check endpoint on the authority.
pub const PERMISSION_CHECK_PATH: &str = "/v1/admin/internal/permissions/check";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PermissionCheckRequest<'a> {
    user_id: &'a str,
    permission: &'a str,
}

#[derive(Debug, Deserialize)]
struct PermissionCheckResponse {
    allowed: bool,
}

/// Permission authority reached over HTTP with a hard per-call timeout.
///
/// Every failure resolves to `false`. There are no retries.
pub struct PermissionClient {
    client: reqwest::Client,
    endpoint: String,
}

impl PermissionClient {
    pub fn new(config: &AuthorityConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .wrap_err("Failed to build permission authority HTTP client")?;
        let endpoint = format!(
            "{}{}",
            config.base_url.trim_end_matches('/'),
            PERMISSION_CHECK_PATH
        );
        Ok(Self { client, endpoint })
    }

    async fn try_check(&self, user_id: &str, permission: &str) -> Result<bool, String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&PermissionCheckRequest {
                user_id,
                permission,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    "timed out".to_string()
                } else {
                    e.to_string()
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("authority answered {status}"));
        }
        let body: PermissionCheckResponse = response
            .json()
            .await
            .map_err(|e| format!("unexpected response body: {e}"))?;
        Ok(body.allowed)
    }
}

#[async_trait]
impl PermissionAuthority for PermissionClient {
    async fn check(&self, user_id: &str, permission: &str) -> bool {
        match self.try_check(user_id, permission).await {
            Ok(true) => {
                metrics::increment_permission_check("allowed");
                true
            }
            Ok(false) => {
                metrics::increment_permission_check("denied");
                tracing::debug!(user_id, permission, "Permission denied by authority");
                false
            }
            Err(reason) => {
                metrics::increment_permission_check("error");
                tracing::warn!(
                    user_id,
                    permission,
                    reason = %reason,
                    "Permission check failed, denying"
                );
                false
            }
        }
    }
}
