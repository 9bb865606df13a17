use async_trait::async_trait;

/// PermissionAuthority defines the port (interface) to the remote policy
/// authority consulted by permission-restricted routes.
///
/// Implementations must resolve every failure (transport error, timeout,
/// unexpected status or body) to `false`: the boundary is fail-closed and a
/// denial by timeout is indistinguishable from a denial by policy.
#[async_trait]
pub trait PermissionAuthority: Send + Sync + 'static {
    /// Ask whether `user_id` holds `permission`
    async fn check(&self, user_id: &str, permission: &str) -> bool;
}
