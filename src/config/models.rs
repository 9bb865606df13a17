//! Configuration data structures for the gateway.
//!
//! These types map directly to YAML / TOML / JSON configuration files. They are
//! serde‑friendly and carry defaults so that minimal configs remain concise; only
//! `services`, `routes` and `auth.jwt_secret` have no useful default.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub internal: InternalConfig,
    #[serde(default)]
    pub authority: AuthorityConfig,
    /// Backend services keyed by their symbolic name.
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth: AuthConfig::default(),
            internal: InternalConfig::default(),
            authority: AuthorityConfig::default(),
            services: HashMap::new(),
            routes: Vec::new(),
            admin: AdminConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            upstream: UpstreamConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

/// Builder for GatewayConfig, mostly used by tests and embedders.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn jwt(
        mut self,
        secret: impl Into<String>,
        issuer: Option<&str>,
        audience: Option<&str>,
    ) -> Self {
        self.config.auth.jwt_secret = secret.into();
        self.config.auth.issuer = issuer.map(str::to_string);
        self.config.auth.audience = audience.map(str::to_string);
        self
    }

    pub fn internal_token(mut self, token: impl Into<String>) -> Self {
        self.config.internal.token = token.into();
        self
    }

    pub fn authority(mut self, base_url: impl Into<String>, timeout_ms: u64) -> Self {
        self.config.authority = AuthorityConfig {
            base_url: base_url.into(),
            timeout_ms,
        };
        self
    }

    /// Register a backend service by symbolic name
    pub fn service(mut self, name: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.config.services.insert(
            name.into(),
            ServiceConfig {
                base_url: base_url.into(),
            },
        );
        self
    }

    pub fn route(mut self, rule: RouteRule) -> Self {
        self.config.routes.push(rule);
        self
    }

    /// Map an administrative domain segment to a service and its own admin sub-path
    pub fn admin_domain(
        mut self,
        domain: impl Into<String>,
        service: impl Into<String>,
        rewrite_to: impl Into<String>,
    ) -> Self {
        self.config.admin.domains.insert(
            domain.into(),
            AdminDomainConfig {
                service: service.into(),
                rewrite_to: rewrite_to.into(),
                auth: default_admin_auth(),
            },
        );
        self
    }

    pub fn rate_limit(mut self, class: RateLimitClass, window_ms: u64, max: u64) -> Self {
        let policy = RateLimitPolicyConfig { window_ms, max };
        match class {
            RateLimitClass::Default => self.config.rate_limits.default = policy,
            RateLimitClass::Auth => self.config.rate_limits.auth = policy,
            RateLimitClass::Webhook => self.config.rate_limits.webhook = policy,
        }
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

/// Bearer credential verification settings (HS256 shared secret).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// Expected `iss` claim; not checked when absent.
    pub issuer: Option<String>,
    /// Expected `aud` claim; not checked when absent.
    pub audience: Option<String>,
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            issuer: None,
            audience: None,
            leeway_secs: 0,
        }
    }
}

/// Internal namespace, reachable only with the shared service credential.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct InternalConfig {
    pub prefix: String,
    pub token_header: String,
    pub token: String,
}

impl Default for InternalConfig {
    fn default() -> Self {
        Self {
            prefix: "/internal/v1".to_string(),
            token_header: "x-internal-token".to_string(),
            token: String::new(),
        }
    }
}

/// Remote permission authority used by permission-restricted routes.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthorityConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4001".to_string(),
            timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    pub base_url: String,
}

/// HTTP methods a route rule may be bound to.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    #[default]
    Any,
}

impl RouteMethod {
    pub fn matches(&self, method: &http::Method) -> bool {
        match self {
            RouteMethod::Any => true,
            RouteMethod::Get => method == http::Method::GET || method == http::Method::HEAD,
            RouteMethod::Post => method == http::Method::POST,
            RouteMethod::Put => method == http::Method::PUT,
            RouteMethod::Patch => method == http::Method::PATCH,
            RouteMethod::Delete => method == http::Method::DELETE,
        }
    }
}

impl std::fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RouteMethod::Get => "GET",
            RouteMethod::Post => "POST",
            RouteMethod::Put => "PUT",
            RouteMethod::Patch => "PATCH",
            RouteMethod::Delete => "DELETE",
            RouteMethod::Any => "ANY",
        };
        f.write_str(name)
    }
}

/// Prefix → prefix path rewrite applied before forwarding.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PathRewrite {
    pub from: String,
    pub to: String,
}

/// Access policy attached to a route.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthRequirement {
    #[default]
    Public,
    Optional,
    Required,
    Role {
        roles: Vec<String>,
    },
    Permission {
        permissions: Vec<String>,
    },
    /// Shared service credential; assigned to the internal namespace, never declared.
    #[serde(skip)]
    Internal,
}

impl AuthRequirement {
    pub fn label(&self) -> &'static str {
        match self {
            AuthRequirement::Public => "public",
            AuthRequirement::Optional => "optional",
            AuthRequirement::Required => "required",
            AuthRequirement::Role { .. } => "role",
            AuthRequirement::Permission { .. } => "permission",
            AuthRequirement::Internal => "internal",
        }
    }
}

/// Which limiter, beyond the default one, guards a route.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitClass {
    #[default]
    Default,
    /// Login-type endpoints, keyed by the authentication identifier.
    Auth,
    /// Inbound webhook callbacks.
    Webhook,
}

impl RateLimitClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitClass::Default => "default",
            RateLimitClass::Auth => "auth",
            RateLimitClass::Webhook => "webhook",
        }
    }
}

/// A single entry of the route table.
///
/// `path` is either a literal (`/v1/properties`), a parameterized pattern
/// (`/v1/properties/:id`) or a prefix mount ending in `/*`
/// (`/v1/properties/*`).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteRule {
    #[serde(default)]
    pub method: RouteMethod,
    pub path: String,
    pub service: String,
    #[serde(default)]
    pub rewrite: Option<PathRewrite>,
    #[serde(default)]
    pub auth: AuthRequirement,
    #[serde(default)]
    pub rate_limit: RateLimitClass,
}

impl RouteRule {
    pub fn new(method: RouteMethod, path: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            service: service.into(),
            rewrite: None,
            auth: AuthRequirement::Public,
            rate_limit: RateLimitClass::Default,
        }
    }

    pub fn rewrite(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rewrite = Some(PathRewrite {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn auth(mut self, auth: AuthRequirement) -> Self {
        self.auth = auth;
        self
    }

    pub fn rate_limit(mut self, class: RateLimitClass) -> Self {
        self.rate_limit = class;
        self
    }
}

fn default_admin_prefix() -> String {
    "/v1/admin".to_string()
}

fn default_admin_auth() -> AuthRequirement {
    AuthRequirement::Role {
        roles: vec!["admin".to_string(), "super_admin".to_string()],
    }
}

/// Administrative namespace resolved by domain segment.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminConfig {
    #[serde(default = "default_admin_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub domains: HashMap<String, AdminDomainConfig>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            prefix: default_admin_prefix(),
            domains: HashMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminDomainConfig {
    pub service: String,
    /// The service's own admin sub-path replacing `<admin prefix>/<domain>`.
    pub rewrite_to: String,
    #[serde(default = "default_admin_auth")]
    pub auth: AuthRequirement,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicyConfig {
    pub window_ms: u64,
    pub max: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub default: RateLimitPolicyConfig,
    pub auth: RateLimitPolicyConfig,
    pub webhook: RateLimitPolicyConfig,
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            default: RateLimitPolicyConfig {
                window_ms: 15 * 60 * 1000,
                max: 1000,
            },
            auth: RateLimitPolicyConfig {
                window_ms: 15 * 60 * 1000,
                max: 10,
            },
            webhook: RateLimitPolicyConfig {
                window_ms: 60 * 1000,
                max: 100,
            },
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}
