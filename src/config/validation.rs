use std::{collections::HashMap, net::SocketAddr};

use crate::{
    config::models::{AuthRequirement, GatewayConfig, RateLimitPolicyConfig, RouteRule},
    core::dispatcher::{normalize_path, pattern_key, rewrite_prefix},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Unknown service '{service}' referenced by {context}")]
    UnknownService { service: String, context: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration linter. Every problem is collected and reported
/// together rather than stopping at the first one.
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire gateway configuration
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.auth.jwt_secret.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "auth.jwt_secret".to_string(),
            });
        }

        if !config.internal.prefix.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "internal.prefix".to_string(),
                message: "must start with '/'".to_string(),
            });
        }
        if config.internal.token.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "internal.token".to_string(),
            });
        }

        if let Err(e) = Self::validate_url(&config.authority.base_url, "authority.base_url") {
            errors.push(e);
        }

        let mut service_names: Vec<&String> = config.services.keys().collect();
        service_names.sort();
        for name in service_names {
            let context = format!("services.{name}.base_url");
            if let Err(e) = Self::validate_url(&config.services[name].base_url, &context) {
                errors.push(e);
            }
        }

        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        }
        for (index, rule) in config.routes.iter().enumerate() {
            errors.extend(Self::validate_single_route(config, index, rule));
        }
        errors.extend(Self::check_route_conflicts(&config.routes));

        errors.extend(Self::validate_admin(config));

        for (class, policy) in [
            ("default", &config.rate_limits.default),
            ("auth", &config.rate_limits.auth),
            ("webhook", &config.rate_limits.webhook),
        ] {
            if let Err(e) = Self::validate_rate_limit(class, policy) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_single_route(
        config: &GatewayConfig,
        index: usize,
        rule: &RouteRule,
    ) -> Vec<ValidationError> {
        let field = |name: &str| format!("routes[{index}].{name}");
        let mut errors = Vec::new();

        if !rule.path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: field("path"),
                message: format!("'{}' must start with '/'", rule.path),
            });
        }

        if !config.services.contains_key(&rule.service) {
            errors.push(ValidationError::UnknownService {
                service: rule.service.clone(),
                context: format!("route '{} {}'", rule.method, rule.path),
            });
        }

        if let Some(rewrite) = &rule.rewrite {
            if rewrite_prefix(&normalize_path(&rule.path), &rewrite.from, "/").is_none() {
                errors.push(ValidationError::InvalidField {
                    field: field("rewrite.from"),
                    message: format!("'{}' is not a prefix of '{}'", rewrite.from, rule.path),
                });
            }
            if !rewrite.to.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: field("rewrite.to"),
                    message: format!("'{}' must start with '/'", rewrite.to),
                });
            }
        }

        if let Err(e) = Self::validate_requirement(&rule.auth, &field("auth")) {
            errors.push(e);
        }
        errors
    }

    /// Role and permission requirements must name something to check.
    fn validate_requirement(requirement: &AuthRequirement, field: &str) -> ValidationResult<()> {
        match requirement {
            AuthRequirement::Role { roles } if roles.is_empty() => {
                Err(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "role requirement names no roles".to_string(),
                })
            }
            AuthRequirement::Permission { permissions } if permissions.is_empty() => {
                Err(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "permission requirement names no permissions".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Two rules with the same method and pattern would make resolution depend
    /// on declaration order.
    fn check_route_conflicts(routes: &[RouteRule]) -> Vec<ValidationError> {
        let mut seen: HashMap<(String, String), &RouteRule> = HashMap::new();
        let mut errors = Vec::new();
        for rule in routes {
            let key = (rule.method.to_string(), pattern_key(&rule.path));
            if let Some(existing) = seen.get(&key) {
                errors.push(ValidationError::RouteConflict {
                    message: format!(
                        "'{} {}' duplicates '{} {}'",
                        rule.method, rule.path, existing.method, existing.path
                    ),
                });
            } else {
                seen.insert(key, rule);
            }
        }
        errors
    }

    fn validate_admin(config: &GatewayConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !config.admin.prefix.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "admin.prefix".to_string(),
                message: "must start with '/'".to_string(),
            });
        }

        let mut domains: Vec<_> = config.admin.domains.iter().collect();
        domains.sort_by(|a, b| a.0.cmp(b.0));
        for (domain, target) in domains {
            if domain.is_empty() || domain.contains('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("admin.domains.{domain}"),
                    message: "domain must be a single path segment".to_string(),
                });
            }
            if !config.services.contains_key(&target.service) {
                errors.push(ValidationError::UnknownService {
                    service: target.service.clone(),
                    context: format!("admin domain '{domain}'"),
                });
            }
            if !target.rewrite_to.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("admin.domains.{domain}.rewrite_to"),
                    message: format!("'{}' must start with '/'", target.rewrite_to),
                });
            }
            if let Err(e) =
                Self::validate_requirement(&target.auth, &format!("admin.domains.{domain}.auth"))
            {
                errors.push(e);
            }
        }
        errors
    }

    fn validate_rate_limit(class: &str, policy: &RateLimitPolicyConfig) -> ValidationResult<()> {
        if policy.max == 0 {
            return Err(ValidationError::InvalidField {
                field: format!("rate_limits.{class}.max"),
                message: "must be greater than 0".to_string(),
            });
        }
        if policy.window_ms == 0 {
            return Err(ValidationError::InvalidField {
                field: format!("rate_limits.{class}.window_ms"),
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
