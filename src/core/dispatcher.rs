//! Route table and dispatcher.
//!
//! [`Dispatcher::resolve`] maps `(method, path)` to a [`Resolution`] naming the
//! target service, the path to forward, the access policy and the limiter
//! class, or returns `None` for "no route". Resolution is pure and
//! deterministic: rules are compiled once at startup and ranked so that the
//! first match is always the most specific one.
//!
//! Ranking, highest first:
//! 1. exact rules (literal or `:param` segments) before prefix mounts (`/*`);
//! 2. among exact rules, more literal segments first;
//! 3. among prefix mounts, the longest prefix first;
//! 4. method-specific rules before `ANY`;
//! 5. declaration order.
//!
//! Paths carrying dot segments (`.`, `..`, or their percent-encoded forms) or
//! an encoded separator never resolve: backends would normalize them into a
//! different route than the one the gateway authorized.
//!
//! The administrative namespace is resolved separately, by domain segment,
//! and never falls through to the route table. Paths under the internal
//! namespace resolve through the route table but always carry
//! [`AuthRequirement::Internal`].
use std::{cmp::Ordering, collections::HashMap};

use http::Method;

use crate::config::{
    AdminDomainConfig, AuthRequirement, GatewayConfig, PathRewrite, RateLimitClass, RouteMethod,
    RouteRule,
};

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub service: String,
    /// Normalized and rewritten path, without query string.
    pub rewritten_path: String,
    pub auth: AuthRequirement,
    pub rate_limit: RateLimitClass,
    /// The pattern that matched; low-cardinality label for logs and metrics.
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
}

#[derive(Debug, Clone)]
enum Pattern {
    Exact(Vec<Segment>),
    Prefix(Vec<String>),
}

impl Pattern {
    fn parse(raw: &str) -> Self {
        let normalized = normalize_path(raw);
        if let Some(base) = normalized.strip_suffix("/*") {
            return Pattern::Prefix(segments(base).map(str::to_string).collect());
        }
        Pattern::Exact(
            segments(&normalized)
                .map(|segment| match segment.strip_prefix(':') {
                    Some(_) => Segment::Param,
                    None => Segment::Literal(segment.to_string()),
                })
                .collect(),
        )
    }

    fn matches(&self, path_segments: &[&str]) -> bool {
        match self {
            Pattern::Exact(pattern) => {
                pattern.len() == path_segments.len()
                    && pattern
                        .iter()
                        .zip(path_segments)
                        .all(|(expected, actual)| match expected {
                            Segment::Literal(literal) => literal == actual,
                            Segment::Param => !actual.is_empty(),
                        })
            }
            Pattern::Prefix(prefix) => {
                prefix.len() <= path_segments.len()
                    && prefix.iter().zip(path_segments).all(|(a, b)| a == b)
            }
        }
    }

    fn rank(&self) -> (u8, usize, usize) {
        match self {
            Pattern::Exact(segments) => {
                let literals = segments
                    .iter()
                    .filter(|s| matches!(s, Segment::Literal(_)))
                    .count();
                (0, usize::MAX - literals, usize::MAX - segments.len())
            }
            Pattern::Prefix(prefix) => {
                let chars: usize = prefix.iter().map(String::len).sum();
                (1, usize::MAX - prefix.len(), usize::MAX - chars)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    method: RouteMethod,
    pattern: Pattern,
    raw: String,
    service: String,
    rewrite: Option<PathRewrite>,
    auth: AuthRequirement,
    rate_limit: RateLimitClass,
}

impl CompiledRoute {
    fn compile(rule: &RouteRule) -> Self {
        Self {
            method: rule.method,
            pattern: Pattern::parse(&rule.path),
            raw: rule.path.clone(),
            service: rule.service.clone(),
            rewrite: rule.rewrite.clone(),
            auth: rule.auth.clone(),
            rate_limit: rule.rate_limit,
        }
    }

    fn precedence(&self, other: &Self) -> Ordering {
        let method_rank = |m: RouteMethod| u8::from(m == RouteMethod::Any);
        self.pattern
            .rank()
            .cmp(&other.pattern.rank())
            .then(method_rank(self.method).cmp(&method_rank(other.method)))
    }
}

pub struct Dispatcher {
    routes: Vec<CompiledRoute>,
    admin_prefix: String,
    admin_domains: HashMap<String, AdminDomainConfig>,
    internal_prefix: String,
}

impl Dispatcher {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut routes: Vec<CompiledRoute> =
            config.routes.iter().map(CompiledRoute::compile).collect();
        // Stable sort keeps declaration order among equals.
        routes.sort_by(CompiledRoute::precedence);

        Self {
            routes,
            admin_prefix: normalize_path(&config.admin.prefix),
            admin_domains: config.admin.domains.clone(),
            internal_prefix: normalize_path(&config.internal.prefix),
        }
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Option<Resolution> {
        if is_ambiguous_path(path) {
            return None;
        }
        let path = normalize_path(path);

        if let Some(rest) = strip_prefix_segment(&path, &self.admin_prefix) {
            return self.resolve_admin(rest);
        }

        let mut resolution = self.resolve_table(method, &path)?;
        if strip_prefix_segment(&path, &self.internal_prefix).is_some() {
            resolution.auth = AuthRequirement::Internal;
        }
        Some(resolution)
    }

    fn resolve_table(&self, method: &Method, path: &str) -> Option<Resolution> {
        let path_segments: Vec<&str> = segments(path).collect();
        let route = self
            .routes
            .iter()
            .find(|route| route.method.matches(method) && route.pattern.matches(&path_segments))?;

        let rewritten_path = match &route.rewrite {
            Some(rewrite) => {
                rewrite_prefix(path, &rewrite.from, &rewrite.to).unwrap_or_else(|| path.to_string())
            }
            None => path.to_string(),
        };

        Some(Resolution {
            service: route.service.clone(),
            rewritten_path,
            auth: route.auth.clone(),
            rate_limit: route.rate_limit,
            pattern: route.raw.clone(),
        })
    }

    /// `rest` is what follows the admin prefix: empty or `/<domain>[/...]`.
    fn resolve_admin(&self, rest: &str) -> Option<Resolution> {
        let rest = rest.strip_prefix('/')?;
        let (domain, remainder) = match rest.split_once('/') {
            Some((domain, remainder)) => (domain, Some(remainder)),
            None => (rest, None),
        };
        let target = self.admin_domains.get(domain)?;

        let base = target.rewrite_to.trim_end_matches('/');
        let rewritten_path = match remainder {
            Some(remainder) => format!("{base}/{remainder}"),
            None if base.is_empty() => "/".to_string(),
            None => base.to_string(),
        };

        Some(Resolution {
            service: target.service.clone(),
            rewritten_path,
            auth: target.auth.clone(),
            rate_limit: RateLimitClass::Default,
            pattern: format!("{}/{}/*", self.admin_prefix, domain),
        })
    }
}

/// Collapse repeated slashes and drop the trailing slash (except for root).
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in segments(path) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

/// True when `path` holds a `.`/`..` segment (literal or `%2e`-encoded) or an
/// encoded `/` or a backslash.
pub fn is_ambiguous_path(path: &str) -> bool {
    path.split('/').any(|segment| {
        let lowered = segment.to_ascii_lowercase();
        if lowered.contains("%2f") || lowered.contains("%5c") || lowered.contains('\\') {
            return true;
        }
        let decoded = lowered.replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

/// Canonical form of a route pattern used to detect duplicates: parameter
/// names are erased so `/a/:id` and `/a/:slug` collide.
pub fn pattern_key(path: &str) -> String {
    let normalized = normalize_path(path);
    let key: Vec<&str> = segments(&normalized)
        .map(|segment| if segment.starts_with(':') { ":" } else { segment })
        .collect();
    format!("/{}", key.join("/"))
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// Strip `prefix` from `path` when it ends on a segment boundary. Returns the
/// remainder, which is empty or starts with `/`.
fn strip_prefix_segment<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return Some(if path == "/" { "" } else { path });
    }
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

/// Replace the `from` prefix of `path` with `to`, on a segment boundary.
pub fn rewrite_prefix(path: &str, from: &str, to: &str) -> Option<String> {
    let from = normalize_path(from);
    let rest = strip_prefix_segment(path, &from)?;
    let to = to.trim_end_matches('/');
    let rewritten = format!("{to}{rest}");
    Some(if rewritten.is_empty() {
        "/".to_string()
    } else {
        rewritten
    })
}
