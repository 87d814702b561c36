//! Strategy selection by URL shape.
//!
//! A [`Router`] is an ordered list of rules; the first rule whose pattern
//! matches decides the strategy.

use swcache_net::{Request, Url};
use tracing::trace;

use crate::config::WorkerConfig;

/// Namespace a strategy writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSlot {
    /// The version's static namespace.
    Static,
    /// The version's dynamic namespace.
    Dynamic,
}

/// How an intercepted request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Not intercepted; the host performs its default handling.
    Passthrough,
    /// Live fetch first, cache and offline document on failure.
    NetworkFirst(CacheSlot),
    /// Cache first, live fetch on miss.
    CacheFirst(CacheSlot),
}

/// URL predicate of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePattern {
    /// Any scheme other than `http` and `https`.
    NonHttpScheme,
    /// Path under `prefix` that does not end in one of `except_extensions`.
    PathPrefix {
        prefix: String,
        except_extensions: Vec<String>,
    },
    /// Path ending in one of the extensions.
    Extension(Vec<String>),
    /// Every URL.
    Any,
}

impl RoutePattern {
    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        match self {
            RoutePattern::NonHttpScheme => !matches!(url.scheme(), "http" | "https"),
            RoutePattern::PathPrefix {
                prefix,
                except_extensions,
            } => url.path().starts_with(prefix.as_str()) && !has_extension(url, except_extensions),
            RoutePattern::Extension(extensions) => has_extension(url, extensions),
            RoutePattern::Any => true,
        }
    }
}

fn has_extension(url: &Url, extensions: &[String]) -> bool {
    let path = url.path();
    extensions.iter().any(|ext| {
        path.len() > ext.len()
            && path.ends_with(ext.as_str())
            && path.as_bytes()[path.len() - ext.len() - 1] == b'.'
    })
}

/// Rule for routing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub pattern: RoutePattern,
    pub strategy: Strategy,
}

impl RouteRule {
    pub fn new(pattern: RoutePattern, strategy: Strategy) -> Self {
        Self { pattern, strategy }
    }
}

/// Ordered rule table, first match wins.
#[derive(Debug, Clone, Default)]
pub struct Router {
    rules: Vec<RouteRule>,
}

impl Router {
    /// Create an empty router. Unmatched requests pass through.
    pub fn new() -> Self {
        Self::default()
    }

    /// The default policy for a worker version:
    ///
    /// 1. non-HTTP(S) schemes pass through
    /// 2. admin paths without a static extension are network-first (dynamic namespace)
    /// 3. everything else is cache-first (static namespace)
    pub fn from_config(config: &WorkerConfig) -> Self {
        let mut router = Self::new();
        router.push(RouteRule::new(RoutePattern::NonHttpScheme, Strategy::Passthrough));
        router.push(RouteRule::new(
            RoutePattern::PathPrefix {
                prefix: config.admin_root.clone(),
                except_extensions: config.static_extensions.clone(),
            },
            Strategy::NetworkFirst(CacheSlot::Dynamic),
        ));
        router.push(RouteRule::new(
            RoutePattern::Any,
            Strategy::CacheFirst(CacheSlot::Static),
        ));
        router
    }

    /// Append a rule after the existing ones.
    pub fn push(&mut self, rule: RouteRule) {
        self.rules.push(rule);
    }

    /// Insert a rule ahead of the existing ones.
    pub fn prepend(&mut self, rule: RouteRule) {
        self.rules.insert(0, rule);
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Select the strategy for a request.
    pub fn classify(&self, request: &Request) -> Strategy {
        let strategy = self
            .rules
            .iter()
            .find(|rule| rule.pattern.matches(&request.url))
            .map(|rule| rule.strategy)
            .unwrap_or(Strategy::Passthrough);
        trace!(url = %request.url, ?strategy, "Classified request");
        strategy
    }
}
