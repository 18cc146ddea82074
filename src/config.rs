use axum::http::header::HeaderName;
use clap::Parser;
use std::time::Duration;

use crate::error::ConfigError;
use crate::identity::IdentityResolver;
use crate::middleware::RouteTable;
use crate::rate_limit::FailurePolicy;
use crate::scope::{ANON_SCOPE, ScopeRegistry, USER_SCOPE};

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "throttle-gateway")]
#[command(about = "Scoped request throttling for the survey backend")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // Application requests are forwarded to after throttling
    // Example: "localhost:8000"
    #[arg(short, long, default_value = "localhost:8000")]
    pub upstream: String,

    // Override or add a scope, e.g. --scope login=10/15min (repeatable)
    #[arg(long = "scope", value_name = "NAME=RATE")]
    pub scopes: Vec<String>,

    // Throttle a path prefix under a scope, e.g. --route /api/auth/login=login (repeatable)
    #[arg(long = "route", value_name = "PREFIX=SCOPE")]
    pub routes: Vec<String>,

    // What to do when the counting store fails
    #[arg(long, value_enum, default_value_t = FailurePolicy::Open)]
    pub failure_policy: FailurePolicy,

    // Shared redis counting store, e.g. redis://127.0.0.1:6379/
    // Without it counts live in this process only
    #[arg(long)]
    pub store_url: Option<String>,

    // Counting store call timeout in milliseconds
    #[arg(long, default_value_t = 250)]
    pub store_timeout_ms: u64,

    // How often lapsed records are evicted
    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,

    // Header carrying the authenticated user id, set by the auth layer in front
    #[arg(long, default_value = "x-authenticated-user")]
    pub user_header: String,

    // Use the first X-Forwarded-For address for anonymous callers
    #[arg(long)]
    pub trust_forwarded_for: bool,

    // Skip the anon/user scopes that otherwise apply to every proxied request
    #[arg(long)]
    pub no_default_scopes: bool,

    // Upstream request timeout
    #[arg(long, default_value_t = 30)]
    pub upstream_timeout_secs: u64,
}

// Validated runtime settings derived from Args
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub upstream: String,
    pub registry: ScopeRegistry,
    pub routes: RouteTable,
    pub default_scopes: bool,
    pub resolver: IdentityResolver,
    pub failure_policy: FailurePolicy,
    pub store_url: Option<String>,
    pub store_timeout: Duration,
    pub sweep_interval: Duration,
    pub upstream_timeout: Duration,
}

fn split_pair(raw: &str) -> Result<(&str, &str), ConfigError> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim(), value.trim()))
        .filter(|(name, value)| !name.is_empty() && !value.is_empty())
        .ok_or_else(|| ConfigError::MalformedPair(raw.to_string()))
}

// add http:// if not present
pub fn normalize_upstream(raw: &str) -> String {
    let url = raw.trim().trim_end_matches('/');
    if url.starts_with("http") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

impl Settings {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let overrides = args
            .scopes
            .iter()
            .map(|raw| split_pair(raw))
            .collect::<Result<Vec<_>, _>>()?;
        let registry = ScopeRegistry::with_overrides(overrides)?;

        let mut routes = RouteTable::default();
        for raw in &args.routes {
            let (prefix, scope) = split_pair(raw)?;
            if !registry.contains(scope) {
                return Err(ConfigError::UnknownRouteScope {
                    prefix: prefix.to_string(),
                    scope: scope.to_string(),
                });
            }
            routes.insert(prefix, scope);
        }

        let default_scopes = !args.no_default_scopes;
        if default_scopes {
            for name in [ANON_SCOPE, USER_SCOPE] {
                if !registry.contains(name) {
                    return Err(ConfigError::MissingDefaultScope(name.to_string()));
                }
            }
        }

        let user_header = HeaderName::try_from(args.user_header.trim())
            .map_err(|_| ConfigError::InvalidHeader(args.user_header.clone()))?;

        Ok(Self {
            port: args.port,
            upstream: normalize_upstream(&args.upstream),
            registry,
            routes,
            default_scopes,
            resolver: IdentityResolver::new(user_header, args.trust_forwarded_for),
            failure_policy: args.failure_policy,
            store_url: args
                .store_url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string),
            store_timeout: Duration::from_millis(args.store_timeout_ms),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs.max(1)),
            upstream_timeout: Duration::from_secs(args.upstream_timeout_secs),
        })
    }
}
