use std::sync::Arc;
use crate::clock::Clock;
use crate::config::Settings;
use crate::identity::{Identity, IdentityResolver};
use crate::middleware::RouteTable;
use crate::rate_limit::ThrottleEngine;
use crate::scope::{ANON_SCOPE, USER_SCOPE};
use crate::store::CounterStore;
// app's shared state

pub struct AppState {
    pub client: reqwest::Client,
    pub engine: Arc<ThrottleEngine>,
    pub routes: RouteTable,
    pub resolver: IdentityResolver,
    pub default_scopes: bool, // anon/user on every proxied request
    pub upstream: String,     // where allowed requests go
}

impl AppState {
    pub fn new(
        settings: Settings,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(settings.upstream_timeout)
            .build()?;

        let engine = ThrottleEngine::new(Arc::new(settings.registry), store, clock)
            .with_failure_policy(settings.failure_policy)
            .with_store_timeout(settings.store_timeout);

        Ok(Self {
            client,
            engine: Arc::new(engine),
            routes: settings.routes,
            resolver: settings.resolver,
            default_scopes: settings.default_scopes,
            upstream: settings.upstream,
        })
    }

    // Scopes a proxied request is checked against, route scope first
    pub fn scopes_for<'a>(&'a self, path: &str, identity: &Identity) -> Vec<&'a str> {
        let mut scopes = Vec::with_capacity(2);
        if let Some(scope) = self.routes.scope_for(path) {
            scopes.push(scope);
        }
        if self.default_scopes {
            let class = if identity.is_authenticated() { USER_SCOPE } else { ANON_SCOPE };
            if !scopes.contains(&class) {
                scopes.push(class);
            }
        }
        scopes
    }
}
