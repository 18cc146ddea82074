use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::clock::Clock;
use crate::error::{StoreError, ThrottleError};
use crate::metrics::{CHECK_LATENCY, STORE_ERRORS, THROTTLE_DECISIONS, THROTTLE_DENIED};
use crate::scope::{ScopeRegistry, ThrottleScope};
use crate::store::{CounterStore, Increment, window_end};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

// what to do when the counting store errors or times out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FailurePolicy {
    #[default]
    Open,
    Closed,
}

// Counting bucket identity; same key => same bucket, whatever the handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    pub scope: String,
    pub identity: String,
}

impl ThrottleKey {
    pub fn new(scope: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            identity: identity.into(),
        }
    }

    // throttle:<scope>:<sha256(identity)>
    pub fn store_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.identity.as_bytes());
        format!("throttle:{}:{:x}", self.scope, hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    // only set on a counted denial
    pub retry_after: Option<Duration>,
    pub limit: u32,
    pub remaining: u32,
}

impl Decision {
    fn from_increment(scope: &ThrottleScope, hit: &Increment, now: DateTime<Utc>) -> Self {
        // capped at one window even if the record starts in our future
        let retry_after = (!hit.admitted).then(|| {
            (window_end(hit.record.window_start, scope.window) - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(scope.window)
        });
        Self {
            allowed: hit.admitted,
            retry_after,
            limit: scope.limit,
            remaining: scope.limit.saturating_sub(hit.record.count),
        }
    }
}

// Snapshot returned by `peek`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    pub scope: String,
    pub count: u32,
    pub limit: u32,
    pub window_start: DateTime<Utc>,
    pub resets_at: DateTime<Utc>,
}

pub struct ThrottleEngine {
    registry: Arc<ScopeRegistry>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
    store_timeout: Duration,
}

impl ThrottleEngine {
    pub fn new(
        registry: Arc<ScopeRegistry>,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            failure_policy: FailurePolicy::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn registry(&self) -> &ScopeRegistry {
        &self.registry
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    fn resolve<'a>(
        &'a self,
        scope_name: &str,
        identity: &str,
    ) -> Result<&'a ThrottleScope, ThrottleError> {
        let scope = self
            .registry
            .get(scope_name)
            .ok_or_else(|| ThrottleError::UnknownScope(scope_name.to_string()))?;
        if identity.is_empty() {
            return Err(ThrottleError::EmptyIdentity);
        }
        Ok(scope)
    }

    // unknown scope / empty identity fail before the store is touched,
    // store failures go through the failure policy instead of erroring
    pub async fn check_and_record(
        &self,
        scope_name: &str,
        identity: &str,
    ) -> Result<Decision, ThrottleError> {
        let scope = self.resolve(scope_name, identity)?;
        let key = ThrottleKey::new(scope_name, identity);
        let now = self.clock.now();
        let started = Instant::now();

        let outcome = timeout(
            self.store_timeout,
            self.store
                .increment_or_init(&key.store_key(), scope.limit, scope.window, now),
        )
        .await
        .unwrap_or(Err(StoreError::Timeout(self.store_timeout)));

        CHECK_LATENCY.observe(started.elapsed().as_secs_f64());

        let decision = match outcome {
            Ok(hit) => Decision::from_increment(scope, &hit, now),
            Err(e) => self.degraded(scope, e),
        };

        let outcome_label = if decision.allowed { "allowed" } else { "denied" };
        THROTTLE_DECISIONS
            .with_label_values(&[scope_name, outcome_label])
            .inc();

        if !decision.allowed {
            self.on_denied(scope_name, identity);
        }
        Ok(decision)
    }

    fn degraded(&self, scope: &ThrottleScope, error: StoreError) -> Decision {
        STORE_ERRORS.inc();
        let allowed = self.failure_policy == FailurePolicy::Open;
        tracing::warn!(
            scope = %scope.name,
            policy = ?self.failure_policy,
            allowed,
            "throttle store failed: {}",
            error
        );
        Decision {
            allowed,
            retry_after: None,
            limit: scope.limit,
            remaining: if allowed { scope.limit } else { 0 },
        }
    }

    // security event for a refused request, never fails
    pub fn on_denied(&self, scope_name: &str, identity: &str) {
        let timestamp = self.clock.now();
        tracing::warn!(
            target: "security",
            scope = scope_name,
            identity,
            %timestamp,
            "request throttled"
        );
        if let Ok(counter) = THROTTLE_DENIED.get_metric_with_label_values(&[scope_name]) {
            counter.inc();
        }
    }

    // current window, nothing recorded
    pub async fn peek(
        &self,
        scope_name: &str,
        identity: &str,
    ) -> Result<Option<WindowStatus>, ThrottleError> {
        let scope = self.resolve(scope_name, identity)?;
        let key = ThrottleKey::new(scope_name, identity);
        let now = self.clock.now();

        let record = timeout(self.store_timeout, self.store.get(&key.store_key(), now))
            .await
            .unwrap_or(Err(StoreError::Timeout(self.store_timeout)))?;

        Ok(record.map(|r| WindowStatus {
            scope: scope.name.clone(),
            count: r.count,
            limit: scope.limit,
            window_start: r.window_start,
            resets_at: window_end(r.window_start, scope.window),
        }))
    }
}
