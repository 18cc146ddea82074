use serde::{Deserialize, Serialize};
use crate::middleware::ceil_secs;
use crate::rate_limit::{Decision, WindowStatus};

// POST /v1/throttle/check body
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct CheckRequest {
    pub scope: String,
    pub identity: String,
}

// Decision as seen by remote callers
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CheckResponse {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl From<Decision> for CheckResponse {
    fn from(d: Decision) -> Self {
        Self {
            allowed: d.allowed,
            limit: d.limit,
            remaining: d.remaining,
            retry_after_secs: d.retry_after.map(ceil_secs),
        }
    }
}

// GET /v1/throttle/status query
#[derive(Deserialize, Clone, Debug)]
pub struct StatusQuery {
    pub scope: String,
    pub identity: String,
}

#[derive(Serialize, Clone, Debug)]
pub struct StatusResponse {
    pub identity: String,
    pub window: Option<WindowStatus>,
}
