mod health;
mod metrics;
mod proxy;
mod throttle;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use proxy::proxy_handler;
pub use throttle::{check_handler, scopes_handler, status_handler};
