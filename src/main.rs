use clap::Parser; // for cli
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use throttle_gateway::clock::{Clock, SystemClock};
use throttle_gateway::config::{Args, Settings};
use throttle_gateway::state::AppState;
use throttle_gateway::redis_store::RedisStore;
use throttle_gateway::store::{CounterStore, MemoryStore, sweeper};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// this is main async function with tokio
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "throttle_gateway=info,security=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // parse cli arguments
    let args = Args::parse();
    let settings = match Settings::from_args(&args) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Forwarding to upstream at {}", settings.upstream);
    tracing::info!("Store failure policy: {:?}", settings.failure_policy);
    for scope in settings.registry.iter() {
        tracing::info!("scope {:<20} {}", scope.name, scope.rate());
    }

    let port = settings.port;
    let sweep_interval = settings.sweep_interval;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // shared redis store when configured, otherwise in-process + sweeper
    let connect_timeout = settings.store_timeout.max(CONNECT_TIMEOUT);
    let store: Arc<dyn CounterStore> = match settings.store_url.clone() {
        Some(url) => match RedisStore::connect(&url, connect_timeout).await {
            Ok(store) => {
                tracing::info!("Counting store: redis at {}", url);
                Arc::new(store)
            }
            Err(e) => {
                tracing::error!("cannot reach counting store {}: {}", url, e);
                return ExitCode::FAILURE;
            }
        },
        None => {
            tracing::info!("Counting store: in-process");
            let memory = Arc::new(MemoryStore::new());
            // spawn the background sweeper
            tokio::spawn(sweeper(memory.clone(), clock.clone(), sweep_interval));
            memory
        }
    };

    // creating shared state
    let state = match AppState::new(settings, store, clock) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            tracing::error!("failed to build upstream client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let app = throttle_gateway::router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("cannot bind {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Gateway running on http://localhost:{}", port);
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        tracing::error!("server error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
