use axum::{middleware, routing::get, Router};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rategate::{rate_limit_middleware, Policy, RateLimitState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Redis sliding window when REDIS_URL is set, in-process fixed window otherwise
    let state = RateLimitState::from_env(Policy::Api);

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/api/data", get(api_data_handler))
        .layer(middleware::from_fn_with_state(state, rate_limit_middleware));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000")
        .await
        .expect("Failed to bind to address. Is the port already in use?");
    info!("Server at http://127.0.0.1:3000");
    axum::serve(listener, app).await.expect("server error");
}

async fn root_handler() -> &'static str {
    "Welcome to Rate Limited API!"
}
async fn api_data_handler() -> &'static str {
    r#"{"data": [1,2,3]}"#
}
