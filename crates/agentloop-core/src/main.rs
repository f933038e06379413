use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentloop_core::config::Config;
use agentloop_core::http::{router, AppState};

/// Exit codes (§6): 0 clean shutdown, 1 config error, 2 unreachable dependency.
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_UNREACHABLE_DEPENDENCY: i32 = 2;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_filter.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("agentloop starting up");
    info!(llm_base_url = %config.llm_base_url, model = %config.llm_model, "chat model configured");

    let http_port = config.http_port;
    let state = AppState::new(config);
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{http_port}")).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, "failed to bind HTTP listener");
            std::process::exit(EXIT_UNREACHABLE_DEPENDENCY);
        }
    };

    info!(port = http_port, "listening");
    if let Err(err) = axum::serve(listener, app).await {
        error!(error = %err, "HTTP server error");
        std::process::exit(EXIT_UNREACHABLE_DEPENDENCY);
    }
}
