mod api;
mod clock;
mod codes;
mod config;
mod consent;
mod details;
mod errors;
mod gate;
mod grants;
mod headers;
mod locks;
mod openapi;
mod pending;
mod state;
mod storage;
#[cfg(test)]
mod test_utils;
mod token;

use crate::state::AppState;
use axum::Router;
use log::{error, info, warn};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_scalar::{Scalar, Servable};

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let settings = match config::Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let storage = match storage::create_storage(&settings.storage).await {
        Ok(storage) => storage,
        Err(e) => {
            error!("Failed to initialize storage: {}", e);
            std::process::exit(1);
        }
    };

    let state = match AppState::new(settings.clone(), storage) {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application state: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let sweeper = state
        .pending
        .spawn_sweeper(settings.oauth.sweep_interval(), shutdown.clone());

    let app = create_app(state).await;
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let server = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server running on {}, press Ctrl+C to stop", addr);
    let serve = axum::serve(server, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!("Sweeper task ended abnormally: {}", e);
    }
    if let Err(e) = serve {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
    info!("Server shutdown complete");
}

/// Create a new application instance with a given state
pub async fn create_app(state: AppState) -> Router {
    let (router, api_doc) = OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .merge(api::router(&state))
        .split_for_parts();

    Router::new()
        .merge(router)
        .merge(Scalar::with_url("/scalar", api_doc))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::TestFixture;

    #[tokio::test]
    async fn test_openapi_ui_is_served() {
        let fixture = TestFixture::new().await;
        let response = fixture.get("/scalar").await;
        response.assert_ok();
        assert!(response.text.contains("<html"));
    }
}
