//! Visit counter and record service.
//!
//! The connection string for the document store is resolved from a secret store at startup.
//! The listener binds first so liveness checks pass while bootstrap runs; the counter and
//! record routes answer 503 until the store is connected, and a failed bootstrap stops the
//! server with an error.
use std::{future::Future, sync::Arc, time::Duration};

use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::{get, post},
};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tokio::{net::TcpListener, signal::ctrl_c};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

pub mod bootstrap;
pub mod config;
pub mod counter;
pub mod database;
pub mod error;
pub mod memory;
pub mod records;
pub mod routes;
pub mod secrets;
pub mod state;

use config::Config;
use database::{Connector, StoreConnector};
use error::{BootstrapError, ServerError};
use routes::{
    create_record_handler, delete_record_handler, health_handler, read_record_handler,
    update_record_handler, visits_handler,
};
use secrets::{SecretResolver, resolver_for};
use state::State;

pub async fn start_server() -> Result<(), ServerError> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Loading config...");
    let config = Config::load()?;
    let resolver = resolver_for(&config.secret_vault).map_err(BootstrapError::from)?;

    let address = format!("0.0.0.0:{}", config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| ServerError::Bind {
            address: address.clone(),
            source,
        })?;
    info!("Server running on {address}");

    serve(
        State::new(config),
        listener,
        resolver.as_ref(),
        &Connector,
        shutdown_signal(),
    )
    .await
}

pub fn router(state: Arc<State>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/", get(visits_handler))
        .route("/healthz", get(health_handler))
        .route("/records", post(create_record_handler))
        .route(
            "/records/{id}",
            get(read_record_handler)
                .put(update_record_handler)
                .delete(delete_record_handler),
        )
        .layer(cors)
        .with_state(state)
}

/// Serve on `listener` while bootstrapping the store, until `shutdown` fires or bootstrap
/// fails. The store handle is closed before returning.
pub async fn serve<F>(
    state: Arc<State>,
    listener: TcpListener,
    resolver: &dyn SecretResolver,
    connector: &dyn StoreConnector,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state.clone());
    let watcher = state.clone();

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown => {},
                    _ = watcher.bootstrap.failed() => {
                        warn!("Bootstrap failed, shutting down");
                    },
                }
            })
            .await
    });

    let config = &state.config;
    let bootstrapped = state
        .bootstrap
        .run(resolver, connector, &config.secret_name, &config.secret_vault)
        .await;

    let served = server.await;

    info!("Server shutting down...");
    state.bootstrap.close().await;

    bootstrapped?;
    served??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
