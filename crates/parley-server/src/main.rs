mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use parley_api::{AppState, AppStateInner};
use parley_db::Database;
use parley_gateway::connection;
use parley_gateway::sweeper::run_presence_sweep;
use parley_gateway::{Gateway, GroupName};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);
    for (name, number) in &config.seed_users {
        let id = db.ensure_user(name, number)?;
        info!("Seeded user {} ({}) as {}", name, number, id);
    }

    let gateway = Gateway::local(db.clone());

    if config.presence_sweep_secs > 0 {
        let stale_after = chrono::Duration::seconds(config.presence_stale_secs as i64);
        tokio::spawn(run_presence_sweep(
            gateway.clone(),
            Duration::from_secs(config.presence_sweep_secs),
            stale_after,
        ));
        info!(
            "Presence sweep every {}s, stale after {}s",
            config.presence_sweep_secs, config.presence_stale_secs
        );
    }

    let app_state: AppState = Arc::new(AppStateInner {
        db,
        gateway: gateway.clone(),
    });

    let app = Router::new()
        .merge(parley_api::router(app_state))
        .merge(ws_router(gateway))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// WebSocket entry points. Chat rooms are reachable with or without a
/// trailing slash; older clients always send one.
fn ws_router(gateway: Gateway) -> Router {
    Router::new()
        .route("/ws", get(ws_global))
        .route("/ws/chat/{room}", get(ws_chat))
        .route("/ws/chat/{room}/", get(ws_chat))
        .with_state(gateway)
}

/// GET /ws: joins the global group only.
async fn ws_global(State(gateway): State<Gateway>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, gateway, vec![GroupName::global()])
    })
}

/// GET /ws/chat/{a}_{b}: joins the pair's conversation group only.
async fn ws_chat(
    State(gateway): State<Gateway>,
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(group) = GroupName::from_room(&room) else {
        debug!("Rejected chat socket for room {:?}", room);
        return StatusCode::BAD_REQUEST.into_response();
    };
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, gateway, vec![group])
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
