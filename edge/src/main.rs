mod config;
mod proxy;
mod session;

use std::net::SocketAddr;

use aether_core::HANDSHAKE_PATH;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use session::SessionSlot;

#[derive(Clone)]
struct AppState {
    slot: SessionSlot,
    secret: std::sync::Arc<String>,
}

async fn ws_handshake(State(state): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if !session::secret_matches(&state.secret, presented) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    // Reserve the slot *before* upgrading: `ws.on_upgrade` sends the 101
    // response synchronously and only runs the session future afterward, so
    // checking liveness and claiming the slot must happen as one atomic step
    // ahead of the upgrade, not racing it.
    let Some((session, outbox_rx)) = session::try_accept(&state.slot) else {
        log::warn!("ws upgrade rejected: a client is already attached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Only one client at once").into_response();
    };

    let slot = state.slot.clone();
    ws.on_upgrade(move |socket| session::run(slot, session, outbox_rx, socket))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = config::Cli::parse();
    simple_logger::init_with_level(log::Level::Info)?;

    let state = AppState {
        slot: session::new_slot(),
        secret: std::sync::Arc::new(cli.secret.clone()),
    };

    let app = Router::new()
        .route(HANDSHAKE_PATH, get(ws_handshake))
        .fallback(proxy::handle)
        .with_state(state);

    let bind_addr = cli.socket_addr();
    log::info!("listening on {bind_addr}");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
