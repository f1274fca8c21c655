//! HTTP front end of the device role

use std::future::Future;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use twainlocal_core::constants::{INFO_PATH, PRIVET_TOKEN_HEADER, SESSION_PATH};

use crate::carrier::{CommandCarrier, Reply};
use crate::dispatcher::{Dispatcher, InboundRequest};
use crate::error::Result;

#[derive(Clone)]
struct AppState {
    dispatcher: Dispatcher,
}

/// Routes for `/privet/info` and the session endpoint
///
/// Anything else is answered with 404 by the dispatcher.
pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route(INFO_PATH, get(handle))
        .route(SESSION_PATH, post(handle))
        .fallback(handle)
        .with_state(AppState { dispatcher })
}

/// Serve `router` on `listener` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if let Ok(address) = listener.local_addr() {
        info!("Listening on {}", address);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, for use as the `shutdown` of [`serve`]
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn handle(State(state): State<AppState>, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let token = headers
        .get(PRIVET_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let request = InboundRequest::new(uri.path(), token, body);
    debug!("{} ({} bytes)", request.path, request.body.len());

    let wait = state.dispatcher.reply_timeout(&request);
    let (tx, rx) = oneshot::channel();
    let carrier = CommandCarrier::inbound(tx);
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move { dispatcher.dispatch(request, carrier).await });

    let Some(reply) = await_reply(rx, wait).await else {
        warn!("{}: no reply within {:?}", uri.path(), wait);
        return StatusCode::REQUEST_TIMEOUT.into_response();
    };

    let (status, content_type, body) = reply.into_parts().await;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(body))
        .unwrap_or_else(|e| {
            warn!("Failed to build response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

/// Wait up to `wait` for the dispatcher's reply
///
/// A dropped carrier still holds the exchange open until `wait` runs out,
/// so the requester sees its own timeout.
async fn await_reply(rx: oneshot::Receiver<Reply>, wait: Duration) -> Option<Reply> {
    let deadline = tokio::time::Instant::now() + wait;
    match tokio::time::timeout_at(deadline, rx).await {
        Ok(Ok(reply)) => Some(reply),
        Ok(Err(_)) => {
            tokio::time::sleep_until(deadline).await;
            None
        }
        Err(_) => None,
    }
}
