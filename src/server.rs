//! Axum binding for the federation facade.
//!
//! The facade is framework-agnostic (`http::Request<Bytes>` in, response
//! out); this module mounts it as an axum fallback handler so a host can
//! serve it standalone or merge it into a larger router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router as AxumRouter;
use axum::body::Body;
use axum::extract::State;
use axum::response::IntoResponse;
use http::{Request, StatusCode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::federation::{Federation, FetchOptions};

/// Largest inbox POST body accepted, in bytes.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

struct ServerState<T> {
    federation: Federation<T>,
    data: T,
}

/// Builds an axum router that feeds every request into
/// [`Federation::fetch`].
#[must_use]
pub fn into_router<T>(federation: Federation<T>, data: T) -> AxumRouter
where
    T: Clone + Send + Sync + 'static,
{
    let state = Arc::new(ServerState { federation, data });
    AxumRouter::new().fallback(handle::<T>).with_state(state)
}

async fn handle<T>(
    State(state): State<Arc<ServerState<T>>>,
    request: Request<Body>,
) -> impl IntoResponse
where
    T: Clone + Send + Sync + 'static,
{
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => {
            return http::Response::builder()
                .status(StatusCode::PAYLOAD_TOO_LARGE)
                .body(Body::empty())
                .expect("static response parts are valid");
        }
    };
    let request = Request::from_parts(parts, body);
    let response = state
        .federation
        .fetch(request, FetchOptions::new(state.data.clone()))
        .await;
    response.map(Body::from)
}

/// Binds `addr` and serves the facade until `cancel` fires, then shuts
/// down gracefully.
///
/// # Errors
///
/// Returns an error when the listener cannot bind or the server fails.
pub async fn serve<T>(
    federation: Federation<T>,
    data: T,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), std::io::Error>
where
    T: Clone + Send + Sync + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "federation server listening");
    let router = into_router(federation, data);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(std::io::Error::other)
}

/// Installs a `tracing` subscriber honoring `RUST_LOG`, for hosts that do
/// not bring their own.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
