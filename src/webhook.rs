//! HTTP ingress for gateway events.
//!
//! The gateway bridge delivers chat events as JSON POSTs to `/gateway`, each
//! signed with a shared secret. Signature verification runs as middleware on
//! the raw body before any parsing; unsigned or mis-signed deliveries are
//! rejected without being read.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::ingress::{EventIngress, GatewayEvent};

const SIGNATURE_HEADER: &str = "x-gateway-signature-256";

#[derive(Clone)]
pub struct AppState {
    pub gateway_secret: Arc<String>,
    pub ingress: Arc<EventIngress>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/gateway", post(gateway_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            signature_middleware,
        ))
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Verify a delivery signature of the form `sha256=<hex hmac of the body>`.
pub fn verify_gateway_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    // Constant-time comparison.
    mac.verify_slice(&expected).is_ok()
}

async fn signature_middleware(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();

    let bytes = match axum::body::to_bytes(body, 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "body too large").into_response(),
    };

    let Some(signature) = header_str(&parts.headers, SIGNATURE_HEADER) else {
        warn!("gateway delivery without signature");
        return (StatusCode::UNAUTHORIZED, "missing signature").into_response();
    };

    if !verify_gateway_signature(&state.gateway_secret, &bytes, signature) {
        warn!("gateway delivery with invalid signature");
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    let request = axum::extract::Request::from_parts(parts, axum::body::Body::from(bytes));
    next.run(request).await
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn gateway_handler(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let event: GatewayEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "unparseable gateway event");
            return (StatusCode::BAD_REQUEST, "unparseable event");
        }
    };

    let delivery_id = Uuid::new_v4();
    info!(%delivery_id, "gateway event accepted");

    // Dispatch off the request path so a slow downstream call cannot stall
    // the bridge's delivery loop.
    let ingress = state.ingress.clone();
    let span = tracing::info_span!("dispatch", %delivery_id);
    tokio::spawn(
        async move {
            ingress.dispatch(event).await;
        }
        .instrument(span),
    );

    (StatusCode::ACCEPTED, "accepted")
}
