//! Caller-facing HTTP adapter
//!
//! Every request, whatever its method or path, is aggregated, handed to the
//! router, and answered with whatever the selected provider replies.

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{
        StatusCode,
        header::{CONNECTION, TRANSFER_ENCODING},
    },
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{Span, instrument};

use crate::correlation::InboundConnection;
use crate::router::RequestRouter;
use crate::wire::{OutboundRequest, ProviderReply};

/// State shared by inbound handlers
#[derive(Clone)]
pub struct ProxyState {
    pub router: Arc<RequestRouter>,
    pub max_content_length: usize,
}

/// Create the inbound proxy router
pub fn create_router(state: ProxyState) -> Router {
    Router::new()
        .fallback(proxy)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Any method, any path - forward to a provider and relay its reply
#[instrument(skip(state, request), fields(method = %request.method(), path = %request.uri().path(), request_id = tracing::field::Empty))]
pub async fn proxy(State(state): State<ProxyState>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.max_content_length).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, limit = state.max_content_length, "Rejecting request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let outbound = OutboundRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
    };

    let (inbound, reply_rx) = InboundConnection::channel(peer);
    let fatal = state.router.fatal().clone();

    match state.router.route(outbound, inbound).await {
        Ok(id) => {
            Span::current().record("request_id", id);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Request not routed");
            return (StatusCode::SERVICE_UNAVAILABLE, "no provider available").into_response();
        }
    }

    tokio::select! {
        reply = reply_rx => match reply {
            Ok(reply) => into_response(reply),
            Err(_) => {
                tracing::warn!("Pending request evicted before a reply arrived");
                (StatusCode::GATEWAY_TIMEOUT, "no reply from provider").into_response()
            }
        },
        reason = fatal.triggered() => {
            tracing::warn!(reason = %reason, "Abandoning request after fatal condition");
            (StatusCode::SERVICE_UNAVAILABLE, "agent is restarting").into_response()
        }
    }
}

fn into_response(reply: ProviderReply) -> Response {
    let ProviderReply {
        status,
        mut headers,
        body,
    } = reply;

    // Body is already aggregated
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONNECTION);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
