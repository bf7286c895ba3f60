// Command socket: `GET /ws?token=<jwt>`.
//
// Admission runs before the upgrade. Once upgraded, the socket task in
// `session` owns the connection and processes frames strictly in order.

mod session;
#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        connect_info::ConnectInfo,
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        State,
    },
    http::{Extensions, HeaderMap, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tandem_common::protocol::envelope::ServerEnvelope;
use tracing::{debug, info, Instrument};

use crate::admission::{Admission, AdmissionGateway, ConnectionRequest};
use crate::error::{trace_id_from_headers_or_generate, with_trace_id_scope};
use crate::metrics;
use crate::rooms::RoomHub;

pub(crate) const MAX_FRAME_BYTES: usize = 262_144;

#[derive(Clone)]
pub struct CommandSocketState {
    admission: AdmissionGateway,
    rooms: Arc<RoomHub<ServerEnvelope>>,
}

pub fn router(admission: AdmissionGateway, rooms: Arc<RoomHub<ServerEnvelope>>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(CommandSocketState { admission, rooms })
}

/// Peer address from `ConnectInfo`, or loopback when the server was built
/// without connect info (in-process tests).
pub(crate) fn peer_addr(extensions: &Extensions) -> SocketAddr {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)))
}

/// Run connection admission and render a rejection as the HTTP response that
/// replaces the upgrade.
pub(crate) async fn admit(
    admission: &AdmissionGateway,
    request: &ConnectionRequest,
) -> Result<crate::admission::SessionIdentity, Response> {
    match admission.accept(request).await {
        Admission::Accepted(identity) => Ok(identity),
        Admission::Rejected { reason, retry_after } => {
            metrics::record_connection_rejected(reason);
            debug!(peer = %request.peer, reason = reason.label(), "connection rejected");
            Err(Admission::rejection_error(reason, retry_after).into_response())
        }
    }
}

async fn ws_upgrade(
    State(state): State<CommandSocketState>,
    uri: Uri,
    headers: HeaderMap,
    extensions: Extensions,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let trace_id = trace_id_from_headers_or_generate(&headers);
    let request = ConnectionRequest { uri, headers, peer: peer_addr(&extensions) };

    let identity = match with_trace_id_scope(trace_id.clone(), admit(&state.admission, &request)).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    metrics::record_connection_accepted();
    info!(
        user_id = %identity.user_id,
        connection_id = %identity.connection_id,
        trace_id = %trace_id,
        "command socket admitted"
    );

    let span = tracing::info_span!(
        "command_socket",
        user_id = %identity.user_id,
        connection_id = %identity.connection_id,
        trace_id = %trace_id,
    );
    upgrade.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| {
        with_trace_id_scope(
            trace_id,
            session::run(socket, identity, state.admission, state.rooms),
        )
        .instrument(span)
    })
}
