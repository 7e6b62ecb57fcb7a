use std::{fmt::Display, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use flare_core::Identity;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    auth::{record_auth_failure, ConnectionContext, TokenQuery},
    error::ApiError,
    registry::{ConnectionHandle, ConnectionId, Outbound},
    session::ChatSession,
    state::AppState,
};

/// How long a peer gets to accept the closing frame.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);
/// How long a finished session waits for its writer before aborting it.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// `GET /ws`. The caller is identified before the upgrade so a rejected
/// connection never reaches the registry.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    let ctx = ConnectionContext::from_request(&headers, query.token, remote_addr);

    let identity = match state.resolver.resolve(&ctx).await {
        Ok(identity) => identity,
        Err(err) => {
            record_auth_failure(&err);
            warn!(remote_addr = ?remote_addr, error = %err, "websocket connection rejected");
            return ApiError::from(err).into_response();
        }
    };

    match upgrade {
        Ok(upgrade) => upgrade
            .on_upgrade(move |socket| serve_socket(socket, state, identity, remote_addr))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn serve_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: Identity,
    remote_addr: Option<SocketAddr>,
) {
    let (handle, outbound) = ConnectionHandle::open(
        identity,
        remote_addr,
        state.settings.queue_capacity(),
        &state.shutdown,
    );
    let connection_id = handle.id();
    let (sink, stream) = socket.split();

    let mut writer = tokio::spawn(write_outbound(
        sink,
        outbound,
        handle.close_token(),
        connection_id,
    ));

    let session = ChatSession::new(
        handle,
        state.hub.clone(),
        Arc::clone(&state.messages),
        state.settings.history_limit,
    );
    let outcome = session.run(stream).await;

    match tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(connection_id = %connection_id, error = %err, "writer task failed");
        }
        Err(_) => {
            writer.abort();
            warn!(connection_id = %connection_id, "writer task stalled; aborted");
        }
    }

    info!(
        connection_id = %connection_id,
        reason = outcome.close_reason.metric_label(),
        history = outcome.history_replayed,
        frames = outcome.frames_relayed,
        alerts = outcome.alerts_raised,
        "websocket connection finished"
    );
}

/// Drains one connection's outbound queue into its socket. Stops when the
/// connection is closed or a write fails; either way the socket gets a close
/// frame and the connection token ends up cancelled. A write that blocks on
/// a stalled peer is abandoned as soon as the connection closes.
async fn write_outbound<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
    connection_id: ConnectionId,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            next = outbound.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        let payload = match serde_json::to_string(message.as_ref()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "failed to encode message");
                continue;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            sent = sink.send(Message::Text(payload)) => sent,
        };
        if let Err(err) = sent {
            debug!(connection_id = %connection_id, error = %err, "socket write failed");
            break;
        }
    }

    closed.cancel();
    let close = sink.send(Message::Close(None));
    if tokio::time::timeout(CLOSE_FRAME_TIMEOUT, close).await.is_err() {
        debug!(connection_id = %connection_id, "peer did not take close frame");
    }
    debug!(connection_id = %connection_id, "writer task finished");
}
