//! `/ws` duplex endpoint.
//!
//! The upgrade is always accepted so that a rejected client receives a
//! proper close code (4001) instead of an HTTP error it cannot inspect.
//! After a successful token check the socket is attached to the bridge and
//! two pumps run until either side goes away:
//!
//! - bridge → socket: [`ClientFrame`]s from the bridge become text or close
//!   frames;
//! - socket → bridge: each text frame is forwarded verbatim through
//!   [`Bridge::forward`].

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::Uri;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::bridge::{ClientFrame, CLOSE_UNAUTHORIZED};
use crate::server::AppState;

/// Extract `token` from a URI query string.
///
/// Returns `None` when the parameter is absent or empty.
pub(crate) fn extract_token(uri: &Uri) -> Option<String> {
    uri.query().and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == "token")
            .map(|(_, v)| v.to_owned())
            .filter(|v| !v.is_empty())
    })
}

/// Upgrade handler for `GET /ws?token=…`.
pub async fn ws_handler(ws: WebSocketUpgrade, uri: Uri, State(state): State<AppState>) -> Response {
    let token = extract_token(&uri);
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

async fn close_socket(socket: &mut WebSocket, code: u16, reason: String) {
    let frame = Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }));
    if let Err(err) = socket.send(frame).await {
        debug!(error = %err, "failed to send close frame");
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, token: Option<String>) {
    let cwd = match token.as_deref().map(|t| state.tokens.consume(t)) {
        Some(Ok(cwd)) => cwd,
        Some(Err(err)) => {
            warn!(error = %err, "rejecting websocket connection");
            close_socket(&mut socket, CLOSE_UNAUTHORIZED, "unauthorized".into()).await;
            return;
        }
        None => {
            warn!("rejecting websocket connection without token");
            close_socket(&mut socket, CLOSE_UNAUTHORIZED, "unauthorized".into()).await;
            return;
        }
    };

    let (client, mut frames) = state.bridge.register_client();
    let client_id = client.id();
    let spawn = state.spawn.with_cwd(cwd);

    let attachment = match state.bridge.attach(client, &spawn) {
        Ok(attachment) => attachment,
        Err(err) => {
            // The bridge already queued the 1011 close frame.
            warn!(client_id, error = %err, "agent spawn failed");
            while let Some(frame) = frames.recv().await {
                if let ClientFrame::Close { code, reason } = frame {
                    close_socket(&mut socket, code, reason).await;
                    break;
                }
            }
            return;
        }
    };
    info!(client_id, process_id = attachment.process_id, cwd = %spawn.cwd.display(), "client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut tx_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match frame {
                ClientFrame::Text(line) => {
                    if ws_tx.send(Message::Text(line.into())).await.is_err() {
                        debug!(client_id, "websocket send failed");
                        break;
                    }
                }
                ClientFrame::Close { code, reason } => {
                    let close = Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    }));
                    let _ = ws_tx.send(close).await;
                    break;
                }
            }
        }
    });

    let bridge = state.bridge.clone();
    let mut rx_task = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    bridge.forward(attachment, text.as_str().to_owned());
                }
                Ok(Message::Close(_)) => {
                    debug!(client_id, "websocket closed by client");
                    break;
                }
                Ok(other) => {
                    debug!(client_id, ?other, "ignoring non-text websocket message");
                }
                Err(err) => {
                    debug!(client_id, error = %err, "websocket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut tx_task => rx_task.abort(),
        _ = &mut rx_task => tx_task.abort(),
    }

    state.bridge.detach(client_id);
    info!(client_id, "client disconnected");
}
