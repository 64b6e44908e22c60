//! WebSocket endpoint backing the live channel.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::presence::{ClientEvent, ServerEvent};

#[derive(Debug, Deserialize)]
pub struct Params {
    token: String,
}

/// Upgrade handler. The handshake is refused with 401 unless the token
/// resolves to a known user.
pub async fn handler(
    ws: WebSocketUpgrade,
    Query(params): Query<Params>,
    State(state): State<AppState>,
) -> Result<Response> {
    let claims = state.token.decode(&params.token)?;
    let user = state
        .users
        .repo
        .find_by_id(claims.sub)
        .await
        .map_err(|_| ServerError::Unauthorized)?;

    Ok(ws.on_upgrade(move |socket| serve_connection(state, user.id, socket)))
}

async fn serve_connection(state: AppState, user_id: Uuid, socket: WebSocket) {
    let socket_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.presence.connect(user_id, socket_id, tx);

    tracing::debug!(%user_id, %socket_id, "presence connected");

    let (mut sink, mut stream) = socket.split();

    // Forward queued server events to the socket.
    let mut forward = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(payload) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_event(&state, user_id, text.as_str()).await;
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}, // pings and binary frames are ignored.
                    Some(Err(err)) => {
                        tracing::debug!(%user_id, error = %err, "websocket read failed");
                        break;
                    },
                }
            },
            _ = &mut forward => break,
        }
    }

    forward.abort();
    state.presence.disconnect(user_id, socket_id);
    tracing::debug!(%user_id, %socket_id, "presence disconnected");
}

/// Dispatch one client event. Any failure here is logged and dropped; a bad
/// frame must never take down the connection or the shared table.
async fn handle_event(state: &AppState, user_id: Uuid, raw: &str) {
    let event = match serde_json::from_str::<ClientEvent>(raw) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(%user_id, error = %err, "unreadable client event");
            return;
        },
    };

    match event {
        ClientEvent::StartStudy { subject, .. } => {
            let Some(event) = state.presence.start_study(user_id, subject, Utc::now()) else {
                return;
            };
            broadcast_to_friends(state, user_id, &event).await;
        },
        ClientEvent::StopStudy => {
            let Some(event) = state.presence.stop_study(user_id, Utc::now()) else {
                return;
            };
            broadcast_to_friends(state, user_id, &event).await;
        },
        ClientEvent::GetOnlineFriends { friend_ids } => {
            let online = state.presence.online_friends(&friend_ids);
            state
                .presence
                .send_to(user_id, ServerEvent::OnlineFriends { friend_ids: online });
        },
    }
}

/// Best-effort fan-out; a failed friend lookup only costs the notification.
async fn broadcast_to_friends(state: &AppState, user_id: Uuid, event: &ServerEvent) {
    match state.users.repo.friend_ids(user_id).await {
        Ok(friends) => state.presence.broadcast(&friends, event),
        Err(err) => {
            tracing::error!(%user_id, error = %err, "failed to load friends for broadcast");
        },
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use tower::util::ServiceExt;

    use crate::{app, router};

    fn upgrade_request(token: &str) -> Request<Body> {
        let mut request = Request::builder()
            .method("GET")
            .uri(format!("/ws?token={token}"))
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        // `oneshot` bypasses the connection handshake, so the `OnUpgrade`
        // extension hyper normally inserts has to be synthesized here or the
        // extractor rejects the request with 426 before the handler runs.
        request
            .extensions_mut()
            .insert(hyper::upgrade::on(&mut Request::new(Body::empty())));
        request
    }

    #[sqlx::test]
    async fn test_handshake_rejects_unknown_token(pool: sqlx::PgPool) {
        let app = app(router::state(pool));

        let response = app.oneshot(upgrade_request("garbage")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[sqlx::test]
    async fn test_handshake_accepts_known_user(pool: sqlx::PgPool) {
        let app = app(router::state(pool.clone()));
        let (token, _) = router::signup(&app, &pool, "alice", "alice@example.com").await;

        let response = app.oneshot(upgrade_request(&token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    }
}
