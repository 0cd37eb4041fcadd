// `GET /sync/events`: sync notifications pushed over a WebSocket as JSON
// text frames, one event per frame.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Extension, Query, State,
    },
    response::Response,
};
use trisync_common::types::ProjectId;
use uuid::Uuid;

use super::{auth::AuthenticatedUser, error::ApiError, owned_project, ApiState, ProjectQuery};
use crate::events::Subscription;
use crate::service::SyncBackend;

/// With `projectId`, streams that project's events. Without it, streams
/// events for every project the caller has open at the time of the event.
pub(super) async fn events_ws<B: SyncBackend>(
    ws: WebSocketUpgrade,
    State(state): State<ApiState<B>>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<ProjectQuery>,
) -> Result<Response, ApiError> {
    let project = match query.project_id.as_deref() {
        Some(raw) => Some(owned_project(&state, user, raw)?),
        None => None,
    };
    let subscription = state.service.subscribe(project.clone());

    Ok(ws.on_upgrade(move |socket| stream_events(socket, subscription, state, user.user_id, project)))
}

async fn stream_events<B: SyncBackend>(
    mut socket: WebSocket,
    mut subscription: Subscription,
    state: ApiState<B>,
    owner: Uuid,
    project: Option<ProjectId>,
) {
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };
                match message {
                    WsMessage::Close(_) => break,
                    WsMessage::Ping(payload) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) | WsMessage::Text(_) | WsMessage::Binary(_) => {}
                }
            }
            event = subscription.recv() => {
                let Some(event) = event else {
                    break;
                };
                if project.is_none() && state.service.owner_of(event.project_id()) != Some(owner) {
                    continue;
                }
                let encoded = match serde_json::to_string(&event) {
                    Ok(encoded) => encoded,
                    Err(error) => {
                        tracing::warn!(?error, event = event.type_name(), "failed to encode sync event");
                        continue;
                    }
                };
                if socket.send(WsMessage::Text(encoded.into())).await.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(owner = %owner, "event stream closed");
}
