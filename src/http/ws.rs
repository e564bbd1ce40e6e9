//! Per-task WebSocket gateway: a duplex bridge between a client and the
//! task's streams.
//!
//! Outbound, the gateway forwards the task's output stream as JSON text
//! frames, starting from "now" unless `?replay=true` requests the backlog.
//! Inbound, only `input_response` payloads are accepted and handed to the
//! mediator. Authentication accepts a bearer header, the
//! `("tasks-api", token)` subprotocol pair, an `access_token` cookie, or an
//! `access_token` query parameter; policy failures close with 1008/4003.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Path, Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::time::Instant;

use crate::auth::{TASK_API_AUDIENCE, bearer_token, token_from_cookie, token_from_subprotocol};
use crate::bus::{ReadFrom, StreamBus, task_output_stream};
use crate::envelope::{Envelope, parse_client_input};
use crate::errors::RunnerError;
use crate::models::Task;

use super::api::SharedState;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection
/// dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Policy violation (bad or missing credentials, foreign task).
const CLOSE_POLICY: u16 = 1008;
/// Token did not verify (revoked or rotated); the client may re-auth.
const CLOSE_AUTH: u16 = 4003;
/// Internal failure.
const CLOSE_INTERNAL: u16 = 1011;
/// Normal close after the task terminated.
const CLOSE_NORMAL: u16 = 1000;

#[derive(Deserialize)]
pub struct WsQuery {
    pub access_token: Option<String>,
    pub replay: Option<bool>,
}

/// Pick the first offered token: bearer header, subprotocol pair, cookie,
/// query parameter.
pub fn resolve_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    bearer_token(headers)
        .or_else(|| token_from_subprotocol(headers))
        .or_else(|| token_from_cookie(headers))
        .or_else(|| query_token.map(str::to_string))
}

pub async fn ws_handler(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = resolve_token(&headers, query.access_token.as_deref());
    let replay = query.replay.unwrap_or(false);

    // Validation happens before the upgrade, but the verdict is delivered
    // as a close code on the upgraded socket so clients always get one.
    let verdict = validate(&state, token.as_deref(), &task_id).await;

    let offered_subprotocol = token_from_subprotocol(&headers).is_some();
    let ws = if offered_subprotocol {
        ws.protocols([TASK_API_AUDIENCE])
    } else {
        ws
    };
    ws.on_upgrade(move |socket| async move {
        match verdict {
            Ok(task) => handle_socket(socket, state, task, replay).await,
            Err(code) => close_with(socket, code, "validation failed").await,
        }
    })
}

async fn validate(
    state: &SharedState,
    token: Option<&str>,
    task_id: &str,
) -> Result<Task, u16> {
    let Some(token) = token else {
        return Err(CLOSE_POLICY);
    };
    let ctx = match state.auth.verify(token).await {
        Ok(ctx) => ctx,
        Err(RunnerError::AuthInvalid) => return Err(CLOSE_AUTH),
        Err(_) => return Err(CLOSE_INTERNAL),
    };
    let id = task_id.to_string();
    match state.db.call(move |db| db.get_task(&id)).await {
        Ok(Some(task)) if !task.soft_deleted && task.client_id == ctx.client_id => Ok(task),
        Ok(_) => Err(CLOSE_POLICY),
        Err(_) => Err(CLOSE_INTERNAL),
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: SharedState, task: Task, replay: bool) {
    let (mut sender, receiver) = socket.split();

    // Initial status frame so the client knows where the task stands
    // before any stream output arrives.
    let status_frame = Envelope::status(
        &task.id,
        task.status,
        serde_json::json!({
            "created_at": task.created_at,
            "started_at": task.started_at,
            "ended_at": task.ended_at,
            "results": task.results,
            "input_request_id": task.input_request_id,
        }),
    );
    let frame = serde_json::to_string(&status_frame).expect("envelope serialize");
    if sender.send(Message::Text(frame)).await.is_err() {
        return;
    }

    let from = if replay {
        ReadFrom::Earliest
    } else {
        ReadFrom::Latest
    };
    let subscription = match state
        .bus
        .subscribe_stream(&task_output_stream(&task.id), from)
        .await
    {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::error!(task = %task.id, error = %e, "Stream subscription failed");
            let socket = sender.reunite(receiver).expect("socket halves");
            close_with(socket, CLOSE_INTERNAL, "stream unavailable").await;
            return;
        }
    };

    run_socket_loop(sender, receiver, subscription, state, task).await;
}

/// Core gateway loop: stream forwarding, client input intake, and
/// ping/pong keepalive in one select. Exits when the task's termination
/// envelope has been forwarded (close 1000), the peer goes away, or the
/// keepalive lapses.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut subscription: crate::bus::StreamSubscription,
    state: SharedState,
    task: Task,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;
    let mut close_code: Option<u16> = None;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Stream forwarding ───────────────────────────────────
            entry = subscription.next() => {
                match entry {
                    Some((_, envelope)) => {
                        let frame = serde_json::to_string(&envelope).expect("envelope serialize");
                        if sender.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                        // The whole-task termination marker (prompt-scoped
                        // hints carry a request id and flow on channels, not
                        // this stream).
                        if envelope.kind() == "termination" && envelope.request_id().is_none() {
                            close_code = Some(CLOSE_NORMAL);
                            break;
                        }
                    }
                    None => {
                        close_code = Some(CLOSE_NORMAL);
                        break;
                    }
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match parse_client_input(&text) {
                            Some(payload) => {
                                if let Err(e) = state
                                    .mediator
                                    .submit_input(&task.id, &payload.request_id, &payload.data)
                                    .await
                                {
                                    let err = serde_json::json!({ "error": e.to_string() });
                                    if sender.send(Message::Text(err.to_string())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            None => {
                                let err = serde_json::json!({ "error": "Invalid input payload" });
                                if sender.send(Message::Text(err.to_string())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary and ping frames are ignored.
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let close = Message::Close(close_code.map(|code| CloseFrame {
        code,
        reason: "".into(),
    }));
    let _ = sender.send(close).await;
}

/// Mount point used by the server router.
pub fn ws_path() -> &'static str {
    "/ws/:task_id"
}
