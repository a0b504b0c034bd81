use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SessionTiming;
use crate::error::AppError;
use crate::hub::{Frame, Role, Session};
use crate::models::event::{Envelope, MessageType};
use crate::models::location::DriverLocation;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub user_id: Option<String>,
    pub user_type: Option<String>,
    pub delivery_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub user_id: String,
    pub role: Role,
    pub delivery_id: Option<String>,
}

impl TryFrom<ConnectQuery> for ConnectParams {
    type Error = AppError;

    fn try_from(query: ConnectQuery) -> Result<Self, Self::Error> {
        let user_id = query
            .user_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AppError::BadRequest("user_id is required".to_string()))?;

        let role = query
            .user_type
            .ok_or_else(|| AppError::BadRequest("user_type is required".to_string()))?
            .parse::<Role>()
            .map_err(AppError::BadRequest)?;

        let delivery_id = match role {
            Role::Customer => query.delivery_id.filter(|id| !id.is_empty()),
            Role::Driver => None,
        };

        Ok(Self {
            user_id,
            role,
            delivery_id,
        })
    }
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let params = ConnectParams::try_from(query).inspect_err(|err| {
        warn!(error = %err, "rejected websocket connection");
    })?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, params)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    let (sender, receiver) = socket.split();
    let (session, queue) = Session::new(
        params.user_id,
        params.role,
        params.delivery_id,
        state.send_queue_size,
    );
    let session_id = session.id();

    state.hub.register(session.clone()).await;

    let mut outbound = tokio::spawn(write_pump(sender, queue, state.timing));
    let mut inbound = tokio::spawn(read_pump(receiver, session, state.clone()));

    tokio::select! {
        _ = &mut inbound => {
            state.hub.unregister(session_id).await;
            let _ = outbound.await;
        },
        _ = &mut outbound => {
            inbound.abort();
            state.hub.unregister(session_id).await;
        },
    }

    debug!(session_id = %session_id, "websocket closed");
}

/// Reads frames until the peer goes away, then unregisters the session.
///
/// Only pongs push the read deadline out; a peer that stops answering pings
/// is considered dead once `pong_wait` passes.
pub async fn read_pump<S, E>(mut stream: S, session: Arc<Session>, state: Arc<AppState>)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let pong_wait = state.timing.pong_wait;
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let next = match time::timeout_at(deadline, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!(user_id = %session.user_id(), "read deadline expired");
                break;
            }
        };

        match next {
            Some(Ok(Message::Text(text))) => handle_frame(&session, &state, text.as_bytes()).await,
            Some(Ok(Message::Binary(bytes))) => handle_frame(&session, &state, &bytes).await,
            Some(Ok(Message::Pong(_))) => deadline = Instant::now() + pong_wait,
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(err)) => {
                warn!(user_id = %session.user_id(), error = %err, "websocket read failed");
                break;
            }
        }
    }

    state.hub.unregister(session.id()).await;
}

async fn handle_frame(session: &Session, state: &AppState, raw: &[u8]) {
    if session.role() != Role::Driver {
        debug!(user_id = %session.user_id(), "ignoring frame from customer session");
        return;
    }

    let envelope: Envelope = match serde_json::from_slice(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(user_id = %session.user_id(), error = %err, "failed to decode envelope");
            state.metrics.inbound_decode_errors_total.inc();
            return;
        }
    };

    match envelope.kind {
        MessageType::LocationUpdate => {
            let report: DriverLocation = match serde_json::from_value(envelope.data) {
                Ok(report) => report,
                Err(err) => {
                    warn!(
                        user_id = %session.user_id(),
                        error = %err,
                        "failed to decode location update"
                    );
                    state.metrics.inbound_decode_errors_total.inc();
                    return;
                }
            };

            debug!(
                driver_id = %report.driver_id,
                lat = report.location.lat,
                lon = report.location.lon,
                "location update received"
            );
            state.tracker.process_location_update(report).await;
        }
        other => {
            debug!(
                user_id = %session.user_id(),
                kind = ?other,
                "ignoring unsupported message type"
            );
        }
    }
}

/// Drains the session queue onto the transport and keeps the peer alive
/// with pings. Frames already waiting behind the one just dequeued are
/// joined with newlines into a single write.
///
/// Ends when the queue is closed (after sending a close frame) or when a
/// write fails or times out. The transport is closed either way.
pub async fn write_pump<S>(mut sink: S, mut queue: mpsc::Receiver<Frame>, timing: SessionTiming)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ticker = time::interval_at(Instant::now() + timing.ping_period, timing.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            frame = queue.recv() => {
                let Some(frame) = frame else {
                    let close = Message::Close(None);
                    let _ = send_with_deadline(&mut sink, close, timing.write_wait).await;
                    break;
                };

                let text = Message::Text(coalesce(frame, &mut queue));
                if let Err(err) = send_with_deadline(&mut sink, text, timing.write_wait).await {
                    info!(error = %err, "websocket write failed");
                    break;
                }
            }
            _ = ticker.tick() => {
                let ping = Message::Ping(Vec::new());
                if let Err(err) = send_with_deadline(&mut sink, ping, timing.write_wait).await {
                    info!(error = %err, "websocket ping failed");
                    break;
                }
            }
        }
    }

    let _ = time::timeout(timing.write_wait, sink.close()).await;
}

fn coalesce(first: Frame, queue: &mut mpsc::Receiver<Frame>) -> String {
    let pending = queue.len();
    let mut text = String::from(&*first);

    for _ in 0..pending {
        match queue.try_recv() {
            Ok(next) => {
                text.push('\n');
                text.push_str(&next);
            }
            Err(_) => break,
        }
    }

    text
}

async fn send_with_deadline<S>(
    sink: &mut S,
    message: Message,
    write_wait: Duration,
) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match time::timeout(write_wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("write deadline exceeded".to_string()),
    }
}
