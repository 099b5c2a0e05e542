//! Signaling WebSocket gateway
//!
//! Each connection runs three tasks:
//! - the reader (this handler) consumes frames and drives the heartbeat;
//! - a dispatcher handles text frames strictly in arrival order, so a slow
//!   negotiation never delays pong or close handling;
//! - a writer drains the outbound queue and heartbeat pings into the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sfurelay_sfu::{ErrorCode, ServerMessage, SessionId, SignalSink};

use crate::heartbeat::{Beat, Heartbeat};
use crate::http::{AppState, GatewaySettings};
use crate::signaling::{ConnectionContext, SignalingRouter};

const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Out-of-band instructions for the writer task
#[derive(Debug, Clone, Copy)]
enum Control {
    Ping,
    Close,
}

/// Why the reader stopped
#[derive(Debug, Clone, Copy)]
enum CloseReason {
    ClientClosed,
    HeartbeatMissed,
    PongTimeout,
    SocketError,
    WriterGone,
}

/// WebSocket handler for `/ws`
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    upgrade(ws, state)
}

pub(crate) fn upgrade(ws: WebSocketUpgrade, state: AppState) -> Response {
    ws.max_message_size(state.gateway.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let manager = &state.manager;

    if manager.is_full() {
        manager.stats().record_rejected();
        warn!(
            sessions = manager.session_count(),
            "Rejecting WebSocket connection, server at capacity"
        );
        let reject = ServerMessage::error(ErrorCode::MaxClientsReached, "Server is at capacity");
        if let Err(e) = ws_sender.send(Message::Text(reject.to_json().into())).await {
            debug!(error = %e, "Failed to send capacity error");
        }
        if let Err(e) = ws_sender.send(Message::Close(None)).await {
            debug!(error = %e, "Failed to close rejected socket");
        }
        return;
    }
    manager.stats().record_accepted();

    let session_id = SessionId::generate();

    // Bounded outbound queue: slow clients lose messages instead of stalling broadcasts
    let (out_tx, out_rx) = mpsc::channel::<String>(state.gateway.outbound_buffer);
    let (control_tx, control_rx) = mpsc::channel::<Control>(4);
    let sink = SignalSink::new(out_tx);
    let writer = tokio::spawn(write_loop(ws_sender, out_rx, control_rx));

    sink.send(&ServerMessage::Join {
        id: session_id.clone(),
    });
    info!(session_id = %session_id, "WebSocket connection established");

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
    let cancel = CancellationToken::new();
    let dispatcher = tokio::spawn(dispatch_loop(
        Arc::clone(&state.signaling),
        ConnectionContext::new(session_id.clone(), sink.clone()),
        inbound_rx,
        cancel.clone(),
    ));

    let reason = read_loop(&mut ws_receiver, &inbound_tx, &control_tx, &state.gateway, &session_id).await;

    // Let the in-flight message finish, skip the rest
    cancel.cancel();
    drop(inbound_tx);
    let owned_ids = match dispatcher.await {
        Ok(ctx) => ctx.owned_ids(),
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Dispatcher task failed");
            vec![session_id.clone()]
        }
    };

    for id in &owned_ids {
        manager.cleanup_owned(id, &sink).await;
    }

    let _ = control_tx.send(Control::Close).await;
    drop(sink);
    let mut writer = writer;
    if tokio::time::timeout(WRITER_SHUTDOWN_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(session_id = %session_id, reason = ?reason, "WebSocket connection closed");
}

async fn read_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    inbound: &mpsc::UnboundedSender<String>,
    control: &mpsc::Sender<Control>,
    settings: &GatewaySettings,
    session_id: &SessionId,
) -> CloseReason {
    let mut heartbeat = Heartbeat::new(settings.pong_timeout);
    let mut ticker = tokio::time::interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );

    loop {
        let deadline = heartbeat.deadline();

        tokio::select! {
            _ = ticker.tick() => match heartbeat.on_tick(Instant::now()) {
                Beat::Ping => {
                    if control.send(Control::Ping).await.is_err() {
                        return CloseReason::WriterGone;
                    }
                }
                Beat::Expired => {
                    warn!(session_id = %session_id, "Heartbeat missed, terminating connection");
                    return CloseReason::HeartbeatMissed;
                }
            },
            () = sleep_until(deadline) => {
                warn!(session_id = %session_id, "Pong timeout, terminating connection");
                return CloseReason::PongTimeout;
            }
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound.send(text.as_str().to_owned());
                }
                Some(Ok(Message::Pong(_))) => heartbeat.on_pong(),
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Binary(_))) => {
                    debug!(session_id = %session_id, "Ignoring binary frame");
                }
                Some(Ok(Message::Close(_))) | None => return CloseReason::ClientClosed,
                Some(Err(e)) => {
                    debug!(session_id = %session_id, error = %e, "WebSocket error");
                    return CloseReason::SocketError;
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn dispatch_loop(
    signaling: Arc<SignalingRouter>,
    mut ctx: ConnectionContext,
    mut inbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) -> ConnectionContext {
    while let Some(text) = inbound.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        signaling.dispatch(&mut ctx, &text).await;
    }
    ctx
}

async fn write_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    mut control: mpsc::Receiver<Control>,
) {
    loop {
        let message = tokio::select! {
            biased;
            control = control.recv() => match control {
                Some(Control::Ping) => Message::Ping(Default::default()),
                Some(Control::Close) | None => break,
            },
            text = outbound.recv() => match text {
                Some(text) => Message::Text(text.into()),
                None => break,
            },
        };

        if ws_sender.send(message).await.is_err() {
            return;
        }
    }

    let _ = ws_sender.send(Message::Close(None)).await;
}
