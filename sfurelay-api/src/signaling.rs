//! Signaling router: inbound envelopes to manager calls

use std::sync::Arc;
use tracing::{debug, info, warn};

use sfurelay_sfu::{
    ClientMessage, ConsumerId, ErrorCode, IceCandidate, ServerMessage, SessionDescription,
    SessionId, SfuError, SfuManager, SignalSink,
};

/// Per-connection signaling state
pub struct ConnectionContext {
    /// Id handed out in `join`
    pub assigned_id: SessionId,
    /// Ids registered through this connection with `connect`, oldest first
    registered: Vec<SessionId>,
    pub sink: SignalSink,
}

impl ConnectionContext {
    #[must_use]
    pub const fn new(assigned_id: SessionId, sink: SignalSink) -> Self {
        Self {
            assigned_id,
            registered: Vec::new(),
            sink,
        }
    }

    /// Id this connection acts as: the last registered one, else the assigned one
    #[must_use]
    pub fn current_id(&self) -> &SessionId {
        self.registered.last().unwrap_or(&self.assigned_id)
    }

    fn register(&mut self, id: SessionId) {
        self.registered.retain(|known| known != &id);
        self.registered.push(id);
    }

    /// Every id to release when the connection closes
    #[must_use]
    pub fn owned_ids(&self) -> Vec<SessionId> {
        let mut ids = vec![self.assigned_id.clone()];
        ids.extend(self.registered.iter().filter(|id| **id != self.assigned_id).cloned());
        ids
    }
}

/// Dispatches client messages to the [`SfuManager`]
pub struct SignalingRouter {
    manager: Arc<SfuManager>,
}

impl SignalingRouter {
    #[must_use]
    pub const fn new(manager: Arc<SfuManager>) -> Self {
        Self { manager }
    }

    /// Handle one inbound text frame
    ///
    /// Frames that are not JSON are dropped. JSON with an unknown `type` is
    /// relayed verbatim to every other session. A known `type` with a body
    /// that does not parse is answered with that message's error code.
    pub async fn dispatch(&self, ctx: &mut ConnectionContext, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                debug!(session_id = %ctx.current_id(), error = %e, "Dropping non-JSON frame");
                return;
            }
        };

        let kind = value.get("type").and_then(serde_json::Value::as_str).map(str::to_owned);
        let message = match serde_json::from_value::<ClientMessage>(value) {
            Ok(message) => message,
            Err(e) => {
                match kind.as_deref() {
                    Some(kind) if ClientMessage::is_known_type(kind) => self.reject_malformed(ctx, kind, &e),
                    _ => {
                        debug!(session_id = %ctx.current_id(), error = %e, "Relaying unrecognized message");
                        self.manager.broadcast_text(text, Some(ctx.current_id()));
                    }
                }
                return;
            }
        };

        match message {
            ClientMessage::Connect { sdp, uqid, username } => self.handle_connect(ctx, uqid, username, sdp).await,
            ClientMessage::GetPeers { uqid } => {
                let peers = self.manager.list_peers(&uqid);
                ctx.sink.send(&ServerMessage::Peers { peers });
            }
            ClientMessage::Ice { ice, uqid } => match ice {
                Some(candidate) => self.manager.add_ice_candidate(&uqid, candidate).await,
                None => debug!(session_id = %uqid, "End of candidates"),
            },
            ClientMessage::Consume { id, consumer_id, sdp } => self.handle_consume(ctx, id, consumer_id, sdp).await,
            ClientMessage::ConsumerIce { ice, consumer_id, .. } => self.handle_consumer_ice(consumer_id, ice).await,
            ClientMessage::Disconnect { id } => {
                info!(session_id = %id, requested_by = %ctx.current_id(), "Disconnect requested");
                self.manager.cleanup_session(&id).await;
            }
        }
    }

    /// Reply to a known message whose fields do not parse. It is never relayed.
    fn reject_malformed(&self, ctx: &ConnectionContext, kind: &str, error: &serde_json::Error) {
        warn!(session_id = %ctx.current_id(), message_type = kind, error = %error, "Malformed message");
        let reply = match kind {
            "connect" => ServerMessage::error(ErrorCode::ConnectError, "Failed to establish connection"),
            "consume" => ServerMessage::error(ErrorCode::ConsumeError, "Failed to consume media"),
            _ => return,
        };
        ctx.sink.send(&reply);
    }

    async fn handle_connect(
        &self,
        ctx: &mut ConnectionContext,
        uqid: SessionId,
        username: String,
        offer: SessionDescription,
    ) {
        match self
            .manager
            .connect(uqid.clone(), username, ctx.sink.clone(), offer)
            .await
        {
            Ok(sdp) => {
                ctx.register(uqid);
                ctx.sink.send(&ServerMessage::Answer { sdp });
            }
            Err(SfuError::CapacityReached { .. }) => {
                ctx.sink.send(&ServerMessage::error(
                    ErrorCode::MaxClientsReached,
                    "Server is at capacity",
                ));
            }
            Err(e) => {
                warn!(session_id = %uqid, error = %e, "Connect failed");
                ctx.sink.send(&ServerMessage::error(
                    ErrorCode::ConnectError,
                    "Failed to establish connection",
                ));
            }
        }
    }

    async fn handle_consume(
        &self,
        ctx: &ConnectionContext,
        source: SessionId,
        consumer_id: ConsumerId,
        offer: SessionDescription,
    ) {
        match self
            .manager
            .consume(ctx.current_id(), &source, consumer_id.clone(), offer)
            .await
        {
            Ok(Some(answer)) => {
                ctx.sink.send(&ServerMessage::Consume {
                    sdp: answer.sdp,
                    username: answer.username,
                    id: source,
                    consumer_id,
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(consumer_id = %consumer_id, source = %source, error = %e, "Consume failed");
                ctx.sink.send(&ServerMessage::error(ErrorCode::ConsumeError, "Failed to consume media"));
            }
        }
    }

    async fn handle_consumer_ice(&self, consumer_id: ConsumerId, ice: Option<IceCandidate>) {
        match ice {
            Some(candidate) => self.manager.add_consumer_ice_candidate(&consumer_id, candidate).await,
            None => debug!(consumer_id = %consumer_id, "End of consumer candidates"),
        }
    }
}
