use super::{CloseReason, ConnectionHandle, Gateway, ServerMessage};
use crate::artifacts::CostSnapshot;
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::fmt;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{Instant, MissedTickBehavior, interval_at, timeout},
};
use tracing::{debug, info, warn};

/// Why a session reached `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ClientClosed,
    ReadError,
    WriteFailed,
    RelayClosed,
    Evicted,
    Shutdown,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionEnd::ClientClosed => "client_closed",
            SessionEnd::ReadError => "read_error",
            SessionEnd::WriteFailed => "write_failed",
            SessionEnd::RelayClosed => "relay_closed",
            SessionEnd::Evicted => "evicted",
            SessionEnd::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

impl From<CloseReason> for SessionEnd {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Evicted => SessionEnd::Evicted,
            CloseReason::Shutdown => SessionEnd::Shutdown,
        }
    }
}

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

impl Gateway {
    /// Drive one upgraded connection from snapshot to close.
    ///
    /// The relay subscription is taken before the snapshot is read so no
    /// notification published in between is missed.
    pub async fn serve(self, socket: WebSocket) {
        let handle = self.registry.register().await;
        let connection_id = handle.id;
        info!(connection_id, state = "upgraded", "Gateway connection upgraded");

        let events = self.relay.subscribe();
        let snapshot: CostSnapshot = self.cache.read_artifact_or_default().await;
        let (mut sender, receiver) = socket.split();

        let initial = ServerMessage::InitialData {
            data: snapshot,
            timestamp: Utc::now().timestamp(),
        };

        let end = match self.send_json(&mut sender, &initial).await {
            Ok(()) => {
                info!(connection_id, state = "streaming", "Initial snapshot sent");
                self.stream(&mut sender, receiver, events, handle).await
            }
            Err(end) => end,
        };

        if matches!(end, SessionEnd::Evicted | SessionEnd::Shutdown) {
            let _ = timeout(self.config.write_timeout(), sender.send(Message::Close(None))).await;
        }

        self.registry.unregister(connection_id).await;
        info!(connection_id, state = "closed", reason = %end, "Gateway connection closed");
    }

    async fn stream(
        &self,
        sender: &mut WsSender,
        mut receiver: WsReceiver,
        mut events: broadcast::Receiver<String>,
        mut handle: ConnectionHandle,
    ) -> SessionEnd {
        let connection_id = handle.id;
        let period = self.config.ping_interval();
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                inbound = receiver.next() => match inbound {
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::ClientClosed,
                    // Client payloads only prove liveness
                    Some(Ok(_)) => handle.touch(),
                    Some(Err(e)) => {
                        debug!(connection_id, error = %e, "Client read failed");
                        return SessionEnd::ReadError;
                    }
                },
                event = events.recv() => match event {
                    Ok(raw) => {
                        let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
                            debug!(connection_id, "Skipping non-JSON notification");
                            continue;
                        };
                        if let Err(end) = self.send_text(sender, value.to_string()).await {
                            return end;
                        }
                        crate::metrics::record_event_forwarded();
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connection_id, skipped, "Connection lagging, notifications dropped");
                        crate::metrics::record_events_lagged(skipped);
                    }
                    Err(RecvError::Closed) => return SessionEnd::RelayClosed,
                },
                _ = ping.tick() => {
                    if let Err(end) = self.send_json(sender, &ServerMessage::Ping).await {
                        return end;
                    }
                }
                reason = &mut handle.close_rx => {
                    return match reason {
                        Ok(reason) => reason.into(),
                        Err(_) => SessionEnd::Shutdown,
                    };
                }
            }
        }
    }

    async fn send_json(
        &self,
        sender: &mut WsSender,
        message: &ServerMessage,
    ) -> Result<(), SessionEnd> {
        let text = serde_json::to_string(message).map_err(|e| {
            warn!(error = %e, "Failed to serialize gateway message");
            SessionEnd::WriteFailed
        })?;
        self.send_text(sender, text).await
    }

    async fn send_text(&self, sender: &mut WsSender, text: String) -> Result<(), SessionEnd> {
        match timeout(self.config.write_timeout(), sender.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!(error = %e, "Client write failed");
                Err(SessionEnd::WriteFailed)
            }
            Err(_) => {
                warn!("Client write timed out");
                Err(SessionEnd::WriteFailed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_close_reasons_map_to_session_end() {
        assert_eq!(SessionEnd::from(CloseReason::Evicted), SessionEnd::Evicted);
        assert_eq!(SessionEnd::from(CloseReason::Shutdown), SessionEnd::Shutdown);
        assert_eq!(SessionEnd::WriteFailed.to_string(), "write_failed");
    }
}
