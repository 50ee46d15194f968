//! Broker side of one agent connection.
//!
//! The loop alternates strictly: take one command from the inbound channel,
//! write it to the socket, read back exactly one matching reply, hand it to
//! the waiting dispatcher. Any socket failure ends the loop, unregisters the
//! connection and drops every reply sender it still holds, which wakes the
//! dispatchers waiting on them.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{sync::mpsc, time::MissedTickBehavior};

use crate::{
    protocol::ResultEnvelope,
    registry::{ConnectionRegistry, PendingDispatch},
};

const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, PartialEq, Eq)]
enum RelayOutcome {
    Delivered,
    Abandoned,
    Closed,
}

pub async fn serve_connection(
    socket: WebSocket,
    identity: String,
    mut inbound: mpsc::Receiver<PendingDispatch>,
    registry: ConnectionRegistry,
) {
    let (mut sink, mut stream) = socket.split();
    let mut served = 0u64;
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping_interval.reset();

    loop {
        let pending = tokio::select! {
            pending = inbound.recv() => match pending {
                Some(pending) => pending,
                None => break,
            },
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        tracing::warn!(
                            target = "agent_dispatch::connection",
                            identity = %identity,
                            raw = %text.as_str(),
                            "discarding frame received while idle"
                        );
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(
                            target = "agent_dispatch::connection",
                            identity = %identity,
                            "agent closed the connection"
                        );
                        break;
                    }
                    Some(Err(error)) => {
                        tracing::warn!(
                            target = "agent_dispatch::connection",
                            identity = %identity,
                            error = %error,
                            "read failed while idle"
                        );
                        break;
                    }
                    Some(Ok(_)) => continue,
                }
            }
            _ = ping_interval.tick() => {
                if let Err(error) = sink.send(Message::Ping(Vec::new().into())).await {
                    tracing::warn!(
                        target = "agent_dispatch::connection",
                        identity = %identity,
                        error = %error,
                        "keep-alive ping failed"
                    );
                    break;
                }
                continue;
            }
        };

        if pending.reply.is_closed() {
            tracing::debug!(
                target = "agent_dispatch::connection",
                identity = %identity,
                request_id = %pending.envelope.request_id,
                "dispatcher gave up before the command was sent, skipping"
            );
            continue;
        }

        served += 1;
        let outcome = relay(&mut sink, &mut stream, &identity, served, pending).await;
        ping_interval.reset();
        if outcome == RelayOutcome::Closed {
            break;
        }
    }

    registry.unregister(&identity);
    let _ = sink.close().await;
    tracing::info!(
        target = "agent_dispatch::connection",
        identity = %identity,
        served,
        "connection closed"
    );
}

async fn relay(
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
    identity: &str,
    count: u64,
    pending: PendingDispatch,
) -> RelayOutcome {
    let PendingDispatch { envelope, reply } = pending;

    let frame = match serde_json::to_string(&envelope) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::error!(
                target = "agent_dispatch::connection",
                identity = %identity,
                request_id = %envelope.request_id,
                error = %error,
                "failed to encode command"
            );
            return RelayOutcome::Abandoned;
        }
    };

    tracing::info!(
        target = "agent_dispatch::connection",
        identity = %identity,
        request_id = %envelope.request_id,
        count,
        "sending command"
    );
    if let Err(error) = sink.send(Message::Text(frame.into())).await {
        tracing::warn!(
            target = "agent_dispatch::connection",
            identity = %identity,
            request_id = %envelope.request_id,
            error = %error,
            "failed to write command"
        );
        return RelayOutcome::Closed;
    }

    loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                tracing::warn!(
                    target = "agent_dispatch::connection",
                    identity = %identity,
                    request_id = %envelope.request_id,
                    "agent disconnected before replying"
                );
                return RelayOutcome::Closed;
            }
            Some(Err(error)) => {
                tracing::warn!(
                    target = "agent_dispatch::connection",
                    identity = %identity,
                    request_id = %envelope.request_id,
                    error = %error,
                    "failed to read reply"
                );
                return RelayOutcome::Closed;
            }
            Some(Ok(_)) => continue,
        };

        let result = match serde_json::from_str::<ResultEnvelope>(text.as_str()) {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(
                    target = "agent_dispatch::connection",
                    identity = %identity,
                    request_id = %envelope.request_id,
                    error = %error,
                    "failed to decode reply"
                );
                return RelayOutcome::Abandoned;
            }
        };

        if result.request_id != envelope.request_id {
            tracing::warn!(
                target = "agent_dispatch::connection",
                identity = %identity,
                expected = %envelope.request_id,
                received = %result.request_id,
                "discarding reply for a different request"
            );
            continue;
        }

        if reply.send(result).is_err() {
            tracing::warn!(
                target = "agent_dispatch::connection",
                identity = %identity,
                request_id = %envelope.request_id,
                "dispatcher stopped waiting, reply discarded"
            );
        }
        return RelayOutcome::Delivered;
    }
}
