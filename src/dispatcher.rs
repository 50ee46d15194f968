//! Routes one command to one agent.
//!
//! Candidates are tried in registry-snapshot order. The first connection that
//! delivers a reply wins and the remaining candidates are never contacted. A
//! candidate whose connection closes, or that misses the reply deadline, is
//! skipped. Nothing is queued when no agent is connected.

use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
    error::DispatchError,
    protocol::{CommandDefinition, DispatchEnvelope, ResultEnvelope},
    registry::{Candidate, ConnectionRegistry, PendingDispatch},
};

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Identity of the connection that answered.
    pub identity: String,
    pub result: ResultEnvelope,
}

#[derive(Debug)]
enum AttemptFailure {
    ConnectionClosed,
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: ConnectionRegistry,
    reply_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self::with_reply_timeout(registry, DEFAULT_REPLY_TIMEOUT)
    }

    pub fn with_reply_timeout(registry: ConnectionRegistry, reply_timeout: Duration) -> Self {
        Self {
            registry,
            reply_timeout,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub async fn dispatch(
        &self,
        definition: CommandDefinition,
    ) -> Result<DispatchOutcome, DispatchError> {
        let envelope = DispatchEnvelope {
            request_id: Uuid::new_v4().to_string(),
            definition,
        };
        let candidates = self.registry.snapshot();
        if candidates.is_empty() {
            tracing::warn!(
                target = "agent_dispatch::dispatch",
                request_id = %envelope.request_id,
                "no agent connected"
            );
            return Err(DispatchError::NoAvailableAgent);
        }

        for candidate in candidates {
            match self.attempt(&candidate, envelope.clone()).await {
                Ok(result) => {
                    tracing::info!(
                        target = "agent_dispatch::dispatch",
                        request_id = %envelope.request_id,
                        identity = %candidate.identity,
                        status_code = result.status_code,
                        agent_error = !result.is_success(),
                        "dispatch answered"
                    );
                    return Ok(DispatchOutcome {
                        identity: candidate.identity,
                        result,
                    });
                }
                Err(AttemptFailure::ConnectionClosed) => {
                    tracing::warn!(
                        target = "agent_dispatch::dispatch",
                        request_id = %envelope.request_id,
                        identity = %candidate.identity,
                        "connection closed before replying, trying next agent"
                    );
                }
                Err(AttemptFailure::DeadlineExceeded) => {
                    tracing::warn!(
                        target = "agent_dispatch::dispatch",
                        request_id = %envelope.request_id,
                        identity = %candidate.identity,
                        timeout_ms = self.reply_timeout.as_millis() as u64,
                        "reply deadline exceeded, trying next agent"
                    );
                }
            }
        }

        tracing::error!(
            target = "agent_dispatch::dispatch",
            request_id = %envelope.request_id,
            "there is no ready agent for this command"
        );
        Err(DispatchError::NoAvailableAgent)
    }

    async fn attempt(
        &self,
        candidate: &Candidate,
        envelope: DispatchEnvelope,
    ) -> Result<ResultEnvelope, AttemptFailure> {
        let (reply, reply_rx) = oneshot::channel();
        let exchange = async {
            candidate
                .inbound
                .send(PendingDispatch { envelope, reply })
                .await
                .map_err(|_| AttemptFailure::ConnectionClosed)?;
            reply_rx.await.map_err(|_| AttemptFailure::ConnectionClosed)
        };

        // On expiry the reply receiver is dropped; the connection loop
        // notices and discards the late reply without closing the socket.
        tokio::time::timeout(self.reply_timeout, exchange)
            .await
            .map_err(|_| AttemptFailure::DeadlineExceeded)?
    }
}
